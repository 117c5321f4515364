use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;

use iap_schemas::{AssetId, ProductId, TransactionId};

use crate::TransitionError;

// ---------------------------------------------------------------------------
// ReconcileFault
// ---------------------------------------------------------------------------

/// A failure observed while reconciling. Recorded, never propagated.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileFault {
    /// The user backed out of a purchase or restore. Suppressed from
    /// notifications; the transaction (if any) is still acknowledged.
    UserCancelled {
        transaction_id: Option<TransactionId>,
        product_id: Option<ProductId>,
    },
    /// A purchase or restore request failed at the provider.
    TransportFailure {
        product_id: Option<ProductId>,
        message: String,
    },
    /// One asset's download failed.
    AssetTransportFailure {
        asset_id: AssetId,
        transaction_id: TransactionId,
        message: String,
    },
    /// One file of a finished asset could not be relocated.
    InstallFailure {
        asset_id: AssetId,
        file: PathBuf,
        message: String,
    },
    IllegalTransition(TransitionError),
}

impl fmt::Display for ReconcileFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserCancelled {
                transaction_id,
                product_id,
            } => write!(
                f,
                "user cancelled (transaction={} product={})",
                transaction_id.as_deref().unwrap_or("-"),
                product_id.as_deref().unwrap_or("-")
            ),
            Self::TransportFailure {
                product_id,
                message,
            } => write!(
                f,
                "provider request failed (product={}): {message}",
                product_id.as_deref().unwrap_or("-")
            ),
            Self::AssetTransportFailure {
                asset_id,
                transaction_id,
                message,
            } => write!(
                f,
                "download failed asset={asset_id} transaction={transaction_id}: {message}"
            ),
            Self::InstallFailure {
                asset_id,
                file,
                message,
            } => write!(
                f,
                "install failed asset={asset_id} file={}: {message}",
                file.display()
            ),
            Self::IllegalTransition(e) => write!(f, "{e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// FaultLog
// ---------------------------------------------------------------------------

/// Bounded in-memory fault history; the oldest entry is evicted when full.
#[derive(Debug, Clone)]
pub struct FaultLog {
    capacity: usize,
    entries: VecDeque<ReconcileFault>,
    total: u64,
}

impl FaultLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1024)),
            total: 0,
        }
    }

    pub fn push(&mut self, fault: ReconcileFault) {
        self.total += 1;
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(fault);
    }

    /// Retained faults, oldest first.
    pub fn entries(&self) -> Vec<ReconcileFault> {
        self.entries.iter().cloned().collect()
    }

    /// Faults ever recorded, including evicted ones.
    pub fn total(&self) -> u64 {
        self.total
    }
}
