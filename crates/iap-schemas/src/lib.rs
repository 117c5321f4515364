//! iap-schemas
//!
//! Shared data model for the purchase reconciliation workspace: what the
//! commerce provider reports, what the catalog returns, and what subscribers
//! are told.
//!
//! Pure types. No IO. Everything is serde-capable so a provider callback
//! stream can be recorded to JSON and replayed deterministically.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Provider-assigned transaction identifier (unique per transaction).
pub type TransactionId = String;
/// Provider-assigned identifier of one downloadable content unit.
pub type AssetId = String;
/// Catalog product identifier (e.g. `"com.example.levelpack1"`).
pub type ProductId = String;

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// How a transaction came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOrigin {
    Purchase,
    Restore,
}

/// Transaction lifecycle state, as reported by the provider and as tracked
/// locally. `Finished` is never reported by the provider; it is the local
/// state of an acknowledged, fully settled transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Purchasing,
    Deferred,
    Purchased,
    Restored,
    Failed,
    Finished,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchasing => "purchasing",
            Self::Deferred => "deferred",
            Self::Purchased => "purchased",
            Self::Restored => "restored",
            Self::Failed => "failed",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider failure codes. Only `PaymentCancelled` changes reconciliation
/// behaviour; the rest are carried through for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// The user dismissed the payment sheet.
    PaymentCancelled,
    ClientInvalid,
    PaymentInvalid,
    PaymentNotAllowed,
    ProductNotAvailable,
    NetworkFailure,
    Unknown,
}

/// Error detail attached to a failed transaction or a failed restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFailure {
    pub code: FailureCode,
    pub message: String,
}

impl StoreFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn user_cancelled() -> Self {
        Self::new(FailureCode::PaymentCancelled, "payment cancelled by user")
    }

    pub fn is_user_cancelled(&self) -> bool {
        self.code == FailureCode::PaymentCancelled
    }
}

impl fmt::Display for StoreFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// One transaction as reported by a provider queue callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionUpdate {
    pub transaction_id: TransactionId,
    pub product_id: ProductId,
    pub state: TransactionState,
    /// Hosted content attached to the transaction. Empty for plain products.
    #[serde(default)]
    pub asset_ids: Vec<AssetId>,
    #[serde(default)]
    pub error: Option<StoreFailure>,
}

impl TransactionUpdate {
    pub fn new(
        transaction_id: impl Into<TransactionId>,
        product_id: impl Into<ProductId>,
        state: TransactionState,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            product_id: product_id.into(),
            state,
            asset_ids: Vec::new(),
            error: None,
        }
    }

    pub fn with_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AssetId>,
    {
        self.asset_ids = assets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_error(mut self, error: StoreFailure) -> Self {
        self.error = Some(error);
        self
    }
}

// ---------------------------------------------------------------------------
// Downloads
// ---------------------------------------------------------------------------

/// Per-asset download state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Waiting,
    Active,
    Paused,
    Cancelled,
    Failed,
    Finished,
}

impl DownloadState {
    /// `Cancelled`, `Failed` and `Finished` end an asset's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Finished)
    }
}

/// One asset as reported by a provider download callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadUpdate {
    pub asset_id: AssetId,
    pub transaction_id: TransactionId,
    pub product_id: ProductId,
    pub state: DownloadState,
    /// Fraction complete, 0.0 to 1.0.
    #[serde(default)]
    pub progress: f64,
    /// Where the provider staged the content. Set once `Finished`; may also
    /// point at partial content for `Cancelled`/`Failed`.
    #[serde(default)]
    pub staged_path: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DownloadUpdate {
    pub fn new(
        asset_id: impl Into<AssetId>,
        transaction_id: impl Into<TransactionId>,
        product_id: impl Into<ProductId>,
        state: DownloadState,
    ) -> Self {
        Self {
            asset_id: asset_id.into(),
            transaction_id: transaction_id.into(),
            product_id: product_id.into(),
            state,
            progress: 0.0,
            staged_path: None,
            error: None,
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_staged_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.staged_path = Some(path.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// A sellable product as described by the catalog service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: ProductId,
    pub title: String,
    /// True when the product carries hosted content.
    #[serde(default)]
    pub downloadable: bool,
}

impl Product {
    pub fn new(product_id: impl Into<ProductId>, title: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            title: title.into(),
            downloadable: false,
        }
    }
}

/// Raw catalog answer: products the service recognised plus the identifiers
/// it did not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogResponse {
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub invalid_identifiers: Vec<ProductId>,
}

/// Identity of one catalog request. Used to drop superseded responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Status carried by a purchase-channel notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    PurchaseFailed,
    PurchaseSucceeded,
    RestoredFailed,
    RestoredSucceeded,
    DownloadStarted,
    DownloadInProgress,
    DownloadFailed,
    DownloadSucceeded,
}

/// Payload delivered to subscribers for every transaction/download state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseNotification {
    pub kind: PurchaseStatus,
    pub product_id: ProductId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 0 to 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f64>,
}

impl PurchaseNotification {
    pub fn new(kind: PurchaseStatus, product_id: impl Into<ProductId>) -> Self {
        Self {
            kind,
            product_id: product_id.into(),
            message: None,
            progress_percent: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach progress given as a 0.0..=1.0 fraction; stored as a percentage.
    pub fn with_progress(mut self, fraction: f64) -> Self {
        let fraction = if fraction.is_finite() { fraction } else { 0.0 };
        self.progress_percent = Some((fraction * 100.0).clamp(0.0, 100.0));
        self
    }
}

/// Catalog-channel notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CatalogEvent {
    ProductRequestResponse {
        request_id: RequestId,
        valid_count: usize,
        invalid_count: usize,
    },
    RequestFailed {
        request_id: RequestId,
        message: String,
    },
}

/// Everything published on the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "event", rename_all = "snake_case")]
pub enum StoreEvent {
    Catalog(CatalogEvent),
    Purchase(PurchaseNotification),
}

impl From<CatalogEvent> for StoreEvent {
    fn from(e: CatalogEvent) -> Self {
        Self::Catalog(e)
    }
}

impl From<PurchaseNotification> for StoreEvent {
    fn from(n: PurchaseNotification) -> Self {
        Self::Purchase(n)
    }
}

impl StoreEvent {
    /// The purchase notification, if this is one.
    pub fn as_purchase(&self) -> Option<&PurchaseNotification> {
        match self {
            Self::Purchase(n) => Some(n),
            Self::Catalog(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound provider callbacks
// ---------------------------------------------------------------------------

/// Every callback the commerce provider can deliver, as one enum so a stream
/// of them can be recorded and replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    TransactionsUpdated {
        transactions: Vec<TransactionUpdate>,
    },
    DownloadsUpdated {
        downloads: Vec<DownloadUpdate>,
    },
    TransactionsRemoved {
        transaction_ids: Vec<TransactionId>,
    },
    RestoreFailed {
        error: StoreFailure,
    },
    RestoreFinished,
    ProductsReceived {
        request_id: RequestId,
        response: CatalogResponse,
    },
    ProductsRequestFailed {
        request_id: RequestId,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(DownloadState::Cancelled.is_terminal());
        assert!(DownloadState::Failed.is_terminal());
        assert!(DownloadState::Finished.is_terminal());
        assert!(!DownloadState::Paused.is_terminal());
        assert!(!DownloadState::Waiting.is_terminal());
    }

    #[test]
    fn progress_is_clamped_to_percent() {
        let n = PurchaseNotification::new(PurchaseStatus::DownloadInProgress, "p").with_progress(0.42);
        assert_eq!(n.progress_percent, Some(42.0));

        let n = PurchaseNotification::new(PurchaseStatus::DownloadInProgress, "p").with_progress(1.7);
        assert_eq!(n.progress_percent, Some(100.0));

        let n =
            PurchaseNotification::new(PurchaseStatus::DownloadInProgress, "p").with_progress(f64::NAN);
        assert_eq!(n.progress_percent, Some(0.0));
    }

    #[test]
    fn provider_event_decodes_from_script_json() {
        let raw = r#"{
            "type": "transactions_updated",
            "transactions": [
                {"transaction_id": "t1", "product_id": "gold", "state": "purchased"}
            ]
        }"#;
        let ev: ProviderEvent = serde_json::from_str(raw).unwrap();
        match ev {
            ProviderEvent::TransactionsUpdated { transactions } => {
                assert_eq!(transactions.len(), 1);
                assert_eq!(transactions[0].state, TransactionState::Purchased);
                assert!(transactions[0].asset_ids.is_empty());
                assert!(transactions[0].error.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unit_variant_decodes() {
        let ev: ProviderEvent = serde_json::from_str(r#"{"type":"restore_finished"}"#).unwrap();
        assert_eq!(ev, ProviderEvent::RestoreFinished);
    }

    #[test]
    fn user_cancel_is_detected() {
        assert!(StoreFailure::user_cancelled().is_user_cancelled());
        assert!(!StoreFailure::new(FailureCode::NetworkFailure, "offline").is_user_cancelled());
    }
}
