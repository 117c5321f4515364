use iap_schemas::{AssetId, PurchaseNotification, TransactionId};

use crate::ReconcileFault;

/// A provider call decided under the engine lock, executed after release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCall {
    StartDownloads(Vec<AssetId>),
    Acknowledge(TransactionId),
}

/// Side effects produced by one tracker mutation.
///
/// Trackers only append; the owner drains it once the mutation is complete.
#[derive(Debug, Default)]
pub struct Outbox {
    pub calls: Vec<OutboundCall>,
    pub notifications: Vec<PurchaseNotification>,
    pub faults: Vec<ReconcileFault>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty() && self.notifications.is_empty() && self.faults.is_empty()
    }

    pub(crate) fn call(&mut self, call: OutboundCall) {
        self.calls.push(call);
    }

    pub(crate) fn notify(&mut self, notification: PurchaseNotification) {
        self.notifications.push(notification);
    }

    pub(crate) fn fault(&mut self, fault: ReconcileFault) {
        self.faults.push(fault);
    }

    /// Number of acknowledgements queued so far.
    pub fn acknowledgements(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, OutboundCall::Acknowledge(_)))
            .count()
    }
}
