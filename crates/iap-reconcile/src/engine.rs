use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use iap_events::EventBus;
use iap_schemas::{DownloadUpdate, ProductId, StoreFailure, TransactionId, TransactionUpdate};

use crate::{
    Applied, AssetRecord, DownloadTracker, FaultLog, InstallContext, OutboundCall, Outbox, ReconcileFault,
    StoreAdapter, TransactionSnapshot, TransactionTracker,
};

struct EngineState {
    transactions: TransactionTracker,
    downloads: DownloadTracker,
    faults: FaultLog,
}

/// Outboxes waiting to leave the engine, in mutation order.
#[derive(Default)]
struct Delivery {
    pending: VecDeque<Outbox>,
    draining: bool,
}

/// The reconciliation entry point the composition root owns.
///
/// All mutation happens under one lock. Provider calls and notifications
/// produced by a mutation are queued before that lock is released and
/// delivered after it, provider calls first, then notifications.
///
/// Delivery follows mutation order across callers. One caller drains the
/// queue at a time; a callback arriving from a subscriber or from another
/// thread while a drain is running has its effects delivered by that drain,
/// after everything queued before it, and may return before they are.
pub struct ReconcileEngine {
    adapter: Arc<dyn StoreAdapter>,
    bus: EventBus,
    state: Mutex<EngineState>,
    delivery: Mutex<Delivery>,
}

impl std::fmt::Debug for ReconcileEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileEngine")
            .field("adapter", &self.adapter.name())
            .finish_non_exhaustive()
    }
}

impl ReconcileEngine {
    pub fn new(
        adapter: Arc<dyn StoreAdapter>,
        bus: EventBus,
        install: InstallContext,
        fault_log_capacity: usize,
    ) -> Self {
        Self {
            adapter,
            bus,
            state: Mutex::new(EngineState {
                transactions: TransactionTracker::new(),
                downloads: DownloadTracker::new(install),
                faults: FaultLog::with_capacity(fault_log_capacity),
            }),
            delivery: Mutex::new(Delivery::default()),
        }
    }

    // ---------------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------------

    /// Ask the provider to purchase `product_id`. The outcome arrives later
    /// through [`on_transactions_updated`](Self::on_transactions_updated).
    pub fn submit(&self, product_id: impl Into<ProductId>) {
        let product_id = product_id.into();
        info!(product_id = %product_id, adapter = self.adapter.name(), "purchase requested");
        self.adapter.request_purchase(&product_id);
    }

    /// Clear the restored set and ask the provider to restore prior purchases.
    pub fn restore_all(&self) {
        self.lock().transactions.begin_restore();
        info!(adapter = self.adapter.name(), "restore requested");
        self.adapter.request_restore_all();
    }

    // ---------------------------------------------------------------------------
    // Provider ingestion
    // ---------------------------------------------------------------------------

    pub fn on_transactions_updated(&self, transactions: &[TransactionUpdate]) {
        let mut out = Outbox::new();
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            for update in transactions {
                match st.transactions.apply(update, &mut out) {
                    Ok(Applied::Done) => {}
                    Ok(Applied::Discard) => {
                        st.downloads.forget(&update.transaction_id);
                    }
                    Ok(Applied::AwaitDownloads {
                        product_id,
                        asset_ids,
                    }) => {
                        st.downloads
                            .register(&update.transaction_id, &product_id, &asset_ids);
                        // Assets reported before their transaction may already be terminal.
                        st.downloads
                            .evaluate(&update.transaction_id, &mut st.transactions, &mut out);
                    }
                    Err(err) => {
                        warn!(error = %err, "illegal transaction report ignored");
                        out.fault(ReconcileFault::IllegalTransition(err));
                    }
                }
            }
            self.commit(st, out);
        }
        self.drain();
    }

    pub fn on_downloads_updated(&self, downloads: &[DownloadUpdate]) {
        let mut out = Outbox::new();
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            for update in downloads {
                st.downloads.apply(update, &mut st.transactions, &mut out);
            }
            self.commit(st, out);
        }
        self.drain();
    }

    /// Logging only; the provider removed acknowledged transactions from its queue.
    pub fn on_transactions_removed(&self, transaction_ids: &[TransactionId]) {
        for id in transaction_ids {
            info!(transaction_id = %id, "transaction removed from provider queue");
        }
    }

    pub fn on_restore_failed(&self, error: &StoreFailure) {
        let mut out = Outbox::new();
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            st.transactions.on_restore_failed(error, &mut out);
            self.commit(st, out);
        }
        self.drain();
    }

    pub fn on_restore_finished(&self) {
        let restored = self.lock().transactions.restored_ids().len();
        info!(restored, "restore completed");
    }

    /// Re-run settlement for a transaction. A no-op unless every asset is
    /// terminal and the transaction has not been acknowledged yet.
    pub fn evaluate_settlement(&self, transaction_id: &TransactionId) -> bool {
        let mut out = Outbox::new();
        let settled = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let settled = st
                .downloads
                .evaluate(transaction_id, &mut st.transactions, &mut out);
            self.commit(st, out);
            settled
        };
        self.drain();
        settled
    }

    // ---------------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------------

    pub fn has_purchased_products(&self) -> bool {
        !self.lock().transactions.purchased_ids().is_empty()
    }

    pub fn has_restored_products(&self) -> bool {
        !self.lock().transactions.restored_ids().is_empty()
    }

    pub fn purchased_ids(&self) -> BTreeSet<TransactionId> {
        self.lock().transactions.purchased_ids().clone()
    }

    pub fn restored_ids(&self) -> BTreeSet<TransactionId> {
        self.lock().transactions.restored_ids().clone()
    }

    pub fn transaction(&self, transaction_id: &str) -> Option<TransactionSnapshot> {
        self.lock().transactions.snapshot(transaction_id)
    }

    /// Present while the owning transaction is unsettled.
    pub fn asset(&self, asset_id: &str) -> Option<AssetRecord> {
        self.lock().downloads.asset(asset_id).cloned()
    }

    pub fn faults(&self) -> Vec<ReconcileFault> {
        self.lock().faults.entries()
    }

    pub fn acknowledged_count(&self) -> usize {
        self.lock().transactions.acknowledged_count()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ---------------------------------------------------------------------------
    // Internal
    // ---------------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delivery(&self) -> MutexGuard<'_, Delivery> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record faults and queue the rest. Called with the state lock held.
    fn commit(&self, st: &mut EngineState, mut out: Outbox) {
        for fault in out.faults.drain(..) {
            st.faults.push(fault);
        }
        if !out.is_empty() {
            self.delivery().pending.push_back(out);
        }
    }

    fn drain(&self) {
        {
            let mut d = self.delivery();
            if d.draining {
                return;
            }
            d.draining = true;
        }
        loop {
            let next = {
                let mut d = self.delivery();
                match d.pending.pop_front() {
                    Some(out) => out,
                    None => {
                        d.draining = false;
                        return;
                    }
                }
            };
            self.deliver(next);
        }
    }

    fn deliver(&self, out: Outbox) {
        for call in out.calls {
            match call {
                OutboundCall::StartDownloads(ids) => {
                    debug!(assets = ids.len(), "requesting downloads start");
                    self.adapter.request_downloads_start(&ids);
                }
                OutboundCall::Acknowledge(id) => {
                    debug!(transaction_id = %id, "acknowledging transaction");
                    self.adapter.acknowledge_transaction(&id);
                }
            }
        }
        for notification in out.notifications {
            self.bus.publish(notification);
        }
    }
}
