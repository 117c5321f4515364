//! Transaction state machine.
//!
//! ```text
//!   new ──► purchasing ⇄ deferred
//!    │          │
//!    └──────────┴──► purchased | restored ──┬─► finished (ack)          no assets
//!                │                           └─► awaiting downloads ──► finished (ack)
//!                └──► failed (ack)
//! ```
//!
//! Every reported state is matched against the current phase in one table
//! ([`TransactionTracker::apply`]). Reports for acknowledged transactions are
//! provider redeliveries and are ignored; anything else the table does not
//! name is a [`TransitionError`], logged and recorded as a fault.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use iap_schemas::{
    AssetId, ProductId, PurchaseNotification, PurchaseStatus, StoreFailure, TransactionId,
    TransactionOrigin, TransactionState, TransactionUpdate,
};

use crate::{OutboundCall, Outbox, ReconcileFault};

// ---------------------------------------------------------------------------
// TransitionError
// ---------------------------------------------------------------------------

/// A provider report that cannot legally follow the transaction's current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub transaction_id: TransactionId,
    pub from: TransactionState,
    pub reported: TransactionState,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "illegal transaction transition: {} {} + {}",
            self.transaction_id, self.from, self.reported
        )
    }
}

impl std::error::Error for TransitionError {}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// `purchasing` or `deferred`; nothing decided yet.
    InFlight,
    AwaitingDownloads,
    /// Acknowledged after success.
    Finished,
    /// Acknowledged after failure.
    FailedAcknowledged,
}

#[derive(Debug, Clone)]
struct TxnRecord {
    product_id: ProductId,
    origin: TransactionOrigin,
    state: TransactionState,
    phase: Phase,
    asset_ids: Vec<AssetId>,
    error: Option<StoreFailure>,
}

/// Read-only view of one tracked transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionSnapshot {
    pub transaction_id: TransactionId,
    pub product_id: ProductId,
    pub origin: TransactionOrigin,
    pub state: TransactionState,
    pub awaiting_downloads: bool,
    pub acknowledged: bool,
    pub asset_ids: Vec<AssetId>,
    pub error: Option<StoreFailure>,
}

/// What the caller must do after a successful [`TransactionTracker::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// No follow-up.
    Done,
    /// The transaction now waits on these assets; register them with the
    /// download tracker.
    AwaitDownloads {
        product_id: ProductId,
        asset_ids: Vec<AssetId>,
    },
    /// The transaction failed and was acknowledged; drop any assets reported
    /// for it ahead of the transaction itself.
    Discard,
}

// ---------------------------------------------------------------------------
// TransactionTracker
// ---------------------------------------------------------------------------

/// Records are kept after acknowledgement so a provider redelivery of an
/// acknowledged transaction is recognised and ignored rather than processed
/// as new. They live as long as the engine.
#[derive(Debug, Default)]
pub struct TransactionTracker {
    records: BTreeMap<TransactionId, TxnRecord>,
    purchased: BTreeSet<TransactionId>,
    restored: BTreeSet<TransactionId>,
    acknowledged: usize,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one reported transaction.
    pub fn apply(
        &mut self,
        update: &TransactionUpdate,
        out: &mut Outbox,
    ) -> Result<Applied, TransitionError> {
        use TransactionState::*;

        let id = &update.transaction_id;
        let phase = self.records.get(id).map(|r| r.phase);

        match (phase, update.state) {
            // ------------------------------------------------------------------
            // Redelivery of something already acknowledged.
            // ------------------------------------------------------------------
            (Some(Phase::Finished | Phase::FailedAcknowledged), reported) => {
                debug!(transaction_id = %id, reported = %reported, "acknowledged transaction redelivered; ignored");
                Ok(Applied::Done)
            }

            // ------------------------------------------------------------------
            // Observational states.
            // ------------------------------------------------------------------
            (None | Some(Phase::InFlight), Purchasing | Deferred) => {
                if update.state == Deferred {
                    info!(transaction_id = %id, product_id = %update.product_id, "transaction deferred");
                } else {
                    debug!(transaction_id = %id, product_id = %update.product_id, "transaction purchasing");
                }
                let rec = self.upsert(update, TransactionOrigin::Purchase);
                rec.state = update.state;
                Ok(Applied::Done)
            }

            // ------------------------------------------------------------------
            // Success.
            // ------------------------------------------------------------------
            (None | Some(Phase::InFlight), Purchased | Restored) => {
                Ok(self.complete(update, out))
            }

            // Duplicate success while downloads run: no second download request.
            (Some(Phase::AwaitingDownloads), Purchased | Restored) => {
                debug!(transaction_id = %id, "transaction already awaiting downloads; ignored");
                Ok(Applied::Done)
            }

            // ------------------------------------------------------------------
            // Failure.
            // ------------------------------------------------------------------
            (None | Some(Phase::InFlight), Failed) => {
                self.fail(update, out);
                Ok(Applied::Discard)
            }

            // ------------------------------------------------------------------
            // Everything else is illegal.
            // ------------------------------------------------------------------
            (_, reported) => Err(TransitionError {
                transaction_id: id.clone(),
                from: self.records.get(id).map_or(Purchasing, |r| r.state),
                reported,
            }),
        }
    }

    /// All assets of `transaction_id` reached a terminal state.
    ///
    /// Acknowledges and notifies once; returns `false` (and does nothing) when
    /// the transaction is not awaiting downloads, including when it was
    /// already settled.
    pub fn on_assets_settled(&mut self, transaction_id: &TransactionId, out: &mut Outbox) -> bool {
        let Some(rec) = self.records.get_mut(transaction_id) else {
            debug!(transaction_id = %transaction_id, "settlement for unknown transaction; ignored");
            return false;
        };
        if rec.phase != Phase::AwaitingDownloads {
            debug!(transaction_id = %transaction_id, "settlement for transaction not awaiting downloads; ignored");
            return false;
        }

        rec.phase = Phase::Finished;
        rec.state = TransactionState::Finished;
        let product_id = rec.product_id.clone();
        self.acknowledge(transaction_id, out);

        info!(transaction_id = %transaction_id, product_id = %product_id, "downloads settled");
        out.notify(PurchaseNotification::new(
            PurchaseStatus::DownloadSucceeded,
            product_id.clone(),
        ));
        if self.restored.contains(transaction_id) {
            out.notify(PurchaseNotification::new(
                PurchaseStatus::RestoredSucceeded,
                product_id,
            ));
        }
        true
    }

    /// Forget the restored set ahead of a restore-all request.
    pub fn begin_restore(&mut self) {
        debug!(previous = self.restored.len(), "restored set cleared");
        self.restored.clear();
    }

    /// Provider-level restore failure.
    pub fn on_restore_failed(&mut self, error: &StoreFailure, out: &mut Outbox) {
        if error.is_user_cancelled() {
            info!("restore cancelled by user");
            out.fault(ReconcileFault::UserCancelled {
                transaction_id: None,
                product_id: None,
            });
            return;
        }
        warn!(error = %error, "restore failed");
        out.fault(ReconcileFault::TransportFailure {
            product_id: None,
            message: error.message.clone(),
        });
        out.notify(
            PurchaseNotification::new(PurchaseStatus::RestoredFailed, ProductId::new())
                .with_message(error.message.clone()),
        );
    }

    pub fn is_acknowledged(&self, transaction_id: &str) -> bool {
        self.records
            .get(transaction_id)
            .is_some_and(|r| matches!(r.phase, Phase::Finished | Phase::FailedAcknowledged))
    }

    pub fn snapshot(&self, transaction_id: &str) -> Option<TransactionSnapshot> {
        self.records.get(transaction_id).map(|r| TransactionSnapshot {
            transaction_id: transaction_id.to_string(),
            product_id: r.product_id.clone(),
            origin: r.origin,
            state: r.state,
            awaiting_downloads: r.phase == Phase::AwaitingDownloads,
            acknowledged: matches!(r.phase, Phase::Finished | Phase::FailedAcknowledged),
            asset_ids: r.asset_ids.clone(),
            error: r.error.clone(),
        })
    }

    pub fn purchased_ids(&self) -> &BTreeSet<TransactionId> {
        &self.purchased
    }

    pub fn restored_ids(&self) -> &BTreeSet<TransactionId> {
        &self.restored
    }

    pub fn acknowledged_count(&self) -> usize {
        self.acknowledged
    }

    // ---------------------------------------------------------------------------
    // Internal
    // ---------------------------------------------------------------------------

    fn upsert(&mut self, update: &TransactionUpdate, origin: TransactionOrigin) -> &mut TxnRecord {
        let rec = self
            .records
            .entry(update.transaction_id.clone())
            .or_insert_with(|| TxnRecord {
                product_id: update.product_id.clone(),
                origin,
                state: update.state,
                phase: Phase::InFlight,
                asset_ids: Vec::new(),
                error: None,
            });
        rec.origin = origin;
        rec
    }

    fn complete(&mut self, update: &TransactionUpdate, out: &mut Outbox) -> Applied {
        let id = update.transaction_id.clone();
        let (origin, kind) = match update.state {
            TransactionState::Restored => {
                self.purchased.remove(&id);
                self.restored.insert(id.clone());
                (TransactionOrigin::Restore, PurchaseStatus::RestoredSucceeded)
            }
            _ => {
                self.restored.remove(&id);
                self.purchased.insert(id.clone());
                (TransactionOrigin::Purchase, PurchaseStatus::PurchaseSucceeded)
            }
        };

        let rec = self.upsert(update, origin);
        rec.state = update.state;
        rec.asset_ids = update.asset_ids.clone();

        if update.asset_ids.is_empty() {
            rec.phase = Phase::Finished;
            rec.state = TransactionState::Finished;
            self.acknowledge(&id, out);
            info!(transaction_id = %id, product_id = %update.product_id, origin = ?origin, "transaction finished");
            out.notify(PurchaseNotification::new(kind, update.product_id.clone()));
            return Applied::Done;
        }

        rec.phase = Phase::AwaitingDownloads;
        info!(
            transaction_id = %id,
            product_id = %update.product_id,
            assets = update.asset_ids.len(),
            "transaction awaiting downloads"
        );
        out.notify(PurchaseNotification::new(
            PurchaseStatus::DownloadStarted,
            update.product_id.clone(),
        ));
        out.call(OutboundCall::StartDownloads(update.asset_ids.clone()));
        Applied::AwaitDownloads {
            product_id: update.product_id.clone(),
            asset_ids: update.asset_ids.clone(),
        }
    }

    fn fail(&mut self, update: &TransactionUpdate, out: &mut Outbox) {
        let id = update.transaction_id.clone();
        let rec = self.upsert(update, TransactionOrigin::Purchase);
        rec.state = TransactionState::Failed;
        rec.phase = Phase::FailedAcknowledged;
        rec.error = update.error.clone();

        let cancelled = update.error.as_ref().is_some_and(StoreFailure::is_user_cancelled);
        if cancelled {
            info!(transaction_id = %id, product_id = %update.product_id, "purchase cancelled by user");
            out.fault(ReconcileFault::UserCancelled {
                transaction_id: Some(id.clone()),
                product_id: Some(update.product_id.clone()),
            });
        } else {
            let detail = update
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unspecified".to_string());
            warn!(transaction_id = %id, product_id = %update.product_id, error = %detail, "purchase failed");
            out.fault(ReconcileFault::TransportFailure {
                product_id: Some(update.product_id.clone()),
                message: detail,
            });
            out.notify(
                PurchaseNotification::new(PurchaseStatus::PurchaseFailed, update.product_id.clone())
                    .with_message(format!("Purchase of {} failed.", update.product_id)),
            );
        }
        self.acknowledge(&id, out);
    }

    fn acknowledge(&mut self, transaction_id: &TransactionId, out: &mut Outbox) {
        self.acknowledged += 1;
        out.call(OutboundCall::Acknowledge(transaction_id.clone()));
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use iap_schemas::FailureCode;
    use iap_schemas::TransactionState::*;

    fn upd(state: TransactionState) -> TransactionUpdate {
        TransactionUpdate::new("t1", "gold", state)
    }

    fn kinds(out: &Outbox) -> Vec<PurchaseStatus> {
        out.notifications.iter().map(|n| n.kind).collect()
    }

    /// Drive the tracker through `prior` reports, then apply `reported`.
    fn run(prior: &[TransactionUpdate], reported: TransactionUpdate) -> (TransactionTracker, Outbox, Result<Applied, TransitionError>) {
        let mut t = TransactionTracker::new();
        let mut scratch = Outbox::new();
        for u in prior {
            t.apply(u, &mut scratch).unwrap();
        }
        let mut out = Outbox::new();
        let res = t.apply(&reported, &mut out);
        (t, out, res)
    }

    #[test]
    fn transition_table() {
        struct Case {
            name: &'static str,
            prior: Vec<TransactionUpdate>,
            reported: TransactionUpdate,
            legal: bool,
            acks: usize,
            notes: Vec<PurchaseStatus>,
        }

        let with_asset = |s| upd(s).with_assets(["a1"]);
        let cases = vec![
            Case { name: "new+purchasing", prior: vec![], reported: upd(Purchasing), legal: true, acks: 0, notes: vec![] },
            Case { name: "new+deferred", prior: vec![], reported: upd(Deferred), legal: true, acks: 0, notes: vec![] },
            Case { name: "deferred+purchasing", prior: vec![upd(Deferred)], reported: upd(Purchasing), legal: true, acks: 0, notes: vec![] },
            Case { name: "purchasing+purchased", prior: vec![upd(Purchasing)], reported: upd(Purchased), legal: true, acks: 1, notes: vec![PurchaseStatus::PurchaseSucceeded] },
            Case { name: "new+restored", prior: vec![], reported: upd(Restored), legal: true, acks: 1, notes: vec![PurchaseStatus::RestoredSucceeded] },
            Case { name: "purchasing+purchased with assets", prior: vec![upd(Purchasing)], reported: with_asset(Purchased), legal: true, acks: 0, notes: vec![PurchaseStatus::DownloadStarted] },
            Case { name: "awaiting+purchased", prior: vec![with_asset(Purchased)], reported: with_asset(Purchased), legal: true, acks: 0, notes: vec![] },
            Case { name: "awaiting+restored", prior: vec![with_asset(Purchased)], reported: with_asset(Restored), legal: true, acks: 0, notes: vec![] },
            Case { name: "purchasing+failed", prior: vec![upd(Purchasing)], reported: upd(Failed), legal: true, acks: 1, notes: vec![PurchaseStatus::PurchaseFailed] },
            Case { name: "finished+purchased", prior: vec![upd(Purchased)], reported: upd(Purchased), legal: true, acks: 0, notes: vec![] },
            Case { name: "failed+failed", prior: vec![upd(Failed)], reported: upd(Failed), legal: true, acks: 0, notes: vec![] },
            Case { name: "new+finished", prior: vec![], reported: upd(Finished), legal: false, acks: 0, notes: vec![] },
            Case { name: "awaiting+purchasing", prior: vec![with_asset(Purchased)], reported: upd(Purchasing), legal: false, acks: 0, notes: vec![] },
            Case { name: "awaiting+failed", prior: vec![with_asset(Purchased)], reported: upd(Failed), legal: false, acks: 0, notes: vec![] },
        ];

        for c in cases {
            let (_, out, res) = run(&c.prior, c.reported);
            assert_eq!(res.is_ok(), c.legal, "{}: legality", c.name);
            assert_eq!(out.acknowledgements(), c.acks, "{}: acks", c.name);
            assert_eq!(kinds(&out), c.notes, "{}: notifications", c.name);
        }
    }

    #[test]
    fn failure_asks_caller_to_discard_assets() {
        let (t, _, res) = run(&[upd(Purchasing)], upd(Failed));
        assert_eq!(res, Ok(Applied::Discard));
        assert!(t.is_acknowledged("t1"));

        let (_, _, res) = run(&[], upd(Failed).with_error(StoreFailure::user_cancelled()));
        assert_eq!(res, Ok(Applied::Discard));
    }

    #[test]
    fn illegal_report_names_current_state() {
        let (_, _, res) = run(&[upd(Purchasing).with_assets(["a1"]), upd(Purchased).with_assets(["a1"])], upd(Deferred));
        let err = res.unwrap_err();
        assert_eq!(err.from, Purchased);
        assert_eq!(err.reported, Deferred);
        assert!(err.to_string().contains("t1"));
    }

    #[test]
    fn user_cancelled_failure_is_silent_but_acknowledged() {
        let mut t = TransactionTracker::new();
        let mut out = Outbox::new();
        t.apply(&upd(Failed).with_error(StoreFailure::user_cancelled()), &mut out).unwrap();
        assert!(out.notifications.is_empty());
        assert_eq!(out.acknowledgements(), 1);
        assert!(matches!(out.faults[0], ReconcileFault::UserCancelled { .. }));
    }

    #[test]
    fn failure_message_names_product() {
        let mut t = TransactionTracker::new();
        let mut out = Outbox::new();
        let err = StoreFailure::new(FailureCode::PaymentInvalid, "card declined");
        t.apply(&upd(Failed).with_error(err), &mut out).unwrap();
        assert_eq!(out.notifications[0].message.as_deref(), Some("Purchase of gold failed."));
        assert_eq!(t.snapshot("t1").unwrap().state, Failed);
    }

    #[test]
    fn purchased_and_restored_sets_are_disjoint() {
        let mut t = TransactionTracker::new();
        let mut out = Outbox::new();
        t.apply(&upd(Purchased).with_assets(["a1"]), &mut out).unwrap();
        assert!(t.purchased_ids().contains("t1"));

        // A fresh tracker view of the same id arriving as restored moves sets.
        let mut t2 = TransactionTracker::new();
        t2.apply(&upd(Purchased).with_assets(["a1"]), &mut out).unwrap();
        t2.records.get_mut("t1").unwrap().phase = Phase::InFlight;
        t2.apply(&upd(Restored).with_assets(["a1"]), &mut out).unwrap();
        assert!(t2.restored_ids().contains("t1"));
        assert!(!t2.purchased_ids().contains("t1"));
    }

    #[test]
    fn settlement_is_idempotent() {
        let mut t = TransactionTracker::new();
        let mut out = Outbox::new();
        t.apply(&upd(Restored).with_assets(["a1", "a2"]), &mut out).unwrap();

        let mut out = Outbox::new();
        assert!(t.on_assets_settled(&"t1".to_string(), &mut out));
        assert!(!t.on_assets_settled(&"t1".to_string(), &mut out));
        assert_eq!(out.acknowledgements(), 1);
        assert_eq!(
            kinds(&out),
            vec![PurchaseStatus::DownloadSucceeded, PurchaseStatus::RestoredSucceeded]
        );
        assert_eq!(t.acknowledged_count(), 1);
    }

    #[test]
    fn restore_all_clears_restored_set_so_settlement_is_plain() {
        let mut t = TransactionTracker::new();
        let mut out = Outbox::new();
        t.apply(&upd(Restored).with_assets(["a1"]), &mut out).unwrap();
        t.begin_restore();

        let mut out = Outbox::new();
        t.on_assets_settled(&"t1".to_string(), &mut out);
        assert_eq!(kinds(&out), vec![PurchaseStatus::DownloadSucceeded]);
    }

    #[test]
    fn restore_failure_suppressed_only_for_user_cancel() {
        let mut t = TransactionTracker::new();
        let mut out = Outbox::new();
        t.on_restore_failed(&StoreFailure::user_cancelled(), &mut out);
        assert!(out.notifications.is_empty());

        t.on_restore_failed(&StoreFailure::new(FailureCode::NetworkFailure, "offline"), &mut out);
        assert_eq!(kinds(&out), vec![PurchaseStatus::RestoredFailed]);
        assert_eq!(out.notifications[0].message.as_deref(), Some("offline"));
    }
}
