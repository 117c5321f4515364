use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use iap_installer::{AssetInstaller, ContentCleaner, DownloadsDir, CONTENTS_DIR};
use iap_schemas::{
    AssetId, DownloadState, DownloadUpdate, ProductId, PurchaseNotification, PurchaseStatus,
    TransactionId,
};

use crate::{OutboundCall, Outbox, ReconcileFault, TransactionTracker};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Last known state of one asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetRecord {
    pub asset_id: AssetId,
    pub transaction_id: TransactionId,
    pub product_id: ProductId,
    pub state: DownloadState,
    pub progress: f64,
    pub staged_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl AssetRecord {
    fn waiting(asset_id: AssetId, transaction_id: TransactionId, product_id: ProductId) -> Self {
        Self {
            asset_id,
            transaction_id,
            product_id,
            state: DownloadState::Waiting,
            progress: 0.0,
            staged_path: None,
            error: None,
        }
    }
}

/// Filesystem capabilities used once an asset reaches a terminal state.
#[derive(Clone)]
pub struct InstallContext {
    pub installer: Arc<dyn AssetInstaller>,
    pub cleaner: Arc<dyn ContentCleaner>,
    pub downloads_dir: DownloadsDir,
}

impl std::fmt::Debug for InstallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallContext")
            .field("downloads_dir", &self.downloads_dir)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// DownloadTracker
// ---------------------------------------------------------------------------

/// Per-asset download state, grouped by owning transaction.
///
/// Assets are dropped once their transaction settles. Updates that arrive
/// for an acknowledged transaction are ignored, so a settled transaction can
/// never be re-opened by a late callback.
#[derive(Debug)]
pub struct DownloadTracker {
    assets: BTreeMap<AssetId, AssetRecord>,
    by_transaction: BTreeMap<TransactionId, Vec<AssetId>>,
    ctx: InstallContext,
}

impl DownloadTracker {
    pub fn new(ctx: InstallContext) -> Self {
        Self {
            assets: BTreeMap::new(),
            by_transaction: BTreeMap::new(),
            ctx,
        }
    }

    /// Track the assets of a transaction that just started awaiting downloads.
    ///
    /// Assets already known (reported before their transaction) keep their
    /// recorded state.
    pub fn register(&mut self, transaction_id: &TransactionId, product_id: &ProductId, asset_ids: &[AssetId]) {
        for asset_id in asset_ids {
            self.track(asset_id, transaction_id, product_id);
        }
    }

    /// Apply one reported asset.
    pub fn apply(&mut self, update: &DownloadUpdate, txns: &mut TransactionTracker, out: &mut Outbox) {
        let asset_id = &update.asset_id;

        if let Some(rec) = self.assets.get(asset_id) {
            if txns.is_acknowledged(&rec.transaction_id) {
                let transaction_id = rec.transaction_id.clone();
                debug!(asset_id = %asset_id, transaction_id = %transaction_id, "update for settled transaction; dropping its assets");
                self.forget(&transaction_id);
                return;
            }
            if rec.state.is_terminal() {
                debug!(asset_id = %asset_id, state = ?rec.state, reported = ?update.state, "asset already terminal; ignored");
                return;
            }
        } else {
            if txns.is_acknowledged(&update.transaction_id) {
                debug!(asset_id = %asset_id, transaction_id = %update.transaction_id, "update for settled transaction; ignored");
                return;
            }
            info!(asset_id = %asset_id, transaction_id = %update.transaction_id, "late-discovered asset registered");
            self.track(asset_id, &update.transaction_id, &update.product_id);
        }

        let Some(rec) = self.assets.get_mut(asset_id) else {
            return;
        };
        if let Some(path) = &update.staged_path {
            rec.staged_path = Some(path.clone());
        }

        match update.state {
            DownloadState::Waiting => {
                rec.state = DownloadState::Waiting;
                debug!(asset_id = %asset_id, "asset waiting; requesting transport start");
                out.call(OutboundCall::StartDownloads(vec![asset_id.clone()]));
            }
            DownloadState::Active => {
                rec.state = DownloadState::Active;
                rec.progress = update.progress;
                out.notify(
                    PurchaseNotification::new(PurchaseStatus::DownloadInProgress, rec.product_id.clone())
                        .with_progress(rec.progress),
                );
            }
            DownloadState::Paused => {
                rec.state = DownloadState::Paused;
                info!(asset_id = %asset_id, progress = rec.progress, "download paused");
                out.notify(
                    PurchaseNotification::new(PurchaseStatus::DownloadInProgress, rec.product_id.clone())
                        .with_progress(rec.progress),
                );
            }
            DownloadState::Cancelled => {
                rec.state = DownloadState::Cancelled;
                info!(asset_id = %asset_id, "download cancelled");
                let rec = rec.clone();
                self.clean(&rec);
                out.notify(
                    PurchaseNotification::new(PurchaseStatus::DownloadInProgress, rec.product_id.clone())
                        .with_progress(rec.progress),
                );
                self.evaluate(&rec.transaction_id, txns, out);
            }
            DownloadState::Failed => {
                let message = update
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("Download of {asset_id} failed."));
                rec.state = DownloadState::Failed;
                rec.error = Some(message.clone());
                warn!(asset_id = %asset_id, transaction_id = %rec.transaction_id, error = %message, "download failed");
                let rec = rec.clone();
                self.clean(&rec);
                out.fault(ReconcileFault::AssetTransportFailure {
                    asset_id: asset_id.clone(),
                    transaction_id: rec.transaction_id.clone(),
                    message: message.clone(),
                });
                out.notify(
                    PurchaseNotification::new(PurchaseStatus::DownloadFailed, rec.product_id.clone())
                        .with_message(message),
                );
                self.evaluate(&rec.transaction_id, txns, out);
            }
            DownloadState::Finished => {
                rec.state = DownloadState::Finished;
                rec.progress = 1.0;
                let rec = rec.clone();
                self.install(&rec, out);
                out.notify(
                    PurchaseNotification::new(PurchaseStatus::DownloadInProgress, rec.product_id.clone())
                        .with_progress(rec.progress),
                );
                self.evaluate(&rec.transaction_id, txns, out);
            }
        }
    }

    /// Settle `transaction_id` if every one of its assets is terminal.
    ///
    /// Returns whether this call settled it. Calling again for an already
    /// settled transaction is a no-op.
    pub fn evaluate(&mut self, transaction_id: &TransactionId, txns: &mut TransactionTracker, out: &mut Outbox) -> bool {
        let Some(ids) = self.by_transaction.get(transaction_id) else {
            return false;
        };
        let settled = ids
            .iter()
            .all(|id| self.assets.get(id).is_some_and(|a| a.state.is_terminal()));
        if !settled {
            return false;
        }
        if !txns.on_assets_settled(transaction_id, out) {
            return false;
        }
        if let Some(ids) = self.by_transaction.remove(transaction_id) {
            for id in ids {
                self.assets.remove(&id);
            }
        }
        true
    }

    /// Drop every asset of `transaction_id` without settling it, removing
    /// staged content of assets that never reached a terminal state.
    ///
    /// Used when the transaction is acknowledged for a reason other than
    /// settlement (it failed). Returns how many assets were dropped.
    pub fn forget(&mut self, transaction_id: &TransactionId) -> usize {
        let Some(ids) = self.by_transaction.remove(transaction_id) else {
            return 0;
        };
        let mut dropped = 0;
        for id in ids {
            let Some(rec) = self.assets.remove(&id) else {
                continue;
            };
            if !rec.state.is_terminal() {
                self.clean(&rec);
            }
            dropped += 1;
        }
        info!(transaction_id = %transaction_id, dropped, "assets of acknowledged transaction dropped");
        dropped
    }

    pub fn asset(&self, asset_id: &str) -> Option<&AssetRecord> {
        self.assets.get(asset_id)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    // ---------------------------------------------------------------------------
    // Internal
    // ---------------------------------------------------------------------------

    fn track(&mut self, asset_id: &AssetId, transaction_id: &TransactionId, product_id: &ProductId) {
        self.assets.entry(asset_id.clone()).or_insert_with(|| {
            AssetRecord::waiting(asset_id.clone(), transaction_id.clone(), product_id.clone())
        });
        let ids = self.by_transaction.entry(transaction_id.clone()).or_default();
        if !ids.contains(asset_id) {
            ids.push(asset_id.clone());
        }
    }

    fn clean(&self, rec: &AssetRecord) {
        let Some(path) = &rec.staged_path else {
            return;
        };
        if let Err(err) = self.ctx.cleaner.remove_staged(path) {
            warn!(asset_id = %rec.asset_id, path = %path.display(), error = %err, "staged content cleanup failed");
        }
    }

    fn install(&self, rec: &AssetRecord, out: &mut Outbox) {
        let Some(staged) = &rec.staged_path else {
            warn!(asset_id = %rec.asset_id, "finished download has no staged location");
            out.fault(ReconcileFault::InstallFailure {
                asset_id: rec.asset_id.clone(),
                file: PathBuf::new(),
                message: "no staged location".to_string(),
            });
            return;
        };

        let dest = match self.ctx.downloads_dir.ensure() {
            Ok(dest) => dest,
            Err(err) => {
                warn!(asset_id = %rec.asset_id, dir = %self.ctx.downloads_dir.path().display(), error = %err, "downloads directory unavailable");
                out.fault(ReconcileFault::InstallFailure {
                    asset_id: rec.asset_id.clone(),
                    file: self.ctx.downloads_dir.path().to_path_buf(),
                    message: err.to_string(),
                });
                return;
            }
        };

        let report = self.ctx.installer.install(&staged.join(CONTENTS_DIR), dest);
        for failure in &report.failures {
            warn!(asset_id = %rec.asset_id, file = %failure.file.display(), error = %failure.message, "file not installed");
            out.fault(ReconcileFault::InstallFailure {
                asset_id: rec.asset_id.clone(),
                file: failure.file.clone(),
                message: failure.message.clone(),
            });
        }
        info!(
            asset_id = %rec.asset_id,
            product_id = %rec.product_id,
            moved = report.moved.len(),
            failed = report.failures.len(),
            "asset installed"
        );
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::Path;
    use std::sync::Mutex;

    use crate::Applied;
    use iap_installer::{InstallReport, NoBackupExclusion};
    use iap_schemas::{TransactionState, TransactionUpdate};

    #[derive(Default)]
    struct FakeFs {
        installs: Mutex<Vec<(PathBuf, PathBuf)>>,
        cleaned: Mutex<Vec<PathBuf>>,
    }

    impl AssetInstaller for FakeFs {
        fn install(&self, source_dir: &Path, dest_dir: &Path) -> InstallReport {
            self.installs.lock().unwrap().push((source_dir.to_path_buf(), dest_dir.to_path_buf()));
            InstallReport::default()
        }
    }

    impl ContentCleaner for FakeFs {
        fn remove_staged(&self, path: &Path) -> io::Result<()> {
            self.cleaned.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        fs: Arc<FakeFs>,
        downloads: DownloadTracker,
        txns: TransactionTracker,
    }

    fn fixture(assets: &[&str]) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let fs = Arc::new(FakeFs::default());
        let ctx = InstallContext {
            installer: fs.clone(),
            cleaner: fs.clone(),
            downloads_dir: DownloadsDir::new(tmp.path().join("Downloads"), Arc::new(NoBackupExclusion)),
        };
        let mut downloads = DownloadTracker::new(ctx);
        let mut txns = TransactionTracker::new();
        let mut out = Outbox::new();
        let upd = TransactionUpdate::new("t1", "gold", TransactionState::Purchased)
            .with_assets(assets.iter().copied());
        txns.apply(&upd, &mut out).unwrap();
        downloads.register(&"t1".to_string(), &"gold".to_string(), &upd.asset_ids);
        Fixture {
            _tmp: tmp,
            fs,
            downloads,
            txns,
        }
    }

    fn dl(asset: &str, state: DownloadState) -> DownloadUpdate {
        DownloadUpdate::new(asset, "t1", "gold", state)
    }

    #[test]
    fn per_state_behavior_table() {
        struct Case {
            state: DownloadState,
            calls: usize,
            note: Option<PurchaseStatus>,
            terminal: bool,
            cleaned: usize,
            installed: usize,
        }
        let cases = [
            Case { state: DownloadState::Waiting, calls: 1, note: None, terminal: false, cleaned: 0, installed: 0 },
            Case { state: DownloadState::Active, calls: 0, note: Some(PurchaseStatus::DownloadInProgress), terminal: false, cleaned: 0, installed: 0 },
            Case { state: DownloadState::Paused, calls: 0, note: Some(PurchaseStatus::DownloadInProgress), terminal: false, cleaned: 0, installed: 0 },
            Case { state: DownloadState::Cancelled, calls: 0, note: Some(PurchaseStatus::DownloadInProgress), terminal: true, cleaned: 1, installed: 0 },
            Case { state: DownloadState::Failed, calls: 0, note: Some(PurchaseStatus::DownloadFailed), terminal: true, cleaned: 1, installed: 0 },
            Case { state: DownloadState::Finished, calls: 0, note: Some(PurchaseStatus::DownloadInProgress), terminal: true, cleaned: 0, installed: 1 },
        ];

        for c in cases {
            // Two assets so a single terminal asset never settles the transaction.
            let mut f = fixture(&["a1", "a2"]);
            let mut out = Outbox::new();
            let upd = dl("a1", c.state).with_staged_path("/staging/a1").with_progress(0.5);
            f.downloads.apply(&upd, &mut f.txns, &mut out);

            assert_eq!(out.calls.len(), c.calls, "{:?}: calls", c.state);
            assert_eq!(out.notifications.first().map(|n| n.kind), c.note, "{:?}: notification", c.state);
            assert_eq!(f.downloads.asset("a1").unwrap().state.is_terminal(), c.terminal, "{:?}", c.state);
            assert_eq!(f.fs.cleaned.lock().unwrap().len(), c.cleaned, "{:?}: cleanup", c.state);
            assert_eq!(f.fs.installs.lock().unwrap().len(), c.installed, "{:?}: install", c.state);
        }
    }

    #[test]
    fn finished_asset_installs_contents_subdirectory() {
        let mut f = fixture(&["a1"]);
        let mut out = Outbox::new();
        f.downloads
            .apply(&dl("a1", DownloadState::Finished).with_staged_path("/staging/a1"), &mut f.txns, &mut out);

        let installs = f.fs.installs.lock().unwrap();
        assert_eq!(installs[0].0, PathBuf::from("/staging/a1/Contents"));
        assert!(installs[0].1.ends_with("Downloads"));
        assert!(installs[0].1.is_dir(), "destination created on first use");
    }

    #[test]
    fn settles_only_when_all_assets_terminal() {
        let mut f = fixture(&["a1", "a2"]);
        let mut out = Outbox::new();
        f.downloads.apply(&dl("a2", DownloadState::Failed), &mut f.txns, &mut out);
        assert_eq!(out.acknowledgements(), 0);

        f.downloads.apply(&dl("a1", DownloadState::Finished).with_staged_path("/s/a1"), &mut f.txns, &mut out);
        assert_eq!(out.acknowledgements(), 1);
        assert!(f.downloads.is_empty(), "records dropped after settlement");
        assert_eq!(out.notifications.last().unwrap().kind, PurchaseStatus::DownloadSucceeded);
    }

    #[test]
    fn terminal_assets_are_sticky() {
        let mut f = fixture(&["a1", "a2"]);
        let mut out = Outbox::new();
        f.downloads.apply(&dl("a1", DownloadState::Finished).with_staged_path("/s/a1"), &mut f.txns, &mut out);
        f.downloads.apply(&dl("a1", DownloadState::Finished).with_staged_path("/s/a1"), &mut f.txns, &mut out);
        f.downloads.apply(&dl("a1", DownloadState::Failed), &mut f.txns, &mut out);
        assert_eq!(f.fs.installs.lock().unwrap().len(), 1);
        assert_eq!(f.downloads.asset("a1").unwrap().state, DownloadState::Finished);
    }

    #[test]
    fn updates_after_settlement_are_ignored() {
        let mut f = fixture(&["a1"]);
        let mut out = Outbox::new();
        f.downloads.apply(&dl("a1", DownloadState::Cancelled), &mut f.txns, &mut out);
        assert_eq!(out.acknowledgements(), 1);

        let mut out = Outbox::new();
        f.downloads.apply(&dl("a1", DownloadState::Active).with_progress(0.3), &mut f.txns, &mut out);
        assert!(out.is_empty());
        assert!(f.downloads.asset("a1").is_none());
    }

    #[test]
    fn late_discovered_asset_joins_its_transaction() {
        let mut f = fixture(&["a1"]);
        let mut out = Outbox::new();
        f.downloads.apply(&dl("a9", DownloadState::Active), &mut f.txns, &mut out);
        f.downloads.apply(&dl("a1", DownloadState::Finished).with_staged_path("/s/a1"), &mut f.txns, &mut out);
        assert_eq!(out.acknowledgements(), 0, "a9 still running");

        f.downloads.apply(&dl("a9", DownloadState::Finished).with_staged_path("/s/a9"), &mut f.txns, &mut out);
        assert_eq!(out.acknowledgements(), 1);
    }

    #[test]
    fn assets_of_failed_transaction_are_never_installed() {
        let mut f = fixture(&[]);
        let mut out = Outbox::new();
        let early = DownloadUpdate::new("a1", "t2", "gold", DownloadState::Active)
            .with_staged_path("/s/a1")
            .with_progress(0.4);
        f.downloads.apply(&early, &mut f.txns, &mut out);
        assert!(f.downloads.asset("a1").is_some());

        let applied = f
            .txns
            .apply(&TransactionUpdate::new("t2", "gold", TransactionState::Failed), &mut out)
            .unwrap();
        assert_eq!(applied, Applied::Discard);
        assert_eq!(f.downloads.forget(&"t2".to_string()), 1);
        assert!(f.downloads.is_empty());
        assert_eq!(f.fs.cleaned.lock().unwrap().len(), 1, "staged content removed");

        let mut out = Outbox::new();
        let late = DownloadUpdate::new("a1", "t2", "gold", DownloadState::Finished).with_staged_path("/s/a1");
        f.downloads.apply(&late, &mut f.txns, &mut out);
        assert!(f.fs.installs.lock().unwrap().is_empty());
        assert!(out.is_empty());
        assert!(f.downloads.is_empty());
    }

    #[test]
    fn known_asset_of_acknowledged_transaction_is_dropped_on_next_update() {
        let mut f = fixture(&[]);
        let mut out = Outbox::new();
        f.downloads.apply(
            &DownloadUpdate::new("a1", "t2", "gold", DownloadState::Active).with_staged_path("/s/a1"),
            &mut f.txns,
            &mut out,
        );
        // Transaction acknowledged without the download tracker being told.
        f.txns
            .apply(&TransactionUpdate::new("t2", "gold", TransactionState::Failed), &mut out)
            .unwrap();

        let mut out = Outbox::new();
        f.downloads.apply(
            &DownloadUpdate::new("a1", "t2", "gold", DownloadState::Finished).with_staged_path("/s/a1"),
            &mut f.txns,
            &mut out,
        );
        assert!(f.fs.installs.lock().unwrap().is_empty());
        assert!(out.notifications.is_empty());
        assert!(f.downloads.asset("a1").is_none());
    }

    #[test]
    fn failed_download_carries_provider_message() {
        let mut f = fixture(&["a1", "a2"]);
        let mut out = Outbox::new();
        f.downloads.apply(&dl("a1", DownloadState::Failed).with_error("disk full"), &mut f.txns, &mut out);
        assert_eq!(out.notifications[0].message.as_deref(), Some("disk full"));
        assert!(matches!(out.faults[0], ReconcileFault::AssetTransportFailure { .. }));
    }
}
