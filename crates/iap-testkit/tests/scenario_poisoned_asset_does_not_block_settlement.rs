//! Scenario: a failed download or an uninstallable asset never blocks
//! settlement of its siblings or the transaction.

use std::fs;

use iap_reconcile::ReconcileFault;
use iap_schemas::{DownloadState, PurchaseStatus, TransactionState};
use iap_testkit::{download, txn_with_assets, Harness};

#[test]
fn failed_sibling_still_settles_transaction() -> anyhow::Result<()> {
    let h = Harness::new()?;
    h.transactions(vec![txn_with_assets("t1", "levels", TransactionState::Purchased, &["good", "bad"])]);

    let partial = h.stage("bad", &[("partial.bin", "xx")])?;
    h.downloads(vec![download("bad", "t1", "levels", DownloadState::Failed)
        .with_error("connection reset")
        .with_staged_path(&partial)]);
    assert!(!partial.exists(), "partial content cleaned up");

    let good = h.stage("good", &[("level.dat", "ok")])?;
    h.downloads(vec![download("good", "t1", "levels", DownloadState::Finished).with_staged_path(good)]);

    assert_eq!(h.acknowledged(), vec!["t1".to_string()]);
    assert_eq!(fs::read_to_string(h.downloads_dir().join("level.dat"))?, "ok");
    assert!(h
        .runtime
        .engine()
        .faults()
        .iter()
        .any(|f| matches!(f, ReconcileFault::AssetTransportFailure { asset_id, .. } if asset_id == "bad")));
    Ok(())
}

#[test]
fn finished_asset_with_missing_content_still_settles() -> anyhow::Result<()> {
    let h = Harness::new()?;
    h.transactions(vec![txn_with_assets("t1", "levels", TransactionState::Purchased, &["a1"])]);

    // Staged location without a Contents directory: the install fails.
    let missing = h.tmp.path().join("staging").join("vanished");
    h.downloads(vec![download("a1", "t1", "levels", DownloadState::Finished).with_staged_path(missing)]);

    assert_eq!(h.acknowledged(), vec!["t1".to_string()]);
    assert_eq!(h.events.count(PurchaseStatus::DownloadSucceeded), 1);
    assert!(h
        .runtime
        .engine()
        .faults()
        .iter()
        .any(|f| matches!(f, ReconcileFault::InstallFailure { .. })));
    Ok(())
}

#[test]
fn existing_destination_files_are_replaced() -> anyhow::Result<()> {
    let h = Harness::new()?;
    fs::create_dir_all(h.downloads_dir())?;
    fs::write(h.downloads_dir().join("level.dat"), "old")?;

    h.transactions(vec![txn_with_assets("t1", "levels", TransactionState::Purchased, &["a1"])]);
    let staged = h.stage("a1", &[("level.dat", "new"), ("extra.dat", "x")])?;
    h.downloads(vec![download("a1", "t1", "levels", DownloadState::Finished).with_staged_path(staged)]);

    assert_eq!(fs::read_to_string(h.downloads_dir().join("level.dat"))?, "new");
    assert!(h.downloads_dir().join("extra.dat").is_file());
    assert!(h.runtime.engine().faults().is_empty());
    Ok(())
}
