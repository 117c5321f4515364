//! Shared helpers for cross-crate scenario tests.
//!
//! [`Harness`] wires a [`StoreRuntime`] to a [`PaperStore`] and the real
//! filesystem installer inside a temporary support directory, and records
//! every bus event with a [`RecordingSubscriber`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};

use iap_config::StoreConfig;
use iap_events::{EventBus, SubscriptionToken};
use iap_runtime::{StoreCapabilities, StoreRuntime};
use iap_schemas::{
    CatalogEvent, DownloadState, DownloadUpdate, FailureCode, Product, ProviderEvent,
    PurchaseNotification, PurchaseStatus, StoreEvent, StoreFailure, TransactionState,
    TransactionUpdate,
};
use iap_store_paper::PaperStore;

// ---------------------------------------------------------------------------
// RecordingSubscriber
// ---------------------------------------------------------------------------

/// Bus subscriber that keeps every event in arrival order.
#[derive(Debug, Clone)]
pub struct RecordingSubscriber {
    token: SubscriptionToken,
    events: Arc<Mutex<Vec<StoreEvent>>>,
}

impl RecordingSubscriber {
    pub fn attach(bus: &EventBus) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let token = bus.subscribe(move |ev| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(ev.clone());
            Ok(())
        });
        Self { token, events }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<StoreEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn token(&self) -> SubscriptionToken {
        self.token
    }

    pub fn events(&self) -> Vec<StoreEvent> {
        self.lock().clone()
    }

    pub fn notifications(&self) -> Vec<PurchaseNotification> {
        self.lock()
            .iter()
            .filter_map(|e| e.as_purchase().cloned())
            .collect()
    }

    pub fn kinds(&self) -> Vec<PurchaseStatus> {
        self.notifications().into_iter().map(|n| n.kind).collect()
    }

    pub fn count(&self, kind: PurchaseStatus) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    pub fn catalog_events(&self) -> Vec<CatalogEvent> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                StoreEvent::Catalog(c) => Some(c.clone()),
                StoreEvent::Purchase(_) => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn txn(id: &str, product: &str, state: TransactionState) -> TransactionUpdate {
    TransactionUpdate::new(id, product, state)
}

pub fn txn_with_assets(id: &str, product: &str, state: TransactionState, assets: &[&str]) -> TransactionUpdate {
    TransactionUpdate::new(id, product, state).with_assets(assets.iter().copied())
}

pub fn failed_txn(id: &str, product: &str, code: FailureCode, message: &str) -> TransactionUpdate {
    TransactionUpdate::new(id, product, TransactionState::Failed)
        .with_error(StoreFailure::new(code, message))
}

pub fn download(asset: &str, txn: &str, product: &str, state: DownloadState) -> DownloadUpdate {
    DownloadUpdate::new(asset, txn, product, state)
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub store: Arc<PaperStore>,
    pub runtime: StoreRuntime,
    pub events: RecordingSubscriber,
}

impl Harness {
    /// Paper store with `gold` (plain) and `levels` (downloadable) products.
    pub fn new() -> Result<Self> {
        let mut levels = Product::new("levels", "Level Pack");
        levels.downloadable = true;
        let store = PaperStore::new()
            .with_product(Product::new("gold", "Gold Coins"))
            .with_product(levels);
        Self::with_store(store)
    }

    pub fn with_store(store: PaperStore) -> Result<Self> {
        let tmp = tempfile::tempdir().context("create harness tempdir")?;
        let store = Arc::new(store);
        let config = StoreConfig::new(tmp.path().join("support"));
        let runtime = StoreRuntime::from_config(
            config,
            StoreCapabilities::with_filesystem(store.clone(), store.clone()),
        );
        let events = RecordingSubscriber::attach(runtime.bus());
        Ok(Self {
            tmp,
            store,
            runtime,
            events,
        })
    }

    pub fn transactions(&self, updates: Vec<TransactionUpdate>) {
        self.runtime.ingest(ProviderEvent::TransactionsUpdated {
            transactions: updates,
        });
    }

    pub fn downloads(&self, updates: Vec<DownloadUpdate>) {
        self.runtime
            .ingest(ProviderEvent::DownloadsUpdated { downloads: updates });
    }

    /// Create `<tmp>/staging/<asset>/Contents/` holding `files` and return
    /// the staged root the provider would report.
    pub fn stage(&self, asset: &str, files: &[(&str, &str)]) -> Result<PathBuf> {
        let root = self.tmp.path().join("staging").join(asset);
        let contents = root.join("Contents");
        fs::create_dir_all(&contents).with_context(|| format!("create {}", contents.display()))?;
        for (name, body) in files {
            fs::write(contents.join(name), body).with_context(|| format!("write {name}"))?;
        }
        Ok(root)
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.runtime.config().downloads_dir()
    }

    pub fn support_dir(&self) -> &Path {
        self.runtime.config().support_dir()
    }

    pub fn acknowledged(&self) -> Vec<String> {
        self.store.acknowledged()
    }
}
