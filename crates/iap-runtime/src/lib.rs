#![forbid(unsafe_code)]

//! Composition root.
//!
//! [`StoreRuntime`] builds the bus, catalog and reconciliation engine from a
//! [`StoreConfig`] plus injected provider and filesystem capabilities. The
//! host hands every provider callback to [`StoreRuntime::ingest`]; nothing
//! here is global.

use std::sync::Arc;

use tracing::{debug, info};

use iap_catalog::{CatalogProvider, ProductCatalog, ProviderError};
use iap_config::StoreConfig;
use iap_events::EventBus;
use iap_installer::{
    AssetInstaller, BackupExclusion, CacheDirTag, ContentCleaner, DownloadsDir, FsAssetInstaller,
    FsContentCleaner, NoBackupExclusion,
};
use iap_reconcile::{InstallContext, ReconcileEngine, StoreAdapter};
use iap_schemas::{ProductId, ProviderEvent, RequestId};

/// External collaborators the runtime is wired with.
#[derive(Clone)]
pub struct StoreCapabilities {
    pub adapter: Arc<dyn StoreAdapter>,
    pub catalog_provider: Arc<dyn CatalogProvider>,
    pub installer: Arc<dyn AssetInstaller>,
    pub cleaner: Arc<dyn ContentCleaner>,
    /// Applied to the downloads directory when `exclude_from_backup` is set.
    pub backup_exclusion: Arc<dyn BackupExclusion>,
}

impl StoreCapabilities {
    /// Provider capabilities plus the real filesystem installer, cleaner and
    /// `CACHEDIR.TAG` backup exclusion.
    pub fn with_filesystem(
        adapter: Arc<dyn StoreAdapter>,
        catalog_provider: Arc<dyn CatalogProvider>,
    ) -> Self {
        Self {
            adapter,
            catalog_provider,
            installer: Arc::new(FsAssetInstaller),
            cleaner: Arc::new(FsContentCleaner),
            backup_exclusion: Arc::new(CacheDirTag),
        }
    }
}

pub struct StoreRuntime {
    config: StoreConfig,
    bus: EventBus,
    catalog: ProductCatalog,
    engine: ReconcileEngine,
}

impl std::fmt::Debug for StoreRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRuntime")
            .field("config", &self.config)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl StoreRuntime {
    pub fn from_config(config: StoreConfig, caps: StoreCapabilities) -> Self {
        let bus = EventBus::new();

        let exclusion: Arc<dyn BackupExclusion> = if config.exclude_from_backup {
            caps.backup_exclusion
        } else {
            Arc::new(NoBackupExclusion)
        };
        let install = InstallContext {
            installer: caps.installer,
            cleaner: caps.cleaner,
            downloads_dir: DownloadsDir::new(config.downloads_dir(), exclusion),
        };

        let catalog = ProductCatalog::new(caps.catalog_provider, bus.clone());
        let engine = ReconcileEngine::new(caps.adapter, bus.clone(), install, config.fault_log_capacity);

        info!(
            support_dir = %config.support_dir.display(),
            downloads_dir = %config.downloads_dir().display(),
            products = config.product_ids.len(),
            "store runtime ready"
        );

        Self {
            config,
            bus,
            catalog,
            engine,
        }
    }

    /// Route one provider callback to the component that owns it.
    pub fn ingest(&self, event: ProviderEvent) {
        match event {
            ProviderEvent::TransactionsUpdated { transactions } => {
                self.engine.on_transactions_updated(&transactions)
            }
            ProviderEvent::DownloadsUpdated { downloads } => {
                self.engine.on_downloads_updated(&downloads)
            }
            ProviderEvent::TransactionsRemoved { transaction_ids } => {
                self.engine.on_transactions_removed(&transaction_ids)
            }
            ProviderEvent::RestoreFailed { error } => self.engine.on_restore_failed(&error),
            ProviderEvent::RestoreFinished => self.engine.on_restore_finished(),
            ProviderEvent::ProductsReceived {
                request_id,
                response,
            } => {
                self.catalog.on_response(request_id, Ok(response));
            }
            ProviderEvent::ProductsRequestFailed {
                request_id,
                message,
            } => {
                self.catalog
                    .on_response(request_id, Err(ProviderError::Transport(message)));
            }
        }
    }

    /// Fetch the product ids listed in configuration. `None` when none are
    /// configured.
    pub fn fetch_configured_catalog(&self) -> Option<RequestId> {
        if self.config.product_ids.is_empty() {
            debug!("no configured product ids; catalog fetch skipped");
            return None;
        }
        Some(self.catalog.fetch(self.config.product_ids.iter().cloned()))
    }

    pub fn submit(&self, product_id: impl Into<ProductId>) {
        self.engine.submit(product_id);
    }

    pub fn restore_all(&self) {
        self.engine.restore_all();
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn catalog(&self) -> &ProductCatalog {
        &self.catalog
    }

    pub fn engine(&self) -> &ReconcileEngine {
        &self.engine
    }
}
