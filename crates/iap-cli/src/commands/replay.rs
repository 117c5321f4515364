//! `iap replay`: feed a recorded provider callback stream through a
//! [`StoreRuntime`] wired to the paper store.
//!
//! Script format (JSON):
//!
//! ```json
//! {
//!   "products": [{"product_id": "gold", "title": "Gold Coins"}],
//!   "steps": [
//!     {"step": "fetch"},
//!     {"step": "answer_catalog"},
//!     {"step": "submit", "product_id": "gold"},
//!     {"step": "provider", "event": {"type": "transactions_updated", "transactions": [...]}}
//!   ]
//! }
//! ```
//!
//! Every bus event is printed to stdout as one JSON line, followed by a
//! final `{"summary": ...}` line.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use iap_catalog::ProviderError;
use iap_config::{report_unused_keys, UnusedKeyPolicy};
use iap_runtime::{StoreCapabilities, StoreRuntime};
use iap_schemas::{Product, ProductId, ProviderEvent};
use iap_store_paper::PaperStore;

#[derive(Debug, Deserialize)]
pub struct ReplayScript {
    #[serde(default)]
    pub products: Vec<Product>,
    pub steps: Vec<ReplayStep>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ReplayStep {
    /// Fetch the given ids, or the configured ones when omitted.
    Fetch {
        #[serde(default)]
        product_ids: Option<Vec<ProductId>>,
    },
    /// Let the paper store answer every pending catalog request, oldest
    /// first. Superseded answers are dropped by the catalog.
    AnswerCatalog,
    Submit {
        product_id: ProductId,
    },
    RestoreAll,
    Provider {
        event: ProviderEvent,
    },
}

#[derive(Debug, Serialize)]
struct Summary {
    steps: usize,
    acknowledged: usize,
    faults: usize,
    purchased: usize,
    restored: usize,
}

pub fn run(
    config_paths: &[String],
    script_path: &str,
    strict: bool,
    init_tracing: fn(&str),
) -> Result<()> {
    let path_refs: Vec<&str> = config_paths.iter().map(|s| s.as_str()).collect();
    let loaded = iap_config::load_layered_yaml(&path_refs)?;
    let store_config = loaded.store_config()?;
    init_tracing(&store_config.log_filter);

    let policy = if strict {
        UnusedKeyPolicy::Fail
    } else {
        UnusedKeyPolicy::Warn
    };
    let report = report_unused_keys(&loaded.config_json, policy)?;
    for key in &report.unused_leaf_pointers {
        warn!(key = %key, "unused config key");
    }

    let raw = fs::read_to_string(script_path)
        .with_context(|| format!("failed to read replay script: {script_path}"))?;
    let script: ReplayScript = serde_json::from_str(&raw)
        .with_context(|| format!("invalid replay script: {script_path}"))?;

    let store = Arc::new(
        script
            .products
            .into_iter()
            .fold(PaperStore::new(), PaperStore::with_product),
    );
    let runtime = StoreRuntime::from_config(
        store_config,
        StoreCapabilities::with_filesystem(store.clone(), store.clone()),
    );
    runtime.bus().subscribe(|ev| {
        println!("{}", serde_json::to_string(ev)?);
        Ok(())
    });

    info!(config_hash = %loaded.config_hash, steps = script.steps.len(), "replay started");
    let steps = script.steps.len();
    for step in script.steps {
        apply_step(&runtime, &store, step);
    }

    let engine = runtime.engine();
    let summary = Summary {
        steps,
        acknowledged: engine.acknowledged_count(),
        faults: engine.faults().len(),
        purchased: engine.purchased_ids().len(),
        restored: engine.restored_ids().len(),
    };
    println!("{}", serde_json::json!({ "summary": summary }));
    Ok(())
}

fn apply_step(runtime: &StoreRuntime, store: &PaperStore, step: ReplayStep) {
    match step {
        ReplayStep::Fetch { product_ids } => {
            match product_ids {
                Some(ids) => {
                    runtime.catalog().fetch(ids);
                }
                None => {
                    runtime.fetch_configured_catalog();
                }
            }
        }
        ReplayStep::AnswerCatalog => {
            for request_id in store.pending_requests() {
                let event = match store.answer(request_id) {
                    Some(Ok(response)) => ProviderEvent::ProductsReceived {
                        request_id,
                        response,
                    },
                    Some(Err(ProviderError::Transport(message))) => {
                        ProviderEvent::ProductsRequestFailed {
                            request_id,
                            message,
                        }
                    }
                    Some(Err(err)) => ProviderEvent::ProductsRequestFailed {
                        request_id,
                        message: err.to_string(),
                    },
                    None => continue,
                };
                runtime.ingest(event);
            }
        }
        ReplayStep::Submit { product_id } => runtime.submit(product_id),
        ReplayStep::RestoreAll => runtime.restore_all(),
        ReplayStep::Provider { event } => runtime.ingest(event),
    }
}
