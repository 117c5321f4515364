//! Deterministic in-memory "paper" store provider.
//!
//! - Implements both [`StoreAdapter`] and [`CatalogProvider`]; every outbound
//!   call is recorded in order and can be inspected with [`PaperStore::calls`].
//! - Catalog requests are answered on demand from a fixed product table:
//!   known identifiers are valid, everything else is invalid.
//! - Transaction ids are `paper:txn:{seq}` and asset ids
//!   `paper:asset:{product_id}:{n}`. No randomness, no timestamps.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use iap_catalog::{CatalogProvider, ProviderError};
use iap_reconcile::StoreAdapter;
use iap_schemas::{
    AssetId, CatalogResponse, Product, ProductId, RequestId, TransactionId, TransactionState,
    TransactionUpdate,
};

/// One recorded outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaperCall {
    RequestProducts {
        request_id: RequestId,
        product_ids: BTreeSet<ProductId>,
    },
    Purchase(ProductId),
    RestoreAll,
    StartDownloads(Vec<AssetId>),
    Acknowledge(TransactionId),
}

#[derive(Debug, Default)]
struct PaperState {
    calls: Vec<PaperCall>,
    pending_catalog: BTreeMap<RequestId, BTreeSet<ProductId>>,
    next_txn: u64,
    offline: Option<String>,
}

#[derive(Debug, Default)]
pub struct PaperStore {
    products: BTreeMap<ProductId, Product>,
    /// Hosted assets per product; absent means no downloadable content.
    assets: BTreeMap<ProductId, usize>,
    state: Mutex<PaperState>,
}

impl PaperStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a product to the table. A `downloadable` product gets one hosted
    /// asset unless [`with_assets`](Self::with_assets) says otherwise.
    pub fn with_product(mut self, product: Product) -> Self {
        if product.downloadable {
            self.assets.entry(product.product_id.clone()).or_insert(1);
        }
        self.products.insert(product.product_id.clone(), product);
        self
    }

    pub fn with_assets(mut self, product_id: impl Into<ProductId>, count: usize) -> Self {
        self.assets.insert(product_id.into(), count);
        self
    }

    /// Make catalog answers fail with a transport error until cleared.
    pub fn set_offline(&self, message: Option<String>) {
        self.lock().offline = message;
    }

    pub fn calls(&self) -> Vec<PaperCall> {
        self.lock().calls.clone()
    }

    pub fn acknowledged(&self) -> Vec<TransactionId> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                PaperCall::Acknowledge(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Answer a recorded catalog request. `None` if the request id was never
    /// seen or was already answered.
    pub fn answer(&self, request_id: RequestId) -> Option<Result<CatalogResponse, ProviderError>> {
        let mut st = self.lock();
        let ids = st.pending_catalog.remove(&request_id)?;
        if let Some(message) = &st.offline {
            return Some(Err(ProviderError::Transport(message.clone())));
        }

        let mut response = CatalogResponse::default();
        for id in ids {
            match self.products.get(&id) {
                Some(p) => response.products.push(p.clone()),
                None => response.invalid_identifiers.push(id),
            }
        }
        Some(Ok(response))
    }

    /// Ids of catalog requests not answered yet, oldest first.
    pub fn pending_requests(&self) -> Vec<RequestId> {
        let st = self.lock();
        st.calls
            .iter()
            .filter_map(|c| match c {
                PaperCall::RequestProducts { request_id, .. }
                    if st.pending_catalog.contains_key(request_id) =>
                {
                    Some(*request_id)
                }
                _ => None,
            })
            .collect()
    }

    /// Build the provider's report for a new transaction of `product_id`,
    /// with the product's hosted assets attached.
    pub fn transaction_for(&self, product_id: &str, state: TransactionState) -> TransactionUpdate {
        let seq = {
            let mut st = self.lock();
            st.next_txn += 1;
            st.next_txn
        };
        let count = self.assets.get(product_id).copied().unwrap_or(0);
        TransactionUpdate::new(format!("paper:txn:{seq}"), product_id, state)
            .with_assets((1..=count).map(|n| format!("paper:asset:{product_id}:{n}")))
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: PaperCall) {
        debug!(call = ?call, "paper store call");
        self.lock().calls.push(call);
    }
}

impl CatalogProvider for PaperStore {
    fn name(&self) -> &'static str {
        "paper"
    }

    fn request_products(&self, request_id: RequestId, product_ids: &BTreeSet<ProductId>) {
        self.lock()
            .pending_catalog
            .insert(request_id, product_ids.clone());
        self.record(PaperCall::RequestProducts {
            request_id,
            product_ids: product_ids.clone(),
        });
    }
}

impl StoreAdapter for PaperStore {
    fn name(&self) -> &'static str {
        "paper"
    }

    fn request_purchase(&self, product_id: &ProductId) {
        self.record(PaperCall::Purchase(product_id.clone()));
    }

    fn request_restore_all(&self) {
        self.record(PaperCall::RestoreAll);
    }

    fn request_downloads_start(&self, asset_ids: &[AssetId]) {
        self.record(PaperCall::StartDownloads(asset_ids.to_vec()));
    }

    fn acknowledge_transaction(&self, transaction_id: &TransactionId) {
        self.record(PaperCall::Acknowledge(transaction_id.clone()));
    }
}
