use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use iap_events::EventBus;
use iap_schemas::{CatalogEvent, CatalogResponse, Product, ProductId, RequestId};
use tracing::{debug, info, warn};

use crate::provider::{CatalogProvider, ProviderError};

pub const AVAILABLE_PRODUCTS_SECTION: &str = "AVAILABLE PRODUCTS";
pub const INVALID_PRODUCT_IDS_SECTION: &str = "INVALID PRODUCT IDS";

// ---------------------------------------------------------------------------
// CatalogResult
// ---------------------------------------------------------------------------

/// Last successful catalog answer. Replaced wholesale, never merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogResult {
    valid: BTreeMap<ProductId, Product>,
    invalid: BTreeSet<ProductId>,
}

/// One display group of a catalog answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSection {
    pub name: &'static str,
    pub elements: Vec<String>,
}

impl CatalogResult {
    pub fn from_response(response: CatalogResponse) -> Self {
        let valid = response
            .products
            .into_iter()
            .map(|p| (p.product_id.clone(), p))
            .collect();
        let invalid = response.invalid_identifiers.into_iter().collect();
        Self { valid, invalid }
    }

    pub fn valid_ids(&self) -> BTreeSet<ProductId> {
        self.valid.keys().cloned().collect()
    }

    pub fn invalid_identifiers(&self) -> &BTreeSet<ProductId> {
        &self.invalid
    }

    pub fn product(&self, product_id: &str) -> Option<&Product> {
        self.valid.get(product_id)
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty() && self.invalid.is_empty()
    }

    /// Display grouping: available product titles, then invalid identifiers.
    /// Empty groups are omitted.
    pub fn sections(&self) -> Vec<CatalogSection> {
        let mut out = Vec::new();
        if !self.valid.is_empty() {
            out.push(CatalogSection {
                name: AVAILABLE_PRODUCTS_SECTION,
                elements: self.valid.values().map(|p| p.title.clone()).collect(),
            });
        }
        if !self.invalid.is_empty() {
            out.push(CatalogSection {
                name: INVALID_PRODUCT_IDS_SECTION,
                elements: self.invalid.iter().cloned().collect(),
            });
        }
        out
    }
}

// ---------------------------------------------------------------------------
// ProductCatalog
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CatalogState {
    in_flight: Option<RequestId>,
    result: CatalogResult,
}

/// Catalog query front-end with a last-request-wins cache.
///
/// All methods take `&self`; state is guarded by an internal mutex and
/// notifications are published after the guard is released.
pub struct ProductCatalog {
    provider: Arc<dyn CatalogProvider>,
    bus: EventBus,
    state: Mutex<CatalogState>,
}

impl ProductCatalog {
    pub fn new(provider: Arc<dyn CatalogProvider>, bus: EventBus) -> Self {
        Self {
            provider,
            bus,
            state: Mutex::new(CatalogState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a catalog request for `product_ids`, superseding any request
    /// still in flight. Returns the identity the response must carry.
    pub fn fetch<I, S>(&self, product_ids: I) -> RequestId
    where
        I: IntoIterator<Item = S>,
        S: Into<ProductId>,
    {
        let ids: BTreeSet<ProductId> = product_ids.into_iter().map(Into::into).collect();
        let request_id = RequestId::new_v4();

        let superseded = self.lock().in_flight.replace(request_id);
        if let Some(old) = superseded {
            debug!(%old, new = %request_id, "catalog request superseded");
        }

        debug!(
            %request_id,
            provider = self.provider.name(),
            count = ids.len(),
            "catalog request issued"
        );
        self.provider.request_products(request_id, &ids);
        request_id
    }

    /// Deliver the provider's answer for `request_id`.
    ///
    /// Returns `false` when the response was dropped because it does not
    /// belong to the current in-flight request.
    pub fn on_response(
        &self,
        request_id: RequestId,
        response: Result<CatalogResponse, ProviderError>,
    ) -> bool {
        let event = {
            let mut st = self.lock();
            if st.in_flight != Some(request_id) {
                debug!(%request_id, current = ?st.in_flight, "stale catalog response dropped");
                return false;
            }
            st.in_flight = None;

            match response {
                Ok(resp) => {
                    st.result = CatalogResult::from_response(resp);
                    info!(
                        %request_id,
                        valid = st.result.valid.len(),
                        invalid = st.result.invalid.len(),
                        "catalog response accepted"
                    );
                    CatalogEvent::ProductRequestResponse {
                        request_id,
                        valid_count: st.result.valid.len(),
                        invalid_count: st.result.invalid.len(),
                    }
                }
                Err(err) => {
                    warn!(%request_id, error = %err, "catalog request failed");
                    CatalogEvent::RequestFailed {
                        request_id,
                        message: err.to_string(),
                    }
                }
            }
        };

        self.bus.publish(event);
        true
    }

    /// Title of a product in the last cached answer.
    pub fn title_for_product_id(&self, product_id: &str) -> Option<String> {
        // Catalogs are tens to low hundreds of entries; a scan is fine.
        self.lock()
            .result
            .valid
            .values()
            .find(|p| p.product_id == product_id)
            .map(|p| p.title.clone())
    }

    /// Clone of the last cached answer.
    pub fn result(&self) -> CatalogResult {
        self.lock().result.clone()
    }

    pub fn in_flight(&self) -> Option<RequestId> {
        self.lock().in_flight
    }
}
