//! Provider boundary for catalog queries.
//!
//! Only the trait and its error type live here; concrete providers (store
//! SDK bindings, the paper store) are implemented elsewhere.

use std::collections::BTreeSet;
use std::fmt;

use iap_schemas::{ProductId, RequestId};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors a catalog request can complete with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Network or transport failure.
    Transport(String),
    /// The catalog service returned an application-level error.
    Api { code: Option<i64>, message: String },
    /// A response payload could not be decoded.
    Decode(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Transport(msg) => write!(f, "transport error: {msg}"),
            ProviderError::Api {
                code: Some(c),
                message,
            } => write!(f, "catalog api error code={c}: {message}"),
            ProviderError::Api {
                code: None,
                message,
            } => write!(f, "catalog api error: {message}"),
            ProviderError::Decode(msg) => write!(f, "decode error: {msg}"),
        }
    }
}

impl std::error::Error for ProviderError {}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Outbound half of the catalog protocol.
///
/// `request_products` only enqueues the query; the answer is delivered later
/// through [`crate::ProductCatalog::on_response`] tagged with the same
/// `request_id`. Implementations must be object-safe and `Send + Sync` so the
/// catalog can hold an `Arc<dyn CatalogProvider>`.
pub trait CatalogProvider: Send + Sync {
    /// Human-readable name identifying this provider (e.g. `"paper"`).
    fn name(&self) -> &'static str;

    fn request_products(&self, request_id: RequestId, product_ids: &BTreeSet<ProductId>);
}
