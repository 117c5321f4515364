//! iap-catalog
//!
//! Product catalog lookups against the external commerce provider.
//!
//! - One request in flight at a time. A new `fetch` supersedes the previous
//!   one; a superseded response that arrives later is dropped by request
//!   identity (last request wins). Nothing is actively cancelled.
//! - A successful response replaces the cached [`CatalogResult`] wholesale.
//! - Transport failures are surfaced as `RequestFailed` notifications. There
//!   is no automatic retry.

mod catalog;
pub mod provider;

pub use catalog::{
    CatalogResult, CatalogSection, ProductCatalog, AVAILABLE_PRODUCTS_SECTION,
    INVALID_PRODUCT_IDS_SECTION,
};
pub use provider::{CatalogProvider, ProviderError};
