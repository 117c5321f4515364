#![forbid(unsafe_code)]

//! Typed notification bus for the purchase reconciliation workspace.
//!
//! Publishers hold a cloned [`EventBus`]; every publish is delivered
//! synchronously, on the caller's thread, to every subscriber registered at
//! the moment of the call. There is no queue and no coalescing.

mod bus;

pub use bus::{EventBus, SubscriptionToken};
pub use iap_schemas::{CatalogEvent, PurchaseNotification, PurchaseStatus, StoreEvent};
