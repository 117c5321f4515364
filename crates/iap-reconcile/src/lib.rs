#![forbid(unsafe_code)]

//! Purchase and entitlement reconciliation.
//!
//! Turns the provider's asynchronous transaction and download callbacks into
//! acknowledgements and one notification per logical state change:
//!
//! - [`TransactionTracker`] owns the per-transaction state machine and the
//!   purchased/restored sets.
//! - [`DownloadTracker`] owns per-asset state, installs finished content and
//!   reports settlement back to the transaction tracker (one direction only).
//! - [`ReconcileEngine`] serializes both trackers behind one lock. Outbound
//!   provider calls and bus notifications are collected in an [`Outbox`]
//!   while the lock is held and delivered after it is released, so a
//!   subscriber may call back into the engine.
//!
//! Failures never leave an ingestion call as `Err`; they become notifications
//! and entries in the engine's bounded fault log.

mod adapter;
mod download;
mod engine;
mod fault;
mod outbox;
mod transaction;

pub use adapter::StoreAdapter;
pub use download::{AssetRecord, DownloadTracker, InstallContext};
pub use engine::ReconcileEngine;
pub use fault::{FaultLog, ReconcileFault};
pub use outbox::{OutboundCall, Outbox};
pub use transaction::{Applied, TransactionSnapshot, TransactionTracker, TransitionError};
