//! holdtag-core library.
//!
//! Hold tags record QC holds on inventory; reusable QR labels are scanned
//! onto them. Each open tag carries at most one label and each label sits on
//! at most one tag. Every scanning station opens its own [`Store`] on the
//! shared SQLite file.
//!
//! # Conventions
//!
//! - **Errors**: domain operations return [`HoldResult`]; setup paths
//!   (opening the store, loading config, rebuilds) use `anyhow::Result`.
//! - **Logging**: `tracing` macros with structured fields. The library never
//!   installs a subscriber.

pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod event;
pub mod model;
pub mod retry;
pub mod store;
pub mod verify;
pub mod workflow;

pub use config::{HoldConfig, load_config};
pub use coordinator::{BindOutcome, BindingCoordinator, Transition, UnbindOutcome};
pub use error::{Conflict, EntityKind, ErrorCode, HoldError, HoldResult};
pub use store::{CloseReceipt, HoldTagStore, Ledger, Store, TagFilter};
pub use workflow::{DispositionReceipt, DispositionWorkflow};
