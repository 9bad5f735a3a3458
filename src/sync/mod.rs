//! # Incremental sync engine
//!
//! Generic pull/transform/emit pipeline shared by every entity kind:
//! [`fetcher`] pages through an incremental window, [`associations`] resolves
//! related objects per page, [`transform`] applies the kind's
//! [`entities::EntityDescriptor`], [`sink`] batches the resulting events and
//! [`orchestrator`] drives it all per account.

pub mod associations;
pub mod entities;
pub mod event;
pub mod fetcher;
pub mod orchestrator;
pub mod sink;
pub mod transform;

pub use entities::{EntityDescriptor, EntityKind};
pub use event::{OutputEvent, PropertyScope};
pub use orchestrator::{RunSummary, SyncOrchestrator, SyncSettings};
