//! Calculator memory for Tally.
//!
//! Remembers values the user names across turns and feeds them back to the
//! model:
//!
//! - [`projector`] renders the [`FactStore`] as instructions
//! - [`extraction`] turns a finished turn into an [`ExtractionResult`] through
//!   a structured-output model call
//! - [`reconciler`] merges that result into the store
//! - [`persistence`] moves the store to and from a JSON blob
//! - [`CalculatorMemory`] wires the above into before/after inference hooks
//!
//! No failure in this crate is fatal to a conversation. Extraction errors
//! leave the store unchanged and unreadable blobs start an empty store.

mod atomic_write;
pub mod extraction;
mod memory;
pub mod observer;
pub mod persistence;
pub mod projector;
pub mod reconciler;

pub use extraction::{
    ExtractionClient, ExtractionError, ExtractionFut, ModelExtractionClient,
    StaticExtractionClient,
};
pub use memory::CalculatorMemory;
pub use observer::{MemoryObserver, NoopObserver, TracingObserver};
pub use persistence::{PersistenceError, load_session, save_session};
pub use projector::project;
pub use reconciler::{MergeReport, merge, reconcile};

pub use tally_types::{ExtractionResult, FactStore, NamedValue};
