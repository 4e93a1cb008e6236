//! Worklist engine and document transformation for CadBridge.
//!
//! [`Orchestrator`] drives the incremental conversion pipeline: it seeds a
//! frontier with the caller's root files, decides fresh-vs-stale per file,
//! batches stale files into converter jobs, rewrites results into the final
//! document graph and keeps looping until xref discovery reaches a fixpoint.

pub mod customizer;
pub mod orchestrator;
pub mod transformer;

pub use customizer::{Customizer, DefaultCustomizer};
pub use orchestrator::{Orchestrator, default_build_parameters};
