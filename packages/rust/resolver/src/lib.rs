//! Cross-reference resolution against a file-system layout.
//!
//! [`FileIndex`] walks a base directory once and indexes candidate xref
//! targets by basename; [`XRefResolver`] turns the textual references found
//! in converter output into absolute paths using subtree and suffix
//! heuristics.

mod index;
mod xref;

pub use index::FileIndex;
pub use xref::XRefResolver;
