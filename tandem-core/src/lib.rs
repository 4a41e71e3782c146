//! # tandem-core: Replicated text model for Tandem
//!
//! Everything here is synchronous and I/O free. The collaboration layer
//! wraps it in sessions and coordinators.
//!
//! ## Architecture
//!
//! ```text
//!   editor snapshot (old, new)
//!            │
//!            ▼
//!   ┌─────────────────┐   ops    ┌─────────────────┐
//!   │   translator    │ ───────► │   TextStore     │ ──► update blob
//!   │ (diff + apply)  │          │ (Yrs document)  │
//!   └─────────────────┘          └────────┬────────┘
//!                                         │ remote blob
//!                                         ▼
//!                                ┌─────────────────┐
//!                                │   selection     │
//!                                │ (cursor remap)  │
//!                                └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`text_store`]: CRDT-backed text buffer with full/delta encoding
//! - [`diff`]: Character-level shortest edit script
//! - [`translator`]: Local edit → one atomic update blob
//! - [`selection`]: Cursor/selection remapping across remote edits
//! - [`error`]: Shared error kinds

pub mod diff;
pub mod error;
pub mod selection;
pub mod text_store;
pub mod translator;
mod update_check;

pub use diff::{apply_ops, diff, EditOp, MAX_EDIT_DISTANCE};
pub use error::{ErrorKind, TextError};
pub use selection::{remap_selection_for_texts, Selection};
pub use text_store::{StateMarker, TextStore};
pub use translator::{translate, LocalEdit};
