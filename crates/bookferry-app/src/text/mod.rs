//! Text utilities kept pure for reuse across the pipeline.
//!
//! Functions exposed here must remain side-effect free so they can be
//! composed from workers without introducing hidden IO or mutable state.

pub mod sanitize;

pub use sanitize::{SanitizeOptions, sanitize_text, sanitize_text_with_options};
