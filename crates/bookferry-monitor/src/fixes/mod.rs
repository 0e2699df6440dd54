//! Fix application: restart, config change, validated code patch.

mod apply;
mod patch;

pub use apply::{AppliedFix, FixError, FixExecutor, RestartParams};
pub use patch::{PatchError, PatchSpec, check_delimiters};
