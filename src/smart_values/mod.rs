//! Smart values: `${{activity.path}}` placeholders rendered against an
//! activity snapshot.
//!
//! Resolution never fails. Anything that cannot be resolved renders as `-`.

mod resolver;
mod snapshot;

pub use resolver::{resolve, resolve_recipients, FALLBACK};
pub use snapshot::Snapshot;
