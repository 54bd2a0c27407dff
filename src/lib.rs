//! streamline - activity workflow automation engine
//!
//! Activities (tickets filled from a form) move through a user-authored
//! graph of typed steps. The engine renders smart-value templates against
//! the activity, waits on people through interactions and e-signatures,
//! branches on conditions, calls out over HTTP and sandboxed scripts, and
//! opens activities on cron schedules.
//!
//! ## Example
//!
//! ```yaml
//! - id: start
//!   kind: start
//!   next: { default: approval }
//!
//! - id: approval
//!   kind: interaction
//!   payload:
//!     form_id: approval-form
//!     to: ["${{activity.users.0.email}}"]
//!     wait_type: any
//!     conditions:
//!       - { field: approved, operator: "==", value: true }
//!   next: { default: notify, alternative: reject }
//!
//! - id: notify
//!   kind: send_email
//!   payload:
//!     to: [users]
//!     subject: "${{activity.name}} approved"
//!
//! - id: reject
//!   kind: change_status
//!   payload: { status_id: canceled }
//! ```

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod recurrence;
pub mod shutdown;
pub mod smart_values;
pub mod storage;
pub mod telemetry;
pub mod triggers;
pub mod workflow;

pub use error::{Error, Result};
