//! Time-based triggers.
//!
//! - Schedules: cron recurrences that open activities and start workflows
//! - Deadlines: interactions whose SLA elapsed resume their instance

mod deadlines;
mod scheduler;

pub use deadlines::expire_overdue_interactions;
pub use scheduler::{create_schedule, sweep, Scheduler, SweepReport};
