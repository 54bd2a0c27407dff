//! Storage layer for workflows, activities, interactions and schedules.

mod activities;
mod interactions;
mod models;
mod schedules;
mod sqlite;

pub use models::*;
pub use sqlite::SqliteStorage;
