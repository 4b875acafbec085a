//! Build scheduling for gantry.
//!
//! Launches build and discovery jobs, follows them through the event router
//! to a terminal state, keeps scheduled definitions' cron jobs in sync, and
//! prunes old tasks.

pub mod controller;
pub mod coordinator;
pub mod discovery;
pub mod gc;
pub mod query;
pub mod queue;
pub mod schedule;
pub mod storage;
pub mod sweeper;
pub mod viewer;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::Controller;
pub use coordinator::{BazelBuilder, Builder, BuilderOptions};
pub use discovery::{Discoverer, Discovery};
pub use gc::GarbageCollector;
pub use storage::ObjectLogStore;
pub use sweeper::TimeoutSweeper;
pub use viewer::DiscoveryViewer;
