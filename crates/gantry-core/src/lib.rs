//! Core domain types and traits for the gantry build orchestrator.
//!
//! This crate contains:
//! - Persistent entities (repositories, job definitions, tasks, trusted users, permits)
//! - Change tracking used by the persistence layer for partial updates
//! - Error taxonomy shared by every layer
//! - Collaborator seams (log artifact store, git hosting service)
//! - Webhook payloads sent by the git hosting service

pub mod artifact;
pub mod error;
pub mod event;
pub mod githost;
pub mod job;
pub mod repository;
pub mod task;
pub mod tracking;

pub use error::{Error, Result};
pub use job::{Command, JobDefinition};
pub use repository::{PullRequestPermit, Repository, TrustedUser};
pub use task::{Task, TriggerSource};
pub use tracking::{Change, ColumnValue, Tracked};
