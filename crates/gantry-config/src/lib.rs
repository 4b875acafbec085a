//! KDL configuration parsing for gantry.
//!
//! A single system configuration document (`gantry.kdl`) describes the
//! namespace jobs run in, build images, storage, git hosting credentials,
//! and the timers of the background workers.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    BazelConfig, GcConfig, GitHubConfig, LeaderElectionConfig, ScheduleConfig, StorageConfig,
    SweepConfig, SystemConfig, TaskConfig, load_system_config, parse_system_config,
};
