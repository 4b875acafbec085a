//! System configuration parsing.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

pub const DEFAULT_BAZEL_IMAGE: &str = "l.gcr.io/google/bazel";
pub const DEFAULT_BAZEL_VERSION: &str = "3.2.0";
pub const DEFAULT_SIDECAR_IMAGE: &str = "registry.f110.dev/build/sidecar";
pub const DEFAULT_TRIGGER_IMAGE: &str = "curlimages/curl";

/// System-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Namespace build and discovery jobs are created in.
    pub namespace: String,
    pub listen: SocketAddr,
    /// Base URL used for links to stored logs.
    pub dashboard_url: String,
    pub database_url: Option<String>,
    pub bazel: BazelConfig,
    pub task: TaskConfig,
    pub gc: GcConfig,
    pub sweep: SweepConfig,
    pub schedule: ScheduleConfig,
    pub storage: Option<StorageConfig>,
    pub github: GitHubConfig,
    pub leader_election: LeaderElectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BazelConfig {
    pub image: String,
    pub default_version: String,
    pub sidecar_image: String,
    pub remote_cache: Option<String>,
    /// Use the remote cache as a remote asset API too.
    pub remote_asset: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub cpu_limit: String,
    pub memory_limit: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    pub interval_secs: u64,
    /// Number of most recent tasks kept per job definition.
    pub retain: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub interval_secs: u64,
}

/// How scheduled definitions reach the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Image of the CronJob container posting to `/run`.
    pub trigger_image: String,
    /// Base URL of this server as seen from inside the cluster.
    pub api_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub bucket: String,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    pub lease_name: String,
    pub lease_namespace: Option<String>,
    pub identity: Option<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            listen: SocketAddr::from(([127, 0, 0, 1], 8081)),
            dashboard_url: "http://localhost".to_string(),
            database_url: None,
            bazel: BazelConfig::default(),
            task: TaskConfig::default(),
            gc: GcConfig::default(),
            sweep: SweepConfig::default(),
            schedule: ScheduleConfig::default(),
            storage: None,
            github: GitHubConfig::default(),
            leader_election: LeaderElectionConfig::default(),
        }
    }
}

impl Default for BazelConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_BAZEL_IMAGE.to_string(),
            default_version: DEFAULT_BAZEL_VERSION.to_string(),
            sidecar_image: DEFAULT_SIDECAR_IMAGE.to_string(),
            remote_cache: None,
            remote_asset: false,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            cpu_limit: "1000m".to_string(),
            memory_limit: "4096Mi".to_string(),
            timeout_secs: 3600,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            retain: 10,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            trigger_image: DEFAULT_TRIGGER_IMAGE.to_string(),
            api_url: "http://gantry:8081".to_string(),
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token: None,
            webhook_secret: None,
        }
    }
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lease_name: "gantry".to_string(),
            lease_namespace: None,
            identity: None,
        }
    }
}

impl TaskConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Read and parse a system configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

/// Parse system configuration from KDL text.
///
/// Every node is optional; anything missing keeps its default.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "namespace" => {
                config.namespace = require_string_arg(node, "namespace")?;
            }
            "listen" => {
                let raw = require_string_arg(node, "listen")?;
                config.listen = raw.parse().map_err(|e| ConfigError::InvalidValue {
                    field: "listen".to_string(),
                    message: format!("{}: {}", raw, e),
                })?;
            }
            "dashboard-url" => {
                config.dashboard_url = require_string_arg(node, "dashboard-url")?
                    .trim_end_matches('/')
                    .to_string();
            }
            "database-url" => {
                config.database_url = Some(require_string_arg(node, "database-url")?);
            }
            "bazel" => parse_bazel(node, &mut config.bazel)?,
            "task" => parse_task(node, &mut config.task)?,
            "gc" => parse_gc(node, &mut config.gc)?,
            "sweep" => {
                for child in children(node) {
                    if child.name().value() == "interval-secs" {
                        config.sweep.interval_secs = positive_int_arg(child, "sweep.interval-secs")?;
                    }
                }
            }
            "schedule" => parse_schedule(node, &mut config.schedule)?,
            "storage" => config.storage = Some(parse_storage(node)?),
            "github" => parse_github(node, &mut config.github)?,
            "leader-election" => parse_leader_election(node, &mut config.leader_election)?,
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_bazel(node: &KdlNode, bazel: &mut BazelConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "image" => bazel.image = require_string_arg(child, "bazel.image")?,
            "default-version" => {
                bazel.default_version = require_string_arg(child, "bazel.default-version")?
            }
            "sidecar-image" => {
                bazel.sidecar_image = require_string_arg(child, "bazel.sidecar-image")?
            }
            "remote-cache" => {
                bazel.remote_cache = Some(require_string_arg(child, "bazel.remote-cache")?)
            }
            "remote-asset" => bazel.remote_asset = get_bool_arg(child).unwrap_or(false),
            _ => {}
        }
    }
    Ok(())
}

fn parse_task(node: &KdlNode, task: &mut TaskConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "cpu-limit" => task.cpu_limit = require_string_arg(child, "task.cpu-limit")?,
            "memory-limit" => task.memory_limit = require_string_arg(child, "task.memory-limit")?,
            "timeout-secs" => task.timeout_secs = positive_int_arg(child, "task.timeout-secs")?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_gc(node: &KdlNode, gc: &mut GcConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "interval-secs" => gc.interval_secs = positive_int_arg(child, "gc.interval-secs")?,
            "retain" => gc.retain = positive_int_arg(child, "gc.retain")? as usize,
            _ => {}
        }
    }
    Ok(())
}

fn parse_schedule(node: &KdlNode, schedule: &mut ScheduleConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "trigger-image" => {
                schedule.trigger_image = require_string_arg(child, "schedule.trigger-image")?
            }
            "api-url" => {
                schedule.api_url = require_string_arg(child, "schedule.api-url")?
                    .trim_end_matches('/')
                    .to_string()
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_storage(node: &KdlNode) -> ConfigResult<StorageConfig> {
    let mut endpoint = None;
    let mut bucket = None;
    let mut region = "us-east-1".to_string();
    let mut access_key = None;
    let mut secret_access_key = None;

    for child in children(node) {
        match child.name().value() {
            "endpoint" => endpoint = get_first_string_arg(child),
            "bucket" => bucket = get_first_string_arg(child),
            "region" => region = require_string_arg(child, "storage.region")?,
            "access-key" => access_key = get_first_string_arg(child),
            "secret-access-key" => secret_access_key = get_first_string_arg(child),
            _ => {}
        }
    }

    Ok(StorageConfig {
        endpoint,
        bucket: bucket.ok_or_else(|| ConfigError::MissingField("storage.bucket".to_string()))?,
        region,
        access_key,
        secret_access_key,
    })
}

fn parse_github(node: &KdlNode, github: &mut GitHubConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "api-url" => {
                github.api_url = require_string_arg(child, "github.api-url")?
                    .trim_end_matches('/')
                    .to_string()
            }
            "token" => github.token = get_first_string_arg(child),
            "webhook-secret" => github.webhook_secret = get_first_string_arg(child),
            _ => {}
        }
    }
    Ok(())
}

fn parse_leader_election(node: &KdlNode, le: &mut LeaderElectionConfig) -> ConfigResult<()> {
    le.enabled = true;
    for child in children(node) {
        match child.name().value() {
            "enabled" => le.enabled = get_bool_arg(child).unwrap_or(true),
            "lease-name" => le.lease_name = require_string_arg(child, "leader-election.lease-name")?,
            "lease-namespace" => le.lease_namespace = get_first_string_arg(child),
            "identity" => le.identity = get_first_string_arg(child),
            _ => {}
        }
    }
    Ok(())
}

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|c| c.nodes().iter())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn require_string_arg(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: "expected a string argument".to_string(),
    })
}

fn get_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

fn positive_int_arg(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected an integer argument".to_string(),
        })?;
    if value <= 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("must be positive, got {}", value),
        });
    }
    u64::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("out of range: {}", value),
    })
}
