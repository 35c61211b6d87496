//! Fleet Config - 컨트롤러 통합 설정
//!
//! Controller identity, launch/retention/pool/scale-in tuning. Every tuning
//! constant has a default and can be overridden from JSON or TOML.

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 설정 파일명
pub const FLEET_CONFIG_FILE: &str = "config.json";

/// Failure message the remote service reports when network interface
/// provisioning times out; the only cause retried by default.
pub const DEFAULT_RETRYABLE_CAUSE: &str =
    "Timeout waiting for network interface provisioning to complete";

// ============================================================================
// Fleet Config (통합)
// ============================================================================

/// Fleet controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    /// 버전 (마이그레이션용)
    #[serde(default = "default_version")]
    pub version: u32,

    /// Controller identity, used in definition family names and node names
    #[serde(default = "default_controller_name")]
    pub controller_name: String,

    /// Host cluster the tasks run on
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Underlying host group managed by scale-in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_group: Option<String>,

    /// URL agents use to reach the controller
    #[serde(default = "default_controller_url")]
    pub controller_url: String,

    /// Bounded launch worker pool size
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub launcher: LauncherSettings,

    #[serde(default)]
    pub retention: RetentionSettings,

    #[serde(default)]
    pub pools: PoolSettings,

    #[serde(default)]
    pub scale_in: ScaleInSettings,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            controller_name: default_controller_name(),
            cluster_id: default_cluster_id(),
            host_group: None,
            controller_url: default_controller_url(),
            workers: default_workers(),
            launcher: LauncherSettings::default(),
            retention: RetentionSettings::default(),
            pools: PoolSettings::default(),
            scale_in: ScaleInSettings::default(),
        }
    }
}

impl FleetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// 글로벌 + 프로젝트 병합 로드
    pub fn load() -> Result<Self> {
        let mut config = Self::new();

        if let Ok(global) = JsonStore::global() {
            if let Some(global_config) = global.load_optional::<FleetConfig>(FLEET_CONFIG_FILE)? {
                config.merge(global_config);
            }
        }

        if let Ok(project) = JsonStore::current_project() {
            if let Some(project_config) =
                project.load_optional::<FleetConfig>(FLEET_CONFIG_FILE)?
            {
                config.merge(project_config);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 로드
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: FleetConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 프로젝트 설정 저장
    pub fn save_project(&self) -> Result<()> {
        let store = JsonStore::current_project()?;
        store.save(FLEET_CONFIG_FILE, self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.controller_name.trim().is_empty() {
            return Err(Error::Validation("controllerName must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(Error::Validation("workers must be at least 1".into()));
        }
        if self.launcher.max_attempts == 0 {
            return Err(Error::Validation("launcher.maxAttempts must be at least 1".into()));
        }
        if self.scale_in.billing_period_secs == 0 {
            return Err(Error::Validation(
                "scaleIn.billingPeriodSecs must be positive".into(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// 다른 설정과 병합 (other가 우선)
    pub fn merge(&mut self, other: FleetConfig) {
        if other.controller_name != default_controller_name() {
            self.controller_name = other.controller_name;
        }
        if other.cluster_id != default_cluster_id() {
            self.cluster_id = other.cluster_id;
        }
        if other.host_group.is_some() {
            self.host_group = other.host_group;
        }
        if other.controller_url != default_controller_url() {
            self.controller_url = other.controller_url;
        }
        if other.workers != default_workers() {
            self.workers = other.workers;
        }

        self.launcher.merge(other.launcher);
        self.retention.merge(other.retention);
        self.pools.merge(other.pools);
        self.scale_in.merge(other.scale_in);
    }

    // ========================================================================
    // Builder
    // ========================================================================

    pub fn controller_name(mut self, name: impl Into<String>) -> Self {
        self.controller_name = name.into();
        self
    }

    pub fn cluster_id(mut self, cluster: impl Into<String>) -> Self {
        self.cluster_id = cluster.into();
        self
    }

    pub fn host_group(mut self, group: impl Into<String>) -> Self {
        self.host_group = Some(group.into());
        self
    }
}

// ============================================================================
// Launcher Settings
// ============================================================================

/// Agent launch retry/timeout settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LauncherSettings {
    /// Total run-and-wait attempts for retryable causes
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Interval between describe/online polls (ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Deadline for a whole launch (초)
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,

    /// Failure messages that allow another attempt
    #[serde(default = "default_retryable_causes")]
    pub retryable_causes: Vec<String>,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            launch_timeout_secs: default_launch_timeout_secs(),
            retryable_causes: default_retryable_causes(),
        }
    }
}

impl LauncherSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    /// Whether a failure message matches the retryable allowlist
    pub fn is_retryable_cause(&self, message: &str) -> bool {
        self.retryable_causes
            .iter()
            .any(|cause| !cause.is_empty() && message.contains(cause.as_str()))
    }

    fn merge(&mut self, other: LauncherSettings) {
        if other.max_attempts != default_max_attempts() {
            self.max_attempts = other.max_attempts;
        }
        if other.poll_interval_ms != default_poll_interval_ms() {
            self.poll_interval_ms = other.poll_interval_ms;
        }
        if other.launch_timeout_secs != default_launch_timeout_secs() {
            self.launch_timeout_secs = other.launch_timeout_secs;
        }
        if other.retryable_causes != default_retryable_causes() {
            self.retryable_causes = other.retryable_causes;
        }
    }
}

// ============================================================================
// Retention Settings
// ============================================================================

/// Idle retention settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionSettings {
    /// Delay before re-checking a node kept by the retention floor (초)
    #[serde(default = "default_recheck_delay_secs")]
    pub recheck_delay_secs: u64,

    /// Periodic retention check interval (초)
    #[serde(default = "default_tick_secs")]
    pub tick_interval_secs: u64,

    /// Idle minutes used when a template does not set one
    #[serde(default = "default_idle_minutes")]
    pub default_idle_minutes: u32,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            recheck_delay_secs: default_recheck_delay_secs(),
            tick_interval_secs: default_tick_secs(),
            default_idle_minutes: default_idle_minutes(),
        }
    }
}

impl RetentionSettings {
    pub fn recheck_delay(&self) -> Duration {
        Duration::from_secs(self.recheck_delay_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    fn merge(&mut self, other: RetentionSettings) {
        if other.recheck_delay_secs != default_recheck_delay_secs() {
            self.recheck_delay_secs = other.recheck_delay_secs;
        }
        if other.tick_interval_secs != default_tick_secs() {
            self.tick_interval_secs = other.tick_interval_secs;
        }
        if other.default_idle_minutes != default_idle_minutes() {
            self.default_idle_minutes = other.default_idle_minutes;
        }
    }
}

// ============================================================================
// Pool Settings
// ============================================================================

/// Warm pool maintenance settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSettings {
    /// Reconciliation interval (초)
    #[serde(default = "default_tick_secs")]
    pub tick_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_secs(),
        }
    }
}

impl PoolSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    fn merge(&mut self, other: PoolSettings) {
        if other.tick_interval_secs != default_tick_secs() {
            self.tick_interval_secs = other.tick_interval_secs;
        }
    }
}

// ============================================================================
// Scale-In Settings
// ============================================================================

/// Host fleet scale-in settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleInSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Loop interval (초)
    #[serde(default = "default_tick_secs")]
    pub tick_interval_secs: u64,

    /// Hosts running longer than this are drained unconditionally (초)
    #[serde(default = "default_max_uptime_secs")]
    pub max_uptime_secs: u64,

    /// Idle hosts this close to the next billing boundary are drained (초)
    #[serde(default = "default_billing_window_secs")]
    pub billing_window_secs: u64,

    /// Billing period length (초)
    #[serde(default = "default_billing_period_secs")]
    pub billing_period_secs: u64,
}

impl Default for ScaleInSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            tick_interval_secs: default_tick_secs(),
            max_uptime_secs: default_max_uptime_secs(),
            billing_window_secs: default_billing_window_secs(),
            billing_period_secs: default_billing_period_secs(),
        }
    }
}

impl ScaleInSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn max_uptime(&self) -> Duration {
        Duration::from_secs(self.max_uptime_secs)
    }

    pub fn billing_window(&self) -> Duration {
        Duration::from_secs(self.billing_window_secs)
    }

    pub fn billing_period(&self) -> Duration {
        Duration::from_secs(self.billing_period_secs)
    }

    fn merge(&mut self, other: ScaleInSettings) {
        self.enabled = other.enabled;
        if other.tick_interval_secs != default_tick_secs() {
            self.tick_interval_secs = other.tick_interval_secs;
        }
        if other.max_uptime_secs != default_max_uptime_secs() {
            self.max_uptime_secs = other.max_uptime_secs;
        }
        if other.billing_window_secs != default_billing_window_secs() {
            self.billing_window_secs = other.billing_window_secs;
        }
        if other.billing_period_secs != default_billing_period_secs() {
            self.billing_period_secs = other.billing_period_secs;
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn default_version() -> u32 {
    1
}

fn default_controller_name() -> String {
    "fleet".to_string()
}

fn default_cluster_id() -> String {
    "default".to_string()
}

fn default_controller_url() -> String {
    "http://localhost:8080/".to_string()
}

fn default_workers() -> usize {
    8
}

fn default_max_attempts() -> u32 {
    2
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_launch_timeout_secs() -> u64 {
    300
}

fn default_retryable_causes() -> Vec<String> {
    vec![DEFAULT_RETRYABLE_CAUSE.to_string()]
}

fn default_recheck_delay_secs() -> u64 {
    60
}

fn default_tick_secs() -> u64 {
    60
}

fn default_idle_minutes() -> u32 {
    5
}

fn default_max_uptime_secs() -> u64 {
    10 * 60 * 60
}

fn default_billing_window_secs() -> u64 {
    240
}

fn default_billing_period_secs() -> u64 {
    60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleet_config_default() {
        let config = FleetConfig::new();
        assert_eq!(config.version, 1);
        assert_eq!(config.launcher.max_attempts, 2);
        assert_eq!(config.scale_in.billing_window(), Duration::from_secs(240));
        assert_eq!(config.scale_in.max_uptime(), Duration::from_secs(36_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_merge() {
        let mut base = FleetConfig::new().cluster_id("build");

        let mut overlay = FleetConfig::new().controller_name("ci");
        overlay.launcher.max_attempts = 3;

        base.merge(overlay);

        assert_eq!(base.controller_name, "ci");
        assert_eq!(base.cluster_id, "build");
        assert_eq!(base.launcher.max_attempts, 3);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: FleetConfig =
            serde_json::from_str(r#"{"controllerName":"ci","scaleIn":{"enabled":true}}"#).unwrap();
        assert_eq!(config.controller_name, "ci");
        assert!(config.scale_in.enabled);
        assert_eq!(config.scale_in.billing_window_secs, 240);
        assert_eq!(config.workers, 8);
    }

    #[test]
    fn test_toml_config() {
        let config: FleetConfig = toml::from_str(
            r#"
            controllerName = "ci"
            clusterId = "builds"

            [launcher]
            maxAttempts = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.cluster_id, "builds");
        assert_eq!(config.launcher.max_attempts, 4);
        assert_eq!(config.launcher.retryable_causes, default_retryable_causes());
    }

    #[test]
    fn test_retryable_cause_matching() {
        let settings = LauncherSettings::default();
        assert!(settings.is_retryable_cause(
            "ResourceInitializationError: Timeout waiting for network interface provisioning to complete."
        ));
        assert!(!settings.is_retryable_cause("CannotPullContainerError"));
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let mut config = FleetConfig::new();
        config.workers = 0;
        assert!(config.validate().is_err());
    }
}
