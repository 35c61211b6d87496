//! Config - 통합 설정 관리
//!
//! - `fleet.rs` - FleetConfig 통합 설정

mod fleet;

pub use fleet::{
    FleetConfig, LauncherSettings, PoolSettings, RetentionSettings, ScaleInSettings,
    DEFAULT_RETRYABLE_CAUSE, FLEET_CONFIG_FILE,
};
