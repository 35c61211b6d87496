//! # fleet-foundation
//!
//! Foundation layer for the fleet controller:
//! - Error: 공통 에러 타입
//! - Config: 통합 설정 (FleetConfig, launcher/retention/pool/scale-in)
//! - Storage: JsonStore (범용), RecordStore (nodes, pools, templates)

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    FleetConfig, LauncherSettings, PoolSettings, RetentionSettings, ScaleInSettings,
    DEFAULT_RETRYABLE_CAUSE, FLEET_CONFIG_FILE,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::{JsonStore, RecordStore, NODES_FILE, POOLS_FILE, TEMPLATES_FILE};
