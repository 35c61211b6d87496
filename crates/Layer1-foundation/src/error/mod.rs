//! Error types for the fleet controller
//!
//! 모든 에러를 중앙에서 관리

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Fleet 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // 저장소 관련
    // ========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    // ========================================================================
    // Remote service 관련
    // ========================================================================
    /// Transient or service-side failure of a remote call
    #[error("Remote error: {operation} - {message}")]
    Remote { operation: String, message: String },

    /// The remote service accepted the call but could not place the task
    #[error("Placement failed: {0}")]
    Placement(String),

    // ========================================================================
    // Agent launch 관련
    // ========================================================================
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Task stopped before coming online: {0}")]
    TaskStopped(String),

    #[error("Launch exceeded {attempts} attempts: {last}")]
    AttemptsExceeded { attempts: u32, last: String },

    #[error("Launch aborted: {0}")]
    Aborted(String),

    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // 일반
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Validation error: {0}")]
    Validation(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 재시도 가능한 에러인지 확인
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Remote { .. } | Error::Timeout(_))
    }

    /// Launch 실패가 호출자에게 전달되어야 하는 종류인지 확인
    pub fn is_launch_failure(&self) -> bool {
        matches!(
            self,
            Error::Placement(_)
                | Error::Timeout(_)
                | Error::TaskStopped(_)
                | Error::AttemptsExceeded { .. }
                | Error::Aborted(_)
        )
    }

    /// Remote 에러 생성 헬퍼
    pub fn remote(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Remote {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::remote("runTask", "throttled").is_retryable());
        assert!(Error::Timeout("slow".into()).is_retryable());
        assert!(!Error::Placement("RESOURCE:MEMORY".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_launch_failure_classification() {
        let err = Error::AttemptsExceeded {
            attempts: 2,
            last: "eni timeout".into(),
        };
        assert!(err.is_launch_failure());
        assert!(err.to_string().contains("2 attempts"));
        assert!(!Error::Config("bad".into()).is_launch_failure());
    }
}
