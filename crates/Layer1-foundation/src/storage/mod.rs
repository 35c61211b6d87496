//! Storage module for the fleet controller
//!
//! - `json`: JSON - 범용 파일 저장/로드
//! - `records`: 컨트롤러가 소유하는 레코드 (nodes, pools, templates)

mod json;
mod records;

// JSON Storage (범용)
pub use json::JsonStore;

// Controller records
pub use records::{RecordStore, NODES_FILE, POOLS_FILE, TEMPLATES_FILE};
