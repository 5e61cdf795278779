pub mod app_context;
pub mod config;
pub mod error;
pub mod error_record;
pub mod format;
pub mod masking;
pub mod metric_consts;
pub mod pipeline;
pub mod router;
pub mod schema;
pub mod sink;
pub mod types;
pub mod worker;
pub mod write_result;
