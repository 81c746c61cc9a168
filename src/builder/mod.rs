//! Pure builders for the objects the operator creates
//!
//! Nothing here talks to the API server. Controllers feed observed state in
//! and create or compare what comes out.

pub mod merge;
pub mod resources;
pub mod sync_secret;
pub mod warmup;
pub mod worker;

pub use merge::{fields_for_node, merge_fields, overwrite_matches, selector_matches};
pub use resources::{default_resources, inverted_resources};
pub use sync_secret::build_sync_secret;
pub use warmup::{
    build_role, build_role_binding, build_service_account, build_warmup_job, is_job_active,
    is_job_complete, is_job_failed, job_failure_message, job_finish_time,
};
pub use worker::WorkerBuilder;
