pub mod app;
pub mod clustering;
pub mod db;
pub mod environment;
pub mod fingerprint;
pub mod keywords;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod prompt;
pub mod resolver;
pub mod review;

pub const TARGET_WEB_REQUEST: &str = "web_request";
pub const TARGET_LLM_REQUEST: &str = "llm_request";
pub const TARGET_DB: &str = "db_query";
pub const TARGET_PIPELINE: &str = "pipeline";
pub const TARGET_CACHE: &str = "cluster_cache";

/// Identifies a worker in log lines: `[name id]`.
#[derive(Clone, Debug)]
pub struct WorkerDetail {
    pub name: String,
    pub id: i16,
}

impl WorkerDetail {
    pub fn new(name: &str, id: i16) -> Self {
        Self {
            name: name.to_string(),
            id,
        }
    }
}

/// Current unix time in seconds; all stored timestamps use this unit.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
