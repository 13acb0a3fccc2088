//! HTTP surface for crawlers (ingestion) and the review UI (clusters and decisions).

use std::sync::Arc;

use crate::db::Database;
use crate::environment::Settings;
use crate::llm::HeadlineGrouper;

pub mod api;

pub use api::{app_api_loop, router};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub settings: Arc<Settings>,
    pub grouper: Arc<dyn HeadlineGrouper>,
}
