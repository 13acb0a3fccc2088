//! Article processing from raw crawl result to review-ready summary.
//!
//! Stages run in order: keyword filter, primary resolution, summarization, classification,
//! region gate, external importance filter. Each gate decides through [`state::transition`]
//! and persists through `Database::apply_gate_transition`.

use std::sync::Arc;

use crate::environment::Settings;
use crate::llm::{
    HeadlineGrouper, ImportanceJudge, LexiconSentiment, OllamaJudge, RegionVerifier,
    SentimentClassifier, StrsimHeadlineGrouper, Summarizer,
};

pub mod gates;
pub mod ingest;
pub mod state;
pub mod types;
pub mod worker;

/// The external collaborators a pipeline or refresh run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub summarizer: Arc<dyn Summarizer>,
    pub region_verifier: Arc<dyn RegionVerifier>,
    pub importance_judge: Arc<dyn ImportanceJudge>,
    pub sentiment: Arc<dyn SentimentClassifier>,
    pub grouper: Arc<dyn HeadlineGrouper>,
}

impl Collaborators {
    /// Ollama for the LLM calls, local defaults for sentiment and headline grouping.
    pub fn from_settings(settings: &Settings) -> Self {
        let judge = Arc::new(OllamaJudge::from_settings(settings));
        Self {
            summarizer: judge.clone(),
            region_verifier: judge.clone(),
            importance_judge: judge,
            sentiment: Arc::new(LexiconSentiment),
            grouper: Arc::new(StrsimHeadlineGrouper),
        }
    }
}

/// Counts from one pass over one gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub attempted: usize,
    /// Rows that moved to another status.
    pub advanced: usize,
    /// Rows left in place with a recorded failure.
    pub retried: usize,
    /// Rows another worker moved first, or that hit a storage error.
    pub skipped: usize,
}

impl PassStats {
    pub fn did_work(&self) -> bool {
        self.attempted > 0
    }

    pub fn merge(&mut self, other: PassStats) {
        self.attempted += other.attempted;
        self.advanced += other.advanced;
        self.retried += other.retried;
        self.skipped += other.skipped;
    }
}
