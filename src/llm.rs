//! Narrow request/response collaborators the pipeline and cluster refresh call out to.
//!
//! The pipeline only sees the traits; [`OllamaJudge`] backs the three LLM traits, while
//! sentiment and headline grouping have local defaults.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::generation::options::GenerationOptions;
use ollama_rs::Ollama;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strsim::normalized_levenshtein;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;

use crate::environment::Settings;
use crate::fingerprint::normalize_tokens;
use crate::pipeline::state::RegionVerdict;
use crate::pipeline::types::{Category, Sentiment};
use crate::prompt;
use crate::TARGET_LLM_REQUEST;

#[derive(Debug, Clone, Serialize)]
pub struct SummaryRequest {
    pub title: String,
    pub body: String,
    pub matched_keywords: Vec<String>,
    pub published_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub summary: String,
    pub relevance_score: f64,
    #[serde(default)]
    pub detected_source: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionRequest {
    pub title: String,
    pub summary: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportanceRequest {
    pub title: String,
    pub summary: String,
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportanceResponse {
    pub score: f64,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SentimentResponse {
    pub sentiment: Sentiment,
    pub confidence: f64,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryResponse>;
}

/// Errors are transport failures; an unusable answer is `RegionVerdict::Inconclusive`.
#[async_trait]
pub trait RegionVerifier: Send + Sync {
    async fn verify_region(&self, request: &RegionRequest) -> Result<RegionVerdict>;
}

#[async_trait]
pub trait ImportanceJudge: Send + Sync {
    async fn score_importance(&self, request: &ImportanceRequest) -> Result<ImportanceResponse>;
}

#[async_trait]
pub trait SentimentClassifier: Send + Sync {
    async fn classify_sentiment(&self, title: &str, summary: &str) -> Result<SentimentResponse>;
}

/// Assigns each title (in the given order) a group number; group numbers count up from 0 in
/// order of first appearance.
#[async_trait]
pub trait HeadlineGrouper: Send + Sync {
    async fn group_headlines(&self, titles: &[String], threshold: f64) -> Result<Vec<usize>>;
}

/// LLM collaborators backed by an Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaJudge {
    ollama: Ollama,
    model: String,
    temperature: f32,
    max_attempts: u32,
}

impl OllamaJudge {
    pub fn new(ollama: Ollama, model: &str, temperature: f32) -> Self {
        Self {
            ollama,
            model: model.to_string(),
            temperature,
            max_attempts: 2,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        info!(target: TARGET_LLM_REQUEST, "Connecting to Ollama at {}:{}", settings.ollama_host, settings.ollama_port);
        let ollama = Ollama::new(settings.ollama_host.clone(), settings.ollama_port);
        Self::new(ollama, &settings.ollama_model, settings.llm_temperature)
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let mut backoff = 2;
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let mut request = GenerationRequest::new(self.model.clone(), prompt.to_string());
            request.options = Some(GenerationOptions::default().temperature(self.temperature));

            debug!(target: TARGET_LLM_REQUEST, "Sending LLM request to {} (attempt {}/{})", self.model, attempt, self.max_attempts);
            match self.ollama.generate(request).await {
                Ok(response) if !response.response.trim().is_empty() => {
                    debug!(target: TARGET_LLM_REQUEST, "LLM response received: {}", response.response);
                    return Ok(response.response);
                }
                Ok(_) => {
                    warn!(target: TARGET_LLM_REQUEST, "Empty LLM response (attempt {}/{})", attempt, self.max_attempts);
                    last_error = Some(anyhow!("empty response"));
                }
                Err(e) => {
                    warn!(target: TARGET_LLM_REQUEST, "Error generating response (attempt {}/{}): {}", attempt, self.max_attempts, e);
                    last_error = Some(anyhow!("ollama request failed: {}", e));
                }
            }

            if attempt < self.max_attempts {
                sleep(Duration::from_secs(backoff)).await;
                backoff *= 2;
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("no LLM attempts were made")))
    }
}

/// Cuts the outermost JSON object out of a model answer, tolerating fences or chatter around it.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_json<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T> {
    let json = extract_json_object(text).ok_or_else(|| anyhow!("no JSON object in response"))?;
    serde_json::from_str(json).context("malformed JSON in LLM response")
}

#[derive(Debug, Deserialize)]
struct RegionAnswer {
    related: Option<bool>,
    #[serde(default)]
    rationale: String,
}

/// Maps a raw region answer to the three-valued verdict; anything unusable is inconclusive.
pub fn parse_region_verdict(text: &str) -> RegionVerdict {
    match parse_json::<RegionAnswer>(text) {
        Ok(RegionAnswer {
            related: Some(true),
            rationale,
        }) => RegionVerdict::ConfirmedRelated { rationale },
        Ok(RegionAnswer {
            related: Some(false),
            rationale,
        }) => RegionVerdict::ConfirmedUnrelated { rationale },
        Ok(RegionAnswer {
            related: None,
            rationale,
        }) => RegionVerdict::Inconclusive { reason: rationale },
        Err(e) => RegionVerdict::Inconclusive {
            reason: format!("{:#}", e),
        },
    }
}

#[async_trait]
impl Summarizer for OllamaJudge {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryResponse> {
        let prompt = prompt::summary_prompt(
            &request.title,
            &request.body,
            &request.matched_keywords,
            request.published_at,
        );
        let response = self.generate(&prompt).await?;
        let mut parsed: SummaryResponse = parse_json(&response)?;
        if parsed.summary.trim().is_empty() {
            return Err(anyhow!("LLM returned an empty summary"));
        }
        parsed.relevance_score = parsed.relevance_score.clamp(0.0, 1.0);
        parsed.detected_source = parsed
            .detected_source
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Ok(parsed)
    }
}

#[async_trait]
impl RegionVerifier for OllamaJudge {
    async fn verify_region(&self, request: &RegionRequest) -> Result<RegionVerdict> {
        let prompt =
            prompt::region_verification_prompt(&request.title, &request.summary, &request.region);
        let response = self.generate(&prompt).await?;
        Ok(parse_region_verdict(&response))
    }
}

#[async_trait]
impl ImportanceJudge for OllamaJudge {
    async fn score_importance(&self, request: &ImportanceRequest) -> Result<ImportanceResponse> {
        let prompt = prompt::importance_prompt(request.category, &request.title, &request.summary);
        let response = self.generate(&prompt).await?;
        let parsed: ImportanceResponse = parse_json(&response)?;
        if !parsed.score.is_finite() {
            return Err(anyhow!("importance score is not a number"));
        }
        Ok(parsed)
    }
}

const POSITIVE_WORDS: &[&str] = &[
    "award", "boost", "celebrate", "growth", "improve", "improved", "launch", "opens", "record",
    "recovery", "success", "successful", "win", "wins", "breakthrough", "agreement", "upgrade",
    "成功", "增长", "开通", "突破", "获奖", "改善", "庆祝", "提升",
];

const NEGATIVE_WORDS: &[&str] = &[
    "accident", "attack", "collapse", "crash", "crisis", "dead", "death", "disaster", "fire",
    "flood", "injured", "killed", "outage", "pollution", "protest", "scandal", "storm", "war",
    "事故", "死亡", "火灾", "洪水", "污染", "受伤", "危机", "暴雨", "停电",
];

/// Word-list sentiment. Confidence is the share of hits on the winning side, scaled down when
/// there are few hits; no hits at all gives `Positive` with confidence 0.
#[derive(Debug, Clone, Default)]
pub struct LexiconSentiment;

impl LexiconSentiment {
    pub fn score(&self, text: &str) -> SentimentResponse {
        let normalized: String = text.nfkc().collect::<String>().to_lowercase();
        let tokens = normalize_tokens(&normalized);
        let count = |words: &[&str]| -> usize {
            words
                .iter()
                .map(|word| {
                    if word.is_ascii() {
                        tokens.iter().filter(|t| t.as_str() == *word).count()
                    } else {
                        normalized.matches(word).count()
                    }
                })
                .sum()
        };

        let positive = count(POSITIVE_WORDS) as f64;
        let negative = count(NEGATIVE_WORDS) as f64;
        let total = positive + negative;
        if total == 0.0 {
            return SentimentResponse {
                sentiment: Sentiment::Positive,
                confidence: 0.0,
            };
        }

        let (sentiment, winning) = if negative > positive {
            (Sentiment::Negative, negative)
        } else {
            (Sentiment::Positive, positive)
        };
        // a single hit is weak evidence
        let support = (total / 3.0).min(1.0);
        SentimentResponse {
            sentiment,
            confidence: (winning / total) * support,
        }
    }
}

#[async_trait]
impl SentimentClassifier for LexiconSentiment {
    async fn classify_sentiment(&self, title: &str, summary: &str) -> Result<SentimentResponse> {
        Ok(self.score(&format!("{}\n{}", title, summary)))
    }
}

/// Greedy headline grouping on normalized Levenshtein similarity. Each title joins the first
/// group whose representative (first member) is more than `threshold` similar; empty titles
/// always start their own group.
#[derive(Debug, Clone, Default)]
pub struct StrsimHeadlineGrouper;

fn normalize_title(title: &str) -> String {
    title
        .nfkc()
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl HeadlineGrouper for StrsimHeadlineGrouper {
    async fn group_headlines(&self, titles: &[String], threshold: f64) -> Result<Vec<usize>> {
        let mut representatives: Vec<Option<String>> = Vec::new();
        let mut assignment = Vec::with_capacity(titles.len());

        for title in titles {
            let normalized = normalize_title(title);
            let group = if normalized.is_empty() {
                None
            } else {
                representatives.iter().position(|rep| {
                    rep.as_deref()
                        .is_some_and(|rep| normalized_levenshtein(rep, &normalized) > threshold)
                })
            };

            match group {
                Some(group) => assignment.push(group),
                None => {
                    assignment.push(representatives.len());
                    representatives.push((!normalized.is_empty()).then_some(normalized));
                }
            }
        }

        Ok(assignment)
    }
}
