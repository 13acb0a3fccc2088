use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::pipeline::types::{Category, Sentiment};

/// Retrieves an environment variable and splits it into a vector of strings based on a delimiter.
///
/// Empty segments are dropped, so an unset variable yields an empty vector.
pub fn get_env_var_as_vec(var: &str, delimiter: char) -> Vec<String> {
    env::var(var)
        .unwrap_or_default()
        .split(delimiter)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Reads `var` and parses it, falling back to `default` when unset or invalid.
pub fn get_env_var_or<T: FromStr>(var: &str, default: T) -> T {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Ignoring invalid value for {}: {:?}", var, value);
                default
            }
        },
        Err(_) => default,
    }
}

/// Tuning knobs shared by every worker and the API.
#[derive(Clone, Debug)]
pub struct Settings {
    pub database_path: String,
    pub keywords: Vec<String>,
    pub region_keywords: Vec<String>,
    pub relevance_threshold: f64,
    pub simhash_max_distance: u32,
    pub cluster_similarity_threshold: f64,
    pub cluster_candidate_cap: i64,
    pub cluster_lock_ttl: Duration,
    pub cluster_refresh_interval: Duration,
    pub gate_max_retries: i64,
    pub gate_cooldown: Duration,
    pub llm_timeout: Duration,
    pub worker_concurrency: usize,
    pub batch_size: i64,
    pub importance_thresholds: BTreeMap<Category, f64>,
    pub sentiment_min_confidence: f64,
    pub external_sentiments: BTreeSet<Sentiment>,
    pub ollama_host: String,
    pub ollama_port: u16,
    pub ollama_model: String,
    pub llm_temperature: f32,
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: "newsroom.db".to_string(),
            keywords: Vec::new(),
            region_keywords: vec!["beijing".to_string(), "北京".to_string()],
            relevance_threshold: 0.6,
            simhash_max_distance: 3,
            cluster_similarity_threshold: 0.6,
            cluster_candidate_cap: 5000,
            cluster_lock_ttl: Duration::from_secs(600),
            cluster_refresh_interval: Duration::from_secs(300),
            gate_max_retries: 3,
            gate_cooldown: Duration::from_secs(300),
            llm_timeout: Duration::from_secs(120),
            worker_concurrency: 4,
            batch_size: 50,
            importance_thresholds: Category::all().into_iter().map(|c| (c, 6.0)).collect(),
            sentiment_min_confidence: 0.5,
            external_sentiments: [Sentiment::Positive, Sentiment::Negative]
                .into_iter()
                .collect(),
            ollama_host: "http://localhost".to_string(),
            ollama_port: 11434,
            ollama_model: "llama3.1".to_string(),
            llm_temperature: 0.0,
            port: 8080,
        }
    }
}

impl Settings {
    /// Loads settings from the environment, keeping the default for anything unset.
    pub fn from_env() -> Self {
        let defaults = Settings::default();

        let region_keywords = get_env_var_as_vec("REGION_KEYWORDS", ';');
        let external_sentiments: BTreeSet<Sentiment> = get_env_var_as_vec("EXTERNAL_SENTIMENTS", ';')
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();

        Self {
            database_path: env::var("DATABASE_PATH").unwrap_or(defaults.database_path),
            keywords: get_env_var_as_vec("KEYWORDS", ';'),
            region_keywords: if region_keywords.is_empty() {
                defaults.region_keywords
            } else {
                region_keywords
            },
            relevance_threshold: get_env_var_or("RELEVANCE_THRESHOLD", defaults.relevance_threshold),
            simhash_max_distance: get_env_var_or(
                "SIMHASH_MAX_DISTANCE",
                defaults.simhash_max_distance,
            ),
            cluster_similarity_threshold: get_env_var_or(
                "CLUSTER_SIMILARITY_THRESHOLD",
                defaults.cluster_similarity_threshold,
            ),
            cluster_candidate_cap: get_env_var_or(
                "CLUSTER_CANDIDATE_CAP",
                defaults.cluster_candidate_cap,
            ),
            cluster_lock_ttl: Duration::from_secs(get_env_var_or(
                "CLUSTER_LOCK_TTL_SECS",
                defaults.cluster_lock_ttl.as_secs(),
            )),
            cluster_refresh_interval: Duration::from_secs(get_env_var_or(
                "CLUSTER_REFRESH_INTERVAL_SECS",
                defaults.cluster_refresh_interval.as_secs(),
            )),
            gate_max_retries: get_env_var_or("GATE_MAX_RETRIES", defaults.gate_max_retries),
            gate_cooldown: Duration::from_secs(get_env_var_or(
                "GATE_COOLDOWN_SECS",
                defaults.gate_cooldown.as_secs(),
            )),
            llm_timeout: Duration::from_secs(get_env_var_or(
                "LLM_TIMEOUT_SECS",
                defaults.llm_timeout.as_secs(),
            )),
            worker_concurrency: get_env_var_or("WORKER_CONCURRENCY", defaults.worker_concurrency)
                .max(1),
            batch_size: get_env_var_or("BATCH_SIZE", defaults.batch_size).max(1),
            importance_thresholds: parse_importance_thresholds(
                &get_env_var_as_vec("IMPORTANCE_THRESHOLDS", ';'),
                defaults.importance_thresholds,
            ),
            sentiment_min_confidence: get_env_var_or(
                "SENTIMENT_MIN_CONFIDENCE",
                defaults.sentiment_min_confidence,
            ),
            external_sentiments: if external_sentiments.is_empty() {
                defaults.external_sentiments
            } else {
                external_sentiments
            },
            ollama_host: env::var("OLLAMA_HOST").unwrap_or(defaults.ollama_host),
            ollama_port: get_env_var_or("OLLAMA_PORT", defaults.ollama_port),
            ollama_model: env::var("OLLAMA_MODEL").unwrap_or(defaults.ollama_model),
            llm_temperature: get_env_var_or("LLM_TEMPERATURE", defaults.llm_temperature),
            port: get_env_var_or("PORT", defaults.port),
        }
    }

    /// Acceptance threshold for the importance judge in the given category.
    pub fn importance_threshold(&self, category: Category) -> f64 {
        self.importance_thresholds
            .get(&category)
            .copied()
            .unwrap_or(6.0)
    }
}

/// Parses `category=value` pairs on top of `defaults`; unknown or malformed pairs are skipped.
pub fn parse_importance_thresholds(
    pairs: &[String],
    defaults: BTreeMap<Category, f64>,
) -> BTreeMap<Category, f64> {
    let mut thresholds = defaults;
    for pair in pairs {
        let Some((name, value)) = pair.split_once('=') else {
            warn!("Ignoring malformed importance threshold: {}", pair);
            continue;
        };
        match (name.trim().parse::<Category>(), value.trim().parse::<f64>()) {
            (Ok(category), Ok(value)) => {
                thresholds.insert(category, value);
            }
            _ => warn!("Ignoring malformed importance threshold: {}", pair),
        }
    }
    thresholds
}
