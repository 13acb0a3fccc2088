use regex::Regex;
use tracing::warn;

/// Case-insensitive keyword matcher.
///
/// Latin keywords must match on word boundaries ("rain" does not match "training"); keywords
/// in scripts without spaces (e.g. "北京") match anywhere.
#[derive(Debug, Clone)]
pub struct KeywordFilter {
    patterns: Vec<(String, Regex)>,
}

impl KeywordFilter {
    pub fn new(keywords: &[String]) -> Self {
        let mut patterns = Vec::new();
        for keyword in keywords {
            let keyword = keyword.trim();
            if keyword.is_empty() {
                continue;
            }
            match Regex::new(&keyword_pattern(keyword)) {
                Ok(regex) => patterns.push((keyword.to_string(), regex)),
                Err(e) => warn!("Skipping keyword {:?}: {}", keyword, e),
            }
        }
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Keywords found in `title` or `body`, in configuration order.
    pub fn matches(&self, title: &str, body: &str) -> Vec<String> {
        self.patterns
            .iter()
            .filter(|(_, regex)| regex.is_match(title) || regex.is_match(body))
            .map(|(keyword, _)| keyword.clone())
            .collect()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.patterns.iter().any(|(_, regex)| regex.is_match(text))
    }
}

fn keyword_pattern(keyword: &str) -> String {
    let starts_ascii = keyword
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric());
    let ends_ascii = keyword
        .chars()
        .last()
        .is_some_and(|c| c.is_ascii_alphanumeric());

    format!(
        "(?i){}{}{}",
        if starts_ascii { r"\b" } else { "" },
        regex::escape(keyword),
        if ends_ascii { r"\b" } else { "" }
    )
}
