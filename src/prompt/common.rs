use chrono::Local;

// Common text blocks for all prompts
pub const DONT_TELL_ME: &str = r#"
Important instructions for your responses:

1. Do not narrate or describe your actions.
2. Do not summarize or restate the instructions I've given you.
3. Do not preface your responses with phrases like "Here's a summary..." or "I will now..."
4. Do not acknowledge or confirm that you understand these instructions.
5. Avoid phrases like "As an AI language model..." or similar self-referential statements.
"#;

pub const JSON_ONLY: &str = r#"
Respond with a single JSON object and nothing else: no Markdown fences, no commentary before or
after it. Use exactly the keys shown. Strings must be valid JSON strings.
"#;

/// Utility function to get the current date in a human-readable format
pub fn current_date() -> String {
    let today = Local::now();
    format!(
        "{} {}, {}",
        today.format("%B"),
        today.format("%-d"),
        today.format("%Y")
    )
}

/// Publication and current date block shared by the article prompts.
pub fn dates_block(published_at: Option<i64>) -> String {
    let publication_date = published_at
        .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
        .map(|dt| format!("Publication date: {}\n", dt.format("%B %-d, %Y")))
        .unwrap_or_default();

    format!("{}Today's date: {}", publication_date, current_date())
}
