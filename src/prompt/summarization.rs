use crate::prompt::common::{dates_block, DONT_TELL_ME, JSON_ONLY};

/// Generate the relevance + summary prompt for a freshly resolved primary article.
pub fn summary_prompt(
    title: &str,
    body: &str,
    matched_keywords: &[String],
    published_at: Option<i64>,
) -> String {
    format!(
        r#"{dates}

## ARTICLE
Title: {title}
----------
{body}
----------

The article was picked up because it mentions: {keywords}

### Task
1. Decide how relevant the article is to news about Beijing and China for a daily briefing.
   A passing mention of a keyword is low relevance; an article whose main subject is the
   keyword topic is high relevance.
2. Write a neutral summary of two to four sentences in Simplified Chinese. Keep names, numbers
   and dates exactly as reported. Do not add facts that are not in the article.
3. Name the original publisher if the article says it is republished from another outlet
   (for example "据新华社报道" or "(Reuters)"). Otherwise use null.

### Output
{json_only}
{{
  "summary": "<summary>",
  "relevance_score": <number between 0.0 and 1.0>,
  "detected_source": "<publisher>" or null
}}
{dont_tell_me}"#,
        dates = dates_block(published_at),
        title = title,
        body = body,
        keywords = matched_keywords.join(", "),
        json_only = JSON_ONLY,
        dont_tell_me = DONT_TELL_ME
    )
}
