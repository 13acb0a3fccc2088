use crate::pipeline::types::{Category, Region, Sentiment};
use crate::prompt::common::{DONT_TELL_ME, JSON_ONLY};

/// Generate the prompt that re-checks a keyword-based region guess.
pub fn region_verification_prompt(title: &str, summary: &str, region: &str) -> String {
    format!(
        r#"## ARTICLE
Title: {title}
Summary: {summary}

### Question
A keyword filter guessed that this article is about {region}. Decide whether the article is
genuinely about events, people or institutions located in {region}.

Answer false when {region} only appears as shorthand for the national government, as a
dateline, or in a passing comparison. Answer null only when the text does not allow a decision.

### Output
{json_only}
{{
  "related": true | false | null,
  "rationale": "<one sentence>"
}}
{dont_tell_me}"#,
        title = title,
        summary = summary,
        region = region,
        json_only = JSON_ONLY,
        dont_tell_me = DONT_TELL_ME
    )
}

fn category_guidance(category: Category) -> &'static str {
    match (category.region, category.sentiment) {
        (Region::Beijing, Sentiment::Positive) => {
            "Local achievements in Beijing: new services, openings, culture, successful policy outcomes. \
             Favour stories residents would notice in daily life."
        }
        (Region::Beijing, Sentiment::Negative) => {
            "Local problems in Beijing: accidents, disruptions, public safety, pollution, service failures. \
             Favour stories with concrete impact on residents."
        }
        (Region::External, Sentiment::Positive) => {
            "Positive national or international stories: breakthroughs, agreements, records. \
             Favour stories with broad significance over routine announcements."
        }
        (Region::External, Sentiment::Negative) => {
            "Serious national or international incidents: disasters, conflicts, major economic shocks. \
             Favour stories with wide impact over isolated local incidents."
        }
    }
}

/// Generate the importance scoring prompt; the category selects the editorial guidance.
pub fn importance_prompt(category: Category, title: &str, summary: &str) -> String {
    format!(
        r#"## ARTICLE
Title: {title}
Summary: {summary}

### Editorial focus ({category})
{guidance}

### Task
Score how important this article is for tomorrow's briefing on a scale from 0 to 10, where 0 is
not worth including and 10 is a lead story. Judge only against the editorial focus above.

### Output
{json_only}
{{
  "score": <number between 0 and 10>,
  "rationale": "<one sentence>"
}}
{dont_tell_me}"#,
        title = title,
        summary = summary,
        category = category,
        guidance = category_guidance(category),
        json_only = JSON_ONLY,
        dont_tell_me = DONT_TELL_ME
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_importance_prompt_depends_on_category() {
        let prompts: Vec<String> = Category::all()
            .into_iter()
            .map(|c| importance_prompt(c, "Title", "Summary"))
            .collect();
        for (i, a) in prompts.iter().enumerate() {
            for b in &prompts[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(prompts[0].contains("\"score\""));
    }
}
