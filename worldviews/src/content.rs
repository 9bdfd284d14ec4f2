//! Turns an article's stored fields into provider input for each content tier.

use crate::models::Article;

/// NewsAPI cuts `content` at ~200 chars and appends "[+1234 chars]"
pub const TRUNCATION_MARKER: &str = "[+";

/// Stored body text, if it is present and not a truncated teaser
pub fn usable_full_content(article: &Article) -> Option<&str> {
    article
        .full_content
        .as_deref()
        .map(str::trim)
        .filter(|body| !body.is_empty() && !looks_truncated(body))
}

pub fn looks_truncated(body: &str) -> bool {
    body.contains(TRUNCATION_MARKER)
}

/// "Headline. Summary" (summary omitted when blank)
pub fn headline_with_summary(article: &Article) -> String {
    let mut text = article.headline.clone();
    if let Some(summary) = article.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        text.push_str(". ");
        text.push_str(summary.trim());
    }
    text
}

/// Best available text for a quick take: full body, else headline + summary
pub fn for_quick_take(article: &Article) -> String {
    match usable_full_content(article) {
        Some(body) => body.to_string(),
        None => headline_with_summary(article),
    }
}

/// Labelled layout for the detailed tier
pub fn for_detailed_analysis(article: &Article, full_text: &str) -> String {
    format!(
        "HEADLINE: {}\n\nSOURCE: {}\n\nFULL ARTICLE:\n{}\n",
        article.headline, article.source, full_text
    )
}

/// User message shared by both tiers
pub fn user_message(news_content: &str) -> String {
    format!("React to this news: {}", news_content)
}

#[cfg(test)]
pub(crate) fn article_fixture() -> Article {
    let now = chrono::Utc::now();
    Article {
        id: 1,
        external_id: "abc".to_string(),
        headline: "Fed signals rate cuts".to_string(),
        summary: Some("Powell says inflation is cooling".to_string()),
        full_content: None,
        source: "Wall Street Journal".to_string(),
        source_url: Some("https://wsj.com/fed".to_string()),
        image_url: None,
        published_at: now,
        category: "business".to_string(),
        active: true,
        featured: false,
        metadata: "{}".to_string(),
        created_at: now,
        updated_at: now,
    }
}
