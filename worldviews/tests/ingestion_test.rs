mod support;

use chrono::{Duration as ChronoDuration, Utc};
use mockito::Matcher;
use std::time::Duration;

use support::{count, featured_ids, raw, setup_db};
use worldviews::ingestion;
use worldviews::news_api::{self, NewsApiClient};
use worldviews::storage::articles;

#[tokio::test]
async fn test_same_record_twice_is_new_then_skipped() {
    let pool = setup_db().await;
    let record = raw("https://x/a", "Fed signals rate cuts", "Powell says inflation is cooling", Utc::now());

    let first = ingestion::ingest(&pool, &[record.clone()]).await.expect("first ingest");
    assert_eq!(first.new.len(), 1);
    assert_eq!(first.total(), 1);

    let second = ingestion::ingest(&pool, &[record]).await.expect("second ingest");
    assert!(second.new.is_empty());
    assert!(second.updated.is_empty());
    assert_eq!(second.skipped.len(), 1);
    assert_eq!(second.skipped[0].id, first.new[0].id);

    assert_eq!(count(&pool, "articles").await, 1);
}

#[tokio::test]
async fn test_changed_summary_is_updated_in_place() {
    let pool = setup_db().await;
    let published = Utc::now();
    ingestion::ingest(&pool, &[raw("https://x/a", "Fed signals rate cuts", "v1", published)])
        .await
        .expect("ingest");

    let report = ingestion::ingest(&pool, &[raw("https://x/a", "Fed signals rate cuts", "v2", published)])
        .await
        .expect("re-ingest");

    assert_eq!(report.updated.len(), 1);
    assert_eq!(report.updated[0].summary.as_deref(), Some("v2"));
    assert_eq!(count(&pool, "articles").await, 1);
}

#[tokio::test]
async fn test_featured_set_tracks_three_most_recent_active_articles() {
    let pool = setup_db().await;
    let now = Utc::now();

    // fewer than three: all of them
    let report = ingestion::ingest(
        &pool,
        &[
            raw("https://x/1", "one", "s", now - ChronoDuration::hours(5)),
            raw("https://x/2", "two", "s", now - ChronoDuration::hours(4)),
        ],
    )
    .await
    .expect("ingest");
    let (one, two) = (report.new[0].id, report.new[1].id);
    assert_eq!(featured_ids(&pool).await, vec![one, two]);
    assert!(report.new.iter().all(|a| a.featured));

    let report = ingestion::ingest(
        &pool,
        &[
            raw("https://x/3", "three", "s", now - ChronoDuration::hours(3)),
            raw("https://x/4", "four", "s", now - ChronoDuration::hours(1)),
            // older than everything: never makes the cut
            raw("https://x/0", "zero", "s", now - ChronoDuration::hours(30)),
        ],
    )
    .await
    .expect("ingest");
    let three = report.new[0].id;
    let four = report.new[1].id;
    let zero = report.new[2].id;
    assert_eq!(featured_ids(&pool).await, vec![two, three, four]);
    assert!(!report.new[2].featured);

    // deactivating a featured article promotes the next most recent active one
    assert!(articles::deactivate_article(&pool, four).await.expect("deactivate"));
    assert_eq!(featured_ids(&pool).await, vec![one, two, three]);

    let inactive = articles::get_article(&pool, four).await.expect("get").expect("exists");
    assert!(!inactive.active);
    assert!(!inactive.featured);

    // a second deactivation is a no-op
    assert!(!articles::deactivate_article(&pool, four).await.expect("deactivate again"));

    let flagged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles WHERE featured = 1 AND active = 0")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(flagged, 0);
    assert!(!featured_ids(&pool).await.contains(&zero));
}

#[tokio::test]
async fn test_invalid_records_are_skipped_without_aborting_batch() {
    let pool = setup_db().await;
    let mut no_title = raw("https://x/b", "", "s", Utc::now());
    no_title.title = None;
    let mut bad_date = raw("https://x/c", "Bad date", "s", Utc::now());
    bad_date.published_at = Some("last tuesday".to_string());

    let report = ingestion::ingest(
        &pool,
        &[
            no_title,
            raw("https://x/a", "Good one", "s", Utc::now()),
            bad_date,
        ],
    )
    .await
    .expect("ingest");

    assert_eq!(report.invalid, 2);
    assert_eq!(report.new.len(), 1);
    assert_eq!(report.new[0].headline, "Good one");
    assert_eq!(count(&pool, "articles").await, 1);
}

#[tokio::test]
async fn test_watermark_defaults_to_a_week_ago_and_drives_staleness() {
    let pool = setup_db().await;

    let watermark = articles::last_fetch_time(&pool).await.expect("watermark");
    let expected = Utc::now() - ChronoDuration::days(7);
    assert!((watermark - expected).num_seconds().abs() < 5);
    assert!(articles::needs_sync(&pool).await.expect("needs sync"));

    let published = Utc::now() - ChronoDuration::hours(1);
    ingestion::ingest(&pool, &[raw("https://x/a", "fresh", "s", published)])
        .await
        .expect("ingest");

    let watermark = articles::last_fetch_time(&pool).await.expect("watermark");
    assert_eq!(watermark.timestamp(), published.timestamp());
    assert!(!articles::needs_sync(&pool).await.expect("needs sync"));
}

fn headlines_body(items: &[(&str, &str, &str)]) -> String {
    headlines_from("Wired", items)
}

fn headlines_from(source: &str, items: &[(&str, &str, &str)]) -> String {
    let articles: Vec<_> = items
        .iter()
        .map(|(url, title, published)| {
            serde_json::json!({
                "source": {"id": null, "name": source},
                "author": "Steven Levy",
                "title": title,
                "description": format!("About {}", title),
                "url": url,
                "urlToImage": null,
                "publishedAt": published,
                "content": "Teaser text [+2000 chars]"
            })
        })
        .collect();
    serde_json::json!({"status": "ok", "totalResults": articles.len(), "articles": articles}).to_string()
}

#[tokio::test]
async fn test_fetch_latest_filters_by_watermark_and_dedupes_across_categories() {
    let pool = setup_db().await;
    let old = (Utc::now() - ChronoDuration::hours(3)).to_rfc3339();
    ingestion::ingest(&pool, &[raw("https://x/seen", "Already here", "s", Utc::now() - ChronoDuration::hours(3))])
        .await
        .expect("seed");

    let fresh = (Utc::now() - ChronoDuration::minutes(10)).to_rfc3339();
    let stale = (Utc::now() - ChronoDuration::days(2)).to_rfc3339();

    let mut server = mockito::Server::new_async().await;
    let technology = server
        .mock("GET", "/top-headlines")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("apiKey".into(), "news-key".into()),
            Matcher::UrlEncoded("category".into(), "technology".into()),
            Matcher::UrlEncoded("pageSize".into(), "5".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(headlines_body(&[
            ("https://wired.com/new", "Quantum leap", &fresh),
            ("https://wired.com/old", "Yesterday's news", &stale),
            ("https://x/seen", "Already here", &old),
        ]))
        .create_async()
        .await;
    let business = server
        .mock("GET", "/top-headlines")
        .match_query(Matcher::UrlEncoded("category".into(), "business".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(headlines_body(&[("https://wired.com/new", "Quantum leap", &fresh)]))
        .create_async()
        .await;

    let client = NewsApiClient::new(server.url(), Some("news-key".to_string()), 5).expect("client");
    let report = news_api::fetch_latest(
        &pool,
        &client,
        &["technology".to_string(), "business".to_string()],
        5,
    )
    .await
    .expect("fetch latest");

    assert_eq!(report.new.len(), 1);
    assert_eq!(report.new[0].headline, "Quantum leap");
    assert_eq!(report.new[0].category, "technology");
    // first category that returned it
    assert_eq!(report.new[0].metadata_json()["fetched_category"], "technology");
    assert_eq!(count(&pool, "articles").await, 2);

    technology.assert_async().await;
    business.assert_async().await;
}

#[tokio::test]
async fn test_top_headlines_retries_server_errors_then_gives_up() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/top-headlines")
        .match_query(Matcher::Any)
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let client = NewsApiClient::new(server.url(), Some("news-key".to_string()), 5)
        .expect("client")
        .with_backoff_unit(Duration::from_millis(5));
    let err = client.top_headlines("general", 10).await.unwrap_err();

    assert!(format!("{:#}", err).contains("503"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_top_headlines_does_not_retry_client_errors() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/top-headlines")
        .match_query(Matcher::Any)
        .with_status(401)
        .expect(1)
        .create_async()
        .await;

    let client = NewsApiClient::new(server.url(), Some("bad-key".to_string()), 5).expect("client");
    assert!(client.top_headlines("general", 10).await.is_err());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_failing_category_does_not_abort_fetch() {
    let pool = setup_db().await;
    let fresh = Utc::now().to_rfc3339();

    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/top-headlines")
        .match_query(Matcher::UrlEncoded("category".into(), "science".into()))
        .with_status(403)
        .create_async()
        .await;
    server
        .mock("GET", "/top-headlines")
        .match_query(Matcher::UrlEncoded("category".into(), "general".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(headlines_body(&[("https://wired.com/a", "Still here", &fresh)]))
        .create_async()
        .await;

    let client = NewsApiClient::new(server.url(), Some("news-key".to_string()), 5).expect("client");
    let report = news_api::fetch_latest(&pool, &client, &["science".to_string(), "general".to_string()], 5)
        .await
        .expect("fetch latest");

    assert_eq!(report.new.len(), 1);
    assert_eq!(report.new[0].category, "technology");
}

#[tokio::test]
async fn test_category_comes_from_source_name_not_feed_category() {
    let pool = setup_db().await;
    let fresh = Utc::now().to_rfc3339();

    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/top-headlines")
        .match_query(Matcher::UrlEncoded("category".into(), "business".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(headlines_from("CNN", &[("https://cnn.com/vote", "Senate vote", &fresh)]))
        .create_async()
        .await;

    let client = NewsApiClient::new(server.url(), Some("news-key".to_string()), 5).expect("client");
    let report = news_api::fetch_latest(&pool, &client, &["business".to_string()], 5)
        .await
        .expect("fetch latest");

    assert_eq!(report.new.len(), 1);
    let stored = &report.new[0];
    assert_eq!(stored.category, "politics");
    assert_eq!(stored.metadata_json()["fetched_category"], "business");

    let mut unknown = raw("https://x/r", "Markets wobble", "s", Utc::now());
    unknown.source.name = Some("Reuters".to_string());
    unknown.fetched_category = Some("business".to_string());
    let report = ingestion::ingest(&pool, &[unknown]).await.expect("ingest");
    assert_eq!(report.new[0].category, "general");
}

#[tokio::test]
async fn test_latest_articles_lists_active_newest_first() {
    let pool = setup_db().await;
    let now = Utc::now();
    let report = ingestion::ingest(
        &pool,
        &[
            raw("https://x/1", "older", "s", now - ChronoDuration::hours(3)),
            raw("https://x/2", "newest", "s", now - ChronoDuration::minutes(5)),
            raw("https://x/3", "middle", "s", now - ChronoDuration::hours(1)),
        ],
    )
    .await
    .expect("ingest");
    let (older, newest, middle) = (report.new[0].id, report.new[1].id, report.new[2].id);

    let ids: Vec<i64> = articles::latest_articles(&pool, 10)
        .await
        .expect("latest")
        .iter()
        .map(|a| a.id)
        .collect();
    assert_eq!(ids, vec![newest, middle, older]);

    articles::deactivate_article(&pool, middle).await.expect("deactivate");
    let latest = articles::latest_articles(&pool, 1).await.expect("latest");
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].id, newest);
    assert_eq!(latest[0].metadata_json()["author"], "Greg Ip");
    let ids: Vec<i64> = articles::latest_articles(&pool, 10)
        .await
        .expect("latest")
        .iter()
        .map(|a| a.id)
        .collect();
    assert_eq!(ids, vec![newest, older]);
}

#[tokio::test]
async fn test_feed_teaser_does_not_replace_scraped_body() {
    let pool = setup_db().await;
    let published = Utc::now();
    let report = ingestion::ingest(&pool, &[raw("https://x/a", "Fed signals rate cuts", "v1", published)])
        .await
        .expect("ingest");
    let id = report.new[0].id;

    let scraped = "Federal Reserve officials signalled on Wednesday that rate cuts are coming. ".repeat(5);
    articles::store_full_content(&pool, id, &scraped).await.expect("store body");

    // summary changed, body is still the feed teaser
    let report = ingestion::ingest(&pool, &[raw("https://x/a", "Fed signals rate cuts", "v2", published)])
        .await
        .expect("re-ingest");
    assert_eq!(report.updated.len(), 1);
    assert_eq!(report.updated[0].summary.as_deref(), Some("v2"));
    assert_eq!(report.updated[0].full_content.as_deref(), Some(scraped.as_str()));

    // a complete body from the feed still replaces it
    let mut complete = raw("https://x/a", "Fed signals rate cuts", "v3", published);
    complete.content = Some("The whole story, no teaser marker.".to_string());
    let report = ingestion::ingest(&pool, &[complete]).await.expect("re-ingest");
    assert_eq!(
        report.updated[0].full_content.as_deref(),
        Some("The whole story, no teaser marker.")
    );
}

#[tokio::test]
async fn test_teaser_replaces_teaser_on_update() {
    let pool = setup_db().await;
    let published = Utc::now();
    ingestion::ingest(&pool, &[raw("https://x/a", "Fed signals rate cuts", "v1", published)])
        .await
        .expect("ingest");
    let report = ingestion::ingest(&pool, &[raw("https://x/a", "Fed signals rate cuts", "v2", published)])
        .await
        .expect("re-ingest");
    assert_eq!(report.updated[0].full_content.as_deref(), Some("v2 [+1200 chars]"));
}
