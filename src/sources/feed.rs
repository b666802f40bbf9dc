//! Provides a fetcher for Atom and RSS feeds.
//!
//! Most of the upstream services we aggregate (news, blogs, release announcements) publish
//! their data as a feed. This fetcher downloads a feed via HTTP(S) and turns each
//! **&lt;entry&gt;** (Atom) or **&lt;item&gt;** (RSS) into a cacheable item carrying the fields
//! **id**, **title**, **link** and **updated** (seconds since the epoch).
//!
//! The **updated** field is what makes these items participate in freshness filtering, the
//! **id** field is what makes them usable within keyed containers.
use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use chrono::DateTime;
use hyper::{Body, Client, Uri};
use hyper_tls::HttpsConnector;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::json;

use crate::sources::{Fetcher, Item};

/// Fetches items from an Atom or RSS feed.
///
/// # Example
///
/// ```no_run
/// # use aquifer::sources::feed::FeedSource;
/// # use aquifer::sources::Fetcher;
/// # #[tokio::main]
/// # async fn main() {
/// let source = FeedSource::new("https://www.example.com/news.xml");
/// let items = source.fetch_items().await.unwrap();
/// # }
/// ```
pub struct FeedSource {
    url: String,
}

impl FeedSource {
    /// Creates a new source reading the feed behind the given URL.
    pub fn new(url: impl AsRef<str>) -> Self {
        FeedSource {
            url: url.as_ref().to_owned(),
        }
    }
}

#[async_trait]
impl Fetcher for FeedSource {
    async fn fetch_items(&self) -> anyhow::Result<Vec<Item>> {
        let response = if self.url.starts_with("https") {
            let https = HttpsConnector::new();
            let client = Client::builder().build::<_, Body>(https);
            client
                .get(Uri::from_str(&self.url).context("Invalid feed uri")?)
                .await
                .context("Failed to fetch feed.")?
        } else {
            let client = Client::new();
            client
                .get(Uri::from_str(&self.url).context("Invalid feed uri")?)
                .await
                .context("Failed to fetch feed.")?
        };

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Fetching feed {} failed with status {}",
                &self.url,
                response.status()
            ));
        }

        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .context("Failed to read feed body.")?;

        parse_feed(String::from_utf8_lossy(&bytes).as_ref())
    }
}

/// Parses the given feed document into a list of items.
///
/// Both Atom (**entry** elements) and RSS (**item** elements) are understood. Entries without
/// any identifying field are skipped, entries without a parseable timestamp are kept (they
/// simply never count as "fresh" during a merge).
pub fn parse_feed(data: &str) -> anyhow::Result<Vec<Item>> {
    let mut reader = Reader::from_str(data);
    let _ = reader.trim_text(true);

    let mut items = Vec::new();
    let mut buf = Vec::new();

    let mut in_entry = false;
    let mut field: Option<String> = None;
    let mut id: Option<String> = None;
    let mut title: Option<String> = None;
    let mut link: Option<String> = None;
    let mut updated: Option<f64> = None;

    loop {
        match reader.read_event(&mut buf) {
            Ok(Event::Start(element)) => match element.name() {
                b"entry" | b"item" => {
                    in_entry = true;
                    id = None;
                    title = None;
                    link = None;
                    updated = None;
                }
                name if in_entry => {
                    field = Some(String::from_utf8_lossy(name).to_string());
                }
                _ => {}
            },
            Ok(Event::Empty(element)) => {
                // Atom represents links as <link href="..."/> - an empty element...
                if in_entry && element.name() == b"link" {
                    for attribute in element.attributes().flatten() {
                        if attribute.key == b"href" {
                            link = attribute.unescape_and_decode_value(&reader).ok();
                        }
                    }
                }
            }
            Ok(Event::Text(text)) | Ok(Event::CData(text)) => {
                if in_entry {
                    if let Ok(value) = text.unescape_and_decode(&reader) {
                        match field.as_deref() {
                            Some("id") | Some("guid") => id = Some(value),
                            Some("title") => title = Some(value),
                            Some("link") => link = Some(value),
                            Some("updated") | Some("published") | Some("pubDate") => {
                                updated = parse_timestamp(&value)
                            }
                            _ => {}
                        }
                    }
                }
            }
            Ok(Event::End(element)) => match element.name() {
                b"entry" | b"item" => {
                    in_entry = false;
                    if let Some(item) = build_item(&id, &title, &link, updated) {
                        items.push(item);
                    }
                }
                _ => field = None,
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(error) => {
                return Err(anyhow::anyhow!("Failed to parse feed: {}", error));
            }
        }

        buf.clear();
    }

    Ok(items)
}

/// Parses a feed timestamp into seconds since the epoch.
///
/// Atom uses RFC 3339 timestamps, RSS uses RFC 2822 ones. We try both, as real-world feeds
/// freely mix the formats.
fn parse_timestamp(value: &str) -> Option<f64> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_rfc2822(value))
        .ok()
        .map(|timestamp| timestamp.timestamp() as f64)
}

fn build_item(
    id: &Option<String>,
    title: &Option<String>,
    link: &Option<String>,
    updated: Option<f64>,
) -> Option<Item> {
    // Without any identifying field there is nothing useful to cache...
    let effective_id = id
        .clone()
        .or_else(|| link.clone())
        .or_else(|| title.clone())?;

    let mut item = json!({ "id": effective_id });
    if let Some(title) = title {
        item["title"] = json!(title);
    }
    if let Some(link) = link {
        item["link"] = json!(link);
    }
    if let Some(updated) = updated {
        item["updated"] = json!(updated);
    }

    Some(item)
}
