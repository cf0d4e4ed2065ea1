//! Source adapter contract + the two configurable adapter variants (HTML listing, JSON feed).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evcat_core::{Candidate, Coordinates, Price};
use evcat_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "evcat-adapters";

/// Where an adapter reads its listings from during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestMode {
    #[default]
    Fixture,
    Live,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub mode: HarvestMode,
    /// Fixture paths in adapter specs are relative to this directory.
    pub workspace_root: PathBuf,
}

/// One adapter run: candidates in page order plus items that had no usable title.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterOutput {
    pub candidates: Vec<Candidate>,
    pub extraction_failures: usize,
}

impl AdapterOutput {
    fn extend(&mut self, other: AdapterOutput) {
        self.candidates.extend(other.candidates);
        self.extraction_failures += other.extraction_failures;
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn produce_candidates(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<AdapterOutput, AdapterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub source_id: String,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    pub raw_artifact: FixtureRawArtifact,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureRawArtifact {
    pub content_type: String,
    pub path: Option<String>,
    pub inline_text: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let mut bundle: FixtureBundle = read_json_file(path)?;
    hydrate_inline_raw_artifact(path, &mut bundle)?;
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn hydrate_inline_raw_artifact(bundle_path: &Path, bundle: &mut FixtureBundle) -> Result<()> {
    if bundle.raw_artifact.inline_text.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &bundle.raw_artifact.path else {
        return Ok(());
    };
    let raw_path = bundle_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(rel_path);
    let raw = fs::read_to_string(&raw_path)
        .with_context(|| format!("reading fixture raw artifact {}", raw_path.display()))?;
    bundle.raw_artifact.inline_text = Some(raw);
    Ok(())
}

/// Adapter configuration as written in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSpec {
    HtmlListing(HtmlListingSpec),
    JsonFeed(JsonFeedSpec),
}

impl AdapterSpec {
    pub fn fixture(&self) -> Option<&str> {
        match self {
            AdapterSpec::HtmlListing(spec) => spec.fixture.as_deref(),
            AdapterSpec::JsonFeed(spec) => spec.fixture.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtmlListingSpec {
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub fixture: Option<String>,
    pub selectors: HtmlSelectors,
}

/// CSS selectors evaluated inside each `item` element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlSelectors {
    pub item: String,
    pub title: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default = "default_link_selector")]
    pub link: String,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

fn default_link_selector() -> String {
    "a[href]".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonFeedSpec {
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub fixture: Option<String>,
    /// Dotted path to the event array; empty means the document root.
    #[serde(default)]
    pub items_path: String,
    pub fields: JsonFieldMap,
}

/// Dotted paths inside one feed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonFieldMap {
    pub title: String,
    #[serde(default)]
    pub date_text: Option<String>,
    #[serde(default)]
    pub machine_date: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub coordinates: Option<String>,
}

pub fn adapter_for_source(
    source_id: &str,
    spec: &AdapterSpec,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match spec {
        AdapterSpec::HtmlListing(spec) => Ok(Box::new(HtmlListingAdapter::new(source_id, spec.clone())?)),
        AdapterSpec::JsonFeed(spec) => Ok(Box::new(JsonFeedAdapter::new(source_id, spec.clone()))),
    }
}

fn load_source_bundle(
    source_id: &str,
    fixture: Option<&str>,
    ctx: &AdapterContext,
) -> Result<(String, String), AdapterError> {
    let rel = fixture.ok_or_else(|| {
        AdapterError::Message(format!("source {source_id} has no fixture configured"))
    })?;
    let bundle = load_fixture_bundle(ctx.workspace_root.join(rel))?;
    if bundle.source_id != source_id {
        return Err(AdapterError::Message(format!(
            "bundle source_id={} does not match adapter source_id={}",
            bundle.source_id, source_id
        )));
    }
    debug!(
        source_id,
        captured_from = %bundle.captured_from_url,
        fetched_at = %bundle.fetched_at,
        "loaded fixture bundle"
    );
    let text = bundle.raw_artifact.inline_text.ok_or_else(|| {
        AdapterError::Message(format!("fixture for {source_id} has no raw artifact"))
    })?;
    Ok((bundle.captured_from_url, text))
}

/// Pages to parse this run as `(base_url, body)` pairs.
async fn collect_pages(
    source_id: &str,
    fixture: Option<&str>,
    listing_urls: &[String],
    http: &HttpFetcher,
    ctx: &AdapterContext,
) -> Result<Vec<(String, String)>, AdapterError> {
    match ctx.mode {
        HarvestMode::Fixture => Ok(vec![load_source_bundle(source_id, fixture, ctx)?]),
        HarvestMode::Live => {
            if listing_urls.is_empty() {
                return Err(AdapterError::Message(format!(
                    "source {source_id} has no listing_urls for live mode"
                )));
            }
            let mut pages = Vec::with_capacity(listing_urls.len());
            for url in listing_urls {
                let body = http.get_text(source_id, url).await?;
                pages.push((body.final_url, body.text));
            }
            Ok(pages)
        }
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn resolve_link(base: Option<&Url>, href: &str) -> String {
    match base.and_then(|b| b.join(href).ok()) {
        Some(url) => url.to_string(),
        None => href.to_string(),
    }
}

struct CompiledSelectors {
    item: Selector,
    title: Selector,
    date: Option<Selector>,
    link: Selector,
    venue: Option<Selector>,
    image: Option<Selector>,
    description: Option<Selector>,
    category: Option<Selector>,
    price: Option<Selector>,
    address: Option<Selector>,
    time_tag: Selector,
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn parse_optional(selector: &Option<String>) -> Result<Option<Selector>, AdapterError> {
    selector.as_deref().map(parse_selector).transpose()
}

impl CompiledSelectors {
    fn compile(spec: &HtmlSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            item: parse_selector(&spec.item)?,
            title: parse_selector(&spec.title)?,
            date: parse_optional(&spec.date)?,
            link: parse_selector(&spec.link)?,
            venue: parse_optional(&spec.venue)?,
            image: parse_optional(&spec.image)?,
            description: parse_optional(&spec.description)?,
            category: parse_optional(&spec.category)?,
            price: parse_optional(&spec.price)?,
            address: parse_optional(&spec.address)?,
            time_tag: parse_selector("time[datetime]")?,
        })
    }
}

fn first_text(item: &ElementRef<'_>, selector: Option<&Selector>) -> Option<String> {
    let selector = selector?;
    item.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<Vec<_>>().join(" ")))
}

fn first_attr(item: &ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    item.select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// Listing page adapter driven by CSS selectors.
pub struct HtmlListingAdapter {
    source_id: String,
    spec: HtmlListingSpec,
    selectors: CompiledSelectors,
}

impl HtmlListingAdapter {
    pub fn new(source_id: impl Into<String>, spec: HtmlListingSpec) -> Result<Self, AdapterError> {
        let selectors = CompiledSelectors::compile(&spec.selectors)?;
        Ok(Self {
            source_id: source_id.into(),
            spec,
            selectors,
        })
    }

    pub fn parse_page(&self, base_url: &str, html: &str, fetched_at: DateTime<Utc>) -> AdapterOutput {
        let document = Html::parse_document(html);
        let base = Url::parse(base_url).ok();
        let sel = &self.selectors;
        let mut out = AdapterOutput::default();

        for item in document.select(&sel.item) {
            let Some(title) = first_text(&item, Some(&sel.title)) else {
                out.extraction_failures += 1;
                continue;
            };
            let link = first_attr(&item, &sel.link, "href")
                .map(|href| resolve_link(base.as_ref(), &href))
                .unwrap_or_else(|| base_url.to_string());

            let mut candidate = Candidate::new(&self.source_id, title, link, fetched_at);
            candidate.raw_date = first_text(&item, sel.date.as_ref());
            candidate.machine_date = sel
                .date
                .as_ref()
                .and_then(|s| first_attr(&item, s, "datetime"))
                .or_else(|| first_attr(&item, &sel.time_tag, "datetime"));
            candidate.raw_venue = first_text(&item, sel.venue.as_ref());
            candidate.image_url = sel
                .image
                .as_ref()
                .and_then(|s| first_attr(&item, s, "src"))
                .map(|src| resolve_link(base.as_ref(), &src));
            candidate.description = first_text(&item, sel.description.as_ref());
            candidate.category = first_text(&item, sel.category.as_ref());
            candidate.price = first_text(&item, sel.price.as_ref()).map(Price::Display);
            candidate.address = first_text(&item, sel.address.as_ref());
            candidate.coordinates = item_coordinates(&item);
            out.candidates.push(candidate);
        }
        out
    }
}

fn item_coordinates(item: &ElementRef<'_>) -> Option<Coordinates> {
    let attrs = item.value();
    let lat = attrs.attr("data-lat")?.trim().parse::<f64>().ok()?;
    let lng = attrs.attr("data-lng")?.trim().parse::<f64>().ok()?;
    Some(Coordinates::from_lat_lng(lat, lng))
}

#[async_trait]
impl SourceAdapter for HtmlListingAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn produce_candidates(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<AdapterOutput, AdapterError> {
        let pages = collect_pages(
            &self.source_id,
            self.spec.fixture.as_deref(),
            &self.spec.listing_urls,
            http,
            ctx,
        )
        .await?;
        let mut out = AdapterOutput::default();
        for (base_url, html) in pages {
            out.extend(self.parse_page(&base_url, &html, ctx.fetched_at));
        }
        Ok(out)
    }
}

fn json_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        cur = match cur {
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => cur.get(segment)?,
        };
    }
    Some(cur)
}

fn json_str(value: &JsonValue, path: Option<&str>) -> Option<String> {
    match json_path(value, path?)? {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Feed adapter for JSON APIs. Loose shapes (numeric price, lat/lng objects, venue objects)
/// pass through for the normalizer.
pub struct JsonFeedAdapter {
    source_id: String,
    spec: JsonFeedSpec,
}

impl JsonFeedAdapter {
    pub fn new(source_id: impl Into<String>, spec: JsonFeedSpec) -> Self {
        Self {
            source_id: source_id.into(),
            spec,
        }
    }

    pub fn parse_document(
        &self,
        base_url: &str,
        text: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<AdapterOutput, AdapterError> {
        let value: JsonValue = serde_json::from_str(text)
            .map_err(|e| AdapterError::Message(format!("invalid JSON feed for {}: {e}", self.source_id)))?;
        let items = json_path(&value, &self.spec.items_path)
            .and_then(JsonValue::as_array)
            .ok_or_else(|| {
                AdapterError::Message(format!(
                    "items_path `{}` is not an array for {}",
                    self.spec.items_path, self.source_id
                ))
            })?;

        let base = Url::parse(base_url).ok();
        let fields = &self.spec.fields;
        let mut out = AdapterOutput::default();
        for item in items {
            let Some(title) = json_str(item, Some(&fields.title)) else {
                out.extraction_failures += 1;
                continue;
            };
            let link = json_str(item, fields.url.as_deref())
                .map(|href| resolve_link(base.as_ref(), &href))
                .unwrap_or_else(|| base_url.to_string());

            let mut candidate = Candidate::new(&self.source_id, title, link, fetched_at);
            candidate.raw_date = json_str(item, fields.date_text.as_deref());
            candidate.machine_date = json_str(item, fields.machine_date.as_deref());
            candidate.image_url = json_str(item, fields.image.as_deref());
            candidate.description = json_str(item, fields.description.as_deref());
            candidate.category = json_str(item, fields.category.as_deref());
            candidate.address = json_str(item, fields.address.as_deref());

            match fields.venue.as_deref().and_then(|p| json_path(item, p)) {
                Some(JsonValue::Object(venue)) => {
                    candidate.raw_venue = venue
                        .get("name")
                        .and_then(JsonValue::as_str)
                        .and_then(|s| text_or_none(s.to_string()));
                    if candidate.address.is_none() {
                        candidate.address = venue
                            .get("address")
                            .and_then(JsonValue::as_str)
                            .and_then(|s| text_or_none(s.to_string()));
                    }
                }
                Some(JsonValue::String(name)) => candidate.raw_venue = text_or_none(name.clone()),
                _ => {}
            }

            candidate.price = fields
                .price
                .as_deref()
                .and_then(|p| json_path(item, p))
                .and_then(|v| serde_json::from_value::<Price>(v.clone()).ok());
            candidate.coordinates = fields
                .coordinates
                .as_deref()
                .and_then(|p| json_path(item, p))
                .and_then(|v| serde_json::from_value::<Coordinates>(v.clone()).ok());
            out.candidates.push(candidate);
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceAdapter for JsonFeedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn produce_candidates(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<AdapterOutput, AdapterError> {
        let pages = collect_pages(
            &self.source_id,
            self.spec.fixture.as_deref(),
            &self.spec.listing_urls,
            http,
            ctx,
        )
        .await?;
        let mut out = AdapterOutput::default();
        for (base_url, text) in pages {
            out.extend(self.parse_document(&base_url, &text, ctx.fetched_at)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 1, 12, 0, 0).single().unwrap()
    }

    fn html_spec() -> HtmlListingSpec {
        HtmlListingSpec {
            listing_urls: Vec::new(),
            fixture: None,
            selectors: HtmlSelectors {
                item: "article.event".into(),
                title: "h3".into(),
                date: Some(".when".into()),
                link: default_link_selector(),
                venue: Some(".where".into()),
                image: Some("img".into()),
                description: None,
                category: None,
                price: Some(".price".into()),
                address: None,
            },
        }
    }

    #[test]
    fn html_items_become_candidates_with_resolved_links() {
        let adapter = HtmlListingAdapter::new("horseshoe-tavern", html_spec()).unwrap();
        let html = r#"
            <article class="event" data-lat="43.649" data-lng="-79.396">
              <h3>Live   Jazz Night</h3>
              <time class="when" datetime="2025-11-10T20:00:00-05:00">Mon Nov 10</time>
              <a href="/events/jazz">details</a>
              <img src="img/jazz.jpg">
              <span class="price">$15</span>
            </article>
            <article class="event"><p>no heading here</p></article>
        "#;
        let out = adapter.parse_page("https://venue.example/calendar/", html, fetched_at());
        assert_eq!(out.extraction_failures, 1);
        assert_eq!(out.candidates.len(), 1);

        let c = &out.candidates[0];
        assert_eq!(c.title, "Live   Jazz Night");
        assert_eq!(c.source_url, "https://venue.example/events/jazz");
        assert_eq!(c.machine_date.as_deref(), Some("2025-11-10T20:00:00-05:00"));
        assert_eq!(c.raw_date.as_deref(), Some("Mon Nov 10"));
        assert_eq!(c.image_url.as_deref(), Some("https://venue.example/calendar/img/jazz.jpg"));
        assert_eq!(c.price, Some(Price::Display("$15".into())));
        assert_eq!(c.coordinates, Some(Coordinates::from_lat_lng(43.649, -79.396)));
        assert_eq!(c.raw_venue, None);
    }

    #[test]
    fn invalid_selectors_fail_at_construction() {
        let mut spec = html_spec();
        spec.selectors.item = "article[".into();
        assert!(matches!(
            HtmlListingAdapter::new("broken", spec),
            Err(AdapterError::Selector { .. })
        ));
    }

    #[test]
    fn json_feed_passes_loose_shapes_through() {
        let adapter = JsonFeedAdapter::new(
            "city-feed",
            JsonFeedSpec {
                listing_urls: Vec::new(),
                fixture: None,
                items_path: "data.events".into(),
                fields: JsonFieldMap {
                    title: "name".into(),
                    date_text: None,
                    machine_date: Some("start".into()),
                    url: Some("link".into()),
                    venue: Some("venue".into()),
                    image: None,
                    description: None,
                    category: None,
                    price: Some("price".into()),
                    address: None,
                    coordinates: Some("location".into()),
                },
            },
        );
        let text = r#"{"data": {"events": [
            {"name": "Open Mic", "start": "2025-11-12", "link": "/e/9",
             "venue": {"name": "Tranzac", "address": "292 Brunswick Ave"},
             "price": 0, "location": {"lat": 43.66, "lng": -79.41}},
            {"name": "Gallery Walk", "venue": "Queen West", "price": "PWYC"},
            {"start": "2025-11-13"}
        ]}}"#;
        let out = adapter
            .parse_document("https://feed.example/api/", text, fetched_at())
            .unwrap();
        assert_eq!(out.extraction_failures, 1);
        assert_eq!(out.candidates.len(), 2);

        let open_mic = &out.candidates[0];
        assert_eq!(open_mic.source_url, "https://feed.example/e/9");
        assert_eq!(open_mic.raw_venue.as_deref(), Some("Tranzac"));
        assert_eq!(open_mic.address.as_deref(), Some("292 Brunswick Ave"));
        assert_eq!(open_mic.price, Some(Price::Amount(0.0)));
        assert_eq!(open_mic.coordinates, Some(Coordinates::from_lat_lng(43.66, -79.41)));

        let gallery = &out.candidates[1];
        assert_eq!(gallery.raw_venue.as_deref(), Some("Queen West"));
        assert_eq!(gallery.price, Some(Price::Display("PWYC".into())));
        assert_eq!(gallery.source_url, "https://feed.example/api/");
    }

    #[test]
    fn json_feed_rejects_non_array_items_path() {
        let adapter = JsonFeedAdapter::new(
            "city-feed",
            JsonFeedSpec {
                listing_urls: Vec::new(),
                fixture: None,
                items_path: "data".into(),
                fields: JsonFieldMap {
                    title: "name".into(),
                    date_text: None,
                    machine_date: None,
                    url: None,
                    venue: None,
                    image: None,
                    description: None,
                    category: None,
                    price: None,
                    address: None,
                    coordinates: None,
                },
            },
        );
        let err = adapter
            .parse_document("https://feed.example/", r#"{"data": {}}"#, fetched_at())
            .unwrap_err();
        assert!(err.to_string().contains("not an array"));
    }

    #[test]
    fn adapter_spec_deserializes_from_yaml_shaped_json() {
        let spec: AdapterSpec = serde_json::from_str(
            r#"{"kind": "html_listing", "fixture": "fixtures/x/sample/bundle.json",
                "selectors": {"item": ".e", "title": "h2"}}"#,
        )
        .unwrap();
        assert_eq!(spec.fixture(), Some("fixtures/x/sample/bundle.json"));
        let adapter = adapter_for_source("x", &spec).unwrap();
        assert_eq!(adapter.source_id(), "x");
    }
}
