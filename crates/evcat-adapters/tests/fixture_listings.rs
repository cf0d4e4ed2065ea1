use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use evcat_adapters::{
    adapter_for_source, load_fixture_bundle, AdapterContext, AdapterSpec, HarvestMode,
    HtmlListingSpec, HtmlSelectors, JsonFeedSpec, JsonFieldMap,
};
use evcat_core::{Coordinates, Price};
use evcat_storage::{FetchConfig, HttpFetcher};
use uuid::Uuid;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn ctx() -> AdapterContext {
    AdapterContext {
        run_id: Uuid::nil(),
        fetched_at: Utc.with_ymd_and_hms(2025, 10, 1, 12, 0, 0).single().unwrap(),
        mode: HarvestMode::Fixture,
        workspace_root: workspace_root(),
    }
}

fn horseshoe_spec() -> AdapterSpec {
    AdapterSpec::HtmlListing(HtmlListingSpec {
        listing_urls: Vec::new(),
        fixture: Some("fixtures/horseshoe-tavern/sample/bundle.json".into()),
        selectors: HtmlSelectors {
            item: "li.event-item".into(),
            title: ".event-title".into(),
            date: Some("time.event-date".into()),
            link: "a.event-link".into(),
            venue: None,
            image: Some("img.event-image".into()),
            description: Some(".event-blurb".into()),
            category: None,
            price: Some(".event-price".into()),
            address: None,
        },
    })
}

#[test]
fn fixture_bundles_hydrate_raw_artifacts() {
    for source in ["horseshoe-tavern", "casa-del-popolo", "toronto-open-data"] {
        let path = workspace_root()
            .join("fixtures")
            .join(source)
            .join("sample/bundle.json");
        let bundle = load_fixture_bundle(&path).expect("bundle");
        assert_eq!(bundle.source_id, source);
        assert!(bundle.captured_from_url.starts_with("https://"));
        assert!(bundle.raw_artifact.inline_text.is_some(), "{source} raw artifact missing");
    }
}

#[tokio::test]
async fn html_listing_fixture_yields_raw_candidates_in_page_order() {
    let http = HttpFetcher::new(FetchConfig::default()).expect("fetcher");
    let adapter = adapter_for_source("horseshoe-tavern", &horseshoe_spec()).expect("adapter");
    let out = adapter.produce_candidates(&http, &ctx()).await.expect("candidates");

    assert_eq!(out.extraction_failures, 1);
    let titles: Vec<&str> = out.candidates.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(
        titles,
        vec![
            "Live Jazz Night",
            "Buy Tickets",
            "Friday, November 14",
            "The Weather Station",
            "Live  Jazz  Night",
            "Secret Show",
            "Open Mic Monday",
        ]
    );

    let jazz = &out.candidates[0];
    assert_eq!(jazz.source_url, "https://www.horseshoetavern.com/events/live-jazz-night");
    assert_eq!(jazz.machine_date.as_deref(), Some("2025-11-10T20:00:00-05:00"));
    assert_eq!(jazz.image_url.as_deref(), Some("https://www.horseshoetavern.com/media/jazz.jpg"));
    assert_eq!(jazz.price, Some(Price::Display("$15".into())));

    let weather = &out.candidates[3];
    assert_eq!(weather.machine_date, None);
    assert_eq!(weather.raw_date.as_deref(), Some("Nov 21, 2025 9pm"));

    let open_mic = &out.candidates[6];
    assert_eq!(
        open_mic.source_url,
        "https://www.horseshoetavern.com/events/2025/11/17/open-mic-monday"
    );
}

#[tokio::test]
async fn json_feed_fixture_keeps_loose_shapes_for_the_normalizer() {
    let http = HttpFetcher::new(FetchConfig::default()).expect("fetcher");
    let spec = AdapterSpec::JsonFeed(JsonFeedSpec {
        listing_urls: Vec::new(),
        fixture: Some("fixtures/toronto-open-data/sample/bundle.json".into()),
        items_path: "events".into(),
        fields: JsonFieldMap {
            title: "name".into(),
            date_text: Some("dateLabel".into()),
            machine_date: Some("startDate".into()),
            url: Some("url".into()),
            venue: Some("venue".into()),
            image: Some("image".into()),
            description: Some("description".into()),
            category: Some("category".into()),
            price: Some("price".into()),
            address: None,
            coordinates: Some("location".into()),
        },
    });
    let adapter = adapter_for_source("toronto-open-data", &spec).expect("adapter");
    let out = adapter.produce_candidates(&http, &ctx()).await.expect("candidates");

    assert_eq!(out.extraction_failures, 1);
    assert_eq!(out.candidates.len(), 4);

    let afterparty = &out.candidates[1];
    assert_eq!(afterparty.price, Some(Price::Amount(0.0)));
    assert_eq!(afterparty.raw_venue.as_deref(), Some("Drake Underground"));
    assert_eq!(
        afterparty.coordinates,
        Some(Coordinates::from_lat_lng(43.6434, -79.4246))
    );
    assert_eq!(afterparty.source_url, "https://open.toronto.example/events/4412");

    let pottery = &out.candidates[2];
    assert_eq!(pottery.raw_date.as_deref(), Some("Saturday November 22, 10:30 am"));
    assert_eq!(pottery.address.as_deref(), Some("1214 Queen St W"));
    assert_eq!(pottery.category.as_deref(), Some("Workshop"));
}

#[tokio::test]
async fn bundle_for_another_source_is_rejected() {
    let http = HttpFetcher::new(FetchConfig::default()).expect("fetcher");
    let adapter = adapter_for_source("someone-else", &horseshoe_spec()).expect("adapter");
    let err = adapter.produce_candidates(&http, &ctx()).await.unwrap_err();
    assert!(err.to_string().contains("does not match"));
}
