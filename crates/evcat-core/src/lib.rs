//! Core event model, persisted-field invariants and the schema normalizer for evcat.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "evcat-core";

/// Unvalidated record handed over by a source adapter. Discarded after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub source_id: String,
    pub title: String,
    pub raw_date: Option<String>,
    /// Structured timestamp supplied by the page or API (`<time datetime>`, ISO field).
    pub machine_date: Option<String>,
    pub source_url: String,
    pub raw_venue: Option<String>,
    pub image_url: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub price: Option<Price>,
    pub coordinates: Option<Coordinates>,
    pub address: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl Candidate {
    pub fn new(
        source_id: impl Into<String>,
        title: impl Into<String>,
        source_url: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
            raw_date: None,
            machine_date: None,
            source_url: source_url.into(),
            raw_venue: None,
            image_url: None,
            description: None,
            category: None,
            price: None,
            coordinates: None,
            address: None,
            fetched_at,
        }
    }
}

/// Calendar day with an optional time of day. There is no sentinel variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventDate {
    pub day: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<NaiveTime>,
}

impl EventDate {
    pub fn new(day: NaiveDate, time: Option<NaiveTime>) -> Self {
        Self { day, time }
    }

    pub fn iso_day(&self) -> String {
        self.day.format("%Y-%m-%d").to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Venue {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub city: String,
}

impl Venue {
    pub fn new(name: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
            city: city.into(),
        }
    }
}

/// Venue as found in the wild. Only `Object` is persistable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VenueField {
    Object(Venue),
    Name(String),
}

impl VenueField {
    pub fn name(&self) -> &str {
        match self {
            VenueField::Object(venue) => &venue.name,
            VenueField::Name(name) => name,
        }
    }
}

/// Geographic position. Persisted form is `Pair([longitude, latitude])`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Coordinates {
    Pair([f64; 2]),
    LatLng {
        #[serde(alias = "lat")]
        latitude: f64,
        #[serde(alias = "lng", alias = "lon")]
        longitude: f64,
    },
}

impl Coordinates {
    pub fn from_lat_lng(latitude: f64, longitude: f64) -> Self {
        Coordinates::LatLng {
            latitude,
            longitude,
        }
    }

    fn in_range(longitude: f64, latitude: f64) -> bool {
        longitude.is_finite()
            && latitude.is_finite()
            && (-180.0..=180.0).contains(&longitude)
            && (-90.0..=90.0).contains(&latitude)
    }
}

/// Price as found in the wild. Persisted form is `Display`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Price {
    Display(String),
    Amount(f64),
}

static FREE_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(free|gratuit|gratuite)\b").expect("free word regex"));
static DOLLAR_FIRST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\s?(\d[\d,]*(?:\.\d+)?)").expect("dollar-first price regex"));
static DOLLAR_AFTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s?\$").expect("dollar-after price regex"));

impl Price {
    /// Reduce listing price text to `"Free"` or the first dollar amount (`"$15"`).
    /// Text with neither is kept trimmed.
    pub fn from_text(text: &str) -> Option<String> {
        let text = collapse_whitespace(text);
        if text.is_empty() {
            return None;
        }
        if FREE_WORD.is_match(&text) {
            return Some("Free".to_string());
        }
        if let Some(amount) = DOLLAR_FIRST.captures(&text).and_then(|caps| caps.get(1)) {
            return Some(format!("${}", amount.as_str().replace(',', "")));
        }
        // "10 $", "12,50 $" as written in Quebec listings.
        if let Some(amount) = DOLLAR_AFTER.captures(&text).and_then(|caps| caps.get(1)) {
            return Some(format!("${}", amount.as_str().replace(',', ".")));
        }
        Some(text)
    }

    pub fn display(amount: f64) -> Option<String> {
        if !amount.is_finite() {
            return None;
        }
        if amount <= 0.0 {
            Some("Free".to_string())
        } else {
            Some(format!("${amount}"))
        }
    }
}

/// Persisted, identity-keyed event document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub id: Uuid,
    pub identity_key: String,
    pub source_id: String,
    pub title: String,
    pub date: Option<EventDate>,
    pub venue: VenueField,
    pub address: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub price: Option<Price>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalEvent {
    /// Build an unkeyed event from a validated candidate. A blank raw venue falls back to
    /// the source's configured venue.
    pub fn from_candidate(candidate: Candidate, date: Option<EventDate>, source_venue: &Venue) -> Self {
        let venue = match candidate.raw_venue {
            Some(raw) if !raw.trim().is_empty() => VenueField::Name(raw),
            _ => VenueField::Object(source_venue.clone()),
        };
        Self {
            id: Uuid::nil(),
            identity_key: String::new(),
            source_id: candidate.source_id,
            title: candidate.title,
            date,
            venue,
            address: candidate.address,
            coordinates: candidate.coordinates,
            url: Some(candidate.source_url),
            image_url: candidate.image_url,
            category: candidate.category,
            description: candidate.description,
            price: candidate.price,
            created_at: candidate.fetched_at,
            updated_at: candidate.fetched_at,
        }
    }

    pub fn assign_identity(&mut self, identity_key: String) {
        self.id = identity_uuid(&identity_key);
        self.identity_key = identity_key;
    }

    /// Upsert merge: identity and creation time stay, mutable fields are overwritten
    /// when the incoming record carries a value.
    pub fn merge_from(&mut self, incoming: CanonicalEvent) {
        if incoming.description.is_some() {
            self.description = incoming.description;
        }
        if incoming.price.is_some() {
            self.price = incoming.price;
        }
        if incoming.image_url.is_some() {
            self.image_url = incoming.image_url;
        }
        if incoming.url.is_some() {
            self.url = incoming.url;
        }
        self.updated_at = incoming.updated_at.max(self.updated_at);
    }

    pub fn check_persistable(&self) -> Result<(), InvariantViolation> {
        let key = || self.identity_key.clone();
        if self.identity_key.is_empty() {
            return Err(InvariantViolation::MissingIdentity);
        }
        if self.title.trim().is_empty() {
            return Err(InvariantViolation::EmptyTitle { identity_key: key() });
        }
        match &self.venue {
            VenueField::Name(_) => return Err(InvariantViolation::BareVenue { identity_key: key() }),
            VenueField::Object(venue) => {
                if venue.name.trim().is_empty() || venue.city.trim().is_empty() {
                    return Err(InvariantViolation::IncompleteVenue { identity_key: key() });
                }
            }
        }
        match self.coordinates {
            Some(Coordinates::LatLng { .. }) => {
                return Err(InvariantViolation::UnorderedCoordinates { identity_key: key() })
            }
            Some(Coordinates::Pair([lng, lat])) if !Coordinates::in_range(lng, lat) => {
                return Err(InvariantViolation::CoordinatesOutOfRange { identity_key: key() })
            }
            _ => {}
        }
        if let Some(Price::Amount(_)) = self.price {
            return Err(InvariantViolation::NumericPrice { identity_key: key() });
        }
        Ok(())
    }
}

pub fn identity_uuid(identity_key: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("evcat:{identity_key}").as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("event has no identity key")]
    MissingIdentity,
    #[error("event {identity_key} has an empty title")]
    EmptyTitle { identity_key: String },
    #[error("event {identity_key} has a bare string venue")]
    BareVenue { identity_key: String },
    #[error("event {identity_key} has a venue without name or city")]
    IncompleteVenue { identity_key: String },
    #[error("event {identity_key} stores coordinates as lat/lng instead of [longitude, latitude]")]
    UnorderedCoordinates { identity_key: String },
    #[error("event {identity_key} has coordinates out of range")]
    CoordinatesOutOfRange { identity_key: String },
    #[error("event {identity_key} stores price as a raw number")]
    NumericPrice { identity_key: String },
}

/// Why a candidate never became a canonical event. Aggregated per source, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    ExtractionFailure,
    DateUnresolved,
    ValidationRejected,
    DuplicateIdentity,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::ExtractionFailure => "extraction_failure",
            DropReason::DateUnresolved => "date_unresolved",
            DropReason::ValidationRejected => "validation_rejected",
            DropReason::DuplicateIdentity => "duplicate_identity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: String,
    pub keywords: Vec<String>,
}

/// Keyword rules for events that arrive without a category. Rules are tried in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRules {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub rules: Vec<CategoryRule>,
}

impl CategoryRules {
    /// Keywords match whole words (or whole phrases) of the title and description,
    /// case-insensitively.
    pub fn infer(&self, title: &str, description: Option<&str>) -> Option<&str> {
        let haystack = word_padded(&format!("{title} {}", description.unwrap_or_default()));
        self.rules
            .iter()
            .find(|rule| {
                rule.keywords.iter().any(|keyword| {
                    let needle = word_padded(keyword);
                    !needle.trim().is_empty() && haystack.contains(&needle)
                })
            })
            .map(|rule| rule.category.as_str())
    }
}

/// Lowercase words joined by single spaces, with a space on each side.
fn word_padded(text: &str) -> String {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect();
    format!(" {} ", words.join(" "))
}

/// Enforces the persisted-field invariants. Applying it twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaNormalizer {
    city: String,
    categories: CategoryRules,
    default_category: Option<String>,
}

impl SchemaNormalizer {
    /// `city` is the contextual city used when a venue arrives without one.
    pub fn for_city(city: impl Into<String>) -> Self {
        Self {
            city: collapse_whitespace(&city.into()),
            categories: CategoryRules::default(),
            default_category: None,
        }
    }

    /// Fill missing categories from keyword rules, then from `default_category`.
    pub fn with_categories(mut self, rules: CategoryRules, default_category: Option<String>) -> Self {
        self.categories = rules;
        self.default_category = non_blank(default_category);
        self
    }

    pub fn city(&self) -> &str {
        &self.city
    }

    pub fn normalize(&self, mut event: CanonicalEvent) -> CanonicalEvent {
        event.title = collapse_whitespace(&event.title);

        let mut venue = match event.venue {
            VenueField::Name(name) => Venue::new(collapse_whitespace(&name), self.city.clone()),
            VenueField::Object(venue) => venue,
        };
        venue.name = collapse_whitespace(&venue.name);
        venue.address = non_blank(venue.address);
        if venue.city.trim().is_empty() {
            venue.city = self.city.clone();
        } else {
            venue.city = collapse_whitespace(&venue.city);
        }

        event.address = non_blank(event.address);
        if event.address.is_none() {
            event.address = venue.address.clone();
        }
        event.venue = VenueField::Object(venue);

        event.coordinates = event.coordinates.and_then(|coords| {
            let (longitude, latitude) = match coords {
                Coordinates::Pair([lng, lat]) => (lng, lat),
                Coordinates::LatLng {
                    latitude,
                    longitude,
                } => (longitude, latitude),
            };
            Coordinates::in_range(longitude, latitude).then_some(Coordinates::Pair([longitude, latitude]))
        });

        event.price = match event.price {
            Some(Price::Amount(amount)) => Price::display(amount).map(Price::Display),
            Some(Price::Display(text)) => Price::from_text(&text).map(Price::Display),
            None => None,
        };

        event.url = non_blank(event.url);
        event.image_url = non_blank(event.image_url);
        event.description = non_blank(event.description);
        event.category = non_blank(event.category).or_else(|| {
            self.categories
                .infer(&event.title, event.description.as_deref())
                .map(str::to_string)
                .or_else(|| self.default_category.clone())
        });
        event
    }
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 1, 12, 0, 0).single().unwrap()
    }

    fn mk_event(venue: VenueField) -> CanonicalEvent {
        let mut candidate = Candidate::new(
            "horseshoe",
            "  Live   Jazz Night ",
            "https://example.com/events/jazz",
            fetched_at(),
        );
        candidate.raw_venue = None;
        let mut event = CanonicalEvent::from_candidate(
            candidate,
            Some(EventDate::new(NaiveDate::from_ymd_opt(2025, 11, 10).unwrap(), None)),
            &Venue::new("Fallback Hall", "Toronto"),
        );
        event.venue = venue;
        event.assign_identity("live jazz night|2025-11-10".to_string());
        event
    }

    #[test]
    fn bare_venue_string_wraps_with_context_city() {
        let normalizer = SchemaNormalizer::for_city("Toronto");
        let event = normalizer.normalize(mk_event(VenueField::Name("Horseshoe Tavern".into())));
        assert_eq!(
            event.venue,
            VenueField::Object(Venue::new("Horseshoe Tavern", "Toronto"))
        );
        let again = normalizer.normalize(event.clone());
        assert_eq!(again, event);
    }

    #[test]
    fn lat_lng_object_becomes_longitude_latitude_pair() {
        let normalizer = SchemaNormalizer::for_city("Toronto");
        let mut event = mk_event(VenueField::Name("Horseshoe Tavern".into()));
        event.coordinates = Some(Coordinates::from_lat_lng(43.65, -79.38));
        let event = normalizer.normalize(event);
        assert_eq!(event.coordinates, Some(Coordinates::Pair([-79.38, 43.65])));
    }

    #[test]
    fn out_of_range_coordinates_are_removed() {
        let normalizer = SchemaNormalizer::for_city("Toronto");
        let mut event = mk_event(VenueField::Name("Horseshoe Tavern".into()));
        event.coordinates = Some(Coordinates::Pair([43.65, -279.38]));
        assert_eq!(normalizer.normalize(event).coordinates, None);
    }

    #[test]
    fn numeric_prices_render_as_display_strings() {
        let normalizer = SchemaNormalizer::for_city("Toronto");
        let cases = [(0.0, "Free"), (25.0, "$25"), (12.5, "$12.5")];
        for (amount, expected) in cases {
            let mut event = mk_event(VenueField::Name("Horseshoe Tavern".into()));
            event.price = Some(Price::Amount(amount));
            let event = normalizer.normalize(event);
            assert_eq!(event.price, Some(Price::Display(expected.to_string())));
        }
    }

    #[test]
    fn price_text_reduces_to_free_or_first_amount() {
        let cases = [
            ("$15 adv / $20 door", Some("$15")),
            ("Tickets: $ 1,200.00 VIP", Some("$1200.00")),
            ("FREE with RSVP", Some("Free")),
            ("Entrée gratuite", Some("Free")),
            ("10 $", Some("$10")),
            ("12,50 $ à la porte", Some("$12.50")),
            ("$35.5", Some("$35.5")),
            ("Free", Some("Free")),
            ("Pay what you can", Some("Pay what you can")),
            ("Freedom Singers tribute, $12", Some("$12")),
            ("   ", None),
        ];
        for (text, expected) in cases {
            let reduced = Price::from_text(text);
            assert_eq!(reduced.as_deref(), expected, "{text}");
            if let Some(once) = reduced {
                assert_eq!(Price::from_text(&once), Some(once.clone()));
            }
        }
    }

    fn music_rules() -> CategoryRules {
        CategoryRules {
            version: 1,
            rules: vec![
                CategoryRule {
                    category: "Tribute & Cover Bands".into(),
                    keywords: vec!["tribute".into(), "cover band".into()],
                },
                CategoryRule {
                    category: "Blues & Jazz".into(),
                    keywords: vec!["blues".into(), "jazz".into()],
                },
            ],
        }
    }

    #[test]
    fn missing_category_is_inferred_from_keywords_then_default() {
        let normalizer = SchemaNormalizer::for_city("Toronto")
            .with_categories(music_rules(), Some("Live Music".into()));

        let jazz = normalizer.normalize(mk_event(VenueField::Name("Horseshoe Tavern".into())));
        assert_eq!(jazz.category.as_deref(), Some("Blues & Jazz"));

        let mut tribute = mk_event(VenueField::Name("Horseshoe Tavern".into()));
        tribute.title = "The Last Waltz".into();
        tribute.description = Some("A Band TRIBUTE night, with jazz sit-ins".into());
        let tribute = normalizer.normalize(tribute);
        assert_eq!(tribute.category.as_deref(), Some("Tribute & Cover Bands"));

        let mut other = mk_event(VenueField::Name("Horseshoe Tavern".into()));
        other.title = "Jazzercise Morning".into();
        let other = normalizer.normalize(other);
        assert_eq!(other.category.as_deref(), Some("Live Music"));

        let mut labelled = mk_event(VenueField::Name("Horseshoe Tavern".into()));
        labelled.category = Some(" Workshop ".into());
        let labelled = normalizer.normalize(labelled);
        assert_eq!(labelled.category.as_deref(), Some("Workshop"));
        assert_eq!(normalizer.normalize(labelled.clone()), labelled);
    }

    #[test]
    fn no_rules_and_no_default_leave_category_empty() {
        let normalizer = SchemaNormalizer::for_city("Toronto");
        let event = normalizer.normalize(mk_event(VenueField::Name("Horseshoe Tavern".into())));
        assert_eq!(event.category, None);
    }

    #[test]
    fn venue_address_is_copied_to_top_level() {
        let normalizer = SchemaNormalizer::for_city("Toronto");
        let mut venue = Venue::new("Massey Hall", "");
        venue.address = Some("178 Victoria St".into());
        let event = normalizer.normalize(mk_event(VenueField::Object(venue)));
        assert_eq!(event.address.as_deref(), Some("178 Victoria St"));
        match &event.venue {
            VenueField::Object(v) => assert_eq!(v.city, "Toronto"),
            other => panic!("unexpected venue {other:?}"),
        }
    }

    #[test]
    fn normalize_is_idempotent_for_a_messy_record() {
        let normalizer = SchemaNormalizer::for_city("Montreal");
        let mut event = mk_event(VenueField::Name(" Casa  del Popolo ".into()));
        event.price = Some(Price::Amount(0.0));
        event.coordinates = Some(Coordinates::from_lat_lng(45.52, -73.59));
        event.description = Some("   ".into());
        let once = normalizer.normalize(event);
        let twice = normalizer.normalize(once.clone());
        assert_eq!(once, twice);
        assert!(once.check_persistable().is_ok());
        assert_eq!(once.title, "Live Jazz Night");
        assert_eq!(once.description, None);
    }

    #[test]
    fn raw_shapes_fail_the_persistable_check() {
        let mut event = mk_event(VenueField::Name("Horseshoe Tavern".into()));
        assert!(matches!(
            event.check_persistable(),
            Err(InvariantViolation::BareVenue { .. })
        ));
        event.venue = VenueField::Object(Venue::new("Horseshoe Tavern", "Toronto"));
        event.price = Some(Price::Amount(10.0));
        assert!(matches!(
            event.check_persistable(),
            Err(InvariantViolation::NumericPrice { .. })
        ));
        event.price = None;
        event.coordinates = Some(Coordinates::from_lat_lng(43.65, -79.38));
        assert!(matches!(
            event.check_persistable(),
            Err(InvariantViolation::UnorderedCoordinates { .. })
        ));
    }

    #[test]
    fn legacy_json_shapes_deserialize_into_loose_variants() {
        let venue: VenueField = serde_json::from_str(r#""Horseshoe Tavern""#).unwrap();
        assert_eq!(venue, VenueField::Name("Horseshoe Tavern".into()));
        let coords: Coordinates = serde_json::from_str(r#"{"lat": 43.65, "lng": -79.38}"#).unwrap();
        assert_eq!(coords, Coordinates::from_lat_lng(43.65, -79.38));
        let price: Price = serde_json::from_str("0").unwrap();
        assert_eq!(price, Price::Amount(0.0));
        let pair: Coordinates = serde_json::from_str("[-79.38, 43.65]").unwrap();
        assert_eq!(pair, Coordinates::Pair([-79.38, 43.65]));
    }

    #[test]
    fn merge_preserves_identity_and_overwrites_mutable_fields() {
        let mut stored = mk_event(VenueField::Object(Venue::new("Horseshoe Tavern", "Toronto")));
        let original_id = stored.id;
        let created = stored.created_at;
        let mut incoming = stored.clone();
        incoming.id = Uuid::new_v4();
        incoming.price = Some(Price::Display("$25".into()));
        incoming.description = Some("Quartet".into());
        incoming.image_url = None;
        incoming.updated_at = created + chrono::Duration::days(1);
        stored.image_url = Some("https://example.com/a.jpg".into());

        stored.merge_from(incoming);
        assert_eq!(stored.id, original_id);
        assert_eq!(stored.created_at, created);
        assert_eq!(stored.price, Some(Price::Display("$25".into())));
        assert_eq!(stored.description.as_deref(), Some("Quartet"));
        assert_eq!(stored.image_url.as_deref(), Some("https://example.com/a.jpg"));
        assert_eq!(stored.updated_at, created + chrono::Duration::days(1));
    }
}
