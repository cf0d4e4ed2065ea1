//! Free-text and URL date resolution for harvested event listings.
//!
//! Resolution never fabricates a date: when no rule matches, [`DateResolver::resolve`]
//! returns `None` and the caller drops the candidate.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use evcat_core::EventDate;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "evcat-dates";

/// English and French month spellings, full and abbreviated, with and without accents.
const MONTHS: &[(&str, u32)] = &[
    ("january", 1),
    ("janvier", 1),
    ("janv", 1),
    ("jan", 1),
    ("february", 2),
    ("février", 2),
    ("fevrier", 2),
    ("févr", 2),
    ("fevr", 2),
    ("feb", 2),
    ("fév", 2),
    ("fev", 2),
    ("march", 3),
    ("mars", 3),
    ("mar", 3),
    ("april", 4),
    ("avril", 4),
    ("apr", 4),
    ("avr", 4),
    ("may", 5),
    ("mai", 5),
    ("june", 6),
    ("juin", 6),
    ("jun", 6),
    ("july", 7),
    ("juillet", 7),
    ("juil", 7),
    ("jul", 7),
    ("august", 8),
    ("août", 8),
    ("aout", 8),
    ("aug", 8),
    ("september", 9),
    ("septembre", 9),
    ("sept", 9),
    ("sep", 9),
    ("october", 10),
    ("octobre", 10),
    ("oct", 10),
    ("november", 11),
    ("novembre", 11),
    ("nov", 11),
    ("december", 12),
    ("décembre", 12),
    ("decembre", 12),
    ("déc", 12),
    ("dec", 12),
];

const WEEKDAYS: &[&str] = &[
    "monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday", "mon", "tues",
    "tue", "wed", "thurs", "thur", "thu", "fri", "sat", "sun", "lundi", "mardi", "mercredi",
    "jeudi", "vendredi", "samedi", "dimanche", "lun", "mar", "mer", "jeu", "ven", "sam", "dim",
];

const ORDINAL: &str = "(?:st|nd|rd|th|er|e)";

fn alternation(words: impl Iterator<Item = &'static str>) -> String {
    let mut words: Vec<&str> = words.collect();
    words.sort_by_key(|w| std::cmp::Reverse(w.chars().count()));
    words.join("|")
}

static MONTH_ALT: Lazy<String> = Lazy::new(|| alternation(MONTHS.iter().map(|(name, _)| *name)));
static WEEKDAY_ALT: Lazy<String> = Lazy::new(|| alternation(WEEKDAYS.iter().copied()));

static URL_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\D)(?P<y>\d{4})[-/](?P<m>\d{2})[-/](?P<d>\d{2})(?:\D|$)")
        .expect("url date pattern")
});

static MONTH_FIRST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?P<month>{months})\.?\s+(?P<day>\d{{1,2}}){ORDINAL}?\b(?:,?\s+(?P<year>\d{{4}})\b)?",
        months = MONTH_ALT.as_str()
    ))
    .expect("month-first pattern")
});

static DAY_FIRST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?P<day>\d{{1,2}}){ORDINAL}?\s+(?:de\s+)?(?P<month>{months})\b\.?(?:,?\s+(?P<year>\d{{4}})\b)?",
        months = MONTH_ALT.as_str()
    ))
    .expect("day-first pattern")
});

static NUMERIC_YMD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?P<y>\d{4})[-/.](?P<m>\d{1,2})[-/.](?P<d>\d{1,2})\b").expect("y-m-d pattern")
});

static NUMERIC_DMY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?P<a>\d{1,2})[/.\-](?P<b>\d{1,2})[/.\-](?P<y>\d{4}|\d{2})\b")
        .expect("d/m/y pattern")
});

static TIME_COLON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?P<h>\d{1,2}):(?P<min>\d{2})\s*(?P<mer>a\.?m\.?|p\.?m\.?)?")
        .expect("clock pattern")
});

static TIME_MERIDIEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?P<h>\d{1,2})\s*(?P<mer>am|pm)\b").expect("meridiem pattern")
});

static TIME_FRENCH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?P<h>\d{1,2})\s?h(?P<min>\d{2})?\b").expect("french clock pattern")
});

static DATE_ONLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        concat!(
            r"(?i)^(?:(?:{weekdays})\.?,?\s+)?(?:",
            r"(?:{months})\.?\s+\d{{1,2}}{ORDINAL}?(?:,?\s+\d{{4}})?",
            r"|(?:{months})\.?,?\s+\d{{4}}",
            r"|\d{{1,2}}{ORDINAL}?\s+(?:de\s+)?(?:{months})\.?(?:,?\s+\d{{4}})?",
            r"|\d{{4}}[-/.]\d{{1,2}}[-/.]\d{{1,2}}",
            r"|\d{{1,2}}[/.\-]\d{{1,2}}[/.\-](?:\d{{4}}|\d{{2}})",
            r"|today|tonight|tomorrow|this week|this weekend|aujourd'hui|ce soir|demain",
            r")$"
        ),
        weekdays = WEEKDAY_ALT.as_str(),
        months = MONTH_ALT.as_str(),
        ORDINAL = ORDINAL,
    ))
    .expect("date-only pattern")
});

/// Which rule produced a resolved date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    UrlPath,
    MachineReadable,
    MonthName,
    Numeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDate {
    pub date: EventDate,
    pub rule: ResolutionRule,
}

/// Everything an adapter knows about when an event happens.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateInput<'a> {
    pub text: Option<&'a str>,
    pub url: Option<&'a str>,
    pub machine: Option<&'a str>,
}

impl<'a> DateInput<'a> {
    pub fn text(text: &'a str) -> Self {
        Self {
            text: Some(text),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateResolver {
    today: NaiveDate,
}

impl DateResolver {
    /// `today` anchors year inference for listings that omit the year.
    pub fn new(today: NaiveDate) -> Self {
        Self { today }
    }

    pub fn from_clock() -> Self {
        Self::new(Local::now().date_naive())
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    pub fn resolve(&self, input: &DateInput<'_>) -> Option<ResolvedDate> {
        if let Some(day) = input.url.and_then(date_from_url) {
            return Some(ResolvedDate {
                date: EventDate::new(day, None),
                rule: ResolutionRule::UrlPath,
            });
        }
        if let Some(date) = input.machine.and_then(parse_machine_date) {
            return Some(ResolvedDate {
                date,
                rule: ResolutionRule::MachineReadable,
            });
        }
        let text = input.text.map(str::trim).filter(|t| !t.is_empty())?;
        let time = extract_time(text);
        if let Some(day) = self.month_name_date(text) {
            return Some(ResolvedDate {
                date: EventDate::new(day, time),
                rule: ResolutionRule::MonthName,
            });
        }
        numeric_date(text).map(|day| ResolvedDate {
            date: EventDate::new(day, time),
            rule: ResolutionRule::Numeric,
        })
    }

    pub fn resolve_text(&self, text: &str) -> Option<ResolvedDate> {
        self.resolve(&DateInput::text(text))
    }

    /// Nearest future occurrence: a month already past this year belongs to next year.
    pub fn infer_year(&self, month: u32) -> i32 {
        if month < self.today.month() {
            self.today.year() + 1
        } else {
            self.today.year()
        }
    }

    fn month_name_date(&self, text: &str) -> Option<NaiveDate> {
        let day_first: Vec<Captures<'_>> = DAY_FIRST.captures_iter(text).collect();
        let day_first_starts: HashSet<usize> = day_first
            .iter()
            .filter_map(|caps| caps.get(0).map(|m| m.start()))
            .collect();
        // "mar. 11 nov." reads as weekday + day-first date, not March 11.
        let mut matches: Vec<Captures<'_>> = MONTH_FIRST
            .captures_iter(text)
            .filter(|caps| {
                caps.name("day")
                    .map(|day| !day_first_starts.contains(&day.start()))
                    .unwrap_or(true)
            })
            .chain(day_first)
            .collect();
        matches.sort_by_key(|caps| caps.get(0).map(|m| m.start()).unwrap_or(usize::MAX));

        matches.into_iter().find_map(|caps| {
            let month = month_index(caps.name("month")?.as_str())?;
            let day: u32 = caps.name("day")?.as_str().parse().ok()?;
            let year = match caps.name("year") {
                Some(y) => y.as_str().parse().ok()?,
                None => self.infer_year(month),
            };
            NaiveDate::from_ymd_opt(year, month, day)
        })
    }
}

/// True when the whole string is a date label rather than a title.
pub fn is_date_only(text: &str) -> bool {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    !collapsed.is_empty() && DATE_ONLY.is_match(&collapsed)
}

pub fn month_index(name: &str) -> Option<u32> {
    let lower = name.trim_end_matches('.').to_lowercase();
    MONTHS
        .iter()
        .find(|(candidate, _)| *candidate == lower)
        .map(|(_, index)| *index)
}

fn date_from_url(url: &str) -> Option<NaiveDate> {
    URL_DATE.captures_iter(url).find_map(|caps| {
        NaiveDate::from_ymd_opt(
            caps["y"].parse().ok()?,
            caps["m"].parse().ok()?,
            caps["d"].parse().ok()?,
        )
    })
}

fn parse_machine_date(value: &str) -> Option<EventDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        let local = dt.naive_local();
        return Some(EventDate::new(local.date(), meaningful_time(local.time())));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(EventDate::new(dt.date(), meaningful_time(dt.time())));
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .map(|day| EventDate::new(day, None))
}

/// Midnight in a machine timestamp is how most feeds encode "all day".
fn meaningful_time(time: NaiveTime) -> Option<NaiveTime> {
    if time.hour() == 0 && time.minute() == 0 && time.second() == 0 {
        None
    } else {
        Some(time)
    }
}

fn numeric_date(text: &str) -> Option<NaiveDate> {
    let ymd = NUMERIC_YMD.captures_iter(text).find_map(|caps| {
        NaiveDate::from_ymd_opt(
            caps["y"].parse().ok()?,
            caps["m"].parse().ok()?,
            caps["d"].parse().ok()?,
        )
    });
    if ymd.is_some() {
        return ymd;
    }

    NUMERIC_DMY.captures_iter(text).find_map(|caps| {
        let a: u32 = caps["a"].parse().ok()?;
        let b: u32 = caps["b"].parse().ok()?;
        let raw_year = &caps["y"];
        let mut year: i32 = raw_year.parse().ok()?;
        if raw_year.len() == 2 {
            year += 2000;
        }
        // Day-first unless that is impossible and month-first is not.
        NaiveDate::from_ymd_opt(year, b, a).or_else(|| NaiveDate::from_ymd_opt(year, a, b))
    })
}

pub fn extract_time(text: &str) -> Option<NaiveTime> {
    if let Some(caps) = TIME_COLON.captures(text) {
        let hour: u32 = caps["h"].parse().ok()?;
        let minute: u32 = caps["min"].parse().ok()?;
        let meridiem = caps.name("mer").map(|m| m.as_str());
        return to_time(hour, minute, meridiem);
    }
    if let Some(caps) = TIME_MERIDIEM.captures(text) {
        let hour: u32 = caps["h"].parse().ok()?;
        return to_time(hour, 0, caps.name("mer").map(|m| m.as_str()));
    }
    if let Some(caps) = TIME_FRENCH.captures(text) {
        let hour: u32 = caps["h"].parse().ok()?;
        let minute: u32 = match caps.name("min") {
            Some(m) => m.as_str().parse().ok()?,
            None => 0,
        };
        return to_time(hour, minute, None);
    }
    None
}

fn to_time(hour: u32, minute: u32, meridiem: Option<&str>) -> Option<NaiveTime> {
    let hour = match meridiem.map(|m| m.to_ascii_lowercase()) {
        Some(m) if m.starts_with('p') => match hour {
            1..=11 => hour + 12,
            12 => 12,
            _ => return None,
        },
        Some(_) => match hour {
            12 => 0,
            1..=11 => hour,
            _ => return None,
        },
        None => hour,
    };
    NaiveTime::from_hms_opt(hour, minute, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn resolver() -> DateResolver {
        DateResolver::new(ymd(2025, 6, 15))
    }

    #[test]
    fn english_month_with_year() {
        let resolved = resolver().resolve_text("Nov 10, 2025").unwrap();
        assert_eq!(resolved.date.day, ymd(2025, 11, 10));
        assert_eq!(resolved.rule, ResolutionRule::MonthName);
    }

    #[test]
    fn french_month_with_ordinal_and_accent() {
        let r = resolver();
        assert_eq!(r.resolve_text("samedi 2e février 2026").unwrap().date.day, ymd(2026, 2, 2));
        assert_eq!(r.resolve_text("1er mai 2026").unwrap().date.day, ymd(2026, 5, 1));
        assert_eq!(r.resolve_text("11 NOVEMBRE 2025").unwrap().date.day, ymd(2025, 11, 11));
        assert_eq!(r.resolve_text("le 3 aout 2026").unwrap().date.day, ymd(2026, 8, 3));
    }

    #[test]
    fn explicit_year_is_preserved_even_in_the_past() {
        let r = resolver();
        for (text, year) in [
            ("March 3rd, 2019", 2019),
            ("Saturday, January 4 2031 8:00 PM", 2031),
            ("4 décembre 2024", 2024),
            ("2023-02-01", 2023),
            ("05/01/2029", 2029),
        ] {
            assert_eq!(r.resolve_text(text).unwrap().date.day.year(), year, "{text}");
        }
    }

    #[test]
    fn missing_year_infers_nearest_future_occurrence() {
        let r = resolver();
        assert_eq!(r.resolve_text("Jul 4").unwrap().date.day, ymd(2025, 7, 4));
        assert_eq!(r.resolve_text("June 1st").unwrap().date.day, ymd(2025, 6, 1));
        assert_eq!(r.resolve_text("Feb 11").unwrap().date.day, ymd(2026, 2, 11));
        assert_eq!(r.resolve_text("12 janvier").unwrap().date.day, ymd(2026, 1, 12));
    }

    #[test]
    fn french_weekday_abbreviation_is_not_read_as_march() {
        let r = resolver();
        assert_eq!(r.resolve_text("mar. 11 nov. 2025").unwrap().date.day, ymd(2025, 11, 11));
        assert_eq!(r.resolve_text("mar 11 novembre 2025").unwrap().date.day, ymd(2025, 11, 11));
        assert_eq!(r.resolve_text("Mar. 11 nov.").unwrap().date.day, ymd(2025, 11, 11));
        assert_eq!(r.resolve_text("ven. 3 oct. 2025 20h").unwrap().date.day, ymd(2025, 10, 3));
        assert_eq!(r.resolve_text("Mar 11, 2026").unwrap().date.day, ymd(2026, 3, 11));
        assert_eq!(r.resolve_text("Mar 11").unwrap().date.day, ymd(2026, 3, 11));
    }

    #[test]
    fn url_date_segment_wins_over_text() {
        let input = DateInput {
            text: Some("Nov 10, 2025"),
            url: Some("https://venue.example/events/2025/12/31/nye-party"),
            machine: Some("2025-11-11T20:00:00-05:00"),
        };
        let resolved = resolver().resolve(&input).unwrap();
        assert_eq!(resolved.date.day, ymd(2025, 12, 31));
        assert_eq!(resolved.rule, ResolutionRule::UrlPath);

        let dashed = resolver()
            .resolve(&DateInput {
                url: Some("https://venue.example/e/2026-01-09-open-mic"),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(dashed.date.day, ymd(2026, 1, 9));
    }

    #[test]
    fn machine_timestamp_beats_text_and_keeps_time() {
        let input = DateInput {
            text: Some("Nov 10, 2025"),
            url: Some("https://venue.example/events/live-jazz"),
            machine: Some("2025-11-11T20:30:00-05:00"),
        };
        let resolved = resolver().resolve(&input).unwrap();
        assert_eq!(resolved.rule, ResolutionRule::MachineReadable);
        assert_eq!(resolved.date.day, ymd(2025, 11, 11));
        assert_eq!(resolved.date.time, NaiveTime::from_hms_opt(20, 30, 0));
    }

    #[test]
    fn unparseable_machine_value_falls_through_to_text() {
        let input = DateInput {
            text: Some("Dec 5, 2025"),
            url: None,
            machine: Some("soon"),
        };
        let resolved = resolver().resolve(&input).unwrap();
        assert_eq!(resolved.rule, ResolutionRule::MonthName);
    }

    #[test]
    fn numeric_dates_prefer_day_first() {
        let r = resolver();
        assert_eq!(r.resolve_text("12/11/2025").unwrap().date.day, ymd(2025, 11, 12));
        assert_eq!(r.resolve_text("11/25/2025").unwrap().date.day, ymd(2025, 11, 25));
        assert_eq!(r.resolve_text("2025-11-10").unwrap().date.day, ymd(2025, 11, 10));
        assert_eq!(r.resolve_text("03.04.26").unwrap().date.day, ymd(2026, 4, 3));
        assert_eq!(r.resolve_text("2025-11-10").unwrap().rule, ResolutionRule::Numeric);
    }

    #[test]
    fn unresolvable_text_returns_nothing() {
        let r = resolver();
        for text in ["TBD", "today", "Tonight!", "Date TBA", "", "Feb 30, 2026", "Room 101"] {
            assert!(r.resolve_text(text).is_none(), "{text}");
        }
        assert!(r.resolve(&DateInput::default()).is_none());
    }

    #[test]
    fn time_of_day_is_extracted() {
        let r = resolver();
        let at = |text: &str| r.resolve_text(text).unwrap().date.time;
        assert_eq!(at("Nov 10, 2025 7:30 PM"), NaiveTime::from_hms_opt(19, 30, 0));
        assert_eq!(at("Nov 10, 2025 - 8pm"), NaiveTime::from_hms_opt(20, 0, 0));
        assert_eq!(at("10 novembre 2025 à 20h30"), NaiveTime::from_hms_opt(20, 30, 0));
        assert_eq!(at("Nov 10, 2025"), None);
        assert_eq!(extract_time("12am"), NaiveTime::from_hms_opt(0, 0, 0));
    }

    #[test]
    fn date_only_labels_are_detected() {
        for text in [
            "February 11, 2026",
            "Feb. 11",
            "Friday, Feb 13",
            "11 novembre 2025",
            "2025-11-11",
            "11/11/2025",
            "November 2025",
            "  Tonight ",
            "sam. 15 nov.",
            "dim. 9 novembre",
            "mar. 11 nov. 2025",
            "ven 3 octobre",
        ] {
            assert!(is_date_only(text), "{text}");
        }
        for text in ["Live Jazz Night", "May Day Parade", "Nov 10 Album Release Show", "1999"] {
            assert!(!is_date_only(text), "{text}");
        }
    }

    #[test]
    fn month_index_handles_case_accents_and_trailing_dot() {
        assert_eq!(month_index("Sept."), Some(9));
        assert_eq!(month_index("DÉCEMBRE"), Some(12));
        assert_eq!(month_index("smarch"), None);
    }
}
