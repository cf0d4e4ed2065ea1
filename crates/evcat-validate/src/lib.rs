//! Candidate title validation: separates event-like titles from navigation and UI chrome.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use evcat_core::collapse_whitespace;
use evcat_dates::is_date_only;
use serde::Deserialize;

pub const CRATE_NAME: &str = "evcat-validate";

pub const DEFAULT_MIN_LENGTH: usize = 3;
pub const DEFAULT_MAX_LENGTH: usize = 150;

/// Lower-case terms that mark a captured string as page chrome rather than an event.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "menu",
    "navigation",
    "skip to",
    "login",
    "log in",
    "sign in",
    "sign up",
    "subscribe",
    "newsletter",
    "filter",
    "sort by",
    "calendar",
    "cookie",
    "privacy policy",
    "terms of use",
    "terms and conditions",
    "read more",
    "learn more",
    "view all",
    "see all",
    "load more",
    "show more",
    "click here",
    "search results",
    "search events",
    "buy tickets",
    "get tickets",
    "tickets on sale",
    "tickets only",
    "box office",
    "gift card",
    "follow us",
    "share this",
    "facebook",
    "instagram",
    "twitter",
    "youtube",
    "advertisement",
    "sponsored",
    "événements passés",
    "tous les événements",
    "infolettre",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorRules {
    pub min_length: usize,
    pub max_length: usize,
    pub denylist: Vec<String>,
}

impl Default for ValidatorRules {
    fn default() -> Self {
        Self {
            min_length: DEFAULT_MIN_LENGTH,
            max_length: DEFAULT_MAX_LENGTH,
            denylist: DEFAULT_DENYLIST.iter().map(|t| t.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DenylistFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    min_length: Option<usize>,
    #[serde(default)]
    max_length: Option<usize>,
    #[serde(default)]
    denylist: Vec<String>,
}

impl ValidatorRules {
    /// Built-in rules extended by `rules/denylist.yaml`.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: DenylistFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let mut rules = Self::default();
        if let Some(min) = file.min_length {
            rules.min_length = min;
        }
        if let Some(max) = file.max_length {
            rules.max_length = max;
        }
        for term in file.denylist {
            let term = term.trim().to_lowercase();
            if !term.is_empty() && !rules.denylist.contains(&term) {
                rules.denylist.push(term);
            }
        }
        Ok(rules)
    }

    /// Built-in rules, extended from `path` only when the file exists.
    pub fn from_optional_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_yaml_file(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    TooShort { length: usize },
    TooLong { length: usize },
    Denylisted { term: String },
    DateOnlyTitle,
    DuplicateInBatch,
}

impl RejectReason {
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::TooShort { .. } => "too_short",
            RejectReason::TooLong { .. } => "too_long",
            RejectReason::Denylisted { .. } => "denylisted",
            RejectReason::DateOnlyTitle => "date_only_title",
            RejectReason::DuplicateInBatch => "duplicate_in_batch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// One validator per batch: accepted titles are remembered to reject repeats.
#[derive(Debug, Clone)]
pub struct CandidateValidator {
    rules: ValidatorRules,
    accepted: HashSet<String>,
}

impl CandidateValidator {
    pub fn new(rules: ValidatorRules) -> Self {
        let rules = ValidatorRules {
            denylist: rules.denylist.iter().map(|t| t.to_lowercase()).collect(),
            ..rules
        };
        Self {
            rules,
            accepted: HashSet::new(),
        }
    }

    pub fn rules(&self) -> &ValidatorRules {
        &self.rules
    }

    pub fn check(&mut self, title: &str) -> Verdict {
        let collapsed = collapse_whitespace(title);
        let length = collapsed.chars().count();
        if length < self.rules.min_length {
            return Verdict::Reject(RejectReason::TooShort { length });
        }
        if length > self.rules.max_length {
            return Verdict::Reject(RejectReason::TooLong { length });
        }

        let lower = collapsed.to_lowercase();
        if let Some(term) = self.rules.denylist.iter().find(|t| lower.contains(t.as_str())) {
            return Verdict::Reject(RejectReason::Denylisted { term: term.clone() });
        }
        if is_date_only(&collapsed) {
            return Verdict::Reject(RejectReason::DateOnlyTitle);
        }
        if !self.accepted.insert(lower) {
            return Verdict::Reject(RejectReason::DuplicateInBatch);
        }
        Verdict::Accept
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }
}

impl Default for CandidateValidator {
    fn default() -> Self {
        Self::new(ValidatorRules::default())
    }
}
