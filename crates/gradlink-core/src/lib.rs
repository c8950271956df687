//! Core domain model for the graduate profile reconciler.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gradlink-core";

/// Fixed textual format of qualifying dates in the source dataset (day/month/year).
pub const QUALIFYING_DATE_FORMAT: &str = "%d/%m/%Y";

/// Length of allocated catalog id tokens (hex characters).
pub const PROFILE_ID_LEN: usize = 8;

/// One row of the source dataset. Produced once by dataset loading and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub name: String,
    #[serde(default)]
    pub course: String,
    #[serde(default)]
    pub affiliation: String,
    #[serde(default)]
    pub graduation_date: String,
}

/// A committed match, owned exclusively by the master store. The id is
/// assigned once at merge time and never reassigned; the profile URL is the
/// storage dedup key and is always non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub id: String,
    pub name: String,
    pub course: String,
    pub affiliation: String,
    pub graduation_date: String,
    pub profile_url: String,
    pub last_updated: DateTime<Utc>,
}

/// Outcome of one resolver call for one candidate. A missing or empty URL
/// means the candidate stayed unmatched this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCandidate {
    pub candidate: CandidateRecord,
    pub profile_url: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedCandidate {
    pub fn is_match(&self) -> bool {
        self.profile_url.as_deref().is_some_and(|url| !url.is_empty())
    }
}

/// Canonical form of a candidate name for resume/skip bookkeeping.
///
/// Resume identity is the trimmed name; storage identity is the profile URL.
/// The two keys are deliberately distinct: the name index decides whether a
/// candidate is attempted again, the URL index decides whether a result is
/// stored.
pub fn canonical_name(raw: &str) -> &str {
    raw.trim()
}

/// Rolling trailing window of calendar years admitting candidate and master
/// records. With the default span of two years a record qualifies iff its
/// parsed year is the reference year or the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibilityWindow {
    pub reference_year: i32,
    pub span_years: i32,
}

impl EligibilityWindow {
    /// Window anchored at the current calendar year. The anchor is taken at
    /// call time, so the window silently advances each year.
    pub fn trailing(span_years: i32) -> Self {
        Self::anchored(Utc::now().year(), span_years)
    }

    pub fn anchored(reference_year: i32, span_years: i32) -> Self {
        Self {
            reference_year,
            span_years: span_years.max(1),
        }
    }

    /// True iff the date parses in the fixed day/month/year format and its
    /// year falls inside the window. Malformed dates are excluded, never an
    /// error.
    pub fn admits(&self, date: &str) -> bool {
        match NaiveDate::parse_from_str(date.trim(), QUALIFYING_DATE_FORMAT) {
            Ok(parsed) => {
                let year = parsed.year();
                year <= self.reference_year && year > self.reference_year - self.span_years
            }
            Err(_) => false,
        }
    }
}

impl Default for EligibilityWindow {
    fn default() -> Self {
        Self::trailing(2)
    }
}

/// Allocate a short random token absent from `used`. The token space is
/// large enough that collisions are rare; the retry loop makes the contract
/// unconditional regardless.
pub fn allocate_profile_id(used: &HashSet<String>) -> String {
    loop {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(PROFILE_ID_LEN);
        if !used.contains(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_admits_reference_year_and_previous() {
        let window = EligibilityWindow::anchored(2025, 2);
        assert!(window.admits("15/06/2025"));
        assert!(window.admits("01/12/2024"));
    }

    #[test]
    fn window_rejects_outside_years_and_garbage() {
        let window = EligibilityWindow::anchored(2025, 2);
        assert!(!window.admits("15/06/2023"));
        assert!(!window.admits("15/06/2026"));
        assert!(!window.admits("2025-06-15"));
        assert!(!window.admits("31/02/2025"));
        assert!(!window.admits(""));
        assert!(!window.admits("soon"));
    }

    #[test]
    fn window_span_is_configurable() {
        let window = EligibilityWindow::anchored(2025, 3);
        assert!(window.admits("10/10/2023"));
        assert!(!window.admits("10/10/2022"));
    }

    #[test]
    fn window_tolerates_surrounding_whitespace() {
        let window = EligibilityWindow::anchored(2025, 2);
        assert!(window.admits(" 15/06/2025 "));
    }

    #[test]
    fn allocator_never_repeats_within_a_session() {
        let mut used = HashSet::new();
        for _ in 0..500 {
            let id = allocate_profile_id(&used);
            assert_eq!(id.len(), PROFILE_ID_LEN);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(used.insert(id));
        }
    }

    #[test]
    fn canonical_name_trims_only() {
        assert_eq!(canonical_name("  Maria Silva "), "Maria Silva");
        assert_eq!(canonical_name("MARIA"), "MARIA");
    }
}
