//! Canonical CRM record model and per-field coercion for hubsync.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hubsync-core";

/// Lead status vocabulary used when seeding contacts.
pub const LEAD_STATUSES: [&str; 8] = [
    "NEW",
    "OPEN",
    "IN_PROGRESS",
    "OPEN_DEAL",
    "UNQUALIFIED",
    "ATTEMPTED_TO_CONTACT",
    "CONNECTED",
    "BAD_TIMING",
];

/// Deal stage vocabulary of the default HubSpot sales pipeline.
pub const DEAL_STAGES: [&str; 7] = [
    "appointmentscheduled",
    "qualifiedtobuy",
    "presentationscheduled",
    "decisionmakerboughtin",
    "contractsent",
    "closedwon",
    "closedlost",
];

pub const DEFAULT_DEAL_STAGE: &str = DEAL_STAGES[0];

/// A single wire field failed to coerce into its canonical type.
///
/// Callers collapse this to `None` at the normalizer boundary; the error is
/// kept explicit here so tests can distinguish "absent" from "failed to parse".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoercionError {
    #[error("`{raw}` is not a monetary amount")]
    InvalidAmount { raw: String },
    #[error("`{raw}` is not a recognizable timestamp")]
    InvalidTimestamp { raw: String },
}

/// Coerce a CRM monetary amount (always a string on the wire) to a float.
pub fn parse_amount(raw: &str) -> Result<f64, CoercionError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| CoercionError::InvalidAmount {
            raw: raw.to_string(),
        })
}

/// Parse a CRM timestamp property.
///
/// HubSpot emits RFC 3339 strings for date properties, but seed data and
/// older portals also show up as bare dates or epoch milliseconds.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, CoercionError> {
    let trimmed = raw.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&parsed));
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(midnight) = parsed.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&midnight));
        }
    }
    if let Ok(millis) = trimmed.parse::<i64>() {
        if let Some(parsed) = DateTime::from_timestamp_millis(millis) {
            return Ok(parsed);
        }
    }

    Err(CoercionError::InvalidTimestamp {
        raw: raw.to_string(),
    })
}

/// Canonical contact after field renaming, before status resolution.
///
/// Handoff contract from the normalizer into the status mapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDraft {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub lead_status: Option<String>,
}

/// Canonical persisted contact. `id` is the external identifier assigned by
/// the CRM and the idempotency key for upserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadRecord {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: String,
    pub lead_status: Option<String>,
    pub lead_status_id: i64,
}

/// Canonical persisted deal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRecord {
    pub id: String,
    pub deal_name: Option<String>,
    pub amount: Option<f64>,
    pub deal_stage: Option<String>,
    pub pipeline: Option<String>,
    pub deal_type: Option<String>,
    pub description: Option<String>,
    pub close_date: Option<DateTime<Utc>>,
    pub create_date: Option<DateTime<Utc>>,
}

/// Reference mapping from lead status label to numeric status identifier.
///
/// Loaded once per sync run and immutable for its duration; unknown, null and
/// absent labels all resolve to the default identifier 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusMapping {
    labels: BTreeMap<String, i64>,
}

impl StatusMapping {
    pub fn new(labels: BTreeMap<String, i64>) -> Self {
        Self { labels }
    }

    pub fn resolve(&self, label: Option<&str>) -> i64 {
        label
            .and_then(|l| self.labels.get(l))
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Rollup of persisted leads grouped by `lead_status_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadStatusSummary {
    pub id: i64,
    pub total: i64,
    /// First-seen label for the group; arbitrary when a group mixes labels.
    pub status: Option<String>,
}

/// Rollup of persisted deals grouped by `deal_stage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealStageSummary {
    pub id: Option<String>,
    pub total: i64,
    pub amount: f64,
}

/// Rollup of persisted deals grouped by close year, month and stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealCloseSummary {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub deal_stage: Option<String>,
    pub count: i64,
    pub amount: f64,
}

/// Tallies reported by a bulk conditional write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
}

impl UpsertOutcome {
    pub fn absorb(&mut self, other: UpsertOutcome) {
        self.matched += other.matched;
        self.modified += other.modified;
        self.upserted += other.upserted;
    }

    pub fn is_zero(&self) -> bool {
        self.matched == 0 && self.modified == 0 && self.upserted == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_coercion_accepts_plain_decimals() {
        assert_eq!(parse_amount("1500"), Ok(1500.0));
        assert_eq!(parse_amount(" 99.95 "), Ok(99.95));
    }

    #[test]
    fn amount_coercion_failure_is_an_error_not_a_panic() {
        assert!(matches!(
            parse_amount("not-a-number"),
            Err(CoercionError::InvalidAmount { .. })
        ));
        assert!(parse_amount("").is_err());
        assert!(parse_amount("$1,500").is_err());
    }

    #[test]
    fn timestamps_parse_from_rfc3339_bare_dates_and_epoch_millis() {
        let rfc = parse_timestamp("2025-03-15T10:30:00Z").expect("rfc3339");
        assert_eq!(rfc, Utc.with_ymd_and_hms(2025, 3, 15, 10, 30, 0).unwrap());

        let bare = parse_timestamp("2025-03-15").expect("bare date");
        assert_eq!(bare, Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap());

        let millis = parse_timestamp("1742034600000").expect("epoch millis");
        assert_eq!(millis, Utc.with_ymd_and_hms(2025, 3, 15, 10, 30, 0).unwrap());
    }

    #[test]
    fn unparsable_timestamp_is_an_error() {
        assert!(matches!(
            parse_timestamp("next tuesday"),
            Err(CoercionError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn status_mapping_falls_back_to_zero() {
        let mapping = StatusMapping::new(BTreeMap::from([
            ("NEW".to_string(), 1),
            ("OPEN".to_string(), 2),
        ]));

        assert_eq!(mapping.resolve(Some("OPEN")), 2);
        assert_eq!(mapping.resolve(Some("UNHEARD_OF")), 0);
        assert_eq!(mapping.resolve(None), 0);
    }

    #[test]
    fn upsert_outcome_absorbs_tallies() {
        let mut outcome = UpsertOutcome::default();
        assert!(outcome.is_zero());

        outcome.absorb(UpsertOutcome {
            matched: 2,
            modified: 1,
            upserted: 3,
        });
        outcome.absorb(UpsertOutcome {
            matched: 1,
            modified: 0,
            upserted: 0,
        });
        assert_eq!(outcome.matched, 3);
        assert_eq!(outcome.modified, 1);
        assert_eq!(outcome.upserted, 3);
        assert!(!outcome.is_zero());
    }
}
