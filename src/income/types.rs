use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error_handling::types::TrackerError;

/// Placeholder stored when the user leaves the description empty.
pub const DEFAULT_DESCRIPTION: &str = "No description";

/// Kind of income recorded by an entry.
///
/// Only `Job` income counts against the eligibility limit. `FixedBenefit` is
/// the monthly SSI payment and always carries the configured fixed amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncomeType {
    #[serde(rename = "job")]
    Job,
    #[serde(rename = "ssi")]
    FixedBenefit,
}

impl IncomeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncomeType::Job => "job",
            IncomeType::FixedBenefit => "ssi",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            IncomeType::Job => "Job Income",
            IncomeType::FixedBenefit => "SSI Income",
        }
    }
}

impl fmt::Display for IncomeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncomeType {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "job" => Ok(IncomeType::Job),
            "ssi" | "fixed-benefit" | "fixed_benefit" => Ok(IncomeType::FixedBenefit),
            other => Err(TrackerError::InvalidInput(format!(
                "unknown income type '{}'",
                other
            ))),
        }
    }
}

fn default_description() -> String {
    DEFAULT_DESCRIPTION.to_string()
}

/// The single persisted entity.
///
/// Field names on the wire follow the layout every backend already stores:
/// `type`, `userId` and a millisecond `timestamp`. Unknown fields (such as a
/// document handle some backends attach) are dropped on deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomeEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: IncomeType,
    pub amount: f64,
    /// ISO 8601 calendar date (`YYYY-MM-DD`).
    pub date: String,
    #[serde(default = "default_description")]
    pub description: String,
    /// Creation instant in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl IncomeEntry {
    /// Parsed calendar date, `None` when the stored string is not `YYYY-MM-DD`.
    pub fn calendar_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").ok()
    }

    /// Copy of the entry stamped with the owning user, or unchanged when unscoped.
    pub fn scoped_to(&self, user_id: Option<&str>) -> IncomeEntry {
        let mut entry = self.clone();
        if let Some(uid) = user_id {
            entry.user_id = Some(uid.to_string());
        }
        entry
    }

    /// Newest date first; equal dates keep creation order, then id order.
    ///
    /// Entries whose date does not parse sort after every dated entry.
    pub fn display_order(a: &IncomeEntry, b: &IncomeEntry) -> Ordering {
        match (a.calendar_date(), b.calendar_date()) {
            (Some(da), Some(db)) => db.cmp(&da),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.id.cmp(&b.id))
    }
}

/// Sorts entries in place with [`IncomeEntry::display_order`].
pub fn sort_for_display(entries: &mut [IncomeEntry]) {
    entries.sort_by(IncomeEntry::display_order);
}

/// Eligibility constants used by the summary and by entry construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Monthly job income allowed before benefits are affected.
    pub income_limit: f64,
    /// Fixed monthly benefit amount carried by every fixed-benefit entry.
    pub fixed_benefit_amount: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            income_limit: 1600.0,
            fixed_benefit_amount: 1798.0,
        }
    }
}

/// Form input for a new entry, before an id and timestamp are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIncome {
    pub kind: IncomeType,
    pub amount: Option<f64>,
    pub date: String,
    pub description: Option<String>,
}

impl NewIncome {
    pub fn job(amount: f64, date: &str) -> Self {
        Self {
            kind: IncomeType::Job,
            amount: Some(amount),
            date: date.to_string(),
            description: None,
        }
    }

    pub fn fixed_benefit(date: &str) -> Self {
        Self {
            kind: IncomeType::FixedBenefit,
            amount: None,
            date: date.to_string(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Validates the input and builds an entry with a fresh id.
    ///
    /// Fixed-benefit entries ignore any supplied amount. The owning user is
    /// never set here; the storage layer stamps it.
    pub fn into_entry(self, thresholds: &Thresholds) -> Result<IncomeEntry, TrackerError> {
        let amount = match self.kind {
            IncomeType::FixedBenefit => thresholds.fixed_benefit_amount,
            IncomeType::Job => self.amount.ok_or_else(|| {
                TrackerError::InvalidInput("job income requires an amount".to_string())
            })?,
        };
        if !amount.is_finite() || amount < 0.0 {
            return Err(TrackerError::InvalidInput(format!(
                "amount must be a non-negative number, got {}",
                amount
            )));
        }
        let date = NaiveDate::parse_from_str(self.date.trim(), "%Y-%m-%d").map_err(|e| {
            TrackerError::InvalidInput(format!("invalid date '{}': {}", self.date, e))
        })?;
        let description = self
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(default_description);

        Ok(IncomeEntry {
            id: generate_entry_id(),
            kind: self.kind,
            amount,
            date: date.format("%Y-%m-%d").to_string(),
            description,
            timestamp: Utc::now().timestamp_millis(),
            user_id: None,
        })
    }
}

/// Short random identifier for a new entry.
pub fn generate_entry_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, date: &str, timestamp: i64) -> IncomeEntry {
        IncomeEntry {
            id: id.into(),
            kind: IncomeType::Job,
            amount: 10.0,
            date: date.into(),
            description: DEFAULT_DESCRIPTION.into(),
            timestamp,
            user_id: None,
        }
    }

    #[test]
    fn test_wire_format_uses_original_field_names() {
        let mut e = entry("a1", "2024-03-01", 7);
        e.user_id = Some("u1".into());
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "job");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["timestamp"], 7);
    }

    #[test]
    fn test_missing_description_defaults_and_unknown_fields_are_dropped() {
        let e: IncomeEntry = serde_json::from_str(
            r#"{"id":"x","type":"ssi","amount":1798,"date":"2024-01-01","firestoreId":"doc9"}"#,
        )
        .unwrap();
        assert_eq!(e.description, DEFAULT_DESCRIPTION);
        assert_eq!(e.kind, IncomeType::FixedBenefit);
        assert!(!serde_json::to_string(&e).unwrap().contains("firestoreId"));
    }

    #[test]
    fn test_display_order_newest_first_then_creation_order() {
        let mut list = vec![
            entry("c", "2024-02-01", 1),
            entry("b", "2024-03-01", 5),
            entry("a", "2024-03-01", 2),
            entry("z", "garbage", 0),
        ];
        sort_for_display(&mut list);
        let ids: Vec<_> = list.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "z"]);
    }

    #[test]
    fn test_fixed_benefit_amount_is_forced() {
        let t = Thresholds::default();
        let mut input = NewIncome::fixed_benefit("2024-05-01");
        input.amount = Some(5.0);
        let e = input.into_entry(&t).unwrap();
        assert_eq!(e.amount, 1798.0);
        assert_eq!(e.description, DEFAULT_DESCRIPTION);
        assert!(e.user_id.is_none());
        assert!(!e.id.is_empty());
    }

    #[test]
    fn test_negative_amount_and_bad_date_rejected() {
        let t = Thresholds::default();
        assert!(NewIncome::job(-1.0, "2024-05-01").into_entry(&t).is_err());
        assert!(NewIncome::job(1.0, "05/01/2024").into_entry(&t).is_err());
        assert!(NewIncome::job(f64::NAN, "2024-05-01").into_entry(&t).is_err());
    }

    #[test]
    fn test_income_type_parsing() {
        assert_eq!("job".parse::<IncomeType>().unwrap(), IncomeType::Job);
        assert_eq!("SSI".parse::<IncomeType>().unwrap(), IncomeType::FixedBenefit);
        assert!("salary".parse::<IncomeType>().is_err());
    }
}
