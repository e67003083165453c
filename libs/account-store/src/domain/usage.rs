use crate::StoreError;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use std::fmt;

const PERIOD_FORMAT: &str = "%Y-%m";

/// Calendar month (UTC) that usage is bucketed into, e.g. `2024-05`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeriodKey(String);

impl PeriodKey {
    pub fn current() -> Self {
        Self::containing(Utc::now())
    }

    pub fn containing(at: DateTime<Utc>) -> Self {
        PeriodKey(at.format(PERIOD_FORMAT).to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let trimmed = raw.trim();
        NaiveDate::parse_from_str(&format!("{trimmed}-01"), "%Y-%m-%d")
            .map(|date| PeriodKey(format!("{:04}-{:02}", date.year(), date.month())))
            .map_err(|_| StoreError::Validation(format!("invalid period key: {raw:?}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What was done to a resource. Counted separately per action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ActionType(String);

impl ActionType {
    pub const PROCESSED: &'static str = "processed";

    pub fn new(name: impl Into<String>) -> Result<Self, StoreError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(StoreError::Validation("action type must not be empty".into()));
        }
        Ok(ActionType(name))
    }

    pub fn processed() -> Self {
        ActionType(Self::PROCESSED.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ActionType {
    fn default() -> Self {
        Self::processed()
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionCount {
    pub action_type: ActionType,
    pub distinct_resources: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_period_key_is_calendar_month() {
        let at = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap();
        assert_eq!(PeriodKey::containing(at).as_str(), "2024-02");
        let next = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_ne!(PeriodKey::containing(at), PeriodKey::containing(next));
    }

    #[test]
    fn test_period_key_parse() {
        assert_eq!(PeriodKey::parse("2024-5").unwrap().as_str(), "2024-05");
        assert_eq!(PeriodKey::parse(" 2023-12 ").unwrap().as_str(), "2023-12");
        assert!(PeriodKey::parse("2024-13").is_err());
        assert!(PeriodKey::parse("May 2024").is_err());
    }

    #[test]
    fn test_action_type_rejects_blank() {
        assert!(ActionType::new("  ").is_err());
        assert_eq!(ActionType::default().as_str(), "processed");
        assert_eq!(ActionType::new("summarized").unwrap().as_str(), "summarized");
    }
}
