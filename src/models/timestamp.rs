//! Serde helpers for optional timestamps in the registry file.
//!
//! Older registry writers emit an unset time as `0001-01-01T00:00:00Z`
//! rather than omitting the field. Those read back as `None` so "never
//! happened" stays distinct from a real instant.

use chrono::{DateTime, Datelike, Utc};

pub mod optional {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_some(ts),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<DateTime<Utc>>::deserialize(deserializer)?;
        Ok(value.filter(|ts| ts.year() > 1))
    }
}
