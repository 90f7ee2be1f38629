//! Serde helpers for backend timestamps.
//!
//! Accepts RFC3339 strings or epoch milliseconds (integer or fractional) and
//! always writes RFC3339.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Millis(i64),
    Fractional(f64),
    Text(String),
}

impl RawTimestamp {
    fn resolve(self) -> Option<DateTime<Utc>> {
        match self {
            RawTimestamp::Millis(ms) => Utc.timestamp_millis_opt(ms).single(),
            RawTimestamp::Fractional(ms) if ms.is_finite() => {
                Utc.timestamp_millis_opt(ms.trunc() as i64).single()
            }
            RawTimestamp::Fractional(_) => None,
            RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(text.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    RawTimestamp::deserialize(deserializer)?
        .resolve()
        .ok_or_else(|| D::Error::custom("expected an RFC3339 timestamp or epoch milliseconds"))
}

/// Optional variant: absent, `null` and unparseable values all read as `None`.
pub mod option {
    use super::RawTimestamp;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match ts {
            Some(ts) => super::serialize(ts, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        Ok(raw
            .and_then(|value| RawTimestamp::deserialize(value).ok())
            .and_then(RawTimestamp::resolve))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Probe {
        #[serde(with = "super")]
        at: DateTime<Utc>,
        #[serde(default, with = "super::option")]
        until: Option<DateTime<Utc>>,
    }

    #[test]
    fn accepts_text_and_millis() {
        let a: Probe = serde_json::from_value(json!({"at": "2024-05-20T12:00:00Z"})).unwrap();
        let b: Probe = serde_json::from_value(json!({"at": 1_716_206_400_000i64})).unwrap();
        assert_eq!(a.at, b.at);
        assert!(a.until.is_none());
    }

    #[test]
    fn optional_tolerates_garbage() {
        let p: Probe =
            serde_json::from_value(json!({"at": 0, "until": "not a date"})).unwrap();
        assert!(p.until.is_none());
        let p: Probe = serde_json::from_value(json!({"at": 0, "until": 1500.7})).unwrap();
        assert_eq!(p.until.map(|t| t.timestamp_millis()), Some(1500));
    }

    #[test]
    fn writes_rfc3339() {
        let p: Probe = serde_json::from_value(json!({"at": 1_716_206_400_000i64})).unwrap();
        let out = serde_json::to_value(&p).unwrap();
        assert_eq!(out["at"], json!("2024-05-20T12:00:00Z"));
    }
}
