// Domain model - customers and their meter readings
//
// Identity (UUID) is assigned once and never changes; every other field is
// replaced wholesale by an explicit update call.

use chrono::NaiveDate;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Raised when text does not name a variant of one of the fixed vocabularies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {vocabulary} value '{value}'")]
pub struct ParseEnumError {
    pub vocabulary: &'static str,
    pub value: String,
}

// ============================================================================
// GENDER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
    #[default]
    #[serde(rename = "U")]
    Unspecified,
}

impl Gender {
    /// Canonical stored form
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "M",
            Gender::Female => "F",
            Gender::Unspecified => "U",
        }
    }
}

impl FromStr for Gender {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "M" => Ok(Gender::Male),
            "F" => Ok(Gender::Female),
            "U" => Ok(Gender::Unspecified),
            other => Err(ParseEnumError {
                vocabulary: "gender",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// KIND OF METER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KindOfMeter {
    Heating,
    Water,
    Electricity,
    /// Sentinel for readings whose unit label was not recognized at import
    #[default]
    Unknown,
}

impl KindOfMeter {
    pub const ALL: [KindOfMeter; 4] = [
        KindOfMeter::Heating,
        KindOfMeter::Water,
        KindOfMeter::Electricity,
        KindOfMeter::Unknown,
    ];

    /// Canonical stored form, also used by the meter-kind query predicate
    pub fn as_str(&self) -> &'static str {
        match self {
            KindOfMeter::Heating => "HEATING",
            KindOfMeter::Water => "WATER",
            KindOfMeter::Electricity => "ELECTRICITY",
            KindOfMeter::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for KindOfMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive; accepts only the canonical names.
impl FromStr for KindOfMeter {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KindOfMeter::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError {
                vocabulary: "kind of meter",
                value: s.to_string(),
            })
    }
}

/// Same case-insensitive policy as `FromStr`, so request bodies, query
/// strings and CLI arguments all accept e.g. `water`.
impl<'de> Deserialize<'de> for KindOfMeter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

// ============================================================================
// SQLITE CONVERSIONS (strict: unknown stored text is a hydration error)
// ============================================================================

impl ToSql for Gender {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Gender {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: ParseEnumError| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for KindOfMeter {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for KindOfMeter {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        // Stored values are always canonical upper-case; anything else is corrupt.
        KindOfMeter::ALL
            .into_iter()
            .find(|kind| kind.as_str() == text)
            .ok_or_else(|| {
                FromSqlError::Other(Box::new(ParseEnumError {
                    vocabulary: "kind of meter",
                    value: text.to_string(),
                }))
            })
    }
}

// ============================================================================
// CUSTOMER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub gender: Gender,
    /// Absent when the source data omits it
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
}

impl Customer {
    /// Create a customer with a freshly generated identity
    pub fn new(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        gender: Gender,
        birth_date: Option<NaiveDate>,
    ) -> Self {
        Customer {
            id: Uuid::new_v4(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            gender,
            birth_date,
        }
    }
}

// ============================================================================
// READING
// ============================================================================

/// One measurement event, referencing its owning customer by identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub id: Uuid,
    #[serde(default)]
    pub comment: String,
    pub customer_id: Uuid,
    pub date_of_reading: NaiveDate,
    #[serde(default)]
    pub kind_of_meter: KindOfMeter,
    pub meter_count: f64,
    #[serde(default)]
    pub meter_id: String,
    /// Estimated rather than measured
    #[serde(default)]
    pub substitute: bool,
}

/// Query result: a reading with its fully materialized owning customer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingDetail {
    #[serde(flatten)]
    pub reading: Reading,
    pub customer: Customer,
}
