//! Row validation shared by file split and chunk ingest.

use chrono::NaiveDate;
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::persistence::{NewDebt, NewUser};
use crate::stages::events::Row;

pub const DUE_DATE_FORMAT: &str = "%Y-%m-%d";
const MAX_GOVERNMENT_ID_LEN: usize = 20;
const MAX_NAME_LEN: usize = 255;
const MAX_EMAIL_LEN: usize = 255;
/// Exclusive upper bound of a `NUMERIC(12, 2)` column
const MAX_DEBT_AMOUNT: f64 = 1e10;
const AMOUNT_DECIMALS: usize = 2;

fn email_pattern() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$")
            .expect("email pattern compiles")
    })
}

/// Row as read from CSV or a chunk message, all fields optional text
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRow {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub government_id: Option<String>,
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub debt_amount: Option<String>,
    pub debt_due_date: Option<String>,
    #[serde(default)]
    pub debt_id: Option<String>,
}

/// Accept numbers as well as strings; chunk messages carry amounts as JSON numbers
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    Missing(&'static str),
    Invalid { field: &'static str, reason: String },
    Malformed(String),
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowError::Missing(field) => write!(f, "missing field '{}'", field),
            RowError::Invalid { field, reason } => write!(f, "invalid '{}': {}", field, reason),
            RowError::Malformed(msg) => write!(f, "malformed row: {}", msg),
        }
    }
}

impl std::error::Error for RowError {}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, RowError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(RowError::Missing(field)),
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> RowError {
    RowError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Amounts are stored with two decimals; anything finer is rejected, not rounded
fn check_decimals(amount_text: &str) -> Result<(), RowError> {
    if amount_text.contains(['e', 'E']) {
        return Err(invalid("debtAmount", format!("'{}' is not a plain decimal", amount_text)));
    }
    let decimals = amount_text.split_once('.').map(|(_, fraction)| fraction.len()).unwrap_or(0);
    if decimals > AMOUNT_DECIMALS {
        return Err(invalid(
            "debtAmount",
            format!("'{}' has more than {} decimals", amount_text, AMOUNT_DECIMALS),
        ));
    }
    Ok(())
}

impl RawRow {
    /// Build from a CSV record by header name; columns stay verbatim text
    pub fn from_record(headers: &csv::StringRecord, record: &csv::StringRecord) -> Self {
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .and_then(|i| record.get(i))
                .map(str::to_string)
        };
        RawRow {
            name: column("name"),
            government_id: column("governmentId"),
            email: column("email"),
            debt_amount: column("debtAmount"),
            debt_due_date: column("debtDueDate"),
            debt_id: column("debtId"),
        }
    }

    /// Validate into a [`Row`]; a missing `debtId` takes `assigned_id`
    pub fn validate(&self, assigned_id: Option<Uuid>) -> Result<Row, RowError> {
        let name = required(&self.name, "name")?;
        if name.chars().count() > MAX_NAME_LEN {
            return Err(invalid("name", format!("longer than {} characters", MAX_NAME_LEN)));
        }

        let government_id = required(&self.government_id, "governmentId")?;
        if !government_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("governmentId", "must contain only digits"));
        }
        if government_id.len() > MAX_GOVERNMENT_ID_LEN {
            return Err(invalid(
                "governmentId",
                format!("longer than {} digits", MAX_GOVERNMENT_ID_LEN),
            ));
        }

        let email = required(&self.email, "email")?;
        if email.chars().count() > MAX_EMAIL_LEN {
            return Err(invalid("email", format!("longer than {} characters", MAX_EMAIL_LEN)));
        }
        if !email_pattern().is_match(email) {
            return Err(invalid("email", format!("'{}' is not an email address", email)));
        }

        let amount_text = required(&self.debt_amount, "debtAmount")?;
        let debt_amount: f64 = amount_text
            .parse()
            .map_err(|_| invalid("debtAmount", format!("'{}' is not a number", amount_text)))?;
        if !debt_amount.is_finite() || debt_amount < 0.0 {
            return Err(invalid("debtAmount", "must be a non-negative amount"));
        }
        if debt_amount >= MAX_DEBT_AMOUNT {
            return Err(invalid("debtAmount", format!("must be below {}", MAX_DEBT_AMOUNT)));
        }
        check_decimals(amount_text)?;

        let due_text = required(&self.debt_due_date, "debtDueDate")?;
        let due_date = NaiveDate::parse_from_str(due_text, DUE_DATE_FORMAT)
            .map_err(|e| invalid("debtDueDate", format!("'{}': {}", due_text, e)))?;

        let debt_id = match self.debt_id.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Uuid::parse_str(text)
                .map_err(|e| invalid("debtId", e.to_string()))?,
            _ => assigned_id.ok_or(RowError::Missing("debtId"))?,
        };

        Ok(Row {
            name: name.to_string(),
            government_id: government_id.to_string(),
            email: email.to_string(),
            debt_amount,
            debt_due_date: due_date.format(DUE_DATE_FORMAT).to_string(),
            debt_id,
        })
    }

    /// Parse an untyped chunk row and validate it; the debt id must be present
    pub fn validate_value(value: &serde_json::Value) -> Result<Row, RowError> {
        let raw: RawRow =
            serde_json::from_value(value.clone()).map_err(|e| RowError::Malformed(e.to_string()))?;
        raw.validate(None)
    }
}

impl Row {
    pub fn to_user(&self) -> NewUser {
        NewUser {
            name: self.name.clone(),
            government_id: self.government_id.clone(),
            email: self.email.clone(),
        }
    }

    pub fn to_debt(&self, file_id: Uuid) -> Result<NewDebt, RowError> {
        let due_date = NaiveDate::parse_from_str(&self.debt_due_date, DUE_DATE_FORMAT)
            .map_err(|e| invalid("debtDueDate", e.to_string()))?;
        Ok(NewDebt {
            debt_id: self.debt_id,
            government_id: self.government_id.clone(),
            file_id,
            amount: self.debt_amount,
            due_date,
        })
    }
}
