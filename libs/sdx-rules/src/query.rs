//! Rule listing filters and ordering
//!
//! Filters arrive as JSON objects (REST payloads, CLI `key=value` pairs) and
//! are restricted to a fixed set of searchable columns.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{Result, RuleError};
use crate::time::{format_time, parse_time};
use crate::types::RuleState;

/// Columns that may appear in a filter or ordering
pub const SEARCH_FIELDS: &[&str] = &["hash", "ruletype", "user", "state", "starttime", "stoptime"];

/// Searchable rule table column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleColumn {
    Hash,
    RuleType,
    User,
    State,
    StartTime,
    StopTime,
}

impl RuleColumn {
    pub fn name(&self) -> &'static str {
        match self {
            RuleColumn::Hash => "hash",
            RuleColumn::RuleType => "ruletype",
            RuleColumn::User => "user",
            RuleColumn::State => "state",
            RuleColumn::StartTime => "starttime",
            RuleColumn::StopTime => "stoptime",
        }
    }

    /// Identifier as written in SQL
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            RuleColumn::User => "\"user\"",
            other => other.name(),
        }
    }
}

impl fmt::Display for RuleColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RuleColumn {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hash" => Ok(RuleColumn::Hash),
            "ruletype" => Ok(RuleColumn::RuleType),
            "user" => Ok(RuleColumn::User),
            "state" => Ok(RuleColumn::State),
            "starttime" => Ok(RuleColumn::StartTime),
            "stoptime" => Ok(RuleColumn::StopTime),
            _ => Err(RuleError::Validation(format!(
                "column '{}' is not a valid filtering field {:?}",
                s, SEARCH_FIELDS
            ))),
        }
    }
}

/// Value compared against a column
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Int(i64),
    Text(String),
    Null,
}

/// Conjunction of column equality tests
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleFilter {
    conditions: Vec<(RuleColumn, FilterValue)>,
}

impl RuleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from an optional JSON object
    ///
    /// A non-object is a [`RuleError::Type`]; unknown keys and values of the
    /// wrong type are [`RuleError::Validation`].
    pub fn from_json(filter: Option<&Value>) -> Result<Self> {
        let Some(filter) = filter else {
            return Ok(Self::new());
        };
        let map = match filter {
            Value::Object(map) => map,
            Value::Null => return Ok(Self::new()),
            other => {
                return Err(RuleError::Type(format!(
                    "filter is not a mapping: {}",
                    json_type(other)
                )))
            },
        };

        let mut out = Self::new();
        for (key, value) in map {
            let column: RuleColumn = key.parse()?;
            out.conditions.push((column, coerce(column, value)?));
        }
        Ok(out)
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.conditions
            .push((RuleColumn::User, FilterValue::Text(user.into())));
        self
    }

    pub fn state(mut self, state: RuleState) -> Self {
        self.conditions.push((
            RuleColumn::State,
            FilterValue::Text(state.as_str().to_string()),
        ));
        self
    }

    pub fn rule_type(mut self, rule_type: impl Into<String>) -> Self {
        self.conditions
            .push((RuleColumn::RuleType, FilterValue::Text(rule_type.into())));
        self
    }

    pub fn conditions(&self) -> &[(RuleColumn, FilterValue)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// Listing order: a column, ascending unless written with a leading `-`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleOrdering {
    pub column: RuleColumn,
    pub descending: bool,
}

impl RuleOrdering {
    pub fn parse(ordering: &str) -> Result<Self> {
        let trimmed = ordering.trim();
        let (descending, name) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        Ok(Self {
            column: name.parse()?,
            descending,
        })
    }
}

impl Default for RuleOrdering {
    fn default() -> Self {
        Self {
            column: RuleColumn::Hash,
            descending: false,
        }
    }
}

fn coerce(column: RuleColumn, value: &Value) -> Result<FilterValue> {
    let mismatch = || {
        RuleError::Validation(format!(
            "filter value {} is not valid for column '{}'",
            value, column
        ))
    };

    match column {
        RuleColumn::Hash => match value {
            Value::Number(n) => n.as_i64().map(FilterValue::Int).ok_or_else(mismatch),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(FilterValue::Int)
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        RuleColumn::RuleType | RuleColumn::User => match value {
            Value::String(s) => Ok(FilterValue::Text(s.clone())),
            _ => Err(mismatch()),
        },
        RuleColumn::State => {
            let state = match value {
                Value::String(s) => s.parse::<RuleState>()?,
                Value::Number(n) => n
                    .as_i64()
                    .and_then(RuleState::from_code)
                    .ok_or_else(mismatch)?,
                _ => return Err(mismatch()),
            };
            Ok(FilterValue::Text(state.as_str().to_string()))
        },
        RuleColumn::StartTime | RuleColumn::StopTime => match value {
            Value::Null => Ok(FilterValue::Null),
            Value::String(s) => parse_time(s)
                .map(|t| FilterValue::Text(format_time(&t)))
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
