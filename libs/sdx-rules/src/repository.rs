//! Rules Repository - SQLite persistence for rules and manager counters
//!
//! The `rule` column holds a versioned JSON envelope ([`StoredRule`]) that
//! carries the rule's JSON view next to its type-specific body, so listings
//! never need the rule type's decoder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};

use crate::error::{Result, RuleError};
use crate::policy::PolicyRegistry;
use crate::query::{FilterValue, RuleFilter, RuleOrdering};
use crate::time::{format_time, parse_time};
use crate::types::{
    Breakdown, LcRule, ResourceId, Rule, RuleDetails, RuleHash, RuleState, RuleSummary,
};

/// Current envelope version written to the `rule` column
pub const STORED_RULE_VERSION: u32 = 1;

const KEY_RULE_NUMBER: &str = "rule_number";
const KEY_LAST_MODIFIED: &str = "last_modified";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS rules (
        hash INTEGER PRIMARY KEY,
        rule TEXT NOT NULL,
        ruletype TEXT NOT NULL,
        "user" TEXT NOT NULL,
        state TEXT NOT NULL,
        starttime TEXT,
        stoptime TEXT,
        extendedbd TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_rules_state_start ON rules (state, starttime)",
    "CREATE INDEX IF NOT EXISTS idx_rules_state_stop ON rules (state, stoptime)",
    r#"
    CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
];

const RULE_COLUMNS: &str =
    r#"hash, rule, ruletype, "user", state, starttime, stoptime, extendedbd"#;

/// Serialized form of a rule as written to the `rule` column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRule {
    pub version: u32,
    pub ruletype: String,
    pub user: String,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub stop_time: Option<String>,
    #[serde(default)]
    pub resources: Vec<ResourceId>,
    #[serde(default)]
    pub breakdown: Vec<Breakdown>,
    /// JSON view captured at admission
    #[serde(default)]
    pub view: Value,
    /// Rule-type specific body
    #[serde(default)]
    pub policy: Value,
}

impl StoredRule {
    pub fn from_rule(rule: &Rule) -> Result<Self> {
        let policy = rule.policy.encode().map_err(|e| {
            RuleError::Serialization(format!("failed to encode '{}' rule: {}", rule.rule_type(), e))
        })?;

        Ok(Self {
            version: STORED_RULE_VERSION,
            ruletype: rule.rule_type().to_string(),
            user: rule.user.clone(),
            start_time: rule.start_time.as_ref().map(format_time),
            stop_time: rule.stop_time.as_ref().map(format_time),
            resources: rule.resources.clone(),
            breakdown: rule.breakdown.clone(),
            view: rule.policy.to_json(),
            policy,
        })
    }

    fn decode(text: &str) -> Result<Self> {
        let stored: StoredRule = serde_json::from_str(text)?;
        if stored.version > STORED_RULE_VERSION {
            return Err(RuleError::Serialization(format!(
                "stored rule version {} is newer than supported version {}",
                stored.version, STORED_RULE_VERSION
            )));
        }
        Ok(stored)
    }
}

/// One row of the rules table
#[derive(Debug, Clone)]
pub struct RuleRow {
    pub hash: RuleHash,
    pub stored: StoredRule,
    pub rule_type: String,
    pub user: String,
    pub state: RuleState,
    pub start_time: Option<String>,
    pub stop_time: Option<String>,
    pub extended: Vec<Breakdown>,
}

impl RuleRow {
    pub fn summary(&self) -> RuleSummary {
        RuleSummary {
            hash: self.hash,
            json: self.stored.view.clone(),
            rule_type: self.rule_type.clone(),
            user: self.user.clone(),
            state: self.state,
        }
    }

    pub fn details(&self) -> RuleDetails {
        let breakdowns = self
            .stored
            .breakdown
            .iter()
            .chain(self.extended.iter())
            .flat_map(Breakdown::lines)
            .collect();

        RuleDetails {
            hash: self.hash,
            json: self.stored.view.clone(),
            rule_type: self.rule_type.clone(),
            state: self.state,
            user: self.user.clone(),
            breakdowns,
        }
    }

    /// Rebuild the full rule through the policy registry
    pub fn into_rule(self, registry: &PolicyRegistry) -> Result<Rule> {
        let policy = registry.decode(&self.stored.ruletype, self.stored.policy)?;
        let start_time = self.stored.start_time.as_deref().map(parse_time).transpose()?;
        let stop_time = self.stored.stop_time.as_deref().map(parse_time).transpose()?;

        Ok(Rule {
            hash: Some(self.hash),
            user: self.stored.user,
            start_time,
            stop_time,
            resources: self.stored.resources,
            breakdown: self.stored.breakdown,
            extended_breakdown: self.extended,
            state: Some(self.state),
            policy,
        })
    }
}

/// Time column driving one of the two timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeColumn {
    Start,
    Stop,
}

impl TimeColumn {
    fn sql(&self) -> &'static str {
        match self {
            TimeColumn::Start => "starttime",
            TimeColumn::Stop => "stoptime",
        }
    }
}

/// Create tables and indexes if missing
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Seed the config scalars if missing, returning the next hash to assign
pub async fn init_config(pool: &SqlitePool, now: &DateTime<Utc>) -> Result<RuleHash> {
    sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?, '1')")
        .bind(KEY_RULE_NUMBER)
        .execute(pool)
        .await?;
    sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?, ?)")
        .bind(KEY_LAST_MODIFIED)
        .bind(format_time(now))
        .execute(pool)
        .await?;

    let next: i64 = sqlx::query_scalar("SELECT CAST(value AS INTEGER) FROM config WHERE key = ?")
        .bind(KEY_RULE_NUMBER)
        .fetch_one(pool)
        .await?;
    Ok(next)
}

/// Take the next rule hash, advancing the persisted counter atomically
pub async fn next_rule_hash(pool: &SqlitePool) -> Result<RuleHash> {
    let hash: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE config
        SET value = CAST(value AS INTEGER) + 1
        WHERE key = ?
        RETURNING CAST(value AS INTEGER) - 1
        "#,
    )
    .bind(KEY_RULE_NUMBER)
    .fetch_optional(pool)
    .await?;

    hash.ok_or_else(|| RuleError::Manager("rule_number counter is not initialized".to_string()))
}

pub async fn touch_last_modified(pool: &SqlitePool, now: &DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE config SET value = ? WHERE key = ?")
        .bind(format_time(now))
        .bind(KEY_LAST_MODIFIED)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn last_modified(pool: &SqlitePool) -> Result<String> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM config WHERE key = ?")
        .bind(KEY_LAST_MODIFIED)
        .fetch_optional(pool)
        .await?;
    value.ok_or_else(|| RuleError::NotFound(KEY_LAST_MODIFIED.to_string()))
}

/// Delete every rule owned by `user`, returning the number of rows removed
pub async fn delete_rules_by_user(pool: &SqlitePool, user: &str) -> Result<u64> {
    let result = sqlx::query(r#"DELETE FROM rules WHERE "user" = ?"#)
        .bind(user)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn insert_rule(
    pool: &SqlitePool,
    hash: RuleHash,
    stored: &StoredRule,
    state: RuleState,
) -> Result<()> {
    let rule_json = serde_json::to_string(stored)?;

    sqlx::query(
        r#"
        INSERT INTO rules (hash, rule, ruletype, "user", state, starttime, stoptime, extendedbd)
        VALUES (?, ?, ?, ?, ?, ?, ?, NULL)
        "#,
    )
    .bind(hash)
    .bind(&rule_json)
    .bind(&stored.ruletype)
    .bind(&stored.user)
    .bind(state.as_str())
    .bind(&stored.start_time)
    .bind(&stored.stop_time)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a single row by hash
pub async fn get_rule_row(pool: &SqlitePool, hash: RuleHash) -> Result<Option<RuleRow>> {
    let row = sqlx::query(&format!("SELECT {} FROM rules WHERE hash = ?", RULE_COLUMNS))
        .bind(hash)
        .fetch_optional(pool)
        .await?;

    row.map(hydrate_rule_row).transpose()
}

/// All rows, in hash order
pub async fn load_all_rows(pool: &SqlitePool) -> Result<Vec<RuleRow>> {
    let rows = sqlx::query(&format!("SELECT {} FROM rules ORDER BY hash ASC", RULE_COLUMNS))
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(hydrate_rule_row).collect()
}

/// Rows in `state` with a bounded `column`, earliest first
pub async fn load_pending_rows(
    pool: &SqlitePool,
    state: RuleState,
    column: TimeColumn,
) -> Result<Vec<RuleRow>> {
    let sql = format!(
        "SELECT {cols} FROM rules WHERE state = ? AND {col} IS NOT NULL ORDER BY {col} ASC, hash ASC",
        cols = RULE_COLUMNS,
        col = column.sql()
    );
    let rows = sqlx::query(&sql)
        .bind(state.as_str())
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(hydrate_rule_row).collect()
}

/// Earliest bounded `column` among rows in `state`
pub async fn earliest_pending(
    pool: &SqlitePool,
    state: RuleState,
    column: TimeColumn,
) -> Result<Option<DateTime<Utc>>> {
    let sql = format!(
        "SELECT {col} FROM rules WHERE state = ? AND {col} IS NOT NULL ORDER BY {col} ASC LIMIT 1",
        col = column.sql()
    );
    let next: Option<String> = sqlx::query_scalar(&sql)
        .bind(state.as_str())
        .fetch_optional(pool)
        .await?;

    next.as_deref().map(parse_time).transpose()
}

/// Move a row from `from` to `to`; false if the row is gone or no longer in `from`
pub async fn transition_state(
    pool: &SqlitePool,
    hash: RuleHash,
    from: RuleState,
    to: RuleState,
) -> Result<bool> {
    let result = sqlx::query("UPDATE rules SET state = ? WHERE hash = ? AND state = ?")
        .bind(to.as_str())
        .bind(hash)
        .bind(from.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Replace the extended breakdown column
pub async fn set_extended_breakdown(
    pool: &SqlitePool,
    hash: RuleHash,
    extended: &[Breakdown],
) -> Result<()> {
    let extended_json = serde_json::to_string(extended)?;
    let result = sqlx::query("UPDATE rules SET extendedbd = ? WHERE hash = ?")
        .bind(&extended_json)
        .bind(hash)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(RuleError::NotFound(hash.to_string()));
    }
    Ok(())
}

/// Delete a rule
pub async fn delete_rule(pool: &SqlitePool, hash: RuleHash) -> Result<()> {
    let result = sqlx::query("DELETE FROM rules WHERE hash = ?")
        .bind(hash)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(RuleError::NotFound(hash.to_string()));
    }
    Ok(())
}

/// List rules matching `filter`
pub async fn list_rules(
    pool: &SqlitePool,
    filter: &RuleFilter,
    ordering: Option<&RuleOrdering>,
) -> Result<Vec<RuleSummary>> {
    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {} FROM rules WHERE 1 = 1", RULE_COLUMNS));

    for (column, value) in filter.conditions() {
        builder.push(" AND ").push(column.sql());
        match value {
            FilterValue::Int(v) => {
                builder.push(" = ").push_bind(*v);
            },
            FilterValue::Text(v) => {
                builder.push(" = ").push_bind(v.clone());
            },
            FilterValue::Null => {
                builder.push(" IS NULL");
            },
        }
    }

    let ordering = ordering.copied().unwrap_or_default();
    builder
        .push(" ORDER BY ")
        .push(ordering.column.sql())
        .push(if ordering.descending { " DESC" } else { " ASC" });
    if ordering.column.name() != "hash" {
        builder.push(", hash ASC");
    }

    let rows = builder.build().fetch_all(pool).await?;

    let mut summaries = Vec::with_capacity(rows.len());
    for row in rows {
        summaries.push(hydrate_rule_row(row)?.summary());
    }
    Ok(summaries)
}

/// Details of one rule, or `None` if unknown
pub async fn rule_details(pool: &SqlitePool, hash: RuleHash) -> Result<Option<RuleDetails>> {
    Ok(get_rule_row(pool, hash).await?.map(|row| row.details()))
}

/// Every stored rule's base breakdown entries for one local controller
pub async fn breakdowns_for_lc(pool: &SqlitePool, lc: &str) -> Result<Vec<LcRule>> {
    let rows = load_all_rows(pool).await?;

    let mut entries = Vec::new();
    for row in rows {
        for bd in row.stored.breakdown {
            if bd.lc == lc {
                entries.extend(bd.rules);
            }
        }
    }
    Ok(entries)
}

/// Hydrate a row into a RuleRow
fn hydrate_rule_row(row: SqliteRow) -> Result<RuleRow> {
    let hash: i64 = row.try_get("hash")?;
    let rule_json: String = row.try_get("rule")?;
    let rule_type: String = row.try_get("ruletype")?;
    let user: String = row.try_get("user")?;
    let state_str: String = row.try_get("state")?;
    let start_time: Option<String> = row.try_get("starttime")?;
    let stop_time: Option<String> = row.try_get("stoptime")?;
    let extended_json: Option<String> = row.try_get("extendedbd")?;

    let stored = StoredRule::decode(&rule_json)
        .map_err(|e| RuleError::Serialization(format!("rule {}: {}", hash, e)))?;
    let state: RuleState = state_str.parse().map_err(|_| {
        RuleError::Database(format!("rule {} has unknown state '{}'", hash, state_str))
    })?;
    let extended: Vec<Breakdown> = match extended_json.as_deref() {
        Some(text) => serde_json::from_str::<Option<Vec<Breakdown>>>(text)
            .map_err(|e| RuleError::Serialization(format!("extendedbd of {}: {}", hash, e)))?
            .unwrap_or_default(),
        None => Vec::new(),
    };

    Ok(RuleRow {
        hash,
        stored,
        rule_type,
        user,
        state,
        start_time,
        stop_time,
        extended,
    })
}
