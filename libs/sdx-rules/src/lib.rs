//! SDX Rules - Rule Manager Library
//!
//! Central bookkeeping for abstract network policies in the SDX controller:
//! - Admission pipeline (validity, breakdown, authorization) before persistence
//! - Install/expire lifecycle driven by two single-shot timers
//! - Dispatch of per local controller breakdowns, with dynamic extension
//! - SQLite persistence and filtered queries
//! - Install/remove observers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  add_rule   │────▶│  Inspectors  │     │ DispatchSink │
//! │ remove_rule │     │ (valid/bd/   │     │  (local      │
//! └─────────────┘     │  authorized) │     │ controllers) │
//!        │            └──────────────┘     └──────────────┘
//!        ▼                                        ▲
//! ┌─────────────┐     ┌──────────────┐            │
//! │ RuleManager │────▶│  Repository  │     install/uninstall
//! │ (lifecycle) │     │   (SQLite)   │            │
//! └─────────────┘     └──────────────┘            │
//!        ▲                   │                    │
//!        │                   ▼                    │
//! ┌─────────────┐     ┌──────────────┐            │
//! │  Observers  │     │Install/Remove│────────────┘
//! │             │     │    timers    │
//! └─────────────┘     └──────────────┘
//! ```

pub mod config;
mod error;
pub mod inspectors;
mod manager;
pub mod policy;
pub mod query;
pub mod repository;
pub mod scheduler;
pub mod time;
pub mod types;

// Re-export public API
pub use config::ManagerConfig;
pub use error::{Result, RuleError};
pub use inspectors::{
    AuthorizationInspector, BreakdownEngine, Collaborators, DispatchSink, ResourceRegistry,
    ValidityInspector,
};
pub use manager::{RuleCallback, RuleManager};
pub use policy::{Policy, PolicyContext, PolicyRegistry};
pub use query::{RuleFilter, RuleOrdering, SEARCH_FIELDS};
pub use scheduler::TimerKind;
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};

// Re-export rule types for convenience
pub use types::{
    Breakdown, LcRule, ResourceId, Rule, RuleDetails, RuleHash, RuleState, RuleSummary,
};
