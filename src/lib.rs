//! Embedded persistence, search and statistics core for a single-user,
//! offline-first clinic records application.
//!
//! The interface layer talks to one type, [`store::ClinicStore`]: open it
//! with [`config::StoreConfig`] (schema migrations run to completion before
//! it returns), call its repository, search, aggregate, export and backup
//! operations, and close it on shutdown. Everything underneath — the
//! bounded connection pool, the SQL repositories, the dirty-flag stats
//! cache — stays behind that facade.
//!
//! All operations are synchronous and blocking; offloading long scans or
//! backups to a background worker is the caller's job. Long scans accept a
//! [`search::CancelToken`].

pub mod auth;
pub mod backup;
pub mod config;
pub mod db;
pub mod export;
pub mod models;
pub mod search;
pub mod stats;
pub mod store;

pub use backup::{BackupReport, MergeReport};
pub use config::{DurabilityMode, StoreConfig, StoreLocation};
pub use db::{StoreError, StoreResult};
pub use models::{
    Account, AgeRange, CivilStatus, DateRange, Page, Patient, PatientFilter, PatientInput, Role,
    Sex, SortKey, Visit, VisitDetail, VisitInput, VisitSummary, VisitType,
};
pub use search::{CancelToken, PatientHit, QueryPlan};
pub use stats::StatKey;
pub use store::ClinicStore;
