//! # crm-sync
//!
//! Incremental CRM-to-analytics sync engine. Pulls companies, contacts and
//! meetings changed since each account's last successful pass, turns them
//! into analytics events and ships them in bounded batches.

pub mod analytics;
pub mod config;
pub mod credentials;
pub mod crm;
pub mod db;
pub mod error;
pub mod models;
pub mod repositories;
pub mod sync;
pub mod telemetry;
pub use migration;
