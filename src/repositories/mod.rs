//! # Repository Layer
//!
//! Persistence of connected CRM accounts. The sync engine depends only on the
//! [`AccountStore`] trait; [`DbAccountStore`] backs it with SeaORM.

pub mod account;

pub use account::{AccountStore, DbAccountStore, InMemoryAccountStore, PersistenceMode, StoreError};
