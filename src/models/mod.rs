//! # Data Models
//!
//! Domain types shared across the sync engine and the SeaORM entities that
//! persist them.

pub mod account;
pub mod crm_account;

pub use account::{Account, Credentials, Watermarks};
pub use crm_account::Entity as CrmAccount;
