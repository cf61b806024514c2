//! Governance: budget and rate-limit admission control.
//!
//! Admission reserves against every applicable scope in order (virtual key
//! → team → customer → global → provider); a rejection releases the
//! already-reserved scopes in reverse. Commit converts reservations to
//! actual charges from reported token usage and the price table.

mod counters;
mod pricing;
mod resolver;

pub use counters::{BudgetCounter, RateCounter};
pub use pricing::PriceTable;
pub use resolver::{GovernanceStore, Reservation};
