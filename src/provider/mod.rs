//! Provider-side building blocks: the adapter trait and capability mask,
//! the weighted key pool, and the bounded worker pool.

pub mod adapters;
mod keys;
mod traits;
mod worker;

pub use keys::{KeyHealth, KeyPool, ProviderKey};
pub use traits::{Capability, ProviderAdapter, ProviderStream};
pub use worker::WorkerPool;
