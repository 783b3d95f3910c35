//! The proxy harvesting, validation, and serving engine: fetch → dedup → prescan → validate →
//! score → tier → serve, plus persistence and scheduling. `engine::Engine` is the public entry
//! point consumed by `harvest-app`.

pub mod adapters;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod model;
pub mod persistence;
pub mod pool;
pub mod prescan;
pub mod scheduler;
pub mod scorer;
pub mod selector;
pub mod validator;

pub use config::Config;
pub use engine::Engine;
pub use model::{Anonymity, EngineStats, Protocol, ProxyKey, ProxyNode, SelectorFilter, Tier, ValidationOutcome};
