//! Domain types and capability contracts for the CaseGraph intelligence
//! engine.
//!
//! This crate defines what the rest of the workspace talks about: entities,
//! relationships, analysis requests/results, and the narrow capability
//! interfaces (LLM oracle, graph backend, cache) the analytical runtime
//! depends on but does not implement.

pub mod config;
pub mod error;
pub mod params;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::*;
pub use traits::*;
pub use types::*;
