//! Declarative stream processing with at-least-once delivery.
//!
//! A stream reads transactions from inputs, runs each batch through an ordered
//! list of processors on a pool of workers and writes the result to outputs.
//! A transaction is acknowledged only once every output has accepted what it
//! became; failures travel back to the input so the data can be redelivered.

pub mod components;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod logging;
pub mod observability;
pub mod registry;
pub mod resilience;
pub mod resources;

pub use config::StreamConfig;
pub use engine::{Stream, StreamBuilder};
pub use error::{ConfigError, StreamError};
pub use registry::Registry;
pub use resources::ResourceManager;
