//! Core types and services shared across the framecast workspace:
//! configuration, error taxonomy, logging, metrics, the layer model,
//! chat messages, and the stream-key service with its pluggable
//! durable key-value store.

pub mod chat;
pub mod config;
pub mod error;
pub mod layer;
pub mod logging;
pub mod metrics;
pub mod stream_key;

pub use config::Config;
pub use error::{Error, Result};
