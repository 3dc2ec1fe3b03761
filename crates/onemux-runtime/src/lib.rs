//! # onemux-runtime
//!
//! Ties the proxy engine to the outside world: configuration loading with
//! figment, tracing-based logging, default hook implementations, and the
//! service runtime.

pub mod config;
pub mod logging;
pub mod runtime;
pub mod store;

pub use config::{ConfigLoader, OnemuxConfig, load_config, load_config_from_file};
pub use runtime::Runtime;
pub use store::{MemoryStore, NoopCommandHook, StoredMessage, default_hooks};
