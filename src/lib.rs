#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]
#![deny(warnings)]
pub mod api;
pub mod codec;
pub mod config;
pub mod dictionary;
pub mod engine;
pub mod error;
pub mod session;
pub mod transport;

pub use api::{ApiEndpoint, ConnectSettings};
pub use config::EngineConfig;
pub use dictionary::Dictionary;
pub use engine::Engine;
pub use error::{FixlineError, Result};
pub use session::{FixSession, SessionConfig, SessionState};
