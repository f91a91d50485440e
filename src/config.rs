use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Process-level configuration: where the local API listens and where the
/// FIX dictionaries come from. `None` for `dictionary_dir` selects the
/// embedded FIX 4.4 tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub bind_address: SocketAddr,
    pub dictionary_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:4050".parse().unwrap(),
            dictionary_dir: None,
        }
    }
}
