//! Process front door: owns the dictionaries and the local API listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::api::ApiEndpoint;
use crate::config::EngineConfig;
use crate::dictionary::Dictionary;
use crate::error::Result;

pub struct Engine {
    listener: TcpListener,
    dict: Arc<Dictionary>,
}

impl Engine {
    /// Loads the dictionaries and binds the local API listener. A dictionary
    /// failure is fatal here, before any session exists.
    pub async fn bind(config: EngineConfig) -> Result<Engine> {
        let dict = match &config.dictionary_dir {
            Some(dir) => Arc::new(Dictionary::load(
                dir.join("FIXtags.txt"),
                dir.join("FIXmsgs.txt"),
            )?),
            None => Dictionary::builtin(),
        };
        let listener = TcpListener::bind(config.bind_address).await?;
        info!(addr = %listener.local_addr()?, "serving API");
        Ok(Engine { listener, dict })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop: one endpoint task per local connection, for the life of
    /// the process.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(ApiEndpoint::handle(stream, self.dict.clone()));
                }
                Err(e) => error!(error = %e, "API: accept failed"),
            }
        }
    }
}
