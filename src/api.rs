//! Local API endpoint: translates the line-delimited JSON command channel
//! into FIX session operations and relays validated inbound messages back
//! to the local peer.
//!
//! One endpoint serves one local connection. `FIX_connect` and
//! `FIX_disconnect` are always dispatchable; `FIX` only works once a session
//! is bound. Command failures are logged and dropped; nothing on this
//! channel can take the endpoint down short of losing the connection itself.

use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dictionary::Dictionary;
use crate::session::{ApiSender, FixSession, SessionConfig};

/// One command record on the local control channel.
#[derive(Debug, Deserialize)]
struct Command {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    kwargs: Option<Value>,
}

/// Settings accepted by `FIX_connect`. Field names follow the FIX-style
/// spelling used on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectSettings {
    pub host: String,
    pub port: u16,
    #[serde(rename = "SSL")]
    pub ssl: bool,
    #[serde(rename = "HeartBtInt")]
    pub heart_bt_int: u64,
    #[serde(rename = "SenderCompID")]
    pub sender_comp_id: String,
    #[serde(rename = "TargetCompID")]
    pub target_comp_id: String,
}

pub struct ApiEndpoint {
    dict: Arc<Dictionary>,
    session: Option<FixSession>,
    out_tx: ApiSender,
}

impl ApiEndpoint {
    /// Drives one local connection until the peer goes away.
    pub async fn handle(stream: TcpStream, dict: Arc<Dictionary>) {
        let peer = stream.peer_addr().ok();
        info!(?peer, "API: connection established");

        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(Self::handle_outgoing(write_half, out_rx));

        let mut endpoint = ApiEndpoint {
            dict,
            session: None,
            out_tx: out_tx.clone(),
        };
        endpoint.handle_incoming(read_half).await;

        // Local channel gone: poison the outgoing task and drop any session
        // still bound to this endpoint.
        let _ = out_tx.send(None);
        if let Some(mut session) = endpoint.session.take() {
            session.disconnect();
        }
        let _ = writer_task.await;
        info!(?peer, "API: connection closed");
    }

    async fn handle_incoming(&mut self, read_half: OwnedReadHalf) {
        debug!("API: incoming handler started");
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => self.dispatch(line.trim_end()).await,
                Err(e) => {
                    warn!(error = %e, "API: read error");
                    break;
                }
            }
        }
        debug!("API: incoming handler stopped");
    }

    async fn dispatch(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        let command: Command = match serde_json::from_str(line) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "API: unparseable command");
                return;
            }
        };
        debug!(command = %command.kind, "API: handling command");
        let Some(kwargs) = command.kwargs else {
            warn!(command = %command.kind, "API: kwargs not found");
            return;
        };
        match command.kind.as_str() {
            "FIX_connect" => self.fix_connect(kwargs).await,
            "FIX_disconnect" => self.fix_disconnect(),
            "FIX" => self.fix_send(kwargs),
            other => warn!(command = %other, "API: command not found"),
        }
    }

    async fn fix_connect(&mut self, kwargs: Value) {
        let settings: ConnectSettings = match serde_json::from_value(kwargs) {
            Ok(settings) => settings,
            Err(e) => {
                error!(error = %e, "API: bad FIX_connect settings");
                return;
            }
        };
        let config = match SessionConfig::builder()
            .host(settings.host)
            .port(settings.port)
            .ssl(settings.ssl)
            .heartbeat_interval_secs(settings.heart_bt_int)
            .sender_comp_id(settings.sender_comp_id)
            .target_comp_id(settings.target_comp_id)
            .build()
        {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "API: bad FIX_connect settings");
                return;
            }
        };

        if let Some(mut old) = self.session.take() {
            old.disconnect();
        }

        debug!("API: creating FIX connection");
        let mut session = FixSession::new(config, self.dict.clone());
        match session.connect(self.out_tx.clone()).await {
            Ok(()) => self.session = Some(session),
            Err(e) => error!(error = %e, "API: problem creating FIX connection"),
        }
    }

    fn fix_disconnect(&mut self) {
        match self.session.take() {
            Some(mut session) => session.disconnect(),
            None => debug!("API: FIX connection already closed"),
        }
    }

    fn fix_send(&mut self, kwargs: Value) {
        let fields: Vec<String> = match serde_json::from_value(kwargs) {
            Ok(fields) => fields,
            Err(e) => {
                warn!(error = %e, "API: FIX command wants a list of encoded fields");
                return;
            }
        };
        let Some(session) = self.session.as_ref() else {
            warn!("API: FIX command before FIX_connect");
            return;
        };
        let fields: Vec<Bytes> = fields.into_iter().map(Bytes::from).collect();
        if let Err(e) = session.enqueue(fields, "message") {
            warn!(error = %e, "API: FIX message not enqueued");
        }
    }

    /// Drains the endpoint queue, writing each validated FIX message as-is
    /// to the local peer. Exits on the poison sentinel.
    async fn handle_outgoing(
        mut write_half: OwnedWriteHalf,
        mut out_rx: mpsc::UnboundedReceiver<Option<Bytes>>,
    ) {
        debug!("API: outgoing handler started");
        while let Some(item) = out_rx.recv().await {
            let Some(message) = item else { break };
            if let Err(e) = write_half.write_all(&message).await {
                warn!(error = %e, "API: write error");
                break;
            }
        }
        debug!("API: outgoing handler stopped");
    }
}
