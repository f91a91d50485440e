//! The FIX 4.4 session layer: framing validation, sequence-number
//! discipline, and the heartbeat / test-request state machine bound to one
//! exchange connection.
//!
//! A session drives three tasks: a read pump that turns socket reads into
//! candidate messages, an inbound validator that owns the receive-side
//! watchdog, and an outbound composer that owns the send-side heartbeat
//! timer and the sequence counter. The tasks talk over unbounded queues and
//! unwind on poison sentinels (`None` items).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::codec::{self, FrameError};
use crate::dictionary::Dictionary;
use crate::error::{FixlineError, Result};
use crate::transport::{FixStream, ReadHalf, WriteHalf};

/// Item on the outbound queue: already-encoded body fields plus a label for
/// the logs. `None` is the poison sentinel pushed at shutdown.
pub type OutboundItem = Option<(Vec<Bytes>, &'static str)>;

/// Sink for validated inbound messages. Accepted messages arrive as
/// `Some(bytes)`; `None` is the poison sentinel for the receiving task.
pub type ApiSender = mpsc::UnboundedSender<Option<Bytes>>;

type InboundItem = Option<BytesMut>;

const READ_CHUNK_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init = 0,
    Active = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Init,
            1 => SessionState::Active,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Init => write!(f, "Init"),
            SessionState::Active => write!(f, "Active"),
            SessionState::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub heartbeat_interval_secs: u64,
    pub connect_timeout: Duration,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    ssl: bool,
    sender_comp_id: Option<String>,
    target_comp_id: Option<String>,
    heartbeat_interval_secs: Option<u64>,
    connect_timeout: Option<Duration>,
}

impl SessionConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
    pub fn ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }
    pub fn sender_comp_id(mut self, v: impl Into<String>) -> Self {
        self.sender_comp_id = Some(v.into());
        self
    }
    pub fn target_comp_id(mut self, v: impl Into<String>) -> Self {
        self.target_comp_id = Some(v.into());
        self
    }
    pub fn heartbeat_interval_secs(mut self, v: u64) -> Self {
        self.heartbeat_interval_secs = Some(v);
        self
    }
    pub fn connect_timeout(mut self, v: Duration) -> Self {
        self.connect_timeout = Some(v);
        self
    }

    pub fn build(self) -> Result<SessionConfig> {
        let heartbeat_interval_secs = self.heartbeat_interval_secs.unwrap_or(30);
        if heartbeat_interval_secs == 0 {
            return Err(FixlineError::InvalidConfig(
                "heartbeat interval must be positive".into(),
            ));
        }
        Ok(SessionConfig {
            host: self
                .host
                .ok_or_else(|| FixlineError::InvalidConfig("host missing".into()))?,
            port: self
                .port
                .ok_or_else(|| FixlineError::InvalidConfig("port missing".into()))?,
            ssl: self.ssl,
            sender_comp_id: self
                .sender_comp_id
                .ok_or_else(|| FixlineError::InvalidConfig("sender_comp_id missing".into()))?,
            target_comp_id: self
                .target_comp_id
                .ok_or_else(|| FixlineError::InvalidConfig("target_comp_id missing".into()))?,
            heartbeat_interval_secs,
            connect_timeout: self.connect_timeout.unwrap_or(Duration::from_secs(10)),
        })
    }
}

/// One FIX session over one connection. Terminal once closed; reconnecting
/// means constructing a new session.
#[derive(Debug)]
pub struct FixSession {
    config: SessionConfig,
    dict: Arc<Dictionary>,
    state: Arc<AtomicU8>,
    in_tx: Option<mpsc::UnboundedSender<InboundItem>>,
    out_tx: Option<mpsc::UnboundedSender<OutboundItem>>,
    read_task: Option<JoinHandle<()>>,
}

impl FixSession {
    pub fn new(config: SessionConfig, dict: Arc<Dictionary>) -> Self {
        Self {
            config,
            dict,
            state: Arc::new(AtomicU8::new(SessionState::Init as u8)),
            in_tx: None,
            out_tx: None,
            read_task: None,
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Opens the exchange connection and starts the pipeline tasks.
    /// Validated inbound messages are delivered to `api_out`.
    pub async fn connect(&mut self, api_out: ApiSender) -> Result<()> {
        match self.state() {
            SessionState::Init => {}
            SessionState::Active => {
                return Err(FixlineError::InvalidConfig(
                    "session already connected".into(),
                ))
            }
            SessionState::Closed => return Err(FixlineError::SessionClosed),
        }

        let stream = FixStream::connect(
            &self.config.host,
            self.config.port,
            self.config.ssl,
            self.config.connect_timeout,
        )
        .await?;
        let (read_half, write_half) = stream.split();

        let (in_tx, in_rx) = mpsc::unbounded_channel::<InboundItem>();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<OutboundItem>();
        let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs);
        let sender_comp_id = Bytes::from(self.config.sender_comp_id.clone());
        let target_comp_id = Bytes::from(self.config.target_comp_id.clone());

        self.state.store(SessionState::Active as u8, Ordering::SeqCst);

        let pump = ReadPump {
            read: read_half,
            in_tx: in_tx.clone(),
            out_tx: out_tx.clone(),
            state: self.state.clone(),
        };
        self.read_task = Some(tokio::spawn(pump.run()));

        let inbound = InboundWorker {
            dict: self.dict.clone(),
            sender_comp_id: sender_comp_id.clone(),
            target_comp_id: target_comp_id.clone(),
            heartbeat,
            in_rx,
            out_tx: out_tx.clone(),
            api_out,
            host_seq: 0,
            under_resend: false,
            pending_test_req_id: None,
        };
        tokio::spawn(inbound.run());

        let outbound = OutboundWorker {
            writer: write_half,
            out_rx,
            in_tx: in_tx.clone(),
            sender_comp_id,
            target_comp_id,
            heartbeat,
            local_seq: 0,
            state: self.state.clone(),
        };
        tokio::spawn(outbound.run());

        self.in_tx = Some(in_tx);
        self.out_tx = Some(out_tx);
        info!(
            host = %self.config.host,
            port = self.config.port,
            heartbeat_secs = self.config.heartbeat_interval_secs,
            "FIX: session active"
        );
        Ok(())
    }

    /// Non-blocking enqueue onto the outbound pipeline. The session assigns
    /// MsgSeqNum when the item is dequeued.
    pub fn enqueue(&self, fields: Vec<Bytes>, label: &'static str) -> Result<()> {
        if self.state() != SessionState::Active {
            return Err(FixlineError::SessionClosed);
        }
        self.out_tx
            .as_ref()
            .ok_or(FixlineError::SessionClosed)?
            .send(Some((fields, label)))
            .map_err(|_| FixlineError::ChannelClosed)
    }

    /// Poisons both queues, stops the read pump, and marks the session
    /// closed. Safe to call more than once.
    pub fn disconnect(&mut self) {
        if self.state() == SessionState::Closed {
            debug!("FIX: session already closed");
            return;
        }
        self.state.store(SessionState::Closed as u8, Ordering::SeqCst);
        if let Some(tx) = &self.in_tx {
            let _ = tx.send(None);
        }
        if let Some(tx) = &self.out_tx {
            let _ = tx.send(None);
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        info!("FIX: session closed");
    }
}

/// Reads opaque chunks off the socket; every chunk is a candidate complete
/// message for the inbound validator.
struct ReadPump {
    read: ReadHalf,
    in_tx: mpsc::UnboundedSender<InboundItem>,
    out_tx: mpsc::UnboundedSender<OutboundItem>,
    state: Arc<AtomicU8>,
}

impl ReadPump {
    async fn run(mut self) {
        debug!("FIX: read pump started");
        loop {
            let mut chunk = BytesMut::with_capacity(READ_CHUNK_CAPACITY);
            match self.read.read_buf(&mut chunk).await {
                Ok(0) => {
                    info!("FIX: connection closed by host");
                    break;
                }
                Ok(n) => {
                    debug!(bytes = n, "FIX: data received");
                    if self.in_tx.send(Some(chunk)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "FIX: read error");
                    break;
                }
            }
        }
        self.state.store(SessionState::Closed as u8, Ordering::SeqCst);
        let _ = self.in_tx.send(None);
        let _ = self.out_tx.send(None);
        debug!("FIX: read pump stopped");
    }
}

/// Validates candidate messages, reassembling partial reads, and enforces
/// the sequence-number discipline. Owns the receive watchdog.
struct InboundWorker {
    dict: Arc<Dictionary>,
    sender_comp_id: Bytes,
    target_comp_id: Bytes,
    heartbeat: Duration,
    in_rx: mpsc::UnboundedReceiver<InboundItem>,
    out_tx: mpsc::UnboundedSender<OutboundItem>,
    api_out: ApiSender,
    host_seq: u64,
    under_resend: bool,
    pending_test_req_id: Option<Bytes>,
}

impl InboundWorker {
    async fn run(mut self) {
        debug!("FIX: incoming handler started");
        let mut watchdog = Instant::now() + self.watchdog_interval();
        'messages: loop {
            let Some(mut msg) = self.next_chunk(&mut watchdog).await else {
                break;
            };

            loop {
                if !codec::header_is_present(&msg) {
                    warn!(reason = %FrameError::MalformedHeader, "FIX: message discarded");
                    continue 'messages;
                }
                if codec::checksum_is_present(&msg) {
                    break;
                }
                // One protocol message split across transport reads:
                // accumulate until the trailer shows up. A fresh header means
                // the accumulator was a truncated message; start over with
                // the new chunk.
                debug!(reason = %FrameError::MissingChecksum, "FIX: reassembling from pieces");
                let Some(next) = self.next_chunk(&mut watchdog).await else {
                    break 'messages;
                };
                if codec::header_is_present(&next) {
                    warn!("FIX: previous message was incomplete, dropped");
                    msg = next;
                } else {
                    msg.extend_from_slice(&next);
                }
            }

            if let Err(reason) = codec::validate_frame(&msg) {
                warn!(%reason, "FIX: message discarded");
                continue;
            }

            let fields = match codec::decompile(&self.dict, &msg) {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(error = %e, "FIX: message discarded");
                    continue;
                }
            };

            let seq = fields
                .get("MsgSeqNum")
                .and_then(|v| codec::parse_ascii_u64(v));
            let Some(seq) = seq else {
                warn!("FIX: missing or invalid MsgSeqNum, message discarded");
                continue;
            };
            if seq != self.host_seq + 1 {
                warn!(
                    got = seq,
                    expected = self.host_seq + 1,
                    "FIX: MsgSeqNum out of expected order"
                );
                if !self.under_resend {
                    self.under_resend = true;
                    self.request_resend();
                }
                continue;
            }
            self.host_seq += 1;
            self.under_resend = false;

            self.observe_admin(&fields);

            if self.api_out.send(Some(msg.freeze())).is_err() {
                debug!("FIX: api sink closed, inbound message dropped");
            }
        }
        debug!("FIX: incoming handler stopped");
    }

    fn watchdog_interval(&self) -> Duration {
        self.heartbeat + Duration::from_secs(1)
    }

    /// Waits for the next chunk, issuing a TestRequest whenever the
    /// watchdog deadline passes without traffic from the host. Returns
    /// `None` on the poison sentinel or channel loss.
    async fn next_chunk(&mut self, watchdog: &mut Instant) -> Option<BytesMut> {
        loop {
            tokio::select! {
                item = self.in_rx.recv() => {
                    return match item {
                        Some(Some(chunk)) => {
                            *watchdog = Instant::now() + self.watchdog_interval();
                            Some(chunk)
                        }
                        Some(None) | None => None,
                    };
                }
                _ = sleep_until(*watchdog) => {
                    self.send_test_request();
                    *watchdog = Instant::now() + self.watchdog_interval();
                }
            }
        }
    }

    fn send_test_request(&mut self) {
        if self.pending_test_req_id.is_some() {
            warn!("FIX: previous TestRequest still unanswered");
        }
        let id = codec::sending_time();
        self.pending_test_req_id = Some(id.clone());
        let fields =
            codec::test_request_fields(&id, &self.sender_comp_id, &self.target_comp_id);
        if self.out_tx.send(Some((fields, "TestRequest"))).is_ok() {
            info!("FIX: no traffic from host, sent TestRequest");
        }
    }

    fn request_resend(&mut self) {
        let begin = self.host_seq + 1;
        let fields = codec::resend_request_fields(
            begin,
            0,
            &self.sender_comp_id,
            &self.target_comp_id,
        );
        if self.out_tx.send(Some((fields, "ResendRequest"))).is_ok() {
            info!(begin_seq_no = begin, "FIX: sent ResendRequest");
        }
    }

    /// Session-level reactions to accepted administrative messages, plus an
    /// advisory required-fields check from the message dictionary.
    fn observe_admin(&mut self, fields: &HashMap<String, Bytes>) {
        let Some(msg_type) = fields.get("MsgType") else {
            return;
        };
        if let Some(spec) = self.dict.message(msg_type) {
            for name in &spec.required {
                if !fields.contains_key(name.as_str()) {
                    warn!(msg_name = %spec.name, field = %name, "FIX: required field missing");
                }
            }
        }
        match msg_type.as_ref() {
            b"0" => {
                let answered = matches!(
                    (&self.pending_test_req_id, fields.get("TestReqID")),
                    (Some(pending), Some(got)) if pending == got
                );
                if answered {
                    debug!("FIX: TestRequest answered");
                    self.pending_test_req_id = None;
                }
            }
            b"1" => {
                if let Some(id) = fields.get("TestReqID") {
                    let reply = codec::heartbeat_fields(
                        Some(id.as_ref()),
                        &self.sender_comp_id,
                        &self.target_comp_id,
                    );
                    let _ = self.out_tx.send(Some((reply, "Heartbeat")));
                }
            }
            _ => {}
        }
    }
}

/// Compiles and writes outbound items in enqueue order, assigning MsgSeqNum
/// at dequeue time. Owns the send-side heartbeat timer.
struct OutboundWorker {
    writer: WriteHalf,
    out_rx: mpsc::UnboundedReceiver<OutboundItem>,
    in_tx: mpsc::UnboundedSender<InboundItem>,
    sender_comp_id: Bytes,
    target_comp_id: Bytes,
    heartbeat: Duration,
    local_seq: u64,
    state: Arc<AtomicU8>,
}

impl OutboundWorker {
    async fn run(mut self) {
        debug!("FIX: outgoing handler started");
        // First heartbeat is due a second early; each send pushes the
        // deadline out by the full interval.
        let mut next_heartbeat = Instant::now() + self.heartbeat - Duration::from_secs(1);
        loop {
            tokio::select! {
                biased;
                item = self.out_rx.recv() => {
                    match item {
                        Some(Some((fields, label))) => {
                            if self.send_message(&fields, label, &mut next_heartbeat).await.is_err() {
                                break;
                            }
                        }
                        Some(None) | None => break,
                    }
                }
                _ = sleep_until(next_heartbeat) => {
                    let fields = codec::heartbeat_fields(
                        None,
                        &self.sender_comp_id,
                        &self.target_comp_id,
                    );
                    if self.send_message(&fields, "Heartbeat", &mut next_heartbeat).await.is_err() {
                        break;
                    }
                }
            }
        }
        self.state.store(SessionState::Closed as u8, Ordering::SeqCst);
        let _ = self.in_tx.send(None);
        let _ = self.writer.shutdown().await;
        debug!("FIX: outgoing handler stopped");
    }

    /// The sequence counter advances only when the item compiles; compile
    /// failures drop the item without burning a number.
    async fn send_message(
        &mut self,
        fields: &[Bytes],
        label: &'static str,
        next_heartbeat: &mut Instant,
    ) -> std::io::Result<()> {
        let message = match codec::compile(fields, self.local_seq + 1) {
            Ok(message) => message,
            Err(e) => {
                warn!(label, error = %e, "FIX: outgoing message dropped");
                return Ok(());
            }
        };
        self.local_seq += 1;

        if let Err(e) = self.writer.write_all(&message).await {
            warn!(error = %e, "FIX: write failed, closing session");
            return Err(e);
        }
        if let Err(e) = self.writer.flush().await {
            warn!(error = %e, "FIX: flush failed, closing session");
            return Err(e);
        }
        *next_heartbeat = Instant::now() + self.heartbeat;
        debug!(label, seq = self.local_seq, "FIX: sent message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let config = SessionConfig::builder()
            .host("127.0.0.1")
            .port(9878)
            .sender_comp_id("LOCAL")
            .target_comp_id("HOST")
            .build()
            .unwrap();
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(!config.ssl);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn builder_rejects_missing_and_zero() {
        assert!(matches!(
            SessionConfig::builder().build(),
            Err(FixlineError::InvalidConfig(_))
        ));
        let zero_hb = SessionConfig::builder()
            .host("h")
            .port(1)
            .sender_comp_id("a")
            .target_comp_id("b")
            .heartbeat_interval_secs(0)
            .build();
        assert!(matches!(zero_hb, Err(FixlineError::InvalidConfig(_))));
    }

    #[test]
    fn new_session_is_init_and_rejects_sends() {
        let config = SessionConfig::builder()
            .host("127.0.0.1")
            .port(9878)
            .sender_comp_id("LOCAL")
            .target_comp_id("HOST")
            .build()
            .unwrap();
        let session = FixSession::new(config, Dictionary::builtin());
        assert_eq!(session.state(), SessionState::Init);
        assert!(!session.is_active());
        assert!(matches!(
            session.enqueue(vec![], "message"),
            Err(FixlineError::SessionClosed)
        ));
    }

    #[test]
    fn disconnect_is_idempotent_and_terminal() {
        let config = SessionConfig::builder()
            .host("127.0.0.1")
            .port(9878)
            .sender_comp_id("LOCAL")
            .target_comp_id("HOST")
            .build()
            .unwrap();
        let mut session = FixSession::new(config, Dictionary::builtin());
        session.disconnect();
        session.disconnect();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(format!("{}", session.state()), "Closed");
    }
}
