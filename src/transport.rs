//! Upstream exchange transport: TCP, optionally wrapped in TLS.

use std::io::{Error as IoError, ErrorKind};
use std::time::Duration;

use tokio::io::{self, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::{TlsConnector, TlsStream};
use tracing::info;

use crate::error::Result;

pub type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
pub type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// One connection to the exchange gateway.
pub enum FixStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl FixStream {
    pub async fn connect(
        host: &str,
        port: u16,
        ssl: bool,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let tcp = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                IoError::new(ErrorKind::TimedOut, format!("connection timeout to {addr}"))
            })??;
        tcp.set_nodelay(true)?;

        if !ssl {
            info!(%addr, "connected via TCP");
            return Ok(FixStream::Tcp(tcp));
        }

        // Permissive client context; trust is settled at the network layer.
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?;
        let tls = TlsConnector::from(connector).connect(host, tcp).await?;
        info!(%addr, "connected via TLS");
        Ok(FixStream::Tls(Box::new(tls)))
    }

    /// Splits into boxed halves so the read pump and the outbound composer
    /// can run independently.
    pub fn split(self) -> (ReadHalf, WriteHalf) {
        match self {
            FixStream::Tcp(stream) => {
                let (r, w) = io::split(stream);
                (Box::new(r), Box::new(w))
            }
            FixStream::Tls(stream) => {
                let (r, w) = io::split(*stream);
                (Box::new(r), Box::new(w))
            }
        }
    }
}
