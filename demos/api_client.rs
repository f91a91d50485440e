//! Scripted API client: connects to a running fixline engine on the local
//! channel, points it at an exchange, and logs on.
//!
//! Usage: `cargo run --example api_client -- [exchange-host] [exchange-port]`

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().and_then(|p| p.parse().ok()).unwrap_or(9878);

    let mut api = TcpStream::connect("127.0.0.1:4050").await?;

    let connect = json!({
        "type": "FIX_connect",
        "kwargs": {
            "host": host,
            "port": port,
            "SSL": false,
            "HeartBtInt": 30,
            "SenderCompID": "DEMO",
            "TargetCompID": "EXCHANGE",
        }
    });
    api.write_all(format!("{connect}\n").as_bytes()).await?;

    // Logon with a sequence reset; the engine assigns MsgSeqNum.
    let fields: Vec<String> = fixline::codec::logon_fields(30, true, b"DEMO", b"EXCHANGE")
        .iter()
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .collect();
    let logon = json!({ "type": "FIX", "kwargs": fields });
    api.write_all(format!("{logon}\n").as_bytes()).await?;

    let mut buf = [0u8; 4096];
    loop {
        let n = api.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let printable: String = buf[..n]
            .iter()
            .map(|b| if *b == 0x01 { '|' } else { *b as char })
            .collect();
        println!("{printable}");
    }
    Ok(())
}
