//! Echo server and client over the kcpnet transport.
//!
//! ```text
//! kcp-echo server [options.json]
//! kcp-echo client <host> <port> <message>
//! ```

use anyhow::{bail, Context};
use std::path::Path;

use kcpnet_core::{Connection, KcpTransport, TransportOptions};

const USAGE: &str = "usage: kcp-echo server [options.json] | kcp-echo client <host> <port> <message>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kcpnet_core::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("server") => {
            let options = match args.get(1) {
                Some(path) => TransportOptions::from_file(Path::new(path))
                    .with_context(|| format!("loading {}", path))?,
                None => TransportOptions::default(),
            };
            run_server(options).await
        }
        Some("client") if args.len() == 4 => {
            let port: u16 = args[2].parse().context("invalid port")?;
            run_client(&args[1], port, &args[3]).await
        }
        _ => bail!(USAGE),
    }
}

async fn run_server(options: TransportOptions) -> anyhow::Result<()> {
    let mut transport = KcpTransport::new(options);
    transport.listen().context("listen failed")?;
    tracing::info!("Serving on {}", transport.server_uri());

    loop {
        tokio::select! {
            conn = transport.accept() => match conn {
                Some(conn) => {
                    tokio::spawn(echo(conn));
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    transport.disconnect().await;
    Ok(())
}

async fn echo(conn: Connection) {
    let peer = conn.remote_addr();
    while let Some(message) = conn.recv().await {
        if let Err(e) = conn.send(&message) {
            tracing::warn!("Echo to {} failed: {}", peer, e);
            break;
        }
    }
    tracing::info!("Echo session with {} ended", peer);
}

async fn run_client(host: &str, port: u16, message: &str) -> anyhow::Result<()> {
    let mut transport = KcpTransport::new(TransportOptions::default());
    let conn = transport
        .connect(host, port)
        .await
        .with_context(|| format!("connecting to {}:{}", host, port))?;

    conn.send(message.as_bytes())?;
    match conn.recv().await {
        Some(reply) => println!("{}", String::from_utf8_lossy(&reply)),
        None => bail!("connection closed before a reply arrived"),
    }

    transport.disconnect().await;
    Ok(())
}
