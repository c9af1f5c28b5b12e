//! WebSocket echo server.
//!
//! Run with: cargo run --example echo_server
//! Then connect with: cargo run --example client
//!
//! `GET /health` is answered with a plain `200 OK` without upgrading.

use std::error::Error;

use tokio::net::{TcpListener, TcpStream};
use wsconn::{Config, HandshakeResponse, Message};

const ADDR: &str = "127.0.0.1:9001";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("WebSocket Echo Server listening on {ADDR}");
    let listener = TcpListener::bind(ADDR).await?;
    let config = Config::server()
        .with_compression()
        .with_subprotocols(["echo"]);

    loop {
        let (stream, addr) = listener.accept().await?;
        println!("New connection from: {addr}");
        let config = config.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &config).await {
                eprintln!("Connection error from {addr}: {e}");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, config: &Config) -> wsconn::Result<()> {
    stream.set_nodelay(true)?;
    let conn = wsconn::server::accept_with(stream, config, |request| {
        (request.path == "/health").then(|| HandshakeResponse::http(200, "OK\n"))
    })
    .await?;
    println!(
        "  Handshake complete: path={} subprotocol={:?} extensions={:?}",
        conn.path(),
        conn.subprotocol(),
        conn.extensions()
    );

    loop {
        match conn.recv().await {
            Ok(Message::Text(text)) => {
                println!("  Received text: {text}");
                conn.send(Message::Text(text)).await?;
            }
            Ok(Message::Binary(data)) => {
                println!("  Received binary: {} bytes", data.len());
                conn.send(Message::Binary(data)).await?;
            }
            Err(e) => {
                println!("  {e}");
                break;
            }
        }
    }

    println!("  Session ended");
    Ok(())
}
