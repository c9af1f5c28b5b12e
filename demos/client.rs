//! WebSocket client.
//!
//! Run the echo server first: cargo run --example echo_server
//! Then run: cargo run --example client [ws://host:port/path]

use std::error::Error;
use std::time::Instant;

use wsconn::{CloseCode, Config, Message};

const DEFAULT_URI: &str = "ws://127.0.0.1:9001/";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let uri = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_URI.to_string());
    println!("Connecting to {uri}");

    let config = Config::client()
        .with_compression()
        .with_subprotocols(["echo"]);
    let conn = wsconn::client::connect(&uri, &config).await?;
    println!(
        "Handshake complete: subprotocol={:?} extensions={:?}",
        conn.subprotocol(),
        conn.extensions()
    );

    let message = "Hello, WebSocket!";
    println!("Sending: {message}");
    conn.send(message).await?;
    match conn.recv().await? {
        Message::Text(text) => println!("Received: {text}"),
        Message::Binary(data) => println!("Received binary: {} bytes", data.len()),
    }

    let started = Instant::now();
    conn.ping(None).await?.await?;
    println!("Round trip: {:?}", started.elapsed());

    println!("Closing connection...");
    conn.close(CloseCode::Normal, "goodbye").await?;
    println!(
        "Closed with code {:?} reason {:?}",
        conn.close_code(),
        conn.close_reason()
    );
    Ok(())
}
