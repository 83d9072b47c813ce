use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "rover-relay")]
#[command(about = "Rover relay server and debug watch client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Follow a robot's state and events from a running relay
    Watch {
        /// Relay URL (e.g. ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Robot to subscribe to
        #[arg(short, long, default_value = "fordward")]
        robot: String,

        /// Client name announced to the relay
        #[arg(long)]
        name: Option<String>,
    },
}

/// Connect to a running relay as an operator, subscribe to one robot and
/// print everything the relay fans out until the connection drops.
pub async fn run_watch(url: String, robot: String, name: Option<String>) -> Result<()> {
    let ws_url = format!("{}/ui", url.trim_end_matches('/'));
    debug!("connecting to {ws_url}");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            return Err(anyhow::anyhow!("connection failed: {err}"));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the relay running at {ws_url}?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let subscribe = json!({
        "type": "subscribe",
        "robotId": robot,
        "clientName": name,
    });
    write.send(Message::Text(subscribe.to_string())).await?;

    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => {
                let frame: Value = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!("unparseable frame: {err}");
                        continue;
                    }
                };
                match frame.get("type").and_then(Value::as_str) {
                    Some("welcome") => {
                        println!(
                            "connected as {} ({} robot(s) registered)",
                            frame["clientId"],
                            frame["robots"].as_array().map(Vec::len).unwrap_or(0)
                        );
                    }
                    Some("state") => {
                        println!(
                            "state {}: mode={} online={} owner={}",
                            frame["robotId"],
                            frame["mode"],
                            frame["online"],
                            frame["control"]["ownerName"]
                        );
                    }
                    Some("event") => {
                        println!("event: {}", frame["payload"]);
                    }
                    Some("error") => {
                        eprintln!("error [{}]: {}", frame["code"], frame["message"]);
                    }
                    _ => {}
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}
