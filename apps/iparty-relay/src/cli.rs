use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use tunnel_proto::{
    registration_path, FrameError, HttpRequestFrame, HttpResponseFrame, TunnelFrame, TunnelKind,
    WsDataFrame,
};

use crate::config::ServerArgs;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "iparty-relay",
    version,
    about = "Reverse tunnel relay for NAT-hidden game hosts"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register both tunnels for a host id and echo everything back
    EchoHost {
        /// Relay base URL (e.g., ws://localhost:5001)
        #[arg(short, long, default_value = "ws://127.0.0.1:5001")]
        relay: String,

        /// Host id to register under
        #[arg(long)]
        host_id: String,
    },
}

/// Stand-in game host: answers HTTP with a JSON description of the request
/// and sends every WS payload back to the client it came from.
pub async fn run_echo_host(relay: String, host_id: String) -> Result<()> {
    let relay = relay.trim_end_matches('/').to_string();
    let http = serve_tunnel(&relay, &host_id, TunnelKind::Http);
    let ws = serve_tunnel(&relay, &host_id, TunnelKind::Ws);
    tokio::try_join!(http, ws)?;
    Ok(())
}

async fn serve_tunnel(relay: &str, host_id: &str, kind: TunnelKind) -> Result<()> {
    let url = format!("{relay}{}", registration_path(host_id, kind));
    debug!("Connecting {} tunnel to {}", kind, url);

    let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(&url)).await {
        Ok(result) => result.with_context(|| format!("failed to connect to {url}"))?,
        Err(_) => {
            return Err(anyhow!(
                "connection timeout after {}s - is the relay running?",
                CONNECT_TIMEOUT.as_secs()
            ))
        }
    };
    info!(host_id = %host_id, kind = %kind, "tunnel registered with relay");
    let (mut write, mut read) = ws_stream.split();

    while let Some(message) = read.next().await {
        let decoded = match message? {
            Message::Text(text) => TunnelFrame::decode(text.as_str()),
            Message::Binary(bytes) => TunnelFrame::decode_slice(&bytes),
            Message::Close(frame) => {
                info!(kind = %kind, ?frame, "relay closed tunnel");
                break;
            }
            _ => continue,
        };
        let frame = match decoded {
            Ok(frame) => frame,
            Err(err) => {
                warn!(kind = %kind, error = %err, "ignoring undecodable frame");
                continue;
            }
        };
        if let Some(reply) = echo_reply(frame)? {
            write.send(Message::Text(reply.encode().into())).await?;
        }
    }
    Ok(())
}

/// What the echo host sends back for a frame from the relay, if anything.
pub fn echo_reply(frame: TunnelFrame) -> Result<Option<TunnelFrame>, FrameError> {
    match frame {
        TunnelFrame::HttpRequest(request) => Ok(Some(describe_request(&request)?.into())),
        TunnelFrame::WsData(data) => {
            let payload = data.payload()?;
            Ok(Some(WsDataFrame::new(data.client_id, &payload).into()))
        }
        TunnelFrame::WsDisconnect(disconnect) => {
            debug!(client_id = %disconnect.client_id, "client left");
            Ok(None)
        }
        TunnelFrame::HttpResponse(_) => Ok(None),
    }
}

fn describe_request(request: &HttpRequestFrame) -> Result<HttpResponseFrame, FrameError> {
    let body = request.body()?;
    let description = json!({
        "method": request.method,
        "url": request.url,
        "contentType": request.content_type,
        "bodyLength": body.len(),
    });
    Ok(
        HttpResponseFrame::new(&request.request_id, 200, description.to_string().as_bytes())
            .with_content_type("application/json"),
    )
}
