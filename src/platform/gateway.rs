//! Discord gateway listener.
//!
//! Keeps one websocket session open, heartbeats on the interval the server
//! announces, and forwards the dispatches the bot cares about as
//! `GatewayEvent`s over an mpsc channel. Sessions that drop are re-identified
//! after a fixed delay; close codes that can never succeed stop the task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::discord::{RawMember, RawUser, snowflake};
use super::{ChannelId, Member, UserId};
use crate::error::PlatformError;

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

const INTENT_GUILDS: u64 = 1 << 0;
const INTENT_GUILD_MEMBERS: u64 = 1 << 1;
const INTENT_GUILD_MESSAGES: u64 = 1 << 9;
const INTENT_MESSAGE_CONTENT: u64 = 1 << 15;

/// Guilds, member updates, guild messages and their content.
pub const INTENTS: u64 =
    INTENT_GUILDS | INTENT_GUILD_MEMBERS | INTENT_GUILD_MESSAGES | INTENT_MESSAGE_CONTENT;

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A chat message posted in a guild channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub author_is_bot: bool,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// Session established; carries the bot's own user ID.
    Ready { user_id: UserId },
    /// A member's roles or profile changed. Carries the new state only.
    MemberUpdate(Member),
    MessageCreate(IncomingMessage),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub token: SecretString,
    pub guild_id: u64,
}

impl GatewayConfig {
    pub fn new(token: SecretString, guild_id: u64) -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            token,
            guild_id,
        }
    }
}

/// One gateway frame.
#[derive(Debug, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: serde_json::Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

#[derive(Deserialize)]
struct Ready {
    user: RawUser,
}

#[derive(Deserialize)]
struct MemberUpdate {
    guild_id: String,
    #[serde(flatten)]
    member: RawMember,
}

#[derive(Deserialize)]
struct RawAuthor {
    id: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Deserialize)]
struct MessageCreate {
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    author: RawAuthor,
    #[serde(default)]
    content: String,
}

pub fn parse_payload(text: &str) -> Result<GatewayPayload, PlatformError> {
    serde_json::from_str(text).map_err(|e| PlatformError::InvalidPayload(e.to_string()))
}

/// Heartbeat interval announced by Hello.
pub fn hello_interval(payload: &GatewayPayload) -> Result<Duration, PlatformError> {
    if payload.op != OP_HELLO {
        return Err(PlatformError::Gateway(format!(
            "expected Hello, got op {}",
            payload.op
        )));
    }
    payload
        .d
        .get("heartbeat_interval")
        .and_then(|v| v.as_u64())
        .map(Duration::from_millis)
        .ok_or_else(|| PlatformError::InvalidPayload("Hello without heartbeat_interval".into()))
}

pub fn identify_payload(token: &SecretString) -> serde_json::Value {
    serde_json::json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token.expose_secret(),
            "intents": INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "rolekeeper",
                "device": "rolekeeper",
            },
        },
    })
}

pub fn heartbeat_payload(seq: Option<u64>) -> serde_json::Value {
    serde_json::json!({ "op": OP_HEARTBEAT, "d": seq })
}

/// Decode a dispatch into an event. Unknown dispatches and traffic from
/// other guilds yield `None`.
pub fn decode_dispatch(
    name: &str,
    data: serde_json::Value,
    guild_id: u64,
) -> Result<Option<GatewayEvent>, PlatformError> {
    let invalid = |e: serde_json::Error| PlatformError::InvalidPayload(format!("{name}: {e}"));
    match name {
        "READY" => {
            let ready: Ready = serde_json::from_value(data).map_err(invalid)?;
            Ok(Some(GatewayEvent::Ready {
                user_id: snowflake(&ready.user.id)?,
            }))
        }
        "GUILD_MEMBER_UPDATE" => {
            let update: MemberUpdate = serde_json::from_value(data).map_err(invalid)?;
            if snowflake(&update.guild_id)? != guild_id {
                return Ok(None);
            }
            Ok(Some(GatewayEvent::MemberUpdate(update.member.into_member()?)))
        }
        "MESSAGE_CREATE" => {
            let msg: MessageCreate = serde_json::from_value(data).map_err(invalid)?;
            match msg.guild_id.as_deref().map(snowflake).transpose()? {
                Some(id) if id == guild_id => {}
                _ => return Ok(None),
            }
            Ok(Some(GatewayEvent::MessageCreate(IncomingMessage {
                channel_id: snowflake(&msg.channel_id)?,
                author_id: snowflake(&msg.author.id)?,
                author_is_bot: msg.author.bot,
                content: msg.content,
            })))
        }
        _ => Ok(None),
    }
}

/// Close codes after which reconnecting cannot help (bad token, bad intents).
pub fn is_fatal_close(code: u16) -> bool {
    matches!(code, 4004 | 4010 | 4011 | 4012 | 4013 | 4014)
}

enum SessionEnd {
    Reconnect,
    Shutdown,
    Fatal(String),
}

/// Spawn the gateway listener. Events are delivered on `events`; the task
/// exits when the shutdown flag is set, the receiver is dropped, or the
/// server rejects the credentials.
pub fn spawn_gateway(
    config: GatewayConfig,
    events: mpsc::Sender<GatewayEvent>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(guild = config.guild_id, "Gateway listener started");

        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            match run_session(&config, &events, &shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Fatal(reason)) => {
                    error!(reason = %reason, "Gateway rejected the session; giving up");
                    break;
                }
                Ok(SessionEnd::Reconnect) => {
                    info!("Gateway asked for a reconnect");
                }
                Err(e) => {
                    warn!(error = %e, retry_secs = RECONNECT_DELAY.as_secs(), "Gateway session ended");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }

        info!("Gateway listener shutting down");
    });

    (handle, shutdown_flag)
}

async fn run_session(
    config: &GatewayConfig,
    events: &mpsc::Sender<GatewayEvent>,
    shutdown: &AtomicBool,
) -> Result<SessionEnd, PlatformError> {
    let gateway_err = |e: tokio_tungstenite::tungstenite::Error| PlatformError::Gateway(e.to_string());

    let (ws, _) = connect_async(config.url.as_str()).await.map_err(gateway_err)?;
    let (mut sink, mut stream) = ws.split();

    let hello = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => break parse_payload(text.as_str())?,
            Some(Ok(Message::Close(frame))) => {
                return Err(PlatformError::Gateway(format!("closed before Hello: {frame:?}")));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(gateway_err(e)),
            None => return Err(PlatformError::Gateway("closed before Hello".into())),
        }
    };
    let interval = hello_interval(&hello)?;
    debug!(interval_ms = interval.as_millis() as u64, "Gateway hello");

    sink.send(Message::Text(identify_payload(&config.token).to_string().into()))
        .await
        .map_err(gateway_err)?;

    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    let mut seq: Option<u64> = None;
    let mut acked = true;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if shutdown.load(Ordering::Relaxed) {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                if !acked {
                    return Err(PlatformError::Gateway("heartbeat not acknowledged".into()));
                }
                acked = false;
                sink.send(Message::Text(heartbeat_payload(seq).to_string().into()))
                    .await
                    .map_err(gateway_err)?;
            }
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        if let Some(code) = code.filter(|c| is_fatal_close(*c)) {
                            return Ok(SessionEnd::Fatal(format!("close code {code}")));
                        }
                        return Err(PlatformError::Gateway(format!("closed: {code:?}")));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(gateway_err(e)),
                    None => return Err(PlatformError::Gateway("stream ended".into())),
                };

                let payload = match parse_payload(text.as_str()) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed gateway frame");
                        continue;
                    }
                };
                if payload.s.is_some() {
                    seq = payload.s;
                }

                match payload.op {
                    OP_DISPATCH => {
                        let Some(name) = payload.t else { continue };
                        let event = match decode_dispatch(&name, payload.d, config.guild_id) {
                            Ok(Some(event)) => event,
                            Ok(None) => continue,
                            Err(e) => {
                                warn!(event = %name, error = %e, "Failed to decode dispatch");
                                continue;
                            }
                        };
                        if events.send(event).await.is_err() {
                            return Ok(SessionEnd::Shutdown);
                        }
                    }
                    OP_HEARTBEAT => {
                        sink.send(Message::Text(heartbeat_payload(seq).to_string().into()))
                            .await
                            .map_err(gateway_err)?;
                    }
                    OP_HEARTBEAT_ACK => acked = true,
                    OP_RECONNECT => return Ok(SessionEnd::Reconnect),
                    OP_INVALID_SESSION => {
                        return Err(PlatformError::Gateway("invalid session".into()));
                    }
                    other => debug!(op = other, "Ignoring gateway op"),
                }
            }
        }
    }
}
