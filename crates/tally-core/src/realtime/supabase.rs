//! Supabase Realtime change feed (Phoenix channel protocol over a websocket).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{ChangeEvent, ChangeFeed, ChangeKind, FeedSubscription};
use crate::models::Table;
use crate::remote::RemoteError;
use crate::util::{compact_text, is_http_url, normalize_text_option};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_BUFFER: usize = 256;
const JOIN_REF: &str = "1";

/// A decoded Phoenix frame relevant to one table channel
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Row change on the subscribed table
    Change(ChangeEvent),
    /// Reply to a message we sent
    Reply {
        reference: Option<String>,
        ok: bool,
        message: String,
    },
    /// Channel-level error reported by the server
    ChannelError(String),
    /// Server closed the channel
    Closed,
    /// Heartbeat replies, presence, system notices
    Ignored,
}

#[derive(Clone)]
pub struct SupabaseRealtime {
    socket_url: String,
    access_token: Option<String>,
    anon_key: String,
}

impl std::fmt::Debug for SupabaseRealtime {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SupabaseRealtime")
            .field("anon_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish_non_exhaustive()
    }
}

impl SupabaseRealtime {
    pub fn new(
        url: impl AsRef<str>,
        anon_key: impl Into<String>,
        access_token: Option<String>,
    ) -> Result<Self, RemoteError> {
        let anon_key = normalize_text_option(Some(anon_key.into()))
            .ok_or_else(|| RemoteError::NotConfigured("anon key must not be empty".into()))?;
        let socket_url = format!(
            "{}?apikey={anon_key}&vsn=1.0.0",
            realtime_socket_url(url.as_ref())?
        );
        Ok(Self {
            socket_url,
            access_token: normalize_text_option(access_token),
            anon_key,
        })
    }

    fn join_message(&self, table: Table) -> Value {
        json!({
            "topic": topic(table),
            "event": "phx_join",
            "payload": {
                "config": {
                    "broadcast": {"self": false},
                    "presence": {"key": ""},
                    "postgres_changes": [
                        {"event": "*", "schema": "public", "table": table.name()}
                    ]
                },
                "access_token": self.access_token.as_deref().unwrap_or(&self.anon_key),
            },
            "ref": JOIN_REF,
            "join_ref": JOIN_REF,
        })
    }
}

#[async_trait]
impl ChangeFeed for SupabaseRealtime {
    async fn subscribe(&self, table: Table) -> Result<FeedSubscription, RemoteError> {
        let (socket, _) = timeout(JOIN_TIMEOUT, connect_async(self.socket_url.as_str()))
            .await
            .map_err(|_| RemoteError::WebSocket("connection timeout".into()))??;
        let (mut write, mut read) = socket.split();

        write
            .send(Message::Text(self.join_message(table).to_string()))
            .await?;

        // Wait for the join reply before reporting the channel live
        let joined = timeout(JOIN_TIMEOUT, async {
            while let Some(message) = read.next().await {
                let Message::Text(text) = message? else {
                    continue;
                };
                match parse_frame(&text, table) {
                    Frame::Reply {
                        reference: Some(reference),
                        ok,
                        message,
                    } if reference == JOIN_REF => {
                        return if ok {
                            Ok(())
                        } else {
                            Err(RemoteError::WebSocket(format!("join rejected: {message}")))
                        };
                    }
                    Frame::ChannelError(message) => return Err(RemoteError::WebSocket(message)),
                    Frame::Closed => return Err(RemoteError::Closed),
                    _ => {}
                }
            }
            Err::<(), RemoteError>(RemoteError::Closed)
        })
        .await
        .map_err(|_| RemoteError::WebSocket(format!("join timeout for {table}")))?;
        joined?;
        tracing::debug!("Joined realtime channel {}", topic(table));

        let (sender, receiver) = mpsc::channel::<Result<ChangeEvent, RemoteError>>(EVENT_BUFFER);
        let task = tokio::spawn(async move {
            let mut heartbeat = interval(HEARTBEAT_INTERVAL);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            heartbeat.tick().await;
            let mut heartbeat_ref: u64 = 1;

            loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        heartbeat_ref += 1;
                        let frame = json!({
                            "topic": "phoenix",
                            "event": "heartbeat",
                            "payload": {},
                            "ref": heartbeat_ref.to_string(),
                        });
                        if let Err(error) = write.send(Message::Text(frame.to_string())).await {
                            let _ = sender.send(Err(error.into())).await;
                            break;
                        }
                    }
                    message = read.next() => {
                        let outcome = match message {
                            Some(Ok(Message::Text(text))) => match parse_frame(&text, table) {
                                Frame::Change(event) => Some(Ok(event)),
                                Frame::ChannelError(message) => Some(Err(RemoteError::WebSocket(message))),
                                Frame::Closed => Some(Err(RemoteError::Closed)),
                                Frame::Reply { .. } | Frame::Ignored => None,
                            },
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = write.send(Message::Pong(payload)).await;
                                None
                            }
                            Some(Ok(Message::Close(_))) | None => Some(Err(RemoteError::Closed)),
                            Some(Ok(_)) => None,
                            Some(Err(error)) => Some(Err(error.into())),
                        };
                        let Some(outcome) = outcome else {
                            continue;
                        };
                        let terminal = outcome.is_err();
                        if sender.send(outcome).await.is_err() || terminal {
                            break;
                        }
                    }
                }
            }
            let _ = write.close().await;
        });

        Ok(FeedSubscription::new(receiver, Some(task)))
    }
}

fn topic(table: Table) -> String {
    format!("realtime:public:{}", table.name())
}

/// Websocket endpoint for a project URL (`https://x.supabase.co` →
/// `wss://x.supabase.co/realtime/v1/websocket`).
fn realtime_socket_url(url: &str) -> Result<String, RemoteError> {
    let url = normalize_text_option(Some(url.to_string()))
        .ok_or_else(|| RemoteError::NotConfigured("remote URL must not be empty".into()))?;
    if !is_http_url(&url) {
        return Err(RemoteError::NotConfigured(
            "remote URL must include http:// or https://".into(),
        ));
    }
    let base = url.trim_end_matches('/');
    let base = base.strip_suffix("/rest/v1").unwrap_or(base);
    let socket_base = base
        .strip_prefix("https://")
        .map(|rest| format!("wss://{rest}"))
        .or_else(|| base.strip_prefix("http://").map(|rest| format!("ws://{rest}")))
        .unwrap_or_else(|| base.to_string());
    Ok(format!("{socket_base}/realtime/v1/websocket"))
}

/// Decode one text frame received on the `table` channel.
pub fn parse_frame(text: &str, table: Table) -> Frame {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        tracing::debug!("Ignoring malformed realtime frame: {}", compact_text(text));
        return Frame::Ignored;
    };
    let event = frame.get("event").and_then(Value::as_str).unwrap_or_default();
    let payload = frame.get("payload").cloned().unwrap_or(Value::Null);

    match event {
        "postgres_changes" => {
            let data = payload.get("data").unwrap_or(&payload);
            let kind = data
                .get("type")
                .or_else(|| data.get("eventType"))
                .and_then(Value::as_str)
                .and_then(ChangeKind::parse);
            let source_table = data.get("table").and_then(Value::as_str);
            match kind {
                Some(kind) if source_table.is_none() || source_table == Some(table.name()) => {
                    Frame::Change(ChangeEvent {
                        kind,
                        table,
                        new_row: non_empty_row(data.get("record").or_else(|| data.get("new"))),
                        old_row: non_empty_row(
                            data.get("old_record").or_else(|| data.get("old")),
                        ),
                    })
                }
                _ => Frame::Ignored,
            }
        }
        "phx_reply" => {
            let status = payload.get("status").and_then(Value::as_str).unwrap_or_default();
            let message = payload
                .get("response")
                .and_then(|response| response.get("reason").or_else(|| response.get("message")))
                .and_then(Value::as_str)
                .unwrap_or(status)
                .to_string();
            Frame::Reply {
                reference: frame.get("ref").and_then(Value::as_str).map(str::to_string),
                ok: status == "ok",
                message,
            }
        }
        "phx_error" => Frame::ChannelError(format!("channel error on {}", topic(table))),
        "phx_close" => Frame::Closed,
        "system" if payload.get("status").and_then(Value::as_str) == Some("error") => {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("subscription error");
            Frame::ChannelError(message.to_string())
        }
        _ => Frame::Ignored,
    }
}

fn non_empty_row(row: Option<&Value>) -> Option<Value> {
    row.filter(|row| row.as_object().is_some_and(|fields| !fields.is_empty()))
        .cloned()
}
