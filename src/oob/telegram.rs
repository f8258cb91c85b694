//! Telegram Bot API transport.

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use serde_json::{json, Value};
use tracing::warn;

use super::{InboundMessage, MessageTransport};
use crate::core::error::ChannelError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct TelegramTransport {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramTransport {
    pub fn new(
        api_base: impl Into<String>,
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.into(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        })
    }

    /// The chat replies must come from.
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    async fn send_once(&self, text: &str) -> Result<(), backoff::Error<ChannelError>> {
        let resp = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await
            .map_err(|e| backoff::Error::transient(ChannelError::from(e)))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| backoff::Error::transient(ChannelError::from(e)))?;
        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }
        let description = body
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("no description")
            .to_string();
        let err = ChannelError::Protocol(format!("sendMessage {}: {}", status, description));
        // 429 and 5xx are worth retrying; other client errors are not.
        if status.as_u16() == 429 || status.is_server_error() {
            Err(backoff::Error::transient(err))
        } else {
            Err(backoff::Error::permanent(err))
        }
    }
}

#[async_trait]
impl MessageTransport for TelegramTransport {
    async fn send(&self, text: &str) -> Result<(), ChannelError> {
        backoff::future::retry(
            ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(500))
                .with_max_interval(Duration::from_secs(4))
                .with_max_elapsed_time(Some(Duration::from_secs(20)))
                .build(),
            || async {
                self.send_once(text).await.inspect_err(|e| {
                    if let backoff::Error::Transient { err, .. } = e {
                        warn!("oob: telegram send failed, retrying: {}", err);
                    }
                })
            },
        )
        .await
    }

    async fn poll(&self, since_id: Option<i64>) -> Result<Vec<InboundMessage>, ChannelError> {
        let mut url = format!("{}?timeout=0", self.method_url("getUpdates"));
        if let Some(id) = since_id {
            url.push_str(&format!("&offset={}", id + 1));
        }
        let body: Value = self.client.get(url).send().await?.json().await?;
        parse_updates(&body)
    }
}

/// Convert a `getUpdates` response into messages. Updates without text still
/// yield a message (empty text) so the caller's cursor moves past them.
pub fn parse_updates(body: &Value) -> Result<Vec<InboundMessage>, ChannelError> {
    if body.get("ok").and_then(Value::as_bool) != Some(true) {
        let description = body
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("response not ok");
        return Err(ChannelError::Protocol(format!("getUpdates: {description}")));
    }
    let updates = body
        .get("result")
        .and_then(Value::as_array)
        .ok_or_else(|| ChannelError::Protocol("getUpdates: missing result array".to_string()))?;

    let mut out = Vec::with_capacity(updates.len());
    for update in updates {
        let Some(id) = update.get("update_id").and_then(Value::as_i64) else {
            continue;
        };
        let message = update
            .get("message")
            .or_else(|| update.get("edited_message"));
        // The author, not the chat: in a group every member shares the chat id.
        let sender_id = message
            .and_then(|m| m.pointer("/from/id"))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        let text = message
            .and_then(|m| m.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        out.push(InboundMessage {
            id,
            sender_id,
            text,
        });
    }
    Ok(out)
}
