//! Out-of-band verification channel.
//!
//! Prompts a human over a chat transport and waits for a reply from the one
//! authorized sender. A monotonically increasing cursor guarantees that a
//! message is considered at most once per process, so stale replies sent
//! before this run (or before a previous prompt) are never mistaken for
//! fresh ones.

pub mod telegram;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::error::ChannelError;

pub use telegram::TelegramTransport;

/// Polls `init_cursor` makes before giving up on an endless backlog.
const MAX_DRAIN_PAGES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Strictly increasing per transport.
    pub id: i64,
    pub sender_id: String,
    pub text: String,
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), ChannelError>;
    /// Messages with id greater than `since_id`, oldest first.
    async fn poll(&self, since_id: Option<i64>) -> Result<Vec<InboundMessage>, ChannelError>;
}

#[derive(Debug, Default)]
struct Cursor {
    initialised: bool,
    last_seen: Option<i64>,
}

impl Cursor {
    /// Advance past `id`. Returns false if `id` was already seen.
    fn advance(&mut self, id: i64) -> bool {
        match self.last_seen {
            Some(last) if id <= last => false,
            _ => {
                self.last_seen = Some(id);
                true
            }
        }
    }
}

pub struct VerificationChannel {
    transport: Arc<dyn MessageTransport>,
    authorized_sender: String,
    poll_interval: Duration,
    cursor: Mutex<Cursor>,
}

impl VerificationChannel {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        authorized_sender: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            authorized_sender: authorized_sender.into(),
            poll_interval,
            cursor: Mutex::new(Cursor::default()),
        }
    }

    /// Drain every message already queued and remember the highest id.
    /// Idempotent: later calls return the current cursor without re-draining.
    /// A backlog still growing after `MAX_DRAIN_PAGES` polls is an error and
    /// leaves the cursor uninitialised, so no prompt can be answered by it.
    pub async fn init_cursor(&self) -> Result<Option<i64>, ChannelError> {
        let mut cursor = self.cursor.lock().await;
        if cursor.initialised {
            return Ok(cursor.last_seen);
        }
        let mut drained = 0usize;
        let mut empty = false;
        for _ in 0..MAX_DRAIN_PAGES {
            let batch = self.transport.poll(cursor.last_seen).await?;
            if batch.is_empty() {
                empty = true;
                break;
            }
            for msg in batch {
                if cursor.advance(msg.id) {
                    drained += 1;
                }
            }
        }
        if !empty {
            warn!(
                "oob: backlog not drained after {} polls ({} messages skipped so far)",
                MAX_DRAIN_PAGES, drained
            );
            return Err(ChannelError::Protocol(format!(
                "message backlog still not drained after {MAX_DRAIN_PAGES} polls"
            )));
        }
        cursor.initialised = true;
        info!(
            "oob: cursor initialised at {:?} ({} stale messages skipped)",
            cursor.last_seen, drained
        );
        Ok(cursor.last_seen)
    }

    pub async fn cursor(&self) -> Option<i64> {
        self.cursor.lock().await.last_seen
    }

    /// Send `prompt`, then wait up to `timeout` for a 6-digit code from the
    /// authorized sender. `Ok(None)` on timeout.
    pub async fn request_code(
        &self,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Option<String>, ChannelError> {
        self.ensure_initialised().await?;
        self.transport.send(prompt).await?;
        let code = self.wait_for_reply(timeout, parse_code).await;
        if let Some(code) = &code {
            self.notify(&format!("✅ Code received ({}). Submitting…", mask_code(code)))
                .await;
        }
        Ok(code)
    }

    /// Send `prompt`, then wait up to `timeout` for an explicit confirmation.
    /// `Ok(false)` when the window elapses without one.
    pub async fn await_confirmation(
        &self,
        prompt: &str,
        timeout: Duration,
    ) -> Result<bool, ChannelError> {
        self.ensure_initialised().await?;
        self.transport.send(prompt).await?;
        let confirmed = self
            .wait_for_reply(timeout, |text| is_confirmation(text).then(String::new))
            .await
            .is_some();
        Ok(confirmed)
    }

    /// Best-effort message; failures are logged, never returned.
    pub async fn notify(&self, text: &str) {
        if let Err(e) = self.transport.send(text).await {
            warn!("oob: notification not delivered: {}", e);
        }
    }

    async fn ensure_initialised(&self) -> Result<(), ChannelError> {
        if self.cursor.lock().await.initialised {
            Ok(())
        } else {
            Err(ChannelError::NotInitialised)
        }
    }

    /// Poll until `accept` returns a value for a message from the authorized
    /// sender, or until `timeout`. Every polled message advances the cursor,
    /// whether accepted or not.
    async fn wait_for_reply<F>(&self, timeout: Duration, accept: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String> + Send + Sync,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let since = self.cursor.lock().await.last_seen;
            match self.transport.poll(since).await {
                Ok(batch) => {
                    let mut cursor = self.cursor.lock().await;
                    for msg in batch {
                        if !cursor.advance(msg.id) {
                            continue;
                        }
                        if msg.sender_id != self.authorized_sender {
                            debug!("oob: ignoring message {} from unauthorized sender", msg.id);
                            continue;
                        }
                        if let Some(value) = accept(&msg.text) {
                            info!("oob: accepted reply (message {})", msg.id);
                            return Some(value);
                        }
                        debug!("oob: message {} did not match the expected reply", msg.id);
                    }
                }
                Err(e) => warn!("oob: poll failed: {}", e),
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

static CODE_PATTERN: OnceLock<Regex> = OnceLock::new();

fn code_pattern() -> &'static Regex {
    CODE_PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(?:/(?:code|otp|2fa)(?:@\w+)?\s+)?(\d{6})\s*$")
            .expect("valid code pattern")
    })
}

/// Exactly six digits, optionally prefixed with `/code`, `/otp` or `/2fa`.
pub fn parse_code(text: &str) -> Option<String> {
    code_pattern()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn is_confirmation(text: &str) -> bool {
    let t = text.trim().trim_start_matches('/').to_lowercase();
    let t = t.split('@').next().unwrap_or_default();
    matches!(t, "ok" | "done" | "approved" | "yes" | "好了" | "已确认")
}

fn mask_code(code: &str) -> String {
    let tail: String = code.chars().skip(code.chars().count().saturating_sub(2)).collect();
    format!("****{tail}")
}
