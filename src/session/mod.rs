//! Session state store.
//!
//! Restores and persists [`SessionSnapshot`]s across a prioritized list of
//! backends: a local file, a CI secret, and an inline environment variable.
//! Restore takes the first backend holding a parseable, non-empty snapshot.
//! Persist writes every writable backend and succeeds if at least one does.
//! A backend failure never aborts a run; it is logged and reported.

pub mod secret;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::core::config::AuthgateConfig;
use crate::core::error::{AcquisitionError, StoreError};
use crate::core::types::SessionSnapshot;
pub use secret::{CommandSecretStore, SecretStore};

#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    fn label(&self) -> String;

    /// Raw payload, or `None` when the backend holds nothing.
    async fn load(&self) -> Result<Option<String>, StoreError>;

    async fn save(&self, _payload: &str) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly(self.label()))
    }

    fn is_writable(&self) -> bool {
        false
    }
}

// ── File ─────────────────────────────────────────────────────────────────────

pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl SnapshotBackend for FileBackend {
    fn label(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn load(&self) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    /// Write to a sibling temp file, then rename over the target so readers
    /// never observe a half-written snapshot.
    async fn save(&self, payload: &str) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(format!(".tmp-{}", std::process::id()));
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, payload)
            .await
            .map_err(|e| self.io_err(e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(self.io_err(e));
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        true
    }
}

// ── Secret ───────────────────────────────────────────────────────────────────

pub struct SecretBackend {
    store: Arc<dyn SecretStore>,
    name: String,
}

impl SecretBackend {
    pub fn new(store: Arc<dyn SecretStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }
}

#[async_trait]
impl SnapshotBackend for SecretBackend {
    fn label(&self) -> String {
        format!("secret:{}", self.name)
    }

    async fn load(&self) -> Result<Option<String>, StoreError> {
        self.store
            .get_secret(&self.name)
            .await
            .map_err(|e| StoreError::Secret(format!("{e:#}")))
    }

    async fn save(&self, payload: &str) -> Result<(), StoreError> {
        self.store
            .put_secret(&self.name, payload)
            .await
            .map_err(|e| StoreError::Secret(format!("{e:#}")))
    }

    fn is_writable(&self) -> bool {
        true
    }
}

// ── Inline env var (read-only) ───────────────────────────────────────────────

pub struct EnvBackend {
    var: String,
}

impl EnvBackend {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl SnapshotBackend for EnvBackend {
    fn label(&self) -> String {
        format!("env:{}", self.var)
    }

    async fn load(&self) -> Result<Option<String>, StoreError> {
        Ok(std::env::var(&self.var).ok().filter(|v| !v.trim().is_empty()))
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    /// Target upper bound for the serialized payload.
    pub max_payload_bytes: usize,
    /// Storage values longer than this are the first to go when trimming.
    pub max_item_bytes: usize,
}

impl StoreLimits {
    pub fn from_config(cfg: &AuthgateConfig) -> Self {
        Self {
            max_payload_bytes: cfg.resolve_max_payload_bytes(),
            max_item_bytes: cfg.resolve_max_item_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PersistReport {
    pub written: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Storage items dropped to fit the payload bound.
    pub trimmed_items: usize,
    pub payload_bytes: usize,
}

impl PersistReport {
    pub fn is_success(&self) -> bool {
        !self.written.is_empty()
    }

    /// `PersistFailure` describing every failed backend, if any failed.
    pub fn warning(&self) -> Option<AcquisitionError> {
        if self.failed.is_empty() {
            return None;
        }
        let detail = self
            .failed
            .iter()
            .map(|(label, err)| format!("{label}: {err}"))
            .collect::<Vec<_>>()
            .join("; ");
        Some(AcquisitionError::PersistFailure(detail))
    }
}

pub struct SessionStore {
    backends: Vec<Box<dyn SnapshotBackend>>,
    limits: StoreLimits,
}

impl SessionStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            backends: Vec::new(),
            limits,
        }
    }

    /// Backends are consulted in the order they are added.
    pub fn with_backend(mut self, backend: impl SnapshotBackend + 'static) -> Self {
        self.backends.push(Box::new(backend));
        self
    }

    /// Default backend order: file, secret (when configured), inline env var.
    pub fn from_config(cfg: &AuthgateConfig, secrets: Option<Arc<dyn SecretStore>>) -> Self {
        let mut store = Self::new(StoreLimits::from_config(cfg))
            .with_backend(FileBackend::new(cfg.resolve_session_file()));
        if let Some(secrets) = secrets {
            store = store.with_backend(SecretBackend::new(secrets, cfg.resolve_secret_name()));
        }
        store.with_backend(EnvBackend::new(cfg.resolve_inline_env_var()))
    }

    pub fn backend_labels(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.label()).collect()
    }

    /// First usable snapshot in backend order. Corrupt or empty payloads are
    /// treated as absent.
    pub async fn restore(&self) -> Option<SessionSnapshot> {
        for backend in &self.backends {
            let label = backend.label();
            let raw = match backend.load().await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    debug!("session_store: {} empty", label);
                    continue;
                }
                Err(e) => {
                    warn!("session_store: {} unreadable: {}", label, e);
                    continue;
                }
            };
            match parse_payload(&raw) {
                Some(snapshot) => {
                    info!(
                        "session_store: restored from {} ({} cookies, {} unexpired, \
                         {} storage items, captured {})",
                        label,
                        snapshot.cookies.len(),
                        snapshot.live_cookie_count(Utc::now()),
                        snapshot.storage_item_count(),
                        snapshot.captured_at
                    );
                    return Some(snapshot);
                }
                None => warn!("session_store: {} holds an invalid snapshot; ignoring", label),
            }
        }
        info!("session_store: no usable snapshot");
        None
    }

    /// Write `snapshot` to every writable backend.
    pub async fn persist(&self, snapshot: &SessionSnapshot) -> PersistReport {
        let mut report = PersistReport::default();
        let (fitted, dropped) = fit_to_limits(snapshot, self.limits);
        report.trimmed_items = dropped;

        let payload = match fitted.to_json() {
            Ok(p) => p,
            Err(e) => {
                let err = StoreError::from(e).to_string();
                for b in self.backends.iter().filter(|b| b.is_writable()) {
                    report.failed.push((b.label(), err.clone()));
                }
                return report;
            }
        };
        report.payload_bytes = payload.len();

        for backend in self.backends.iter().filter(|b| b.is_writable()) {
            let label = backend.label();
            match backend.save(&payload).await {
                Ok(()) => {
                    info!("session_store: persisted {} bytes to {}", payload.len(), label);
                    report.written.push(label);
                }
                Err(e) => {
                    warn!("session_store: persist to {} failed: {}", label, e);
                    report.failed.push((label, e.to_string()));
                }
            }
        }
        report
    }
}

/// Accepts a storage-state JSON document, or the same document base64-encoded
/// (standard or URL-safe alphabet). Empty snapshots are treated as absent.
pub fn parse_payload(raw: &str) -> Option<SessionSnapshot> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed = if raw.starts_with('{') {
        SessionSnapshot::from_json(raw).ok()
    } else {
        decode_base64(raw).and_then(|json| SessionSnapshot::from_json(&json).ok())
    };
    parsed.filter(|s| !s.is_empty())
}

fn decode_base64(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let engines = [
        base64::engine::general_purpose::STANDARD,
        base64::engine::general_purpose::URL_SAFE,
        base64::engine::general_purpose::STANDARD_NO_PAD,
        base64::engine::general_purpose::URL_SAFE_NO_PAD,
    ];
    engines
        .iter()
        .find_map(|e| e.decode(&compact).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Shrink the snapshot toward `max_payload_bytes` by dropping oversized
/// storage values. Cookies are never dropped. Returns the fitted snapshot and
/// the number of storage items removed.
pub fn fit_to_limits(snapshot: &SessionSnapshot, limits: StoreLimits) -> (SessionSnapshot, usize) {
    let size = snapshot.to_json().map(|s| s.len()).unwrap_or(0);
    if size <= limits.max_payload_bytes {
        return (snapshot.clone(), 0);
    }

    let mut fitted = snapshot.clone();
    let mut dropped = 0usize;
    for items in fitted.storage_by_origin.values_mut() {
        let before = items.len();
        items.retain(|_, v| v.len() <= limits.max_item_bytes);
        dropped += before - items.len();
    }
    fitted.storage_by_origin.retain(|_, items| !items.is_empty());

    let new_size = fitted.to_json().map(|s| s.len()).unwrap_or(0);
    if new_size > limits.max_payload_bytes {
        warn!(
            "session_store: snapshot is {} bytes after trimming, above the {} byte bound; \
             cookies kept",
            new_size, limits.max_payload_bytes
        );
    } else {
        warn!(
            "session_store: snapshot exceeded the {} byte bound; trimmed {} oversized storage \
             items ({} -> {} bytes)",
            limits.max_payload_bytes, dropped, size, new_size
        );
    }
    (fitted, dropped)
}
