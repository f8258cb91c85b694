use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ─────────────────────────────────────────────────────────────────────────────
// Cookies
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

/// A single browser cookie in storage-state shape.
///
/// `expires` is serialised as Unix seconds, with `-1` for session cookies, so
/// storage states exported by other browser tooling load unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default, rename = "expires", with = "expiry_seconds")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: SameSite,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl Cookie {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_cookie_path(),
            expiry: None,
            http_only: false,
            secure: false,
            same_site: SameSite::default(),
        }
    }

    /// Uniqueness key within a cookie jar.
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.name, &self.domain, &self.path)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|exp| exp <= now)
    }
}

mod expiry_seconds {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => s.serialize_f64(ts.timestamp_millis() as f64 / 1000.0),
            None => s.serialize_f64(-1.0),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<f64>::deserialize(d)?;
        Ok(raw
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .and_then(|secs| Utc.timestamp_millis_opt((secs * 1000.0) as i64).single()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Serialized browser session: cookie jar plus per-origin key/value storage.
///
/// A snapshot is either fully valid or rejected at parse time; there is no
/// partially populated state. New runs supersede it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "StorageStateWire", try_from = "StorageStateWire")]
pub struct SessionSnapshot {
    pub cookies: Vec<Cookie>,
    pub storage_by_origin: BTreeMap<String, BTreeMap<String, String>>,
    pub captured_at: DateTime<Utc>,
}

impl SessionSnapshot {
    /// Build a snapshot captured now. Cookies are de-duplicated on
    /// (name, domain, path), keeping the last occurrence at the first position.
    pub fn new(
        cookies: Vec<Cookie>,
        storage_by_origin: BTreeMap<String, BTreeMap<String, String>>,
    ) -> Self {
        Self {
            cookies: dedup_cookies(cookies),
            storage_by_origin,
            captured_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.storage_item_count() == 0
    }

    pub fn storage_item_count(&self) -> usize {
        self.storage_by_origin.values().map(|m| m.len()).sum()
    }

    /// Cookies not yet expired at `now`.
    pub fn live_cookie_count(&self, now: DateTime<Utc>) -> usize {
        self.cookies.iter().filter(|c| !c.is_expired_at(now)).count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

fn dedup_cookies(cookies: Vec<Cookie>) -> Vec<Cookie> {
    let mut out: Vec<Cookie> = Vec::with_capacity(cookies.len());
    for cookie in cookies {
        match out.iter_mut().find(|c| c.key() == cookie.key()) {
            Some(existing) => *existing = cookie,
            None => out.push(cookie),
        }
    }
    out
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageStateWire {
    cookies: Vec<Cookie>,
    #[serde(default)]
    origins: Vec<OriginWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    captured_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OriginWire {
    origin: String,
    #[serde(default)]
    local_storage: Vec<StorageEntryWire>,
}

#[derive(Serialize, Deserialize)]
struct StorageEntryWire {
    name: String,
    value: String,
}

impl From<SessionSnapshot> for StorageStateWire {
    fn from(snapshot: SessionSnapshot) -> Self {
        let origins = snapshot
            .storage_by_origin
            .into_iter()
            .map(|(origin, items)| OriginWire {
                origin,
                local_storage: items
                    .into_iter()
                    .map(|(name, value)| StorageEntryWire { name, value })
                    .collect(),
            })
            .collect();
        Self {
            cookies: snapshot.cookies,
            origins,
            captured_at: Some(snapshot.captured_at),
        }
    }
}

impl TryFrom<StorageStateWire> for SessionSnapshot {
    type Error = String;

    fn try_from(wire: StorageStateWire) -> Result<Self, Self::Error> {
        for (i, cookie) in wire.cookies.iter().enumerate() {
            if cookie.name.trim().is_empty() {
                return Err(format!("cookie #{i} has an empty name"));
            }
            if cookie.domain.trim().is_empty() {
                return Err(format!("cookie '{}' has an empty domain", cookie.name));
            }
        }

        let mut storage_by_origin = BTreeMap::new();
        for origin in wire.origins {
            if origin.origin.trim().is_empty() {
                return Err("storage origin with empty name".to_string());
            }
            let items: BTreeMap<String, String> = origin
                .local_storage
                .into_iter()
                .map(|e| (e.name, e.value))
                .collect();
            storage_by_origin.insert(origin.origin, items);
        }

        Ok(Self {
            cookies: dedup_cookies(wire.cookies),
            storage_by_origin,
            captured_at: wire.captured_at.unwrap_or_default(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────────────────────────

/// Login credentials. Supplied once at process start; never logged or persisted.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &"<redacted>")
            .field("password", &"<redacted>")
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Page classification
// ─────────────────────────────────────────────────────────────────────────────

/// What the remote page is currently asking for. Recomputed from every fresh
/// page snapshot; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageState {
    LoginForm,
    DeviceApprovalRequired,
    CodeVerificationRequired,
    AnnouncementBlocking,
    AuthenticatedHome,
    ErrorBanner(String),
    Unknown,
}

impl PageState {
    pub fn label(&self) -> &'static str {
        match self {
            PageState::LoginForm => "login_form",
            PageState::DeviceApprovalRequired => "device_approval_required",
            PageState::CodeVerificationRequired => "code_verification_required",
            PageState::AnnouncementBlocking => "announcement_blocking",
            PageState::AuthenticatedHome => "authenticated_home",
            PageState::ErrorBanner(_) => "error_banner",
            PageState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageState::ErrorBanner(text) => write!(f, "error_banner({text})"),
            other => f.write_str(other.label()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Verification attempts
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Accepted,
    Rejected,
    TimedOut,
}

/// One OOB round trip inside code verification.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationAttempt {
    pub attempt_number: u32,
    pub prompt_sent_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub code: Option<String>,
    pub outcome: AttemptOutcome,
}

impl VerificationAttempt {
    pub fn start(attempt_number: u32) -> Self {
        Self {
            attempt_number,
            prompt_sent_at: Utc::now(),
            code: None,
            outcome: AttemptOutcome::Pending,
        }
    }
}
