//! Scripted fake site and chat transport for end-to-end acquisition tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use authgate::acquire::{AcquireSettings, SessionAcquirer};
use authgate::browser::{
    label_matches, AutomationContext, AutomationPage, BrowserDriver, WaitPolicy,
};
use authgate::classify::{Classifier, ClassifierRules, ElementInfo, HtmlSnapshot, PageSnapshot};
use authgate::core::error::{BrowserError, BrowserResult, ChannelError};
use authgate::login::selectors::LoginSelectors;
use authgate::login::FlowSettings;
use authgate::oob::{InboundMessage, MessageTransport, VerificationChannel};
use authgate::session::{FileBackend, SessionStore, StoreLimits};
use authgate::{Cookie, SessionSnapshot};

pub const ORIGIN: &str = "https://portal.test";
pub const LOGIN_URL: &str = "https://portal.test/login";
pub const HOME_URL: &str = "https://portal.test/home";
pub const NOTICE_URL: &str = "https://portal.test/notice";
pub const DEVICE_URL: &str = "https://portal.test/login/device";
pub const VERIFY_URL: &str = "https://portal.test/login/verify";
pub const CAREERS_URL: &str = "https://portal.test/careers";
pub const MAINTENANCE_URL: &str = "https://portal.test/maintenance";
pub const LOADING_URL: &str = "https://portal.test/loading";

pub const USERNAME: &str = "ops@portal.test";
pub const PASSWORD: &str = "hunter2-but-longer";
pub const OPERATOR: &str = "4242";

const SESSION_COOKIE: &str = "sid";

// ── Site ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondFactor {
    None,
    Device,
    Code,
}

/// Markup variants of the sign-in page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginLayout {
    /// Fields plus a `type=submit` button.
    Standard,
    /// A collapsed mobile copy of the form comes first in the document.
    Responsive,
    /// The only control is a plain `type=button` labelled "Sign in".
    TextButton,
    /// No button at all; Enter in the password field submits.
    EnterOnly,
    /// No button, and the form swallows key events.
    Inert,
    /// Badge sign-in notice without credential fields.
    NoFields,
    /// The login URL serves a maintenance page.
    Maintenance,
    /// A loading page that becomes the form once the network settles.
    Slow,
}

#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub second_factor: SecondFactor,
    pub accepted_code: String,
    /// Whether the trusted device approves the sign-in before the reload.
    pub device_approved: bool,
    /// Show a blocking notice between login and home.
    pub notice_after_login: bool,
    pub login_layout: LoginLayout,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            second_factor: SecondFactor::None,
            accepted_code: "246810".to_string(),
            device_approved: false,
            notice_after_login: false,
            login_layout: LoginLayout::Standard,
        }
    }
}

#[derive(Default)]
struct SiteState {
    sessions: HashSet<String>,
    issued: u32,
    credential_submissions: u32,
    code_submissions: Vec<String>,
    /// Label of every field a value was typed into.
    filled_fields: Vec<String>,
    contexts_opened: u32,
    contexts_closed: u32,
}

pub struct FakeSite {
    config: SiteConfig,
    state: Mutex<SiteState>,
}

impl FakeSite {
    pub fn new(config: SiteConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(SiteState::default()),
        })
    }

    /// Mint a server-side session and return its cookie.
    pub fn issue_session(&self) -> Cookie {
        let mut st = self.state.lock().unwrap();
        st.issued += 1;
        let token = format!("sess-{}", st.issued);
        st.sessions.insert(token.clone());
        let mut cookie = Cookie::new(SESSION_COOKIE, token, "portal.test");
        cookie.http_only = true;
        cookie.secure = true;
        cookie
    }

    pub fn revoke_sessions(&self) {
        self.state.lock().unwrap().sessions.clear();
    }

    fn is_valid(&self, cookies: &[Cookie]) -> bool {
        let st = self.state.lock().unwrap();
        cookies
            .iter()
            .any(|c| c.name == SESSION_COOKIE && st.sessions.contains(&c.value))
    }

    pub fn credential_submissions(&self) -> u32 {
        self.state.lock().unwrap().credential_submissions
    }

    pub fn code_submissions(&self) -> Vec<String> {
        self.state.lock().unwrap().code_submissions.clone()
    }

    pub fn filled_fields(&self) -> Vec<String> {
        self.state.lock().unwrap().filled_fields.clone()
    }

    pub fn contexts_opened(&self) -> u32 {
        self.state.lock().unwrap().contexts_opened
    }

    pub fn contexts_closed(&self) -> u32 {
        self.state.lock().unwrap().contexts_closed
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Screen {
    Login { error: Option<String> },
    Notice,
    Device,
    Verify { error: Option<String> },
    Home,
    Careers,
    Maintenance,
    Loading,
    Blank(String),
}

impl Screen {
    fn url(&self) -> String {
        match self {
            Screen::Login { .. } => LOGIN_URL.to_string(),
            Screen::Notice => NOTICE_URL.to_string(),
            Screen::Device => DEVICE_URL.to_string(),
            Screen::Verify { .. } => VERIFY_URL.to_string(),
            Screen::Home => HOME_URL.to_string(),
            Screen::Careers => CAREERS_URL.to_string(),
            Screen::Maintenance => MAINTENANCE_URL.to_string(),
            Screen::Loading => LOADING_URL.to_string(),
            Screen::Blank(url) => url.clone(),
        }
    }

    fn html(&self, layout: LoginLayout) -> String {
        match self {
            Screen::Login { error } => login_html(layout, &error_div(error)),
            Screen::Notice => r#"<html><head><title>Notice</title></head><body>
                <div role="dialog">
                  <p>Scheduled maintenance tonight.</p><button>Got it</button>
                </div>
                </body></html>"#
                .to_string(),
            Screen::Device => r#"<html><head><title>Verify it's you</title></head><body>
                <p>We noticed a sign-in from a new device.</p>
                <p>Approve this sign-in on your phone to continue.</p>
                </body></html>"#
                .to_string(),
            Screen::Verify { error } => format!(
                r#"<html><head><title>Two-step verification</title></head><body>
                <p>Enter the 6-digit code from your authenticator app.</p>
                <form>
                  <input name="otp" type="text" autocomplete="one-time-code" maxlength="6">
                  {}
                  <button type="submit">Verify</button>
                </form></body></html>"#,
                error_div(error)
            ),
            Screen::Home => r#"<html><head><title>Dashboard | Portal</title></head><body>
                <nav><a href="/profile">Profile</a></nav><main>Welcome back</main>
                </body></html>"#
                .to_string(),
            Screen::Careers => careers_html().to_string(),
            Screen::Maintenance => r#"<html><head><title>Maintenance</title></head><body>
                <p>We'll be back soon.</p>
                </body></html>"#
                .to_string(),
            Screen::Loading => r#"<html><head><title>Portal</title></head><body>
                <div class="spinner">Loading</div>
                </body></html>"#
                .to_string(),
            Screen::Blank(_) => {
                "<html><head><title></title></head><body></body></html>".to_string()
            }
        }
    }
}

fn error_div(error: &Option<String>) -> String {
    error
        .as_ref()
        .map(|m| format!(r#"<div class="error-message">{m}</div>"#))
        .unwrap_or_default()
}

fn login_html(layout: LoginLayout, error: &str) -> String {
    const FIELDS: &str = r#"<input name="username" type="text" placeholder="Email">
                  <input name="password" type="password" placeholder="Password">"#;
    let form = match layout {
        LoginLayout::Standard | LoginLayout::Maintenance | LoginLayout::Slow => {
            format!(r#"<form>{FIELDS}{error}<button type="submit">Sign in</button></form>"#)
        }
        LoginLayout::Responsive => format!(
            r#"<form class="mobile" hidden>
                  <input name="username" type="text" placeholder="Mobile email">
                  <input name="password" type="password" placeholder="Mobile password">
                  <button type="submit">Sign in</button>
                </form>
                <form>{FIELDS}{error}<button type="submit">Sign in</button></form>"#
        ),
        LoginLayout::TextButton => format!(
            r#"<form>{FIELDS}{error}<button type="button" class="primary">Sign in</button></form>"#
        ),
        LoginLayout::EnterOnly | LoginLayout::Inert => format!("<form>{FIELDS}{error}</form>"),
        LoginLayout::NoFields => {
            "<p>Tap your company badge on the reader to continue.</p>".to_string()
        }
    };
    format!(r#"<html><head><title>Sign in - Portal</title></head><body>{form}</body></html>"#)
}

/// Job listing that mentions a verification code next to a search box.
pub fn careers_html() -> &'static str {
    r#"<html><head><title>Careers</title></head><body>
    <p>We are hiring security engineers. Shortlisted candidates receive a
    verification code by email after applying.</p>
    <input type="text" name="q" placeholder="Search jobs">
    </body></html>"#
}

// ── Browser fakes ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Jar {
    cookies: Vec<Cookie>,
    storage: BTreeMap<String, BTreeMap<String, String>>,
}

pub struct FakeDriver {
    site: Arc<FakeSite>,
}

impl FakeDriver {
    pub fn new(site: Arc<FakeSite>) -> Self {
        Self { site }
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn new_context(
        &self,
        seed: Option<&SessionSnapshot>,
    ) -> BrowserResult<Box<dyn AutomationContext>> {
        self.site.state.lock().unwrap().contexts_opened += 1;
        let jar = match seed {
            Some(s) => Jar {
                cookies: s.cookies.clone(),
                storage: s.storage_by_origin.clone(),
            },
            None => Jar::default(),
        };
        Ok(Box::new(FakeContext {
            site: self.site.clone(),
            jar: Arc::new(Mutex::new(jar)),
            closed: false,
        }))
    }
}

struct FakeContext {
    site: Arc<FakeSite>,
    jar: Arc<Mutex<Jar>>,
    closed: bool,
}

#[async_trait]
impl AutomationContext for FakeContext {
    async fn new_page(&mut self) -> BrowserResult<Arc<dyn AutomationPage>> {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        Ok(Arc::new(FakePage {
            site: self.site.clone(),
            jar: self.jar.clone(),
            screen: Mutex::new(Screen::Blank("about:blank".to_string())),
            fills: Mutex::new(Vec::new()),
        }))
    }

    async fn export_snapshot(&self) -> BrowserResult<SessionSnapshot> {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        let jar = self.jar.lock().unwrap();
        Ok(SessionSnapshot::new(jar.cookies.clone(), jar.storage.clone()))
    }

    async fn close(&mut self) -> BrowserResult<()> {
        if !self.closed {
            self.closed = true;
            self.site.state.lock().unwrap().contexts_closed += 1;
        }
        Ok(())
    }
}

struct FakePage {
    site: Arc<FakeSite>,
    jar: Arc<Mutex<Jar>>,
    screen: Mutex<Screen>,
    fills: Mutex<Vec<(String, String)>>,
}

impl FakePage {
    fn current(&self) -> Screen {
        self.screen.lock().unwrap().clone()
    }

    fn show(&self, screen: Screen) {
        *self.screen.lock().unwrap() = screen;
        self.fills.lock().unwrap().clear();
    }

    fn render(&self) -> HtmlSnapshot {
        let screen = self.current();
        HtmlSnapshot::from_html(screen.url(), screen.html(self.site.config.login_layout))
    }

    /// First rendered match, the element a real browser interaction lands on.
    fn target(&self, selector: &str) -> BrowserResult<ElementInfo> {
        self.render()
            .query(selector)
            .into_iter()
            .find(|e| e.visible)
            .ok_or_else(|| BrowserError::ElementNotFound(selector.to_string()))
    }

    fn filled(&self, needle: &str) -> Option<String> {
        self.fills
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(sel, _)| sel.contains(needle))
            .map(|(_, v)| v.clone())
    }

    fn sign_in(&self) {
        let cookie = self.site.issue_session();
        let mut jar = self.jar.lock().unwrap();
        jar.cookies.retain(|c| c.name != cookie.name);
        jar.cookies.push(cookie);
        jar.storage
            .entry(ORIGIN.to_string())
            .or_default()
            .insert("theme".to_string(), "dark".to_string());
    }

    fn after_sign_in(&self) -> Screen {
        if self.site.config.notice_after_login {
            Screen::Notice
        } else {
            Screen::Home
        }
    }

    fn submit(&self, selector: &str) -> BrowserResult<()> {
        match self.current() {
            Screen::Login { .. } => {
                let user = self.filled("username");
                let pass = self.filled("password");
                self.site.state.lock().unwrap().credential_submissions += 1;
                let accepted =
                    user.as_deref() == Some(USERNAME) && pass.as_deref() == Some(PASSWORD);
                let next = if accepted {
                    match self.site.config.second_factor {
                        SecondFactor::None => {
                            self.sign_in();
                            self.after_sign_in()
                        }
                        SecondFactor::Device => Screen::Device,
                        SecondFactor::Code => Screen::Verify { error: None },
                    }
                } else {
                    Screen::Login {
                        error: Some("Incorrect username or password".to_string()),
                    }
                };
                self.show(next);
                Ok(())
            }
            Screen::Verify { .. } => {
                let code = self.filled("").unwrap_or_default();
                self.site.state.lock().unwrap().code_submissions.push(code.clone());
                let next = if code == self.site.config.accepted_code {
                    self.sign_in();
                    self.after_sign_in()
                } else {
                    Screen::Verify {
                        error: Some("Invalid code, try again".to_string()),
                    }
                };
                self.show(next);
                Ok(())
            }
            _ => Err(BrowserError::ElementNotFound(selector.to_string())),
        }
    }
}

#[async_trait]
impl AutomationPage for FakePage {
    async fn goto(&self, url: &str, _wait: WaitPolicy) -> BrowserResult<()> {
        let screen = match url {
            HOME_URL => {
                let valid = self.site.is_valid(&self.jar.lock().unwrap().cookies);
                if valid {
                    Screen::Home
                } else {
                    Screen::Login { error: None }
                }
            }
            LOGIN_URL => match self.site.config.login_layout {
                LoginLayout::Maintenance => Screen::Maintenance,
                LoginLayout::Slow => Screen::Loading,
                _ => Screen::Login { error: None },
            },
            CAREERS_URL => Screen::Careers,
            other => Screen::Blank(other.to_string()),
        };
        self.show(screen);
        Ok(())
    }

    async fn reload(&self, _wait: WaitPolicy) -> BrowserResult<()> {
        let next = match self.current() {
            Screen::Device if self.site.config.device_approved => {
                self.sign_in();
                self.after_sign_in()
            }
            Screen::Verify { .. } => Screen::Verify { error: None },
            Screen::Login { .. } => Screen::Login { error: None },
            other => other,
        };
        self.show(next);
        Ok(())
    }

    async fn settle(&self, _wait: WaitPolicy) -> BrowserResult<()> {
        if self.current() == Screen::Loading {
            self.show(Screen::Login { error: None });
        }
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<String> {
        Ok(self.current().url())
    }

    async fn query_selector(&self, selector: &str) -> BrowserResult<Option<ElementInfo>> {
        Ok(self.render().query(selector).into_iter().next())
    }

    async fn fill(&self, selector: &str, value: &str) -> BrowserResult<()> {
        let field = self.target(selector)?;
        self.site.state.lock().unwrap().filled_fields.push(field.text);
        self.fills
            .lock()
            .unwrap()
            .push((selector.to_string(), value.to_string()));
        Ok(())
    }

    async fn click(&self, selector: &str) -> BrowserResult<()> {
        self.target(selector)?;
        self.submit(selector)
    }

    async fn click_text(&self, scope: &str, labels: &[String]) -> BrowserResult<Option<String>> {
        let hit = self
            .render()
            .query(scope)
            .into_iter()
            .filter(|e| e.visible)
            .find(|e| labels.iter().any(|l| label_matches(&e.text, l)));
        let Some(control) = hit else {
            return Ok(None);
        };
        if self.current() == Screen::Notice {
            self.show(Screen::Home);
        } else {
            self.submit(scope)?;
        }
        Ok(Some(control.text))
    }

    async fn press_enter(&self, selector: &str) -> BrowserResult<()> {
        self.target(selector)?;
        if self.site.config.login_layout == LoginLayout::Inert {
            return Err(BrowserError::Interaction(format!("key events blocked in {selector}")));
        }
        self.submit(selector)
    }

    async fn evaluate(&self, _script: &str) -> BrowserResult<Value> {
        Ok(Value::Null)
    }

    async fn snapshot(&self) -> BrowserResult<HtmlSnapshot> {
        Ok(self.render())
    }

    async fn screenshot(&self) -> BrowserResult<Vec<u8>> {
        Ok(b"\x89PNG\r\n\x1a\nfake".to_vec())
    }
}

// ── Chat transport ───────────────────────────────────────────────────────────

struct TransportState {
    next_id: i64,
    inbox: Vec<InboundMessage>,
    sent: Vec<String>,
    replies: VecDeque<String>,
}

/// Answers each prompt with the next queued reply from the operator.
pub struct ScriptedTransport {
    state: Mutex<TransportState>,
}

fn is_prompt(text: &str) -> bool {
    text.to_lowercase().contains("reply")
}

impl ScriptedTransport {
    pub fn with_replies(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TransportState {
                next_id: 100,
                inbox: Vec::new(),
                sent: Vec::new(),
                replies: replies.iter().map(|r| r.to_string()).collect(),
            }),
        })
    }

    pub fn silent() -> Arc<Self> {
        Self::with_replies(&[])
    }

    /// Message already sitting in the chat before the run starts.
    pub fn push_message(&self, sender: &str, text: &str) {
        let mut st = self.state.lock().unwrap();
        st.next_id += 1;
        let id = st.next_id;
        st.inbox.push(InboundMessage {
            id,
            sender_id: sender.to_string(),
            text: text.to_string(),
        });
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.sent().into_iter().filter(|m| is_prompt(m)).collect()
    }

    pub fn sent_containing(&self, needle: &str) -> usize {
        self.sent().iter().filter(|m| m.contains(needle)).count()
    }

    pub fn unused_replies(&self) -> usize {
        self.state.lock().unwrap().replies.len()
    }
}

#[async_trait]
impl MessageTransport for ScriptedTransport {
    async fn send(&self, text: &str) -> Result<(), ChannelError> {
        let mut st = self.state.lock().unwrap();
        st.sent.push(text.to_string());
        if is_prompt(text) {
            if let Some(reply) = st.replies.pop_front() {
                st.next_id += 1;
                let id = st.next_id;
                st.inbox.push(InboundMessage {
                    id,
                    sender_id: OPERATOR.to_string(),
                    text: reply,
                });
            }
        }
        Ok(())
    }

    async fn poll(&self, since_id: Option<i64>) -> Result<Vec<InboundMessage>, ChannelError> {
        let st = self.state.lock().unwrap();
        Ok(st
            .inbox
            .iter()
            .filter(|m| since_id.map_or(true, |s| m.id > s))
            .cloned()
            .collect())
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

pub struct Harness {
    pub site: Arc<FakeSite>,
    pub transport: Arc<ScriptedTransport>,
    pub dir: TempDir,
    pub acquirer: SessionAcquirer,
}

impl Harness {
    pub fn new(config: SiteConfig, transport: Arc<ScriptedTransport>) -> Self {
        Self::with_attempts(config, transport, FlowSettings::default().max_attempts)
    }

    pub fn with_attempts(
        config: SiteConfig,
        transport: Arc<ScriptedTransport>,
        max_attempts: u32,
    ) -> Self {
        let site = FakeSite::new(config);
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(StoreLimits {
            max_payload_bytes: 48 * 1024,
            max_item_bytes: 4096,
        })
        .with_backend(FileBackend::new(dir.path().join("session.json")));
        let channel = Arc::new(VerificationChannel::new(
            transport.clone(),
            OPERATOR,
            Duration::from_secs(3),
        ));
        let acquirer = SessionAcquirer::new(
            Arc::new(FakeDriver::new(site.clone())),
            store,
            channel,
            Arc::new(Classifier::new(ClassifierRules::default()).unwrap()),
            Arc::new(LoginSelectors::default()),
            AcquireSettings {
                home_url: HOME_URL.to_string(),
                diagnostics_dir: dir.path().join("diagnostics"),
                flow: FlowSettings {
                    login_url: LOGIN_URL.to_string(),
                    max_attempts,
                    ..FlowSettings::default()
                },
            },
        );
        Self {
            site,
            transport,
            dir,
            acquirer,
        }
    }

    pub fn session_file(&self) -> std::path::PathBuf {
        self.dir.path().join("session.json")
    }

    pub fn write_session(&self, snapshot: &SessionSnapshot) {
        std::fs::write(self.session_file(), snapshot.to_json().unwrap()).unwrap();
    }

    pub fn read_session(&self) -> SessionSnapshot {
        let raw = std::fs::read_to_string(self.session_file()).unwrap();
        SessionSnapshot::from_json(&raw).unwrap()
    }
}
