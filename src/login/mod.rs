//! Login state machine.
//!
//! Drives one page from the login URL to an authenticated home, reacting to
//! whatever the classifier says the page is asking for: credentials, a
//! new-device approval, or a one-time code. Every decision is made on a
//! snapshot taken after the preceding navigation or interaction settled.

pub mod selectors;

use std::sync::Arc;
use std::time::Duration;

use rand::distr::{Distribution, Uniform};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::browser::{AutomationPage, WaitPolicy};
use crate::classify::{Classifier, HtmlSnapshot, PageSnapshot};
use crate::core::config::{self, AuthgateConfig};
use crate::core::error::AcquisitionError;
use crate::core::types::{AttemptOutcome, Credentials, PageState, VerificationAttempt};
use crate::oob::VerificationChannel;
use selectors::{locate_visible, Located, LoginSelectors, MatcherStrategy};

/// Overlay dismissals allowed per observation.
pub const MAX_DISMISSALS_PER_OBSERVATION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    Unauthenticated,
    SessionRestoring,
    CredentialSubmission,
    DeviceApproval,
    CodeVerification,
    Done,
    Failed,
}

impl LoginState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoginState::Done | LoginState::Failed)
    }
}

fn log_state(state: LoginState) {
    info!("login_state={:?}", state);
}

#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub login_url: String,
    pub max_attempts: u32,
    pub code_timeout: Duration,
    pub device_wait: Duration,
    pub recheck_delay: Duration,
    pub max_dismissals: u32,
}

impl FlowSettings {
    pub fn from_config(cfg: &AuthgateConfig, login_url: impl Into<String>) -> Self {
        Self {
            login_url: login_url.into(),
            max_attempts: cfg.resolve_max_attempts(),
            code_timeout: cfg.resolve_code_timeout(),
            device_wait: cfg.resolve_device_wait(),
            recheck_delay: cfg.resolve_recheck_delay(),
            max_dismissals: MAX_DISMISSALS_PER_OBSERVATION,
        }
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            login_url: String::new(),
            max_attempts: config::DEFAULT_MAX_ATTEMPTS,
            code_timeout: Duration::from_secs(config::DEFAULT_CODE_TIMEOUT_SECS),
            device_wait: Duration::from_secs(config::DEFAULT_DEVICE_WAIT_SECS),
            recheck_delay: Duration::from_millis(config::DEFAULT_RECHECK_DELAY_MS),
            max_dismissals: MAX_DISMISSALS_PER_OBSERVATION,
        }
    }
}

/// What happened during one run, kept for the summary and diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoginReport {
    pub transitions: Vec<LoginState>,
    pub credential_submissions: u32,
    pub attempts: Vec<VerificationAttempt>,
    pub dismissed_overlays: u32,
    pub submit_strategy: Option<String>,
}

impl LoginReport {
    pub fn visited(&self, state: LoginState) -> bool {
        self.transitions.contains(&state)
    }

    pub fn final_state(&self) -> Option<LoginState> {
        self.transitions.last().copied()
    }
}

pub struct LoginStateMachine {
    classifier: Arc<Classifier>,
    selectors: Arc<LoginSelectors>,
    channel: Arc<VerificationChannel>,
    settings: FlowSettings,
    report: LoginReport,
}

impl LoginStateMachine {
    pub fn new(
        classifier: Arc<Classifier>,
        selectors: Arc<LoginSelectors>,
        channel: Arc<VerificationChannel>,
        settings: FlowSettings,
    ) -> Self {
        Self {
            classifier,
            selectors,
            channel,
            settings,
            report: LoginReport::default(),
        }
    }

    pub fn report(&self) -> &LoginReport {
        &self.report
    }

    pub fn into_report(self) -> LoginReport {
        self.report
    }

    pub fn enter(&mut self, state: LoginState) {
        if self.report.final_state() == Some(state) && !state.is_terminal() {
            return;
        }
        log_state(state);
        self.report.transitions.push(state);
    }

    /// Full login from the configured login URL. Ends in `Done` or `Failed`.
    pub async fn run(
        &mut self,
        page: &dyn AutomationPage,
        creds: &Credentials,
    ) -> Result<(), AcquisitionError> {
        let result = self.run_inner(page, creds).await;
        match &result {
            Ok(()) => self.enter(LoginState::Done),
            Err(e) => {
                warn!("login: failed ({}): {}", e.kind(), e);
                self.enter(LoginState::Failed);
            }
        }
        result
    }

    async fn run_inner(
        &mut self,
        page: &dyn AutomationPage,
        creds: &Credentials,
    ) -> Result<(), AcquisitionError> {
        self.enter(LoginState::Unauthenticated);
        page.goto(&self.settings.login_url, WaitPolicy::NetworkIdle).await?;
        let mut state = self.observe(page).await?;

        if matches!(state, PageState::LoginForm | PageState::ErrorBanner(_)) {
            self.submit_credentials(page, creds).await?;
            state = self.observe(page).await?;
        }
        self.advance(page, state).await
    }

    /// Snapshot and classify, dismissing blocking overlays and re-checking an
    /// unrecognised page once after a short delay.
    pub async fn observe(
        &mut self,
        page: &dyn AutomationPage,
    ) -> Result<PageState, AcquisitionError> {
        let mut dismissals = 0u32;
        let mut rechecked = false;
        loop {
            let snap = page.snapshot().await?;
            let state = self.classifier.classify(&snap);
            debug!("login: {} classified as {}", snap.url(), state);

            match state {
                PageState::AnnouncementBlocking if dismissals < self.settings.max_dismissals => {
                    dismissals += 1;
                    self.dismiss_overlay(page, &snap).await?;
                }
                PageState::AnnouncementBlocking => {
                    warn!("login: overlay still blocking after {} dismissals", dismissals);
                    return Err(AcquisitionError::ClassificationAmbiguous {
                        url: snap.url().to_string(),
                    });
                }
                PageState::Unknown if !rechecked => {
                    rechecked = true;
                    debug!("login: unknown page, re-checking in {:?}", self.settings.recheck_delay);
                    tokio::time::sleep(self.settings.recheck_delay).await;
                    page.settle(WaitPolicy::NetworkIdle).await?;
                }
                PageState::Unknown => {
                    return Err(AcquisitionError::ClassificationAmbiguous {
                        url: snap.url().to_string(),
                    });
                }
                other => return Ok(other),
            }
        }
    }

    async fn dismiss_overlay(
        &mut self,
        page: &dyn AutomationPage,
        snap: &HtmlSnapshot,
    ) -> Result<(), AcquisitionError> {
        let Some(label) = self.classifier.find_dismiss_control(snap) else {
            return Ok(());
        };
        let scope = self.classifier.overlay_control_scope();
        match page.click_text(&scope, &[label.clone()]).await? {
            Some(_) => {
                info!("login: dismissed overlay via '{}'", label);
                self.report.dismissed_overlays += 1;
            }
            None => warn!("login: overlay control '{}' could not be clicked", label),
        }
        page.settle(WaitPolicy::NetworkIdle).await?;
        Ok(())
    }

    async fn advance(
        &mut self,
        page: &dyn AutomationPage,
        state: PageState,
    ) -> Result<(), AcquisitionError> {
        match state {
            PageState::AuthenticatedHome => Ok(()),
            PageState::DeviceApprovalRequired => match self.device_approval(page).await? {
                PageState::AuthenticatedHome => Ok(()),
                PageState::CodeVerificationRequired => self.code_verification(page).await,
                other => {
                    info!("login: device approval not completed (page is {})", other);
                    Err(AcquisitionError::DeviceApprovalTimedOut {
                        waited_secs: self.settings.device_wait.as_secs(),
                    })
                }
            },
            PageState::CodeVerificationRequired => self.code_verification(page).await,
            PageState::ErrorBanner(message) => Err(AcquisitionError::CredentialsRejected(message)),
            PageState::LoginForm => Err(AcquisitionError::CredentialsRejected(
                "login form still displayed after submitting credentials".to_string(),
            )),
            PageState::AnnouncementBlocking | PageState::Unknown => {
                Err(AcquisitionError::ClassificationAmbiguous {
                    url: page.current_url().await.unwrap_or_default(),
                })
            }
        }
    }

    async fn submit_credentials(
        &mut self,
        page: &dyn AutomationPage,
        creds: &Credentials,
    ) -> Result<(), AcquisitionError> {
        self.enter(LoginState::CredentialSubmission);
        let snap = page.snapshot().await?;

        let user = locate_visible(&snap, &self.selectors.username);
        let pass = locate_visible(&snap, &self.selectors.password);
        let (user_sel, pass_sel) = match (user, pass) {
            (Located::Found { target: u, .. }, Located::Found { target: p, .. }) => (u, p),
            (u, p) => {
                let mut tried = Vec::new();
                for missing in [u, p] {
                    if let Located::NotFound { tried: t } = missing {
                        tried.extend(t);
                    }
                }
                return Err(AcquisitionError::CredentialFieldsNotFound { tried });
            }
        };

        page.fill(&user_sel, &creds.username).await?;
        human_pause().await;
        page.fill(&pass_sel, &creds.password).await?;
        human_pause().await;

        let chain = self.selectors.credential_submit_chain();
        let strategy = self.dispatch_submit(page, &snap, &chain, &pass_sel).await?;
        self.report.credential_submissions += 1;
        self.report.submit_strategy = Some(strategy.describe());
        info!("login: credentials submitted via {}", strategy.describe());

        page.settle(WaitPolicy::NetworkIdle).await?;
        Ok(())
    }

    /// Walk the submit chain; the first strategy that acts wins.
    async fn dispatch_submit(
        &self,
        page: &dyn AutomationPage,
        snap: &HtmlSnapshot,
        chain: &[MatcherStrategy],
        field_selector: &str,
    ) -> Result<MatcherStrategy, AcquisitionError> {
        let mut tried = Vec::with_capacity(chain.len());
        for strategy in chain {
            tried.push(strategy.describe());
            let outcome = match strategy {
                MatcherStrategy::Css(sel) => {
                    if !snap.has_visible(sel) {
                        continue;
                    }
                    page.click(sel).await.map(|_| true)
                }
                MatcherStrategy::ButtonText(labels) => page
                    .click_text(&self.selectors.button_scope, labels)
                    .await
                    .map(|clicked| clicked.is_some()),
                MatcherStrategy::EnterKey => page.press_enter(field_selector).await.map(|_| true),
            };
            match outcome {
                Ok(true) => return Ok(strategy.clone()),
                Ok(false) => {}
                Err(e) => debug!("login: submit via {} failed: {}", strategy.describe(), e),
            }
        }
        Err(AcquisitionError::SubmitPathNotFound { tried })
    }

    async fn device_approval(
        &mut self,
        page: &dyn AutomationPage,
    ) -> Result<PageState, AcquisitionError> {
        self.enter(LoginState::DeviceApproval);
        let wait = self.settings.device_wait;
        let prompt = format!(
            "🔐 New-device approval required for {}.\nApprove the sign-in on your trusted device, \
             then reply \"ok\" (waiting up to {}s).",
            host_of(&self.settings.login_url),
            wait.as_secs()
        );
        let confirmed = self.channel.await_confirmation(&prompt, wait).await?;
        if confirmed {
            info!("login: device approval confirmed out-of-band");
        } else {
            info!("login: no confirmation within {}s, re-checking page", wait.as_secs());
        }
        page.reload(WaitPolicy::NetworkIdle).await?;
        self.observe(page).await
    }

    async fn code_verification(
        &mut self,
        page: &dyn AutomationPage,
    ) -> Result<(), AcquisitionError> {
        self.enter(LoginState::CodeVerification);
        let max = self.settings.max_attempts.max(1);
        let timeout = self.settings.code_timeout;
        let mut feedback: Option<String> = None;

        for attempt in 1..=max {
            let remaining = max - attempt + 1;
            let mut record = VerificationAttempt::start(attempt);
            let prompt = code_prompt(attempt, max, remaining, timeout, feedback.as_deref());

            let Some(code) = self.channel.request_code(&prompt, timeout).await? else {
                record.outcome = AttemptOutcome::TimedOut;
                self.report.attempts.push(record);
                return Err(AcquisitionError::CodeTimedOut {
                    attempt,
                    waited_secs: timeout.as_secs(),
                });
            };
            record.code = Some(code.clone());

            if let Err(e) = self.submit_code(page, &code).await {
                self.report.attempts.push(record);
                return Err(e);
            }

            let state = self.observe(page).await;
            let state = match state {
                Ok(s) => s,
                Err(e) => {
                    self.report.attempts.push(record);
                    return Err(e);
                }
            };

            match state {
                PageState::AuthenticatedHome => {
                    record.outcome = AttemptOutcome::Accepted;
                    self.report.attempts.push(record);
                    info!("login: code accepted on attempt {}", attempt);
                    return Ok(());
                }
                PageState::CodeVerificationRequired | PageState::ErrorBanner(_) => {
                    record.outcome = AttemptOutcome::Rejected;
                    self.report.attempts.push(record);
                    let message = match &state {
                        PageState::ErrorBanner(m) => m.clone(),
                        _ => self
                            .current_error_text(page)
                            .await
                            .unwrap_or_else(|| "the site did not accept the code".to_string()),
                    };
                    warn!(
                        "login: {}",
                        AcquisitionError::CodeRejected {
                            attempt,
                            message: message.clone()
                        }
                    );
                    if attempt < max {
                        self.channel
                            .notify(&format!(
                                "❌ Code rejected (attempt {}/{}). {} attempt(s) left.",
                                attempt,
                                max,
                                max - attempt
                            ))
                            .await;
                    }
                    feedback = Some(message);
                }
                PageState::DeviceApprovalRequired => {
                    record.outcome = AttemptOutcome::Accepted;
                    self.report.attempts.push(record);
                    return match self.device_approval(page).await? {
                        PageState::AuthenticatedHome => Ok(()),
                        _ => Err(AcquisitionError::DeviceApprovalTimedOut {
                            waited_secs: self.settings.device_wait.as_secs(),
                        }),
                    };
                }
                PageState::LoginForm => {
                    record.outcome = AttemptOutcome::Rejected;
                    self.report.attempts.push(record);
                    return Err(AcquisitionError::CredentialsRejected(
                        "returned to the login form after code submission".to_string(),
                    ));
                }
                PageState::AnnouncementBlocking | PageState::Unknown => {
                    self.report.attempts.push(record);
                    return Err(AcquisitionError::ClassificationAmbiguous {
                        url: page.current_url().await.unwrap_or_default(),
                    });
                }
            }
        }

        Err(AcquisitionError::AttemptsExhausted { attempts: max })
    }

    async fn submit_code(
        &mut self,
        page: &dyn AutomationPage,
        code: &str,
    ) -> Result<(), AcquisitionError> {
        let snap = page.snapshot().await?;
        let input = match locate_visible(&snap, &self.selectors.code_input) {
            Located::Found { target, .. } => target,
            Located::NotFound { tried } => {
                return Err(AcquisitionError::CredentialFieldsNotFound { tried })
            }
        };
        page.fill(&input, code).await?;
        human_pause().await;
        let chain = self.selectors.code_submit_chain();
        let strategy = self.dispatch_submit(page, &snap, &chain, &input).await?;
        debug!("login: code submitted via {}", strategy.describe());
        page.settle(WaitPolicy::NetworkIdle).await?;
        Ok(())
    }

    async fn current_error_text(&self, page: &dyn AutomationPage) -> Option<String> {
        let snap = page.snapshot().await.ok()?;
        self.classifier.error_banner_text(&snap)
    }
}

fn code_prompt(
    attempt: u32,
    max: u32,
    remaining: u32,
    timeout: Duration,
    feedback: Option<&str>,
) -> String {
    let mut prompt = String::new();
    if let Some(reason) = feedback {
        prompt.push_str(&format!("Previous code was rejected: {reason}\n"));
    }
    prompt.push_str(&format!(
        "🔑 Verification code required (attempt {attempt}/{max}, {remaining} remaining).\n\
         Reply with the 6-digit code, or /code 123456, within {}s.",
        timeout.as_secs()
    ));
    prompt
}

fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// Short randomized pause between form interactions.
async fn human_pause() {
    let ms = {
        let mut rng = rand::rng();
        Uniform::new(150u64, 600)
            .map(|d| d.sample(&mut rng))
            .unwrap_or(300)
    };
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
