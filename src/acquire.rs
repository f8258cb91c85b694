//! Session acquisition facade.
//!
//! One call, one authenticated browser context. The cached snapshot is tried
//! first; when it does not lead straight to an authenticated home, a fresh
//! context runs the full login state machine. Either way the caller gets a
//! live context plus the snapshot that was just captured from it, or one
//! classified failure with diagnostics on disk and a single operator
//! notification.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::browser::{AutomationContext, AutomationPage, BrowserDriver, WaitPolicy};
use crate::classify::Classifier;
use crate::core::error::{AcquisitionError, BrowserResult};
use crate::core::types::{Credentials, PageState, SessionSnapshot};
use crate::login::selectors::LoginSelectors;
use crate::login::{FlowSettings, LoginReport, LoginState, LoginStateMachine};
use crate::oob::VerificationChannel;
use crate::session::{PersistReport, SessionStore};

#[derive(Debug, Clone)]
pub struct AcquireSettings {
    pub home_url: String,
    pub diagnostics_dir: PathBuf,
    pub flow: FlowSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionPath {
    Restored,
    Login,
}

/// A live authenticated context. Call [`AcquiredSession::release`] when done.
pub struct AcquiredSession {
    pub snapshot: SessionSnapshot,
    pub context: Box<dyn AutomationContext>,
    pub page: Arc<dyn AutomationPage>,
    pub path: AcquisitionPath,
    pub report: LoginReport,
    pub persist: PersistReport,
    /// Non-fatal problems, e.g. a backend that could not be written.
    pub warnings: Vec<String>,
}

impl AcquiredSession {
    pub async fn release(mut self) -> BrowserResult<()> {
        self.context.close().await
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiagnosticCapture {
    pub url: Option<String>,
    pub screenshot: Option<PathBuf>,
    pub html: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct AcquisitionFailure {
    #[source]
    pub error: AcquisitionError,
    pub diagnostics: Option<DiagnosticCapture>,
    pub report: LoginReport,
}

impl AcquisitionFailure {
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }
}

pub struct SessionAcquirer {
    driver: Arc<dyn BrowserDriver>,
    store: SessionStore,
    channel: Arc<VerificationChannel>,
    classifier: Arc<Classifier>,
    selectors: Arc<LoginSelectors>,
    settings: AcquireSettings,
}

impl SessionAcquirer {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        store: SessionStore,
        channel: Arc<VerificationChannel>,
        classifier: Arc<Classifier>,
        selectors: Arc<LoginSelectors>,
        settings: AcquireSettings,
    ) -> Self {
        Self {
            driver,
            store,
            channel,
            classifier,
            selectors,
            settings,
        }
    }

    pub async fn acquire(
        &self,
        creds: &Credentials,
    ) -> Result<AcquiredSession, AcquisitionFailure> {
        let mut machine = LoginStateMachine::new(
            self.classifier.clone(),
            self.selectors.clone(),
            self.channel.clone(),
            self.settings.flow.clone(),
        );

        if let Some(seed) = self.store.restore().await {
            machine.enter(LoginState::SessionRestoring);
            let attempt = AssertUnwindSafe(self.try_restore(&mut machine, &seed))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(AcquisitionError::Unexpected(panic_message(panic))));
            match attempt {
                Ok(Some((context, page))) => {
                    machine.enter(LoginState::Done);
                    return self
                        .finish(context, page, AcquisitionPath::Restored, machine.into_report())
                        .await;
                }
                Ok(None) => {}
                Err(e) => warn!("acquire: restore attempt failed: {}", e),
            }
        }

        self.login(machine, creds).await
    }

    /// `Ok(Some)` with a live context when the seeded session is still
    /// authenticated; `Ok(None)` after closing the context otherwise.
    async fn try_restore(
        &self,
        machine: &mut LoginStateMachine,
        seed: &SessionSnapshot,
    ) -> Result<Option<(Box<dyn AutomationContext>, Arc<dyn AutomationPage>)>, AcquisitionError> {
        let mut context = self.driver.new_context(Some(seed)).await?;
        let outcome = async {
            let page = context.new_page().await?;
            page.goto(&self.settings.home_url, WaitPolicy::NetworkIdle).await?;
            let state = machine.observe(page.as_ref()).await?;
            Ok::<_, AcquisitionError>((page, state))
        }
        .await;

        match outcome {
            Ok((page, PageState::AuthenticatedHome)) => {
                info!("acquire: cached session is still valid");
                Ok(Some((context, page)))
            }
            Ok((_, state)) => {
                info!("acquire: {}", AcquisitionError::RestoreInvalid(state.to_string()));
                close_quietly(context.as_mut()).await;
                Ok(None)
            }
            Err(e) => {
                info!(
                    "acquire: {}",
                    AcquisitionError::RestoreInvalid(format!("{} ({})", e.kind(), e))
                );
                close_quietly(context.as_mut()).await;
                Ok(None)
            }
        }
    }

    async fn login(
        &self,
        mut machine: LoginStateMachine,
        creds: &Credentials,
    ) -> Result<AcquiredSession, AcquisitionFailure> {
        let mut context = match self.driver.new_context(None).await {
            Ok(c) => c,
            Err(e) => return Err(self.fail(e.into(), None, machine.into_report()).await),
        };
        let page = match context.new_page().await {
            Ok(p) => p,
            Err(e) => {
                close_quietly(context.as_mut()).await;
                return Err(self.fail(e.into(), None, machine.into_report()).await);
            }
        };
        if let Err(e) = self.channel.init_cursor().await {
            close_quietly(context.as_mut()).await;
            return Err(self.fail(e.into(), None, machine.into_report()).await);
        }

        let outcome = AssertUnwindSafe(machine.run(page.as_ref(), creds))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(r) => r,
            Err(panic) => {
                let err = AcquisitionError::Unexpected(panic_message(panic));
                machine.enter(LoginState::Failed);
                Err(err)
            }
        };

        match result {
            Ok(()) => {
                self.finish(context, page, AcquisitionPath::Login, machine.into_report())
                    .await
            }
            Err(e) => {
                let diagnostics = self.capture_diagnostics(page.as_ref(), e.kind()).await;
                close_quietly(context.as_mut()).await;
                Err(self.fail(e, Some(diagnostics), machine.into_report()).await)
            }
        }
    }

    /// Export the fresh snapshot from the live context and persist it.
    async fn finish(
        &self,
        mut context: Box<dyn AutomationContext>,
        page: Arc<dyn AutomationPage>,
        path: AcquisitionPath,
        report: LoginReport,
    ) -> Result<AcquiredSession, AcquisitionFailure> {
        let snapshot = match context.export_snapshot().await {
            Ok(s) => s,
            Err(e) => {
                let diagnostics = self.capture_diagnostics(page.as_ref(), "browser").await;
                close_quietly(context.as_mut()).await;
                return Err(self.fail(e.into(), Some(diagnostics), report).await);
            }
        };

        let mut warnings = Vec::new();
        let persist = if snapshot.is_empty() {
            let msg = "exported snapshot is empty; stored session left untouched";
            warn!("acquire: {}", msg);
            warnings.push(msg.to_string());
            PersistReport::default()
        } else {
            let report = self.store.persist(&snapshot).await;
            if let Some(w) = report.warning() {
                warn!("acquire: {}", w);
                warnings.push(w.to_string());
            }
            if !report.is_success() {
                warnings.push("session was not persisted to any backend".to_string());
            }
            report
        };

        info!(
            "acquire: authenticated via {:?} ({} cookies captured)",
            path,
            snapshot.cookies.len()
        );
        Ok(AcquiredSession {
            snapshot,
            context,
            page,
            path,
            report,
            persist,
            warnings,
        })
    }

    /// Single operator notification per failed run.
    async fn fail(
        &self,
        error: AcquisitionError,
        diagnostics: Option<DiagnosticCapture>,
        report: LoginReport,
    ) -> AcquisitionFailure {
        error!("acquire: failed [{}]: {}", error.kind(), error);
        let mut text = format!("❌ Login failed [{}]: {}", error.kind(), error);
        if let Some(url) = diagnostics.as_ref().and_then(|d| d.url.as_deref()) {
            text.push_str(&format!("\nLast page: {url}"));
        }
        self.channel.notify(&text).await;
        AcquisitionFailure {
            error,
            diagnostics,
            report,
        }
    }

    /// Best-effort screenshot and DOM dump named `<timestamp>_<kind>.{png,html}`.
    async fn capture_diagnostics(
        &self,
        page: &dyn AutomationPage,
        kind: &str,
    ) -> DiagnosticCapture {
        let mut capture = DiagnosticCapture {
            url: page.current_url().await.ok().filter(|u| !u.is_empty()),
            ..DiagnosticCapture::default()
        };
        let dir = &self.settings.diagnostics_dir;
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!("acquire: cannot create diagnostics dir {}: {}", dir.display(), e);
            return capture;
        }
        let stem = format!("{}_{}", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f"), kind);

        match page.screenshot().await {
            Ok(png) => {
                let path = dir.join(format!("{stem}.png"));
                match tokio::fs::write(&path, png).await {
                    Ok(()) => capture.screenshot = Some(path),
                    Err(e) => warn!("acquire: screenshot not written: {}", e),
                }
            }
            Err(e) => warn!("acquire: screenshot failed: {}", e),
        }
        match page.snapshot().await {
            Ok(snap) => {
                let path = dir.join(format!("{stem}.html"));
                match tokio::fs::write(&path, snap.html()).await {
                    Ok(()) => capture.html = Some(path),
                    Err(e) => warn!("acquire: DOM dump not written: {}", e),
                }
            }
            Err(e) => warn!("acquire: DOM capture failed: {}", e),
        }
        if capture.screenshot.is_some() || capture.html.is_some() {
            info!("acquire: diagnostics saved under {}", dir.display());
        }
        capture
    }
}

async fn close_quietly(context: &mut dyn AutomationContext) {
    if let Err(e) = context.close().await {
        warn!("acquire: context close failed: {}", e);
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "panic with non-string payload");
    }

    #[test]
    fn failure_displays_inner_error() {
        let f = AcquisitionFailure {
            error: AcquisitionError::AttemptsExhausted { attempts: 3 },
            diagnostics: None,
            report: LoginReport::default(),
        };
        assert_eq!(f.kind(), "attempts_exhausted");
        assert!(f.to_string().contains("3 attempts"));
    }
}
