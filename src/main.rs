use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde::Serialize;
use tracing::{info, warn};

use authgate::acquire::{AcquireSettings, AcquisitionPath, DiagnosticCapture, SessionAcquirer};
use authgate::browser::{BrowserSettings, ChromiumDriver};
use authgate::classify::Classifier;
use authgate::core::config::{self, AuthgateConfig};
use authgate::login::{FlowSettings, LoginReport};
use authgate::oob::{TelegramTransport, VerificationChannel};
use authgate::session::secret::{CommandSecretStore, SecretStore};
use authgate::session::SessionStore;

/// Printed to stdout as one JSON document; logs go to stderr.
#[derive(Debug, Serialize)]
struct RunSummary {
    ok: bool,
    path: Option<AcquisitionPath>,
    error_kind: Option<&'static str>,
    error: Option<String>,
    cookies: usize,
    storage_items: usize,
    persisted_to: Vec<String>,
    warnings: Vec<String>,
    report: LoginReport,
    diagnostics: Option<DiagnosticCapture>,
}

fn parse_config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        if a == "--config" {
            return args.next().map(PathBuf::from);
        } else if let Some(rest) = a.strip_prefix("--config=") {
            return Some(PathBuf::from(rest));
        }
    }
    None
}

fn load(path: Option<PathBuf>) -> AuthgateConfig {
    match path {
        Some(p) => config::load_config_from(&p).unwrap_or_else(|| {
            warn!("config: {} not found; using env/defaults", p.display());
            AuthgateConfig::default()
        }),
        None => config::load_config(),
    }
}

fn build_acquirer(cfg: &AuthgateConfig) -> anyhow::Result<SessionAcquirer> {
    let login_url = cfg
        .resolve_login_url()
        .ok_or_else(|| anyhow!("login URL missing; set {}", config::ENV_LOGIN_URL))?;
    let home_url = cfg
        .resolve_home_url()
        .ok_or_else(|| anyhow!("home URL missing; set {}", config::ENV_HOME_URL))?;

    let bot_token = cfg
        .telegram
        .resolve_bot_token()
        .ok_or_else(|| anyhow!("{} is required", config::ENV_TELEGRAM_BOT_TOKEN))?;
    let chat_id = cfg
        .telegram
        .resolve_chat_id()
        .ok_or_else(|| anyhow!("{} is required", config::ENV_TELEGRAM_CHAT_ID))?;
    let operator_id = cfg.telegram.resolve_operator_id().unwrap_or_else(|| chat_id.clone());
    let transport = TelegramTransport::new(cfg.telegram.resolve_api_base(), bot_token, chat_id)
        .context("failed to build Telegram client")?;
    let channel = Arc::new(VerificationChannel::new(
        Arc::new(transport),
        operator_id,
        cfg.resolve_poll_interval(),
    ));

    let secrets: Option<Arc<dyn SecretStore>> = cfg
        .resolve_secret_command()
        .and_then(|line| CommandSecretStore::from_command_line(&line))
        .map(|s| Arc::new(s) as Arc<dyn SecretStore>);
    let store = SessionStore::from_config(cfg, secrets);
    info!("session_store: backends {:?}", store.backend_labels());

    let classifier = Classifier::new(cfg.classifier.clone()).context("invalid classifier rules")?;

    let driver = ChromiumDriver::launch(BrowserSettings {
        executable: cfg.resolve_chrome_executable(),
        headless: cfg.resolve_headless(),
        ..BrowserSettings::default()
    })?;

    Ok(SessionAcquirer::new(
        Arc::new(driver),
        store,
        channel,
        Arc::new(classifier),
        Arc::new(cfg.selectors.clone()),
        AcquireSettings {
            home_url,
            diagnostics_dir: cfg.resolve_diagnostics_dir(),
            flow: FlowSettings::from_config(cfg, login_url),
        },
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = load(parse_config_path_from_args());
    let creds = cfg.resolve_credentials().ok_or_else(|| {
        anyhow!(
            "credentials missing; set {} and {}",
            config::ENV_USERNAME,
            config::ENV_PASSWORD
        )
    })?;
    let acquirer = build_acquirer(&cfg)?;

    info!("Starting session acquisition");
    let summary = match acquirer.acquire(&creds).await {
        Ok(session) => {
            let summary = RunSummary {
                ok: true,
                path: Some(session.path),
                error_kind: None,
                error: None,
                cookies: session.snapshot.cookies.len(),
                storage_items: session.snapshot.storage_item_count(),
                persisted_to: session.persist.written.clone(),
                warnings: session.warnings.clone(),
                report: session.report.clone(),
                diagnostics: None,
            };
            if let Err(e) = session.release().await {
                warn!("browser: release failed: {}", e);
            }
            summary
        }
        Err(failure) => RunSummary {
            ok: false,
            path: None,
            error_kind: Some(failure.kind()),
            error: Some(failure.error.to_string()),
            cookies: 0,
            storage_items: 0,
            persisted_to: Vec::new(),
            warnings: Vec::new(),
            report: failure.report,
            diagnostics: failure.diagnostics,
        },
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !summary.ok {
        std::process::exit(1);
    }
    Ok(())
}
