use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

/// Failures surfaced by the browser-automation driver.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("element '{0}' not found")]
    ElementNotFound(String),
    #[error("page interaction failed: {0}")]
    Interaction(String),
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("browser context already closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures inside a single session-store backend. Never fatal to a run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("secret store failure: {0}")]
    Secret(String),
    #[error("backend '{0}' is read-only")]
    ReadOnly(String),
}

/// Failures of the out-of-band messaging transport.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport request failed: {0}")]
    Transport(String),
    #[error("transport returned an unexpected payload: {0}")]
    Protocol(String),
    #[error("channel cursor not initialised; call init_cursor() first")]
    NotInitialised,
}

impl From<reqwest::Error> for ChannelError {
    fn from(err: reqwest::Error) -> Self {
        ChannelError::Transport(err.to_string())
    }
}

/// Every way an acquisition can end without an authenticated session, plus the
/// recoverable kinds the state machine handles internally.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("cached session failed validation (page classified as {0})")]
    RestoreInvalid(String),

    #[error("no username/password inputs found (tried: {})", tried.join(", "))]
    CredentialFieldsNotFound { tried: Vec<String> },

    #[error("no submit path found for the login form (tried: {})", tried.join(", "))]
    SubmitPathNotFound { tried: Vec<String> },

    #[error("login rejected by the site: {0}")]
    CredentialsRejected(String),

    #[error("new-device approval was not completed within {waited_secs}s")]
    DeviceApprovalTimedOut { waited_secs: u64 },

    #[error("no verification code received within {waited_secs}s (attempt {attempt})")]
    CodeTimedOut { attempt: u32, waited_secs: u64 },

    #[error("verification code rejected on attempt {attempt}: {message}")]
    CodeRejected { attempt: u32, message: String },

    #[error("verification failed after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },

    #[error("page state could not be determined at {url}")]
    ClassificationAmbiguous { url: String },

    #[error("session persisted incompletely: {0}")]
    PersistFailure(String),

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl AcquisitionError {
    /// Stable label used in operator notifications and diagnostic file names.
    pub fn kind(&self) -> &'static str {
        match self {
            AcquisitionError::RestoreInvalid(_) => "restore_invalid",
            AcquisitionError::CredentialFieldsNotFound { .. } => "credential_fields_not_found",
            AcquisitionError::SubmitPathNotFound { .. } => "submit_path_not_found",
            AcquisitionError::CredentialsRejected(_) => "credentials_rejected",
            AcquisitionError::DeviceApprovalTimedOut { .. } => "device_approval_timed_out",
            AcquisitionError::CodeTimedOut { .. } => "code_timed_out",
            AcquisitionError::CodeRejected { .. } => "code_rejected",
            AcquisitionError::AttemptsExhausted { .. } => "attempts_exhausted",
            AcquisitionError::ClassificationAmbiguous { .. } => "classification_ambiguous",
            AcquisitionError::PersistFailure(_) => "persist_failure",
            AcquisitionError::Browser(_) => "browser",
            AcquisitionError::Channel(_) => "channel",
            AcquisitionError::Unexpected(_) => "unexpected",
        }
    }

    /// Kinds the state machine absorbs; these never reach the facade's caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AcquisitionError::RestoreInvalid(_)
                | AcquisitionError::CodeRejected { .. }
                | AcquisitionError::PersistFailure(_)
        )
    }
}
