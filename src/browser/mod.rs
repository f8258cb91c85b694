//! Browser automation capability.
//!
//! The login state machine and the facade only see these traits. The live
//! implementation is [`chromium::ChromiumDriver`]; tests drive a scripted fake.

pub mod chromium;

use std::sync::Arc;

use async_trait::async_trait;

use crate::classify::{ElementInfo, HtmlSnapshot};
use crate::core::error::BrowserResult;
use crate::core::types::SessionSnapshot;

pub use chromium::{find_chrome_executable, BrowserSettings, ChromiumDriver};

/// How long to wait after a navigation or interaction before the page is
/// considered settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// DOM load event only.
    Load,
    /// Load, then wait until no new network requests start for a short window.
    #[default]
    NetworkIdle,
}

/// Launched browser able to create isolated contexts.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// New isolated context, optionally pre-seeded with cookies and storage.
    async fn new_context(
        &self,
        seed: Option<&SessionSnapshot>,
    ) -> BrowserResult<Box<dyn AutomationContext>>;
}

/// One isolated cookie jar and storage area.
#[async_trait]
pub trait AutomationContext: Send + Sync {
    async fn new_page(&mut self) -> BrowserResult<Arc<dyn AutomationPage>>;
    /// Current cookies and storage of the context.
    async fn export_snapshot(&self) -> BrowserResult<SessionSnapshot>;
    /// Idempotent.
    async fn close(&mut self) -> BrowserResult<()>;
}

#[async_trait]
pub trait AutomationPage: Send + Sync {
    async fn goto(&self, url: &str, wait: WaitPolicy) -> BrowserResult<()>;
    async fn reload(&self, wait: WaitPolicy) -> BrowserResult<()>;
    async fn settle(&self, wait: WaitPolicy) -> BrowserResult<()>;
    async fn current_url(&self) -> BrowserResult<String>;
    async fn query_selector(&self, selector: &str) -> BrowserResult<Option<ElementInfo>>;
    async fn fill(&self, selector: &str, value: &str) -> BrowserResult<()>;
    async fn click(&self, selector: &str) -> BrowserResult<()>;
    /// Click the first visible element under `scope` whose label matches one
    /// of `labels`. Returns the clicked label, or `None` when nothing matched.
    async fn click_text(&self, scope: &str, labels: &[String]) -> BrowserResult<Option<String>>;
    async fn press_enter(&self, selector: &str) -> BrowserResult<()>;
    async fn evaluate(&self, script: &str) -> BrowserResult<serde_json::Value>;
    /// Visibility-annotated DOM capture for classification.
    async fn snapshot(&self) -> BrowserResult<HtmlSnapshot>;
    async fn screenshot(&self) -> BrowserResult<Vec<u8>>;
}

/// Label comparison shared by drivers: exact match or match followed by a
/// space, case-insensitive.
pub fn label_matches(label: &str, wanted: &str) -> bool {
    let label = label.trim().to_lowercase();
    let wanted = wanted.trim().to_lowercase();
    !wanted.is_empty() && (label == wanted || label.starts_with(&format!("{wanted} ")))
}
