//! Heuristic page classifier.
//!
//! Maps a [`PageSnapshot`] to exactly one [`PageState`]. Rules are evaluated in
//! a fixed precedence order and the first match wins:
//!
//! 1. identity indicators on a non-login URL → `AuthenticatedHome`
//! 2. visible overlay without form fields and with a dismiss control → `AnnouncementBlocking`
//! 3. login-family URL plus device-approval wording or widget → `DeviceApprovalRequired`
//! 4. code input, or code wording plus a text input without exclusion wording
//!    → `CodeVerificationRequired`
//! 5. login-family URL plus a visible error element → `ErrorBanner`
//! 6. login-family URL → `LoginForm`
//! 7. otherwise → `Unknown`
//!
//! Classification is pure: same snapshot, same answer.

pub mod snapshot;

use aho_corasick::AhoCorasick;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::browser::label_matches;
use crate::core::types::PageState;
pub use snapshot::{ElementInfo, HtmlSnapshot, PageSnapshot, HIDDEN_MARKER_ATTR};

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("invalid login url pattern '{pattern}': {reason}")]
    InvalidUrlPattern { pattern: String, reason: String },
    #[error("invalid phrase list: {0}")]
    InvalidPhrases(String),
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Tunable inputs to the classifier. Every list can be overridden from the
/// `classifier` key in `authgate.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierRules {
    /// Regexes matched against the full URL.
    pub login_url_patterns: Vec<String>,
    pub home_title_markers: Vec<String>,
    pub profile_link_selectors: Vec<String>,
    pub user_info_selectors: Vec<String>,
    /// Overlay roots. An overlay holding a visible form field is a form, not
    /// an announcement.
    pub announcement_container_selectors: Vec<String>,
    /// Clickable controls inside an overlay that may dismiss it.
    pub announcement_control_selector: String,
    pub announcement_dismiss_phrases: Vec<String>,
    pub device_approval_phrases: Vec<String>,
    pub device_approval_selectors: Vec<String>,
    pub code_input_selectors: Vec<String>,
    pub code_phrases: Vec<String>,
    /// Wording that marks code-like text as unrelated content (job posts, news).
    pub code_exclusion_phrases: Vec<String>,
    pub text_input_selector: String,
    pub error_selectors: Vec<String>,
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            login_url_patterns: strings(&[
                r"(?i)/log[-_]?in\b",
                r"(?i)/sign[-_]?in\b",
                r"(?i)/logon\b",
                r"(?i)/passport\b",
                r"(?i)/sso\b",
                r"(?i)/auth(/|\?|#|$)",
                r"(?i)/(two|2)[-_]?factor",
                r"(?i)/mfa\b",
            ]),
            home_title_markers: strings(&[
                "dashboard",
                "my account",
                "home |",
                "workspace",
                "控制台",
                "工作台",
            ]),
            profile_link_selectors: strings(&[
                "a[href*='/profile']",
                "a[href*='/account/settings']",
                "a[href*='/logout']",
                "a[href*='/signout']",
            ]),
            user_info_selectors: strings(&[
                ".user-info",
                ".user-avatar",
                "#user-menu",
                "[data-testid='user-menu']",
                ".account-menu",
            ]),
            announcement_container_selectors: strings(&[
                "[role='dialog']",
                "[role='alertdialog']",
                ".modal",
                ".announcement",
                ".notice-dialog",
            ]),
            announcement_control_selector: "button".to_string(),
            announcement_dismiss_phrases: strings(&[
                "got it", "i know", "i understand", "close", "confirm", "ok", "dismiss",
                "知道了", "我知道了", "确定", "关闭",
            ]),
            device_approval_phrases: strings(&[
                "new device",
                "unrecognized device",
                "approve this sign-in",
                "approve the login",
                "confirm it's you on your",
                "check your trusted device",
                "新设备",
                "设备验证",
            ]),
            device_approval_selectors: strings(&[
                ".device-approval",
                "#device-verification",
                "[data-testid='device-approval']",
            ]),
            code_input_selectors: strings(&[
                "input[autocomplete='one-time-code']",
                "input[maxlength='6']",
                "input[name*='otp']",
                "input[name*='code']",
            ]),
            code_phrases: strings(&[
                "verification code",
                "6-digit code",
                "one-time code",
                "security code",
                "two-factor",
                "authenticator app",
                "验证码",
            ]),
            code_exclusion_phrases: strings(&[
                "recruit",
                "hiring",
                "job opening",
                "announcement",
                "招聘",
                "公告",
            ]),
            text_input_selector:
                "input[type='text'], input[type='tel'], input[type='number'], input:not([type])"
                    .to_string(),
            error_selectors: strings(&[
                ".error-message",
                ".alert-danger",
                ".login-error",
                ".form-error",
                "[role='alert']",
            ]),
        }
    }
}

fn phrase_matcher(phrases: &[String]) -> Result<AhoCorasick, ClassifierError> {
    let lowered: Vec<String> = phrases
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect();
    AhoCorasick::new(&lowered).map_err(|e| ClassifierError::InvalidPhrases(e.to_string()))
}

/// Compiled classifier. Cheap to share behind `Arc`.
#[derive(Debug)]
pub struct Classifier {
    rules: ClassifierRules,
    login_urls: Vec<Regex>,
    home_titles: AhoCorasick,
    device_phrases: AhoCorasick,
    code_phrases: AhoCorasick,
    code_exclusions: AhoCorasick,
    form_field_scope: String,
}

impl Classifier {
    pub fn new(rules: ClassifierRules) -> Result<Self, ClassifierError> {
        let login_urls = rules
            .login_url_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| ClassifierError::InvalidUrlPattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let form_field_scope = rules
            .code_input_selectors
            .iter()
            .map(String::as_str)
            .chain([
                rules.text_input_selector.as_str(),
                "input[type='password']",
                "textarea",
            ])
            .collect::<Vec<_>>()
            .join(", ");
        Ok(Self {
            form_field_scope,
            home_titles: phrase_matcher(&rules.home_title_markers)?,
            device_phrases: phrase_matcher(&rules.device_approval_phrases)?,
            code_phrases: phrase_matcher(&rules.code_phrases)?,
            code_exclusions: phrase_matcher(&rules.code_exclusion_phrases)?,
            login_urls,
            rules,
        })
    }

    pub fn rules(&self) -> &ClassifierRules {
        &self.rules
    }

    pub fn is_login_url(&self, url: &str) -> bool {
        self.login_urls.iter().any(|re| re.is_match(url))
    }

    pub fn classify(&self, page: &dyn PageSnapshot) -> PageState {
        let url = page.url();
        let on_login_url = self.is_login_url(url);
        let text = page.visible_text().to_lowercase();

        if !on_login_url && self.has_identity_indicator(page) {
            return PageState::AuthenticatedHome;
        }

        if self.find_dismiss_control(page).is_some() {
            return PageState::AnnouncementBlocking;
        }

        if on_login_url
            && (self.device_phrases.is_match(&text)
                || self
                    .rules
                    .device_approval_selectors
                    .iter()
                    .any(|s| page.has_visible(s)))
        {
            return PageState::DeviceApprovalRequired;
        }

        if self.looks_like_code_prompt(page, &text) {
            return PageState::CodeVerificationRequired;
        }

        if on_login_url {
            if let Some(message) = self.error_banner_text(page) {
                return PageState::ErrorBanner(message);
            }
            return PageState::LoginForm;
        }

        PageState::Unknown
    }

    /// Text of the first visible, non-empty error element.
    pub fn error_banner_text(&self, page: &dyn PageSnapshot) -> Option<String> {
        self.rules
            .error_selectors
            .iter()
            .find_map(|s| page.first_visible_text(s))
    }

    /// Text of the first visible overlay control whose label is a dismiss
    /// phrase. Labels must match a phrase exactly or begin with it followed
    /// by a space, so "ok" does not match "Book now". Overlays that hold a
    /// visible input are skipped: their "Confirm" submits a form.
    pub fn find_dismiss_control(&self, page: &dyn PageSnapshot) -> Option<String> {
        let control = &self.rules.announcement_control_selector;
        self.rules
            .announcement_container_selectors
            .iter()
            .find_map(|container| {
                let fields = page.query_within(container, &self.form_field_scope);
                let holds_form =
                    |i: usize| fields.get(i).is_some_and(|f| f.iter().any(|e| e.visible));
                page.query_within(container, control)
                    .into_iter()
                    .enumerate()
                    .filter(|(i, _)| !holds_form(*i))
                    .flat_map(|(_, controls)| controls)
                    .filter(|el| el.visible)
                    .map(|el| el.text)
                    .find(|label| self.is_dismiss_label(label))
            })
    }

    /// Selector list covering every overlay control, for the live click.
    pub fn overlay_control_scope(&self) -> String {
        let control = &self.rules.announcement_control_selector;
        self.rules
            .announcement_container_selectors
            .iter()
            .map(|c| format!("{c} {control}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn is_dismiss_label(&self, label: &str) -> bool {
        self.rules
            .announcement_dismiss_phrases
            .iter()
            .any(|p| label_matches(label, p))
    }

    fn has_identity_indicator(&self, page: &dyn PageSnapshot) -> bool {
        if self
            .rules
            .profile_link_selectors
            .iter()
            .chain(self.rules.user_info_selectors.iter())
            .any(|s| page.has(s))
        {
            return true;
        }
        let title = page.title().to_lowercase();
        !title.is_empty() && self.home_titles.is_match(&title)
    }

    fn looks_like_code_prompt(&self, page: &dyn PageSnapshot, text: &str) -> bool {
        if self
            .rules
            .code_input_selectors
            .iter()
            .any(|s| page.has_visible(s))
        {
            return true;
        }
        self.code_phrases.is_match(text)
            && !self.code_exclusions.is_match(text)
            && page.has_visible(&self.rules.text_input_selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new(ClassifierRules::default()).unwrap()
    }

    fn snap(url: &str, body: &str) -> HtmlSnapshot {
        HtmlSnapshot::from_html(
            url,
            format!("<html><head><title>Portal</title></head><body>{body}</body></html>"),
        )
    }

    #[test]
    fn login_form_on_login_url() {
        let page = snap(
            "https://portal.example.com/login",
            "<form><input name='username'><input type='password'>\
             <button type='submit'>Log in</button></form>",
        );
        assert_eq!(classifier().classify(&page), PageState::LoginForm);
    }

    #[test]
    fn identity_outranks_code_prompt_off_login_url() {
        let page = snap(
            "https://portal.example.com/home",
            "<a href='/profile/me'>Me</a><p>Enter the verification code</p>\
             <input name='otp_code' maxlength='6'>",
        );
        assert_eq!(classifier().classify(&page), PageState::AuthenticatedHome);
    }

    #[test]
    fn identity_on_login_url_is_not_home() {
        let page = snap(
            "https://portal.example.com/login",
            "<a href='/logout'>Log out</a><input type='password'>",
        );
        assert_eq!(classifier().classify(&page), PageState::LoginForm);
    }

    #[test]
    fn home_title_marker_is_enough() {
        let page = HtmlSnapshot::from_html(
            "https://portal.example.com/",
            "<html><head><title>Dashboard - Portal</title></head><body>hi</body></html>",
        );
        assert_eq!(classifier().classify(&page), PageState::AuthenticatedHome);
    }

    #[test]
    fn announcement_overlay_before_device_and_code() {
        let page = snap(
            "https://portal.example.com/login/verify",
            "<div role='dialog'><p>Scheduled maintenance</p><button>Got it</button></div>\
             <p>Enter the verification code</p><input name='code' maxlength='6'>",
        );
        let c = classifier();
        assert_eq!(c.classify(&page), PageState::AnnouncementBlocking);
        assert_eq!(c.find_dismiss_control(&page).as_deref(), Some("Got it"));
    }

    #[test]
    fn code_form_inside_dialog_is_not_an_announcement() {
        let page = snap(
            "https://portal.example.com/login/verify",
            "<div role='dialog'><p>Enter the 6-digit verification code</p>\
             <input autocomplete='one-time-code' maxlength='6'><button>Confirm</button></div>",
        );
        let c = classifier();
        assert_eq!(c.find_dismiss_control(&page), None);
        assert_eq!(c.classify(&page), PageState::CodeVerificationRequired);
    }

    #[test]
    fn announcement_found_next_to_form_dialog() {
        let page = snap(
            "https://portal.example.com/login/verify",
            "<div role='dialog'><input type='password'><button>Confirm</button></div>\
             <div role='dialog'><p>New terms of service</p><button>OK</button></div>",
        );
        let c = classifier();
        assert_eq!(c.find_dismiss_control(&page).as_deref(), Some("OK"));
        assert_eq!(c.classify(&page), PageState::AnnouncementBlocking);
    }

    #[test]
    fn hidden_field_does_not_turn_announcement_into_form() {
        let page = snap(
            "https://portal.example.com/home/notice",
            "<div class='modal'><input type='hidden' name='csrf'><button>Got it</button></div>",
        );
        assert_eq!(classifier().classify(&page), PageState::AnnouncementBlocking);
    }

    #[test]
    fn overlay_control_scope_pairs_container_and_control() {
        let scope = classifier().overlay_control_scope();
        assert!(scope.starts_with("[role='dialog'] button, [role='alertdialog'] button"));
        assert!(scope.ends_with(".notice-dialog button"));
    }

    #[test]
    fn hidden_overlay_is_ignored() {
        let page = snap(
            "https://portal.example.com/login",
            "<div role='dialog' style='display:none'><button>OK</button></div>\
             <input type='password'>",
        );
        assert_eq!(classifier().classify(&page), PageState::LoginForm);
    }

    #[test]
    fn dismiss_label_needs_whole_word() {
        let c = classifier();
        assert!(c.is_dismiss_label("OK"));
        assert!(c.is_dismiss_label("Got it thanks"));
        assert!(c.is_dismiss_label("我知道了"));
        assert!(!c.is_dismiss_label("Book now"));
        assert!(!c.is_dismiss_label(""));
    }

    #[test]
    fn device_approval_requires_login_url() {
        let body =
            "<p>We noticed a sign-in from a new device. Approve this sign-in on your phone.</p>";
        let c = classifier();
        assert_eq!(
            c.classify(&snap("https://portal.example.com/login/device", body)),
            PageState::DeviceApprovalRequired
        );
        assert_eq!(
            c.classify(&snap("https://portal.example.com/news", body)),
            PageState::Unknown
        );
    }

    #[test]
    fn code_input_selector_wins_without_wording() {
        let page = snap(
            "https://portal.example.com/login/2fa",
            "<input autocomplete='one-time-code'>",
        );
        assert_eq!(classifier().classify(&page), PageState::CodeVerificationRequired);
    }

    #[test]
    fn code_wording_with_plain_text_input() {
        let page = snap(
            "https://portal.example.com/login/2fa",
            "<p>Enter the 6-digit code from your authenticator app</p><input type='text' id='c'>",
        );
        assert_eq!(classifier().classify(&page), PageState::CodeVerificationRequired);
    }

    #[test]
    fn exclusion_wording_suppresses_code_prompt() {
        let page = snap(
            "https://portal.example.com/careers",
            "<p>We are hiring! Join the team building our verification code platform.</p>\
             <input type='text' placeholder='Search jobs'>",
        );
        let state = classifier().classify(&page);
        assert_ne!(state, PageState::CodeVerificationRequired);
        assert_eq!(state, PageState::Unknown);
    }

    #[test]
    fn visible_error_on_login_url_is_error_banner() {
        let page = snap(
            "https://portal.example.com/login",
            "<div class='error-message'>Incorrect password</div><input type='password'>",
        );
        assert_eq!(
            classifier().classify(&page),
            PageState::ErrorBanner("Incorrect password".into())
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let page = snap("https://portal.example.com/somewhere", "<p>loading</p>");
        let c = classifier();
        assert_eq!(c.classify(&page), c.classify(&page));
        assert_eq!(c.classify(&page), PageState::Unknown);
    }

    #[test]
    fn invalid_url_pattern_is_reported() {
        let rules = ClassifierRules {
            login_url_patterns: vec!["(".into()],
            ..ClassifierRules::default()
        };
        assert!(matches!(
            Classifier::new(rules),
            Err(ClassifierError::InvalidUrlPattern { .. })
        ));
    }
}
