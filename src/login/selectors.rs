//! Ordered element-location strategies for login automation.
//!
//! Sites differ in how they name fields and buttons, so every target is an
//! ordered fallback chain. The first strategy that succeeds wins, and a
//! failed lookup reports every strategy tried.

use serde::{Deserialize, Serialize};

use crate::classify::PageSnapshot;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// One way of locating or triggering an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MatcherStrategy {
    /// CSS selector; must match a visible element.
    Css(String),
    /// Click the first visible button-like element whose label matches.
    ButtonText(Vec<String>),
    /// Press Enter inside the focused field.
    EnterKey,
}

impl MatcherStrategy {
    pub fn describe(&self) -> String {
        match self {
            MatcherStrategy::Css(sel) => format!("css:{sel}"),
            MatcherStrategy::ButtonText(labels) => format!("text:{}", labels.join("|")),
            MatcherStrategy::EnterKey => "enter-key".to_string(),
        }
    }
}

/// Result of walking a strategy chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    Found {
        /// Selector or label that matched.
        target: String,
        strategy: MatcherStrategy,
    },
    NotFound {
        tried: Vec<String>,
    },
}

/// Configurable selector chains (the `selectors` key in `authgate.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginSelectors {
    pub username: Vec<String>,
    pub password: Vec<String>,
    pub submit: Vec<String>,
    pub submit_texts: Vec<String>,
    pub code_input: Vec<String>,
    pub code_submit: Vec<String>,
    pub code_submit_texts: Vec<String>,
    /// Scope searched by text-matching strategies.
    pub button_scope: String,
}

impl Default for LoginSelectors {
    fn default() -> Self {
        Self {
            username: strings(&[
                "input[name='username']",
                "#username",
                "input[autocomplete='username']",
                "input[type='email']",
                "input[name='email']",
                "input[name='login']",
                "input[name='account']",
                "input[name='userId']",
            ]),
            password: strings(&[
                "input[type='password']",
                "#password",
                "input[name='password']",
            ]),
            submit: strings(&[
                "button[type='submit']",
                "input[type='submit']",
                "#login-button",
                "#signin-button",
                "button[name='login']",
            ]),
            submit_texts: strings(&["log in", "login", "sign in", "continue", "登录"]),
            code_input: strings(&[
                "input[autocomplete='one-time-code']",
                "input[maxlength='6']",
                "input[name*='otp']",
                "input[name*='code']",
                "input[type='tel']",
                "input[type='text']",
            ]),
            code_submit: strings(&[
                "button[type='submit']",
                "input[type='submit']",
                "#verify-button",
            ]),
            code_submit_texts: strings(&["verify", "submit", "continue", "confirm", "验证", "确定"]),
            button_scope: "button, [role='button'], input[type='submit'], input[type='button'], a"
                .to_string(),
        }
    }
}

impl LoginSelectors {
    /// Submission chain for the credential form: CSS candidates, then button
    /// text, then Enter in the password field.
    pub fn credential_submit_chain(&self) -> Vec<MatcherStrategy> {
        submit_chain(&self.submit, &self.submit_texts)
    }

    pub fn code_submit_chain(&self) -> Vec<MatcherStrategy> {
        submit_chain(&self.code_submit, &self.code_submit_texts)
    }
}

fn submit_chain(css: &[String], texts: &[String]) -> Vec<MatcherStrategy> {
    let mut chain: Vec<MatcherStrategy> = css.iter().cloned().map(MatcherStrategy::Css).collect();
    if !texts.is_empty() {
        chain.push(MatcherStrategy::ButtonText(texts.to_vec()));
    }
    chain.push(MatcherStrategy::EnterKey);
    chain
}

/// First candidate with a visible match in the snapshot.
pub fn locate_visible(page: &dyn PageSnapshot, candidates: &[String]) -> Located {
    for sel in candidates {
        if page.has_visible(sel) {
            return Located::Found {
                target: sel.clone(),
                strategy: MatcherStrategy::Css(sel.clone()),
            };
        }
    }
    Located::NotFound {
        tried: candidates
            .iter()
            .map(|s| MatcherStrategy::Css(s.clone()).describe())
            .collect(),
    }
}
