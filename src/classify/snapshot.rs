//! Page snapshot capability used by the classifier.
//!
//! The classifier never talks to a browser. It reads a [`PageSnapshot`]: the
//! current URL, the title, the rendered visible text, and a CSS-queryable DOM.
//! [`HtmlSnapshot`] implements it over serialized HTML, so the same rules run
//! against a live capture or a synthetic fixture.

use scraper::{ElementRef, Html, Selector};
use tracing::debug;

/// Attribute the live driver stamps on elements whose computed style makes
/// them invisible before serializing the DOM.
pub const HIDDEN_MARKER_ATTR: &str = "data-authgate-hidden";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementInfo {
    /// Normalized inner text; falls back to `value`, `aria-label`, `placeholder`.
    pub text: String,
    pub visible: bool,
}

pub trait PageSnapshot {
    fn url(&self) -> &str;
    fn title(&self) -> &str;
    fn visible_text(&self) -> &str;
    /// All elements matching a CSS selector, in document order.
    /// An unparseable selector matches nothing.
    fn query(&self, selector: &str) -> Vec<ElementInfo>;
    /// For each rendered element matching `container`, the elements inside
    /// it matching `selector`. Hidden containers are left out.
    fn query_within(&self, container: &str, selector: &str) -> Vec<Vec<ElementInfo>>;

    fn has(&self, selector: &str) -> bool {
        !self.query(selector).is_empty()
    }

    fn has_visible(&self, selector: &str) -> bool {
        self.query(selector).iter().any(|e| e.visible)
    }

    fn first_visible_text(&self, selector: &str) -> Option<String> {
        self.query(selector)
            .into_iter()
            .filter(|e| e.visible)
            .map(|e| e.text)
            .find(|t| !t.is_empty())
    }
}

/// Snapshot backed by serialized HTML.
#[derive(Debug, Clone)]
pub struct HtmlSnapshot {
    url: String,
    title: String,
    html: String,
    visible_text: String,
}

impl HtmlSnapshot {
    /// Build from a live capture. When `visible_text` is `None` it is derived
    /// from the DOM, skipping hidden subtrees and non-rendered tags.
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        html: impl Into<String>,
        visible_text: Option<String>,
    ) -> Self {
        let html = html.into();
        let visible_text = visible_text.unwrap_or_else(|| derive_visible_text(&html));
        Self {
            url: url.into(),
            title: title.into(),
            html,
            visible_text,
        }
    }

    /// Build from HTML alone, reading the title from `<title>`.
    pub fn from_html(url: impl Into<String>, html: impl Into<String>) -> Self {
        let html = html.into();
        let title = {
            let doc = Html::parse_document(&html);
            Selector::parse("title")
                .ok()
                .and_then(|sel| {
                    doc.select(&sel)
                        .next()
                        .map(|el| normalize_ws(&el.text().collect::<String>()))
                })
                .unwrap_or_default()
        };
        Self::new(url, title, html, None)
    }

    pub fn html(&self) -> &str {
        &self.html
    }
}

impl PageSnapshot for HtmlSnapshot {
    fn url(&self) -> &str {
        &self.url
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn visible_text(&self) -> &str {
        &self.visible_text
    }

    fn query(&self, selector: &str) -> Vec<ElementInfo> {
        let Some(sel) = parse_selector(selector) else {
            return Vec::new();
        };
        let doc = Html::parse_document(&self.html);
        doc.select(&sel).map(|el| element_info(&el)).collect()
    }

    fn query_within(&self, container: &str, selector: &str) -> Vec<Vec<ElementInfo>> {
        let (Some(outer), Some(inner)) = (parse_selector(container), parse_selector(selector))
        else {
            return Vec::new();
        };
        let doc = Html::parse_document(&self.html);
        doc.select(&outer)
            .filter(|c| is_rendered(c))
            .map(|c| c.select(&inner).map(|el| element_info(&el)).collect())
            .collect()
    }
}

fn parse_selector(selector: &str) -> Option<Selector> {
    match Selector::parse(selector) {
        Ok(s) => Some(s),
        Err(e) => {
            debug!("snapshot: ignoring unparseable selector '{}': {:?}", selector, e);
            None
        }
    }
}

fn element_info(el: &ElementRef<'_>) -> ElementInfo {
    ElementInfo {
        text: element_text(el),
        visible: is_rendered(el),
    }
}

fn normalize_ws(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: &ElementRef<'_>) -> String {
    let inner = normalize_ws(&el.text().collect::<Vec<_>>().join(" "));
    if !inner.is_empty() {
        return inner;
    }
    ["value", "aria-label", "placeholder", "title"]
        .iter()
        .find_map(|attr| el.value().attr(attr))
        .map(normalize_ws)
        .unwrap_or_default()
}

fn hides_itself(el: &ElementRef<'_>) -> bool {
    let v = el.value();
    if v.attr("hidden").is_some() || v.attr(HIDDEN_MARKER_ATTR).is_some() {
        return true;
    }
    if v.attr("aria-hidden") == Some("true") {
        return true;
    }
    if v.name() == "input" && v.attr("type").is_some_and(|t| t.eq_ignore_ascii_case("hidden")) {
        return true;
    }
    if let Some(style) = v.attr("style") {
        let compact: String = style
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        if compact.contains("display:none") || compact.contains("visibility:hidden") {
            return true;
        }
    }
    false
}

fn is_non_rendered_tag(name: &str) -> bool {
    matches!(name, "script" | "style" | "noscript" | "template" | "head")
}

/// True unless the element or one of its ancestors is hidden.
fn is_rendered(el: &ElementRef<'_>) -> bool {
    if hides_itself(el) {
        return false;
    }
    !el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| hides_itself(&a) || is_non_rendered_tag(a.value().name()))
}

fn derive_visible_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut lines: Vec<String> = Vec::new();
    for node in doc.tree.root().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().filter_map(ElementRef::wrap).any(|a| {
            hides_itself(&a) || is_non_rendered_tag(a.value().name()) || a.value().name() == "title"
        });
        if hidden {
            continue;
        }
        let t = normalize_ws(text);
        if !t.is_empty() {
            lines.push(t);
        }
    }
    lines.join("\n")
}
