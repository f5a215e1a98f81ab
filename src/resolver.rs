//! Element resolution - turns selector alternatives into a live element via JS.

use crate::config::{ClickableSettings, Selectors};
use crate::protocol::{ProtocolClient, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// How a selector string is interpreted, chosen by prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `aria/Submit` - accessible name, optionally `aria/Name[role="button"]`
    Aria,
    /// `xpath//html/body/div` - structural path
    XPath,
    /// `pierce/#id` - CSS through open shadow roots
    Pierce,
    /// `text/Sign in` - visible text
    Text,
    /// Anything else.
    Css,
}

impl Strategy {
    /// Split a selector into its strategy and value.
    pub fn parse(selector: &str) -> (Self, &str) {
        if let Some(v) = selector.strip_prefix("aria/") {
            return (Strategy::Aria, v);
        }
        if let Some(v) = selector.strip_prefix("xpath/") {
            return (Strategy::XPath, v);
        }
        if let Some(v) = selector.strip_prefix("pierce/") {
            return (Strategy::Pierce, v);
        }
        if let Some(v) = selector.strip_prefix("text/") {
            return (Strategy::Text, v);
        }
        (Strategy::Css, selector)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Aria => "aria",
            Strategy::XPath => "xpath",
            Strategy::Pierce => "pierce",
            Strategy::Text => "text",
            Strategy::Css => "css",
        }
    }
}

/// Bounding box in viewport coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// A resolved element.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementRef {
    /// The selector string that matched.
    pub matched_by: String,
    pub tag: String,
    /// CSS path of the element, for logs. Relative to its shadow root if it has one.
    pub path: String,
    /// Page-side tag (`data-pilot-ref`) that finds the element again, through shadow roots.
    pub handle: String,
    pub bbox: BBox,
    pub visible: bool,
    pub text: String,
}

/// Page-side answer from [`RESOLVE_JS`].
#[derive(Debug, Deserialize)]
struct Resolved {
    found: bool,
    #[serde(default)]
    selector: String,
    #[serde(default)]
    handle: String,
    #[serde(default)]
    tag: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    visible: bool,
    #[serde(default)]
    bbox: BBox,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no element matched {selectors} within {waited_ms}ms")]
    NotFound { selectors: String, waited_ms: u64 },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Options for one resolution.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Climb to the nearest clickable ancestor.
    pub clickable: bool,
    /// Only accept visible elements.
    pub visible: bool,
    pub timeout: Duration,
}

impl ResolveOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            clickable: false,
            visible: false,
            timeout,
        }
    }

    pub fn clickable(mut self) -> Self {
        self.clickable = true;
        self
    }

    pub fn visible(mut self) -> Self {
        self.visible = true;
        self
    }
}

/// Attribute that tags resolved elements so later page calls can find them.
pub const HANDLE_ATTR: &str = "data-pilot-ref";

/// Page function. Takes `{op, strategy, value, clickable}` and returns
/// `{found, selector, handle, tag, text, visible, bbox}`.
pub const RESOLVE_JS: &str = r#"
(args) => {
    const lc = s => (s || '').toLowerCase().trim();
    const none = { found: false, selector: '', tag: '', text: '', visible: false, bbox: {x:0,y:0,width:0,height:0} };

    function path(el) {
        if (el.id) return '#' + CSS.escape(el.id);
        const parts = [];
        let n = el;
        while (n && n.nodeType === 1) {
            let s = n.tagName.toLowerCase();
            if (n.id) { parts.unshift('#' + CSS.escape(n.id)); break; }
            const p = n.parentElement;
            if (p) {
                const sibs = [...p.children].filter(c => c.tagName === n.tagName);
                if (sibs.length > 1) s += ':nth-of-type(' + (sibs.indexOf(n) + 1) + ')';
            }
            parts.unshift(s);
            n = p;
        }
        return parts.join(' > ');
    }

    function handle(el) {
        let id = el.getAttribute('data-pilot-ref');
        if (!id) {
            window.__pilotRef = (window.__pilotRef || 0) + 1;
            id = String(window.__pilotRef);
            el.setAttribute('data-pilot-ref', id);
        }
        return id;
    }

    function text(el) {
        return el.innerText?.trim() || el.value || el.getAttribute('aria-label') || el.title || el.placeholder || '';
    }

    function visible(el) {
        const r = el.getBoundingClientRect();
        const s = getComputedStyle(el);
        return r.width > 0 && r.height > 0 && s.display !== 'none'
            && s.visibility !== 'hidden' && parseFloat(s.opacity) !== 0;
    }

    // Document order, shadow content right after its host.
    function allElements(root) {
        const out = [];
        const walk = node => {
            for (const el of node.querySelectorAll('*')) {
                out.push(el);
                if (el.shadowRoot) walk(el.shadowRoot);
            }
        };
        walk(root);
        return out;
    }

    const UNRENDERED = 'script,style,head,template,noscript,title';

    function rendered(el) {
        return !el.closest(UNRENDERED) && visible(el);
    }

    // First match in document order with no matching descendant.
    function innermost(matches) {
        return matches.find(el => !matches.some(o => o !== el && el.contains(o))) || null;
    }

    const IMPLICIT_ROLES = {
        a: 'link', button: 'button', select: 'combobox', textarea: 'textbox',
        input: 'textbox', img: 'img', h1: 'heading', h2: 'heading', h3: 'heading',
    };

    function roleOf(el) {
        return el.getAttribute('role') || IMPLICIT_ROLES[el.tagName.toLowerCase()] || '';
    }

    function explicitName(el) {
        const by = el.getAttribute('aria-labelledby');
        if (by) {
            const names = by.split(/\s+/).map(id => document.getElementById(id)?.innerText || '').join(' ');
            if (names.trim()) return names.trim();
        }
        return el.getAttribute('aria-label') || el.getAttribute('alt') || el.getAttribute('title')
            || (el.labels && el.labels[0]?.innerText) || el.getAttribute('placeholder') || '';
    }

    function find(strategy, value) {
        switch (strategy) {
            case 'css':
                return document.querySelector(value);
            case 'pierce': {
                const hit = document.querySelector(value);
                if (hit) return hit;
                for (const el of allElements(document)) {
                    if (el.shadowRoot) {
                        const inner = el.shadowRoot.querySelector(value);
                        if (inner) return inner;
                    }
                }
                return null;
            }
            case 'xpath':
                return document.evaluate(value, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue;
            case 'aria': {
                const m = value.match(/^(.*?)(?:\[role="([^"]+)"\])?$/);
                const name = lc(m[1]);
                const role = m[2];
                const pool = allElements(document).filter(el =>
                    !el.closest(UNRENDERED) && (!role || roleOf(el) === role || el.tagName.toLowerCase() === role));
                const named = pool.find(el => lc(explicitName(el)) === name);
                if (named) return named;
                const byText = pool.filter(el => lc(el.innerText) === name);
                return byText.find(el => roleOf(el)) || innermost(byText);
            }
            case 'text': {
                const want = lc(value);
                return innermost(allElements(document).filter(el => rendered(el) && lc(el.innerText).includes(want)));
            }
        }
        return null;
    }

    function clickable(el, opts) {
        const tag = el.tagName.toLowerCase();
        if (opts.tags.includes(tag)) return true;
        const role = el.getAttribute('role');
        if (role && opts.roles.includes(role)) return true;
        if (el.hasAttribute('onclick') || typeof el.onclick === 'function') return true;
        if (getComputedStyle(el).cursor === 'pointer') return true;
        const marks = lc((el.className && el.className.baseVal !== undefined ? el.className.baseVal : el.className) + ' '
            + [...el.attributes].filter(a => a.name.startsWith('data-')).map(a => a.name + ' ' + a.value).join(' '));
        return opts.keywords.some(k => marks.includes(lc(k)));
    }

    let el;
    try {
        el = find(args.strategy, args.value);
    } catch (e) {
        return none;
    }
    if (!el) return none;

    if (args.clickable) {
        let n = el;
        for (let depth = 0; n && n.nodeType === 1 && depth <= args.clickable.maxDepth; depth++) {
            if (clickable(n, args.clickable)) { el = n; break; }
            n = n.parentElement;
        }
    }

    const r = el.getBoundingClientRect();
    return {
        found: true,
        selector: path(el),
        handle: handle(el),
        tag: el.tagName.toLowerCase(),
        text: text(el).slice(0, 80),
        visible: visible(el),
        bbox: {x: r.x, y: r.y, width: r.width, height: r.height},
    };
}
"#;

/// Resolves selector alternatives against the page, polling until a match or timeout.
#[derive(Debug, Clone)]
pub struct Resolver {
    clickable: ClickableSettings,
    poll_interval: Duration,
}

impl Resolver {
    pub fn new(clickable: ClickableSettings, poll_interval: Duration) -> Self {
        Self {
            clickable,
            poll_interval,
        }
    }

    /// Resolve `selectors`, trying alternatives left to right and each
    /// alternative's selectors left to right. The first live match wins.
    pub async fn resolve(
        &self,
        client: &dyn ProtocolClient,
        session_id: &str,
        selectors: &Selectors,
        options: &ResolveOptions,
    ) -> Result<ElementRef, ResolveError> {
        let started = Instant::now();
        let deadline = started + options.timeout;
        let mut round = 0u32;
        loop {
            round += 1;
            if let Some(el) = self.round(client, session_id, selectors, options).await? {
                debug!(
                    "Resolved {} -> <{}> {} (round {})",
                    el.matched_by, el.tag, el.path, round
                );
                return Ok(el);
            }
            if Instant::now() + self.poll_interval > deadline {
                return Err(ResolveError::NotFound {
                    selectors: selectors.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Wait until one of `selectors` matches a visible element.
    pub async fn wait_visible(
        &self,
        client: &dyn ProtocolClient,
        session_id: &str,
        selectors: &Selectors,
        timeout: Duration,
    ) -> Result<ElementRef, ResolveError> {
        self.resolve(
            client,
            session_id,
            selectors,
            &ResolveOptions::new(timeout).visible(),
        )
        .await
    }

    /// One round without waiting. Used for presence conditions.
    pub async fn probe(
        &self,
        client: &dyn ProtocolClient,
        session_id: &str,
        selectors: &Selectors,
    ) -> Result<Option<ElementRef>, ProtocolError> {
        self.round(
            client,
            session_id,
            selectors,
            &ResolveOptions::new(Duration::ZERO),
        )
        .await
    }

    async fn round(
        &self,
        client: &dyn ProtocolClient,
        session_id: &str,
        selectors: &Selectors,
        options: &ResolveOptions,
    ) -> Result<Option<ElementRef>, ProtocolError> {
        for alternative in selectors.alternatives() {
            for selector in alternative {
                let (strategy, value) = Strategy::parse(selector);
                let args = json!({
                    "op": "resolve",
                    "selector": selector,
                    "strategy": strategy.as_str(),
                    "value": value,
                    "clickable": if options.clickable {
                        json!({
                            "tags": self.clickable.tags,
                            "roles": self.clickable.roles,
                            "keywords": self.clickable.keywords,
                            "maxDepth": self.clickable.max_depth,
                        })
                    } else {
                        serde_json::Value::Null
                    },
                });
                let value = client.call_function(session_id, RESOLVE_JS, &args).await?;
                let resolved: Resolved = serde_json::from_value(value)?;
                trace!("{} -> found={} visible={}", selector, resolved.found, resolved.visible);
                if resolved.found && (!options.visible || resolved.visible) {
                    return Ok(Some(ElementRef {
                        matched_by: selector.clone(),
                        tag: resolved.tag,
                        path: resolved.selector,
                        handle: resolved.handle,
                        bbox: resolved.bbox,
                        visible: resolved.visible,
                        text: resolved.text,
                    }));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prefixes() {
        assert_eq!(Strategy::parse("aria/Submit"), (Strategy::Aria, "Submit"));
        assert_eq!(
            Strategy::parse("xpath///*[@id=\"a\"]"),
            (Strategy::XPath, "//*[@id=\"a\"]")
        );
        assert_eq!(Strategy::parse("pierce/#inner"), (Strategy::Pierce, "#inner"));
        assert_eq!(Strategy::parse("text/Sign in"), (Strategy::Text, "Sign in"));
    }

    #[test]
    fn test_parse_defaults_to_css() {
        assert_eq!(Strategy::parse("#a > .b"), (Strategy::Css, "#a > .b"));
        assert_eq!(Strategy::parse("button"), (Strategy::Css, "button"));
        // Prefix must match exactly
        assert_eq!(Strategy::parse("aria:Submit"), (Strategy::Css, "aria:Submit"));
    }

    #[test]
    fn test_bbox_center() {
        let b = BBox {
            x: 10.0,
            y: 20.0,
            width: 100.0,
            height: 40.0,
        };
        assert_eq!(b.center(), (60.0, 40.0));
    }

    #[test]
    fn test_options_builder() {
        let o = ResolveOptions::new(Duration::from_secs(1)).clickable().visible();
        assert!(o.clickable);
        assert!(o.visible);
    }

    #[test]
    fn test_page_functions_share_handle_attr() {
        assert!(RESOLVE_JS.contains(HANDLE_ATTR));
        assert!(crate::runner::ACTION_JS.contains(HANDLE_ATTR));
    }

    #[test]
    fn test_text_matching_skips_unrendered() {
        assert!(RESOLVE_JS.contains("const UNRENDERED = 'script,style,head,template,noscript,title'"));
        let text_case = &RESOLVE_JS[RESOLVE_JS.find("case 'text'").unwrap()..];
        assert!(text_case.contains("innermost("));
        assert!(text_case.contains("rendered(el)"));
    }

    #[tokio::test]
    async fn test_resolve_carries_handle() {
        use crate::testing::{FakeBrowser, FakeElement};

        let fake = FakeBrowser::new();
        fake.add_element("pierce/#name", FakeElement::new("input", "#name"));
        fake.add_element("#ghost", FakeElement::new("div", "div#ghost").hidden());
        let sid = fake.attach("T1").await.unwrap();
        let resolver = Resolver::new(
            crate::config::Settings::default().clickable,
            Duration::from_millis(5),
        );

        let selectors = Selectors::single("pierce/#name");
        let el = resolver
            .resolve(&fake, &sid, &selectors, &ResolveOptions::new(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(el.path, "#name");
        assert_eq!(el.handle, "ref:#name");
        assert_eq!(el.matched_by, "pierce/#name");

        // hidden matches only count without the visible requirement
        let ghost = Selectors::single("#ghost");
        assert!(resolver.probe(&fake, &sid, &ghost).await.unwrap().is_some());
        let err = resolver
            .wait_visible(&fake, &sid, &ghost, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));
    }
}
