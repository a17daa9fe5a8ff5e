//! Template payloads and document composition
//!
//! A [`TemplatePayload`] is the opaque rendering job handed to a surface: the
//! composed document body, an optional companion stylesheet, the variable map,
//! and the dialect the loaded document speaks. Composition of control-plane
//! payloads into documents is shallow glue; the heavy lifting happens inside
//! the rendering surface.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Which template dialect the document speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TemplateDialect {
    /// Plain HTML template exposing the classic hook set.
    #[default]
    Classic,
    /// OGraf-packaged template driven through its manifest entry point.
    Ograf,
}

/// One rendering job. Immutable from the engine's view except for
/// [`variables`](Self::variables), which may be replaced while loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatePayload {
    /// Composed document body handed to the surface.
    pub body: String,

    /// Companion stylesheet, when the template ships one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stylesheet: Option<String>,

    /// Variable name → string value, replaceable while loaded.
    #[serde(default)]
    pub variables: HashMap<String, String>,

    /// Optional stable identifier, carried into the as-run log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    #[serde(default)]
    pub dialect: TemplateDialect,

    /// OGraf manifest, present only for [`TemplateDialect::Ograf`] payloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<serde_json::Value>,
}

impl TemplatePayload {
    /// Human-facing template name, when the payload carries one.
    ///
    /// OGraf manifests declare a `name`; classic templates have none.
    pub fn display_name(&self) -> Option<String> {
        self.manifest
            .as_ref()
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
            .map(|n| n.to_string())
    }
}

/// Composes control-plane `load` payloads into [`TemplatePayload`]s.
///
/// Keeps a byte-bounded memo of composed bodies so repeated loads of the same
/// template skip recomposition. The bound comes from the `cache_max_bytes`
/// configuration option.
pub struct Compositor {
    max_bytes: usize,
    cached_bytes: usize,
    memo: HashMap<u64, String>,
}

impl Compositor {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            cached_bytes: 0,
            memo: HashMap::new(),
        }
    }

    /// Build the payload for a `load` command.
    pub fn compose(
        &mut self,
        html: &str,
        css: Option<&str>,
        variables: HashMap<String, String>,
        template_id: Option<String>,
        dialect: TemplateDialect,
        manifest: Option<serde_json::Value>,
    ) -> TemplatePayload {
        let key = memo_key(html, css);
        let body = match self.memo.get(&key) {
            Some(body) => body.clone(),
            None => {
                let body = compose_document(html, css);
                if self.cached_bytes + body.len() <= self.max_bytes {
                    self.cached_bytes += body.len();
                    self.memo.insert(key, body.clone());
                }
                body
            }
        };

        TemplatePayload {
            body,
            stylesheet: css.map(|c| c.to_string()),
            variables,
            template_id,
            dialect,
            manifest,
        }
    }

    /// Build a solid test-signal payload for the `testSignal` command.
    pub fn test_signal(&self, pattern: &str, alpha: Option<f64>) -> TemplatePayload {
        let alpha = alpha.unwrap_or(1.0).clamp(0.0, 1.0);
        let body = format!(
            "<!DOCTYPE html><html><body class=\"test-signal\" \
             data-pattern=\"{pattern}\" data-alpha=\"{alpha}\"></body></html>"
        );
        TemplatePayload {
            body,
            stylesheet: None,
            variables: HashMap::new(),
            template_id: Some(format!("test-signal:{pattern}")),
            dialect: TemplateDialect::Classic,
            manifest: None,
        }
    }
}

fn compose_document(html: &str, css: Option<&str>) -> String {
    // Fragments get wrapped into a full document; complete documents pass
    // through with the stylesheet inlined ahead of </head> when present.
    let trimmed = html.trim_start();
    let is_document =
        trimmed.len() >= 2 && (trimmed[..2].eq_ignore_ascii_case("<!") || starts_with_html(trimmed));

    match (is_document, css) {
        (true, None) => html.to_string(),
        (true, Some(css)) => {
            let style = format!("<style>{css}</style>");
            if let Some(idx) = html.to_ascii_lowercase().find("</head>") {
                let mut out = String::with_capacity(html.len() + style.len());
                out.push_str(&html[..idx]);
                out.push_str(&style);
                out.push_str(&html[idx..]);
                out
            } else {
                format!("{style}{html}")
            }
        }
        (false, css) => {
            let style = css.map(|c| format!("<style>{c}</style>")).unwrap_or_default();
            format!("<!DOCTYPE html><html><head>{style}</head><body>{html}</body></html>")
        }
    }
}

fn starts_with_html(s: &str) -> bool {
    s.len() >= 5 && s[..5].eq_ignore_ascii_case("<html")
}

fn memo_key(html: &str, css: Option<&str>) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    html.hash(&mut hasher);
    css.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_is_wrapped_into_a_document() {
        let mut c = Compositor::new(0);
        let p = c.compose("<div>Hi</div>", None, HashMap::new(), None, TemplateDialect::Classic, None);
        assert!(p.body.starts_with("<!DOCTYPE html>"));
        assert!(p.body.contains("<div>Hi</div>"));
    }

    #[test]
    fn stylesheet_lands_before_closing_head() {
        let mut c = Compositor::new(0);
        let p = c.compose(
            "<html><head><title>t</title></head><body></body></html>",
            Some("body{margin:0}"),
            HashMap::new(),
            None,
            TemplateDialect::Classic,
            None,
        );
        let style = p.body.find("<style>").unwrap();
        let head = p.body.find("</head>").unwrap();
        assert!(style < head);
    }

    #[test]
    fn memo_respects_byte_ceiling() {
        let mut c = Compositor::new(16);
        c.compose("<p>abcdefghijklmnopqrstuvwxyz</p>", None, HashMap::new(), None, TemplateDialect::Classic, None);
        assert_eq!(c.cached_bytes, 0, "oversized body must not be retained");
    }

    #[test]
    fn display_name_comes_from_ograf_manifest() {
        let p = TemplatePayload {
            body: String::new(),
            stylesheet: None,
            variables: HashMap::new(),
            template_id: Some("lower-third".into()),
            dialect: TemplateDialect::Ograf,
            manifest: Some(serde_json::json!({ "name": "Lower Third" })),
        };
        assert_eq!(p.display_name().as_deref(), Some("Lower Third"));
    }
}
