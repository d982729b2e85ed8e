//! Email template rendering.
//!
//! Templates use `{{ variable }}` placeholders. Values are HTML-escaped in the
//! HTML body only; subject and text bodies receive them verbatim. In the HTML
//! body a value that starts a URL attribute (`href`, `src`, ...) must also use
//! an allowed scheme, otherwise it is replaced by [`BLOCKED_URL`]. A variable
//! with no supplied value renders as the empty string. The only failure is
//! malformed syntax: an unclosed `{{` or a placeholder that is not an
//! identifier.
//!
//! Lookup goes through a [`TemplateChain`] of [`TemplateSource`]s tried in
//! order, so a broken stored template degrades to the built-in one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{GatekeeperError, Result};
use crate::models::{EmailTemplate, TemplateVariable};

/// Variable values supplied at render time.
pub type Variables = HashMap<String, String>;

pub const PASSWORD_RESET_TEMPLATE: &str = "password_reset";
pub const WELCOME_TEMPLATE: &str = "welcome";

/// Raw template bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateContent {
    pub subject: String,
    pub html: String,
    pub text: String,
}

impl From<&EmailTemplate> for TemplateContent {
    fn from(template: &EmailTemplate) -> Self {
        Self {
            subject: template.subject.clone(),
            html: template.html_content.clone(),
            text: template.text_content.clone(),
        }
    }
}

/// A fully rendered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Variable(&'a str),
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse(source: &str) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut rest = source;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Literal(&rest[..start]));
        }
        let after_open = &rest[start + 2..];
        let end = after_open.find("}}").ok_or_else(|| {
            GatekeeperError::Template(format!("unclosed '{{{{' at position {}", offset + start))
        })?;

        let name = after_open[..end].trim();
        if !is_identifier(name) {
            return Err(GatekeeperError::Template(format!(
                "invalid placeholder '{{{{{}}}}}' at position {}",
                &after_open[..end],
                offset + start
            )));
        }
        segments.push(Segment::Variable(name));

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

/// Escape text for inclusion in HTML element content or attribute values.
pub fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn render_part(source: &str, variables: &Variables, html: bool) -> Result<String> {
    let mut output = String::with_capacity(source.len());
    let mut context = HtmlState::Text { after_lt: false };

    for segment in parse(source)? {
        match segment {
            Segment::Literal(text) => {
                if html {
                    context.advance(text);
                }
                output.push_str(text);
            }
            Segment::Variable(name) => {
                let value = variables.get(name).map(String::as_str).unwrap_or("");
                if !html {
                    output.push_str(value);
                    continue;
                }

                let value = match context.url_prefix() {
                    Some(prefix) if !is_safe_url(&format!("{}{}", prefix, value)) => {
                        tracing::warn!(variable = name, "Unsafe URL replaced in rendered template");
                        BLOCKED_URL
                    }
                    _ => value,
                };
                let escaped = escape_html(value);
                context.advance(&escaped);
                output.push_str(&escaped);
            }
        }
    }
    Ok(output)
}

// ========== URL attribute context ==========

/// Substituted for a value that would give a URL attribute a disallowed scheme.
pub const BLOCKED_URL: &str = "#blocked";

const URL_ATTRIBUTES: [&str; 9] = [
    "action",
    "background",
    "cite",
    "formaction",
    "href",
    "poster",
    "src",
    "srcset",
    "xlink:href",
];

const SAFE_URL_SCHEMES: [&str; 3] = ["http", "https", "mailto"];

/// Position within HTML markup, tracked over the rendered output so far.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HtmlState {
    Text { after_lt: bool },
    Tag,
    AttrName(String),
    AfterAttrName(String),
    BeforeValue(String),
    Value {
        quote: Option<char>,
        url: bool,
        so_far: String,
    },
}

impl HtmlState {
    fn advance(&mut self, text: &str) {
        for c in text.chars() {
            self.step(c);
        }
    }

    fn step(&mut self, c: char) {
        let closed = HtmlState::Text { after_lt: false };
        let next = match std::mem::replace(self, HtmlState::Tag) {
            HtmlState::Text { after_lt } => {
                if after_lt && (c.is_ascii_alphabetic() || c == '/') {
                    HtmlState::Tag
                } else {
                    HtmlState::Text { after_lt: c == '<' }
                }
            }
            HtmlState::Tag => match c {
                '>' => closed,
                c if c.is_whitespace() || c == '/' => HtmlState::Tag,
                c => HtmlState::AttrName(c.to_ascii_lowercase().to_string()),
            },
            HtmlState::AttrName(mut name) => match c {
                '=' => HtmlState::BeforeValue(name),
                '>' => closed,
                '/' => HtmlState::Tag,
                c if c.is_whitespace() => HtmlState::AfterAttrName(name),
                c => {
                    name.push(c.to_ascii_lowercase());
                    HtmlState::AttrName(name)
                }
            },
            HtmlState::AfterAttrName(name) => match c {
                '=' => HtmlState::BeforeValue(name),
                '>' => closed,
                '/' => HtmlState::Tag,
                c if c.is_whitespace() => HtmlState::AfterAttrName(name),
                c => HtmlState::AttrName(c.to_ascii_lowercase().to_string()),
            },
            HtmlState::BeforeValue(name) => {
                let url = URL_ATTRIBUTES.contains(&name.as_str());
                match c {
                    '"' | '\'' => HtmlState::Value {
                        quote: Some(c),
                        url,
                        so_far: String::new(),
                    },
                    '>' => closed,
                    c if c.is_whitespace() => HtmlState::BeforeValue(name),
                    c => HtmlState::Value {
                        quote: None,
                        url,
                        so_far: c.to_string(),
                    },
                }
            }
            HtmlState::Value {
                quote,
                url,
                mut so_far,
            } => match (quote, c) {
                (Some(q), c) if c == q => HtmlState::Tag,
                (None, '>') => closed,
                (None, c) if c.is_whitespace() => HtmlState::Tag,
                (_, c) => {
                    so_far.push(c);
                    HtmlState::Value { quote, url, so_far }
                }
            },
        };
        *self = next;
    }

    /// The URL attribute value written so far, while a placeholder here can
    /// still decide the scheme.
    fn url_prefix(&self) -> Option<&str> {
        match self {
            HtmlState::BeforeValue(name) if URL_ATTRIBUTES.contains(&name.as_str()) => Some(""),
            HtmlState::Value {
                url: true, so_far, ..
            } if !so_far.contains(|c: char| matches!(c, ':' | '/' | '?' | '#')) => {
                Some(so_far.as_str())
            }
            _ => None,
        }
    }
}

/// Relative URLs and the allowed schemes pass. Browsers ignore whitespace and
/// control characters inside a scheme, so they are dropped before the check.
fn is_safe_url(url: &str) -> bool {
    let cleaned: String = url
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect();

    match cleaned.find(|c: char| matches!(c, ':' | '/' | '?' | '#')) {
        Some(i) if cleaned[i..].starts_with(':') => {
            let scheme = cleaned[..i].to_ascii_lowercase();
            SAFE_URL_SCHEMES.contains(&scheme.as_str())
        }
        _ => true,
    }
}

/// Render all three parts of a template.
pub fn render(template: &TemplateContent, variables: &Variables) -> Result<RenderedEmail> {
    Ok(RenderedEmail {
        subject: render_part(&template.subject, variables, false)?,
        html: render_part(&template.html, variables, true)?,
        text: render_part(&template.text, variables, false)?,
    })
}

/// Check that subject, HTML and text all parse by rendering them with
/// placeholder values. The output is discarded.
pub fn validate(
    subject: &str,
    html: &str,
    text: &str,
    sample_variables: &[TemplateVariable],
) -> Result<()> {
    let variables: Variables = sample_variables
        .iter()
        .map(|v| (v.name.clone(), format!("sample {}", v.name)))
        .collect();

    for (part, source) in [("subject", subject), ("html", html), ("text", text)] {
        render_part(source, &variables, part == "html").map_err(|e| match e {
            GatekeeperError::Template(msg) => {
                GatekeeperError::Validation(format!("invalid {} template: {}", part, msg))
            }
            other => other,
        })?;
    }
    Ok(())
}

// ========== Template sources ==========

/// Somewhere templates can be looked up by name.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// Short label for logs.
    fn label(&self) -> &'static str;

    /// `Ok(None)` when this source has no template with that name.
    async fn load(&self, name: &str) -> Result<Option<TemplateContent>>;
}

/// Templates compiled into the binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTemplateSource;

impl BuiltinTemplateSource {
    pub fn get(name: &str) -> Option<TemplateContent> {
        match name {
            PASSWORD_RESET_TEMPLATE => Some(TemplateContent {
                subject: "Reset your password".to_string(),
                html: concat!(
                    "<p>Hello {{ name }},</p>\n",
                    "<p>We received a request to reset your password. ",
                    "<a href=\"{{ reset_link }}\">Choose a new password</a>.</p>\n",
                    "<p>This link expires in {{ expires_minutes }} minutes. ",
                    "If you did not ask for a reset you can ignore this email.</p>\n"
                )
                .to_string(),
                text: concat!(
                    "Hello {{ name }},\n\n",
                    "We received a request to reset your password. ",
                    "Open this link to choose a new one:\n{{ reset_link }}\n\n",
                    "This link expires in {{ expires_minutes }} minutes. ",
                    "If you did not ask for a reset you can ignore this email.\n"
                )
                .to_string(),
            }),
            WELCOME_TEMPLATE => Some(TemplateContent {
                subject: "Welcome, {{ name }}".to_string(),
                html: concat!(
                    "<p>Hello {{ name }},</p>\n",
                    "<p>Your account is ready. ",
                    "<a href=\"{{ app_url }}\">Sign in</a> to get started.</p>\n"
                )
                .to_string(),
                text: concat!(
                    "Hello {{ name }},\n\n",
                    "Your account is ready. Sign in at {{ app_url }} to get started.\n"
                )
                .to_string(),
            }),
            _ => None,
        }
    }
}

#[async_trait]
impl TemplateSource for BuiltinTemplateSource {
    fn label(&self) -> &'static str {
        "builtin"
    }

    async fn load(&self, name: &str) -> Result<Option<TemplateContent>> {
        Ok(Self::get(name))
    }
}

/// Ordered list of sources. The first one that both finds and successfully
/// renders a template wins.
#[derive(Clone, Default)]
pub struct TemplateChain {
    sources: Vec<Arc<dyn TemplateSource>>,
}

impl TemplateChain {
    pub fn new(sources: Vec<Arc<dyn TemplateSource>>) -> Self {
        Self { sources }
    }

    pub async fn render(&self, name: &str, variables: &Variables) -> Result<RenderedEmail> {
        for source in &self.sources {
            match source.load(name).await {
                Ok(Some(template)) => match render(&template, variables) {
                    Ok(rendered) => return Ok(rendered),
                    Err(e) => tracing::warn!(
                        template = %name,
                        source = source.label(),
                        error = %e,
                        "Template failed to render, trying next source"
                    ),
                },
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    template = %name,
                    source = source.label(),
                    error = %e,
                    "Template lookup failed, trying next source"
                ),
            }
        }

        Err(GatekeeperError::NotFound(format!(
            "no usable template named '{}'",
            name
        )))
    }
}
