//! Subscription format parsers and forward-line helpers.
//!
//! A fetched body is handed to the first [`SubscriptionFormat`] that claims
//! it, in [`SubscriptionFormat::PRIORITY`] order.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use super::link::{
    decode_base64_text, extract_host_port, is_base64_alphabet, normalize_link, scalar_text,
    SS_SCHEME, VMESS_SCHEME,
};
use super::model::{FetchedContent, ForwardNode, Proxy, FORWARD_PREFIX};

/// Shadowsocks ciphers glider can actually dial.
const SUPPORTED_SS_CIPHERS: &[&str] = &[
    "aes-128-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "aes-128-ctr",
    "aes-192-ctr",
    "aes-256-ctr",
    "aes-128-cfb",
    "aes-192-cfb",
    "aes-256-cfb",
    "chacha20-ietf",
    "xchacha20-ietf-poly1305",
];

/// Known subscription body formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionFormat {
    /// Clash-style YAML with a top-level `proxies:` list.
    ClashYaml,
    /// One link per line, optionally wrapped in a single base64 blob.
    PlainText,
}

impl SubscriptionFormat {
    /// Order in which formats are offered content.
    pub const PRIORITY: [SubscriptionFormat; 2] = [Self::ClashYaml, Self::PlainText];

    pub fn name(self) -> &'static str {
        match self {
            Self::ClashYaml => "clash-yaml",
            Self::PlainText => "plain-text",
        }
    }

    /// First format in priority order that claims `content`.
    pub fn detect(content: &FetchedContent) -> Option<Self> {
        Self::PRIORITY.into_iter().find(|f| f.claims(content))
    }

    pub fn claims(self, content: &FetchedContent) -> bool {
        let content_type = content
            .content_type
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let starts_with_proxies = first_non_empty_line(&content.text).starts_with("proxies:");
        match self {
            Self::ClashYaml => {
                content_type.contains("yaml") || content_type.contains("yml") || starts_with_proxies
            }
            Self::PlainText => !content_type.contains("yaml") && !starts_with_proxies,
        }
    }

    pub fn parse(self, content: &FetchedContent) -> Result<Vec<ForwardNode>> {
        match self {
            Self::ClashYaml => parse_clash_yaml(&content.text),
            Self::PlainText => Ok(parse_plain_text(&content.text)),
        }
    }
}

impl std::fmt::Display for SubscriptionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn first_non_empty_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
}

// ── Plain text ──────────────────────────────────────────────────

/// Parse a plain link list. Falls back to treating the whole body as one
/// base64 blob when no links are found in the raw text.
pub fn parse_plain_text(text: &str) -> Vec<ForwardNode> {
    let forwards = extract_links(text);
    if !forwards.is_empty() {
        return forwards;
    }
    match decode_link_blob(text) {
        Some(decoded) => {
            debug!("subscription body decoded as base64 blob");
            extract_links(&decoded)
        }
        None => Vec::new(),
    }
}

/// Decode `text` as a single base64 blob, but only when the result holds links.
fn decode_link_blob(text: &str) -> Option<String> {
    let compact: String = text.split_whitespace().collect();
    if !is_base64_alphabet(&compact) {
        return None;
    }
    decode_base64_text(&compact)
        .filter(|decoded| decoded.contains(SS_SCHEME) || decoded.contains(VMESS_SCHEME))
}

fn extract_links(text: &str) -> Vec<ForwardNode> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(normalize_link)
        .map(|link| ForwardNode::from_link(&link))
        .collect()
}

// ── Clash YAML ──────────────────────────────────────────────────

/// Parse a Clash `proxies:` list. ss nodes come first, then vmess nodes,
/// each group in document order. Unsupported types and ciphers are skipped.
pub fn parse_clash_yaml(text: &str) -> Result<Vec<ForwardNode>> {
    let doc: serde_yml::Value =
        serde_yml::from_str(text).context("invalid Clash YAML document")?;
    let Some(nodes) = doc.get("proxies").and_then(serde_yml::Value::as_sequence) else {
        return Ok(Vec::new());
    };

    let mut ss = Vec::new();
    let mut vmess = Vec::new();
    for node in nodes {
        let text_of = |key: &str| node.get(key).and_then(scalar_text);
        match text_of("type").as_deref() {
            Some("ss") => {
                let Some(cipher) = text_of("cipher") else {
                    continue;
                };
                if !SUPPORTED_SS_CIPHERS.contains(&cipher.as_str()) {
                    debug!("skipping ss node with unsupported cipher {cipher}");
                    continue;
                }
                let password = text_of("password").unwrap_or_default();
                let server = text_of("server").unwrap_or_default();
                let port = text_of("port").unwrap_or_default();
                let mut link = format!("{SS_SCHEME}{cipher}:{password}@{server}:{port}");
                if let Some(name) = text_of("name").filter(|n| !n.is_empty()) {
                    link.push('#');
                    link.push_str(&name);
                }
                ss.push(ForwardNode::from_link(&link));
            }
            Some("vmess") => {
                let uuid = text_of("uuid").unwrap_or_default();
                let server = text_of("server").unwrap_or_default();
                let port = text_of("port").unwrap_or_default();
                let alter_id = text_of("alterId").unwrap_or_else(|| "0".to_string());
                vmess.push(ForwardNode::from_link(&format!(
                    "{VMESS_SCHEME}none:{uuid}@{server}:{port}?alterID={alter_id}"
                )));
            }
            _ => {}
        }
    }
    ss.extend(vmess);
    Ok(ss)
}

// ── Forward lines ↔ pool entries ────────────────────────────────

/// Turn `forward=` lines into pool entries.
///
/// Only `forward=(ss|vmess)://<uri>[#label]` lines are accepted; the uri may
/// not contain whitespace or `#`.
pub fn parse_forwards<I, S>(lines: I) -> Vec<Proxy>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter_map(|line| parse_forward_line(line.as_ref()))
        .collect()
}

fn parse_forward_line(line: &str) -> Option<Proxy> {
    let body = line.trim().strip_prefix(FORWARD_PREFIX)?;
    let (uri, label) = match body.split_once('#') {
        Some((uri, label)) => (uri, Some(label)),
        None => (body, None),
    };
    let scheme = if uri.starts_with(SS_SCHEME) {
        "ss"
    } else if uri.starts_with(VMESS_SCHEME) {
        "vmess"
    } else {
        return None;
    };
    let after_scheme = &uri[scheme.len() + 3..];
    if after_scheme.is_empty() || uri.chars().any(char::is_whitespace) {
        return None;
    }
    let (host, port) = extract_host_port(uri);
    let label = label.filter(|l| !l.is_empty()).map(str::to_string);
    Some(Proxy::new(uri, scheme, host, port, label))
}

/// Render a pool entry back into its `forward=` line.
pub fn format_forward_line(proxy: &Proxy) -> String {
    match proxy.label.as_deref().filter(|l| !l.is_empty()) {
        Some(label) => format!("{FORWARD_PREFIX}{}#{label}", proxy.uri),
        None => format!("{FORWARD_PREFIX}{}", proxy.uri),
    }
}

/// Read the forward lines of an existing glider config. A missing file yields nothing.
pub fn load_proxies_from_config(path: &Path) -> Result<Vec<Proxy>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read glider config {}", path.display()))?;
    Ok(parse_forwards(text.lines()))
}
