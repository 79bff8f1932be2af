//! WebRTC signaling types
//!
//! Candidate and state types shared between the transport and the reader,
//! plus parsing of the `Link` header that advertises ICE servers.

use serde::{Deserialize, Serialize};

use super::config::IceServer;

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string (`candidate:...`)
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Media kind of a transceiver or track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the connection can never recover
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// ICE connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }
}

impl std::fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IceConnectionState::New => write!(f, "new"),
            IceConnectionState::Checking => write!(f, "checking"),
            IceConnectionState::Connected => write!(f, "connected"),
            IceConnectionState::Completed => write!(f, "completed"),
            IceConnectionState::Disconnected => write!(f, "disconnected"),
            IceConnectionState::Failed => write!(f, "failed"),
            IceConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Parse ICE servers from `Link` header values
///
/// Every comma-separated entry of the form `<url>; rel="ice-server"` is
/// accepted, optionally followed by `username`, `credential` and
/// `credential-type="password"` parameters. Entries with another relation are
/// skipped.
pub fn parse_link_header<'a, I>(values: I) -> Vec<IceServer>
where
    I: IntoIterator<Item = &'a str>,
{
    values
        .into_iter()
        .flat_map(|value| split_unquoted(value, ','))
        .filter_map(parse_link_entry)
        .collect()
}

fn parse_link_entry(entry: &str) -> Option<IceServer> {
    let entry = entry.trim();
    let rest = entry.strip_prefix('<')?;
    let end = rest.find('>')?;
    let url = &rest[..end];

    let mut rel = None;
    let mut username = None;
    let mut credential = None;
    let mut credential_type = None;

    for param in split_unquoted(&rest[end + 1..], ';') {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = unquote(value.trim());
        match key.trim().to_ascii_lowercase().as_str() {
            "rel" => rel = Some(value),
            "username" => username = Some(value),
            "credential" => credential = Some(value),
            "credential-type" => credential_type = Some(value),
            _ => {}
        }
    }

    if !rel.is_some_and(|r| r.eq_ignore_ascii_case("ice-server")) {
        return None;
    }

    let server = IceServer::new(url);
    let password_type = credential_type.map_or(true, |t| t.eq_ignore_ascii_case("password"));
    match (username, credential) {
        (Some(username), Some(credential)) if password_type => {
            Some(server.with_password(username, credential))
        }
        _ => Some(server),
    }
}

/// Split on `sep` outside of quoted strings and `<...>` URL brackets
fn split_unquoted(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut escaped = false;

    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' if !in_angle => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            c if c == sep && !in_quotes && !in_angle => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);

    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

/// Unescape a quoted-string value
///
/// JSON escapes are tried first (servers commonly emit them); anything that
/// is not valid JSON falls back to plain backslash escapes.
fn unquote(value: &str) -> String {
    if !(value.len() >= 2 && value.starts_with('"') && value.ends_with('"')) {
        return value.to_string();
    }

    if let Ok(s) = serde_json::from_str::<String>(value) {
        return s;
    }

    let mut out = String::with_capacity(value.len());
    let mut chars = value[1..value.len() - 1].chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::config::IceCredentialType;

    #[test]
    fn test_link_without_credentials() {
        let servers = parse_link_header([r#"<turn:a>; rel="ice-server""#]);
        assert_eq!(servers, vec![IceServer::new("turn:a")]);
        assert!(servers[0].username.is_none());
        assert!(servers[0].credential.is_none());
    }

    #[test]
    fn test_link_with_credentials() {
        let servers = parse_link_header([
            r#"<turn:b>; rel="ice-server"; username="u"; credential="p"; credential-type="password""#,
        ]);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["turn:b".to_string()]);
        assert_eq!(servers[0].username.as_deref(), Some("u"));
        assert_eq!(servers[0].credential.as_deref(), Some("p"));
        assert_eq!(servers[0].credential_type, Some(IceCredentialType::Password));
    }

    #[test]
    fn test_link_multiple_entries_and_headers() {
        let servers = parse_link_header([
            r#"<stun:stun.l.google.com:19302>; rel="ice-server", <turn:t.example.com:3478?transport=udp>; rel="ice-server"; username="1700000000:user"; credential="x,y\"z"; credential-type="password""#,
            r#"<https://example.com/other>; rel="alternate""#,
        ]);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls[0], "stun:stun.l.google.com:19302");
        assert_eq!(servers[1].urls[0], "turn:t.example.com:3478?transport=udp");
        assert_eq!(servers[1].username.as_deref(), Some("1700000000:user"));
        assert_eq!(servers[1].credential.as_deref(), Some("x,y\"z"));
    }

    #[test]
    fn test_link_unicode_escape() {
        let servers = parse_link_header([
            r#"<turn:c>; rel="ice-server"; username="\u0041"; credential="p"; credential-type="password""#,
        ]);
        assert_eq!(servers[0].username.as_deref(), Some("A"));
    }

    #[test]
    fn test_link_empty() {
        assert!(parse_link_header(Vec::<&str>::new()).is_empty());
        assert!(parse_link_header(["garbage"]).is_empty());
    }

    #[test]
    fn test_state_helpers() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
        assert!(IceConnectionState::Completed.is_connected());
        assert!(!IceConnectionState::Checking.is_connected());
    }
}
