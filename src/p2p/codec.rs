//! Signed request codec — WSSE UsernameToken framing for the P2P cloud.
//!
//! Every datagram we send to the discovery service or a device relay is an
//! HTTP/1.1-framed text message carrying a WSSE header. Replies come back
//! framed the same way, with an XML-ish body. This module is pure: no
//! sockets, no clocks, no randomness. Callers supply the nonce and the
//! creation timestamp so signing is deterministic.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::fmt::Write as _;
use thiserror::Error;
use zeroize::Zeroize;

/// Realm string the vendor mixes into the password digest.
const DIGEST_REALM: &str = "DHP2P";

/// Maximum element nesting accepted in a reply body.
const MAX_DEPTH: usize = 32;

// ── Errors ──────────────────────────────────────────────────────────

/// The outbound request could not be canonicalized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("request path is empty")]
    EmptyPath,
    #[error("request path must start with '/': {0:?}")]
    RelativePath(String),
    #[error("request path contains a forbidden byte at offset {0}")]
    ForbiddenByte(usize),
    #[error("username cannot be quoted in a WSSE header")]
    BadUsername,
}

/// A reply was received but its bytes do not form a valid message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("reply is empty")]
    Empty,
    #[error("reply is not valid UTF-8")]
    NotUtf8,
    #[error("reply is truncated: {0}")]
    Truncated(&'static str),
    #[error("malformed status line: {0:?}")]
    StatusLine(String),
    #[error("malformed header line: {0:?}")]
    Header(String),
    #[error("content-length {declared} does not match body length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("malformed body markup: {0}")]
    Markup(String),
    #[error("reply carries no info record")]
    MissingRecord,
}

// ── Credentials ─────────────────────────────────────────────────────

/// Shared-secret material for the WSSE digest. The key is wiped on drop.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    key: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, key: impl Into<String>) -> Self {
        Self { username: username.into(), key: key.into() }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

// ── Outbound ────────────────────────────────────────────────────────

/// A request before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub path: String,
    pub body: Option<String>,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self { path: path.into(), body: None }
    }
}

/// Inputs that vary per message. Fixed inputs produce identical bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignContext {
    /// Unix seconds.
    pub created: i64,
    pub nonce: u32,
    pub cseq: u32,
}

impl SignContext {
    /// Fresh context for "now" with a random nonce.
    pub fn now(cseq: u32) -> Self {
        Self {
            created: chrono::Utc::now().timestamp(),
            nonce: rand::random(),
            cseq,
        }
    }
}

/// `base64(sha1(nonce ‖ created ‖ "DHP2P:" ‖ username ‖ ":" ‖ key))`
pub fn password_digest(creds: &Credentials, nonce: u32, created: i64) -> String {
    let mut material = format!(
        "{}{}{}:{}:{}",
        nonce, created, DIGEST_REALM, creds.username, creds.key
    );
    let hash = Sha1::digest(material.as_bytes());
    material.zeroize();
    BASE64.encode(hash)
}

/// Frame and sign a request into the bytes of one datagram.
pub fn sign(req: &Request, creds: &Credentials, ctx: SignContext) -> Result<Vec<u8>, EncodingError> {
    check_path(&req.path)?;
    if creds.username.is_empty()
        || creds.username.bytes().any(|b| b == b'"' || b == b'\\' || !(0x20..0x7f).contains(&b))
    {
        return Err(EncodingError::BadUsername);
    }

    let method = if req.body.is_some() { "DHPOST" } else { "DHGET" };
    let digest = password_digest(creds, ctx.nonce, ctx.created);

    let mut out = String::with_capacity(256);
    // Writing into a String cannot fail.
    let _ = write!(out, "{} {} HTTP/1.1\r\n", method, req.path);
    let _ = write!(out, "CSeq: {}\r\n", ctx.cseq);
    out.push_str("Authorization: WSSE profile=\"UsernameToken\"\r\n");
    let _ = write!(
        out,
        "X-WSSE: UsernameToken Username=\"{}\", PasswordDigest=\"{}\", Nonce=\"{}\", Created=\"{}\"\r\n",
        creds.username, digest, ctx.nonce, ctx.created
    );
    match &req.body {
        Some(body) => {
            out.push_str("Content-Type: application/xml\r\n");
            let _ = write!(out, "Content-Length: {}\r\n\r\n", body.len());
            out.push_str(body);
        }
        None => out.push_str("\r\n"),
    }
    Ok(out.into_bytes())
}

fn check_path(path: &str) -> Result<(), EncodingError> {
    if path.is_empty() {
        return Err(EncodingError::EmptyPath);
    }
    if !path.starts_with('/') {
        return Err(EncodingError::RelativePath(path.to_string()));
    }
    match path.bytes().position(|b| !(0x21..0x7f).contains(&b)) {
        Some(offset) => Err(EncodingError::ForbiddenByte(offset)),
        None => Ok(()),
    }
}

// ── Inbound ─────────────────────────────────────────────────────────

/// One element of a reply body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub text: String,
    pub children: Vec<Node>,
}

impl Node {
    /// First direct child with this name.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Walk a `/`-separated path of child names starting below `self`.
    pub fn find(&self, path: &str) -> Option<&Node> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(self, |node, name| node.child(name))
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.children.is_empty()
    }
}

/// A verified reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    /// Root element of the body, if the body was non-empty.
    pub body: Option<Node>,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_error(&self) -> bool {
        self.code >= 400
    }

    /// The info record a device reply must carry to count as alive.
    pub fn info_record(&self) -> Result<&Node, FormatError> {
        match &self.body {
            Some(node) if !node.is_empty() => Ok(node),
            _ => Err(FormatError::MissingRecord),
        }
    }
}

/// Parse the raw bytes of one reply datagram.
pub fn verify(raw: &[u8]) -> Result<Reply, FormatError> {
    if raw.is_empty() {
        return Err(FormatError::Empty);
    }
    let text = std::str::from_utf8(raw).map_err(|_| FormatError::NotUtf8)?;

    let (head, body) = match text.find("\r\n\r\n") {
        Some(idx) => (&text[..idx], &text[idx + 4..]),
        None => match text.find("\n\n") {
            Some(idx) => (&text[..idx], &text[idx + 2..]),
            None => return Err(FormatError::Truncated("missing header terminator")),
        },
    };

    let mut lines = head.lines();
    let status = lines.next().ok_or(FormatError::Truncated("missing status line"))?;
    let (code, reason) = parse_status_line(status)?;

    let mut headers = Vec::new();
    for line in lines {
        let (k, v) = line
            .split_once(':')
            .ok_or_else(|| FormatError::Header(line.to_string()))?;
        let k = k.trim();
        if k.is_empty() {
            return Err(FormatError::Header(line.to_string()));
        }
        headers.push((k.to_string(), v.trim().to_string()));
    }

    let mut reply = Reply { code, reason, headers, body: None };

    if let Some(declared) = reply.header("Content-Length") {
        let declared: usize = declared
            .parse()
            .map_err(|_| FormatError::Header(format!("Content-Length: {}", declared)))?;
        if declared != body.len() {
            return Err(FormatError::LengthMismatch { declared, actual: body.len() });
        }
    }

    if !body.trim().is_empty() {
        reply.body = Some(parse_markup(body)?);
    }
    Ok(reply)
}

fn parse_status_line(line: &str) -> Result<(u16, String), FormatError> {
    let bad = || FormatError::StatusLine(line.to_string());
    let mut parts = line.trim().splitn(3, ' ');
    let version = parts.next().ok_or_else(bad)?;
    if !version.starts_with("HTTP/") {
        return Err(bad());
    }
    let code: u16 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if !(100..1000).contains(&code) {
        return Err(bad());
    }
    Ok((code, parts.next().unwrap_or("").trim().to_string()))
}

// ── Body markup ─────────────────────────────────────────────────────

/// Parse a small XML document into a `Node` tree.
///
/// Supports the subset the cloud emits: an optional `<?xml ..?>` prolog,
/// comments, nested elements, attributes (ignored), self-closing tags and
/// the five predefined entities.
fn parse_markup(src: &str) -> Result<Node, FormatError> {
    let mut p = Markup { src, pos: 0 };
    p.skip_misc()?;
    let root = p.element(0)?;
    p.skip_misc()?;
    if p.pos != src.len() {
        return Err(FormatError::Markup(format!("trailing content at offset {}", p.pos)));
    }
    Ok(root)
}

struct Markup<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Markup<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn err(&self, what: &str) -> FormatError {
        FormatError::Markup(format!("{} at offset {}", what, self.pos))
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    /// Skip whitespace, prolog and comments.
    fn skip_misc(&mut self) -> Result<(), FormatError> {
        loop {
            self.skip_ws();
            if self.rest().starts_with("<?") {
                let end = self.rest().find("?>").ok_or_else(|| self.err("unterminated prolog"))?;
                self.pos += end + 2;
            } else if self.rest().starts_with("<!--") {
                let end = self.rest().find("-->").ok_or_else(|| self.err("unterminated comment"))?;
                self.pos += end + 3;
            } else {
                return Ok(());
            }
        }
    }

    fn element(&mut self, depth: usize) -> Result<Node, FormatError> {
        if depth >= MAX_DEPTH {
            return Err(self.err("nesting too deep"));
        }
        if !self.rest().starts_with('<') {
            return Err(self.err("expected element"));
        }
        let close = self.rest().find('>').ok_or_else(|| self.err("unterminated tag"))?;
        let tag = &self.rest()[1..close];
        self.pos += close + 1;

        let self_closing = tag.ends_with('/');
        let tag = tag.trim_end_matches('/');
        let name = tag.split_whitespace().next().unwrap_or("");
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || "_-.:".contains(c)) {
            return Err(self.err("invalid element name"));
        }

        let mut node = Node { name: name.to_string(), ..Node::default() };
        if self_closing {
            return Ok(node);
        }

        loop {
            let next = self.rest().find('<').ok_or_else(|| self.err("unclosed element"))?;
            node.text.push_str(&unescape(&self.rest()[..next]).map_err(|e| self.err(&e))?);
            self.pos += next;

            if self.rest().starts_with("<!--") {
                self.skip_misc()?;
            } else if self.rest().starts_with("</") {
                let end = self.rest().find('>').ok_or_else(|| self.err("unterminated close tag"))?;
                let closing = self.rest()[2..end].trim();
                if closing != node.name {
                    return Err(self.err(&format!("</{}> closes <{}>", closing, node.name)));
                }
                self.pos += end + 1;
                node.text = node.text.trim().to_string();
                return Ok(node);
            } else {
                let child = self.element(depth + 1)?;
                node.children.push(child);
            }
        }
    }
}

fn unescape(raw: &str) -> Result<String, String> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let end = rest.find(';').ok_or("unterminated entity")?;
        out.push(match &rest[1..end] {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            other => return Err(format!("unknown entity &{};", other)),
        });
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new("P2PClient", "secret-key")
    }

    fn ctx() -> SignContext {
        SignContext { created: 1_700_000_000, nonce: 42, cseq: 1 }
    }

    #[test]
    fn test_sign_is_deterministic() {
        let req = Request::get("/online/p2psrv/ABC123");
        let a = sign(&req, &creds(), ctx()).unwrap();
        let b = sign(&req, &creds(), ctx()).unwrap();
        assert_eq!(a, b);

        let other = sign(&req, &creds(), SignContext { nonce: 43, ..ctx() }).unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_sign_frames_wsse_headers() {
        let bytes = sign(&Request::get("/info/device/ABC123"), &creds(), ctx()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("DHGET /info/device/ABC123 HTTP/1.1\r\n"));
        assert!(text.contains("CSeq: 1\r\n"));
        assert!(text.contains("Authorization: WSSE profile=\"UsernameToken\"\r\n"));
        assert!(text.contains("Username=\"P2PClient\""));
        assert!(text.contains("Nonce=\"42\", Created=\"1700000000\""));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_password_digest_matches_manual_computation() {
        let expected = BASE64.encode(Sha1::digest(b"421700000000DHP2P:P2PClient:secret-key"));
        assert_eq!(password_digest(&creds(), 42, 1_700_000_000), expected);
        // Secret material changes the digest.
        let other = Credentials::new("P2PClient", "other");
        assert_ne!(password_digest(&other, 42, 1_700_000_000), expected);
    }

    #[test]
    fn test_sign_with_body_uses_post_and_length() {
        let req = Request { path: "/probe/p2psrv".into(), body: Some("<body/>".into()) };
        let text = String::from_utf8(sign(&req, &creds(), ctx()).unwrap()).unwrap();
        assert!(text.starts_with("DHPOST "));
        assert!(text.contains("Content-Length: 7\r\n\r\n<body/>"));
    }

    #[test]
    fn test_sign_rejects_bad_paths() {
        let c = creds();
        assert_eq!(sign(&Request::get(""), &c, ctx()), Err(EncodingError::EmptyPath));
        assert!(matches!(sign(&Request::get("info"), &c, ctx()), Err(EncodingError::RelativePath(_))));
        assert_eq!(
            sign(&Request::get("/info/device/AB C"), &c, ctx()),
            Err(EncodingError::ForbiddenByte(15))
        );
        assert!(sign(&Request::get("/info/\r\nX: y"), &c, ctx()).is_err());
        assert!(sign(&Request::get("/info/é"), &c, ctx()).is_err());
    }

    #[test]
    fn test_sign_rejects_unquotable_username() {
        let c = Credentials::new("bad\"name", "k");
        assert_eq!(sign(&Request::get("/x"), &c, ctx()), Err(EncodingError::BadUsername));
    }

    #[test]
    fn test_credentials_debug_redacts_key() {
        let shown = format!("{:?}", creds());
        assert!(!shown.contains("secret-key"));
    }

    #[test]
    fn test_verify_parses_reply_tree() {
        let raw = b"HTTP/1.1 200 OK\r\nCSeq: 1\r\n\r\n<?xml version=\"1.0\"?><body><US>10.0.0.5:8801</US><Info a=\"1\"><Name>dvr &amp; co</Name></Info></body>";
        let reply = verify(raw).unwrap();
        assert_eq!(reply.code, 200);
        assert_eq!(reply.reason, "OK");
        assert_eq!(reply.header("cseq"), Some("1"));
        let body = reply.body.as_ref().unwrap();
        assert_eq!(body.name, "body");
        assert_eq!(body.find("US").unwrap().text, "10.0.0.5:8801");
        assert_eq!(body.find("Info/Name").unwrap().text, "dvr & co");
        assert!(reply.info_record().is_ok());
    }

    #[test]
    fn test_verify_accepts_empty_body() {
        let reply = verify(b"HTTP/1.1 404 Not Found\r\n\r\n").unwrap();
        assert!(reply.is_error());
        assert!(reply.body.is_none());
        assert_eq!(reply.info_record(), Err(FormatError::MissingRecord));
    }

    #[test]
    fn test_verify_rejects_malformed_input() {
        assert_eq!(verify(b""), Err(FormatError::Empty));
        assert_eq!(verify(&[0xff, 0xfe, 0x00]), Err(FormatError::NotUtf8));
        assert!(matches!(verify(b"HTTP/1.1 200 OK\r\nCSeq: 1"), Err(FormatError::Truncated(_))));
        assert!(matches!(verify(b"garbage\r\n\r\n"), Err(FormatError::StatusLine(_))));
        assert!(matches!(verify(b"HTTP/1.1 abc OK\r\n\r\n"), Err(FormatError::StatusLine(_))));
        assert!(matches!(verify(b"HTTP/1.1 200 OK\r\nnocolon\r\n\r\n"), Err(FormatError::Header(_))));
    }

    #[test]
    fn test_verify_checks_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 40\r\n\r\n<body/>";
        assert_eq!(
            verify(raw),
            Err(FormatError::LengthMismatch { declared: 40, actual: 7 })
        );
    }

    #[test]
    fn test_verify_rejects_broken_markup() {
        for body in [
            "<body><US>1</body>",
            "<body>",
            "<body></body><extra/>",
            "<body>&bogus;</body>",
            "<>x</>",
            "plain text",
        ] {
            let raw = format!("HTTP/1.1 200 OK\r\n\r\n{}", body);
            assert!(
                matches!(verify(raw.as_bytes()), Err(FormatError::Markup(_))),
                "accepted {:?}",
                body
            );
        }
    }

    #[test]
    fn test_verify_limits_depth() {
        let open: String = (0..40).map(|_| "<a>").collect();
        let close: String = (0..40).map(|_| "</a>").collect();
        let raw = format!("HTTP/1.1 200 OK\r\n\r\n{}{}", open, close);
        assert!(matches!(verify(raw.as_bytes()), Err(FormatError::Markup(_))));
    }

    #[test]
    fn test_signed_request_is_not_a_valid_reply() {
        let bytes = sign(&Request::get("/info/device/X"), &creds(), ctx()).unwrap();
        assert!(matches!(verify(&bytes), Err(FormatError::StatusLine(_))));
    }
}
