//! Multi-protocol proxy URI codec.
//!
//! Every supported scheme maps to a [`Protocol`] variant, and every variant
//! maps to one [`SchemeCodec`] implementation through a single table
//! (`Protocol::codec`). Adding a protocol means adding a table row; nothing
//! else branches on the scheme.
//!
//! Malformed input is never an error here: parsing returns `None`, the
//! caller logs and moves on.

pub mod generic;
pub mod scan;
pub mod shadowsocks;
pub mod ssr;
pub mod userinfo;
pub mod vmess;

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use scan::{parse_configs_from_text, RawCandidate};

/// Upper bound for a single decoded config payload (vmess JSON, ss userinfo).
pub const MAX_CONFIG_PAYLOAD: usize = 256 * 1024;

/// Schemes that are rejected outright, regardless of payload.
const REJECTED_SCHEMES: &[&str] = &["warp"];

/// Proxy protocol family, resolved from the URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    Vmess,
    Vless,
    Shadowsocks,
    ShadowsocksR,
    Trojan,
    Hysteria,
    Hysteria2,
    Tuic,
    Reality,
    Naive,
    Juicity,
    ShadowTls,
    WireGuard,
    Brook,
    Socks,
    Socks4,
    Socks5,
    Http,
    Https,
    Grpc,
    Ws,
    Wss,
    Tcp,
    Kcp,
    Quic,
    H2,
    /// Unrecognized scheme, handled by generic extraction.
    Other,
}

/// Bit-exact scheme prefixes (without `://`) and the protocol they select.
const SCHEME_TABLE: &[(&str, Protocol)] = &[
    ("vmess", Protocol::Vmess),
    ("vless", Protocol::Vless),
    ("ss", Protocol::Shadowsocks),
    ("ssr", Protocol::ShadowsocksR),
    ("trojan", Protocol::Trojan),
    ("hy2", Protocol::Hysteria2),
    ("hysteria", Protocol::Hysteria),
    ("hysteria2", Protocol::Hysteria2),
    ("tuic", Protocol::Tuic),
    ("reality", Protocol::Reality),
    ("naive", Protocol::Naive),
    ("juicity", Protocol::Juicity),
    ("shadowtls", Protocol::ShadowTls),
    ("wireguard", Protocol::WireGuard),
    ("brook", Protocol::Brook),
    ("socks", Protocol::Socks),
    ("socks4", Protocol::Socks4),
    ("socks5", Protocol::Socks5),
    ("http", Protocol::Http),
    ("https", Protocol::Https),
    ("grpc", Protocol::Grpc),
    ("ws", Protocol::Ws),
    ("wss", Protocol::Wss),
    ("tcp", Protocol::Tcp),
    ("kcp", Protocol::Kcp),
    ("quic", Protocol::Quic),
    ("h2", Protocol::H2),
];

static JSON_URI: vmess::JsonUriCodec = vmess::JsonUriCodec;
static SHADOWSOCKS: shadowsocks::ShadowsocksCodec = shadowsocks::ShadowsocksCodec;
static SSR: ssr::SsrCodec = ssr::SsrCodec;
static USERINFO_UUID: userinfo::UserinfoCodec = userinfo::UserinfoCodec::new(userinfo::CredentialRule::Uuid);
static USERINFO_REQUIRED: userinfo::UserinfoCodec =
    userinfo::UserinfoCodec::new(userinfo::CredentialRule::Required);
static USERINFO_OPTIONAL: userinfo::UserinfoCodec =
    userinfo::UserinfoCodec::new(userinfo::CredentialRule::Optional);
static GENERIC: generic::GenericCodec = generic::GenericCodec;

impl Protocol {
    /// Resolve a scheme (case-insensitive, without `://`) to a known protocol.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        let lower = scheme.to_ascii_lowercase();
        SCHEME_TABLE
            .iter()
            .find(|(s, _)| *s == lower)
            .map(|(_, p)| *p)
    }

    /// Detect a known scheme prefix at the start of `line`.
    pub fn detect(line: &str) -> Option<Self> {
        let (scheme, _) = split_scheme(line.trim_start())?;
        Self::from_scheme(scheme)
    }

    /// Canonical scheme used in normalized text and semantic keys.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Vmess => "vmess",
            Self::Vless => "vless",
            Self::Shadowsocks => "ss",
            Self::ShadowsocksR => "ssr",
            Self::Trojan => "trojan",
            Self::Hysteria => "hysteria",
            Self::Hysteria2 => "hysteria2",
            Self::Tuic => "tuic",
            Self::Reality => "reality",
            Self::Naive => "naive",
            Self::Juicity => "juicity",
            Self::ShadowTls => "shadowtls",
            Self::WireGuard => "wireguard",
            Self::Brook => "brook",
            Self::Socks => "socks",
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
            Self::Http => "http",
            Self::Https => "https",
            Self::Grpc => "grpc",
            Self::Ws => "ws",
            Self::Wss => "wss",
            Self::Tcp => "tcp",
            Self::Kcp => "kcp",
            Self::Quic => "quic",
            Self::H2 => "h2",
            Self::Other => "other",
        }
    }

    /// Human-facing protocol name (CSV output, filters).
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Vmess => "VMess",
            Self::Vless => "VLESS",
            Self::Shadowsocks => "Shadowsocks",
            Self::ShadowsocksR => "ShadowsocksR",
            Self::Trojan => "Trojan",
            Self::Hysteria => "Hysteria",
            Self::Hysteria2 => "Hysteria2",
            Self::Tuic => "TUIC",
            Self::Reality => "Reality",
            Self::Naive => "Naive",
            Self::Juicity => "Juicity",
            Self::ShadowTls => "ShadowTLS",
            Self::WireGuard => "WireGuard",
            Self::Brook => "Brook",
            Self::Socks => "SOCKS",
            Self::Socks4 => "SOCKS4",
            Self::Socks5 => "SOCKS5",
            Self::Http => "HTTP",
            Self::Https => "HTTPS",
            Self::Grpc => "gRPC",
            Self::Ws => "WS",
            Self::Wss => "WSS",
            Self::Tcp => "TCP",
            Self::Kcp => "KCP",
            Self::Quic => "QUIC",
            Self::H2 => "H2",
            Self::Other => "Other",
        }
    }

    /// Case-insensitive match against either the display name or the scheme.
    pub fn matches_name(&self, name: &str) -> bool {
        let name = name.trim();
        self.display_name().eq_ignore_ascii_case(name) || self.scheme().eq_ignore_ascii_case(name)
    }

    /// Protocols that commonly ride over TLS and get a handshake in full-test mode.
    pub fn rides_tls(&self) -> bool {
        matches!(
            self,
            Self::Vmess
                | Self::Vless
                | Self::Trojan
                | Self::Reality
                | Self::Naive
                | Self::ShadowTls
                | Self::Https
                | Self::Wss
                | Self::Grpc
                | Self::H2
        )
    }

    fn codec(&self) -> &'static dyn SchemeCodec {
        match self {
            Self::Vmess | Self::Vless => &JSON_URI,
            Self::Shadowsocks => &SHADOWSOCKS,
            Self::ShadowsocksR => &SSR,
            Self::Trojan | Self::Tuic | Self::Reality | Self::Juicity => &USERINFO_REQUIRED,
            Self::Hysteria
            | Self::Hysteria2
            | Self::Naive
            | Self::ShadowTls
            | Self::WireGuard
            | Self::Brook
            | Self::Socks
            | Self::Socks4
            | Self::Socks5
            | Self::Http
            | Self::Https => &USERINFO_OPTIONAL,
            Self::Grpc | Self::Ws | Self::Wss | Self::Tcp | Self::Kcp | Self::Quic | Self::H2 | Self::Other => {
                &GENERIC
            }
        }
    }

    /// Codec used for URI-with-userinfo forms of JSON-bearing schemes.
    pub(crate) fn uuid_userinfo_codec() -> &'static userinfo::UserinfoCodec {
        &USERINFO_UUID
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Structured fields extracted from one config line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigDetails {
    pub host: String,
    pub port: u16,
    /// uuid / password / auth, already percent- or base64-decoded.
    pub credential: Option<String>,
    /// Cipher or encryption method where the scheme carries one.
    pub method: Option<String>,
    /// Query parameters or extra JSON fields, decoded.
    pub params: BTreeMap<String, String>,
    /// Display name (URI fragment or vmess `ps`).
    pub name: Option<String>,
    /// Identity credential that participates in the semantic key.
    pub identity: String,
}

/// One scheme-specific decode rule.
pub trait SchemeCodec: Send + Sync {
    /// Extract host, port and identity from `line`. `None` for malformed input.
    fn decode(&self, protocol: Protocol, line: &str) -> Option<ConfigDetails>;

    /// Canonical text used for hashing; must be idempotent.
    fn normalize(&self, line: &str) -> String {
        normalize_uri(line)
    }
}

/// A structurally valid config line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedConfig {
    pub raw_text: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub semantic_key: String,
    pub source_url: String,
}

/// Facade over the scheme table: parse, validate, normalize, key.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec;

impl Codec {
    pub fn new() -> Self {
        Self
    }

    /// Parse one candidate line into a [`ParsedConfig`].
    pub fn parse(&self, line: &str, source_url: &str) -> Option<ParsedConfig> {
        let line = line.trim();
        let (protocol, details) = self.details(line)?;
        Some(ParsedConfig {
            raw_text: line.to_string(),
            protocol,
            semantic_key: semantic_key_for(protocol, &details),
            host: details.host,
            port: details.port,
            source_url: source_url.to_string(),
        })
    }

    /// `true` when `line` carries every field its scheme requires.
    pub fn validate(&self, line: &str) -> bool {
        self.details(line).is_some()
    }

    /// Canonical form: fragment stripped, query keys sorted, JSON re-serialized.
    pub fn normalize(&self, line: &str) -> String {
        let line = line.trim();
        match split_scheme(line) {
            Some((scheme, _)) => {
                let protocol = Protocol::from_scheme(scheme).unwrap_or(Protocol::Other);
                protocol.codec().normalize(line)
            }
            None => strip_fragment(line).to_string(),
        }
    }

    /// Stable identity of the endpoint behind `line`, or `None` if invalid.
    pub fn semantic_key(&self, line: &str) -> Option<String> {
        let (protocol, details) = self.details(line.trim())?;
        Some(semantic_key_for(protocol, &details))
    }

    /// Hash of the normalized text; keys the cross-run proxy history.
    pub fn history_key(&self, line: &str) -> String {
        hex::encode(Sha256::digest(self.normalize(line).as_bytes()))
    }

    /// Scheme-resolved structured fields for `line`.
    pub fn details(&self, line: &str) -> Option<(Protocol, ConfigDetails)> {
        let line = line.trim();
        let Some((scheme, _)) = split_scheme(line) else {
            tracing::debug!("codec: no scheme in candidate, dropping");
            return None;
        };
        if REJECTED_SCHEMES.iter().any(|r| r.eq_ignore_ascii_case(scheme)) {
            tracing::debug!(scheme, "codec: rejected scheme");
            return None;
        }
        let protocol = Protocol::from_scheme(scheme).unwrap_or(Protocol::Other);
        let details = protocol.codec().decode(protocol, line);
        match details {
            Some(d) if valid_host(&d.host) && d.port > 0 => Some((protocol, d)),
            _ => {
                tracing::debug!(protocol = %protocol, "codec: malformed candidate, dropping");
                None
            }
        }
    }
}

fn semantic_key_for(protocol: Protocol, details: &ConfigDetails) -> String {
    let material = format!(
        "{}|{}|{}|{}",
        protocol.scheme(),
        details.host.to_ascii_lowercase(),
        details.port,
        details.identity
    );
    hex::encode(Sha256::digest(material.as_bytes()))
}

// ── Shared helpers ──────────────────────────────────────────────────

/// `cred@host:port` (or `host:port`) with the host lowercased.
pub(crate) fn endpoint_identity(credential: Option<&str>, host: &str, port: u16) -> String {
    let host = host.to_ascii_lowercase();
    match credential {
        Some(c) => format!("{c}@{host}:{port}"),
        None => format!("{host}:{port}"),
    }
}

/// Split `scheme://rest`. The scheme must be a plausible URI scheme.
pub(crate) fn split_scheme(line: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = line.split_once("://")?;
    let plausible = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    plausible.then_some((scheme, rest))
}

pub(crate) fn strip_fragment(line: &str) -> &str {
    line.split_once('#').map_or(line, |(head, _)| head)
}

/// Decoded URI fragment (display name), if non-empty.
pub(crate) fn fragment_name(line: &str) -> Option<String> {
    let (_, fragment) = line.split_once('#')?;
    let decoded = urlencoding::decode(fragment)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| fragment.to_string());
    let trimmed = decoded.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Decoded query parameters of a URI line (fragment ignored).
pub(crate) fn query_params(line: &str) -> BTreeMap<String, String> {
    let head = strip_fragment(line);
    let Some((_, query)) = head.split_once('?') else {
        return BTreeMap::new();
    };
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(k), percent_decode(v))
        })
        .collect()
}

pub(crate) fn percent_decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

/// URI normalization: lowercase scheme, drop fragment, sort query pairs.
pub(crate) fn normalize_uri(line: &str) -> String {
    let head = strip_fragment(line.trim());
    let Some((scheme, rest)) = split_scheme(head) else {
        return head.to_string();
    };
    let (base, query) = match rest.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (rest, None),
    };
    let mut out = format!("{}://{}", scheme.to_ascii_lowercase(), base);
    if let Some(query) = query {
        let mut pairs: Vec<(&str, &str)> = query
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| p.split_once('=').unwrap_or((p, "")))
            .collect();
        pairs.sort_unstable();
        if !pairs.is_empty() {
            out.push('?');
            let joined: Vec<String> = pairs
                .iter()
                .map(|(k, v)| if v.is_empty() { k.to_string() } else { format!("{k}={v}") })
                .collect();
            out.push_str(&joined.join("&"));
        }
    }
    out
}

/// Parse `host:port` or `[v6]:port`.
pub(crate) fn parse_host_port(s: &str) -> Option<(String, u16)> {
    let s = s.trim();
    if let Some(stripped) = s.strip_prefix('[') {
        let (host, tail) = stripped.split_once(']')?;
        let port = parse_port(tail.strip_prefix(':')?)?;
        return Some((host.to_string(), port));
    }
    let (host, port) = s.rsplit_once(':')?;
    Some((host.to_string(), parse_port(port)?))
}

/// Numeric port in (0, 65536).
pub(crate) fn parse_port(s: &str) -> Option<u16> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u16>().ok().filter(|p| *p > 0)
}

pub(crate) fn valid_host(host: &str) -> bool {
    !host.is_empty()
        && !host
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '@' | '/' | '?' | '#'))
}

pub(crate) fn looks_like_uuid(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 36
        && bytes.iter().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => *b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
}

/// Decode standard / url-safe base64 with or without padding.
///
/// Inputs whose decoded size would exceed `max_decoded` are rejected
/// before any decoding happens.
pub(crate) fn decode_base64(input: &str, max_decoded: usize) -> Option<Vec<u8>> {
    let clean: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if clean.is_empty() || clean.len() / 4 * 3 > max_decoded + 3 {
        return None;
    }
    let engines = [
        &general_purpose::STANDARD,
        &general_purpose::STANDARD_NO_PAD,
        &general_purpose::URL_SAFE,
        &general_purpose::URL_SAFE_NO_PAD,
    ];
    engines.iter().find_map(|engine| engine.decode(&clean).ok())
}

pub(crate) fn decode_base64_text(input: &str, max_decoded: usize) -> Option<String> {
    decode_base64(input, max_decoded).and_then(|bytes| String::from_utf8(bytes).ok())
}
