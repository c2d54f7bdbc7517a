//! Bulk scanning of arbitrary text blobs for config lines.
//!
//! Lines starting with a known scheme are captured as-is. Lines that look
//! like base64 are decoded and scanned once more (one level deep) for
//! embedded configs; oversized or undecodable blobs are skipped.

use super::{decode_base64_text, Protocol};

/// Upper bound for one base64 line considered for recursive decoding.
pub const MAX_BLOB_LINE: usize = 4 * 1024 * 1024;

/// Shorter strings are never treated as base64 blobs.
const MIN_BASE64_LINE: usize = 16;

/// One candidate line, not yet validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCandidate {
    pub text: String,
    pub declared_protocol_hint: Option<Protocol>,
}

impl RawCandidate {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let declared_protocol_hint = Protocol::detect(&text);
        Self {
            text,
            declared_protocol_hint,
        }
    }
}

/// Extract every config-looking line from `text`.
pub fn parse_configs_from_text(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    scan_into(text, 0, &mut out);
    out
}

fn scan_into(text: &str, depth: u8, out: &mut Vec<String>) {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if Protocol::detect(line).is_some() {
            out.push(line.to_string());
            continue;
        }

        // Configs embedded mid-line, e.g. "Node 3: vmess://...".
        let before = out.len();
        out.extend(
            line.split_whitespace()
                .filter(|token| Protocol::detect(token).is_some())
                .map(str::to_string),
        );
        if out.len() > before || depth > 0 || !looks_like_base64(line) {
            continue;
        }

        if line.len() > MAX_BLOB_LINE {
            tracing::debug!(len = line.len(), "scan: base64 line over size cap, skipping");
            continue;
        }
        match decode_base64_text(line, MAX_BLOB_LINE) {
            Some(decoded) => scan_into(&decoded, depth + 1, out),
            None => tracing::debug!(len = line.len(), "scan: base64-looking line did not decode to UTF-8"),
        }
    }
}

/// Charset and length heuristic for base64 blobs.
pub(crate) fn looks_like_base64(line: &str) -> bool {
    line.len() >= MIN_BASE64_LINE
        && line.len() % 4 == 0
        && line
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'-' | b'_'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    #[test]
    fn captures_scheme_lines_and_skips_noise() {
        let text = "# header\n\ntrojan://pw@a.example.com:443#a\nnot a config\n  ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ@b.example.com:443  \n";
        let found = parse_configs_from_text(text);
        assert_eq!(
            found,
            vec![
                "trojan://pw@a.example.com:443#a".to_string(),
                "ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ@b.example.com:443".to_string(),
            ]
        );
    }

    #[test]
    fn decodes_base64_lines_one_level() {
        let inner = "trojan://pw@a.example.com:443\nvless://x@b.example.com:443\n";
        let mut encoded = STANDARD.encode(inner);
        while encoded.len() % 4 != 0 {
            encoded.push('=');
        }
        let found = parse_configs_from_text(&format!("junk line\n{encoded}\n"));
        assert_eq!(found.len(), 2);
        assert!(found[0].starts_with("trojan://"));
        assert!(found[1].starts_with("vless://"));
    }

    #[test]
    fn does_not_recurse_twice() {
        let inner = "trojan://pw@a.example.com:443";
        let once = STANDARD.encode(inner);
        let twice = STANDARD.encode(&once);
        assert!(parse_configs_from_text(&twice).is_empty());
        assert_eq!(parse_configs_from_text(&once).len(), 1);
    }

    #[test]
    fn non_utf8_base64_is_skipped() {
        let encoded = STANDARD.encode([0xff_u8, 0xfe, 0xfd, 0xfc, 0xfb, 0xfa, 0xf9, 0xf8, 0xf7, 0xf6, 0xf5, 0xf4]);
        assert!(parse_configs_from_text(&encoded).is_empty());
    }

    #[test]
    fn picks_configs_embedded_mid_line() {
        let found = parse_configs_from_text("Node 3: trojan://pw@c.example.com:443 (fast)");
        assert_eq!(found, vec!["trojan://pw@c.example.com:443".to_string()]);
    }

    #[test]
    fn raw_candidate_hint() {
        assert_eq!(
            RawCandidate::new("hy2://a@b.example.com:1").declared_protocol_hint,
            Some(Protocol::Hysteria2)
        );
        assert_eq!(RawCandidate::new("nothing").declared_protocol_hint, None);
    }

    #[test]
    fn base64_heuristic() {
        assert!(looks_like_base64("QUJDREVGR0hJSktMTU5PUA=="));
        assert!(!looks_like_base64("short"));
        assert!(!looks_like_base64("has spaces in it and is long"));
        assert!(!looks_like_base64("QUJDREVGR0hJSktMTU5PUA="));
    }
}
