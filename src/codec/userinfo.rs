//! `credential@host:port?query#name` schemes (trojan, vless, hysteria, socks, ...).

use super::{
    endpoint_identity, fragment_name, looks_like_uuid, parse_host_port, percent_decode, query_params, split_scheme,
    strip_fragment, ConfigDetails, Protocol, SchemeCodec,
};

/// What a scheme demands of the userinfo part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialRule {
    /// No credential needed (socks, http, hysteria with no auth).
    Optional,
    /// A non-empty credential must be present (trojan password, tuic uuid:pass).
    Required,
    /// Credential must be a UUID (vless, vmess URI form).
    Uuid,
}

#[derive(Debug)]
pub struct UserinfoCodec {
    rule: CredentialRule,
}

impl UserinfoCodec {
    pub const fn new(rule: CredentialRule) -> Self {
        Self { rule }
    }
}

impl SchemeCodec for UserinfoCodec {
    fn decode(&self, _protocol: Protocol, line: &str) -> Option<ConfigDetails> {
        let (_, rest) = split_scheme(line)?;
        let main = strip_fragment(rest);
        let main = main.split_once('?').map_or(main, |(head, _)| head);

        let (credential, host_part) = match main.rfind('@') {
            Some(at) => (Some(percent_decode(&main[..at])), &main[at + 1..]),
            None => (None, main),
        };
        let authority = host_part.split('/').next()?;
        let (host, port) = parse_host_port(authority)?;

        let credential = credential.filter(|c| !c.is_empty());
        match self.rule {
            CredentialRule::Optional => {}
            CredentialRule::Required => {
                credential.as_ref()?;
            }
            CredentialRule::Uuid => {
                if !credential.as_deref().is_some_and(looks_like_uuid) {
                    return None;
                }
            }
        }

        let params = query_params(line);
        let method = params
            .get("encryption")
            .or_else(|| params.get("method"))
            .cloned();
        let identity = endpoint_identity(credential.as_deref(), &host, port);

        Some(ConfigDetails {
            host,
            port,
            credential,
            method,
            params,
            name: fragment_name(line),
            identity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "a3482e88-686a-4a58-8126-99c9034e4b09";

    #[test]
    fn trojan_fields() {
        let codec = UserinfoCodec::new(CredentialRule::Required);
        let d = codec
            .decode(
                Protocol::Trojan,
                "trojan://p%40ss@trojan.example.com:443?sni=cdn.example.com&type=ws#My%20Node",
            )
            .unwrap();
        assert_eq!(d.host, "trojan.example.com");
        assert_eq!(d.port, 443);
        assert_eq!(d.credential.as_deref(), Some("p@ss"));
        assert_eq!(d.params.get("sni").map(String::as_str), Some("cdn.example.com"));
        assert_eq!(d.name.as_deref(), Some("My Node"));
        assert_eq!(d.identity, "p@ss@trojan.example.com:443");
    }

    #[test]
    fn required_credential_missing() {
        let codec = UserinfoCodec::new(CredentialRule::Required);
        assert!(codec.decode(Protocol::Trojan, "trojan://example.com:443").is_none());
        assert!(codec.decode(Protocol::Trojan, "trojan://@example.com:443").is_none());
    }

    #[test]
    fn optional_credential_uses_host_port_identity() {
        let codec = UserinfoCodec::new(CredentialRule::Optional);
        let d = codec.decode(Protocol::Socks5, "socks5://10.0.0.1:1080").unwrap();
        assert_eq!(d.credential, None);
        assert_eq!(d.identity, "10.0.0.1:1080");
    }

    #[test]
    fn uuid_rule() {
        let codec = UserinfoCodec::new(CredentialRule::Uuid);
        assert!(codec
            .decode(Protocol::Vless, &format!("vless://{UUID}@v.example.com:443"))
            .is_some());
        assert!(codec
            .decode(Protocol::Vless, "vless://not-a-uuid@v.example.com:443")
            .is_none());
    }

    #[test]
    fn path_after_authority_is_ignored() {
        let codec = UserinfoCodec::new(CredentialRule::Required);
        let d = codec
            .decode(Protocol::Trojan, "trojan://pw@example.com:8443/?sni=x")
            .unwrap();
        assert_eq!(d.port, 8443);
    }

    #[test]
    fn ipv6_host() {
        let codec = UserinfoCodec::new(CredentialRule::Optional);
        let d = codec
            .decode(Protocol::Hysteria2, "hy2://auth@[2001:db8::2]:443?obfs=salamander")
            .unwrap();
        assert_eq!(d.host, "2001:db8::2");
        assert_eq!(d.port, 443);
    }
}
