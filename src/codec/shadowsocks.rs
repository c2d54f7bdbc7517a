//! Shadowsocks: SIP002 (`ss://base64(method:password)@host:port`),
//! plain userinfo, and the legacy fully-wrapped `ss://base64(method:password@host:port)`.

use super::{
    decode_base64_text, endpoint_identity, fragment_name, parse_host_port, percent_decode, query_params,
    split_scheme, strip_fragment, ConfigDetails, Protocol, SchemeCodec, MAX_CONFIG_PAYLOAD,
};

#[derive(Debug)]
pub struct ShadowsocksCodec;

impl SchemeCodec for ShadowsocksCodec {
    fn decode(&self, _protocol: Protocol, line: &str) -> Option<ConfigDetails> {
        let (_, rest) = split_scheme(line)?;
        let main = strip_fragment(rest);
        let main = main.split_once('?').map_or(main, |(head, _)| head);

        let (method, password, host, port) = match main.rfind('@') {
            Some(at) => {
                let (method, password) = decode_userinfo(&main[..at])?;
                let authority = main[at + 1..].split('/').next()?;
                let (host, port) = parse_host_port(authority)?;
                (method, password, host, port)
            }
            None => decode_legacy(main.trim_end_matches('/'))?,
        };
        if method.is_empty() || password.is_empty() {
            return None;
        }

        let identity = endpoint_identity(Some(password.as_str()), &host, port);
        Some(ConfigDetails {
            host,
            port,
            credential: Some(password),
            method: Some(method),
            params: query_params(line),
            name: fragment_name(line),
            identity,
        })
    }
}

/// `method:password`, either base64-encoded or percent-encoded plain text.
fn decode_userinfo(userinfo: &str) -> Option<(String, String)> {
    let plain = decode_base64_text(userinfo, MAX_CONFIG_PAYLOAD)
        .filter(|s| s.contains(':'))
        .unwrap_or_else(|| percent_decode(userinfo));
    let (method, password) = plain.split_once(':')?;
    Some((method.to_string(), password.to_string()))
}

fn decode_legacy(body: &str) -> Option<(String, String, String, u16)> {
    let decoded = decode_base64_text(body, MAX_CONFIG_PAYLOAD)?;
    let (auth, addr) = decoded.trim().rsplit_once('@')?;
    let (method, password) = auth.split_once(':')?;
    let (host, port) = parse_host_port(addr)?;
    Some((method.to_string(), password.to_string(), host, port))
}
