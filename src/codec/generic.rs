//! Best-effort extraction for transport-only and unknown schemes.

use std::sync::OnceLock;

use regex::Regex;

use super::{
    endpoint_identity, fragment_name, parse_port, query_params, split_scheme, strip_fragment, ConfigDetails, Protocol,
    SchemeCodec,
};

#[derive(Debug)]
pub struct GenericCodec;

fn userinfo_tail_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"@(\[[0-9A-Fa-f:.]+\]|[^\s@:/?#\[\]]+):(\d{1,5})(?:[/?]|$)")
            .expect("userinfo tail regex")
    })
}

fn host_port_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[/\s])(\[[0-9A-Fa-f:.]+\]|[A-Za-z0-9_.\-]+):(\d{1,5})(?:[/?]|$)")
            .expect("host:port regex")
    })
}

impl SchemeCodec for GenericCodec {
    fn decode(&self, _protocol: Protocol, line: &str) -> Option<ConfigDetails> {
        let (_, rest) = split_scheme(line.trim())?;
        let body = strip_fragment(rest);

        let caps = userinfo_tail_regex()
            .captures_iter(body)
            .last()
            .or_else(|| host_port_regex().captures_iter(body).last())?;
        let host = caps
            .get(1)?
            .as_str()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = parse_port(caps.get(2)?.as_str())?;

        Some(ConfigDetails {
            identity: endpoint_identity(None, &host, port),
            host,
            port,
            credential: None,
            method: None,
            params: query_params(line),
            name: fragment_name(line),
        })
    }
}
