//! ShadowsocksR: `ssr://base64(host:port:protocol:method:obfs:base64(password)/?params)`.

use std::collections::BTreeMap;

use super::{
    decode_base64_text, endpoint_identity, parse_port, split_scheme, strip_fragment, ConfigDetails, Protocol,
    SchemeCodec, MAX_CONFIG_PAYLOAD,
};

#[derive(Debug)]
pub struct SsrCodec;

impl SchemeCodec for SsrCodec {
    fn decode(&self, _protocol: Protocol, line: &str) -> Option<ConfigDetails> {
        let (_, rest) = split_scheme(line.trim())?;
        let body = strip_fragment(rest).trim();
        // Some lists ship the colon-delimited form without the base64 wrapper.
        let plain = if body.matches(':').count() >= 5 {
            body.to_string()
        } else {
            decode_base64_text(body, MAX_CONFIG_PAYLOAD)?
        };

        let (main, query) = match plain.split_once("/?") {
            Some((m, q)) => (m, Some(q)),
            None => (plain.trim_end_matches('/'), None),
        };

        // Host may itself contain colons (IPv6), so peel fields from the right.
        let mut fields = main.trim().rsplitn(6, ':');
        let password_b64 = fields.next()?;
        let obfs = fields.next()?;
        let method = fields.next()?;
        let ssr_protocol = fields.next()?;
        let port = parse_port(fields.next()?)?;
        let host = fields.next()?.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }

        let password = decode_base64_text(password_b64, MAX_CONFIG_PAYLOAD)
            .unwrap_or_else(|| password_b64.to_string());

        let mut params: BTreeMap<String, String> = query.map(decode_params).unwrap_or_default();
        params.insert("protocol".into(), ssr_protocol.to_string());
        params.insert("obfs".into(), obfs.to_string());
        let name = params.get("remarks").cloned().filter(|s| !s.is_empty());

        Some(ConfigDetails {
            identity: endpoint_identity(Some(password.as_str()), host, port),
            host: host.to_string(),
            port,
            credential: Some(password),
            method: Some(method.to_string()),
            params,
            name,
        })
    }
}

/// SSR query values are url-safe base64 themselves.
fn decode_params(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| {
            let value = decode_base64_text(v, MAX_CONFIG_PAYLOAD).unwrap_or_else(|| v.to_string());
            (k.to_string(), value)
        })
        .collect()
}
