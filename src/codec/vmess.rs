//! vmess / vless: base64-wrapped JSON, or URI-with-userinfo.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;

use super::{
    decode_base64_text, endpoint_identity, normalize_uri, split_scheme, strip_fragment, ConfigDetails, Protocol,
    SchemeCodec, MAX_CONFIG_PAYLOAD,
};

/// Display-name field of the vmess JSON share format.
const NAME_FIELD: &str = "ps";

#[derive(Debug)]
pub struct JsonUriCodec;

impl SchemeCodec for JsonUriCodec {
    fn decode(&self, protocol: Protocol, line: &str) -> Option<ConfigDetails> {
        match json_payload(line) {
            Some(obj) => details_from_json(&obj),
            None => Protocol::uuid_userinfo_codec().decode(protocol, line),
        }
    }

    fn normalize(&self, line: &str) -> String {
        let Some(mut obj) = json_payload(line) else {
            return normalize_uri(line);
        };
        obj.remove(NAME_FIELD);
        let scheme = split_scheme(line.trim())
            .map(|(s, _)| s.to_ascii_lowercase())
            .unwrap_or_else(|| "vmess".to_string());
        match serde_json::to_string(&obj) {
            Ok(json) => format!("{scheme}://{}", STANDARD.encode(json)),
            Err(_) => normalize_uri(line),
        }
    }
}

/// Decode the base64 JSON object after the scheme, keys in canonical order.
fn json_payload(line: &str) -> Option<BTreeMap<String, Value>> {
    let (_, rest) = split_scheme(line.trim())?;
    let payload = strip_fragment(rest).trim();
    if payload.is_empty() || payload.contains('@') {
        return None;
    }
    let text = decode_base64_text(payload, MAX_CONFIG_PAYLOAD)?;
    match serde_json::from_str::<BTreeMap<String, Value>>(&text) {
        Ok(obj) => Some(obj),
        Err(e) => {
            tracing::debug!("codec: vmess payload is not a JSON object: {e}");
            None
        }
    }
}

fn details_from_json(obj: &BTreeMap<String, Value>) -> Option<ConfigDetails> {
    let host = non_empty_str(obj.get("add")).or_else(|| non_empty_str(obj.get("host")))?;
    let port = json_as_port(obj.get("port")?)?;
    let id = non_empty_str(obj.get("id")).or_else(|| non_empty_str(obj.get("uuid")));
    let identity = id.clone().unwrap_or_else(|| endpoint_identity(None, &host, port));

    let params = obj
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), "add" | "port" | "id" | "uuid" | NAME_FIELD))
        .filter_map(|(k, v)| scalar_to_string(v).map(|s| (k.clone(), s)))
        .collect();

    Some(ConfigDetails {
        method: non_empty_str(obj.get("scy")),
        name: non_empty_str(obj.get(NAME_FIELD)),
        host,
        port,
        credential: id,
        params,
        identity,
    })
}

fn non_empty_str(v: Option<&Value>) -> Option<String> {
    let s = v?.as_str()?.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Ports appear both as numbers and as strings in the wild.
fn json_as_port(v: &Value) -> Option<u16> {
    match v {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()).filter(|p| *p > 0),
        Value::String(s) => super::parse_port(s),
        _ => None,
    }
}

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    fn vmess_line(json: &str) -> String {
        format!("vmess://{}", STANDARD.encode(json))
    }

    #[test]
    fn decodes_json_payload() {
        let line = vmess_line(&format!(
            r#"{{"v":"2","ps":"tokyo","add":"tokyo.example.com","port":"443","id":"{UUID}","aid":"0","net":"ws","tls":"tls"}}"#
        ));
        let d = JsonUriCodec.decode(Protocol::Vmess, &line).unwrap();
        assert_eq!(d.host, "tokyo.example.com");
        assert_eq!(d.port, 443);
        assert_eq!(d.identity, UUID);
        assert_eq!(d.name.as_deref(), Some("tokyo"));
        assert_eq!(d.params.get("net").map(String::as_str), Some("ws"));
    }

    #[test]
    fn falls_back_to_host_field_and_host_port_identity() {
        let line = vmess_line(r#"{"host":"h.example.com","port":8080}"#);
        let d = JsonUriCodec.decode(Protocol::Vmess, &line).unwrap();
        assert_eq!(d.host, "h.example.com");
        assert_eq!(d.identity, "h.example.com:8080");
    }

    #[test]
    fn malformed_json_is_invalid() {
        let line = vmess_line("{not json");
        assert!(JsonUriCodec.decode(Protocol::Vmess, &line).is_none());
        assert!(JsonUriCodec.decode(Protocol::Vmess, "vmess://%%%notbase64").is_none());
    }

    #[test]
    fn missing_port_is_invalid() {
        let line = vmess_line(r#"{"add":"h.example.com","id":"x"}"#);
        assert!(JsonUriCodec.decode(Protocol::Vmess, &line).is_none());
    }

    #[test]
    fn userinfo_form_is_accepted() {
        let d = JsonUriCodec
            .decode(Protocol::Vless, &format!("vless://{UUID}@v.example.com:443?flow=xtls-rprx-vision"))
            .unwrap();
        assert_eq!(d.host, "v.example.com");
        assert_eq!(d.credential.as_deref(), Some(UUID));
    }

    #[test]
    fn key_order_and_name_do_not_change_semantic_key() {
        let a = vmess_line(&format!(
            r#"{{"ps":"first","add":"a.example.com","port":443,"id":"{UUID}","net":"tcp"}}"#
        ));
        let b = vmess_line(&format!(
            r#"{{"net":"tcp","id":"{UUID}","port":443,"add":"a.example.com","ps":"second"}}"#
        ));
        let codec = Codec::new();
        assert_eq!(codec.semantic_key(&a), codec.semantic_key(&b));
        assert_eq!(codec.normalize(&a), codec.normalize(&b));
    }

    #[test]
    fn normalize_round_trips() {
        let line = vmess_line(&format!(r#"{{"add":"a.example.com","port":443,"id":"{UUID}"}}"#));
        let codec = Codec::new();
        let once = codec.normalize(&line);
        assert!(once.starts_with("vmess://"));
        assert_eq!(codec.normalize(&once), once);
    }
}
