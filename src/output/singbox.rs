//! sing-box outbound JSON.
//!
//! Emits `{"outbounds": [...]}` with one outbound per supported record, a
//! `selector` over all of them, and a trailing `direct` outbound.

use serde_json::{json, Map, Value};

use crate::codec::{ConfigDetails, Protocol};
use crate::error::PersistError;
use crate::tester::TestedConfig;

use super::{param, proxy_names, record_details, split_user_pass, truthy};

pub const SELECTOR_TAG: &str = "proxy-harvest";

pub fn encode(records: &[TestedConfig]) -> Result<String, PersistError> {
    let details = record_details(records);
    let names = proxy_names(records, &details);

    let mut outbounds: Vec<Value> = Vec::with_capacity(records.len() + 2);
    let mut tags: Vec<&str> = Vec::with_capacity(records.len());
    for ((record, detail), name) in records.iter().zip(&details).zip(&names) {
        let Some(detail) = detail else { continue };
        match outbound(record.config.protocol, detail, name) {
            Some(value) => {
                outbounds.push(value);
                tags.push(name);
            }
            None => {
                tracing::debug!(protocol = %record.config.protocol, "singbox: no outbound type, skipping");
            }
        }
    }

    let default = tags.first().copied().unwrap_or("direct");
    let selected = if tags.is_empty() { vec!["direct"] } else { tags.clone() };
    let mut all = Vec::with_capacity(outbounds.len() + 2);
    all.push(json!({
        "type": "selector",
        "tag": SELECTOR_TAG,
        "outbounds": selected,
        "default": default,
    }));
    all.extend(outbounds);
    all.push(json!({ "type": "direct", "tag": "direct" }));

    serde_json::to_string_pretty(&json!({ "outbounds": all })).map_err(|e| PersistError::Encode {
        format: "singbox".into(),
        reason: e.to_string(),
    })
}

fn outbound(protocol: Protocol, d: &ConfigDetails, tag: &str) -> Option<Value> {
    let cred = d.credential.as_deref();
    let sni = param(d, &["sni", "peer", "servername"]);
    let insecure = truthy(param(d, &["allowInsecure", "insecure"]));

    let mut out = Map::new();
    let kind = match protocol {
        Protocol::Shadowsocks => {
            out.insert("method".into(), json!(d.method.clone()?));
            out.insert("password".into(), json!(cred?));
            "shadowsocks"
        }
        Protocol::ShadowsocksR => {
            out.insert("method".into(), json!(d.method.clone()?));
            out.insert("password".into(), json!(cred?));
            out.insert("protocol".into(), json!(param(d, &["protocol"]).unwrap_or("origin")));
            out.insert("obfs".into(), json!(param(d, &["obfs"]).unwrap_or("plain")));
            insert_opt(&mut out, "protocol_param", param(d, &["protoparam"]));
            insert_opt(&mut out, "obfs_param", param(d, &["obfsparam"]));
            "shadowsocksr"
        }
        Protocol::Vmess => {
            out.insert("uuid".into(), json!(cred?));
            out.insert("security".into(), json!(d.method.as_deref().unwrap_or("auto")));
            let aid: u64 = param(d, &["aid"]).and_then(|a| a.parse().ok()).unwrap_or(0);
            out.insert("alter_id".into(), json!(aid));
            if param(d, &["tls"]).is_some_and(|t| t.eq_ignore_ascii_case("tls")) {
                out.insert("tls".into(), tls(sni, insecure, param(d, &["fp"]), None));
            }
            insert_transport(&mut out, d, param(d, &["net"]));
            "vmess"
        }
        Protocol::Vless | Protocol::Reality => {
            out.insert("uuid".into(), json!(cred?));
            insert_opt(&mut out, "flow", param(d, &["flow"]));
            let security = param(d, &["security"]).unwrap_or_default();
            let reality = protocol == Protocol::Reality || security.eq_ignore_ascii_case("reality");
            if reality {
                let mut r = Map::new();
                r.insert("enabled".into(), json!(true));
                insert_opt(&mut r, "public_key", param(d, &["pbk"]));
                insert_opt(&mut r, "short_id", param(d, &["sid"]));
                out.insert("tls".into(), tls(sni, insecure, param(d, &["fp"]), Some(Value::Object(r))));
            } else if security.eq_ignore_ascii_case("tls") || security.eq_ignore_ascii_case("xtls") {
                out.insert("tls".into(), tls(sni, insecure, param(d, &["fp"]), None));
            }
            insert_transport(&mut out, d, param(d, &["type"]));
            "vless"
        }
        Protocol::Trojan => {
            out.insert("password".into(), json!(cred?));
            out.insert("tls".into(), tls(sni, insecure, param(d, &["fp"]), None));
            insert_transport(&mut out, d, param(d, &["type"]));
            "trojan"
        }
        Protocol::Hysteria => {
            insert_opt(&mut out, "auth_str", cred.or(param(d, &["auth"])));
            out.insert("tls".into(), tls(sni, insecure, None, None));
            "hysteria"
        }
        Protocol::Hysteria2 => {
            insert_opt(&mut out, "password", cred);
            if let Some(kind) = param(d, &["obfs"]) {
                let mut obfs = Map::new();
                obfs.insert("type".into(), json!(kind));
                insert_opt(&mut obfs, "password", param(d, &["obfs-password"]));
                out.insert("obfs".into(), Value::Object(obfs));
            }
            out.insert("tls".into(), tls(sni, insecure, None, None));
            "hysteria2"
        }
        Protocol::Tuic => {
            let (uuid, password) = split_user_pass(cred);
            out.insert("uuid".into(), json!(uuid?));
            insert_opt(&mut out, "password", password.as_deref());
            insert_opt(&mut out, "congestion_control", param(d, &["congestion_control"]));
            out.insert("tls".into(), tls(sni, insecure, None, None));
            "tuic"
        }
        Protocol::Socks | Protocol::Socks4 | Protocol::Socks5 => {
            let (user, pass) = split_user_pass(cred);
            insert_opt(&mut out, "username", user.as_deref());
            insert_opt(&mut out, "password", pass.as_deref());
            out.insert(
                "version".into(),
                json!(if protocol == Protocol::Socks4 { "4" } else { "5" }),
            );
            "socks"
        }
        Protocol::Http | Protocol::Https => {
            let (user, pass) = split_user_pass(cred);
            insert_opt(&mut out, "username", user.as_deref());
            insert_opt(&mut out, "password", pass.as_deref());
            if protocol == Protocol::Https {
                out.insert("tls".into(), tls(sni, insecure, None, None));
            }
            "http"
        }
        Protocol::WireGuard => {
            out.insert("private_key".into(), json!(cred?));
            insert_opt(&mut out, "peer_public_key", param(d, &["publickey", "public_key"]));
            if let Some(addr) = param(d, &["address", "ip"]) {
                let list: Vec<&str> = addr.split(',').map(str::trim).filter(|a| !a.is_empty()).collect();
                out.insert("local_address".into(), json!(list));
            }
            "wireguard"
        }
        _ => return None,
    };

    let mut head = Map::new();
    head.insert("type".into(), json!(kind));
    head.insert("tag".into(), json!(tag));
    head.insert("server".into(), json!(d.host));
    head.insert("server_port".into(), json!(d.port));
    head.extend(out);
    Some(Value::Object(head))
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        map.insert(key.to_string(), json!(v));
    }
}

fn tls(server_name: Option<&str>, insecure: bool, fingerprint: Option<&str>, reality: Option<Value>) -> Value {
    let mut t = Map::new();
    t.insert("enabled".into(), json!(true));
    insert_opt(&mut t, "server_name", server_name);
    if insecure {
        t.insert("insecure".into(), json!(true));
    }
    if let Some(fp) = fingerprint.filter(|f| !f.is_empty()) {
        t.insert("utls".into(), json!({ "enabled": true, "fingerprint": fp }));
    }
    if let Some(reality) = reality {
        t.insert("reality".into(), reality);
    }
    Value::Object(t)
}

fn insert_transport(out: &mut Map<String, Value>, d: &ConfigDetails, network: Option<&str>) {
    let transport = match network.map(str::to_ascii_lowercase).as_deref() {
        Some("ws") => {
            let mut t = Map::new();
            t.insert("type".into(), json!("ws"));
            insert_opt(&mut t, "path", param(d, &["path"]));
            if let Some(host) = param(d, &["host"]) {
                t.insert("headers".into(), json!({ "Host": host }));
            }
            t
        }
        Some("grpc") => {
            let mut t = Map::new();
            t.insert("type".into(), json!("grpc"));
            insert_opt(&mut t, "service_name", param(d, &["serviceName", "path"]));
            t
        }
        Some("h2" | "http") => {
            let mut t = Map::new();
            t.insert("type".into(), json!("http"));
            insert_opt(&mut t, "path", param(d, &["path"]));
            if let Some(host) = param(d, &["host"]) {
                t.insert("host".into(), json!([host]));
            }
            t
        }
        _ => return,
    };
    out.insert("transport".into(), Value::Object(transport));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::test_support::tested;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    fn outbounds(records: &[TestedConfig]) -> Vec<Value> {
        let text = encode(records).unwrap();
        let doc: Value = serde_json::from_str(&text).unwrap();
        doc["outbounds"].as_array().unwrap().clone()
    }

    #[test]
    fn selector_direct_and_proxies() {
        let out = outbounds(&[
            tested("ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ@example.com:443#Test", Some(20.0)),
            tested("trojan://pw@t.example.com:443?sni=cdn.example.com#tro", Some(30.0)),
        ]);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0]["type"], "selector");
        assert_eq!(out[0]["outbounds"], json!(["Test", "tro"]));
        assert_eq!(out[0]["default"], "Test");
        assert_eq!(out[1]["type"], "shadowsocks");
        assert_eq!(out[1]["method"], "aes-256-gcm");
        assert_eq!(out[1]["server_port"], 443);
        assert_eq!(out[2]["tls"]["server_name"], "cdn.example.com");
        assert_eq!(out[3]["type"], "direct");
    }

    #[test]
    fn vless_reality_and_grpc() {
        let line = format!(
            "vless://{UUID}@r.example.com:443?security=reality&pbk=PUBKEY&sid=ab12&fp=chrome&type=grpc&serviceName=svc#r"
        );
        let out = outbounds(&[tested(&line, None)]);
        let vless = &out[1];
        assert_eq!(vless["uuid"], UUID);
        assert_eq!(vless["tls"]["reality"]["public_key"], "PUBKEY");
        assert_eq!(vless["tls"]["reality"]["short_id"], "ab12");
        assert_eq!(vless["tls"]["utls"]["fingerprint"], "chrome");
        assert_eq!(vless["transport"], json!({ "type": "grpc", "service_name": "svc" }));
    }

    #[test]
    fn ws_transport_carries_host_header() {
        let out = outbounds(&[tested(
            "trojan://pw@t.example.com:443?type=ws&path=%2Fws&host=cdn.example.com",
            None,
        )]);
        assert_eq!(
            out[1]["transport"],
            json!({ "type": "ws", "path": "/ws", "headers": { "Host": "cdn.example.com" } })
        );
    }

    #[test]
    fn empty_input_still_selects_direct() {
        let out = outbounds(&[]);
        assert_eq!(out[0]["outbounds"], json!(["direct"]));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn transport_only_schemes_are_skipped() {
        let out = outbounds(&[tested("ws://relay.example.com:8080/path", None)]);
        assert_eq!(out.len(), 2);
    }
}
