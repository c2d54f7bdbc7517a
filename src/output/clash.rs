//! Clash / mihomo YAML.
//!
//! Produces a config with:
//! - `proxies` for every record Clash has a proxy type for
//! - `proxy-groups` with one `select` group over all of them
//! - `rules` routing everything through the selector
//!
//! Records of protocols Clash cannot express are left out of this format
//! (they still appear in raw / CSV / base64 output).

use crate::codec::{ConfigDetails, Protocol};
use crate::tester::TestedConfig;

use super::{param, proxy_names, record_details, split_user_pass, truthy};

/// Name of the selector group in generated Clash config.
pub const SELECTOR_GROUP_NAME: &str = "proxy-harvest";

/// A YAML value we know how to render.
#[derive(Debug, Clone, PartialEq)]
enum Field {
    Str(String),
    Num(u64),
    Bool(bool),
    Map(Vec<(&'static str, Field)>),
}

type Fields = Vec<(&'static str, Field)>;

/// Render `records` as a Clash config. Always valid YAML, even when empty.
pub fn encode(records: &[TestedConfig]) -> String {
    let details = record_details(records);
    let names = proxy_names(records, &details);

    let mut yaml = String::with_capacity(256 + records.len() * 160);
    let mut emitted: Vec<&str> = Vec::with_capacity(records.len());

    yaml.push_str("proxies:\n");
    for ((record, detail), name) in records.iter().zip(&details).zip(&names) {
        let Some(detail) = detail else { continue };
        let Some((kind, fields)) = clash_fields(record.config.protocol, detail) else {
            tracing::debug!(protocol = %record.config.protocol, "clash: no proxy type, skipping");
            continue;
        };
        yaml.push_str(&format!("  - name: \"{}\"\n", escape_yaml_string(name)));
        yaml.push_str(&format!("    type: {kind}\n"));
        yaml.push_str(&format!("    server: \"{}\"\n", escape_yaml_string(&record.config.host)));
        yaml.push_str(&format!("    port: {}\n", record.config.port));
        for (key, value) in &fields {
            push_field(&mut yaml, 4, key, value);
        }
        emitted.push(name);
    }
    if emitted.is_empty() {
        yaml.truncate(yaml.len() - 1);
        yaml.push_str(" []\n");
    }

    yaml.push_str("\nproxy-groups:\n");
    yaml.push_str(&format!("  - name: \"{SELECTOR_GROUP_NAME}\"\n"));
    yaml.push_str("    type: select\n");
    yaml.push_str("    proxies:\n");
    if emitted.is_empty() {
        yaml.push_str("      - DIRECT\n");
    }
    for name in &emitted {
        yaml.push_str(&format!("      - \"{}\"\n", escape_yaml_string(name)));
    }

    yaml.push_str("\nrules:\n");
    yaml.push_str(&format!("  - MATCH,{SELECTOR_GROUP_NAME}\n"));
    yaml
}

fn push_field(yaml: &mut String, indent: usize, key: &str, value: &Field) {
    let pad = " ".repeat(indent);
    match value {
        Field::Str(s) => yaml.push_str(&format!("{pad}{key}: \"{}\"\n", escape_yaml_string(s))),
        Field::Num(n) => yaml.push_str(&format!("{pad}{key}: {n}\n")),
        Field::Bool(b) => yaml.push_str(&format!("{pad}{key}: {b}\n")),
        Field::Map(entries) => {
            yaml.push_str(&format!("{pad}{key}:\n"));
            for (k, v) in entries {
                push_field(yaml, indent + 2, k, v);
            }
        }
    }
}

/// Escape special characters for YAML double-quoted strings.
fn escape_yaml_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn str_field(value: Option<&str>) -> Option<Field> {
    value.filter(|v| !v.is_empty()).map(|v| Field::Str(v.to_string()))
}

fn push_opt(fields: &mut Fields, key: &'static str, value: Option<Field>) {
    if let Some(value) = value {
        fields.push((key, value));
    }
}

/// Clash `type` and the protocol-specific fields after `server` / `port`.
fn clash_fields(protocol: Protocol, d: &ConfigDetails) -> Option<(&'static str, Fields)> {
    let cred = d.credential.as_deref();
    let sni = param(d, &["sni", "peer", "servername"]);
    let mut f: Fields = Vec::new();

    let kind = match protocol {
        Protocol::Shadowsocks => {
            f.push(("cipher", Field::Str(d.method.clone()?)));
            f.push(("password", Field::Str(cred?.to_string())));
            "ss"
        }
        Protocol::ShadowsocksR => {
            f.push(("cipher", Field::Str(d.method.clone()?)));
            f.push(("password", Field::Str(cred?.to_string())));
            f.push(("protocol", Field::Str(param(d, &["protocol"]).unwrap_or("origin").to_string())));
            f.push(("obfs", Field::Str(param(d, &["obfs"]).unwrap_or("plain").to_string())));
            push_opt(&mut f, "protocol-param", str_field(param(d, &["protoparam"])));
            push_opt(&mut f, "obfs-param", str_field(param(d, &["obfsparam"])));
            "ssr"
        }
        Protocol::Vmess => {
            f.push(("uuid", Field::Str(cred?.to_string())));
            let aid = param(d, &["aid", "alterId"]).and_then(|a| a.parse().ok()).unwrap_or(0);
            f.push(("alterId", Field::Num(aid)));
            f.push(("cipher", Field::Str(d.method.clone().unwrap_or_else(|| "auto".into()))));
            let tls = param(d, &["tls", "security"]).is_some_and(|t| t.eq_ignore_ascii_case("tls"));
            f.push(("tls", Field::Bool(tls)));
            push_opt(&mut f, "servername", str_field(sni));
            push_transport(&mut f, d, param(d, &["net", "type"]));
            "vmess"
        }
        Protocol::Vless | Protocol::Reality => {
            f.push(("uuid", Field::Str(cred?.to_string())));
            let security = param(d, &["security"]).unwrap_or_default();
            let reality = protocol == Protocol::Reality || security.eq_ignore_ascii_case("reality");
            f.push(("tls", Field::Bool(reality || security.eq_ignore_ascii_case("tls"))));
            push_opt(&mut f, "servername", str_field(sni));
            push_opt(&mut f, "flow", str_field(param(d, &["flow"])));
            push_opt(&mut f, "client-fingerprint", str_field(param(d, &["fp"])));
            if reality {
                let mut opts = Vec::new();
                push_opt(&mut opts, "public-key", str_field(param(d, &["pbk"])));
                push_opt(&mut opts, "short-id", str_field(param(d, &["sid"])));
                f.push(("reality-opts", Field::Map(opts)));
            }
            push_transport(&mut f, d, param(d, &["type"]));
            "vless"
        }
        Protocol::Trojan => {
            f.push(("password", Field::Str(cred?.to_string())));
            push_opt(&mut f, "sni", str_field(sni));
            if truthy(param(d, &["allowInsecure", "insecure"])) {
                f.push(("skip-cert-verify", Field::Bool(true)));
            }
            push_transport(&mut f, d, param(d, &["type"]));
            "trojan"
        }
        Protocol::Hysteria => {
            push_opt(&mut f, "auth-str", str_field(cred.or(param(d, &["auth"]))));
            push_opt(&mut f, "sni", str_field(sni));
            push_opt(&mut f, "protocol", str_field(param(d, &["protocol"])));
            "hysteria"
        }
        Protocol::Hysteria2 => {
            push_opt(&mut f, "password", str_field(cred));
            push_opt(&mut f, "sni", str_field(sni));
            push_opt(&mut f, "obfs", str_field(param(d, &["obfs"])));
            push_opt(&mut f, "obfs-password", str_field(param(d, &["obfs-password"])));
            if truthy(param(d, &["insecure"])) {
                f.push(("skip-cert-verify", Field::Bool(true)));
            }
            "hysteria2"
        }
        Protocol::Tuic => {
            let (uuid, password) = split_user_pass(cred);
            f.push(("uuid", Field::Str(uuid?)));
            push_opt(&mut f, "password", str_field(password.as_deref()));
            push_opt(&mut f, "sni", str_field(sni));
            push_opt(&mut f, "congestion-controller", str_field(param(d, &["congestion_control"])));
            "tuic"
        }
        Protocol::Socks | Protocol::Socks5 => {
            push_credentials(&mut f, cred);
            "socks5"
        }
        Protocol::Http | Protocol::Https => {
            push_credentials(&mut f, cred);
            if protocol == Protocol::Https {
                f.push(("tls", Field::Bool(true)));
            }
            "http"
        }
        Protocol::WireGuard => {
            f.push(("private-key", Field::Str(cred?.to_string())));
            push_opt(&mut f, "public-key", str_field(param(d, &["publickey", "public_key"])));
            push_opt(&mut f, "ip", str_field(param(d, &["address", "ip"])));
            f.push(("udp", Field::Bool(true)));
            "wireguard"
        }
        _ => return None,
    };
    Some((kind, f))
}

fn push_credentials(f: &mut Fields, cred: Option<&str>) {
    let (user, pass) = split_user_pass(cred);
    push_opt(f, "username", str_field(user.as_deref()));
    push_opt(f, "password", str_field(pass.as_deref()));
}

fn push_transport(f: &mut Fields, d: &ConfigDetails, network: Option<&str>) {
    let Some(network) = network.map(str::to_ascii_lowercase) else {
        return;
    };
    match network.as_str() {
        "ws" => {
            f.push(("network", Field::Str("ws".into())));
            let mut opts = Vec::new();
            push_opt(&mut opts, "path", str_field(param(d, &["path"])));
            if let Some(host) = param(d, &["host"]) {
                opts.push(("headers", Field::Map(vec![("Host", Field::Str(host.to_string()))])));
            }
            f.push(("ws-opts", Field::Map(opts)));
        }
        "grpc" => {
            f.push(("network", Field::Str("grpc".into())));
            let mut opts = Vec::new();
            push_opt(&mut opts, "grpc-service-name", str_field(param(d, &["serviceName", "path"])));
            f.push(("grpc-opts", Field::Map(opts)));
        }
        "h2" | "http" => {
            f.push(("network", Field::Str(network.clone())));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::test_support::tested;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    #[test]
    fn generates_sections() {
        let records = vec![
            tested("ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ@example.com:443#Test", Some(20.0)),
            tested("trojan://pw@t.example.com:443?sni=cdn.example.com#tro", Some(30.0)),
        ];
        let yaml = encode(&records);
        assert!(yaml.starts_with("proxies:\n"));
        assert!(yaml.contains("  - name: \"Test\"\n    type: ss\n"));
        assert!(yaml.contains("    cipher: \"aes-256-gcm\"\n"));
        assert!(yaml.contains("    password: \"password\"\n"));
        assert!(yaml.contains("    type: trojan\n"));
        assert!(yaml.contains("    sni: \"cdn.example.com\"\n"));
        assert!(yaml.contains("proxy-groups:\n  - name: \"proxy-harvest\"\n    type: select\n"));
        assert!(yaml.contains("      - \"Test\"\n      - \"tro\"\n"));
        assert!(yaml.ends_with("rules:\n  - MATCH,proxy-harvest\n"));
    }

    #[test]
    fn vless_reality_options() {
        let line = format!(
            "vless://{UUID}@r.example.com:443?security=reality&pbk=PUBKEY&sid=ab12&flow=xtls-rprx-vision&sni=www.example.com&type=tcp#r"
        );
        let yaml = encode(&[tested(&line, Some(5.0))]);
        assert!(yaml.contains("    type: vless\n"));
        assert!(yaml.contains(&format!("    uuid: \"{UUID}\"\n")));
        assert!(yaml.contains("    tls: true\n"));
        assert!(yaml.contains("    flow: \"xtls-rprx-vision\"\n"));
        assert!(yaml.contains("    reality-opts:\n      public-key: \"PUBKEY\"\n      short-id: \"ab12\"\n"));
    }

    #[test]
    fn ws_transport_is_nested() {
        let yaml = encode(&[tested(
            "trojan://pw@t.example.com:443?type=ws&path=%2Fws&host=cdn.example.com#w",
            None,
        )]);
        assert!(yaml.contains("    network: \"ws\"\n    ws-opts:\n      path: \"/ws\"\n      headers:\n        Host: \"cdn.example.com\"\n"));
    }

    #[test]
    fn unsupported_protocols_are_skipped() {
        let yaml = encode(&[tested("brook://b.example.com:9999", None)]);
        assert!(yaml.starts_with("proxies: []\n"));
        assert!(yaml.contains("      - DIRECT\n"));
    }

    #[test]
    fn names_are_escaped() {
        let yaml = encode(&[tested("trojan://pw@t.example.com:443#say%20%22hi%22", None)]);
        assert!(yaml.contains("  - name: \"say \\\"hi\\\"\"\n"));
    }

    #[test]
    fn escape_yaml_string_special_chars() {
        assert_eq!(escape_yaml_string("hello"), "hello");
        assert_eq!(escape_yaml_string("back\\slash"), "back\\\\slash");
    }
}
