//! RFC 4180 CSV of tested records.

use crate::tester::TestedConfig;

pub const HEADER: [&str; 9] = [
    "config",
    "protocol",
    "host",
    "port",
    "ping_ms",
    "reachable",
    "handshake_ok",
    "source",
    "tested_at",
];

pub fn encode(records: &[TestedConfig]) -> String {
    let mut out = String::with_capacity(64 + records.len() * 128);
    push_row(&mut out, HEADER.iter().map(|h| h.to_string()));
    for record in records {
        let c = &record.config;
        push_row(
            &mut out,
            [
                c.raw_text.clone(),
                c.protocol.display_name().to_string(),
                c.host.clone(),
                c.port.to_string(),
                record.ping_ms.map(|p| format!("{p:.1}")).unwrap_or_default(),
                record.reachable.to_string(),
                record.handshake_ok.map(|h| h.to_string()).unwrap_or_default(),
                c.source_url.clone(),
                record.tested_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ]
            .into_iter(),
        );
    }
    out
}

fn push_row(out: &mut String, fields: impl Iterator<Item = String>) {
    for (i, field) in fields.enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&escape_field(&field));
    }
    out.push_str("\r\n");
}

/// Quote when the field holds a delimiter, quote, or line break; double inner quotes.
fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
