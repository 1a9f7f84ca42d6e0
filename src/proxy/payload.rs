use serde_json::{Map, Value};
use std::borrow::Cow;
use std::net::IpAddr;

/// Origin a request is attributed to.
///
/// The first `X-Forwarded-For` hop is used when trusted and it parses as an
/// IP address; anything else falls back to the socket peer.
pub fn origin_id(forwarded_for: Option<&str>, peer: Option<IpAddr>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = forwarded_for
            .and_then(|xff| xff.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

fn parse_form_pairs(encoded: &str) -> Vec<(String, String)> {
    encoded
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (decode_component(key), decode_component(value)),
            None => (decode_component(pair), String::new()),
        })
        .collect()
}

/// Add `value` under `key`, keeping whatever is already there. A repeated
/// key becomes an array holding every value in arrival order.
fn push_field(fields: &mut Map<String, Value>, key: String, value: Value) {
    match fields.get_mut(&key) {
        Some(Value::Array(values)) => values.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            fields.insert(key, value);
        }
    }
}

/// Serialize every client-supplied field of a request into the one string
/// the classifier scans.
///
/// Query pairs are merged with the fields of a JSON-object or form-encoded
/// body and the result is written as a JSON object. No value is dropped: a
/// key supplied more than once, in the query or in both query and body,
/// holds an array of all of them. Any other body is
/// appended verbatim on its own line. Returns an empty string when the
/// request carries no fields at all.
pub fn serialize_request_fields(query: Option<&str>, content_type: Option<&str>, body: &[u8]) -> String {
    let mut fields = Map::new();
    let mut raw_body: Option<Cow<str>> = None;

    if !body.is_empty() {
        let is_form = content_type
            .map(|ct| ct.to_ascii_lowercase().contains("application/x-www-form-urlencoded"))
            .unwrap_or(false);

        if is_form {
            for (key, value) in parse_form_pairs(&String::from_utf8_lossy(body)) {
                push_field(&mut fields, key, Value::String(value));
            }
        } else {
            match serde_json::from_slice::<Value>(body) {
                Ok(Value::Object(map)) => fields = map,
                _ => raw_body = Some(String::from_utf8_lossy(body)),
            }
        }
    }

    for (key, value) in parse_form_pairs(query.unwrap_or("")) {
        push_field(&mut fields, key, Value::String(value));
    }

    let mut payload = if fields.is_empty() {
        String::new()
    } else {
        Value::Object(fields).to_string()
    };

    if let Some(raw) = raw_body {
        if !payload.is_empty() {
            payload.push('\n');
        }
        payload.push_str(&raw);
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_fields() {
        assert_eq!(serialize_request_fields(None, None, b""), "");
        assert_eq!(serialize_request_fields(Some(""), None, b""), "");
    }

    #[test]
    fn test_query_is_decoded() {
        let payload = serialize_request_fields(Some("q=%3Cscript%3Ealert(1)&name=a+b"), None, b"");
        assert!(payload.contains("<script>alert(1)"));
        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["name"], "a b");
        assert_eq!(value["q"], "<script>alert(1)");
    }

    #[test]
    fn test_query_merged_with_json_body() {
        let payload = serialize_request_fields(
            Some("name=query"),
            Some("application/json"),
            br#"{"name":"body","js":"eval('x')"}"#,
        );
        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["name"], serde_json::json!(["body", "query"]));
        assert_eq!(value["js"], "eval('x')");
    }

    #[test]
    fn test_repeated_query_key_keeps_every_value() {
        let payload = serialize_request_fields(Some("q=%3Cscript%3Ealert(1)&q=hello&q=x"), None, b"");
        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["q"], serde_json::json!(["<script>alert(1)", "hello", "x"]));

        let verdict = crate::waf::ContentClassifier::default().classify(&payload);
        assert_eq!(verdict.rule_id(), Some("xss-script-tag"));
    }

    #[test]
    fn test_query_cannot_mask_body_field() {
        let payload = serialize_request_fields(
            Some("js=1"),
            Some("application/json"),
            br#"{"js":"eval('x')"}"#,
        );
        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["js"], serde_json::json!(["eval('x')", "1"]));

        let verdict = crate::waf::ContentClassifier::default().classify(&payload);
        assert_eq!(verdict.rule_id(), Some("eval-call"));
    }

    #[test]
    fn test_query_merged_with_json_array_field() {
        let payload = serialize_request_fields(
            Some("tags=c"),
            Some("application/json"),
            br#"{"tags":["a","b"]}"#,
        );
        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["tags"], serde_json::json!(["a", "b", "c"]));
    }

    #[test]
    fn test_repeated_form_key() {
        let payload = serialize_request_fields(
            None,
            Some("application/x-www-form-urlencoded"),
            b"c=%3Cscript%3E&c=fine",
        );
        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["c"], serde_json::json!(["<script>", "fine"]));
    }

    #[test]
    fn test_form_body() {
        let payload = serialize_request_fields(
            None,
            Some("application/x-www-form-urlencoded; charset=utf-8"),
            b"comment=%3Cscript%3E&flag",
        );
        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["comment"], "<script>");
        assert_eq!(value["flag"], "");
    }

    #[test]
    fn test_raw_body_appended() {
        let payload = serialize_request_fields(Some("a=1"), Some("text/plain"), b"<script>");
        assert_eq!(payload, "{\"a\":\"1\"}\n<script>");

        let payload = serialize_request_fields(None, None, b"[1,2]");
        assert_eq!(payload, "[1,2]");
    }

    #[test]
    fn test_default_config_attributes_to_peer() {
        let trust = crate::config::GateConfig::default().proxy.trust_forwarded_for;
        let peer = Some("203.0.113.9".parse().unwrap());
        assert_eq!(origin_id(Some("8.8.8.8"), peer, trust), "203.0.113.9");
    }

    #[test]
    fn test_origin_prefers_valid_forwarded_for() {
        let peer = Some("10.0.0.1".parse().unwrap());
        assert_eq!(origin_id(Some("1.2.3.4, 10.0.0.2"), peer, true), "1.2.3.4");
        assert_eq!(origin_id(Some("1.2.3.4"), peer, false), "10.0.0.1");
        assert_eq!(origin_id(Some("1.2.3.4 | evil"), peer, true), "10.0.0.1");
        assert_eq!(origin_id(None, peer, true), "10.0.0.1");
        assert_eq!(origin_id(None, None, true), "unknown");
    }

    #[test]
    fn test_origin_ipv6() {
        let peer = Some("2001:db8::1".parse().unwrap());
        assert_eq!(origin_id(None, peer, true), "2001:db8::1");
    }
}
