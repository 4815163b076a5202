//! Request parsing pipeline (component C): turns one raw HTTP exchange into a
//! [`ParsedRequest`] — headers, query, body bytes, and a decoded [`Value`]
//! payload — the shape every later component (rule evaluator, argument
//! extractor) reads from.

use crate::hook::{Argument, ArgumentSource};
use crate::param::{self, Value};
use crate::xml;
use bytes::Bytes;
use futures::stream;
use std::collections::BTreeMap;

/// One HTTP exchange, fully parsed. Fields are set once, in parsing order, and
/// never mutated afterward (spec §3 Lifecycle).
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub id: String,
    pub method: String,
    pub remote_addr: String,
    pub headers: BTreeMap<String, String>,
    pub query: Value,
    pub body: Bytes,
    pub content_type: String,
    pub payload: Value,
    pub allow_signature_errors: bool,
    /// Multipart file parts, keyed by form field name, preserved as exact
    /// bytes (unlike the rest of `payload`, which is string-addressed) so
    /// `pass-file-to-command` arguments survive binary content.
    pub raw_files: BTreeMap<String, Bytes>,
}

impl ParsedRequest {
    /// Resolve one of the `request` pseudo-fields (`method`, `remote-addr`).
    pub fn pseudo_field(&self, name: &str) -> Option<&str> {
        match name {
            "method" => Some(self.method.as_str()),
            "remote-addr" => Some(self.remote_addr.as_str()),
            _ => None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn entire_headers(&self) -> Value {
        Value::Mapping(
            self.headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::Scalar(v.clone())))
                .collect(),
        )
    }

    /// Apply a hook's `parse-parameters-as-json` list (spec §4.3): for each
    /// named argument, read its current string value and overwrite the
    /// addressed slot with the JSON-decoded structure. Decode failures and
    /// unaddressable sources are logged and otherwise ignored — this step
    /// never fails the request.
    pub fn apply_json_string_parameters(&mut self, args: &[Argument]) {
        for arg in args {
            // Only `payload` and `url` address a structured tree that can
            // hold a decoded sub-document in place; the other sources (plain
            // headers, literal strings, pseudo-fields) have nowhere to put
            // one, so JSON-string parameters there are a no-op save for the
            // log line.
            let tree: &mut Value = match arg.source {
                ArgumentSource::Payload => &mut self.payload,
                ArgumentSource::Url => &mut self.query,
                other => {
                    log::warn!(
                        target: "hookforge::request",
                        "parse-parameters-as-json does not support source {other:?}, skipping '{}'",
                        arg.name
                    );
                    continue;
                }
            };

            let raw = match param::extract_string(&arg.name, tree) {
                Ok(v) => v,
                Err(_) => continue,
            };

            let decoded = match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(v) => Value::from_json(&v),
                Err(e) => {
                    log::warn!(
                        target: "hookforge::request",
                        "parse-parameters-as-json: failed to decode '{}': {e}",
                        arg.name
                    );
                    continue;
                }
            };

            param::set(&arg.name, tree, decoded);
        }
    }
}

pub struct ParseInput<'a> {
    pub id: String,
    pub method: String,
    pub remote_addr: String,
    pub headers: &'a hyper::HeaderMap,
    pub query_string: &'a str,
    pub body: Bytes,
    pub content_type_override: Option<&'a str>,
    pub max_multipart_memory: usize,
    pub allow_signature_errors: bool,
}

/// Run the full parse pipeline for one request (spec §4.3). Never fails: a
/// malformed body downgrades `payload` to `Null` and is logged by the caller,
/// it does not abort the request.
pub async fn parse(input: ParseInput<'_>) -> ParsedRequest {
    let headers = normalize_headers(input.headers);
    let query = decode_query(input.query_string);

    let content_type = input
        .content_type_override
        .map(str::to_string)
        .or_else(|| headers.get("content-type").cloned())
        .unwrap_or_default();

    let lower_ct = content_type.to_ascii_lowercase();
    let mut raw_files = BTreeMap::new();

    let payload = if lower_ct.contains("json") {
        match serde_json::from_slice::<serde_json::Value>(&input.body) {
            Ok(v) => Value::from_json(&v),
            Err(e) => {
                log::warn!(target: "hookforge::request", "json decode failed: {e}");
                Value::Null
            }
        }
    } else if lower_ct.contains("x-www-form-urlencoded") {
        decode_form(&input.body)
    } else if lower_ct.contains("xml") {
        match xml::decode(&input.body) {
            Ok(v) => v,
            Err(e) => {
                log::warn!(target: "hookforge::request", "xml decode failed: {e}");
                Value::Null
            }
        }
    } else if lower_ct.starts_with("multipart/form-data") {
        match decode_multipart(&content_type, input.body.clone(), input.max_multipart_memory).await {
            Ok((payload, files)) => {
                raw_files = files;
                payload
            }
            Err(e) => {
                log::warn!(target: "hookforge::request", "multipart decode failed: {e}");
                Value::Null
            }
        }
    } else {
        Value::Null
    };

    ParsedRequest {
        id: input.id,
        method: input.method,
        remote_addr: input.remote_addr,
        headers,
        query,
        body: input.body,
        content_type,
        payload,
        allow_signature_errors: input.allow_signature_errors,
        raw_files,
    }
}

fn normalize_headers(headers: &hyper::HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let key = name.as_str().to_ascii_lowercase();
        let val = value.to_str().unwrap_or_default().to_string();
        out.entry(key).or_default().push(val);
    }
    out.into_iter().map(|(k, v)| (k, v.join(", "))).collect()
}

fn decode_query(query_string: &str) -> Value {
    let mut multi: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for (k, v) in form_urlencoded::parse(query_string.as_bytes()) {
        multi
            .entry(k.into_owned())
            .or_default()
            .push(Value::Scalar(v.into_owned()));
    }
    Value::Mapping(
        multi
            .into_iter()
            .map(|(k, mut values)| {
                let v = if values.len() == 1 {
                    values.pop().unwrap()
                } else {
                    Value::Sequence(values)
                };
                (k, v)
            })
            .collect(),
    )
}

fn decode_form(body: &[u8]) -> Value {
    let mut multi: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for (k, v) in form_urlencoded::parse(body) {
        multi
            .entry(k.into_owned())
            .or_default()
            .push(Value::Scalar(v.into_owned()));
    }
    Value::Mapping(
        multi
            .into_iter()
            .map(|(k, mut values)| {
                let v = if values.len() == 1 {
                    values.pop().unwrap()
                } else {
                    Value::Sequence(values)
                };
                (k, v)
            })
            .collect(),
    )
}

async fn decode_multipart(
    content_type: &str,
    body: Bytes,
    max_memory: usize,
) -> Result<(Value, BTreeMap<String, Bytes>), multer::Error> {
    let boundary = multer::parse_boundary(content_type)?;
    let stream = stream::once(async move { Ok::<Bytes, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = BTreeMap::new();
    let mut files = BTreeMap::new();
    let mut memory_used = 0usize;

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let field_content_type = field.content_type().map(|m| m.essence_str().to_string());

        let mut data = Vec::new();
        while let Some(chunk) = field.chunk().await? {
            memory_used += chunk.len();
            if memory_used > max_memory {
                log::warn!(target: "hookforge::request", "multipart part '{name}' exceeds memory cap, truncating");
                break;
            }
            data.extend_from_slice(&chunk);
        }

        if file_name.is_some() || field_content_type.as_deref() == Some("application/json") {
            if field_content_type.as_deref() == Some("application/json") {
                if let Ok(v) = serde_json::from_slice::<serde_json::Value>(&data) {
                    fields.insert(name.clone(), Value::from_json(&v));
                }
            }
            files.insert(name, Bytes::from(data));
        } else {
            let text = String::from_utf8_lossy(&data).into_owned();
            fields.insert(name, Value::Scalar(text));
        }
    }

    Ok((Value::Mapping(fields), files))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_repeated_keys_become_sequence() {
        let v = decode_query("a=1&a=2&b=x");
        match v {
            Value::Mapping(m) => {
                match m.get("a").unwrap() {
                    Value::Sequence(items) => assert_eq!(items.len(), 2),
                    _ => panic!("expected sequence"),
                }
                assert_eq!(m.get("b").unwrap().stringify(), "x");
            }
            _ => panic!("expected mapping"),
        }
    }

    #[test]
    fn form_body_decodes_into_mapping() {
        let v = decode_form(b"name=value&other=1");
        match v {
            Value::Mapping(m) => assert_eq!(m.get("name").unwrap().stringify(), "value"),
            _ => panic!("expected mapping"),
        }
    }

    fn parsed_with_payload(payload: Value) -> ParsedRequest {
        ParsedRequest {
            id: "abc".into(),
            method: "POST".into(),
            remote_addr: "127.0.0.1:1234".into(),
            headers: BTreeMap::new(),
            query: Value::mapping(),
            body: Bytes::new(),
            content_type: "application/json".into(),
            payload,
            allow_signature_errors: false,
            raw_files: BTreeMap::new(),
        }
    }

    #[test]
    fn json_string_parameter_overwrites_addressed_payload_slot() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "payload".to_string(),
            Value::Scalar(r#"{"ref":"refs/heads/master"}"#.to_string()),
        );
        let mut req = parsed_with_payload(Value::Mapping(fields));

        let args = vec![Argument {
            source: ArgumentSource::Payload,
            name: "payload".into(),
            env_name: None,
            base64_decode: false,
        }];
        req.apply_json_string_parameters(&args);

        assert_eq!(
            param::extract_string("payload.ref", &req.payload).unwrap(),
            "refs/heads/master"
        );
    }

    #[test]
    fn json_string_parameter_decode_failure_is_logged_and_ignored() {
        let mut fields = BTreeMap::new();
        fields.insert("payload".to_string(), Value::Scalar("not json".to_string()));
        let mut req = parsed_with_payload(Value::Mapping(fields));

        let args = vec![Argument {
            source: ArgumentSource::Payload,
            name: "payload".into(),
            env_name: None,
            base64_decode: false,
        }];
        req.apply_json_string_parameters(&args);

        assert_eq!(
            param::extract_string("payload", &req.payload).unwrap(),
            "not json"
        );
    }
}
