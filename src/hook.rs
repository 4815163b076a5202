//! Hook and trigger-rule data model (spec §3), plus the serde wiring for the
//! JSON/YAML hook definition file format (spec §6).

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Hook {
    pub id: String,
    pub execute_command: String,
    #[serde(default)]
    pub command_working_directory: Option<String>,
    #[serde(default, rename = "http-methods")]
    pub http_methods: Vec<String>,
    #[serde(default, rename = "response-message")]
    pub response_message: String,
    #[serde(default, rename = "response-headers")]
    pub response_headers: Vec<ResponseHeader>,
    #[serde(default, rename = "include-command-output-in-response")]
    pub capture_output: bool,
    #[serde(default, rename = "include-command-output-in-response-on-error")]
    pub capture_output_on_error: bool,
    #[serde(default, rename = "stream-command-output")]
    pub stream_output: bool,
    #[serde(default, rename = "success-http-response-code")]
    pub success_http_code: Option<u16>,
    #[serde(default, rename = "trigger-rule-mismatch-http-response-code")]
    pub trigger_rule_mismatch_http_code: Option<u16>,
    #[serde(default, rename = "incoming-payload-content-type")]
    pub incoming_content_type: Option<String>,
    #[serde(default, rename = "trigger-signature-soft-failures")]
    pub trigger_signature_soft_failures: bool,
    #[serde(default, rename = "pass-arguments-to-command")]
    pub pass_arguments: Vec<Argument>,
    #[serde(default, rename = "pass-environment-to-command")]
    pub pass_environment: Vec<Argument>,
    #[serde(default, rename = "pass-file-to-command")]
    pub pass_file: Vec<Argument>,
    #[serde(default, rename = "parse-parameters-as-json")]
    pub json_string_parameters: Vec<Argument>,
    #[serde(default, rename = "trigger-rule")]
    pub trigger_rule: Option<TriggerRule>,
}

impl Hook {
    pub fn working_directory(&self) -> &str {
        self.command_working_directory.as_deref().unwrap_or(".")
    }

    pub fn method_allowed(&self, method: &str) -> bool {
        self.http_methods.is_empty()
            || self
                .http_methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseHeader {
    pub name: String,
    pub value: String,
}

/// One argument descriptor: where to read a value from, and how to place it
/// into argv / envv / a temp file (spec §3 Argument).
#[derive(Debug, Clone, Deserialize)]
pub struct Argument {
    pub source: ArgumentSource,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "envname")]
    pub env_name: Option<String>,
    #[serde(default, rename = "base64decode")]
    pub base64_decode: bool,
}

impl Argument {
    pub fn env_key(&self) -> String {
        self.env_name.clone().unwrap_or_else(|| self.name.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgumentSource {
    Header,
    Url,
    Payload,
    String,
    Request,
    #[serde(rename = "entire-payload")]
    EntirePayload,
    #[serde(rename = "entire-query")]
    EntireQuery,
    #[serde(rename = "entire-headers")]
    EntireHeaders,
    #[serde(rename = "raw-request-body")]
    RawRequestBody,
}

/// The Boolean trigger-rule tree (spec §3 TriggerRule). Externally tagged so
/// that a hook file's `{"and": [...]}`/`{"match": {...}}` shape deserializes
/// directly without a custom visitor.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerRule {
    And(Vec<TriggerRule>),
    Or(Vec<TriggerRule>),
    Not(Box<TriggerRule>),
    Match(MatchRule),
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchRule {
    #[serde(rename = "type")]
    pub match_type: MatchType,
    pub parameter: ParamRef,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default, rename = "ip-range")]
    pub ip_range: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParamRef {
    pub source: ArgumentSource,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Value,
    Regex,
    PayloadHmacSha1,
    PayloadHmacSha256,
    PayloadHmacSha512,
    ScalrSignature,
    MsTeamsSignature,
    IpWhitelist,
}

impl<'de> Deserialize<'de> for MatchType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "value" => Ok(MatchType::Value),
            "regex" => Ok(MatchType::Regex),
            "payload-hmac-sha1" | "payload-hash-sha1" => Ok(MatchType::PayloadHmacSha1),
            "payload-hmac-sha256" | "payload-hash-sha256" => Ok(MatchType::PayloadHmacSha256),
            "payload-hmac-sha512" | "payload-hash-sha512" => Ok(MatchType::PayloadHmacSha512),
            "scalr-signature" => Ok(MatchType::ScalrSignature),
            "ms-teams-signature" => Ok(MatchType::MsTeamsSignature),
            "ip-whitelist" => Ok(MatchType::IpWhitelist),
            other => Err(serde::de::Error::custom(format!(
                "unknown match type: {other}"
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HookFileError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("template render error: {0}")]
    Template(String),
    #[error("unsupported hook file extension: {0}")]
    UnsupportedExtension(String),
}

/// Parse a hook definitions file (JSON or YAML, chosen by extension), after
/// optional template preprocessing (spec §4.6 step 2).
pub fn parse_hooks_file(
    path: &std::path::Path,
    template_mode: bool,
) -> Result<Vec<Hook>, HookFileError> {
    let raw = std::fs::read_to_string(path)?;
    let rendered = if template_mode {
        crate::template::render(&raw).map_err(HookFileError::Template)?
    } else {
        raw
    };

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    match ext.as_str() {
        "json" => Ok(serde_json::from_str(&rendered)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(&rendered)?),
        other => Err(HookFileError::UnsupportedExtension(other.to_string())),
    }
}

/// Environment overlay helper used by the `getenv` template function (§6).
pub fn env_snapshot() -> HashMap<String, String> {
    std::env::vars().collect()
}
