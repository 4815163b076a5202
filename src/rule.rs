//! Recursive trigger-rule evaluator (component D): walks the Boolean tree
//! defined in [`crate::hook::TriggerRule`] depth-first against a
//! [`ParsedRequest`], short-circuiting `And`/`Or` the way a predicate tree
//! should.

use crate::hook::{ArgumentSource, MatchRule, MatchType, ParamRef, TriggerRule};
use crate::param::{self, ParameterNodeError, Value};
use crate::regexcache;
use crate::request::ParsedRequest;
use crate::signature::{self, HmacAlgo, SignatureError};
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RuleError {
    #[error(transparent)]
    Parameter(#[from] ParameterNodeError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Regex(#[from] regexcache::RegexCompileError),
    #[error("match type {0:?} requires a parameter but one was not found")]
    MissingSignatureParameter(MatchType),
}

/// Evaluate `rule` against `req`. A `true`/`false` result with no error is the
/// common case; [`RuleError::Parameter`] is surfaced distinctly so callers can
/// log-and-treat-as-mismatch instead of 500ing (spec §4.4, §7).
pub fn evaluate(rule: &TriggerRule, req: &ParsedRequest) -> Result<bool, RuleError> {
    match rule {
        TriggerRule::And(children) => {
            for child in children {
                match evaluate(child, req) {
                    Ok(false) => return Ok(false),
                    Ok(true) => continue,
                    Err(RuleError::Signature(_)) if req.allow_signature_errors => return Ok(false),
                    Err(e) => return Err(e),
                }
            }
            Ok(true)
        }
        TriggerRule::Or(children) => {
            let mut saw_error = None;
            for child in children {
                match evaluate(child, req) {
                    Ok(true) => return Ok(true),
                    Ok(false) => continue,
                    Err(RuleError::Signature(_)) if req.allow_signature_errors => continue,
                    Err(e) => saw_error = Some(e),
                }
            }
            match saw_error {
                Some(e) => Err(e),
                None => Ok(false),
            }
        }
        TriggerRule::Not(child) => evaluate(child, req).map(|m| !m),
        TriggerRule::Match(m) => evaluate_match(m, req),
    }
}

fn resolve(param: &ParamRef, req: &ParsedRequest) -> Result<Option<String>, ParameterNodeError> {
    match param.source {
        ArgumentSource::Header => Ok(req.header(&param.name).map(str::to_string)),
        ArgumentSource::Url => match param::extract_string(&param.name, &req.query) {
            Ok(v) => Ok(Some(v)),
            Err(_) => Ok(None),
        },
        ArgumentSource::Payload => match param::extract_string(&param.name, &req.payload) {
            Ok(v) => Ok(Some(v)),
            Err(_) => Ok(None),
        },
        ArgumentSource::String => Ok(Some(param.name.clone())),
        ArgumentSource::Request => Ok(req.pseudo_field(&param.name).map(str::to_string)),
        ArgumentSource::EntirePayload => Ok(Some(req.payload.stringify())),
        ArgumentSource::EntireQuery => Ok(Some(req.query.stringify())),
        ArgumentSource::EntireHeaders => Ok(Some(req.entire_headers().stringify())),
        ArgumentSource::RawRequestBody => {
            Ok(Some(String::from_utf8_lossy(&req.body).into_owned()))
        }
    }
}

fn is_simple(match_type: MatchType) -> bool {
    matches!(match_type, MatchType::Value | MatchType::Regex)
}

fn evaluate_match(m: &MatchRule, req: &ParsedRequest) -> Result<bool, RuleError> {
    if m.match_type == MatchType::IpWhitelist {
        let remote = req.pseudo_field("remote-addr").unwrap_or_default();
        let rule = m
            .ip_range
            .as_deref()
            .or(m.value.as_deref())
            .unwrap_or_default();
        return Ok(signature::ip_in_whitelist(rule, remote)?);
    }

    let value = resolve(&m.parameter, req)?;

    match m.match_type {
        MatchType::Value => {
            let actual = match value {
                Some(v) => v,
                None => return Ok(false),
            };
            let expected = m.value.as_deref().unwrap_or_default();
            Ok(ct_str_eq(&actual, expected))
        }
        MatchType::Regex => {
            let actual = match value {
                Some(v) => v,
                None => return Ok(false),
            };
            let pattern = m.regex.as_deref().unwrap_or_default();
            let re = regexcache::get(pattern)?;
            Ok(re.is_match(&actual))
        }
        MatchType::PayloadHmacSha1 | MatchType::PayloadHmacSha256 | MatchType::PayloadHmacSha512 => {
            let signature_value = value.ok_or(RuleError::MissingSignatureParameter(m.match_type))?;
            let algo = match m.match_type {
                MatchType::PayloadHmacSha1 => HmacAlgo::Sha1,
                MatchType::PayloadHmacSha256 => HmacAlgo::Sha256,
                MatchType::PayloadHmacSha512 => HmacAlgo::Sha512,
                _ => unreachable!(),
            };
            let secret = m.secret.as_deref().unwrap_or_default();
            let (_, res) = signature::verify_hmac(algo, secret.as_bytes(), &req.body, &signature_value);
            match res {
                Ok(()) => Ok(true),
                Err(e) => Err(RuleError::Signature(e)),
            }
        }
        MatchType::ScalrSignature => {
            let signature_value = value.ok_or(RuleError::MissingSignatureParameter(m.match_type))?;
            let secret = m.secret.as_deref().unwrap_or_default();
            let (_, res) = signature::verify_scalr(
                secret.as_bytes(),
                &req.body,
                req.header("date"),
                &signature_value,
            );
            match res {
                Ok(()) => Ok(true),
                Err(e) => Err(RuleError::Signature(e)),
            }
        }
        MatchType::MsTeamsSignature => {
            let secret = m.secret.as_deref().unwrap_or_default();
            match signature::verify_ms_teams(secret.as_bytes(), &req.body, req.header("authorization")) {
                Ok(()) => Ok(true),
                Err(e) => Err(RuleError::Signature(e)),
            }
        }
        MatchType::IpWhitelist => unreachable!("handled above"),
    }
}

fn ct_str_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}
