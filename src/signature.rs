//! Signature primitives (component B): HMAC-SHA1/256/512, the Scalr and MS
//! Teams bespoke schemes, and CIDR whitelist membership.
//!
//! Grounded in the teacher's `lib.rs`/`router.rs` HMAC-over-hex-signature check
//! (`extract_hmac`/`check_hmac`), generalized to multiple algorithms, candidate
//! lists, and a constant-time comparison made explicit via `subtle`.

use hmac::{Hmac, Mac};
use ipnetwork::IpNetwork;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use std::net::IpAddr;
use std::str::FromStr;
use subtle::ConstantTimeEq;
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime, PrimitiveDateTime};

// time crate has no well-known format matching the RFC-1123 `Date` header
// HTTP actually sends (literal "GMT", not well_known::Rfc2822's numeric
// offset) — see src/logging.rs's CLF_TIME_FORMAT for the same gap.
const RFC1123_DATE_FORMAT: &[FormatItem] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

#[derive(Debug, Clone, thiserror::Error)]
pub enum SignatureError {
    #[error("secret is empty")]
    EmptySecret,
    #[error("signature mismatch{}", if *.empty_payload { " (empty payload)" } else { "" })]
    Mismatch { empty_payload: bool },
    #[error("malformed signature value")]
    Malformed,
    #[error("missing header: {0}")]
    MissingHeader(String),
    #[error("date header stale or malformed")]
    StaleOrMalformedDate,
    #[error("invalid CIDR or IP: {0}")]
    InvalidNetwork(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacAlgo {
    Sha1,
    Sha256,
    Sha512,
}

impl HmacAlgo {
    fn compute_hex(self, secret: &[u8], body: &[u8]) -> Result<String, SignatureError> {
        if secret.is_empty() {
            return Err(SignatureError::EmptySecret);
        }
        let hex = match self {
            HmacAlgo::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(secret).expect("any key length");
                mac.update(body);
                hex::encode(mac.finalize().into_bytes())
            }
            HmacAlgo::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("any key length");
                mac.update(body);
                hex::encode(mac.finalize().into_bytes())
            }
            HmacAlgo::Sha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(secret).expect("any key length");
                mac.update(body);
                hex::encode(mac.finalize().into_bytes())
            }
        };
        Ok(hex)
    }
}

/// Constant-time equality over two byte slices, used for every candidate
/// comparison so that no early-exit timing distinguishes "close" from "far".
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Verify a `payload-hmac-*` style value against `body` under `secret`.
///
/// `value` may carry an optional `algo=` prefix (ignored — the algorithm is
/// already pinned by `algo`) and a comma-separated list of candidate hex
/// digests, as GitHub/GitLab-style webhooks send (`sha1=<hex>` or a bare hex
/// string). Returns the locally computed MAC alongside the result so callers
/// can log it without ever logging the caller-supplied value.
pub fn verify_hmac(
    algo: HmacAlgo,
    secret: &[u8],
    body: &[u8],
    value: &str,
) -> (String, Result<(), SignatureError>) {
    let computed = match algo.compute_hex(secret, body) {
        Ok(hex) => hex,
        Err(e) => return (String::new(), Err(e)),
    };
    let candidates = split_candidates(value);
    if candidates.is_empty() {
        return (computed, Err(SignatureError::Malformed));
    }
    let matched = candidates
        .iter()
        .any(|candidate| ct_eq(candidate.as_bytes(), computed.as_bytes()));
    if matched {
        (computed, Ok(()))
    } else {
        (
            computed,
            Err(SignatureError::Mismatch {
                empty_payload: body.is_empty(),
            }),
        )
    }
}

/// Split a signature header value into candidate hex digests: entries are
/// comma-separated and each may carry an `algo=` prefix which is stripped.
fn split_candidates(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.split_once('=') {
            Some((_, hex)) => hex.trim().to_string(),
            None => s.to_string(),
        })
        .collect()
}

/// `scalr-signature`: `HMAC-SHA1(secret, date_header + body)`, with the `Date`
/// header required to be within 5 minutes of now.
pub fn verify_scalr(
    secret: &[u8],
    body: &[u8],
    date_header: Option<&str>,
    signature_value: &str,
) -> (String, Result<(), SignatureError>) {
    let date_header = match date_header {
        Some(d) => d,
        None => return (String::new(), Err(SignatureError::MissingHeader("Date".into()))),
    };
    let parsed = match PrimitiveDateTime::parse(date_header, RFC1123_DATE_FORMAT) {
        Ok(d) => d.assume_utc(),
        Err(_) => return (String::new(), Err(SignatureError::StaleOrMalformedDate)),
    };
    let now = crate::clock::now();
    let delta = (now - parsed).whole_seconds().abs();
    if delta > 300 {
        return (String::new(), Err(SignatureError::StaleOrMalformedDate));
    }
    let mut signed = date_header.as_bytes().to_vec();
    signed.extend_from_slice(body);
    verify_hmac(HmacAlgo::Sha1, secret, &signed, signature_value)
}

/// `ms-teams-signature`: `Authorization: HMAC <base64(HMAC-SHA256(base64_decode(secret), body))>`.
pub fn verify_ms_teams(
    secret_b64: &[u8],
    body: &[u8],
    authorization_header: Option<&str>,
) -> Result<(), SignatureError> {
    let header = authorization_header.ok_or_else(|| SignatureError::MissingHeader("Authorization".into()))?;
    let claimed_b64 = header
        .strip_prefix("HMAC ")
        .ok_or(SignatureError::Malformed)?;
    let secret = base64::decode(secret_b64).map_err(|_| SignatureError::Malformed)?;
    if secret.is_empty() {
        return Err(SignatureError::EmptySecret);
    }
    let mut mac = Hmac::<Sha256>::new_from_slice(&secret).expect("hmac accepts any key length");
    mac.update(body);
    let expected_b64 = base64::encode(mac.finalize().into_bytes());
    if ct_eq(claimed_b64.as_bytes(), expected_b64.as_bytes()) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch {
            empty_payload: body.is_empty(),
        })
    }
}

/// `ip-whitelist`: `rule` is a space-separated list of IPs or CIDR blocks.
pub fn ip_in_whitelist(rule: &str, remote_addr: &str) -> Result<bool, SignatureError> {
    let addr = strip_port_and_brackets(remote_addr.trim());
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| SignatureError::InvalidNetwork(addr.to_string()))?;

    let mut networks = Vec::new();
    for token in rule.split_whitespace() {
        let net = if token.contains('/') {
            IpNetwork::from_str(token).map_err(|_| SignatureError::InvalidNetwork(token.to_string()))?
        } else {
            let host: IpAddr = token
                .parse()
                .map_err(|_| SignatureError::InvalidNetwork(token.to_string()))?;
            match host {
                IpAddr::V4(v4) => IpNetwork::V4(ipnetwork::Ipv4Network::from(v4)),
                IpAddr::V6(v6) => IpNetwork::V6(ipnetwork::Ipv6Network::from(v6)),
            }
        };
        networks.push(net);
    }
    Ok(networks.iter().any(|n| n.contains(ip)))
}

fn strip_port_and_brackets(addr: &str) -> &str {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match addr.rsplit_once(':') {
        // only treat as host:port when there is exactly one colon (avoid
        // truncating bare IPv6 literals without brackets)
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.contains(':') => host,
        _ => addr,
    }
}
