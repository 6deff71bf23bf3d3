//! Request signature verification
//!
//! Signatures are `v0=` followed by the hex HMAC-SHA256 of
//! `v0:{timestamp}:{raw body}` under the signing secret. The raw body is
//! used as received; re-serializing it would change the signed bytes.

use hg_common::{HookgateError, InboundRequest, SecretString};
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;

pub const SIGNATURE_HEADER: &str = "x-slack-signature";
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
pub const SIGNATURE_VERSION: &str = "v0";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

type HmacSha256 = Hmac<Sha256>;

/// Outcome of verifying one inbound request
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationResult {
    /// Authentic and fresh; carries the parsed body
    Valid(Value),
    InvalidSignature,
    MissingHeaders,
    StaleTimestamp,
}

impl VerificationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerificationResult::Valid(_))
    }

    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            VerificationResult::Valid(_) => "valid",
            VerificationResult::InvalidSignature => "invalid_signature",
            VerificationResult::MissingHeaders => "missing_headers",
            VerificationResult::StaleTimestamp => "stale_timestamp",
        }
    }

    /// Authentication error for a rejected request, `None` when valid
    pub fn into_error(self) -> Option<HookgateError> {
        match self {
            VerificationResult::Valid(_) => None,
            failure => Some(HookgateError::Authentication(failure.label().to_string())),
        }
    }
}

pub struct SignatureVerifier {
    secret: SecretString,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: SecretString, tolerance: Duration) -> Self {
        Self { secret, tolerance }
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Verify authenticity and freshness of a request.
    ///
    /// Freshness is measured against the request's arrival time. A stale
    /// timestamp is rejected even when the signature matches.
    pub fn verify(&self, request: &InboundRequest) -> VerificationResult {
        let (timestamp, provided) = match (
            non_empty(request.header(TIMESTAMP_HEADER)),
            non_empty(request.header(SIGNATURE_HEADER)),
        ) {
            (Some(ts), Some(sig)) => (ts, sig),
            _ => return VerificationResult::MissingHeaders,
        };

        let Ok(sent_at) = timestamp.trim().parse::<i64>() else {
            return VerificationResult::MissingHeaders;
        };

        let skew = request
            .received_at()
            .timestamp()
            .saturating_sub(sent_at)
            .saturating_abs();
        if skew as u64 > self.tolerance.as_secs() {
            return VerificationResult::StaleTimestamp;
        }

        let expected = compute_signature(self.secret.expose_secret(), timestamp, request.body());
        if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            return VerificationResult::InvalidSignature;
        }

        VerificationResult::Valid(parse_body(
            request.header("content-type"),
            request.body(),
        ))
    }
}

/// Compute the `v0=<hex>` signature header value for a body
pub fn compute_signature(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");

    mac.update(SIGNATURE_VERSION.as_bytes());
    mac.update(b":");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);

    format!(
        "{}={}",
        SIGNATURE_VERSION,
        hex::encode(mac.finalize().into_bytes())
    )
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Compare without an early exit on either content or length
fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut padded = vec![0u8; expected.len()];
    let n = provided.len().min(expected.len());
    padded[..n].copy_from_slice(&provided[..n]);

    let same_len = (expected.len() as u64).ct_eq(&(provided.len() as u64));
    (padded.as_slice().ct_eq(expected) & same_len).into()
}

/// Parse a verified body by content type.
///
/// Form bodies become a JSON object of their fields; an interactive `payload`
/// field holding JSON is expanded in place. Bodies that are not JSON are kept
/// as a string.
pub fn parse_body(content_type: Option<&str>, body: &[u8]) -> Value {
    let is_form = content_type
        .map(|ct| ct.to_ascii_lowercase().starts_with(FORM_CONTENT_TYPE))
        .unwrap_or(false);

    if is_form {
        if let Ok(fields) = serde_urlencoded::from_bytes::<Vec<(String, String)>>(body) {
            let mut object = Map::new();
            for (name, value) in fields {
                let parsed = if name == "payload" {
                    serde_json::from_str(&value).unwrap_or(Value::String(value))
                } else {
                    Value::String(value)
                };
                object.insert(name, parsed);
            }
            return Value::Object(object);
        }
    }

    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};

    fn request(
        body: &'static str,
        headers: Vec<(&'static str, String)>,
        received_at: DateTime<Utc>,
    ) -> InboundRequest {
        InboundRequest::new(body.as_bytes().to_vec(), headers, received_at)
    }

    const SECRET: &str = "s3cr3t";

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(SecretString::new(SECRET), Duration::from_secs(300))
    }

    fn signed_headers(timestamp: i64, body: &str) -> Vec<(&'static str, String)> {
        let ts = timestamp.to_string();
        vec![
            ("X-Slack-Request-Timestamp", ts.clone()),
            ("X-Slack-Signature", compute_signature(SECRET, &ts, body.as_bytes())),
            ("Content-Type", "application/json".to_string()),
        ]
    }

    #[test]
    fn test_valid_signature() {
        let now = Utc::now();
        let req = request(r#"{"a":1}"#, signed_headers(now.timestamp(), r#"{"a":1}"#), now);

        match verifier().verify(&req) {
            VerificationResult::Valid(body) => assert_eq!(body["a"], 1),
            other => panic!("expected Valid, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_timestamp_even_with_valid_signature() {
        let now = Utc::now();
        let sent = (now - ChronoDuration::seconds(400)).timestamp();
        let req = request(r#"{"a":1}"#, signed_headers(sent, r#"{"a":1}"#), now);
        assert_eq!(verifier().verify(&req), VerificationResult::StaleTimestamp);
    }

    #[test]
    fn test_future_timestamp_is_stale() {
        let now = Utc::now();
        let sent = (now + ChronoDuration::seconds(400)).timestamp();
        let req = request(r#"{"a":1}"#, signed_headers(sent, r#"{"a":1}"#), now);
        assert_eq!(verifier().verify(&req), VerificationResult::StaleTimestamp);
    }

    #[test]
    fn test_within_tolerance_edge() {
        let now = Utc::now();
        let sent = (now - ChronoDuration::seconds(300)).timestamp();
        let req = request(r#"{"a":1}"#, signed_headers(sent, r#"{"a":1}"#), now);
        assert!(verifier().verify(&req).is_valid());
    }

    #[test]
    fn test_tampered_body() {
        let now = Utc::now();
        let req = request(r#"{"a":2}"#, signed_headers(now.timestamp(), r#"{"a":1}"#), now);
        assert_eq!(verifier().verify(&req), VerificationResult::InvalidSignature);
    }

    #[test]
    fn test_wrong_secret() {
        let now = Utc::now();
        let ts = now.timestamp().to_string();
        let headers = vec![
            ("X-Slack-Request-Timestamp", ts.clone()),
            ("X-Slack-Signature", compute_signature("other", &ts, b"{}")),
        ];
        let req = request("{}", headers, now);
        assert_eq!(verifier().verify(&req), VerificationResult::InvalidSignature);
    }

    #[test]
    fn test_truncated_signature_is_invalid() {
        let now = Utc::now();
        let ts = now.timestamp().to_string();
        let mut sig = compute_signature(SECRET, &ts, b"{}");
        sig.truncate(20);
        let headers = vec![("X-Slack-Request-Timestamp", ts), ("X-Slack-Signature", sig)];
        let req = request("{}", headers, now);
        assert_eq!(verifier().verify(&req), VerificationResult::InvalidSignature);
    }

    #[test]
    fn test_missing_headers() {
        let now = Utc::now();
        let ts = now.timestamp().to_string();

        let req = request("{}", vec![("X-Slack-Request-Timestamp", ts)], now);
        assert_eq!(verifier().verify(&req), VerificationResult::MissingHeaders);

        let req = request("{}", vec![("X-Slack-Signature", "v0=abc".to_string())], now);
        assert_eq!(verifier().verify(&req), VerificationResult::MissingHeaders);
    }

    #[test]
    fn test_unparseable_timestamp() {
        let now = Utc::now();
        let headers = vec![
            ("X-Slack-Request-Timestamp", "yesterday".to_string()),
            ("X-Slack-Signature", "v0=abc".to_string()),
        ];
        let req = request("{}", headers, now);
        assert_eq!(verifier().verify(&req), VerificationResult::MissingHeaders);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"v0=abc", b"v0=abc"));
        assert!(!constant_time_eq(b"v0=abc", b"v0=abd"));
        assert!(!constant_time_eq(b"v0=abc", b"v0=ab"));
        assert!(!constant_time_eq(b"v0=abc", b"v0=abcd"));
        assert!(!constant_time_eq(b"v0=abc", b""));
    }

    #[test]
    fn test_parse_form_body_with_payload() {
        let body = b"payload=%7B%22type%22%3A%22block_actions%22%7D";
        let parsed = parse_body(Some("application/x-www-form-urlencoded"), body);
        assert_eq!(parsed["payload"]["type"], "block_actions");

        let parsed = parse_body(
            Some("application/x-www-form-urlencoded; charset=utf-8"),
            b"command=%2Fecho&text=hi+there",
        );
        assert_eq!(parsed["command"], "/echo");
        assert_eq!(parsed["text"], "hi there");
    }

    #[test]
    fn test_failure_maps_to_authentication_error() {
        let err = VerificationResult::StaleTimestamp.into_error().unwrap();
        assert!(matches!(err, HookgateError::Authentication(ref r) if r == "stale_timestamp"));
        assert!(!err.is_retryable());
        assert!(VerificationResult::Valid(Value::Null).into_error().is_none());
    }

    #[test]
    fn test_parse_non_json_body_as_string() {
        let parsed = parse_body(Some("text/plain"), b"not json");
        assert_eq!(parsed, Value::String("not json".to_string()));
    }
}
