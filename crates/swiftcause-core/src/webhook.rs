use crate::error::SwiftCauseError;
use chrono::{DateTime, Utc};
use ring::hmac;

pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verifies `Stripe-Signature: t=<unix>,v1=<hex>[,v1=<hex>...]` headers.
///
/// The signed message is `"{t}.{payload}"`, HMAC-SHA256 keyed with the endpoint secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    key: hmac::Key,
    tolerance_secs: i64,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

fn parse_header(header: &str) -> Result<SignatureHeader, SwiftCauseError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(value.parse::<i64>().map_err(|_| {
                    SwiftCauseError::InvalidSignature("timestamp is not an integer".to_string())
                })?)
            }
            // Undecodable candidates simply never match.
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| SwiftCauseError::InvalidSignature("missing timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(SwiftCauseError::InvalidSignature(
            "missing v1 signature".to_string(),
        ));
    }
    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

impl WebhookVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    pub fn with_tolerance_secs(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    pub fn verify(
        &self,
        payload: &[u8],
        header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), SwiftCauseError> {
        let header = header
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| SwiftCauseError::InvalidSignature("missing signature header".to_string()))?;
        let parsed = parse_header(header)?;

        let skew = now
            .timestamp()
            .checked_sub(parsed.timestamp)
            .map(i64::unsigned_abs);
        if !matches!(skew, Some(skew) if skew <= self.tolerance_secs.unsigned_abs()) {
            return Err(SwiftCauseError::InvalidSignature(
                "timestamp outside tolerance".to_string(),
            ));
        }

        let message = signed_message(parsed.timestamp, payload);
        // ring compares in constant time.
        if parsed
            .signatures
            .iter()
            .any(|sig| hmac::verify(&self.key, &message, sig).is_ok())
        {
            Ok(())
        } else {
            Err(SwiftCauseError::InvalidSignature(
                "no signature matches the payload".to_string(),
            ))
        }
    }

    /// Header value for `payload` signed at `timestamp`.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        let tag = hmac::sign(&self.key, &signed_message(timestamp, payload));
        format!("t={},v1={}", timestamp, hex::encode(tag.as_ref()))
    }
}

fn signed_message(timestamp: i64, payload: &[u8]) -> Vec<u8> {
    let mut message = format!("{timestamp}.").into_bytes();
    message.extend_from_slice(payload);
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = br#"{"type":"payment_intent.succeeded"}"#;

    #[test]
    fn accepts_own_signature() {
        let verifier = WebhookVerifier::new("whsec_test");
        let now = Utc::now();
        let header = verifier.sign(PAYLOAD, now.timestamp());
        assert!(verifier.verify(PAYLOAD, Some(&header), now).is_ok());
    }

    #[test]
    fn rejects_tampered_payload_and_wrong_secret() {
        let verifier = WebhookVerifier::new("whsec_test");
        let now = Utc::now();
        let header = verifier.sign(PAYLOAD, now.timestamp());
        assert!(verifier.verify(b"{}", Some(&header), now).is_err());

        let other = WebhookVerifier::new("whsec_other");
        assert!(other.verify(PAYLOAD, Some(&header), now).is_err());
    }

    #[test]
    fn rejects_stale_missing_and_malformed_headers() {
        let verifier = WebhookVerifier::new("whsec_test");
        let now = Utc::now();
        let stale = verifier.sign(PAYLOAD, now.timestamp() - 301);
        assert!(verifier.verify(PAYLOAD, Some(&stale), now).is_err());

        let extreme_low = format!("t={},v1=00", i64::MIN);
        let extreme_high = format!("t={},v1=00", i64::MAX);
        for header in [
            None,
            Some(""),
            Some("garbage"),
            Some("t=abc,v1=00"),
            Some("t=1"),
            Some(extreme_low.as_str()),
            Some(extreme_high.as_str()),
        ] {
            assert!(matches!(
                verifier.verify(PAYLOAD, header, now),
                Err(SwiftCauseError::InvalidSignature(_))
            ));
        }
    }

    #[test]
    fn any_matching_v1_candidate_is_enough() {
        let verifier = WebhookVerifier::new("whsec_test");
        let now = Utc::now();
        let good = verifier.sign(PAYLOAD, now.timestamp());
        let header = format!("t={},v1=deadbeef,v1=zz,{}", now.timestamp(), &good[good.find("v1=").unwrap()..]);
        assert!(verifier.verify(PAYLOAD, Some(&header), now).is_ok());
    }
}
