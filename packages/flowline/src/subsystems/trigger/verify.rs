use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use flowline_types::VerificationFailureReason;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

/// Replay window for providers that sign a timestamp.
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Request details beyond the raw body, for the providers that sign more
/// than the body. Header names are matched case-insensitively; callers
/// lowercase the keys once on ingestion.
pub struct WebhookRequest<'a> {
    pub headers: &'a BTreeMap<String, String>,
    pub body: &'a [u8],
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
}

enum HmacAlgo {
    Sha1,
    Sha256,
}

enum Encoding {
    Hex,
    Base64,
}

/// How one provider family signs its deliveries.
enum Scheme {
    Slack,
    Stripe,
    Shopify,
    GitHub,
    HubSpot,
    /// Plain HMAC over the body in one header.
    HmacHeader {
        header: &'static str,
        algo: HmacAlgo,
        encoding: Encoding,
        prefix: Option<&'static str>,
    },
    /// Shared-secret equality in one header.
    SharedSecret { header: &'static str },
    /// `X-Signature` / `X-Hub-Signature-256`, hex HMAC-SHA256 over the
    /// body.
    Generic,
}

fn scheme_for(provider: &str) -> Option<Scheme> {
    use Encoding::*;
    use HmacAlgo::*;

    let scheme = match provider {
        "" => return None,
        "slack" => Scheme::Slack,
        "stripe" => Scheme::Stripe,
        "shopify" => Scheme::Shopify,
        "github" => Scheme::GitHub,
        "hubspot" => Scheme::HubSpot,
        "square" => Scheme::HmacHeader {
            header: "x-square-hmacsha256-signature",
            algo: Sha256,
            encoding: Base64,
            prefix: None,
        },
        "bigcommerce" => Scheme::HmacHeader {
            header: "x-bc-signature",
            algo: Sha256,
            encoding: Hex,
            prefix: None,
        },
        "calendly" => Scheme::HmacHeader {
            header: "calendly-webhook-signature",
            algo: Sha256,
            encoding: Hex,
            prefix: None,
        },
        "iterable" => Scheme::HmacHeader {
            header: "x-iterable-signature",
            algo: Sha256,
            encoding: Hex,
            prefix: None,
        },
        "braze" => Scheme::HmacHeader {
            header: "x-braze-signature",
            algo: Sha256,
            encoding: Hex,
            prefix: None,
        },
        "docusign" => Scheme::HmacHeader {
            header: "x-docusign-signature-1",
            algo: Sha256,
            encoding: Base64,
            prefix: None,
        },
        "adobesign" => Scheme::HmacHeader {
            header: "x-adobesign-signature",
            algo: Sha256,
            encoding: Hex,
            prefix: None,
        },
        "hellosign" => Scheme::HmacHeader {
            header: "x-hellosign-signature",
            algo: Sha256,
            encoding: Hex,
            prefix: None,
        },
        "calcom" | "cal.com" => Scheme::HmacHeader {
            header: "x-cal-signature-256",
            algo: Sha256,
            encoding: Hex,
            prefix: None,
        },
        "webex" => Scheme::HmacHeader {
            header: "x-spark-signature",
            algo: Sha1,
            encoding: Hex,
            prefix: None,
        },
        "marketo" => Scheme::HmacHeader {
            header: "x-marketo-signature",
            algo: Sha1,
            encoding: Hex,
            prefix: None,
        },
        "surveymonkey" => Scheme::HmacHeader {
            header: "sm-signature",
            algo: Sha1,
            encoding: Base64,
            prefix: None,
        },
        "gitlab" => Scheme::SharedSecret {
            header: "x-gitlab-token",
        },
        "jira" => Scheme::SharedSecret {
            header: "x-atlassian-token",
        },
        "ringcentral" => Scheme::SharedSecret {
            header: "validation-token",
        },
        _ => Scheme::Generic,
    };
    Some(scheme)
}

/// Verifies one delivery against the provider family's signature
/// contract. All verifiers run over the raw request body; every
/// comparison is constant-time; the error says why verification failed
/// but the HTTP layer never lets that distinguish whether a secret
/// exists.
pub fn verify(
    provider: &str,
    secret: &str,
    request: &WebhookRequest<'_>,
    now_unix: i64,
) -> Result<(), VerificationFailureReason> {
    use VerificationFailureReason::*;

    if secret.is_empty() {
        return Err(MissingSecret);
    }
    let Some(scheme) = scheme_for(provider) else {
        return Err(ProviderNotRegistered);
    };

    match scheme {
        Scheme::Slack => {
            let signature = header(request, "x-slack-signature").ok_or(MissingSignature)?;
            let timestamp = header(request, "x-slack-request-timestamp")
                .ok_or(MissingTimestamp)?
                .parse::<i64>()
                .map_err(|_| InvalidSignatureFormat)?;
            if (now_unix - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
                return Err(TimestampOutOfTolerance);
            }

            let mut base = format!("v0:{}:", timestamp).into_bytes();
            base.extend_from_slice(request.body);
            let expected = format!("v0={}", hex_hmac_sha256(secret, &base));
            constant_time_eq_str(&expected, signature)
        }
        Scheme::Stripe => {
            let header_value = header(request, "stripe-signature").ok_or(MissingSignature)?;
            let (timestamp, v1) = parse_stripe_header(header_value)?;
            if (now_unix - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
                return Err(TimestampOutOfTolerance);
            }

            let mut base = format!("{}.", timestamp).into_bytes();
            base.extend_from_slice(request.body);
            constant_time_eq_str(&hex_hmac_sha256(secret, &base), v1)
        }
        Scheme::Shopify => {
            let signature = header(request, "x-shopify-hmac-sha256").ok_or(MissingSignature)?;
            let expected = B64.encode(raw_hmac_sha256(secret, request.body));
            constant_time_eq_str(&expected, signature)
        }
        Scheme::GitHub => {
            let signature = header(request, "x-hub-signature-256").ok_or(MissingSignature)?;
            let payload = signature
                .strip_prefix("sha256=")
                .ok_or(InvalidSignatureFormat)?;
            constant_time_eq_str(&hex_hmac_sha256(secret, request.body), payload)
        }
        Scheme::HubSpot => {
            let signature = header(request, "x-hubspot-signature").ok_or(MissingSignature)?;
            let timestamp =
                header(request, "x-hubspot-request-timestamp").ok_or(MissingTimestamp)?;

            let mut base = format!(
                "{}https://{}{}",
                request.method.to_ascii_uppercase(),
                request.host,
                request.path
            )
            .into_bytes();
            base.extend_from_slice(request.body);
            base.extend_from_slice(timestamp.as_bytes());
            constant_time_eq_str(&hex_hmac_sha256(secret, &base), signature)
        }
        Scheme::HmacHeader {
            header: name,
            algo,
            encoding,
            prefix,
        } => {
            let mut signature = header(request, name).ok_or(MissingSignature)?;
            if let Some(prefix) = prefix {
                signature = signature.strip_prefix(prefix).ok_or(InvalidSignatureFormat)?;
            }

            let digest = match algo {
                HmacAlgo::Sha256 => raw_hmac_sha256(secret, request.body),
                HmacAlgo::Sha1 => raw_hmac_sha1(secret, request.body),
            };
            let expected = match encoding {
                Encoding::Hex => const_hex::encode(&digest),
                Encoding::Base64 => B64.encode(&digest),
            };
            constant_time_eq_str(&expected, signature)
        }
        Scheme::SharedSecret { header: name } => {
            let presented = header(request, name).ok_or(MissingSignature)?;
            constant_time_eq_str(secret, presented)
        }
        Scheme::Generic => {
            let signature = header(request, "x-signature")
                .or_else(|| header(request, "x-hub-signature-256"))
                .ok_or(MissingSignature)?;
            let payload = signature.strip_prefix("sha256=").unwrap_or(signature);
            constant_time_eq_str(&hex_hmac_sha256(secret, request.body), payload)
        }
    }
}

fn header<'a>(request: &'a WebhookRequest<'_>, name: &str) -> Option<&'a str> {
    request.headers.get(name).map(String::as_str)
}

fn parse_stripe_header(value: &str) -> Result<(i64, &str), VerificationFailureReason> {
    let mut timestamp = None;
    let mut v1 = None;
    for part in value.split(',') {
        match part.trim().split_once('=') {
            Some(("t", t)) => timestamp = t.parse::<i64>().ok(),
            Some(("v1", sig)) => v1 = Some(sig),
            _ => {}
        }
    }
    match (timestamp, v1) {
        (Some(timestamp), Some(v1)) => Ok((timestamp, v1)),
        _ => Err(VerificationFailureReason::InvalidSignatureFormat),
    }
}

fn raw_hmac_sha256(secret: &str, payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

fn raw_hmac_sha1(secret: &str, payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(secret: &str, payload: &[u8]) -> String {
    const_hex::encode(raw_hmac_sha256(secret, payload))
}

fn constant_time_eq_str(expected: &str, presented: &str) -> Result<(), VerificationFailureReason> {
    if bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) {
        Ok(())
    } else {
        Err(VerificationFailureReason::SignatureMismatch)
    }
}

/// Signature emitters matching each verifier, used to exercise trigger
/// registrations end-to-end.
#[cfg(any(test, feature = "test-utils"))]
pub mod emit {
    use super::*;

    pub fn slack(secret: &str, timestamp: i64, body: &[u8]) -> (String, String) {
        let mut base = format!("v0:{}:", timestamp).into_bytes();
        base.extend_from_slice(body);
        (
            format!("v0={}", hex_hmac_sha256(secret, &base)),
            timestamp.to_string(),
        )
    }

    pub fn stripe(secret: &str, timestamp: i64, body: &[u8]) -> String {
        let mut base = format!("{}.", timestamp).into_bytes();
        base.extend_from_slice(body);
        format!("t={},v1={}", timestamp, hex_hmac_sha256(secret, &base))
    }

    pub fn shopify(secret: &str, body: &[u8]) -> String {
        B64.encode(raw_hmac_sha256(secret, body))
    }

    pub fn github(secret: &str, body: &[u8]) -> String {
        format!("sha256={}", hex_hmac_sha256(secret, body))
    }

    pub fn hubspot(secret: &str, method: &str, host: &str, path: &str, body: &[u8], timestamp: &str) -> String {
        let mut base = format!("{}https://{}{}", method.to_ascii_uppercase(), host, path).into_bytes();
        base.extend_from_slice(body);
        base.extend_from_slice(timestamp.as_bytes());
        hex_hmac_sha256(secret, &base)
    }

    pub fn generic(secret: &str, body: &[u8]) -> String {
        hex_hmac_sha256(secret, body)
    }
}
