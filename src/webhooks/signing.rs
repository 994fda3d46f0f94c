//! HMAC-SHA256 signing for webhook deliveries.
//!
//! Deliveries for webhooks with a configured secret carry an
//! `X-Signature: hex(HMAC-SHA256(secret, body))` header so consumers can
//! authenticate the payload.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix for generated webhook secrets
pub const SECRET_PREFIX: &str = "whsec_";

/// Generate a new webhook secret.
///
/// Returns a `whsec_` prefixed base64-encoded 32-byte random secret.
pub fn generate_secret() -> String {
    use rand::RngCore;

    let mut secret_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret_bytes);

    format!("{}{}", SECRET_PREFIX, BASE64_STANDARD.encode(secret_bytes))
}

/// Sign a delivery body with the webhook secret.
///
/// The secret is used verbatim as the HMAC key, so consumers verify with the
/// exact secret string they were shown at creation time.
pub fn sign_body(secret: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body.as_bytes());
    let signature = mac.finalize().into_bytes();

    let mut hex = String::with_capacity(signature.len() * 2);
    for byte in signature {
        use std::fmt::Write;
        write!(hex, "{byte:02x}").expect("writing to String cannot fail");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_secret() {
        let secret = generate_secret();
        assert!(secret.starts_with(SECRET_PREFIX));
        assert_ne!(generate_secret(), secret);
    }

    #[test]
    fn test_sign_body_deterministic() {
        let secret = "whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw";
        let body = r#"{"type":"batch.completed","data":{}}"#;

        let sig1 = sign_body(secret, body);
        let sig2 = sign_body(secret, body);
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_varies_with_secret_and_body() {
        let body = r#"{"test": 1}"#;
        assert_ne!(sign_body("whsec_a", body), sign_body("whsec_b", body));
        assert_ne!(
            sign_body("whsec_a", body),
            sign_body("whsec_a", r#"{"test": 2}"#)
        );
    }
}
