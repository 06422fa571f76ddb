//! HMAC-SHA256 request signing.
//!
//! The signature is the lowercase hex HMAC-SHA256 of the raw request body
//! keyed with the subscription secret, sent as `X-Webhook-Signature`.

use courier_core::Secret;
use hmac::{digest::InvalidLength, Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Number of random bytes in a subscription secret.
pub const SECRET_BYTES: usize = 32;

/// Generates a new secret from the thread-local CSPRNG.
pub fn generate_secret() -> Secret {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    Secret::new(hex::encode(bytes))
}

/// Signs `body` with `secret`, returning lowercase hex.
///
/// # Errors
///
/// Returns `DeliveryError::ConfigurationError` if the secret is rejected
/// as an HMAC key.
pub fn sign(secret: &Secret, body: &[u8]) -> Result<String> {
    let mac = mac(secret, body)
        .map_err(|e| DeliveryError::configuration(format!("invalid signing secret: {e}")))?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a hex signature against `body` in constant time.
pub fn verify_signature(body: &[u8], signature: &str, secret: &Secret) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    mac(secret, body).is_ok_and(|mac| mac.verify_slice(&expected).is_ok())
}

fn mac(secret: &Secret, body: &[u8]) -> std::result::Result<HmacSha256, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.expose().as_bytes())?;
    mac.update(body);
    Ok(mac)
}
