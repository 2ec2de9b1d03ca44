//! RFC 6238 time-based one-time passwords used for admin two-factor login.

use chrono::{DateTime, Utc};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use thiserror::Error;
use url::form_urlencoded;

pub const STEP_SECS: i64 = 30;
pub const DIGITS: usize = 6;
/// Number of neighbouring steps accepted on either side of the current one.
pub const DEFAULT_WINDOW: i64 = 2;
const SECRET_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TotpError {
    #[error("two-factor secret is not valid base32")]
    InvalidSecret,
}

/// Generates a fresh random secret encoded as unpadded base32.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut bytes);
    BASE32_NOPAD.encode(&bytes)
}

/// Decodes a base32 secret, tolerating lowercase, spaces and padding.
pub fn decode_secret(secret: &str) -> Result<Vec<u8>, TotpError> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|_| TotpError::InvalidSecret)
}

/// Computes the code for a raw key and counter (RFC 4226 dynamic truncation).
pub fn code_for_counter(key: &[u8], counter: u64) -> Result<String, TotpError> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(|_| TotpError::InvalidSecret)?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = usize::from(digest[digest.len() - 1] & 0x0f);
    let binary = (u32::from(digest[offset]) & 0x7f) << 24
        | u32::from(digest[offset + 1]) << 16
        | u32::from(digest[offset + 2]) << 8
        | u32::from(digest[offset + 3]);

    Ok(format!(
        "{:0width$}",
        binary % 10u32.pow(DIGITS as u32),
        width = DIGITS
    ))
}

/// Returns the code valid at `at` for the base32 `secret`.
pub fn code_at(secret: &str, at: DateTime<Utc>) -> Result<String, TotpError> {
    let key = decode_secret(secret)?;
    code_for_counter(&key, counter_at(at))
}

/// Checks `code` against every step within `window` of `now`.
pub fn verify(secret: &str, code: &str, now: DateTime<Utc>, window: i64) -> Result<bool, TotpError> {
    let key = decode_secret(secret)?;
    let code = code.trim();
    if code.len() != DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(false);
    }

    let current = counter_at(now) as i64;
    let mut matched = false;
    for step in (current - window)..=(current + window) {
        if step < 0 {
            continue;
        }
        let expected = code_for_counter(&key, step as u64)?;
        // Keep scanning after a hit so timing does not reveal which step matched.
        matched |= bool::from(expected.as_bytes().ct_eq(code.as_bytes()));
    }
    Ok(matched)
}

/// Builds the `otpauth://` URI understood by authenticator apps.
pub fn provisioning_uri(secret: &str, account: &str, issuer: &str) -> String {
    let label: String = form_urlencoded::byte_serialize(format!("{issuer}:{account}").as_bytes()).collect();
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("secret", secret)
        .append_pair("issuer", issuer)
        .append_pair("algorithm", "SHA1")
        .append_pair("digits", &DIGITS.to_string())
        .append_pair("period", &STEP_SECS.to_string())
        .finish();
    format!("otpauth://totp/{label}?{query}")
}

fn counter_at(at: DateTime<Utc>) -> u64 {
    (at.timestamp().max(0) / STEP_SECS) as u64
}
