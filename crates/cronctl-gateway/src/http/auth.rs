//! Shared-secret check for runner requests.
//!
//! Both sides are run through HMAC-SHA256 over a fixed label and compared
//! with `verify_slice`, so the comparison time does not depend on how many
//! leading bytes match.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const LABEL: &[u8] = b"cronctl-runner-secret";

/// Returns a refusal message when `provided` does not match `expected`.
/// With no configured secret every request is refused.
pub fn verify_secret(expected: Option<&str>, provided: Option<&str>) -> Result<(), &'static str> {
    let expected = expected
        .filter(|s| !s.is_empty())
        .ok_or("no runner secret configured")?;
    let provided = provided
        .filter(|s| !s.is_empty())
        .ok_or("secret is required")?;

    let expected_tag = tag(expected)?.finalize().into_bytes();
    tag(provided)?
        .verify_slice(&expected_tag)
        .map_err(|_| "secret mismatch")
}

fn tag(key: &str) -> Result<HmacSha256, &'static str> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| "invalid secret")?;
    mac.update(LABEL);
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_secret_passes() {
        assert!(verify_secret(Some("abc"), Some("abc")).is_ok());
    }

    #[test]
    fn mismatch_and_missing_are_refused() {
        assert_eq!(
            verify_secret(Some("abc"), Some("abd")),
            Err("secret mismatch")
        );
        assert_eq!(verify_secret(Some("abc"), None), Err("secret is required"));
        assert_eq!(verify_secret(Some("abc"), Some("")), Err("secret is required"));
    }

    #[test]
    fn unconfigured_secret_refuses_everything() {
        assert!(verify_secret(None, Some("anything")).is_err());
        assert!(verify_secret(Some(""), Some("")).is_err());
    }
}
