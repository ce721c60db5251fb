#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use courier_domain::UserId;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

/// Token claims: the authenticated user and an expiry (Unix seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
	#[error("invalid token format")]
	Malformed,
	#[error("invalid token signature")]
	BadSignature,
	#[error("token expired")]
	Expired,
	#[error("invalid token claims")]
	BadClaims,
}

/// Verify a `v1.<payload>.<sig>` bearer token and extract the user id.
pub fn verify_hmac_token(token: &str, secret: &str) -> Result<UserId, AuthError> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(AuthError::Malformed);
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| AuthError::Malformed)?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| AuthError::Malformed)?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::BadSignature);
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).map_err(|_| AuthError::BadClaims)?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(AuthError::Expired);
	}

	UserId::new(claims.sub).map_err(|_| AuthError::BadClaims)
}

/// Mint a token for the given user; used by tests and operator tooling.
pub fn issue_hmac_token(user: &UserId, exp: u64, secret: &str) -> String {
	let claims = AuthClaims {
		sub: user.as_str().to_string(),
		exp,
	};
	let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap_or_default());
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn far_future() -> u64 {
		SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600
	}

	#[test]
	fn roundtrip_verifies() {
		let alice = UserId::new("alice").unwrap();
		let token = issue_hmac_token(&alice, far_future(), "s3cret");
		assert_eq!(verify_hmac_token(&token, "s3cret").unwrap(), alice);
	}

	#[test]
	fn wrong_secret_is_rejected() {
		let token = issue_hmac_token(&UserId::new("alice").unwrap(), far_future(), "s3cret");
		assert_eq!(verify_hmac_token(&token, "other").unwrap_err(), AuthError::BadSignature);
	}

	#[test]
	fn expired_token_is_rejected() {
		let token = issue_hmac_token(&UserId::new("alice").unwrap(), 1, "s3cret");
		assert_eq!(verify_hmac_token(&token, "s3cret").unwrap_err(), AuthError::Expired);
	}

	#[test]
	fn malformed_tokens_are_rejected() {
		assert_eq!(verify_hmac_token("", "s").unwrap_err(), AuthError::Malformed);
		assert_eq!(verify_hmac_token("v2.a.b", "s").unwrap_err(), AuthError::Malformed);
		assert_eq!(verify_hmac_token("v1.not-base64!.x", "s").unwrap_err(), AuthError::Malformed);
	}
}
