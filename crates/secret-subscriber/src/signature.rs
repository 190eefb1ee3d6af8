// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HMAC-SHA256 verification of webhook deliveries.
//!
//! The service signs `"{timestamp}.{raw body}"` with the shared webhook
//! secret and sends `x-infisical-signature: t={timestamp};{hex signature}`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::IngressError;
use crate::token::SensitiveString;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-infisical-signature";

#[derive(Debug, Clone)]
pub struct WebhookVerifier {
	secret: SensitiveString,
}

impl WebhookVerifier {
	pub fn new(secret: SensitiveString) -> Self {
		Self { secret }
	}

	/// Checks `header` (the raw signature header value, if any) against `body`.
	pub fn verify(&self, header: Option<&str>, body: &[u8]) -> Result<(), IngressError> {
		let (timestamp, signature) = header
			.and_then(parse_signature_header)
			.ok_or(IngressError::InvalidSignature)?;

		let expected = hex::decode(signature).map_err(|_| IngressError::InvalidSignature)?;
		let mut mac = HmacSha256::new_from_slice(self.secret.expose().as_bytes())
			.map_err(|_| IngressError::InvalidSignature)?;
		mac.update(signed_prefix(timestamp).as_bytes());
		mac.update(body);
		mac.verify_slice(&expected)
			.map_err(|_| IngressError::InvalidSignature)
	}

	/// Header value a sender would attach for `body` at `timestamp`.
	pub fn sign(&self, timestamp: &str, body: &[u8]) -> Option<String> {
		let mut mac = HmacSha256::new_from_slice(self.secret.expose().as_bytes()).ok()?;
		mac.update(signed_prefix(timestamp).as_bytes());
		mac.update(body);
		Some(format!("t={};{}", timestamp, hex::encode(mac.finalize().into_bytes())))
	}
}

fn signed_prefix(timestamp: &str) -> String {
	format!("{timestamp}.")
}

/// Splits `t=<ts>;<sig>` into its parts.
fn parse_signature_header(value: &str) -> Option<(&str, &str)> {
	let (timestamp, signature) = value.trim().split_once(';')?;
	let timestamp = timestamp.trim().strip_prefix("t=")?;
	let signature = signature.trim();
	if timestamp.is_empty() || signature.is_empty() {
		return None;
	}
	Some((timestamp, signature))
}
