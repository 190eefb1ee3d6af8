// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the secret subscriber.
//!
//! Each concern has its own error enum so callers can tell a missing key
//! (a normal `None` from the store) apart from a failed fetch or login.

use thiserror::Error;

pub use crate::config::ConfigError;

/// Errors raised while exchanging the platform identity token for an access
/// credential.
#[derive(Debug, Error)]
pub enum AuthError {
	/// Identity token could not be read from the file or the fallback env var.
	#[error("failed to read identity token: {0}")]
	IdentityToken(String),

	/// Transport failure (connect, timeout, TLS).
	#[error("HTTP error during login: {0}")]
	Http(#[source] reqwest::Error),

	/// Login endpoint answered with a non-success status.
	#[error("login failed: HTTP {status}: {body}")]
	Status { status: u16, body: String },

	/// Login response body could not be parsed.
	#[error("invalid login response: {0}")]
	InvalidResponse(String),
}

/// Errors raised by the one-time bulk fetch of secrets.
#[derive(Debug, Error)]
pub enum FetchError {
	/// No credential has been installed yet.
	#[error("no access credential available")]
	NoCredential,

	/// Transport failure (connect, timeout, TLS).
	#[error("HTTP error while fetching secrets: {0}")]
	Http(#[source] reqwest::Error),

	/// Secrets endpoint answered with a non-success status.
	#[error("failed to fetch secrets: HTTP {status}: {body}")]
	Status { status: u16, body: String },

	/// Secrets response body could not be parsed.
	#[error("invalid secrets response: {0}")]
	InvalidResponse(String),
}

/// A webhook delivery that was rejected before touching the store.
#[derive(Debug, Error)]
pub enum IngressError {
	/// Body is not valid JSON or does not have the expected shape.
	#[error("malformed webhook body: {0}")]
	MalformedBody(String),

	/// A field required for the event kind is absent.
	#[error("webhook payload missing required field: {0}")]
	MissingField(&'static str),

	/// Signature header is missing or does not match the body.
	#[error("webhook signature verification failed")]
	InvalidSignature,
}

/// Failure of a single subscriber callback.
///
/// These are only ever logged; they never reach the mutation that triggered
/// the notification.
#[derive(Debug, Error)]
pub enum CallbackError {
	#[error("callback for {key} failed: {message}")]
	Failed { key: String, message: String },

	#[error("callback for {key} panicked: {message}")]
	Panicked { key: String, message: String },
}

/// Top-level error for subscriber lifecycle operations.
#[derive(Debug, Error)]
pub enum SubscriberError {
	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error(transparent)]
	Auth(#[from] AuthError),

	#[error(transparent)]
	Fetch(#[from] FetchError),

	#[error("failed to bind webhook listener: {0}")]
	Bind(#[source] std::io::Error),

	#[error("failed to build HTTP client: {0}")]
	HttpClient(#[source] reqwest::Error),
}

/// Result type for subscriber lifecycle operations.
pub type Result<T> = std::result::Result<T, SubscriberError>;

impl AuthError {
	/// Returns true if a later attempt may succeed without operator action.
	pub fn is_retryable(&self) -> bool {
		match self {
			AuthError::Http(_) => true,
			AuthError::Status { status, .. } => *status >= 500 || *status == 429,
			AuthError::IdentityToken(_) | AuthError::InvalidResponse(_) => false,
		}
	}
}
