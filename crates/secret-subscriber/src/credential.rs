// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Access-credential lifecycle.
//!
//! The [`CredentialManager`] reads the platform identity token, exchanges it
//! for an access credential and keeps exactly one [`Credential`] current.
//! Each renewal builds a fresh `Arc<Credential>` and swaps it in under a
//! short write lock, so readers see either the old value+expiry pair or the
//! new one, never a mix. Login calls are serialized by an async mutex.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::api::LoginApi;
use crate::config::RenewalPolicy;
use crate::error::AuthError;
use crate::token::SensitiveString;

/// Env var consulted when the identity token file does not exist, for local
/// development outside the platform.
pub const IDENTITY_TOKEN_FALLBACK_ENV: &str = "KUBERNETES_SERVICE_ACCOUNT_TOKEN";

/// The current access credential.
#[derive(Debug, Clone)]
pub struct Credential {
	pub token: SensitiveString,
	pub expires_at: DateTime<Utc>,
	pub renewed_at: DateTime<Utc>,
}

impl Credential {
	/// Remaining lifetime at `now`; negative once expired.
	pub fn time_until_expiry(&self, now: DateTime<Utc>) -> chrono::Duration {
		self.expires_at - now
	}

	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		now >= self.expires_at
	}
}

/// Result of a [`CredentialManager::renew_if_needed`] check.
#[derive(Debug, Clone)]
pub enum RenewalOutcome {
	/// Remaining lifetime is above the renewal margin.
	NotDue { time_until_expiry: chrono::Duration },
	/// A new credential was installed.
	Renewed(Arc<Credential>),
}

/// Where the platform identity token lives.
///
/// The token is read on every login attempt and never cached, so a token
/// rotated by the platform is picked up on the next renewal.
#[derive(Debug, Clone)]
pub struct IdentityTokenSource {
	path: PathBuf,
	fallback_env: Option<String>,
}

impl IdentityTokenSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			fallback_env: Some(IDENTITY_TOKEN_FALLBACK_ENV.to_string()),
		}
	}

	/// Overrides (or with `None`, disables) the env var fallback.
	pub fn with_fallback_env(mut self, var: Option<String>) -> Self {
		self.fallback_env = var;
		self
	}

	pub fn path(&self) -> &std::path::Path {
		&self.path
	}

	pub async fn read(&self) -> Result<SensitiveString, AuthError> {
		match tokio::fs::read_to_string(&self.path).await {
			Ok(content) => {
				let token = content.trim();
				if token.is_empty() {
					return Err(AuthError::IdentityToken(format!(
						"{} is empty",
						self.path.display()
					)));
				}
				Ok(SensitiveString::new(token.to_string()))
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				if let Some(token) = self
					.fallback_env
					.as_deref()
					.and_then(|var| std::env::var(var).ok())
					.filter(|t| !t.trim().is_empty())
				{
					debug!(path = %self.path.display(), "Identity token file missing, using env fallback");
					return Ok(SensitiveString::new(token.trim().to_string()));
				}
				Err(AuthError::IdentityToken(format!(
					"{} not found",
					self.path.display()
				)))
			}
			Err(e) => Err(AuthError::IdentityToken(format!(
				"failed to read {}: {}",
				self.path.display(),
				e
			))),
		}
	}
}

pub struct CredentialManager {
	api: Arc<dyn LoginApi>,
	token_source: IdentityTokenSource,
	policy: RenewalPolicy,
	current: RwLock<Option<Arc<Credential>>>,
	login_lock: tokio::sync::Mutex<()>,
}

impl CredentialManager {
	pub fn new(
		api: Arc<dyn LoginApi>,
		token_source: IdentityTokenSource,
		policy: RenewalPolicy,
	) -> Self {
		Self {
			api,
			token_source,
			policy,
			current: RwLock::new(None),
			login_lock: tokio::sync::Mutex::new(()),
		}
	}

	pub fn policy(&self) -> RenewalPolicy {
		self.policy
	}

	/// The current credential, if one has been installed.
	pub fn current(&self) -> Option<Arc<Credential>> {
		self.current.read().clone()
	}

	/// Copy of the current bearer value.
	pub fn access_token(&self) -> Option<SensitiveString> {
		self.current.read().as_ref().map(|c| c.token.clone())
	}

	pub fn last_renewed_at(&self) -> Option<DateTime<Utc>> {
		self.current.read().as_ref().map(|c| c.renewed_at)
	}

	/// Reads the identity token, logs in and installs the new credential.
	///
	/// On failure the previous credential stays installed.
	#[instrument(skip(self))]
	pub async fn authenticate(&self) -> Result<Arc<Credential>, AuthError> {
		let _guard = self.login_lock.lock().await;
		self.login_and_install().await
	}

	/// Re-authenticates when the remaining lifetime is at or below the fixed
	/// renewal margin of the policy.
	pub async fn renew_if_needed(&self) -> Result<RenewalOutcome, AuthError> {
		self.renew_if_needed_at(Utc::now()).await
	}

	/// [`Self::renew_if_needed`] evaluated at an explicit instant.
	///
	/// The check is repeated after taking the login lock so two callers that
	/// both saw an old credential do not log in twice.
	pub async fn renew_if_needed_at(&self, now: DateTime<Utc>) -> Result<RenewalOutcome, AuthError> {
		if let Some(remaining) = self.remaining_if_not_due(now) {
			return Ok(RenewalOutcome::NotDue {
				time_until_expiry: remaining,
			});
		}

		let _guard = self.login_lock.lock().await;
		if let Some(remaining) = self.remaining_if_not_due(now) {
			return Ok(RenewalOutcome::NotDue {
				time_until_expiry: remaining,
			});
		}

		info!("Access token approaching expiry, renewing");
		self.login_and_install().await.map(RenewalOutcome::Renewed)
	}

	fn remaining_if_not_due(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
		let current = self.current()?;
		let remaining = current.time_until_expiry(now);
		let threshold = chrono::Duration::from_std(self.policy.threshold()).unwrap_or(chrono::Duration::MAX);
		if remaining > threshold {
			Some(remaining)
		} else {
			None
		}
	}

	async fn login_and_install(&self) -> Result<Arc<Credential>, AuthError> {
		let identity_token = self.token_source.read().await?;
		let issued = self.api.login(&identity_token).await?;

		let ttl = match issued.expires_in {
			Some(secs) => Duration::from_secs(secs),
			None => {
				warn!(
					nominal_ttl_secs = self.policy.nominal_ttl.as_secs(),
					"Login response had no expiresIn, assuming nominal lifetime"
				);
				self.policy.nominal_ttl
			}
		};

		let renewed_at = Utc::now();
		let ttl = chrono::Duration::from_std(ttl)
			.map_err(|e| AuthError::InvalidResponse(format!("expiresIn out of range: {e}")))?;
		let expires_at = renewed_at
			.checked_add_signed(ttl)
			.ok_or_else(|| AuthError::InvalidResponse("expiresIn out of range".to_string()))?;

		let credential = Arc::new(Credential {
			token: issued.access_token,
			expires_at,
			renewed_at,
		});

		*self.current.write() = Some(Arc::clone(&credential));

		info!(expires_at = %expires_at, "Authenticated with secret service");
		Ok(credential)
	}
}

impl std::fmt::Debug for CredentialManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let current = self.current();
		f.debug_struct("CredentialManager")
			.field("token_path", &self.token_source.path)
			.field("expires_at", &current.as_ref().map(|c| c.expires_at))
			.finish()
	}
}
