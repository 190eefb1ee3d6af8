// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Outbound HTTP calls to the secret-management service.
//!
//! Two seams, both async traits so the credential manager and the store can
//! be exercised without a network:
//!
//! - [`LoginApi`]: `POST {api}/v1/auth/{platform}/login`
//! - [`SecretSource`]: `GET {api}/v3/secrets/raw`
//!
//! [`SecretsApi`] implements both over `reqwest`.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::config::{IdentityPlatform, SubscriberConfig};
use crate::error::{AuthError, FetchError};
use crate::token::SensitiveString;

const ENVIRONMENT_HEADER: &str = "X-Environment";
const SECRET_PATH_HEADER: &str = "X-Secret-Path";

/// Maximum number of response-body characters carried into error messages.
const ERROR_BODY_LIMIT: usize = 200;

/// Access credential as issued by the login endpoint, before it is stamped
/// with an absolute expiry.
#[derive(Debug, Clone)]
pub struct IssuedToken {
	pub access_token: SensitiveString,
	/// Lifetime in seconds. `None` when the service omitted `expiresIn`.
	pub expires_in: Option<u64>,
}

/// One secret as returned by the bulk fetch.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSecret {
	pub secret_key: String,
	pub secret_value: String,
}

impl std::fmt::Debug for RawSecret {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RawSecret")
			.field("secret_key", &self.secret_key)
			.field("secret_value", &crate::token::REDACTED)
			.finish()
	}
}

/// Exchanges a platform identity token for an access credential.
#[async_trait]
pub trait LoginApi: Send + Sync {
	async fn login(&self, identity_token: &SensitiveString) -> Result<IssuedToken, AuthError>;
}

/// Fetches the full in-scope secret set.
#[async_trait]
pub trait SecretSource: Send + Sync {
	async fn fetch_all(&self, access_token: &SensitiveString) -> Result<Vec<RawSecret>, FetchError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
	access_token: String,
	#[serde(default)]
	expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SecretsResponse {
	secrets: Vec<RawSecret>,
}

/// `reqwest`-backed client for the secret-management service.
#[derive(Clone)]
pub struct SecretsApi {
	http_client: Client,
	api_base: String,
	identity_id: String,
	platform: IdentityPlatform,
	project_id: Option<String>,
	environment: String,
	secret_path: String,
}

impl SecretsApi {
	/// Builds a client with the configured connect and request timeouts, so a
	/// stalled service cannot wedge startup or the renewal timer.
	pub fn new(config: &SubscriberConfig) -> Result<Self, reqwest::Error> {
		let http_client = Client::builder()
			.user_agent(user_agent())
			.connect_timeout(config.connect_timeout)
			.timeout(config.request_timeout)
			.redirect(reqwest::redirect::Policy::none())
			.build()?;

		Ok(Self {
			http_client,
			api_base: config.api_base().to_string(),
			identity_id: config.identity_id.clone(),
			platform: config.platform,
			project_id: config.project_id.clone(),
			environment: config.environment.clone(),
			secret_path: config.secret_path.clone(),
		})
	}

	fn login_url(&self) -> String {
		format!(
			"{}/v1/auth/{}/login",
			self.api_base,
			self.platform.path_segment()
		)
	}

	fn secrets_url(&self) -> String {
		format!("{}/v3/secrets/raw", self.api_base)
	}
}

#[async_trait]
impl LoginApi for SecretsApi {
	#[instrument(skip(self, identity_token), fields(platform = ?self.platform))]
	async fn login(&self, identity_token: &SensitiveString) -> Result<IssuedToken, AuthError> {
		let mut body = serde_json::Map::new();
		body.insert(
			"identityId".to_string(),
			serde_json::Value::String(self.identity_id.clone()),
		);
		body.insert(
			self.platform.token_field().to_string(),
			serde_json::Value::String(identity_token.expose().clone()),
		);

		let response = self
			.http_client
			.post(self.login_url())
			.header(CONTENT_TYPE, "application/json")
			.json(&body)
			.send()
			.await
			.map_err(AuthError::Http)?;

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			warn!(status = %status, "Identity login rejected");
			return Err(AuthError::Status {
				status: status.as_u16(),
				body: sanitize_body_for_error(&body, ERROR_BODY_LIMIT),
			});
		}

		let parsed: LoginResponse = response
			.json()
			.await
			.map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

		if parsed.access_token.is_empty() {
			return Err(AuthError::InvalidResponse("empty accessToken".to_string()));
		}

		debug!(expires_in = ?parsed.expires_in, "Obtained access token");

		Ok(IssuedToken {
			access_token: SensitiveString::new(parsed.access_token),
			expires_in: parsed.expires_in,
		})
	}
}

#[async_trait]
impl SecretSource for SecretsApi {
	#[instrument(skip(self, access_token), fields(environment = %self.environment, path = %self.secret_path))]
	async fn fetch_all(&self, access_token: &SensitiveString) -> Result<Vec<RawSecret>, FetchError> {
		let mut request = self
			.http_client
			.get(self.secrets_url())
			.header(AUTHORIZATION, format!("Bearer {}", access_token.expose()))
			.header(ENVIRONMENT_HEADER, self.environment.as_str())
			.header(SECRET_PATH_HEADER, self.secret_path.as_str());

		if let Some(project_id) = &self.project_id {
			request = request.query(&[
				("workspaceId", project_id.as_str()),
				("environment", self.environment.as_str()),
				("secretPath", self.secret_path.as_str()),
			]);
		}

		let response = request.send().await.map_err(FetchError::Http)?;

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			return Err(FetchError::Status {
				status: status.as_u16(),
				body: sanitize_body_for_error(&body, ERROR_BODY_LIMIT),
			});
		}

		let parsed: SecretsResponse = response
			.json()
			.await
			.map_err(|e| FetchError::InvalidResponse(e.to_string()))?;

		debug!(count = parsed.secrets.len(), "Fetched secrets");
		Ok(parsed.secrets)
	}
}

impl std::fmt::Debug for SecretsApi {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SecretsApi")
			.field("api_base", &self.api_base)
			.field("platform", &self.platform)
			.field("environment", &self.environment)
			.field("secret_path", &self.secret_path)
			.finish()
	}
}

/// `secret-subscriber/{version}`
pub fn user_agent() -> String {
	format!("secret-subscriber/{}", env!("CARGO_PKG_VERSION"))
}

fn sanitize_body_for_error(body: &str, max_len: usize) -> String {
	let sanitized: String = body
		.chars()
		.filter(|c| !c.is_control() || *c == ' ')
		.take(max_len)
		.collect();
	if body.chars().count() > max_len {
		format!("{sanitized}...")
	} else {
		sanitized
	}
}
