// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Subscriber configuration.
//!
//! Values are read once from the environment by [`SubscriberConfig::from_env`]
//! and handed to the subscriber as plain values. Tests build the config
//! directly with [`SubscriberConfig::new`] and the `with_*` setters.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::token::SensitiveString;

pub const DEFAULT_API_URL: &str = "http://infisical.infisical.svc.cluster.local:8080/api";
pub const DEFAULT_ENVIRONMENT: &str = "production";
pub const DEFAULT_SECRET_PATH: &str = "/";
pub const DEFAULT_IDENTITY_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
pub const DEFAULT_WEBHOOK_PORT: u16 = 8080;
pub const DEFAULT_WEBHOOK_PATH: &str = "/infisical/webhook";

/// Nominal access-credential lifetime the renewal cadence is derived from.
pub const NOMINAL_CREDENTIAL_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Fraction of [`NOMINAL_CREDENTIAL_TTL`] used as both the renewal margin and
/// the scheduler period.
pub const RENEWAL_FRACTION: f64 = 0.8;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("missing required environment variable: {0}")]
	MissingEnvVar(String),

	#[error("invalid value for {name}: {message}")]
	InvalidValue { name: String, message: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Platform that issued the identity token, selecting the login endpoint and
/// the body field carrying the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityPlatform {
	#[default]
	Kubernetes,
	Gcp,
	Azure,
}

impl IdentityPlatform {
	/// Path segment under `/v1/auth/`.
	pub fn path_segment(&self) -> &'static str {
		match self {
			IdentityPlatform::Kubernetes => "kubernetes",
			IdentityPlatform::Gcp => "gcp-auth",
			IdentityPlatform::Azure => "azure-auth",
		}
	}

	/// JSON field of the login body that carries the identity token.
	pub fn token_field(&self) -> &'static str {
		match self {
			IdentityPlatform::Kubernetes => "serviceAccountToken",
			IdentityPlatform::Gcp | IdentityPlatform::Azure => "jwt",
		}
	}
}

impl std::str::FromStr for IdentityPlatform {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"kubernetes" | "k8s" => Ok(IdentityPlatform::Kubernetes),
			"gcp" => Ok(IdentityPlatform::Gcp),
			"azure" => Ok(IdentityPlatform::Azure),
			other => Err(format!("unknown identity platform '{other}'")),
		}
	}
}

/// Renewal policy: renew once the remaining lifetime drops to
/// `nominal_ttl * fraction`, and tick the scheduler at the same period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenewalPolicy {
	pub nominal_ttl: Duration,
	pub fraction: f64,
}

impl RenewalPolicy {
	/// Absolute margin before expiry at which renewal kicks in. Also the
	/// scheduler period.
	pub fn threshold(&self) -> Duration {
		self.nominal_ttl.mul_f64(self.fraction)
	}
}

impl Default for RenewalPolicy {
	fn default() -> Self {
		Self {
			nominal_ttl: NOMINAL_CREDENTIAL_TTL,
			fraction: RENEWAL_FRACTION,
		}
	}
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
	pub api_url: String,
	pub identity_id: String,
	pub project_id: Option<String>,
	pub environment: String,
	pub secret_path: String,
	pub platform: IdentityPlatform,
	pub identity_token_path: PathBuf,
	pub webhook_port: u16,
	pub webhook_path: String,
	pub webhook_secret: Option<SensitiveString>,
	pub connect_timeout: Duration,
	pub request_timeout: Duration,
	pub shutdown_grace: Duration,
	pub renewal: RenewalPolicy,
}

impl SubscriberConfig {
	/// Config with defaults for everything except the identity ID.
	pub fn new(identity_id: impl Into<String>) -> Self {
		Self {
			api_url: DEFAULT_API_URL.to_string(),
			identity_id: identity_id.into(),
			project_id: None,
			environment: DEFAULT_ENVIRONMENT.to_string(),
			secret_path: DEFAULT_SECRET_PATH.to_string(),
			platform: IdentityPlatform::default(),
			identity_token_path: PathBuf::from(DEFAULT_IDENTITY_TOKEN_PATH),
			webhook_port: DEFAULT_WEBHOOK_PORT,
			webhook_path: DEFAULT_WEBHOOK_PATH.to_string(),
			webhook_secret: None,
			connect_timeout: Duration::from_secs(10),
			request_timeout: Duration::from_secs(30),
			shutdown_grace: Duration::from_secs(10),
			renewal: RenewalPolicy::default(),
		}
	}

	pub fn from_env() -> Result<Self> {
		let identity_id = require_env("INFISICAL_IDENTITY_ID")?;
		if identity_id.trim().is_empty() {
			return Err(ConfigError::MissingEnvVar("INFISICAL_IDENTITY_ID".to_string()));
		}

		let api_url = optional_env("INFISICAL_API_URL", DEFAULT_API_URL.to_string());
		let platform: IdentityPlatform =
			optional_env_parse("INFISICAL_AUTH_PLATFORM", IdentityPlatform::Kubernetes)?;
		let webhook_port: u16 = optional_env_parse("WEBHOOK_PORT", DEFAULT_WEBHOOK_PORT)?;
		let connect_timeout_secs: u64 = optional_env_parse("INFISICAL_CONNECT_TIMEOUT_SECS", 10)?;
		let request_timeout_secs: u64 = optional_env_parse("INFISICAL_REQUEST_TIMEOUT_SECS", 30)?;
		let shutdown_grace_secs: u64 = optional_env_parse("SHUTDOWN_GRACE_SECS", 10)?;

		let config = Self {
			api_url,
			identity_id,
			project_id: std::env::var("INFISICAL_PROJECT_ID")
				.ok()
				.filter(|v| !v.is_empty()),
			environment: optional_env("INFISICAL_ENVIRONMENT", DEFAULT_ENVIRONMENT.to_string()),
			secret_path: optional_env("INFISICAL_SECRET_PATH", DEFAULT_SECRET_PATH.to_string()),
			platform,
			identity_token_path: PathBuf::from(optional_env(
				"INFISICAL_IDENTITY_TOKEN_PATH",
				DEFAULT_IDENTITY_TOKEN_PATH.to_string(),
			)),
			webhook_port,
			webhook_path: optional_env("WEBHOOK_PATH", DEFAULT_WEBHOOK_PATH.to_string()),
			webhook_secret: load_secret_env("INFISICAL_WEBHOOK_SECRET")?,
			connect_timeout: Duration::from_secs(connect_timeout_secs),
			request_timeout: Duration::from_secs(request_timeout_secs),
			shutdown_grace: Duration::from_secs(shutdown_grace_secs),
			renewal: RenewalPolicy::default(),
		};

		config.validate()?;
		Ok(config)
	}

	/// Checks cross-field invariants that `from_env` and the setters cannot
	/// enforce on their own.
	pub fn validate(&self) -> Result<()> {
		if self.identity_id.trim().is_empty() {
			return Err(ConfigError::MissingEnvVar("INFISICAL_IDENTITY_ID".to_string()));
		}
		if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
			return Err(ConfigError::InvalidValue {
				name: "INFISICAL_API_URL".into(),
				message: "must start with http:// or https://".into(),
			});
		}
		if !self.webhook_path.starts_with('/') || self.webhook_path == "/health" {
			return Err(ConfigError::InvalidValue {
				name: "WEBHOOK_PATH".into(),
				message: "must start with '/' and must not be /health".into(),
			});
		}
		if let Some(message) = invalid_route_path(&self.webhook_path) {
			return Err(ConfigError::InvalidValue {
				name: "WEBHOOK_PATH".into(),
				message,
			});
		}
		if self.connect_timeout.is_zero() || self.request_timeout.is_zero() {
			return Err(ConfigError::InvalidValue {
				name: "INFISICAL_*_TIMEOUT_SECS".into(),
				message: "timeouts must be greater than zero".into(),
			});
		}
		if self.renewal.nominal_ttl.is_zero() {
			return Err(ConfigError::InvalidValue {
				name: "renewal.nominal_ttl".into(),
				message: "must be greater than zero".into(),
			});
		}
		if !(self.renewal.fraction > 0.0 && self.renewal.fraction <= 1.0) {
			return Err(ConfigError::InvalidValue {
				name: "renewal.fraction".into(),
				message: "must be in (0, 1]".into(),
			});
		}
		Ok(())
	}

	/// API base URL without a trailing slash.
	pub fn api_base(&self) -> &str {
		self.api_url.trim_end_matches('/')
	}

	pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
		self.api_url = url.into();
		self
	}

	pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
		self.project_id = Some(project_id.into());
		self
	}

	pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
		self.environment = environment.into();
		self
	}

	pub fn with_secret_path(mut self, secret_path: impl Into<String>) -> Self {
		self.secret_path = secret_path.into();
		self
	}

	pub fn with_platform(mut self, platform: IdentityPlatform) -> Self {
		self.platform = platform;
		self
	}

	pub fn with_identity_token_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.identity_token_path = path.into();
		self
	}

	pub fn with_webhook_port(mut self, port: u16) -> Self {
		self.webhook_port = port;
		self
	}

	pub fn with_webhook_path(mut self, path: impl Into<String>) -> Self {
		self.webhook_path = path.into();
		self
	}

	pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
		self.webhook_secret = Some(SensitiveString::new(secret.into()));
		self
	}

	pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
		self.shutdown_grace = grace;
		self
	}

	pub fn with_renewal(mut self, renewal: RenewalPolicy) -> Self {
		self.renewal = renewal;
		self
	}
}

/// The webhook route is a literal path; reject anything the router would
/// read as a capture or wildcard.
fn invalid_route_path(path: &str) -> Option<String> {
	if path.contains('{') || path.contains('}') {
		return Some("must not contain '{' or '}'".to_string());
	}
	let segments: Vec<&str> = path.split('/').skip(1).collect();
	for (i, segment) in segments.iter().enumerate() {
		let trailing = i + 1 == segments.len();
		if segment.is_empty() && !trailing {
			return Some("must not contain empty segments".to_string());
		}
		if segment.starts_with(':') || segment.starts_with('*') {
			return Some(format!("segment '{segment}' must be literal"));
		}
	}
	None
}

fn require_env(name: &str) -> Result<String> {
	std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional_env(name: &str, default: String) -> String {
	std::env::var(name).unwrap_or(default)
}

fn optional_env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
	T::Err: std::fmt::Display,
{
	match std::env::var(name) {
		Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
			name: name.to_string(),
			message: e.to_string(),
		}),
		Err(_) => Ok(default),
	}
}

/// Loads `VAR` directly or from the file named by `VAR_FILE`, the latter
/// taking precedence. A single trailing newline is stripped from file content.
fn load_secret_env(var: &str) -> Result<Option<SensitiveString>> {
	let file_var = format!("{var}_FILE");

	if let Ok(path) = std::env::var(&file_var) {
		if path.is_empty() {
			return Err(ConfigError::InvalidValue {
				name: file_var,
				message: "path is empty".into(),
			});
		}
		let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::InvalidValue {
			name: file_var.clone(),
			message: format!("failed to read {path}: {e}"),
		})?;
		let value = content.strip_suffix('\n').unwrap_or(&content).to_string();
		return Ok(Some(SensitiveString::new(value)));
	}

	Ok(std::env::var(var)
		.ok()
		.filter(|v| !v.is_empty())
		.map(SensitiveString::new))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn new_uses_documented_defaults() {
		let config = SubscriberConfig::new("identity-1");
		assert_eq!(config.api_url, DEFAULT_API_URL);
		assert_eq!(config.environment, "production");
		assert_eq!(config.secret_path, "/");
		assert_eq!(config.webhook_port, 8080);
		assert_eq!(config.webhook_path, "/infisical/webhook");
		assert_eq!(config.platform, IdentityPlatform::Kubernetes);
		assert_eq!(config.connect_timeout, Duration::from_secs(10));
		assert_eq!(config.request_timeout, Duration::from_secs(30));
		assert!(config.validate().is_ok());
	}

	#[test]
	fn renewal_threshold_is_eighty_percent_of_seven_days() {
		let policy = RenewalPolicy::default();
		let expected = Duration::from_secs(7 * 24 * 60 * 60).mul_f64(0.8);
		assert_eq!(policy.threshold(), expected);
		assert_eq!(policy.threshold().as_secs(), 483_840);
	}

	#[test]
	fn empty_identity_is_rejected() {
		let err = SubscriberConfig::new("  ").validate().unwrap_err();
		assert!(matches!(err, ConfigError::MissingEnvVar(_)));
	}

	#[test]
	fn api_url_must_have_scheme() {
		let err = SubscriberConfig::new("id")
			.with_api_url("infisical.local/api")
			.validate()
			.unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { .. }));
	}

	#[test]
	fn webhook_path_cannot_shadow_health() {
		let config = SubscriberConfig::new("id").with_webhook_path("/health");
		assert!(config.validate().is_err());
		let config = SubscriberConfig::new("id").with_webhook_path("hooks");
		assert!(config.validate().is_err());
	}

	#[test]
	fn webhook_path_must_be_literal() {
		for path in ["/hooks/:id", "/hooks/*rest", "/hooks/{id}", "/hooks//secrets", "/a}b"] {
			let err = SubscriberConfig::new("id")
				.with_webhook_path(path)
				.validate()
				.unwrap_err();
			assert!(matches!(err, ConfigError::InvalidValue { .. }), "{path}");
		}
		for path in ["/infisical/webhook", "/hooks/secrets/", "/"] {
			assert!(
				SubscriberConfig::new("id").with_webhook_path(path).validate().is_ok(),
				"{path}"
			);
		}
	}

	#[test]
	fn zero_nominal_ttl_is_rejected() {
		let err = SubscriberConfig::new("id")
			.with_renewal(RenewalPolicy {
				nominal_ttl: Duration::ZERO,
				fraction: 0.8,
			})
			.validate()
			.unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { .. }));
	}

	#[test]
	fn api_base_strips_trailing_slash() {
		let config = SubscriberConfig::new("id").with_api_url("https://vault.example.com/api/");
		assert_eq!(config.api_base(), "https://vault.example.com/api");
	}

	#[test]
	fn platform_parsing() {
		assert_eq!("kubernetes".parse::<IdentityPlatform>(), Ok(IdentityPlatform::Kubernetes));
		assert_eq!("K8S".parse::<IdentityPlatform>(), Ok(IdentityPlatform::Kubernetes));
		assert_eq!("gcp".parse::<IdentityPlatform>(), Ok(IdentityPlatform::Gcp));
		assert_eq!("azure".parse::<IdentityPlatform>(), Ok(IdentityPlatform::Azure));
		assert!("aws".parse::<IdentityPlatform>().is_err());
	}

	#[test]
	fn platform_login_shape() {
		assert_eq!(IdentityPlatform::Kubernetes.path_segment(), "kubernetes");
		assert_eq!(IdentityPlatform::Kubernetes.token_field(), "serviceAccountToken");
		assert_eq!(IdentityPlatform::Gcp.path_segment(), "gcp-auth");
		assert_eq!(IdentityPlatform::Azure.token_field(), "jwt");
	}

	#[test]
	fn optional_env_parse_uses_default() {
		let result: u64 = optional_env_parse("SECRET_SUBSCRIBER_NONEXISTENT_12345", 42).unwrap();
		assert_eq!(result, 42);
	}

	#[test]
	fn optional_env_parse_reports_bad_value() {
		let var = "SECRET_SUBSCRIBER_TEST_BAD_PORT_12345";
		std::env::set_var(var, "not-a-port");
		let result: Result<u16> = optional_env_parse(var, 8080);
		std::env::remove_var(var);
		assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
	}

	#[test]
	fn secret_file_takes_precedence_and_strips_newline() {
		let var = "SECRET_SUBSCRIBER_TEST_WEBHOOK_SECRET_12345";
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "from-file").unwrap();
		std::env::set_var(var, "from-env");
		std::env::set_var(format!("{var}_FILE"), file.path());

		let secret = load_secret_env(var).unwrap().unwrap();

		std::env::remove_var(var);
		std::env::remove_var(format!("{var}_FILE"));
		assert_eq!(secret.expose(), "from-file");
	}

	#[test]
	fn secret_env_absent_is_none() {
		let var = "SECRET_SUBSCRIBER_TEST_ABSENT_SECRET_12345";
		std::env::remove_var(var);
		std::env::remove_var(format!("{var}_FILE"));
		assert!(load_secret_env(var).unwrap().is_none());
	}
}
