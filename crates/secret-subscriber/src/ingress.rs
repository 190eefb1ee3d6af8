// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Webhook ingestion.
//!
//! [`EventIngress::handle`] is transport-agnostic: it verifies, parses and
//! applies one delivery to the store. [`router`] exposes it over axum along
//! with a `/health` liveness check.
//!
//! | Outcome                               | Status |
//! |---------------------------------------|--------|
//! | applied, or unknown event ignored     | 200    |
//! | malformed body or missing field       | 400    |
//! | signature missing or wrong            | 401    |
//! | processing task failed                | 500    |

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::IngressError;
use crate::notify::SecretChange;
use crate::signature::{WebhookVerifier, SIGNATURE_HEADER};
use crate::store::SecretStore;

/// Kind of a recognised webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
	Created,
	Updated,
	Rotated,
	Deleted,
}

impl EventKind {
	/// Accepts both `secret.updated` and bare `updated`.
	pub fn parse(event: &str) -> Option<Self> {
		let name = event.strip_prefix("secret.").unwrap_or(event);
		match name {
			"created" => Some(EventKind::Created),
			"updated" => Some(EventKind::Updated),
			"rotated" => Some(EventKind::Rotated),
			"deleted" => Some(EventKind::Deleted),
			_ => None,
		}
	}
}

/// A validated webhook delivery.
#[derive(Clone, PartialEq, Eq)]
pub enum SecretEvent {
	Upsert {
		kind: EventKind,
		key: String,
		value: String,
	},
	Delete {
		key: String,
	},
	/// Event name not recognised; the payload was not inspected.
	Ignored {
		event: String,
	},
}

impl std::fmt::Debug for SecretEvent {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			SecretEvent::Upsert { kind, key, .. } => f
				.debug_struct("Upsert")
				.field("kind", kind)
				.field("key", key)
				.field("value", &crate::token::REDACTED)
				.finish(),
			SecretEvent::Delete { key } => f.debug_struct("Delete").field("key", key).finish(),
			SecretEvent::Ignored { event } => f.debug_struct("Ignored").field("event", event).finish(),
		}
	}
}

/// Wire shape of a delivery. Unknown fields are ignored.
#[derive(Deserialize)]
struct WebhookEnvelope {
	event: Option<String>,
	#[serde(default)]
	payload: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload {
	secret_key: Option<String>,
	secret_value: Option<String>,
}

impl SecretEvent {
	/// Parses `{"event": "...", "payload": {"secretKey": "...", "secretValue": "..."}}`.
	pub fn parse(body: &[u8]) -> Result<Self, IngressError> {
		let envelope: WebhookEnvelope =
			serde_json::from_slice(body).map_err(|e| IngressError::MalformedBody(e.to_string()))?;
		let event = envelope.event.ok_or(IngressError::MissingField("event"))?;

		let Some(kind) = EventKind::parse(&event) else {
			return Ok(SecretEvent::Ignored { event });
		};

		let payload = match envelope.payload {
			Some(payload @ Value::Object(_)) => payload,
			Some(Value::Null) | None => return Err(IngressError::MissingField("payload")),
			Some(_) => {
				return Err(IngressError::MalformedBody(
					"payload must be an object".to_string(),
				))
			}
		};
		let payload: WebhookPayload =
			serde_json::from_value(payload).map_err(|e| IngressError::MalformedBody(e.to_string()))?;

		let key = payload.secret_key.ok_or(IngressError::MissingField("secretKey"))?;
		if key.is_empty() {
			return Err(IngressError::MalformedBody("secretKey is empty".to_string()));
		}

		match kind {
			EventKind::Deleted => Ok(SecretEvent::Delete { key }),
			EventKind::Created | EventKind::Updated | EventKind::Rotated => Ok(SecretEvent::Upsert {
				kind,
				key,
				value: payload
					.secret_value
					.ok_or(IngressError::MissingField("secretValue"))?,
			}),
		}
	}
}

/// What a delivery did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
	Applied(SecretChange),
	Ignored { event: String },
}

#[derive(Debug, Clone)]
pub struct EventIngress {
	store: SecretStore,
	verifier: Option<WebhookVerifier>,
}

impl EventIngress {
	pub fn new(store: SecretStore) -> Self {
		Self {
			store,
			verifier: None,
		}
	}

	/// Require a valid signature header on every delivery.
	pub fn with_verifier(mut self, verifier: WebhookVerifier) -> Self {
		self.verifier = Some(verifier);
		self
	}

	/// Verifies, parses and applies one delivery. Nothing is written to the
	/// store unless the whole delivery is valid.
	pub fn handle(&self, signature: Option<&str>, body: &[u8]) -> Result<IngressOutcome, IngressError> {
		if let Some(verifier) = &self.verifier {
			verifier.verify(signature, body)?;
		}

		match SecretEvent::parse(body)? {
			SecretEvent::Upsert { kind, key, value } => {
				info!(key = %key, kind = ?kind, "Applying secret update from webhook");
				Ok(IngressOutcome::Applied(self.store.apply_upsert(key, value)))
			}
			SecretEvent::Delete { key } => {
				info!(key = %key, "Applying secret deletion from webhook");
				Ok(IngressOutcome::Applied(self.store.apply_delete(key)))
			}
			SecretEvent::Ignored { event } => {
				debug!(event = %event, "Ignoring unrecognised webhook event");
				Ok(IngressOutcome::Ignored { event })
			}
		}
	}
}

/// `GET /health` plus `POST {webhook_path}`.
pub fn router(ingress: Arc<EventIngress>, webhook_path: &str) -> Router {
	Router::new()
		.route("/health", get(health_handler))
		.route(webhook_path, post(webhook_handler))
		.with_state(ingress)
}

async fn health_handler() -> &'static str {
	"OK"
}

async fn webhook_handler(
	State(ingress): State<Arc<EventIngress>>,
	headers: HeaderMap,
	body: Bytes,
) -> impl IntoResponse {
	let signature = headers
		.get(SIGNATURE_HEADER)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);

	// Callbacks run synchronously inside the mutation, off the async workers.
	let result =
		tokio::task::spawn_blocking(move || ingress.handle(signature.as_deref(), &body)).await;

	match result {
		Ok(Ok(_)) => (StatusCode::OK, "OK"),
		Ok(Err(IngressError::InvalidSignature)) => {
			warn!("Rejected webhook with invalid signature");
			(StatusCode::UNAUTHORIZED, "Unauthorized")
		}
		Ok(Err(e)) => {
			warn!(error = %e, "Rejected malformed webhook");
			(StatusCode::BAD_REQUEST, "Bad Request")
		}
		Err(e) => {
			error!(error = %e, "Webhook processing task failed");
			(StatusCode::INTERNAL_SERVER_ERROR, "Error")
		}
	}
}
