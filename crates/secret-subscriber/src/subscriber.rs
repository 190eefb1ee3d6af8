// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Top-level handle tying authentication, the cache, renewal and webhook
//! ingestion together.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::api::{LoginApi, SecretSource, SecretsApi};
use crate::config::SubscriberConfig;
use crate::credential::{Credential, CredentialManager, IdentityTokenSource};
use crate::error::{AuthError, FetchError, Result, SubscriberError};
use crate::ingress::{self, EventIngress};
use crate::notify::{CallbackResult, SecretChange, SubscriptionId};
use crate::scheduler::RenewalScheduler;
use crate::signature::WebhookVerifier;
use crate::store::{BulkLoadSummary, SecretStore};

struct Running {
	scheduler: RenewalScheduler,
	server: JoinHandle<()>,
	server_shutdown: oneshot::Sender<()>,
	local_addr: SocketAddr,
}

/// Long-lived secret subscription client.
///
/// ```no_run
/// use secret_subscriber::{SecretSubscriber, SubscriberConfig};
///
/// # async fn run() -> anyhow::Result<()> {
/// let subscriber = SecretSubscriber::new(SubscriberConfig::from_env()?)?;
/// subscriber.subscribe("DATABASE_URL", |change| {
/// 	tracing::info!(key = %change.key, "database credentials rotated");
/// 	Ok(())
/// });
/// subscriber.start().await?;
/// let db_url = subscriber.get("DATABASE_URL");
/// # let _ = db_url;
/// subscriber.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct SecretSubscriber {
	config: SubscriberConfig,
	credentials: Arc<CredentialManager>,
	source: Arc<dyn SecretSource>,
	store: SecretStore,
	ingress: Arc<EventIngress>,
	running: Mutex<Option<Running>>,
}

impl SecretSubscriber {
	/// Builds a subscriber talking to the configured service over HTTP.
	pub fn new(config: SubscriberConfig) -> Result<Self> {
		config.validate()?;
		let api = Arc::new(SecretsApi::new(&config).map_err(SubscriberError::HttpClient)?);
		Self::with_apis(config, Arc::clone(&api) as Arc<dyn LoginApi>, api)
	}

	/// Builds a subscriber over caller-supplied API implementations.
	pub fn with_apis(
		config: SubscriberConfig,
		login: Arc<dyn LoginApi>,
		source: Arc<dyn SecretSource>,
	) -> Result<Self> {
		config.validate()?;

		let credentials = Arc::new(CredentialManager::new(
			login,
			IdentityTokenSource::new(config.identity_token_path.clone()),
			config.renewal,
		));

		let store = SecretStore::new();
		let mut ingress = EventIngress::new(store.clone());
		if let Some(secret) = &config.webhook_secret {
			ingress = ingress.with_verifier(WebhookVerifier::new(secret.clone()));
		}

		Ok(Self {
			config,
			credentials,
			source,
			store,
			ingress: Arc::new(ingress),
			running: Mutex::new(None),
		})
	}

	pub fn config(&self) -> &SubscriberConfig {
		&self.config
	}

	pub fn store(&self) -> &SecretStore {
		&self.store
	}

	pub fn credentials(&self) -> &Arc<CredentialManager> {
		&self.credentials
	}

	/// Cached value for `key`. Never blocks on the network.
	pub fn get(&self, key: &str) -> Option<String> {
		self.store.get(key)
	}

	/// Snapshot of every cached secret.
	pub fn get_all(&self) -> HashMap<String, String> {
		self.store.get_all()
	}

	/// Registers a change callback for `key`. May be called before or after
	/// [`Self::start`].
	pub fn subscribe<F>(&self, key: impl Into<String>, callback: F) -> SubscriptionId
	where
		F: Fn(&SecretChange) -> CallbackResult + Send + Sync + 'static,
	{
		self.store.subscribe(key, callback)
	}

	pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
		self.store.unsubscribe(id)
	}

	/// Router with `/health` and the webhook route, for hosts that want to
	/// mount ingestion on their own server instead of the built-in listener.
	pub fn router(&self) -> Router {
		ingress::router(Arc::clone(&self.ingress), &self.config.webhook_path)
	}

	pub async fn authenticate(&self) -> std::result::Result<Arc<Credential>, AuthError> {
		self.credentials.authenticate().await
	}

	/// Fetches every in-scope secret with the current credential and
	/// replaces the cache.
	pub async fn bulk_load(&self) -> std::result::Result<BulkLoadSummary, FetchError> {
		let token = self.credentials.access_token().ok_or(FetchError::NoCredential)?;
		self.store.bulk_load(self.source.as_ref(), &token).await
	}

	/// Authenticates, loads the cache, starts renewal and begins serving
	/// webhooks on `0.0.0.0:{webhook_port}`.
	///
	/// Authentication failure is fatal. A failed initial load is logged and
	/// the subscriber keeps running on webhook updates alone. Calling `start`
	/// on a running subscriber returns the existing listener address.
	#[instrument(skip(self), fields(port = self.config.webhook_port))]
	pub async fn start(&self) -> Result<SocketAddr> {
		let mut running = self.running.lock().await;
		if let Some(state) = running.as_ref() {
			return Ok(state.local_addr);
		}

		self.credentials.authenticate().await?;

		match self.bulk_load().await {
			Ok(summary) => info!(loaded = summary.loaded, "Initial secret load complete"),
			Err(e) => warn!(error = %e, "Initial secret load failed, continuing with empty cache"),
		}

		let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], self.config.webhook_port)))
			.await
			.map_err(SubscriberError::Bind)?;
		let local_addr = listener.local_addr().map_err(SubscriberError::Bind)?;

		let scheduler = RenewalScheduler::start(
			Arc::clone(&self.credentials),
			self.config.renewal.threshold(),
		);

		let (server_shutdown, shutdown_rx) = oneshot::channel::<()>();
		let app = self.router();
		let server = tokio::spawn(async move {
			let result = axum::serve(listener, app)
				.with_graceful_shutdown(async {
					let _ = shutdown_rx.await;
				})
				.await;
			if let Err(e) = result {
				error!(error = %e, "Webhook server failed");
			}
		});

		info!(
			addr = %local_addr,
			webhook_path = %self.config.webhook_path,
			"Secret subscriber started"
		);

		*running = Some(Running {
			scheduler,
			server,
			server_shutdown,
			local_addr,
		});
		Ok(local_addr)
	}

	/// Stops the listener and the renewal task within the configured grace
	/// period. Safe to call more than once or before `start`.
	#[instrument(skip(self))]
	pub async fn stop(&self) {
		let Some(state) = self.running.lock().await.take() else {
			return;
		};
		let grace = self.config.shutdown_grace;

		let _ = state.server_shutdown.send(());
		state.scheduler.shutdown(grace).await;

		let mut server = state.server;
		if tokio::time::timeout(grace, &mut server).await.is_err() {
			warn!(grace_secs = grace.as_secs(), "Webhook server did not drain in time, aborting");
			server.abort();
		}

		info!("Secret subscriber stopped");
	}

	pub async fn is_running(&self) -> bool {
		self.running.lock().await.is_some()
	}

	/// Address of the webhook listener while running.
	pub async fn local_addr(&self) -> Option<SocketAddr> {
		self.running.lock().await.as_ref().map(|r| r.local_addr)
	}
}

impl std::fmt::Debug for SecretSubscriber {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SecretSubscriber")
			.field("config", &self.config)
			.field("store", &self.store)
			.finish_non_exhaustive()
	}
}
