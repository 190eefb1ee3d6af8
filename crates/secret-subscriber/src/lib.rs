// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Secret subscription client for Infisical.
//!
//! Authenticates with a platform workload identity, loads every secret in
//! one project scope into memory and keeps that cache current from webhook
//! deliveries. Application code reads secrets synchronously and can register
//! per-key callbacks that fire on every change.
//!
//! # Features
//!
//! - **Workload identity login**: Kubernetes service account token (or GCP /
//!   Azure identity token) exchanged for an access token, renewed on a fixed
//!   schedule
//! - **In-memory cache**: reads never touch the network
//! - **Webhook ingestion**: created, updated, rotated and deleted events,
//!   optionally HMAC verified
//! - **Change callbacks**: per key, isolated from one another
//!
//! # Example
//!
//! ```ignore
//! use secret_subscriber::{SecretSubscriber, SubscriberConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let subscriber = SecretSubscriber::new(
//!         SubscriberConfig::new("identity-id").with_project_id("project-id"),
//!     )?;
//!
//!     subscriber.subscribe("DATABASE_URL", |change| {
//!         println!("{} changed", change.key);
//!         Ok(())
//!     });
//!
//!     subscriber.start().await?;
//!     let db_url = subscriber.get("DATABASE_URL");
//!
//!     tokio::signal::ctrl_c().await?;
//!     subscriber.stop().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod credential;
pub mod error;
pub mod ingress;
pub mod notify;
pub mod scheduler;
pub mod signature;
pub mod store;
pub mod subscriber;
pub mod token;

pub use api::{IssuedToken, LoginApi, RawSecret, SecretSource, SecretsApi};
pub use config::{IdentityPlatform, RenewalPolicy, SubscriberConfig};
pub use credential::{Credential, CredentialManager, IdentityTokenSource, RenewalOutcome};
pub use error::{
	AuthError, CallbackError, ConfigError, FetchError, IngressError, Result, SubscriberError,
};
pub use ingress::{EventIngress, EventKind, IngressOutcome, SecretEvent};
pub use notify::{CallbackResult, NotificationHub, SecretChange, SubscriptionId};
pub use scheduler::RenewalScheduler;
pub use signature::WebhookVerifier;
pub use store::{BulkLoadSummary, SecretStore};
pub use subscriber::SecretSubscriber;
pub use token::{Sensitive, SensitiveString};
