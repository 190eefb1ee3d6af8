// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Periodic credential renewal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::credential::{CredentialManager, RenewalOutcome};

/// Background task that calls [`CredentialManager::renew_if_needed`] once per
/// period. The first check happens one full period after start. Ticks are
/// measured from start, so a slow renewal does not push later checks back.
pub struct RenewalScheduler {
	shutdown_tx: broadcast::Sender<()>,
	handle: Mutex<Option<JoinHandle<()>>>,
	period: Duration,
}

impl RenewalScheduler {
	/// Spawns the renewal loop on the current runtime.
	pub fn start(credentials: Arc<CredentialManager>, period: Duration) -> Self {
		let (shutdown_tx, _) = broadcast::channel(1);
		let mut shutdown_rx = shutdown_tx.subscribe();

		let handle = tokio::spawn(async move {
			let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

			loop {
				tokio::select! {
					_ = ticker.tick() => {
						run_renewal(&credentials).await;
					}
					_ = shutdown_rx.recv() => {
						info!("Shutting down credential renewal");
						break;
					}
				}
			}
		});

		info!(period_secs = period.as_secs(), "Credential renewal scheduler started");
		Self {
			shutdown_tx,
			handle: Mutex::new(Some(handle)),
			period,
		}
	}

	pub fn period(&self) -> Duration {
		self.period
	}

	/// Signals the loop to stop and waits up to `grace` for an in-flight
	/// renewal to finish before aborting it. Returns true on a clean exit.
	/// Calling it again is a no-op that returns true.
	#[instrument(skip(self))]
	pub async fn shutdown(&self, grace: Duration) -> bool {
		let Some(mut handle) = self.handle.lock().await.take() else {
			return true;
		};
		let _ = self.shutdown_tx.send(());

		match tokio::time::timeout(grace, &mut handle).await {
			Ok(_) => true,
			Err(_) => {
				warn!(grace_secs = grace.as_secs(), "Renewal did not finish within grace period, aborting");
				handle.abort();
				false
			}
		}
	}
}

impl std::fmt::Debug for RenewalScheduler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RenewalScheduler")
			.field("period", &self.period)
			.finish()
	}
}

async fn run_renewal(credentials: &CredentialManager) {
	match credentials.renew_if_needed().await {
		Ok(RenewalOutcome::NotDue { time_until_expiry }) => {
			debug!(
				secs_until_expiry = time_until_expiry.num_seconds(),
				"Access token not due for renewal"
			);
		}
		Ok(RenewalOutcome::Renewed(credential)) => {
			info!(expires_at = %credential.expires_at, "Access token renewed");
		}
		Err(e) if e.is_retryable() => {
			warn!(error = %e, "Access token renewal failed, will retry next period");
		}
		Err(e) => {
			error!(error = %e, "Access token renewal failed");
		}
	}
}
