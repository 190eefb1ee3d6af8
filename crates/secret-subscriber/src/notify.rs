// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-key change notifications.
//!
//! Callbacks are registered against a single secret key and invoked in
//! registration order for every mutation of that key. A callback that
//! returns an error or panics is logged and skipped; later callbacks still
//! run and the mutation itself is unaffected.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, trace};

use crate::error::CallbackError;
use crate::token::REDACTED;

/// One change to one key. `None` on either side means "absent".
#[derive(Clone, PartialEq, Eq)]
pub struct SecretChange {
	pub key: String,
	pub new_value: Option<String>,
	pub old_value: Option<String>,
}

impl SecretChange {
	pub fn new(key: impl Into<String>, new_value: Option<String>, old_value: Option<String>) -> Self {
		Self {
			key: key.into(),
			new_value,
			old_value,
		}
	}

	pub fn is_removal(&self) -> bool {
		self.new_value.is_none()
	}
}

impl fmt::Debug for SecretChange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let redact = |v: &Option<String>| v.as_ref().map(|_| REDACTED);
		f.debug_struct("SecretChange")
			.field("key", &self.key)
			.field("new_value", &redact(&self.new_value))
			.field("old_value", &redact(&self.old_value))
			.finish()
	}
}

/// What a callback may return; errors are logged, never propagated.
pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Callback = Arc<dyn Fn(&SecretChange) -> CallbackResult + Send + Sync>;

/// Handle returned by [`NotificationHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Delivery counts for one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
	pub delivered: usize,
	pub failed: usize,
}

pub struct NotificationHub {
	subscribers: RwLock<HashMap<String, Vec<(SubscriptionId, Callback)>>>,
	next_id: AtomicU64,
}

impl NotificationHub {
	pub fn new() -> Self {
		Self {
			subscribers: RwLock::new(HashMap::new()),
			next_id: AtomicU64::new(1),
		}
	}

	/// Registers `callback` for `key`. Keys need not exist in the store.
	pub fn subscribe<F>(&self, key: impl Into<String>, callback: F) -> SubscriptionId
	where
		F: Fn(&SecretChange) -> CallbackResult + Send + Sync + 'static,
	{
		let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
		self.subscribers
			.write()
			.entry(key.into())
			.or_default()
			.push((id, Arc::new(callback)));
		id
	}

	/// Removes a registration. Returns false if the id was unknown.
	pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
		let mut subscribers = self.subscribers.write();
		let mut removed = false;
		subscribers.retain(|_, callbacks| {
			let before = callbacks.len();
			callbacks.retain(|(existing, _)| *existing != id);
			removed |= callbacks.len() != before;
			!callbacks.is_empty()
		});
		removed
	}

	pub fn subscriber_count(&self, key: &str) -> usize {
		self.subscribers.read().get(key).map_or(0, Vec::len)
	}

	/// Invokes every callback for `change.key`, in registration order.
	///
	/// The registry lock is released before the first callback runs, so a
	/// callback may subscribe or unsubscribe without deadlocking. Such
	/// registrations take effect from the next dispatch.
	pub fn dispatch(&self, change: &SecretChange) -> DispatchReport {
		let callbacks: Vec<Callback> = match self.subscribers.read().get(&change.key) {
			Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
			None => return DispatchReport::default(),
		};

		let mut report = DispatchReport::default();
		for callback in callbacks {
			let failure = match catch_unwind(AssertUnwindSafe(|| callback(change))) {
				Ok(Ok(())) => None,
				Ok(Err(e)) => Some(CallbackError::Failed {
					key: change.key.clone(),
					message: e.to_string(),
				}),
				Err(payload) => Some(CallbackError::Panicked {
					key: change.key.clone(),
					message: panic_message(payload.as_ref()),
				}),
			};

			match failure {
				None => report.delivered += 1,
				Some(err) => {
					report.failed += 1;
					error!(key = %change.key, error = %err, "Secret change callback failed");
				}
			}
		}

		trace!(key = %change.key, delivered = report.delivered, failed = report.failed, "Dispatched secret change");
		report
	}
}

impl Default for NotificationHub {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for NotificationHub {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let subscribers = self.subscribers.read();
		f.debug_struct("NotificationHub")
			.field("keys", &subscribers.len())
			.field("callbacks", &subscribers.values().map(Vec::len).sum::<usize>())
			.finish()
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"Box<dyn Any>".to_string()
	}
}
