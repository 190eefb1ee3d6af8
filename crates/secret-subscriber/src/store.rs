// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory secret cache.
//!
//! Reads take a short read lock and clone the value out, so they never wait
//! on network I/O. Writers hold a reentrant commit lock across "mutate, then
//! notify", which keeps the notification order for a key equal to the commit
//! order. The map lock itself is released before callbacks run, so callbacks
//! may read the store.
//!
//! A callback that writes to the store from the same thread re-enters the
//! commit lock. Its mutation is applied immediately, but its notification is
//! queued and delivered only after every callback of the outer change has
//! run, so all subscribers see changes in commit order.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{ReentrantMutex, RwLock};
use tracing::{debug, info, instrument};

use crate::api::SecretSource;
use crate::error::FetchError;
use crate::notify::{CallbackResult, NotificationHub, SecretChange, SubscriptionId};
use crate::token::SensitiveString;

/// Counts from one bulk load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkLoadSummary {
	/// Number of keys held after the load.
	pub loaded: usize,
	/// Keys that were new or whose value changed.
	pub changed: usize,
	/// Keys that were cached but absent from the fetched set.
	pub removed: usize,
}

#[derive(Default)]
struct Entries {
	secrets: HashMap<String, String>,
	last_updated: Option<DateTime<Utc>>,
}

/// Changes committed but not yet dispatched. Only touched while holding the
/// commit lock.
#[derive(Default)]
struct DispatchQueue {
	pending: VecDeque<SecretChange>,
	dispatching: bool,
}

struct StoreInner {
	entries: RwLock<Entries>,
	commit: ReentrantMutex<RefCell<DispatchQueue>>,
	hub: Arc<NotificationHub>,
}

/// Shared handle to the cache. Cloning is cheap.
#[derive(Clone)]
pub struct SecretStore {
	inner: Arc<StoreInner>,
}

impl SecretStore {
	pub fn new() -> Self {
		Self::with_hub(Arc::new(NotificationHub::new()))
	}

	pub fn with_hub(hub: Arc<NotificationHub>) -> Self {
		Self {
			inner: Arc::new(StoreInner {
				entries: RwLock::new(Entries::default()),
				commit: ReentrantMutex::new(RefCell::new(DispatchQueue::default())),
				hub,
			}),
		}
	}

	pub fn hub(&self) -> &Arc<NotificationHub> {
		&self.inner.hub
	}

	/// Cached value for `key`; `None` when absent. Never touches the network.
	pub fn get(&self, key: &str) -> Option<String> {
		self.inner.entries.read().secrets.get(key).cloned()
	}

	/// Point-in-time copy of every entry. Later mutations do not affect it.
	pub fn get_all(&self) -> HashMap<String, String> {
		self.inner.entries.read().secrets.clone()
	}

	pub fn len(&self) -> usize {
		self.inner.entries.read().secrets.len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.entries.read().secrets.is_empty()
	}

	/// Time of the last committed mutation.
	pub fn last_updated(&self) -> Option<DateTime<Utc>> {
		self.inner.entries.read().last_updated
	}

	pub fn subscribe<F>(&self, key: impl Into<String>, callback: F) -> SubscriptionId
	where
		F: Fn(&SecretChange) -> CallbackResult + Send + Sync + 'static,
	{
		self.inner.hub.subscribe(key, callback)
	}

	pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
		self.inner.hub.unsubscribe(id)
	}

	/// Sets `key` to `value` and notifies, even when the value is unchanged.
	pub fn apply_upsert(&self, key: impl Into<String>, value: impl Into<String>) -> SecretChange {
		let key = key.into();
		let value = value.into();
		let commit = self.inner.commit.lock();

		let old_value = {
			let mut entries = self.inner.entries.write();
			entries.last_updated = Some(Utc::now());
			entries.secrets.insert(key.clone(), value.clone())
		};

		debug!(key = %key, existed = old_value.is_some(), "Secret upserted");
		let change = SecretChange::new(key, Some(value), old_value);
		self.publish(&commit, [change.clone()]);
		change
	}

	/// Removes `key` and notifies. Deleting an absent key is not an error and
	/// notifies with both sides absent.
	pub fn apply_delete(&self, key: impl Into<String>) -> SecretChange {
		let key = key.into();
		let commit = self.inner.commit.lock();

		let old_value = {
			let mut entries = self.inner.entries.write();
			let old = entries.secrets.remove(&key);
			if old.is_some() {
				entries.last_updated = Some(Utc::now());
			}
			old
		};

		debug!(key = %key, existed = old_value.is_some(), "Secret deleted");
		let change = SecretChange::new(key, None, old_value);
		self.publish(&commit, [change.clone()]);
		change
	}

	/// Replaces the whole cache with `secrets` in one step.
	///
	/// Readers see either the previous map or the new one. Notifications go
	/// out only for keys that are new or changed, and for keys no longer
	/// present, after the swap.
	pub fn replace_all<I>(&self, secrets: I) -> BulkLoadSummary
	where
		I: IntoIterator<Item = (String, String)>,
	{
		let replacement: HashMap<String, String> = secrets.into_iter().collect();
		let commit = self.inner.commit.lock();

		let changes = {
			let mut entries = self.inner.entries.write();
			let mut changes = Vec::new();

			for (key, value) in &replacement {
				let old = entries.secrets.get(key);
				if old != Some(value) {
					changes.push(SecretChange::new(key.clone(), Some(value.clone()), old.cloned()));
				}
			}

			let retained: HashSet<&String> = replacement.keys().collect();
			for (key, old) in &entries.secrets {
				if !retained.contains(key) {
					changes.push(SecretChange::new(key.clone(), None, Some(old.clone())));
				}
			}

			entries.secrets = replacement;
			entries.last_updated = Some(Utc::now());
			changes
		};

		let removed = changes.iter().filter(|c| c.is_removal()).count();
		let summary = BulkLoadSummary {
			loaded: self.len(),
			changed: changes.len() - removed,
			removed,
		};

		self.publish(&commit, changes);
		summary
	}

	/// Queues `changes` and, unless this thread is already dispatching,
	/// drains the queue in order. Nested mutations made by callbacks land
	/// behind the change being delivered.
	fn publish(&self, queue: &RefCell<DispatchQueue>, changes: impl IntoIterator<Item = SecretChange>) {
		{
			let mut queue = queue.borrow_mut();
			queue.pending.extend(changes);
			if queue.dispatching {
				return;
			}
			queue.dispatching = true;
		}

		loop {
			let next = queue.borrow_mut().pending.pop_front();
			match next {
				Some(change) => {
					self.inner.hub.dispatch(&change);
				}
				None => break,
			}
		}

		queue.borrow_mut().dispatching = false;
	}

	/// Fetches the full secret set and replaces the cache with it.
	///
	/// On failure the cache is left exactly as it was.
	#[instrument(skip_all)]
	pub async fn bulk_load(
		&self,
		source: &dyn SecretSource,
		access_token: &SensitiveString,
	) -> Result<BulkLoadSummary, FetchError> {
		let secrets = source.fetch_all(access_token).await?;
		let summary = self.replace_all(
			secrets
				.into_iter()
				.map(|s| (s.secret_key, s.secret_value)),
		);
		info!(
			loaded = summary.loaded,
			changed = summary.changed,
			removed = summary.removed,
			"Loaded secrets"
		);
		Ok(summary)
	}
}

impl Default for SecretStore {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for SecretStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SecretStore")
			.field("len", &self.len())
			.field("last_updated", &self.last_updated())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::api::RawSecret;
	use async_trait::async_trait;
	use parking_lot::Mutex;
	use proptest::prelude::*;

	struct StaticSource(Result<Vec<(&'static str, &'static str)>, u16>);

	#[async_trait]
	impl SecretSource for StaticSource {
		async fn fetch_all(&self, access_token: &SensitiveString) -> Result<Vec<RawSecret>, FetchError> {
			assert_eq!(access_token.expose(), "access");
			match &self.0 {
				Ok(pairs) => Ok(pairs
					.iter()
					.map(|(k, v)| RawSecret {
						secret_key: k.to_string(),
						secret_value: v.to_string(),
					})
					.collect()),
				Err(status) => Err(FetchError::Status {
					status: *status,
					body: "nope".to_string(),
				}),
			}
		}
	}

	fn token() -> SensitiveString {
		SensitiveString::new("access".to_string())
	}

	fn record(store: &SecretStore, key: &str) -> Arc<Mutex<Vec<SecretChange>>> {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&seen);
		store.subscribe(key, move |change: &SecretChange| {
			sink.lock().push(change.clone());
			Ok(())
		});
		seen
	}

	#[test]
	fn missing_key_is_none() {
		let store = SecretStore::new();
		assert_eq!(store.get("NOPE"), None);
		assert!(store.is_empty());
		assert!(store.last_updated().is_none());
	}

	#[test]
	fn upsert_then_get_and_notify() {
		let store = SecretStore::new();
		let seen = record(&store, "DB_URL");

		store.apply_upsert("DB_URL", "v1");
		store.apply_upsert("DB_URL", "v2");

		assert_eq!(store.get("DB_URL").as_deref(), Some("v2"));
		assert_eq!(
			*seen.lock(),
			vec![
				SecretChange::new("DB_URL", Some("v1".into()), None),
				SecretChange::new("DB_URL", Some("v2".into()), Some("v1".into())),
			]
		);
		assert!(store.last_updated().is_some());
	}

	#[test]
	fn upsert_of_equal_value_still_notifies() {
		let store = SecretStore::new();
		store.apply_upsert("K", "same");
		let seen = record(&store, "K");

		store.apply_upsert("K", "same");

		assert_eq!(
			*seen.lock(),
			vec![SecretChange::new("K", Some("same".into()), Some("same".into()))]
		);
	}

	#[test]
	fn delete_of_absent_key_notifies_with_both_sides_absent() {
		let store = SecretStore::new();
		let seen = record(&store, "GHOST");

		let change = store.apply_delete("GHOST");

		assert_eq!(change, SecretChange::new("GHOST", None, None));
		assert_eq!(seen.lock().len(), 1);
	}

	#[test]
	fn get_all_is_a_snapshot() {
		let store = SecretStore::new();
		store.apply_upsert("A", "1");
		let snapshot = store.get_all();

		store.apply_upsert("A", "2");
		store.apply_upsert("B", "3");

		assert_eq!(snapshot.len(), 1);
		assert_eq!(snapshot["A"], "1");
		assert_eq!(store.len(), 2);
	}

	#[test]
	fn replace_all_notifies_only_differences() {
		let store = SecretStore::new();
		store.apply_upsert("SAME", "x");
		store.apply_upsert("CHANGED", "old");
		store.apply_upsert("GONE", "bye");
		let same = record(&store, "SAME");
		let changed = record(&store, "CHANGED");
		let gone = record(&store, "GONE");
		let new = record(&store, "NEW");

		let summary = store.replace_all(vec![
			("SAME".to_string(), "x".to_string()),
			("CHANGED".to_string(), "new".to_string()),
			("NEW".to_string(), "hello".to_string()),
		]);

		assert_eq!(
			summary,
			BulkLoadSummary {
				loaded: 3,
				changed: 2,
				removed: 1
			}
		);
		assert!(same.lock().is_empty());
		assert_eq!(
			*changed.lock(),
			vec![SecretChange::new("CHANGED", Some("new".into()), Some("old".into()))]
		);
		assert_eq!(
			*gone.lock(),
			vec![SecretChange::new("GONE", None, Some("bye".into()))]
		);
		assert_eq!(
			*new.lock(),
			vec![SecretChange::new("NEW", Some("hello".into()), None)]
		);
		assert_eq!(store.get("GONE"), None);
	}

	#[test]
	fn callback_can_read_store_during_dispatch() {
		let store = SecretStore::new();
		let observed = Arc::new(Mutex::new(None));
		let reader = store.clone();
		let sink = Arc::clone(&observed);
		store.subscribe("K", move |_: &SecretChange| {
			*sink.lock() = reader.get("K");
			Ok(())
		});

		store.apply_upsert("K", "visible");
		assert_eq!(observed.lock().as_deref(), Some("visible"));
	}

	#[test]
	fn callback_can_write_store_during_dispatch() {
		let store = SecretStore::new();
		let writer = store.clone();
		store.subscribe("SOURCE", move |change: &SecretChange| {
			if let Some(v) = &change.new_value {
				writer.apply_upsert("MIRROR", v.clone());
			}
			Ok(())
		});

		store.apply_upsert("SOURCE", "v");
		assert_eq!(store.get("MIRROR").as_deref(), Some("v"));
	}

	#[test]
	fn callback_writing_own_key_notifies_in_commit_order() {
		let store = SecretStore::new();
		let writer = store.clone();
		store.subscribe("K", move |change: &SecretChange| {
			if change.new_value.as_deref() == Some("v1") {
				writer.apply_upsert("K", "v2");
			}
			Ok(())
		});
		let seen = record(&store, "K");

		store.apply_upsert("K", "v1");

		assert_eq!(store.get("K").as_deref(), Some("v2"));
		assert_eq!(
			*seen.lock(),
			vec![
				SecretChange::new("K", Some("v1".into()), None),
				SecretChange::new("K", Some("v2".into()), Some("v1".into())),
			]
		);
		let last = seen.lock().last().and_then(|c| c.new_value.clone());
		assert_eq!(last, store.get("K"));
	}

	#[test]
	fn failing_callback_does_not_block_mutation() {
		let store = SecretStore::new();
		store.subscribe("K", |_: &SecretChange| Err("downstream unavailable".into()));
		store.subscribe("K", |_: &SecretChange| panic!("callback blew up"));
		let after = record(&store, "K");
		let other = record(&store, "OTHER");

		store.apply_upsert("K", "v");
		assert_eq!(store.get("K").as_deref(), Some("v"));
		assert_eq!(after.lock().len(), 1);

		store.apply_upsert("OTHER", "w");
		store.apply_delete("K");
		assert_eq!(store.get("OTHER").as_deref(), Some("w"));
		assert_eq!(store.get("K"), None);
		assert_eq!(
			*other.lock(),
			vec![SecretChange::new("OTHER", Some("w".into()), None)]
		);
		assert_eq!(after.lock().len(), 2);
	}

	#[test]
	fn concurrent_writers_and_readers_agree() {
		use std::sync::atomic::{AtomicBool, Ordering};

		const WRITERS: usize = 4;
		const PER_WRITER: usize = 200;

		let store = SecretStore::new();
		let done = AtomicBool::new(false);

		std::thread::scope(|scope| {
			let reader = scope.spawn(|| {
				let mut snapshots = 0usize;
				while !done.load(Ordering::Acquire) {
					for (key, value) in store.get_all() {
						let index = key.rsplit('-').next().unwrap_or_default();
						assert_eq!(value, index, "key {key}");
					}
					snapshots += 1;
				}
				snapshots
			});

			let writers: Vec<_> = (0..WRITERS)
				.map(|t| {
					let store = &store;
					scope.spawn(move || {
						for i in 0..PER_WRITER {
							store.apply_upsert(format!("w{t}-{i}"), i.to_string());
							if i % 2 == 1 {
								store.apply_delete(format!("w{t}-{}", i - 1));
							}
						}
					})
				})
				.collect();

			for writer in writers {
				writer.join().unwrap();
			}
			done.store(true, Ordering::Release);
			assert!(reader.join().unwrap() > 0);
		});

		assert_eq!(store.len(), WRITERS * PER_WRITER / 2);
		for t in 0..WRITERS {
			for i in 0..PER_WRITER {
				let value = store.get(&format!("w{t}-{i}"));
				if i % 2 == 1 {
					assert_eq!(value, Some(i.to_string()));
				} else {
					assert_eq!(value, None);
				}
			}
		}
	}

	#[tokio::test]
	async fn bulk_load_populates_cache() {
		let store = SecretStore::new();
		let source = StaticSource(Ok(vec![("DB_URL", "postgres://db"), ("API_KEY", "k")]));

		let summary = store.bulk_load(&source, &token()).await.unwrap();

		assert_eq!(summary.loaded, 2);
		assert_eq!(store.get("DB_URL").as_deref(), Some("postgres://db"));
		assert_eq!(store.get("API_KEY").as_deref(), Some("k"));
	}

	#[tokio::test]
	async fn failed_bulk_load_leaves_cache_untouched() {
		let store = SecretStore::new();
		store.apply_upsert("KEEP", "me");
		let before = store.last_updated();
		let seen = record(&store, "KEEP");

		let err = store
			.bulk_load(&StaticSource(Err(503)), &token())
			.await
			.unwrap_err();

		assert!(matches!(err, FetchError::Status { status: 503, .. }));
		assert_eq!(store.get("KEEP").as_deref(), Some("me"));
		assert_eq!(store.last_updated(), before);
		assert!(seen.lock().is_empty());
	}

	#[derive(Debug, Clone)]
	enum Op {
		Upsert(u8, u8),
		Delete(u8),
	}

	fn op_strategy() -> impl Strategy<Value = Op> {
		prop_oneof![
			(0u8..4, any::<u8>()).prop_map(|(k, v)| Op::Upsert(k, v)),
			(0u8..4).prop_map(Op::Delete),
		]
	}

	proptest! {
		#[test]
		fn store_matches_last_write_wins_model(ops in prop::collection::vec(op_strategy(), 0..64)) {
			let store = SecretStore::new();
			let mut model: HashMap<String, String> = HashMap::new();

			for op in ops {
				match op {
					Op::Upsert(k, v) => {
						let key = format!("K{k}");
						let change = store.apply_upsert(key.clone(), v.to_string());
						prop_assert_eq!(change.old_value, model.insert(key, v.to_string()));
					}
					Op::Delete(k) => {
						let key = format!("K{k}");
						let change = store.apply_delete(key.clone());
						prop_assert_eq!(change.old_value, model.remove(&key));
					}
				}
			}

			prop_assert_eq!(store.get_all(), model);
		}

		#[test]
		fn notifications_replay_to_final_value(values in prop::collection::vec(any::<Option<u8>>(), 1..32)) {
			let store = SecretStore::new();
			let seen = record(&store, "K");

			for value in &values {
				match value {
					Some(v) => { store.apply_upsert("K", v.to_string()); }
					None => { store.apply_delete("K"); }
				}
			}

			let seen = seen.lock();
			prop_assert_eq!(seen.len(), values.len());
			let last = seen.last().and_then(|c| c.new_value.clone());
			prop_assert_eq!(last, store.get("K"));
		}
	}
}
