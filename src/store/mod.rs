//! The sharded client/channel index.
//!
//! Grounded on `spacetimedb-data-structures`'s sharded-map shape (`ahash`-seeded
//! shard selection, `parking_lot::RwLock` per shard, never `.await` while a
//! shard lock is held) and the teacher's `BsatnRowListBuilderPool` for the
//! pooled snapshot buffer used by [`ClientStore::find`].
//!
//! Two independent indexes are kept in sync by convention, not by a shared
//! lock (invariant I5, §5 of the design notes): a *clients* index
//! (`id -> (Client, set<ChannelName>)`) and a *channels* index
//! (`channel -> {id -> Client}`). Cross-index updates briefly interleave;
//! readers that observe the interleaving may over- or under-count, which is
//! an accepted trade against a single global lock.

use std::collections::{HashMap, HashSet};
use std::hash::{BuildHasher, Hash};

use ahash::RandomState;
use parking_lot::RwLock;

use crate::channel::ChannelName;
use crate::client::Client;
use crate::error::NotFound;
use crate::identity::ClientId;
use crate::pool::BufferPool;

struct ClientEntry {
    client: Client,
    channels: HashSet<ChannelName>,
}

/// Sharded index over connected clients and the channels they subscribe to.
pub struct ClientStore {
    hasher: RandomState,
    clients: Vec<RwLock<HashMap<ClientId, ClientEntry>>>,
    channels: Vec<RwLock<HashMap<ChannelName, HashMap<ClientId, Client>>>>,
    snapshot_pool: BufferPool<Vec<Client>>,
}

impl ClientStore {
    pub fn new(client_shards: usize, channel_shards: usize) -> Self {
        let client_shards = client_shards.max(1);
        let channel_shards = channel_shards.max(1);
        Self {
            hasher: RandomState::new(),
            clients: (0..client_shards).map(|_| RwLock::new(HashMap::new())).collect(),
            channels: (0..channel_shards).map(|_| RwLock::new(HashMap::new())).collect(),
            snapshot_pool: BufferPool::new(client_shards.max(channel_shards)),
        }
    }

    fn shard_of<T: Hash + ?Sized>(&self, key: &T, n_shards: usize) -> usize {
        (self.hasher.hash_one(key) % n_shards as u64) as usize
    }

    fn client_shard(&self, id: &ClientId) -> &RwLock<HashMap<ClientId, ClientEntry>> {
        &self.clients[self.shard_of(id, self.clients.len())]
    }

    fn channel_shard(&self, name: &str) -> &RwLock<HashMap<ChannelName, HashMap<ClientId, Client>>> {
        &self.channels[self.shard_of(name, self.channels.len())]
    }

    /// Looks up a client by id.
    pub fn get(&self, id: ClientId) -> Result<Client, NotFound> {
        self.client_shard(&id)
            .read()
            .get(&id)
            .map(|entry| entry.client.clone())
            .ok_or(NotFound(id))
    }

    /// Registers a client with no channel subscriptions, overwriting any prior
    /// entry for the same id.
    pub fn set(&self, client: Client) {
        let id = client.id();
        self.client_shard(&id).write().insert(
            id,
            ClientEntry {
                client,
                channels: HashSet::new(),
            },
        );
    }

    /// Removes a client from the clients index and unlinks it from every
    /// channel it was subscribed to.
    pub fn unset(&self, id: ClientId) {
        self.client_shard(&id).write().remove(&id);
        for shard in &self.channels {
            let mut shard = shard.write();
            shard.retain(|_name, bucket| {
                bucket.remove(&id);
                !bucket.is_empty()
            });
        }
    }

    /// Global client count when `channels` is empty; otherwise the sum of
    /// per-channel bucket sizes (a client in several named channels is
    /// counted once per channel, matching `Count`'s documented semantics).
    pub fn count(&self, channels: &[ChannelName]) -> usize {
        if channels.is_empty() {
            return self.clients.iter().map(|shard| shard.read().len()).sum();
        }
        channels
            .iter()
            .map(|name| self.channel_shard(name).read().get(name.as_ref()).map_or(0, HashMap::len))
            .sum()
    }

    /// Visits the union (deduplicated by id) of clients subscribed to any of
    /// `channels`, or every connected client when `channels` is empty.
    ///
    /// Never holds a shard lock while `visit` runs: it snapshots into a
    /// pooled buffer one shard at a time, releasing each lock before
    /// acquiring the next, then invokes `visit` over the snapshot. A client
    /// disconnected between snapshot and visit is still visited; its next
    /// `Send` will fail and the caller (typically `Hub::publish`) disconnects
    /// it idempotently.
    pub fn find(&self, channels: &[ChannelName], mut visit: impl FnMut(&Client)) {
        let mut buffer = self.snapshot_pool.take(|buf| buf.clear(), Vec::new);

        if channels.is_empty() {
            for shard in &self.clients {
                let shard = shard.read();
                buffer.extend(shard.values().map(|entry| entry.client.clone()));
            }
        } else {
            let mut seen = HashSet::with_capacity(buffer.capacity());
            for name in channels {
                let shard = self.channel_shard(name).read();
                if let Some(bucket) = shard.get(name.as_ref()) {
                    for (id, client) in bucket {
                        if seen.insert(*id) {
                            buffer.push(client.clone());
                        }
                    }
                }
            }
        }

        for client in &buffer {
            visit(client);
        }

        self.snapshot_pool.put(buffer);
    }

    /// The channel names a client is currently subscribed to.
    pub fn channels(&self, id: ClientId) -> Result<Vec<ChannelName>, NotFound> {
        self.client_shard(&id)
            .read()
            .get(&id)
            .map(|entry| entry.channels.iter().cloned().collect())
            .ok_or(NotFound(id))
    }

    /// Number of channels a client is subscribed to. `NotFound` if the client
    /// is not registered, distinguishing "zero subscriptions" from "unknown
    /// client" — see [`ClientStore::is_subscribed`] for the silently-folded
    /// variant.
    pub fn channel_count_checked(&self, id: ClientId) -> Result<usize, NotFound> {
        self.client_shard(&id)
            .read()
            .get(&id)
            .map(|entry| entry.channels.len())
            .ok_or(NotFound(id))
    }

    /// Whether a client has at least one channel subscription. An unknown
    /// client silently reads as `false`, rather than surfacing `NotFound`;
    /// use [`ClientStore::channel_count_checked`] when the distinction
    /// matters.
    pub fn is_subscribed(&self, id: ClientId) -> bool {
        self.channel_count_checked(id).map(|n| n > 0).unwrap_or(false)
    }

    /// Adds `names` to a client's subscription set. Locks the client shard
    /// first (adding names to its set) and releases it before locking each
    /// channel shard in turn to insert `id -> client`. The reverse order
    /// would admit a state where the channels index claims a subscription the
    /// clients index denies.
    pub fn set_channels(&self, id: ClientId, names: &[ChannelName]) -> Result<(), NotFound> {
        let client = {
            let mut shard = self.client_shard(&id).write();
            let entry = shard.get_mut(&id).ok_or(NotFound(id))?;
            entry.channels.extend(names.iter().cloned());
            entry.client.clone()
        };

        for name in names {
            self.channel_shard(name)
                .write()
                .entry(name.clone())
                .or_default()
                .insert(id, client.clone());
        }

        Ok(())
    }

    /// Removes `names` from a client's subscription set, or every
    /// subscription when `names` is empty. Symmetric to
    /// [`ClientStore::set_channels`]: the client shard is updated and
    /// released first, then each affected channel shard.
    pub fn unset_channels(&self, id: ClientId, names: &[ChannelName]) -> Result<(), NotFound> {
        let removed: Vec<ChannelName> = {
            let mut shard = self.client_shard(&id).write();
            let entry = shard.get_mut(&id).ok_or(NotFound(id))?;
            if names.is_empty() {
                entry.channels.drain().collect()
            } else {
                for name in names {
                    entry.channels.remove(name);
                }
                names.to_vec()
            }
        };

        if names.is_empty() {
            for shard in &self.channels {
                let mut shard = shard.write();
                shard.retain(|_name, bucket| {
                    bucket.remove(&id);
                    !bucket.is_empty()
                });
            }
        } else {
            for name in &removed {
                let mut shard = self.channel_shard(name).write();
                if let Some(bucket) = shard.get_mut(name.as_ref()) {
                    bucket.remove(&id);
                    if bucket.is_empty() {
                        shard.remove(name.as_ref());
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ClientMetrics;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn client(byte: u8) -> Client {
        Client::new(
            ClientId::from_bytes([byte; 16]),
            8,
            Duration::from_secs(30),
            ClientMetrics::detached(),
        )
    }

    fn name(s: &str) -> ChannelName {
        s.into()
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = ClientStore::new(4, 4);
        let err = store.get(ClientId::from_bytes([1; 16])).unwrap_err();
        assert_eq!(err.0, ClientId::from_bytes([1; 16]));
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = ClientStore::new(4, 4);
        let c = client(1);
        let id = c.id();
        store.set(c);
        assert_eq!(store.get(id).unwrap().id(), id);
    }

    #[test]
    fn unset_removes_from_every_channel() {
        let store = ClientStore::new(2, 2);
        let c = client(1);
        let id = c.id();
        store.set(c);
        store.set_channels(id, &[name("a"), name("b")]).unwrap();
        assert_eq!(store.count(&[name("a")]), 1);

        store.unset(id);
        assert!(store.get(id).is_err());
        assert_eq!(store.count(&[name("a")]), 0);
        assert_eq!(store.count(&[name("b")]), 0);
    }

    #[test]
    fn count_without_channels_is_global() {
        let store = ClientStore::new(4, 4);
        store.set(client(1));
        store.set(client(2));
        assert_eq!(store.count(&[]), 2);
    }

    #[test]
    fn count_with_channels_double_counts_shared_clients() {
        let store = ClientStore::new(4, 4);
        let c = client(1);
        let id = c.id();
        store.set(c);
        store.set_channels(id, &[name("a"), name("b")]).unwrap();
        assert_eq!(store.count(&[name("a"), name("b")]), 2);
    }

    #[test]
    fn find_deduplicates_across_requested_channels() {
        let store = ClientStore::new(4, 4);
        let c = client(1);
        let id = c.id();
        store.set(c);
        store.set_channels(id, &[name("a"), name("b")]).unwrap();

        let seen = AtomicUsize::new(0);
        store.find(&[name("a"), name("b")], |_client| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn find_with_no_channels_visits_everyone() {
        let store = ClientStore::new(4, 4);
        store.set(client(1));
        store.set(client(2));
        store.set(client(3));

        let seen = AtomicUsize::new(0);
        store.find(&[], |_client| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unset_channels_with_empty_list_clears_all() {
        let store = ClientStore::new(4, 4);
        let c = client(1);
        let id = c.id();
        store.set(c);
        store.set_channels(id, &[name("a"), name("b")]).unwrap();

        store.unset_channels(id, &[]).unwrap();
        assert_eq!(store.channel_count_checked(id).unwrap(), 0);
        assert_eq!(store.count(&[name("a")]), 0);
    }

    #[test]
    fn is_subscribed_folds_not_found_into_false() {
        let store = ClientStore::new(4, 4);
        assert!(!store.is_subscribed(ClientId::from_bytes([9; 16])));

        let c = client(1);
        let id = c.id();
        store.set(c);
        assert!(!store.is_subscribed(id));
        store.set_channels(id, &[name("a")]).unwrap();
        assert!(store.is_subscribed(id));
    }

    #[test]
    fn set_channels_on_unknown_client_is_not_found() {
        let store = ClientStore::new(4, 4);
        let err = store.set_channels(ClientId::from_bytes([7; 16]), &[name("a")]).unwrap_err();
        assert_eq!(err.0, ClientId::from_bytes([7; 16]));
    }
}
