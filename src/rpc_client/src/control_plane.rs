// Copyright 2024 Photon Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Key-value + pubsub transport to the cluster metadata service.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{Result, RpcError};

pub type ControlPlaneRef = Arc<dyn ControlPlaneClient>;

const CHANNEL_CAPACITY: usize = 1024;

/// Client connection to the control plane.
///
/// Keys live in separate namespaces per data kind (plain values, hashes,
/// lists, sorted sets), matching the underlying store's semantics.
#[async_trait::async_trait]
pub trait ControlPlaneClient: Send + Sync + 'static {
    async fn kv_get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn kv_set(&self, key: &str, value: Bytes) -> Result<()>;

    /// Atomic set-if-absent. Returns `true` if this call created the key.
    async fn set_if_absent(&self, key: &str, value: Bytes) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn hash_set(&self, key: &str, fields: Vec<(String, Bytes)>) -> Result<()>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Bytes>>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Bytes>>;

    /// Append to a list; returns the new list length.
    async fn list_push(&self, key: &str, value: Bytes) -> Result<u64>;

    /// Inclusive range over a list, with negative indices counting from the
    /// end (`-1` is the last element).
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>>;

    async fn zadd(&self, key: &str, score: f64, member: Bytes) -> Result<()>;

    /// Members of a sorted set by ascending score, `start..=stop` with the
    /// same index convention as [`Self::list_range`].
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>>;

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to a pubsub channel. The receiver ends when the client
    /// disconnects.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Bytes>>;

    async fn disconnect(&self) -> Result<()>;
}

#[derive(Default)]
struct CpState {
    kv: HashMap<String, Bytes>,
    hashes: HashMap<String, HashMap<String, Bytes>>,
    lists: HashMap<String, Vec<Bytes>>,
    zsets: HashMap<String, Vec<(f64, Bytes)>>,
    channels: HashMap<String, broadcast::Sender<Bytes>>,
    disconnected: bool,
}

/// In-memory control plane backing the embedded single-node cluster.
#[derive(Default)]
pub struct InMemControlPlane {
    state: Mutex<CpState>,
}

impl InMemControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_connected(state: &CpState) -> Result<()> {
        if state.disconnected {
            return Err(RpcError::ConnectionClosed("control plane"));
        }
        Ok(())
    }
}

fn clamp_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let resolve = |idx: i64| if idx < 0 { len + idx } else { idx };
    let start = resolve(start).max(0);
    let stop = resolve(stop).min(len - 1);
    (start <= stop && len > 0).then_some((start as usize, stop as usize))
}

#[async_trait::async_trait]
impl ControlPlaneClient for InMemControlPlane {
    async fn kv_get(&self, key: &str) -> Result<Option<Bytes>> {
        let state = self.state.lock();
        Self::check_connected(&state)?;
        Ok(state.kv.get(key).cloned())
    }

    async fn kv_set(&self, key: &str, value: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        state.kv.insert(key.to_owned(), value);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Bytes) -> Result<bool> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        if state.kv.contains_key(key) {
            return Ok(false);
        }
        state.kv.insert(key.to_owned(), value);
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let state = self.state.lock();
        Self::check_connected(&state)?;
        Ok(state.kv.contains_key(key)
            || state.hashes.contains_key(key)
            || state.lists.contains_key(key)
            || state.zsets.contains_key(key))
    }

    async fn hash_set(&self, key: &str, fields: Vec<(String, Bytes)>) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        let hash = state.hashes.entry(key.to_owned()).or_default();
        for (field, value) in fields {
            hash.insert(field, value);
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Bytes>> {
        let state = self.state.lock();
        Self::check_connected(&state)?;
        Ok(state
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Bytes>> {
        let state = self.state.lock();
        Self::check_connected(&state)?;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn list_push(&self, key: &str, value: Bytes) -> Result<u64> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        let list = state.lists.entry(key.to_owned()).or_default();
        list.push(value);
        Ok(list.len() as u64)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>> {
        let state = self.state.lock();
        Self::check_connected(&state)?;
        let Some(list) = state.lists.get(key) else {
            return Ok(vec![]);
        };
        Ok(match clamp_range(list.len(), start, stop) {
            Some((start, stop)) => list[start..=stop].to_vec(),
            None => vec![],
        })
    }

    async fn zadd(&self, key: &str, score: f64, member: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        let zset = state.zsets.entry(key.to_owned()).or_default();
        zset.retain(|(_, m)| m != &member);
        zset.push((score, member));
        zset.sort_by(|(a, _), (b, _)| a.total_cmp(b));
        Ok(())
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>> {
        let state = self.state.lock();
        Self::check_connected(&state)?;
        let Some(zset) = state.zsets.get(key) else {
            return Ok(vec![]);
        };
        Ok(match clamp_range(zset.len(), start, stop) {
            Some((start, stop)) => zset[start..=stop]
                .iter()
                .map(|(_, member)| member.clone())
                .collect(),
            None => vec![],
        })
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        let sender = {
            let mut state = self.state.lock();
            Self::check_connected(&state)?;
            state
                .channels
                .entry(channel.to_owned())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .clone()
        };
        // A publish with no subscribers is not an error.
        let _ = sender.send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Bytes>> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        Ok(state
            .channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.disconnected = true;
        // Dropping the senders ends every subscription stream.
        state.channels.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn set_if_absent_is_first_writer_wins() {
        let cp = InMemControlPlane::new();
        assert!(cp.set_if_absent("lock", Bytes::from_static(b"1")).await.unwrap());
        assert!(!cp.set_if_absent("lock", Bytes::from_static(b"2")).await.unwrap());
        assert_eq!(
            cp.kv_get("lock").await.unwrap(),
            Some(Bytes::from_static(b"1"))
        );
    }

    #[tokio::test]
    async fn hashes_merge_fields() {
        let cp = InMemControlPlane::new();
        cp.hash_set("h", vec![("a".into(), Bytes::from_static(b"1"))])
            .await
            .unwrap();
        cp.hash_set("h", vec![("b".into(), Bytes::from_static(b"2"))])
            .await
            .unwrap();
        let all = cp.hash_get_all("h").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(
            cp.hash_get("h", "a").await.unwrap(),
            Some(Bytes::from_static(b"1"))
        );
    }

    #[tokio::test]
    async fn list_range_follows_negative_indices() {
        let cp = InMemControlPlane::new();
        for b in [b"a", b"b", b"c"] {
            cp.list_push("l", Bytes::from_static(b)).await.unwrap();
        }
        assert_eq!(
            cp.list_range("l", 0, -1).await.unwrap(),
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c")
            ]
        );
        assert_eq!(
            cp.list_range("l", 1, 1).await.unwrap(),
            vec![Bytes::from_static(b"b")]
        );
        assert_eq!(
            cp.list_range("missing", 0, -1).await.unwrap(),
            Vec::<Bytes>::new()
        );
    }

    #[tokio::test]
    async fn zrange_orders_by_score() {
        let cp = InMemControlPlane::new();
        cp.zadd("z", 2.0, Bytes::from_static(b"second")).await.unwrap();
        cp.zadd("z", 1.0, Bytes::from_static(b"first")).await.unwrap();
        assert_eq!(
            cp.zrange("z", 0, -1).await.unwrap(),
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );
    }

    #[tokio::test]
    async fn pubsub_delivers_to_subscribers() {
        let cp = InMemControlPlane::new();
        let mut rx = cp.subscribe("events").await.unwrap();
        cp.publish("events", Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn disconnect_ends_subscriptions() {
        let cp = InMemControlPlane::new();
        let mut rx = cp.subscribe("events").await.unwrap();
        cp.disconnect().await.unwrap();
        assert!(rx.recv().await.is_err());
        assert!(cp.kv_get("k").await.is_err());
    }
}
