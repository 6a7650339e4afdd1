//! Cache operations bound to one named cache.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use futures::future::try_join_all;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::{
    config::{CacheConfig, CacheMode},
    error::{GridClientError, Result},
    message::{decode_body, encode_body, from_value, to_value, CacheCommand, CacheRequest},
    node::NodeId,
    router::Router,
    selector::AffinityKey,
};

/// Handle for one cache. Cheap to clone; clones share routing state.
///
/// In a partitioned cache every keyed operation goes to the node owning the
/// key's affinity key, which is the JSON encoding of the key unless one is
/// supplied explicitly. Replicated caches spread requests with the load
/// balancer.
#[derive(Clone)]
pub struct DataProjection {
    router: Arc<Router>,
    cache: Option<String>,
    mode: CacheMode,
}

impl DataProjection {
    pub(crate) fn new(router: Arc<Router>, config: &CacheConfig) -> Self {
        Self {
            router,
            cache: config.name.clone(),
            mode: config.mode,
        }
    }

    /// `None` for the default cache.
    pub fn cache_name(&self) -> Option<&str> {
        self.cache.as_deref()
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub async fn put<K, V>(&self, key: &K, value: &V) -> Result<bool>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let affinity = self.key_affinity(key)?;
        self.put_routed(affinity, key, value).await
    }

    /// Stores `value` on the node owning `affinity` rather than the key's own owner.
    pub async fn put_with_affinity<K, V>(
        &self,
        affinity: &AffinityKey,
        key: &K,
        value: &V,
    ) -> Result<bool>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        self.put_routed(Some(affinity.clone()), key, value).await
    }

    async fn put_routed<K, V>(
        &self,
        affinity: Option<AffinityKey>,
        key: &K,
        value: &V,
    ) -> Result<bool>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let command = CacheCommand::Put {
            key: to_value(key)?,
            value: to_value(value)?,
        };
        from_value(self.run(command, affinity).await?)
    }

    pub async fn get<K, V>(&self, key: &K) -> Result<Option<V>>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        let affinity = self.key_affinity(key)?;
        self.get_routed(affinity, key).await
    }

    pub async fn get_with_affinity<K, V>(
        &self,
        affinity: &AffinityKey,
        key: &K,
    ) -> Result<Option<V>>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        self.get_routed(Some(affinity.clone()), key).await
    }

    async fn get_routed<K, V>(&self, affinity: Option<AffinityKey>, key: &K) -> Result<Option<V>>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        let command = CacheCommand::Get { key: to_value(key)? };
        match self.run(command, affinity).await? {
            Value::Null => Ok(None),
            value => from_value(value).map(Some),
        }
    }

    /// Returns whether an entry was removed.
    pub async fn remove<K>(&self, key: &K) -> Result<bool>
    where
        K: Serialize + ?Sized,
    {
        let command = CacheCommand::Remove { key: to_value(key)? };
        from_value(self.run(command, self.key_affinity(key)?).await?)
    }

    /// Overwrites an existing entry; returns false when the key was absent.
    pub async fn replace<K, V>(&self, key: &K, value: &V) -> Result<bool>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let command = CacheCommand::Replace {
            key: to_value(key)?,
            value: to_value(value)?,
        };
        from_value(self.run(command, self.key_affinity(key)?).await?)
    }

    /// Atomically sets the entry to `value` if it currently equals `expected`.
    ///
    /// `expected = None` matches an absent entry, so this doubles as
    /// put-if-absent; `value = None` removes the entry on match.
    pub async fn compare_and_set<K, V>(
        &self,
        key: &K,
        expected: Option<&V>,
        value: Option<&V>,
    ) -> Result<bool>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let command = CacheCommand::CompareAndSet {
            key: to_value(key)?,
            expected: expected.map(to_value).transpose()?,
            value: value.map(to_value).transpose()?,
        };
        from_value(self.run(command, self.key_affinity(key)?).await?)
    }

    /// Stores every entry, one request per owning node.
    pub async fn put_all<K, V, I>(&self, entries: I) -> Result<()>
    where
        K: Serialize,
        V: Serialize,
        I: IntoIterator<Item = (K, V)>,
    {
        let entries = entries
            .into_iter()
            .map(|(key, value)| Ok((to_value(&key)?, to_value(&value)?)))
            .collect::<Result<Vec<(Value, Value)>>>()?;
        let batches = self.partition(entries, |(key, _)| key)?;
        try_join_all(batches.into_iter().map(|(affinity, entries)| async move {
            self.run(CacheCommand::PutAll { entries }, affinity).await
        }))
        .await?;
        Ok(())
    }

    /// Fetches every present key; absent keys are missing from the map.
    pub async fn get_all<K, V, I>(&self, keys: I) -> Result<HashMap<K, V>>
    where
        K: Serialize + DeserializeOwned + Eq + Hash,
        V: DeserializeOwned,
        I: IntoIterator<Item = K>,
    {
        let keys = keys
            .into_iter()
            .map(|key| to_value(&key))
            .collect::<Result<Vec<Value>>>()?;
        let batches = self.partition(keys, |key| key)?;
        let responses = try_join_all(batches.into_iter().map(|(affinity, keys)| async move {
            self.run(CacheCommand::GetAll { keys }, affinity).await
        }))
        .await?;

        let mut found = HashMap::new();
        for response in responses {
            let pairs: Vec<(Value, Value)> = from_value(response)?;
            for (key, value) in pairs {
                found.insert(from_value(key)?, from_value(value)?);
            }
        }
        Ok(found)
    }

    pub async fn remove_all<K, I>(&self, keys: I) -> Result<()>
    where
        K: Serialize,
        I: IntoIterator<Item = K>,
    {
        let keys = keys
            .into_iter()
            .map(|key| to_value(&key))
            .collect::<Result<Vec<Value>>>()?;
        let batches = self.partition(keys, |key| key)?;
        try_join_all(batches.into_iter().map(|(affinity, keys)| async move {
            self.run(CacheCommand::RemoveAll { keys }, affinity).await
        }))
        .await?;
        Ok(())
    }

    /// Node currently owning `key` in this cache's topology.
    pub fn affinity<K>(&self, key: &K) -> Result<NodeId>
    where
        K: Serialize + ?Sized,
    {
        self.router.ensure_open()?;
        self.router.owner(&AffinityKey::of(key)?, None)
    }

    fn key_affinity<K>(&self, key: &K) -> Result<Option<AffinityKey>>
    where
        K: Serialize + ?Sized,
    {
        match self.mode {
            CacheMode::Partitioned => AffinityKey::of(key).map(Some),
            CacheMode::Replicated => Ok(None),
        }
    }

    /// Groups items by owning node. Each group is routed by the affinity key of
    /// its first item, which resolves to the same owner. Replicated caches send
    /// everything as one unrouted batch.
    fn partition<T, F>(
        &self,
        items: Vec<T>,
        key_of: F,
    ) -> Result<Vec<(Option<AffinityKey>, Vec<T>)>>
    where
        F: Fn(&T) -> &Value,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        if self.mode == CacheMode::Replicated {
            return Ok(vec![(None, items)]);
        }

        let mut groups: Vec<(NodeId, AffinityKey, Vec<T>)> = Vec::new();
        for item in items {
            let affinity = AffinityKey::of(key_of(&item))?;
            let owner = self.router.owner(&affinity, None)?;
            match groups.iter_mut().find(|(node, _, _)| *node == owner) {
                Some((_, _, members)) => members.push(item),
                None => groups.push((owner, affinity, vec![item])),
            }
        }
        Ok(groups
            .into_iter()
            .map(|(_, affinity, members)| (Some(affinity), members))
            .collect())
    }

    async fn run(&self, command: CacheCommand, affinity: Option<AffinityKey>) -> Result<Value> {
        self.router.ensure_open()?;
        let opcode = command.opcode();
        let request = CacheRequest {
            cache: self.cache.clone(),
            command,
        };
        let payload = encode_body(&request)?;
        trace!(cache = ?self.cache, ?opcode, routed = affinity.is_some(), "cache request");

        let body = self.router.call(opcode, payload, affinity.as_ref(), None).await?;
        if body.is_empty() {
            return Err(GridClientError::Protocol(format!("empty response to {opcode:?}")));
        }
        decode_body(&body)
    }
}
