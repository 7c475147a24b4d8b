//! Optional write-through persistence for quizzes, games and sessions.
//!
//! In-memory actor state is always authoritative. The store only lets a
//! restarted process pick up where the last one left off, so every failure
//! here is logged and swallowed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::PersistenceError;

pub const QUIZ_PREFIX: &str = "quiz:";
pub const GAME_PREFIX: &str = "game:";
pub const SESSION_PREFIX: &str = "session:";
pub const QUIZ_ID_COUNTER: &str = "quiz-id";

pub fn quiz_key(id: impl std::fmt::Display) -> String {
    format!("{QUIZ_PREFIX}{id}")
}

pub fn game_key(pin: impl std::fmt::Display) -> String {
    format!("{GAME_PREFIX}{pin}")
}

pub fn session_key(id: &str) -> String {
    format!("{SESSION_PREFIX}{id}")
}

/// Key/value engine with optional per-key expiry
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, PersistenceError>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>)
        -> Result<(), PersistenceError>;
    async fn delete(&self, key: &str) -> Result<(), PersistenceError>;
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, PersistenceError>;
    async fn increment(&self, counter: &str) -> Result<u64, PersistenceError>;
}

pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, PersistenceError> {
        let client = Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), PersistenceError> {
        let mut conn = self.connection.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        let mut conn = self.connection.clone();
        let keys: Vec<String> = conn.keys(format!("{prefix}*")).await?;
        Ok(keys)
    }

    async fn increment(&self, counter: &str) -> Result<u64, PersistenceError> {
        let mut conn = self.connection.clone();
        let value: u64 = conn.incr(counter, 1u64).await?;
        Ok(value)
    }
}

/// In-process store. TTLs are recorded but never enforced.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Option<Duration>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        self.entries.lock().await.get(key).and_then(|(_, ttl)| *ttl)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(key)
            .map(|(value, _)| value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), PersistenceError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn increment(&self, counter: &str) -> Result<u64, PersistenceError> {
        let mut entries = self.entries.lock().await;
        let current = entries
            .get(counter)
            .and_then(|(value, _)| value.parse::<u64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        entries.insert(counter.to_string(), (next.to_string(), None));
        Ok(next)
    }
}

/// Best-effort JSON persistence over an optional engine.
///
/// Every method is a no-op without an engine and never fails: errors are
/// logged and reported as "nothing stored".
#[derive(Clone, Default)]
pub struct Persistence {
    store: Option<Arc<dyn KeyValueStore>>,
}

impl Persistence {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store: Some(store) }
    }

    pub fn disabled() -> Self {
        Self { store: None }
    }

    #[cfg(test)]
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub async fn save<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let Some(store) = &self.store else {
            return;
        };
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = store.set(key, json, ttl).await {
            warn!("Failed to persist {}: {}", key, e);
        } else {
            debug!("Persisted {}", key);
        }
    }

    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let store = self.store.as_ref()?;
        let json = match store.get(key).await {
            Ok(Some(json)) => json,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to load {}: {}", key, e);
                return None;
            }
        };
        match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Discarding unreadable record {}: {}", key, e);
                None
            }
        }
    }

    /// Loads every readable record whose key starts with `prefix`.
    pub async fn load_all<T: DeserializeOwned>(&self, prefix: &str) -> Vec<T> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        let keys = match store.keys_with_prefix(prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to scan {}*: {}", prefix, e);
                return Vec::new();
            }
        };

        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.load(&key).await {
                values.push(value);
            }
        }
        values
    }

    pub async fn delete(&self, key: &str) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.delete(key).await {
            warn!("Failed to delete {}: {}", key, e);
        }
    }

    pub async fn increment(&self, counter: &str) -> Option<u64> {
        let store = self.store.as_ref()?;
        match store.increment(counter).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to increment {}: {}", counter, e);
                None
            }
        }
    }
}
