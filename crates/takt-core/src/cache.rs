// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use takt_model::{ModelClient, ToolSchema};
use takt_session::{modify_json_locked, read_json_locked};

/// Remote cache TTL requested on creation.
const CACHE_TTL_SECS: u64 = 3600;

/// Local expiry is kept shorter than the remote TTL to avoid edge cases
/// around the remote-side deadline.
const LOCAL_EXPIRY_MINUTES: i64 = 55;

/// Expired entries removed per sweep; capped to bound per-request latency.
const EXPIRY_SWEEP_CAP: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRegistryEntry {
    /// Remote resource name, e.g. `cachedContents/abc`.
    pub name: String,
    /// Local conservative expiry, RFC 3339.
    pub expire_time: String,
    /// The session whose request created this cache.
    pub session_id: String,
}

/// Local mapping from content hash to remote cache resource, stored beside
/// the sessions under its own lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheRegistry {
    #[serde(default)]
    pub entries: BTreeMap<String, CacheRegistryEntry>,
}

/// Decides create-vs-reuse-vs-skip for the remote content cache and keeps the
/// local registry in sync. Every remote failure degrades to "no cache for
/// this request" — a request never fails because of the cache.
pub struct CacheManager {
    registry_path: PathBuf,
    registry_lock_path: PathBuf,
    client: Arc<dyn ModelClient>,
}

impl CacheManager {
    pub fn new(sessions_dir: &Path, client: Arc<dyn ModelClient>) -> Self {
        Self {
            registry_path: sessions_dir.join(".cache_registry.json"),
            registry_lock_path: sessions_dir.join(".cache_registry.json.lock"),
            client,
        }
    }

    fn load_registry(&self) -> CacheRegistry {
        read_json_locked(
            &self.registry_lock_path,
            &self.registry_path,
            Some(CacheRegistry::default()),
        )
        .unwrap_or_default()
    }

    fn store_registry(&self, modify: impl FnOnce(&mut CacheRegistry)) {
        if let Err(e) = modify_json_locked(
            &self.registry_lock_path,
            &self.registry_path,
            Some(CacheRegistry::default()),
            modify,
        ) {
            warn!(error = %e, "cache registry write failed");
        }
    }

    /// Remove locally expired entries (at most [`EXPIRY_SWEEP_CAP`] per call)
    /// with a best-effort remote delete for each.
    pub async fn sweep_expired(&self) {
        let now = Utc::now();
        let registry = self.load_registry();
        let expired: Vec<(String, String)> = registry
            .entries
            .iter()
            .filter(|(_, entry)| is_expired(&entry.expire_time, now))
            .take(EXPIRY_SWEEP_CAP)
            .map(|(hash, entry)| (hash.clone(), entry.name.clone()))
            .collect();
        if expired.is_empty() {
            return;
        }

        for (_, name) in &expired {
            if let Err(e) = self.client.delete_cache(name).await {
                debug!(cache = %name, error = %e, "remote delete of expired cache failed");
            }
        }
        self.store_registry(|registry| {
            for (hash, _) in &expired {
                registry.entries.remove(hash);
            }
        });
    }

    /// Create (or recreate) the cache for this static content + tool set.
    /// Any previous cache recorded for the session is deleted first. Returns
    /// the new cache name, or `None` when the remote call failed.
    pub async fn create_cache(
        &self,
        session_id: &str,
        static_content: &str,
        tools: &[ToolSchema],
    ) -> Option<String> {
        let hash = content_hash(static_content, tools);

        let registry = self.load_registry();
        let previous: Vec<(String, String)> = registry
            .entries
            .iter()
            .filter(|(_, entry)| entry.session_id == session_id)
            .map(|(h, entry)| (h.clone(), entry.name.clone()))
            .collect();
        for (_, name) in &previous {
            // "Not found" and every other error are equally uninteresting:
            // the replacement cache is about to be created.
            let _ = self.client.delete_cache(name).await;
        }

        let created = match self
            .client
            .create_cache(static_content, tools, CACHE_TTL_SECS)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                warn!(error = %e, "cache creation failed, sending content inline");
                return None;
            }
        };

        let expire_time = (Utc::now() + Duration::minutes(LOCAL_EXPIRY_MINUTES)).to_rfc3339();
        let entry = CacheRegistryEntry {
            name: created.name.clone(),
            expire_time,
            session_id: session_id.to_string(),
        };
        self.store_registry(|registry| {
            for (h, _) in &previous {
                registry.entries.remove(h);
            }
            registry.entries.insert(hash, entry);
        });
        Some(created.name)
    }

    /// Look up a live cache for this content. A registry hit is verified
    /// remotely; a cache that is gone is dropped from the registry and `None`
    /// comes back so the caller sends the content inline.
    pub async fn reuse_cache(&self, static_content: &str, tools: &[ToolSchema]) -> Option<String> {
        let hash = content_hash(static_content, tools);
        let registry = self.load_registry();
        let entry = registry.entries.get(&hash)?;

        if is_expired(&entry.expire_time, Utc::now()) {
            return None;
        }

        match self.client.cache_exists(&entry.name).await {
            Ok(true) => Some(entry.name.clone()),
            Ok(false) | Err(_) => {
                debug!(cache = %entry.name, "registered cache no longer exists remotely");
                let hash_owned = hash.clone();
                self.store_registry(move |registry| {
                    registry.entries.remove(&hash_owned);
                });
                None
            }
        }
    }

    /// Test/diagnostic view of the registry.
    pub fn registry_snapshot(&self) -> CacheRegistry {
        self.load_registry()
    }
}

fn is_expired(expire_time: &str, now: DateTime<Utc>) -> bool {
    match DateTime::parse_from_rfc3339(expire_time) {
        Ok(t) => t.with_timezone(&Utc) < now,
        // An unreadable deadline counts as expired so the entry gets culled.
        Err(_) => true,
    }
}

/// Strong hash over the static content plus the tool definitions; the cache
/// key must change whenever either does.
pub(crate) fn content_hash(static_content: &str, tools: &[ToolSchema]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(static_content.as_bytes());
    if !tools.is_empty() {
        let tools_json = serde_json::to_string(tools).unwrap_or_default();
        hasher.update(tools_json.as_bytes());
    }
    hex::encode(hasher.finalize())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
