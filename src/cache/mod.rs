//! TTL response cache
//!
//! Maps a deterministic request key to the last successful result for that
//! request. Expiry is purely age based: entries are dropped lazily when read
//! after their TTL, and swept in bulk once the map grows past its ceiling.
//! There is no LRU ordering.
//!
//! Timestamps use `tokio::time::Instant` so tests can drive expiry with a
//! paused clock.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use crate::context::PipelineContext;
use crate::result::PipelineResult;
use crate::steps::StepType;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub stored_at: Instant,
    pub result: PipelineResult,
}

#[derive(Debug)]
pub struct ResponseCache {
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// Cached result for `key` if it is younger than the TTL; expired entries are removed.
    pub fn get(&mut self, key: &str) -> Option<PipelineResult> {
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) => entry.stored_at.elapsed() >= self.ttl,
        };
        if expired {
            debug!(key, "cache entry expired");
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.result.clone())
    }

    /// Store `result` under `key`, sweeping expired entries once over the ceiling.
    pub fn put(&mut self, key: String, result: PipelineResult) {
        self.entries.insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                result,
            },
        );
        if self.entries.len() > self.max_entries {
            let removed = self.cleanup();
            debug!(removed, remaining = self.entries.len(), "cache swept");
        }
    }

    /// Drop every entry older than the TTL. Returns how many were removed.
    pub fn cleanup(&mut self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    step_type: &'a str,
    input_data: String,
    workspace_id: Option<&'a str>,
    goal_id: Option<&'a str>,
}

/// Stable cache key for a request: SHA-256 over the step type, the canonical
/// input and the workspace/goal identifiers.
pub fn cache_key(step: &StepType, input: &Value, ctx: &PipelineContext) -> String {
    let material = KeyMaterial {
        step_type: step.as_str(),
        input_data: canonical_json(input),
        workspace_id: ctx.workspace_id.as_deref(),
        goal_id: ctx.goal_id.as_deref(),
    };
    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

/// Compact JSON with object keys sorted at every depth.
///
/// Independent of whether `serde_json` preserves insertion order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
