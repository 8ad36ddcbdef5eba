//! Process-wide pool of blocking-reload agents.
//!
//! Requests that share a blocking key must be serialized through a single
//! connection so the server can sequence its long-poll responses. Each key
//! maps to a dedicated single-connection client plus an async gate; agents
//! are reference-counted and swept once they have sat unreferenced for a
//! grace period.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::OwnedMutexGuard;

use crate::config::HttpConfig;
use crate::error::{PlaylistError, PlaylistResult};

/// Idle grace period before an unreferenced agent is swept.
const RELEASE_AFTER: Duration = Duration::from_secs(10);

type PoolKey = (String, String);

struct AgentEntry {
    client: Client,
    gate: Arc<tokio::sync::Mutex<()>>,
    refs: usize,
    idle_since: Option<Instant>,
}

static POOL: OnceLock<Mutex<HashMap<PoolKey, AgentEntry>>> = OnceLock::new();

fn pool() -> &'static Mutex<HashMap<PoolKey, AgentEntry>> {
    POOL.get_or_init(Default::default)
}

/// Handle to a pooled single-connection agent. Dropping the handle releases
/// the reference; the entry itself survives `RELEASE_AFTER` of idleness so a
/// fetcher that re-polls promptly keeps its connection.
pub(crate) struct BlockingAgent {
    key: PoolKey,
    client: Client,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl BlockingAgent {
    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    /// Serialize a request through the agent's single connection. The guard
    /// must be held until the response body has been fully consumed.
    pub(crate) async fn lock(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.gate).lock_owned().await
    }
}

impl Drop for BlockingAgent {
    fn drop(&mut self) {
        let mut map = pool().lock().expect("agent pool poisoned");
        if let Some(entry) = map.get_mut(&self.key) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entry.idle_since = Some(Instant::now());
            }
        }
    }
}

/// Acquire (or create) the agent for a blocking key.
pub(crate) fn acquire(key: &str, scheme: &str, config: &HttpConfig) -> PlaylistResult<BlockingAgent> {
    let pool_key = (key.to_string(), scheme.to_string());
    let mut map = pool().lock().expect("agent pool poisoned");

    // Sweep agents that outlived their grace period. Running the sweep on
    // access keeps `Drop` free of any runtime dependency.
    map.retain(|_, entry| {
        entry.refs > 0
            || entry
                .idle_since
                .is_none_or(|since| since.elapsed() < RELEASE_AFTER)
    });

    if let Some(entry) = map.get_mut(&pool_key) {
        entry.refs += 1;
        entry.idle_since = None;
        return Ok(BlockingAgent {
            key: pool_key,
            client: entry.client.clone(),
            gate: Arc::clone(&entry.gate),
        });
    }

    tracing::debug!(key, scheme, "creating blocking agent");
    let client = Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(config.connect_timeout)
        .pool_max_idle_per_host(1)
        .pool_idle_timeout(config.pool_idle_timeout)
        .build()
        .map_err(|e| PlaylistError::transport(format!("failed to build blocking agent: {e}")))?;

    let gate = Arc::new(tokio::sync::Mutex::new(()));
    map.insert(
        pool_key.clone(),
        AgentEntry {
            client: client.clone(),
            gate: Arc::clone(&gate),
            refs: 1,
            idle_since: None,
        },
    );

    Ok(BlockingAgent {
        key: pool_key,
        client,
        gate,
    })
}
