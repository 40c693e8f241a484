// Common test utilities for integration tests
// Builds clients on a shared in-memory backend and waits on store changes.
#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::LevelFilter;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use famchat::clock::Clock;
use famchat::memory::{MemoryBackend, MemoryIdentity};
use famchat::{ChatClient, StoreChange, SyncConfig};

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub struct TestClient {
    pub client: Arc<ChatClient>,
    pub identity: Arc<MemoryIdentity>,
}

pub fn build_client(backend: &MemoryBackend, user: &str, config: SyncConfig) -> Result<TestClient> {
    build_client_with_clock(backend, user, config, None)
}

pub fn build_client_with_clock(
    backend: &MemoryBackend,
    user: &str,
    config: SyncConfig,
    clock: Option<Arc<dyn Clock>>,
) -> Result<TestClient> {
    let identity = Arc::new(MemoryIdentity::signed_in(user));
    let mut builder = ChatClient::builder(
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        identity.clone(),
    )
    .config(config);
    if let Some(clock) = clock {
        builder = builder.clock(clock);
    }
    Ok(TestClient {
        client: builder.build()?,
        identity,
    })
}

pub fn client_for(backend: &MemoryBackend, user: &str) -> Result<TestClient> {
    build_client(backend, user, SyncConfig::default())
}

/// Wait for a store change matching `pred`, failing after `secs` seconds.
pub async fn wait_for_change<F>(
    changes: &mut UnboundedReceiver<StoreChange>,
    pred: F,
    secs: u64,
) -> Result<StoreChange>
where
    F: Fn(&StoreChange) -> bool,
{
    let wait = async {
        while let Some(change) = changes.recv().await {
            if pred(&change) {
                return Some(change);
            }
        }
        None
    };
    match timeout(Duration::from_secs(secs), wait).await {
        Ok(Some(change)) => Ok(change),
        Ok(None) => Err(anyhow!("store went away before the expected change")),
        Err(_) => Err(anyhow!("timed out after {}s waiting for store change", secs)),
    }
}

/// Poll `cond` every 10ms until it holds, failing after `secs` seconds.
pub async fn wait_until<F>(mut cond: F, secs: u64) -> Result<()>
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(secs), poll)
        .await
        .map_err(|_| anyhow!("condition not met within {}s", secs))
}

/// Let spawned tasks run without advancing much time.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

pub async fn within<T>(secs: u64, fut: impl Future<Output = T>) -> Result<T> {
    timeout(Duration::from_secs(secs), fut)
        .await
        .map_err(|_| anyhow!("operation did not finish within {}s", secs))
}
