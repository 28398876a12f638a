//! `LifecycleManager` facade: the public API the service uses.
//!
//! Wraps one [`ProtocolClient`] with start/restart/shutdown, a health
//! report covering every guarded resource, and a monitor that records
//! crashes as soon as the receive loop notices them.
//!
//! A failed start is logged and leaves the subsystem degraded; it never
//! prevents the service from running.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use typelens_resilience::BreakerHealth;

use crate::cache::ResultCache;
use crate::client::{ClientState, ProtocolClient};
use crate::config::ServiceConfig;
use crate::error::LspError;
use crate::query::{
    Definition, DocumentQuery, Hover, HoverInfo, Location, QueryKind, TypeDefinition,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Server running and its breaker closed.
    Healthy,
    /// Enabled but not currently able to answer.
    Degraded,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub enabled: bool,
    pub state: ClientState,
    pub alive: bool,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub breakers: Vec<BreakerHealth>,
}

#[derive(Debug, Default)]
struct HealthRecord {
    starts: u32,
    last_error: Option<String>,
}

impl HealthRecord {
    fn restart_count(&self) -> u32 {
        self.starts.saturating_sub(1)
    }
}

fn lock_record(record: &Mutex<HealthRecord>) -> std::sync::MutexGuard<'_, HealthRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LifecycleManager {
    client: Arc<ProtocolClient>,
    record: Arc<Mutex<HealthRecord>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleManager {
    /// Build the client (and cache, if enabled) from config. Nothing is
    /// spawned until [`start`](Self::start).
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        let cache = ResultCache::from_config(&config.cache);
        Self::with_client(ProtocolClient::new(config.analysis, cache))
    }

    #[must_use]
    pub fn with_client(client: ProtocolClient) -> Self {
        Self {
            client: Arc::new(client),
            record: Arc::new(Mutex::new(HealthRecord::default())),
            monitor: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn client(&self) -> &Arc<ProtocolClient> {
        &self.client
    }

    /// Start the analysis server. Every call after the first counts as a
    /// restart.
    pub async fn start(&self) -> Result<(), LspError> {
        if !self.client.config().enabled {
            tracing::info!("analysis subsystem disabled");
            return Err(LspError::Disabled);
        }
        self.ensure_monitor();
        lock_record(&self.record).starts += 1;

        tracing::info!(server = %self.client.config().command, "starting analysis server...");
        match self.client.start().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "analysis server unavailable; continuing degraded");
                lock_record(&self.record).last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Stop the current server, if any, and start a fresh one.
    pub async fn restart(&self) -> Result<(), LspError> {
        tracing::info!(state = %self.client.state(), "restarting analysis server");
        self.client.shutdown().await;
        self.start().await
    }

    fn ensure_monitor(&self) {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let mut rx = self.client.subscribe();
        let record = self.record.clone();
        *monitor = Some(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                if state == ClientState::Crashed {
                    tracing::warn!("analysis server crashed; queries degrade until restart");
                    lock_record(&record).last_error =
                        Some(LspError::Crashed { exit_status: None }.to_string());
                }
            }
        }));
    }

    pub async fn is_alive(&self) -> bool {
        self.client.is_alive().await
    }

    pub async fn health(&self) -> HealthReport {
        let enabled = self.client.config().enabled;
        let alive = self.client.is_alive().await;
        let state = self.client.state();

        let mut breakers = vec![self.client.breaker().health()];
        if let Some(cache) = self.client.cache() {
            breakers.push(cache.breaker().health());
        }

        let status = if !enabled {
            HealthStatus::Disabled
        } else if alive
            && breakers
                .iter()
                .all(|b| b.state == typelens_resilience::BreakerState::Closed)
        {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        let record = lock_record(&self.record);
        HealthReport {
            status,
            enabled,
            state,
            alive,
            restart_count: record.restart_count(),
            last_error: record.last_error.clone(),
            breakers,
        }
    }

    pub async fn query<K: QueryKind>(
        &self,
        kind: &K,
        query: &DocumentQuery,
        timeout: Option<Duration>,
    ) -> Result<Option<K::Output>, LspError> {
        let result = self.client.query(kind, query, timeout).await;
        if let Err(e) = &result
            && e.is_degraded()
            && !matches!(e, LspError::Disabled | LspError::CircuitOpen { .. })
        {
            lock_record(&self.record).last_error = Some(e.to_string());
        }
        result
    }

    pub async fn hover(
        &self,
        path: impl Into<PathBuf>,
        text: impl Into<String>,
        line: u32,
        character: u32,
    ) -> Result<Option<HoverInfo>, LspError> {
        let query = DocumentQuery::new(path, text, line, character);
        self.query(&Hover, &query, None).await
    }

    pub async fn definition(
        &self,
        path: impl Into<PathBuf>,
        text: impl Into<String>,
        line: u32,
        character: u32,
    ) -> Result<Option<Vec<Location>>, LspError> {
        let query = DocumentQuery::new(path, text, line, character);
        self.query(&Definition, &query, None).await
    }

    pub async fn type_definition(
        &self,
        path: impl Into<PathBuf>,
        text: impl Into<String>,
        line: u32,
        character: u32,
    ) -> Result<Option<Vec<Location>>, LspError> {
        let query = DocumentQuery::new(path, text, line, character);
        self.query(&TypeDefinition, &query, None).await
    }

    /// Stop the server and the crash monitor.
    pub async fn shutdown(&self) {
        self.client.shutdown().await;
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = monitor {
            handle.abort();
            let _ = handle.await;
        }
    }
}
