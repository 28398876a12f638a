//! `ProtocolClient`: owns the analysis server and turns typed queries into
//! guarded JSON-RPC round trips.
//!
//! A query goes through, in order: the result cache, the circuit breaker,
//! a liveness check on the child, the scoped document open, the request
//! itself, and finally outcome classification (breaker bookkeeping and
//! cache write).
//!
//! # Lifecycle
//!
//! ```text
//! NOT_STARTED -> STARTING -> READY -> SHUTTING_DOWN -> STOPPED
//!                   |          |
//!                   v          v
//!                STOPPED    CRASHED -> STARTING (restart)
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use typelens_resilience::CircuitBreaker;

use crate::cache::{self, ResultCache};
use crate::config::AnalysisConfig;
use crate::error::LspError;
use crate::protocol;
use crate::query::{Definition, DocumentQuery, Hover, HoverInfo, Location, QueryKind};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientState {
    NotStarted,
    Starting,
    Ready,
    ShuttingDown,
    Stopped,
    Crashed,
}

impl ClientState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Stopped => "STOPPED",
            Self::Crashed => "CRASHED",
        }
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ProtocolClient {
    config: AnalysisConfig,
    breaker: Arc<CircuitBreaker>,
    cache: Option<ResultCache>,
    state: Arc<watch::Sender<ClientState>>,
    session: RwLock<Option<Arc<Session>>>,
    /// Serializes `start` and `shutdown`.
    lifecycle: Mutex<()>,
}

impl ProtocolClient {
    pub fn new(config: AnalysisConfig, cache: Option<ResultCache>) -> Self {
        let breaker = Arc::new(CircuitBreaker::new("analysis", config.breaker));
        Self {
            config,
            breaker,
            cache,
            state: Arc::new(watch::Sender::new(ClientState::NotStarted)),
            session: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn cache(&self) -> Option<&ResultCache> {
        self.cache.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Observe state transitions, including crashes noticed by the
    /// receive loop.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ClientState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "analysis client state changed");
        }
    }

    fn mark_crashed(&self) {
        self.state.send_if_modified(|s| {
            if matches!(s, ClientState::Ready | ClientState::Starting) {
                *s = ClientState::Crashed;
                true
            } else {
                false
            }
        });
    }

    /// Spawn the server and complete the handshake.
    ///
    /// A no-op when already `READY`. A crashed predecessor is reaped first.
    /// On failure the child is killed and the client is left `STOPPED`.
    pub async fn start(&self) -> Result<(), LspError> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.config.enabled {
            return Err(LspError::Disabled);
        }
        if self.state() == ClientState::Ready {
            return Ok(());
        }

        let stale = self.session.write().await.take();
        if let Some(stale) = stale {
            stale.terminate().await;
        }

        self.set_state(ClientState::Starting);
        let root = self.config.root_dir();
        let session = match Session::spawn(&self.config, &root, self.state.clone()) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(
                    server = %self.config.command,
                    error = %e,
                    "analysis server failed to spawn"
                );
                self.set_state(ClientState::Stopped);
                return Err(e);
            }
        };

        if let Err(e) = session
            .initialize(&root, self.config.handshake_timeout())
            .await
        {
            session.terminate().await;
            self.set_state(ClientState::Stopped);
            let err = if matches!(e, LspError::StartupFailure { .. }) {
                e
            } else {
                LspError::startup(format!("initialize failed: {e}"))
            };
            tracing::warn!(
                server = %self.config.command,
                error = %err,
                "analysis server handshake failed"
            );
            return Err(err);
        }

        *self.session.write().await = Some(Arc::new(session));
        self.set_state(ClientState::Ready);
        tracing::info!(
            server = %self.config.command,
            root = %root.display(),
            "analysis server ready"
        );
        Ok(())
    }

    async fn current_session(&self) -> Result<Arc<Session>, LspError> {
        match self.state() {
            ClientState::Ready => {}
            ClientState::ShuttingDown => return Err(LspError::ShuttingDown),
            ClientState::Crashed => return Err(LspError::Crashed { exit_status: None }),
            state => return Err(LspError::NotRunning { state }),
        }
        self.session
            .read()
            .await
            .clone()
            .ok_or(LspError::NotRunning {
                state: self.state(),
            })
    }

    /// Whether the child is running and the client can take queries.
    pub async fn is_alive(&self) -> bool {
        let Ok(session) = self.current_session().await else {
            return false;
        };
        if session.crashed().is_some() {
            self.mark_crashed();
            return false;
        }
        true
    }

    /// Run `op` against the live session under the breaker.
    ///
    /// Admission happens before any I/O. A dead child is reported as
    /// `Crashed` without writing to it. A server that answered, even with
    /// an error, counts as healthy.
    async fn guarded<T, F, Fut>(&self, op: F) -> Result<T, LspError>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T, LspError>>,
    {
        let session = self.current_session().await?;
        let Some(permit) = self.breaker.acquire() else {
            return Err(LspError::CircuitOpen {
                breaker: self.breaker.name().to_string(),
                retry_after: self.breaker.retry_after().unwrap_or_default(),
            });
        };

        let outcome = match session.crashed() {
            Some(err) => {
                self.mark_crashed();
                Err(err)
            }
            None => op(session).await,
        };

        match &outcome {
            Ok(_) | Err(LspError::ServerError { .. } | LspError::Protocol(_)) => permit.success(),
            Err(e) => {
                if matches!(e, LspError::Crashed { .. }) {
                    self.mark_crashed();
                }
                permit.failure();
            }
        }
        outcome
    }

    /// Ask the server a typed question about one position in a document.
    ///
    /// `Ok(None)` means the server had no answer. `timeout` defaults to
    /// the configured query timeout.
    pub async fn query<K: QueryKind>(
        &self,
        kind: &K,
        query: &DocumentQuery,
        timeout: Option<Duration>,
    ) -> Result<Option<K::Output>, LspError> {
        if !self.config.enabled {
            return Err(LspError::Disabled);
        }
        let method = kind.method();
        let uri = protocol::path_to_file_uri(&query.path)
            .map_err(|e| LspError::InvalidRequest(e.to_string()))?;
        let content_hash = cache::content_hash(&query.text);
        let key = cache::cache_key(method, query, &content_hash);

        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get::<K::Output>(&key).await
        {
            tracing::debug!(method, path = %query.path.display(), "cache hit");
            return Ok(Some(hit));
        }

        let timeout = timeout.unwrap_or_else(|| self.config.query_timeout());
        let result = self
            .guarded(|session| async move {
                let doc = session
                    .open_document(uri.as_str(), &query.text, &content_hash)
                    .await?;
                let params = kind.params(uri.as_str(), query.line, query.character);
                let outcome = session.request(method, Some(params), timeout).await;
                doc.close().await;
                kind.parse(outcome?)
            })
            .await;

        match &result {
            Ok(Some(output)) if kind.is_meaningful(output) => {
                if let Some(cache) = &self.cache {
                    cache.put(&key, output).await;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(method, error = %e, kind = %e.kind(), "analysis query failed");
            }
        }
        result
    }

    pub async fn hover(
        &self,
        query: &DocumentQuery,
        timeout: Option<Duration>,
    ) -> Result<Option<HoverInfo>, LspError> {
        self.query(&Hover, query, timeout).await
    }

    pub async fn definition(
        &self,
        query: &DocumentQuery,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<Location>>, LspError> {
        self.query(&Definition, query, timeout).await
    }

    /// Raw request under the breaker, bypassing the cache.
    pub async fn request(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, LspError> {
        if !self.config.enabled {
            return Err(LspError::Disabled);
        }
        let timeout = timeout.unwrap_or_else(|| self.config.query_timeout());
        self.guarded(|session| async move { session.request(method, params, timeout).await })
            .await
    }

    /// Stop the server. Idempotent; always leaves the client `STOPPED`
    /// with no pending requests and no background tasks.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let session = self.session.write().await.take();
        let Some(session) = session else {
            if self.state() != ClientState::NotStarted {
                self.set_state(ClientState::Stopped);
            }
            return;
        };

        self.set_state(ClientState::ShuttingDown);
        session.shutdown(self.config.shutdown_timeout()).await;
        self.set_state(ClientState::Stopped);
        tracing::info!(server = %self.config.command, "analysis server stopped");
    }
}
