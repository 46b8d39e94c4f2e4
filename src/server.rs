//! HTTP trigger.
//!
//! `POST /start` launches a sync run in the background, `GET /progress`
//! reports item counts, `POST /stop` asks the current run to stop at the
//! next page or item boundary. At most one run executes at a time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::progress::{Progress, ProgressReporter};
use crate::sync::Synchronizer;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    synchronizer: Arc<Synchronizer>,
    progress: ProgressReporter,
    running: AtomicBool,
    /// Token of the active run, replaced on every start. Held while `running`
    /// is raised so a stop never sees the flag without the matching token.
    run_token: Mutex<CancellationToken>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
    /// Process-wide shutdown; each run token is a child of it.
    shutdown: CancellationToken,
}

/// Clears the running flag when a run task ends, even by panic.
struct RunningGuard(Arc<Inner>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Serialize)]
struct StartResponse {
    started: bool,
}

#[derive(Debug, Serialize)]
struct StopResponse {
    stopping: bool,
}

impl AppState {
    pub fn new(
        synchronizer: Arc<Synchronizer>,
        progress: ProgressReporter,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                synchronizer,
                progress,
                running: AtomicBool::new(false),
                run_token: Mutex::new(shutdown.child_token()),
                run_handle: Mutex::new(None),
                shutdown,
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn run_token(&self) -> MutexGuard<'_, CancellationToken> {
        self.inner.run_token.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Run token lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Launch a run unless one is already in progress. Returns whether a run
    /// was started; the run itself is not awaited.
    pub fn start(&self) -> bool {
        let mut current = self.run_token();
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("Sync run already in progress, ignoring start request");
            return false;
        }

        let token = self.inner.shutdown.child_token();
        *current = token.clone();
        drop(current);

        let guard = RunningGuard(self.inner.clone());
        let synchronizer = self.inner.synchronizer.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            tracing::info!("Sync run started");
            match synchronizer.run(token).await {
                Ok(report) => tracing::info!(
                    discovered = report.discovered,
                    updated = report.updated,
                    failed = report.failed,
                    interrupted = report.interrupted,
                    "Sync run finished"
                ),
                Err(e) => tracing::error!(error = %e, "Sync run aborted"),
            }
        });
        if let Ok(mut slot) = self.inner.run_handle.lock() {
            *slot = Some(handle);
        }
        true
    }

    /// Request the active run to stop. Returns whether a run was active.
    pub fn stop(&self) -> bool {
        let current = self.run_token();
        if !self.is_running() {
            return false;
        }
        current.cancel();
        tracing::info!("Stop requested for the active sync run");
        true
    }

    pub async fn progress(&self) -> Progress {
        self.inner.progress.report().await
    }

    /// Wait for the last started run task to finish.
    pub async fn wait_for_run(&self) {
        let handle = self.inner.run_handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Sync run task failed");
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/progress", get(progress))
        .route("/health", get(health))
        .with_state(state)
}

async fn start(State(state): State<AppState>) -> Json<StartResponse> {
    Json(StartResponse {
        started: state.start(),
    })
}

async fn stop(State(state): State<AppState>) -> Json<StopResponse> {
    Json(StopResponse {
        stopping: state.stop(),
    })
}

async fn progress(State(state): State<AppState>) -> Json<Progress> {
    Json(state.progress().await)
}

async fn health() -> &'static str {
    "ok"
}

/// Serve the trigger until `shutdown` is cancelled, then let an active run
/// reach its next stopping point.
pub async fn serve(bind: SocketAddr, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server failed")?;

    if state.is_running() {
        tracing::info!("Waiting for the active sync run to stop...");
    }
    state.wait_for_run().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use crate::mediahaven::{MediaSource, Page, SourceError};
    use crate::state::{ItemStore, SqliteItemStore, TrackedItem};
    use crate::sync::SyncConfig;
    use crate::update::UpdateApi;

    struct EmptySource;

    #[async_trait]
    impl MediaSource for EmptySource {
        async fn get_page(&self, _: u64, _: u64) -> Result<Page, SourceError> {
            Ok(Page::default())
        }
    }

    /// Holds every request until `release` is cancelled.
    struct GatedUpdater {
        release: CancellationToken,
    }

    #[async_trait]
    impl UpdateApi for GatedUpdater {
        async fn request_update(&self, _: &str) -> bool {
            self.release.cancelled().await;
            true
        }
    }

    async fn setup(ids: &[&str]) -> (String, AppState, CancellationToken) {
        let store = Arc::new(SqliteItemStore::open_in_memory().unwrap());
        let items: Vec<_> = ids.iter().map(|id| TrackedItem::new_pending(*id)).collect();
        store.insert_if_absent(&items).await.unwrap();

        let release = CancellationToken::new();
        let synchronizer = Synchronizer::new(
            Arc::new(EmptySource),
            Arc::new(GatedUpdater {
                release: release.clone(),
            }),
            store.clone(),
            SyncConfig {
                page_size: 10,
                max_amount: 0,
                throttle: Duration::ZERO,
                skip_discovery: true,
                identifier_pointer: "/id".to_string(),
                no_progress_bar: true,
            },
        );
        let state = AppState::new(
            Arc::new(synchronizer),
            ProgressReporter::new(store),
            CancellationToken::new(),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), state, release)
    }

    async fn wait_idle(state: &AppState) {
        for _ in 0..200 {
            if !state.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sync run did not finish");
    }

    async fn post_json(url: &str) -> Value {
        reqwest::Client::new()
            .post(url)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (base, _, _) = setup(&[]).await;
        let body = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_progress() {
        let (base, _, _) = setup(&["A", "B"]).await;
        let body: Value = reqwest::get(format!("{base}/progress"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            body,
            json!({"pending": 2, "succeeded": 0, "failed": 0, "total": 2})
        );
    }

    #[tokio::test]
    async fn test_only_one_run_at_a_time() {
        let (base, state, release) = setup(&["A", "B"]).await;

        assert_eq!(post_json(&format!("{base}/start")).await, json!({"started": true}));
        assert!(state.is_running());
        assert_eq!(post_json(&format!("{base}/start")).await, json!({"started": false}));

        release.cancel();
        wait_idle(&state).await;

        let progress = state.progress().await;
        assert_eq!(progress.succeeded, 2);
        assert_eq!(progress.pending, 0);

        // A finished run frees the slot.
        assert_eq!(post_json(&format!("{base}/start")).await, json!({"started": true}));
        state.wait_for_run().await;
    }

    #[tokio::test]
    async fn test_stop_halts_at_next_item() {
        let (base, state, release) = setup(&["A", "B", "C"]).await;

        assert_eq!(post_json(&format!("{base}/start")).await, json!({"started": true}));
        // Let the run reach the first request before stopping it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(post_json(&format!("{base}/stop")).await, json!({"stopping": true}));
        release.cancel();
        wait_idle(&state).await;

        let progress = state.progress().await;
        assert_eq!(progress.succeeded, 1);
        assert_eq!(progress.pending, 2);
    }

    #[tokio::test]
    async fn test_stop_reaches_run_after_poisoned_lock() {
        let (_, state, release) = setup(&["A", "B"]).await;
        let inner = state.inner.clone();
        let _ = std::thread::spawn(move || {
            let _held = inner.run_token.lock().unwrap();
            panic!("poison the run token lock");
        })
        .join();
        assert!(state.inner.run_token.is_poisoned());

        assert!(state.start());
        assert!(state.stop());
        release.cancel();
        wait_idle(&state).await;

        let progress = state.progress().await;
        assert_eq!(progress.succeeded, 0);
        assert_eq!(progress.pending, 2);
    }

    #[tokio::test]
    async fn test_stop_without_run() {
        let (base, _, _) = setup(&[]).await;
        assert_eq!(post_json(&format!("{base}/stop")).await, json!({"stopping": false}));
    }
}
