//! Executes a task's move list against the worker admin endpoints.
//!
//! Each move is a drop followed by an add, either of which may be
//! absent. Actions run concurrently under a bounded fan-out; a failed
//! attempt retries the whole list once after a short pause. Delivery is
//! at least once, the receiving shard keeper is idempotent in both
//! directions.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use shardman_core::shard::{MoveAction, ShardMessage};
use shardman_core::{Error, Result};

const RETRY_LIMIT: usize = 1;
const RETRY_SLEEP: Duration = Duration::from_secs(1);
const MOVE_CONCURRENCY: usize = 8;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct MoveExecutor {
    service: String,
    http: reqwest::Client,
}

impl MoveExecutor {
    pub fn new(service: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self {
            service: service.into(),
            http,
        })
    }

    /// Drive one task to completion. Decode failure is terminal for the
    /// payload; transport failures retry the whole list once and the
    /// final outcome is reported to the caller.
    pub async fn execute(&self, payload: &[u8]) -> Result<()> {
        let actions: Vec<MoveAction> = match serde_json::from_slice(payload) {
            Ok(actions) => actions,
            Err(e) => {
                error!(
                    service = %self.service,
                    raw = %String::from_utf8_lossy(payload),
                    error = %e,
                    "move list decode failed, manual intervention required"
                );
                return Err(e.into());
            }
        };

        info!(service = %self.service, actions = actions.len(), "move task received");

        let mut attempt = 0;
        loop {
            match self.run_actions(&actions).await {
                Ok(()) => {
                    info!(service = %self.service, attempt, "move task completed");
                    return Ok(());
                }
                Err(e) if attempt < RETRY_LIMIT => {
                    warn!(service = %self.service, attempt, error = %e, "move attempt failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_SLEEP).await;
                }
                Err(e) => {
                    error!(service = %self.service, error = %e, "move task failed after retries");
                    return Err(e);
                }
            }
        }
    }

    async fn run_actions(&self, actions: &[MoveAction]) -> Result<()> {
        let limiter = Arc::new(Semaphore::new(MOVE_CONCURRENCY));
        let mut tasks = JoinSet::new();
        for action in actions.iter().cloned() {
            let limiter = limiter.clone();
            let executor = self.clone();
            tasks.spawn(async move {
                let _permit = limiter.acquire_owned().await;
                executor.drop_or_add(&action).await
            });
        }

        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(service = %self.service, error = %e, "move action failed");
                    failed += 1;
                }
                Err(e) => {
                    error!(service = %self.service, error = %e, "move action task died");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(Error::Transport(format!("{failed} move action(s) failed")));
        }
        Ok(())
    }

    /// Drop precedes add so the shard never runs in two places at once.
    async fn drop_or_add(&self, action: &MoveAction) -> Result<()> {
        if let Some(endpoint) = &action.drop_endpoint {
            self.send(&action.shard_id, action, endpoint, "drop").await?;
        }

        if let Some(endpoint) = &action.add_endpoint {
            if let Err(e) = self.send(&action.shard_id, action, endpoint, "add").await {
                if !action.allow_drop {
                    return Err(e);
                }
                warn!(shard = %action.shard_id, error = %e, "add failed, abandoned as requested");
            }
        }

        info!(
            shard = %action.shard_id,
            only_add = action.drop_endpoint.is_none(),
            only_drop = action.add_endpoint.is_none(),
            "move action applied"
        );
        Ok(())
    }

    async fn send(&self, id: &str, action: &MoveAction, endpoint: &str, verb: &str) -> Result<()> {
        let message = ShardMessage {
            id: id.to_string(),
            spec: action.spec.clone(),
        };
        let url = format!("http://{endpoint}/sm/admin/{verb}-shard");
        let resp = self
            .http
            .post(&url)
            .json(&message)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if resp.status() != StatusCode::OK {
            return Err(Error::Transport(format!(
                "{verb} shard {id} via {endpoint}: status {}",
                resp.status()
            )));
        }

        info!(url = %url, shard = %id, "worker call ok");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        drops: AtomicUsize,
        adds: AtomicUsize,
        drop_failures_left: AtomicUsize,
        add_always_fails: std::sync::atomic::AtomicBool,
    }

    async fn spawn_worker(counters: Arc<Counters>) -> SocketAddr {
        let drop_counters = counters.clone();
        let add_counters = counters.clone();
        let app = Router::new()
            .route(
                "/sm/admin/drop-shard",
                post(move || {
                    let counters = drop_counters.clone();
                    async move {
                        counters.drops.fetch_add(1, Ordering::SeqCst);
                        if counters
                            .drop_failures_left
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                                left.checked_sub(1)
                            })
                            .is_ok()
                        {
                            StatusCode::INTERNAL_SERVER_ERROR
                        } else {
                            StatusCode::OK
                        }
                    }
                }),
            )
            .route(
                "/sm/admin/add-shard",
                post(move || {
                    let counters = add_counters.clone();
                    async move {
                        counters.adds.fetch_add(1, Ordering::SeqCst);
                        if counters.add_always_fails.load(Ordering::SeqCst) {
                            StatusCode::INTERNAL_SERVER_ERROR
                        } else {
                            StatusCode::OK
                        }
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        addr
    }

    fn spec(id: &str) -> shardman_core::shard::ShardSpec {
        shardman_core::shard::ShardSpec {
            id: id.into(),
            service: "orders".into(),
            task: "{}".into(),
            lease: None,
            update_time: 1,
        }
    }

    fn action(
        id: &str,
        drop_endpoint: Option<String>,
        add_endpoint: Option<String>,
        allow_drop: bool,
    ) -> MoveAction {
        MoveAction {
            service: "orders".into(),
            shard_id: id.into(),
            drop_endpoint,
            add_endpoint,
            allow_drop,
            spec: spec(id),
        }
    }

    #[tokio::test]
    async fn retries_once_after_transient_failure() {
        let counters = Arc::new(Counters::default());
        counters.drop_failures_left.store(1, Ordering::SeqCst);
        let addr = spawn_worker(counters.clone()).await;

        let task = vec![action(
            "s1",
            Some(addr.to_string()),
            Some(addr.to_string()),
            false,
        )];
        let payload = serde_json::to_vec(&task).expect("encode");

        let executor = MoveExecutor::new("orders").expect("executor");
        executor.execute(&payload).await.expect("task converges");

        // First attempt fails on the drop, the retry replays the whole
        // action: both endpoints see at least one request.
        assert_eq!(counters.drops.load(Ordering::SeqCst), 2);
        assert!(counters.adds.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_an_error() {
        let counters = Arc::new(Counters::default());
        counters.drop_failures_left.store(10, Ordering::SeqCst);
        let addr = spawn_worker(counters.clone()).await;

        let task = vec![action("s1", Some(addr.to_string()), None, false)];
        let payload = serde_json::to_vec(&task).expect("encode");

        let executor = MoveExecutor::new("orders").expect("executor");
        let err = executor.execute(&payload).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(counters.drops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn allow_drop_swallows_add_failures() {
        let counters = Arc::new(Counters::default());
        counters.add_always_fails.store(true, Ordering::SeqCst);
        let addr = spawn_worker(counters.clone()).await;

        let task = vec![action("s1", None, Some(addr.to_string()), true)];
        let payload = serde_json::to_vec(&task).expect("encode");

        let executor = MoveExecutor::new("orders").expect("executor");
        executor.execute(&payload).await.expect("failure swallowed");
        assert_eq!(counters.adds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_terminal() {
        let executor = MoveExecutor::new("orders").expect("executor");
        let err = executor.execute(b"not-json").await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
