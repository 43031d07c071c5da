use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use super::probes::HealthProbe;
use crate::{
    config::{ChainConfig, RemoteConfig},
    errors::RpcError,
    handler::{Handler, RequestCtx, SharedHandler},
    metrics,
    types::{Payload, RpcRequest},
};

/// Upper bound on one health check.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug)]
struct DoctorState {
    interval: Duration,
    last_error: Option<String>,
    last_head: u64,
    last_checked: Option<Instant>,
}

/// Periodic health checks gating traffic to one remote.
///
/// The first caller waits for the first check; afterwards callers see the latched status.
/// A passing check doubles the polling interval up to the configured maximum and a failing
/// one drops it back to the minimum. Using a healthy remote also pulls the interval back to
/// the minimum so busy remotes are checked more often than idle ones.
pub struct Doctor {
    remote: String,
    next: SharedHandler,
    gates_traffic: bool,
    min_interval: Duration,
    status: watch::Sender<HealthStatus>,
    state: Arc<Mutex<DoctorState>>,
    rearm: Arc<Notify>,
    closed: CancellationToken,
}

struct CheckLoop {
    chain: Arc<ChainConfig>,
    remote: String,
    next: SharedHandler,
    probe: Box<dyn HealthProbe>,
    min_interval: Duration,
    max_interval: Duration,
    status: watch::Sender<HealthStatus>,
    state: Arc<Mutex<DoctorState>>,
    rearm: Arc<Notify>,
    closed: CancellationToken,
}

impl Doctor {
    /// Starts the check loop against `next`. Must be called within a tokio runtime.
    #[must_use]
    pub fn new(
        chain: Arc<ChainConfig>,
        remote: &RemoteConfig,
        probe: Box<dyn HealthProbe>,
        next: SharedHandler,
    ) -> Self {
        let min_interval = remote.health_check_interval_min;
        let max_interval = remote.health_check_interval_max.max(min_interval);
        let (status, _) = watch::channel(HealthStatus::Unknown);
        let state = Arc::new(Mutex::new(DoctorState {
            interval: min_interval,
            last_error: None,
            last_head: 0,
            last_checked: None,
        }));
        let rearm = Arc::new(Notify::new());
        let closed = CancellationToken::new();
        let gates_traffic = probe.gates_traffic();

        let task = CheckLoop {
            chain,
            remote: remote.name.clone(),
            next: Arc::clone(&next),
            probe,
            min_interval,
            max_interval,
            status: status.clone(),
            state: Arc::clone(&state),
            rearm: Arc::clone(&rearm),
            closed: closed.clone(),
        };
        tokio::spawn(task.run());

        Self {
            remote: remote.name.clone(),
            next,
            gates_traffic,
            min_interval,
            status,
            state,
            rearm,
            closed,
        }
    }

    #[must_use]
    pub fn status(&self) -> HealthStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    /// Head reported by the most recent passing check, 0 if none.
    #[must_use]
    pub fn last_head(&self) -> u64 {
        self.state.lock().last_head
    }

    #[must_use]
    pub fn last_checked(&self) -> Option<Instant> {
        self.state.lock().last_checked
    }

    /// Reports whether traffic may flow, waiting for the first check if it has not finished.
    ///
    /// # Errors
    ///
    /// Returns the context's cancellation error if it ends before the first check does.
    pub async fn can_use(&self, ctx: &RequestCtx) -> Result<bool, RpcError> {
        let mut rx = self.status.subscribe();
        let status = ctx
            .run(async {
                rx.wait_for(|s| *s != HealthStatus::Unknown)
                    .await
                    .map(|s| *s)
                    .map_err(|_| RpcError::Closed)
            })
            .await?;

        if status == HealthStatus::Healthy {
            let mut state = self.state.lock();
            if state.interval > self.min_interval {
                state.interval = self.min_interval;
                self.rearm.notify_one();
            }
            return Ok(true);
        }
        Ok(false)
    }
}

impl CheckLoop {
    async fn run(self) {
        self.check().await;
        loop {
            let interval = self.state.lock().interval;
            tokio::select! {
                () = self.closed.cancelled() => return,
                () = self.rearm.notified() => continue,
                () = tokio::time::sleep(interval) => self.check().await,
            }
        }
    }

    async fn check(&self) {
        let ctx = RequestCtx::background(Arc::clone(&self.chain), &self.closed)
            .with_deadline(tokio::time::Instant::now() + PROBE_TIMEOUT);
        let outcome = ctx.run(self.probe.check(&ctx, self.next.as_ref())).await;

        let healthy = {
            let mut state = self.state.lock();
            state.last_checked = Some(Instant::now());
            match outcome {
                Ok(head) => {
                    if head > 0 {
                        state.last_head = head;
                    }
                    state.last_error = None;
                    state.interval = (state.interval * 2).min(self.max_interval);
                    true
                }
                Err(e) => {
                    if !self.closed.is_cancelled() {
                        tracing::error!(
                            chain = %self.chain.name,
                            remote = %self.remote,
                            error = %e,
                            "remote failed health check"
                        );
                    }
                    state.last_error = Some(e.to_string());
                    state.interval = self.min_interval;
                    false
                }
            }
        };

        metrics::record_remote_health(&self.chain.name, &self.remote, healthy);
        self.status.send_replace(if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        });
    }
}

#[async_trait]
impl Handler for Doctor {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        if self.closed.is_cancelled() {
            return Err(RpcError::Closed);
        }
        if self.gates_traffic && !self.can_use(ctx).await? {
            return Err(RpcError::Unhealthy);
        }
        self.next.serve(ctx, req).await
    }

    async fn close(&self) -> Result<(), RpcError> {
        if self.closed.is_cancelled() {
            return Err(RpcError::Closed);
        }
        self.closed.cancel();
        tracing::debug!(remote = %self.remote, "doctor stopped");
        self.next.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handler::FnHandler, remote::probes::probe_for, types::to_payload};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn chain() -> Arc<ChainConfig> {
        Arc::new(ChainConfig::new("test", 1, 1.0))
    }

    fn remote(min: Duration, max: Duration) -> RemoteConfig {
        let mut remote = RemoteConfig::new("a", "http://localhost", 1);
        remote.health_check_interval_min = min;
        remote.health_check_interval_max = max;
        remote
    }

    fn node(chain_id: &'static str, healthy: Arc<AtomicBool>) -> SharedHandler {
        FnHandler::shared(move |_, req| {
            let healthy = healthy.load(Ordering::SeqCst);
            async move {
                if !healthy {
                    return Err(RpcError::Transport("down".into()));
                }
                match req.method.as_str() {
                    "eth_blockNumber" => to_payload("0x10"),
                    "eth_chainId" => to_payload(chain_id),
                    _ => to_payload("ok"),
                }
            }
        })
    }

    #[tokio::test]
    async fn test_first_caller_waits_for_first_check() {
        let chain = chain();
        let doctor = Doctor::new(
            Arc::clone(&chain),
            &remote(Duration::from_secs(60), Duration::from_secs(3600)),
            probe_for(&chain),
            node("0x1", Arc::new(AtomicBool::new(true))),
        );
        let ctx = RequestCtx::new(chain);
        let res = doctor.serve(&ctx, RpcRequest::new("eth_call", json!([]))).await.unwrap();
        assert_eq!(res.get(), r#""ok""#);
        assert_eq!(doctor.status(), HealthStatus::Healthy);
        assert_eq!(doctor.last_head(), 16);
    }

    #[tokio::test]
    async fn test_wrong_chain_id_is_unhealthy() {
        let chain = chain();
        let doctor = Doctor::new(
            Arc::clone(&chain),
            &remote(Duration::from_secs(60), Duration::from_secs(3600)),
            probe_for(&chain),
            node("0x5", Arc::new(AtomicBool::new(true))),
        );
        let ctx = RequestCtx::new(chain);
        let res = doctor.serve(&ctx, RpcRequest::new("eth_call", json!([]))).await;
        assert!(matches!(res, Err(RpcError::Unhealthy)));
        assert!(doctor.last_error().unwrap().contains("chain ID mismatch"));
    }

    #[tokio::test]
    async fn test_recovers_on_next_check() {
        let chain = chain();
        let up = Arc::new(AtomicBool::new(false));
        let doctor = Doctor::new(
            Arc::clone(&chain),
            &remote(Duration::from_millis(20), Duration::from_millis(40)),
            probe_for(&chain),
            node("0x1", Arc::clone(&up)),
        );
        let ctx = RequestCtx::new(chain);
        assert!(!doctor.can_use(&ctx).await.unwrap());
        up.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(doctor.can_use(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_close_stops_traffic() {
        let chain = chain();
        let doctor = Doctor::new(
            Arc::clone(&chain),
            &remote(Duration::from_secs(60), Duration::from_secs(60)),
            probe_for(&chain),
            node("0x1", Arc::new(AtomicBool::new(true))),
        );
        doctor.close().await.unwrap();
        assert!(matches!(doctor.close().await, Err(RpcError::Closed)));
        let ctx = RequestCtx::new(chain);
        let res = doctor.serve(&ctx, RpcRequest::new("eth_call", json!([]))).await;
        assert!(matches!(res, Err(RpcError::Closed)));
    }
}
