//! # Metrics
//!
//! Prometheus series recorded through the `metrics` facade. The recorder is installed once per
//! process; the server renders it on the metrics listener.
//!
//! | Series | Kind | Labels |
//! |--------|------|--------|
//! | `venn_remote_request_duration_seconds` | histogram | chain, remote, method, success |
//! | `venn_requests_total` | counter | chain, method |
//! | `venn_request_duration_seconds` | histogram | chain, method |
//! | `venn_stalker_head_block` | gauge | chain |
//! | `venn_stalker_propagation_delay_ms` | gauge | chain |
//! | `venn_remote_healthy` | gauge | chain, remote |
//! | `venn_chain_healthy_remotes` | gauge | chain |
//! | `venn_cache_hits_total` / `venn_cache_misses_total` | counter | chain, kind |
//! | `venn_election_leader` | gauge | |
//!
//! ## String Interning
//!
//! Chain, remote and method names are interned to avoid per-request allocations. The set of
//! names is fixed by configuration plus the methods clients call, so the pool stays small.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::{sync::OnceLock, time::Duration};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

static NAME_POOL: OnceLock<dashmap::DashMap<String, &'static str>> = OnceLock::new();

/// Upper bound on interned method names; anything past it is labelled `other`.
const MAX_INTERNED: usize = 4096;

#[inline]
fn intern(name: &str) -> &'static str {
    let pool = NAME_POOL.get_or_init(dashmap::DashMap::new);

    if let Some(interned) = pool.get(name) {
        return *interned;
    }
    if pool.len() >= MAX_INTERNED {
        return "other";
    }

    let leaked: &'static str = Box::leak(name.to_string().into_boxed_str());
    pool.insert(name.to_string(), leaked);
    leaked
}

fn try_init_prometheus_recorder(
) -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Installs the global recorder on first use and returns its handle.
pub fn init_prometheus_recorder() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| match try_init_prometheus_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "failed to install prometheus recorder, using a detached recorder"
                );
                PrometheusBuilder::new().build_recorder().handle()
            }
        })
        .clone()
}

/// Renders the current series in the Prometheus text format.
#[must_use]
pub fn render() -> String {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render).unwrap_or_default()
}

pub fn record_remote_request(
    chain: &str,
    remote: &str,
    method: &str,
    success: bool,
    elapsed: Duration,
) {
    histogram!(
        "venn_remote_request_duration_seconds",
        "chain" => intern(chain),
        "remote" => intern(remote),
        "method" => intern(method),
        "success" => if success { "true" } else { "false" }
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_request(chain: &str, method: &str, elapsed: Duration) {
    let chain = intern(chain);
    let method = intern(method);
    counter!("venn_requests_total", "chain" => chain, "method" => method).increment(1);
    histogram!("venn_request_duration_seconds", "chain" => chain, "method" => method)
        .record(elapsed.as_secs_f64());
}

#[allow(clippy::cast_precision_loss)]
pub fn record_stalker_head(chain: &str, head: u64) {
    gauge!("venn_stalker_head_block", "chain" => intern(chain)).set(head as f64);
}

pub fn record_stalker_delay(chain: &str, delay: Duration) {
    gauge!("venn_stalker_propagation_delay_ms", "chain" => intern(chain))
        .set(delay.as_secs_f64() * 1000.0);
}

pub fn record_remote_health(chain: &str, remote: &str, healthy: bool) {
    gauge!("venn_remote_healthy", "chain" => intern(chain), "remote" => intern(remote))
        .set(if healthy { 1.0 } else { 0.0 });
}

#[allow(clippy::cast_precision_loss)]
pub fn record_chain_healthy_remotes(chain: &str, count: usize) {
    gauge!("venn_chain_healthy_remotes", "chain" => intern(chain)).set(count as f64);
}

pub fn record_cache_hit(chain: &str, kind: &'static str) {
    counter!("venn_cache_hits_total", "chain" => intern(chain), "kind" => kind).increment(1);
}

pub fn record_cache_miss(chain: &str, kind: &'static str) {
    counter!("venn_cache_misses_total", "chain" => intern(chain), "kind" => kind).increment(1);
}

pub fn record_election_leader(leader: bool) {
    gauge!("venn_election_leader").set(if leader { 1.0 } else { 0.0 });
}
