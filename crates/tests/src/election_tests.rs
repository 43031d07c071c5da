//! Leader-only head stalking under an election lease.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use venn_core::{
    config::ChainConfig,
    election::{AlwaysLeader, Election},
    errors::RpcError,
    head::{AtomicHeadStore, HeadStore},
};

use crate::{
    harness::{runtime, single_chain},
    mock_rpc::RpcMockBuilder,
};

#[tokio::test]
async fn test_started_runtime_stalks_heads_as_leader() {
    let mut upstream = RpcMockBuilder::new().await;
    upstream.mock_healthy(1, 42).await;

    let heads = Arc::new(AtomicHeadStore::new());
    let chain = ChainConfig::new("ethereum", 1, 12.0);
    let mut watch = heads.on(&chain);

    let yaml = single_chain(&[("primary", upstream.url(), 0)], "stalk: true");
    let runtime = runtime(&yaml, Some(heads.clone()));
    runtime.start().await.unwrap();
    assert!(runtime.election().is_leader());

    let head = tokio::time::timeout(Duration::from_secs(5), watch.next()).await.unwrap();
    assert_eq!(head, Some(42));

    runtime.shutdown().await;
    assert!(runtime.root_token().is_cancelled());
}

#[tokio::test]
async fn test_leader_work_ends_with_shutdown() {
    let election = Election::new(Arc::new(AlwaysLeader::new()));
    let shutdown = CancellationToken::new();
    election.join(shutdown.clone()).await.unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let task = tokio::spawn({
        let (election, shutdown, runs) = (election.clone(), shutdown.clone(), Arc::clone(&runs));
        async move {
            election
                .run_with_lease(&shutdown, move |lease| {
                    let runs = Arc::clone(&runs);
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        lease.token().cancelled().await;
                        assert!(matches!(lease.cause(), Some(RpcError::Cancelled)));
                    }
                })
                .await;
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1, "leader work is not restarted after shutdown");
}
