use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Leadership, Lease, Strategy};
use crate::errors::ElectionError;

/// Single-instance strategy: always the leader. Leases end only with their parent.
#[derive(Debug)]
pub struct AlwaysLeader {
    leadership: Leadership,
}

impl AlwaysLeader {
    #[must_use]
    pub fn new() -> Self {
        Self { leadership: Leadership::new(true) }
    }
}

impl Default for AlwaysLeader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }

    async fn join(&self, _shutdown: CancellationToken) -> Result<(), ElectionError> {
        Ok(())
    }

    async fn acquire_lease(&self, parent: &CancellationToken) -> Option<Lease> {
        self.leadership.acquire(parent).await
    }
}
