use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

use crate::{
    errors::RpcError,
    handler::{Handler, RequestCtx, SharedHandler},
    types::{Payload, RpcRequest},
};

/// Rejects methods a remote's filter presets mark as disallowed.
///
/// Keys are lowercased when presets are resolved; a method with no entry is allowed.
pub struct Filter {
    methods: Arc<HashMap<String, bool>>,
    next: SharedHandler,
}

impl Filter {
    #[must_use]
    pub fn new(methods: HashMap<String, bool>, next: SharedHandler) -> Self {
        Self { methods: Arc::new(methods), next }
    }

    #[must_use]
    pub fn allows(&self, method: &str) -> bool {
        self.methods.get(&method.to_ascii_lowercase()).copied().unwrap_or(true)
    }
}

#[async_trait]
impl Handler for Filter {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        if !self.allows(&req.method) {
            return Err(RpcError::MethodNotAllowed);
        }
        self.next.serve(ctx, req).await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.next.close().await
    }
}
