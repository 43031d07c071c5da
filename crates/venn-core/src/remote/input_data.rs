use async_trait::async_trait;
use serde_json::Value;

use crate::{
    errors::RpcError,
    handler::{Handler, RequestCtx, SharedHandler},
    types::{Payload, RpcRequest},
};

/// Mirrors `data` into `input` (or the reverse) on `eth_call` objects for remotes that only
/// read one of the two fields.
pub struct InputData {
    next: SharedHandler,
}

impl InputData {
    #[must_use]
    pub fn new(next: SharedHandler) -> Self {
        Self { next }
    }
}

/// Fills in the missing one of `data`/`input`. Returns false when the call object has both,
/// neither, or is not an object.
pub fn mirror_input(call: &mut Value) -> bool {
    let Some(obj) = call.as_object_mut() else {
        return false;
    };
    match (obj.get("input").cloned(), obj.get("data").cloned()) {
        (Some(input), None) => {
            obj.insert("data".to_string(), input);
            true
        }
        (None, Some(data)) => {
            obj.insert("input".to_string(), data);
            true
        }
        _ => false,
    }
}

#[async_trait]
impl Handler for InputData {
    async fn serve(&self, ctx: &RequestCtx, mut req: RpcRequest) -> Result<Payload, RpcError> {
        if req.method == "eth_call" {
            if let Value::Array(params) = &mut req.params {
                if let Some(call) = params.first_mut() {
                    mirror_input(call);
                }
            }
        }
        self.next.serve(ctx, req).await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.next.close().await
    }
}
