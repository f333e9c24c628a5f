use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{CorrelationId, Headers, Result, RpcError};

/// A request as seen by a handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub correlation_id: CorrelationId,
    pub payload: Bytes,
    pub content_type: Option<Arc<str>>,
    pub headers: Headers,
    /// The broker has delivered this message before.
    pub redelivered: bool,
    /// Delivery attempt under the retry policy, starting at 1.
    pub attempt: u32,
}

/// Server-side request processing.
///
/// An `Err` is a handler failure; what happens next is decided by the
/// server's [`FailurePolicy`](crate::FailurePolicy).
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Bytes>;
}

pub type HandlerPtr = Arc<dyn RequestHandler>;

struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Result<Bytes> {
        (self.0)(request).await
    }
}

/// Handler from an async closure over raw requests.
pub fn handler_fn<F, Fut>(f: F) -> HandlerPtr
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handler from a typed async closure, with JSON on both sides.
///
/// A payload that does not decode as `Req` counts as a handler failure.
///
/// ```
/// use amqp_rpc::{json_handler, RpcError};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize)]
/// struct Add { a: i32, b: i32 }
///
/// #[derive(Serialize)]
/// struct Sum { sum: i32 }
///
/// let handler = json_handler(|req: Add| async move {
///     Ok::<_, RpcError>(Sum { sum: req.a + req.b })
/// });
/// # let _ = handler;
/// ```
pub fn json_handler<F, Fut, Req, Resp>(f: F) -> HandlerPtr
where
    F: Fn(Req) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    // ---
    handler_fn(move |request: Request| {
        let f = f.clone();
        async move {
            let req: Req = serde_json::from_slice(&request.payload)?;
            let resp = f(req).await?;
            Ok::<_, RpcError>(Bytes::from(serde_json::to_vec(&resp)?))
        }
    })
}
