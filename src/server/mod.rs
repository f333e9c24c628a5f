//! RPC server.
//!
//! [`RpcServer`] consumes the well-known request queue on one or more pooled
//! channels. Each consumer processes its deliveries one at a time: run the
//! handler, publish the reply to the request's `reply_to` queue under the
//! same correlation id, then settle the delivery.
//!
//! # Settlement
//!
//! | Situation | Reply | Settlement |
//! |---|---|---|
//! | no correlation id or reply-to | none | ack |
//! | handler ok, reply published | result | ack |
//! | handler ok, reply publish failed | none | nack, requeue |
//! | handler failed, attempts left | none | republish with attempt + 1, ack |
//! | handler failed, attempts exhausted | error | dead-letter queue + ack, or nack without requeue |
//! | handler failed, [`FailurePolicy::RequeueForever`] | none | nack, requeue |

mod handler;

pub use handler::{handler_fn, json_handler, HandlerPtr, Request, RequestHandler};

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use opentelemetry::trace::FutureExt;
use opentelemetry::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::macros::in_request_span;
use crate::sync::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    trace,
    ChannelLease,
    ConnectionPool,
    ConsumeOptions,
    CorrelationId,
    Delivery,
    DeliveryStream,
    Envelope,
    FailurePolicy,
    QueueOptions,
    Result,
    RpcConfig,
    RpcError,
    ATTEMPT_HEADER,
    STATUS_ERROR,
    STATUS_HEADER,
};

/// What processing a single delivery ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Replied,
    Skipped,
    ReplyFailed,
    Retried { attempt: u32 },
    DeadLettered,
    Rejected,
    Requeued,
}

/// Serves requests from `RpcConfig::request_queue` with a [`RequestHandler`].
///
/// Cheap to clone; clones control the same consumers.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    pool: ConnectionPool,
    config: Arc<RpcConfig>,
    handler: HandlerPtr,
    token: CancellationToken,
    lost: CancellationToken,
    starting: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    async fn open_consumer(&self, n: usize) -> Result<(ChannelLease, DeliveryStream)> {
        // ---
        let queue = self.config.request_queue.as_str();
        let lease = self.pool.get_channel().await?;

        lease.declare_queue(queue, QueueOptions::request_queue()).await?;
        if let Some(dlq) = &self.config.dead_letter_queue {
            lease.declare_queue(dlq, QueueOptions::request_queue()).await?;
        }
        lease.set_prefetch(self.config.prefetch).await?;

        let stream = lease
            .consume(
                queue,
                ConsumeOptions {
                    consumer_tag: format!("rpc-server-{queue}-{n}"),
                    no_ack: false,
                },
            )
            .await?;
        Ok((lease, stream))
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl RpcServer {
    pub fn new(pool: ConnectionPool, config: RpcConfig, handler: HandlerPtr) -> Self {
        // ---
        Self {
            inner: Arc::new(Inner {
                pool,
                config: Arc::new(config),
                handler,
                token: CancellationToken::new(),
                lost: CancellationToken::new(),
                starting: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// Declare the request queue and start `consumers` consumers, each on
    /// its own pooled channel with the configured prefetch.
    ///
    /// Returns once every consumer is registered with the broker. Calling it
    /// on a running server does nothing. Starting is all or nothing: if any
    /// consumer fails to come up, the ones already running are stopped and
    /// their channels closed before the error is returned.
    ///
    /// # Errors
    ///
    /// [`RpcError::InvalidConfig`] for a bad config; pool and broker errors
    /// while declaring or consuming.
    pub async fn start(&self) -> Result<()> {
        // ---
        let inner = &*self.inner;
        inner.config.validate()?;

        let _starting = inner.starting.lock().await;

        if inner.token.is_cancelled() {
            return Err(RpcError::Cancelled);
        }
        if !lock_ignore_poison(&inner.tasks).is_empty() {
            log_warn!("rpc server on {} already started", inner.config.request_queue);
            return Ok(());
        }

        let batch = inner.token.child_token();
        let mut tasks = Vec::with_capacity(inner.config.consumers);

        for n in 0..inner.config.consumers {
            let (lease, stream) = match inner.open_consumer(n).await {
                Ok(consumer) => consumer,
                Err(e) => {
                    log_error!(
                        "rpc server on {}: consumer {n} failed to start: {e}",
                        inner.config.request_queue
                    );
                    batch.cancel();
                    for task in tasks {
                        let _ = task.await;
                    }
                    return Err(e);
                }
            };

            let worker = Worker {
                config: Arc::clone(&inner.config),
                handler: Arc::clone(&inner.handler),
                token: batch.clone(),
                lost: inner.lost.clone(),
            };
            tasks.push(tokio::spawn(worker.run(lease, stream)));
        }

        *lock_ignore_poison(&inner.tasks) = tasks;

        log_info!(
            "rpc server consuming {} with {} consumer(s), prefetch {}",
            inner.config.request_queue,
            inner.config.consumers,
            inner.config.prefetch
        );
        Ok(())
    }

    /// Start if needed, then serve until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// [`RpcError::ConnectionLost`] when a consumer's delivery stream ends
    /// without a shutdown; errors from [`start`](Self::start).
    pub async fn run(&self) -> Result<()> {
        // ---
        self.start().await?;
        tokio::select! {
            _ = self.inner.token.cancelled() => Ok(()),
            _ = self.inner.lost.cancelled() => Err(RpcError::ConnectionLost),
        }
    }

    /// Stop all consumers, close their channels and wait for them to finish
    /// the delivery in hand.
    pub async fn shutdown(&self) {
        // ---
        self.inner.token.cancel();
        let tasks = std::mem::take(&mut *lock_ignore_poison(&self.inner.tasks));
        for task in tasks {
            let _ = task.await;
        }
        log_info!("rpc server on {} shut down", self.inner.config.request_queue);
    }
}

/// One consumer: owns its channel lease and processes deliveries in order.
struct Worker {
    config: Arc<RpcConfig>,
    handler: HandlerPtr,
    token: CancellationToken,
    lost: CancellationToken,
}

impl Worker {
    async fn run(self, lease: ChannelLease, mut stream: DeliveryStream) {
        // ---
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = stream.recv() => next,
            };

            let Some(delivery) = next else {
                log_error!(
                    "request consumer on {} ended unexpectedly",
                    self.config.request_queue
                );
                self.lost.cancel();
                break;
            };

            let outcome = self.process(&lease, delivery).await;
            log_debug!("request processed: {outcome:?}");
        }

        // unsettled deliveries still buffered go back to the queue
        drop(stream);
        if let Err(e) = lease.close().await {
            log_debug!("closing consumer channel failed: {e}");
        }
    }

    async fn process(&self, channel: &ChannelLease, delivery: Delivery) -> Outcome {
        // ---
        let env = &delivery.envelope;
        let (Some(id), Some(reply_to)) = (env.correlation_id.clone(), env.reply_to.clone()) else {
            log_warn!("skipping request without correlation id or reply-to");
            settle_ack(&delivery).await;
            return Outcome::Skipped;
        };

        let cx = trace::consumer_context(&self.config.request_queue, &env.headers);
        let fut = self
            .handle(channel, &delivery, id.clone(), reply_to, cx.clone())
            .with_context(cx);
        in_request_span(fut, &self.config.request_queue, &id).await
    }

    async fn handle(
        &self,
        channel: &ChannelLease,
        delivery: &Delivery,
        id: Arc<str>,
        reply_to: Arc<str>,
        cx: Context,
    ) -> Outcome {
        // ---
        let env = &delivery.envelope;
        let request = Request {
            correlation_id: CorrelationId::from(Arc::clone(&id)),
            payload: env.payload.clone(),
            content_type: env.content_type.clone(),
            headers: env.headers.clone(),
            redelivered: delivery.redelivered,
            attempt: env.attempt(),
        };

        let body = match self.handler.handle(request).await {
            Ok(body) => body,
            Err(e) => return self.on_failure(channel, delivery, id, reply_to, e, &cx).await,
        };

        let content_type = env
            .content_type
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.config.content_type));
        let mut reply = Envelope::response(reply_to, body, id, content_type);
        trace::inject_context(&cx, &mut reply.headers);

        match channel.publish(reply).await {
            Ok(()) => {
                settle_ack(delivery).await;
                Outcome::Replied
            }
            Err(e) => {
                log_error!("reply publish failed, requeueing request: {e}");
                settle_nack(delivery, true).await;
                Outcome::ReplyFailed
            }
        }
    }

    async fn on_failure(
        &self,
        channel: &ChannelLease,
        delivery: &Delivery,
        id: Arc<str>,
        reply_to: Arc<str>,
        error: RpcError,
        cx: &Context,
    ) -> Outcome {
        // ---
        let max_attempts = match self.config.failure_policy {
            FailurePolicy::RequeueForever => {
                log_warn!("handler failed, requeueing: {error}");
                settle_nack(delivery, true).await;
                return Outcome::Requeued;
            }
            FailurePolicy::Retry { max_attempts } => max_attempts,
        };

        let attempt = delivery.envelope.attempt();
        if attempt < max_attempts {
            let mut retry = delivery.envelope.clone();
            retry.exchange = Arc::from("");
            retry.routing_key = Arc::from(self.config.request_queue.as_str());
            retry
                .headers
                .insert(ATTEMPT_HEADER.to_string(), (attempt + 1).to_string());

            return match channel.publish(retry).await {
                Ok(()) => {
                    log_warn!("handler failed (attempt {attempt}/{max_attempts}), retrying: {error}");
                    settle_ack(delivery).await;
                    Outcome::Retried {
                        attempt: attempt + 1,
                    }
                }
                Err(e) => {
                    log_error!("retry publish failed, requeueing request: {e}");
                    settle_nack(delivery, true).await;
                    Outcome::Requeued
                }
            };
        }

        log_error!("handler failed after {attempt} attempt(s): {error}");

        let mut reply = Envelope::response(
            reply_to,
            Bytes::from(error.to_string()),
            id,
            Arc::from("text/plain"),
        )
        .with_header(STATUS_HEADER, STATUS_ERROR);
        trace::inject_context(cx, &mut reply.headers);
        if let Err(e) = channel.publish(reply).await {
            log_warn!("error reply publish failed: {e}");
        }

        let Some(dlq) = &self.config.dead_letter_queue else {
            settle_nack(delivery, false).await;
            return Outcome::Rejected;
        };

        let mut dead = delivery.envelope.clone();
        dead.exchange = Arc::from("");
        dead.routing_key = Arc::from(dlq.as_str());
        match channel.publish(dead).await {
            Ok(()) => {
                settle_ack(delivery).await;
                Outcome::DeadLettered
            }
            Err(e) => {
                log_error!("dead-letter publish failed: {e}");
                settle_nack(delivery, false).await;
                Outcome::Rejected
            }
        }
    }
}

async fn settle_ack(delivery: &Delivery) {
    if let Err(e) = delivery.ack().await {
        log_warn!("ack of delivery {} failed: {e}", delivery.delivery_tag);
    }
}

async fn settle_nack(delivery: &Delivery, requeue: bool) {
    if let Err(e) = delivery.nack(requeue).await {
        log_warn!("nack of delivery {} failed: {e}", delivery.delivery_tag);
    }
}
