//! Stream coordinator.
//!
//! A [`Switchboard`] is one group's presence on one stream: it owns the
//! command facade, the correlation ledger, and the pools of workers and
//! dispatchers, and exposes the request/response API. Cloning is cheap and
//! every clone drives the same underlying coordinator, so a clone can be
//! captured by request handlers to answer with [`Switchboard::fulfill_request`]
//! or [`Switchboard::reject_request`].

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commands::Commands;
use crate::config::SwitchboardConfig;
use crate::dispatcher::Dispatcher;
use crate::entry::{Entry, Status};
use crate::error::SwitchboardError;
use crate::handlers::{ErrorHandler, RequestHandler};
use crate::ledger::{Delivery, Ledger};
use crate::response::Response;
use crate::worker::Worker;

/// How long a consumer may sit idle with nothing pending before connect-time
/// pruning removes it from the group.
const PRUNE_IDLE: Duration = Duration::from_secs(86_400);

/// Request/response coordinator for one (stream, group, instance) triple.
#[derive(Clone)]
pub struct Switchboard {
    inner: Arc<Inner>,
}

struct Inner {
    stream: String,
    group: String,
    instance_id: String,
    on_request: Mutex<Option<Arc<dyn RequestHandler>>>,
    on_error: Mutex<Option<Arc<dyn ErrorHandler>>>,
    // Hot-path snapshot read by send/fulfill/reject and by worker ticks.
    // Never locked across an await, so a handler reaching back into the
    // coordinator cannot wedge connect or disconnect.
    parts: RwLock<Option<Parts>>,
    // Lifecycle lock serializing connect/disconnect.
    state: tokio::sync::Mutex<Option<Connected>>,
}

#[derive(Clone)]
struct Parts {
    commands: Arc<Commands>,
    ledger: Arc<Ledger>,
}

struct Connected {
    ledger: Arc<Ledger>,
    workers: Vec<Arc<Worker>>,
    dispatchers: Vec<Arc<Dispatcher>>,
}

impl Switchboard {
    /// Create a coordinator for `group` on `stream`. A short random instance
    /// token distinguishes this process from others sharing the group name.
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        let instance_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            inner: Arc::new(Inner {
                stream: stream.into(),
                group: group.into(),
                instance_id,
                on_request: Mutex::new(None),
                on_error: Mutex::new(None),
                parts: RwLock::new(None),
                state: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn stream(&self) -> &str {
        &self.inner.stream
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Set the handler invoked for each request arriving for this group.
    /// Required before `connect`.
    pub fn on_request(&self, handler: Arc<dyn RequestHandler>) -> &Self {
        *self
            .inner
            .on_request
            .lock()
            .expect("handler lock poisoned") = Some(handler);
        self
    }

    /// Set the callback observing worker-side failures. Required before
    /// `connect`.
    pub fn on_error(&self, handler: Arc<dyn ErrorHandler>) -> &Self {
        *self.inner.on_error.lock().expect("handler lock poisoned") = Some(handler);
        self
    }

    pub(crate) fn request_handler(&self) -> Result<Arc<dyn RequestHandler>, SwitchboardError> {
        self.inner
            .on_request
            .lock()
            .expect("handler lock poisoned")
            .clone()
            .ok_or_else(|| {
                SwitchboardError::Configuration("no request handler configured".to_string())
            })
    }

    /// Route an error to the user's error callback, if one is set.
    pub(crate) async fn notify_error(&self, error: &SwitchboardError) {
        let handler = self
            .inner
            .on_error
            .lock()
            .expect("handler lock poisoned")
            .clone();
        match handler {
            Some(handler) => handler.call(error).await,
            None => warn!(error = %error, "error with no error handler configured"),
        }
    }

    /// Build the facade and ledger, recreate the consumer group, and start
    /// the worker and dispatcher pools. Workers start first so dispatchers
    /// find a populated availability list.
    pub async fn connect(&self, config: SwitchboardConfig) -> Result<(), SwitchboardError> {
        if self
            .inner
            .on_request
            .lock()
            .expect("handler lock poisoned")
            .is_none()
        {
            return Err(SwitchboardError::Configuration(
                "connect requires an on_request handler".to_string(),
            ));
        }
        if self
            .inner
            .on_error
            .lock()
            .expect("handler lock poisoned")
            .is_none()
        {
            return Err(SwitchboardError::Configuration(
                "connect requires an on_error handler".to_string(),
            ));
        }
        config.validate()?;

        let mut state = self.inner.state.lock().await;
        if state.is_some() {
            return Err(SwitchboardError::Configuration(
                "already connected".to_string(),
            ));
        }

        let commands = Arc::new(Commands::new(
            &config.redis.url,
            config.total_pool_size(),
            &self.inner.stream,
            &self.inner.group,
        )?);

        // Start from a clean group; history published before connect is
        // skipped by the `$` starting id.
        commands.destroy_group().await?;
        commands.create_group().await?;
        commands.prune_consumers(PRUNE_IDLE).await?;

        let ledger = Arc::new(Ledger::new(
            config.ledger.entry_timeout(),
            config.ledger.cleanup_interval(),
        ));
        ledger.start_sweeper();

        // Publish the hot parts before any worker starts: a request claimed
        // to a worker mid-connect must be able to answer through this
        // coordinator.
        *self.inner.parts.write().expect("parts lock poisoned") = Some(Parts {
            commands: Arc::clone(&commands),
            ledger: Arc::clone(&ledger),
        });

        let mut workers = Vec::with_capacity(config.consumer.pool_size);
        for index in 0..config.consumer.pool_size {
            let worker = Arc::new(Worker::new(
                format!("{}-worker-{index}", self.inner.instance_id),
                self.inner.group.clone(),
                self.inner.instance_id.clone(),
                config.consumer.execution_interval(),
                Arc::clone(&commands),
                Arc::clone(&ledger),
            ));
            if let Err(e) = worker.listen(self.clone()).await {
                teardown(&[], &workers, &ledger).await;
                self.clear_parts();
                return Err(e);
            }
            workers.push(worker);
        }

        let mut dispatchers = Vec::with_capacity(config.dispatcher.pool_size);
        for index in 0..config.dispatcher.pool_size {
            let dispatcher = Arc::new(Dispatcher::new(
                format!("{}-dispatcher-{index}", self.inner.instance_id),
                self.inner.group.clone(),
                self.inner.instance_id.clone(),
                config.dispatcher.execution_interval(),
                config.dispatcher.min_idle(),
                Arc::clone(&commands),
            ));
            if let Err(e) = dispatcher.listen().await {
                teardown(&dispatchers, &workers, &ledger).await;
                self.clear_parts();
                return Err(e);
            }
            dispatchers.push(dispatcher);
        }

        info!(
            stream = %self.inner.stream,
            group = %self.inner.group,
            instance = %self.inner.instance_id,
            workers = workers.len(),
            dispatchers = dispatchers.len(),
            "switchboard connected"
        );

        *state = Some(Connected {
            ledger,
            workers,
            dispatchers,
        });
        Ok(())
    }

    pub fn connected(&self) -> bool {
        self.inner
            .parts
            .read()
            .expect("parts lock poisoned")
            .is_some()
    }

    /// Orderly shutdown: dispatchers first so nothing new is handed out,
    /// then workers, then the sweeper. Idempotent.
    pub async fn disconnect(&self) -> Result<(), SwitchboardError> {
        let Some(connected) = self.inner.state.lock().await.take() else {
            return Ok(());
        };

        for dispatcher in &connected.dispatchers {
            if let Err(e) = dispatcher.stop_listening().await {
                warn!(dispatcher = %dispatcher.name(), error = %e, "dispatcher stop failed");
            }
        }
        for worker in &connected.workers {
            if let Err(e) = worker.stop_listening().await {
                warn!(worker = %worker.name(), error = %e, "worker stop failed");
            }
        }
        connected.ledger.stop_sweeper().await;
        self.clear_parts();

        info!(group = %self.inner.group, "switchboard disconnected");
        Ok(())
    }

    /// Send `content` to `to` and wait for its reply.
    ///
    /// Protocol-level failures never surface as errors: a timeout, a
    /// transport failure, or a rejection all come back as a rejected
    /// [`Response`]. The only error is calling on a disconnected
    /// coordinator.
    pub async fn send_to_group(
        &self,
        content: Value,
        to: &str,
    ) -> Result<Response, SwitchboardError> {
        let Parts { commands, ledger } = self.connected_parts()?;
        let timeout = ledger.entry_timeout();

        let entry = Entry::request(
            content,
            self.inner.group.clone(),
            to,
            self.inner.instance_id.clone(),
        );

        // The row must exist before the publish: the reply can arrive
        // before add_to_stream returns.
        let mailbox = match ledger.store(&entry) {
            Ok(mailbox) => mailbox,
            Err(e) => return Ok(Response::rejected_with(e)),
        };

        if let Err(e) = commands.add_to_stream(&entry).await {
            ledger.delete(&entry.id);
            return Ok(Response::rejected_with(e));
        }

        debug!(entry_id = %entry.id, to = %to, "request published");

        let response = match tokio::time::timeout(timeout, mailbox).await {
            Ok(Ok(Delivery::Reply(reply))) => match reply.status {
                Status::Fulfilled => Response::fulfilled(reply.content),
                _ => Response::rejected(reply.content),
            },
            Ok(Ok(Delivery::Failed(error))) => Response::rejected_with(error),
            // A closed mailbox means the sweeper expired the row; both arms
            // are the bounded wait running out.
            Ok(Err(_)) | Err(_) => {
                Response::rejected_with(SwitchboardError::Timeout(timeout))
            }
        };

        ledger.delete(&entry.id);
        Ok(response)
    }

    /// Publish the fulfilled reply to `request`. Never blocks on a mailbox.
    pub async fn fulfill_request(
        &self,
        request: &Entry,
        content: Value,
    ) -> Result<(), SwitchboardError> {
        let parts = self.connected_parts()?;
        parts
            .commands
            .add_to_stream(&request.fulfilled(content))
            .await?;
        Ok(())
    }

    /// Publish the rejected reply to `request`. Never blocks on a mailbox.
    pub async fn reject_request(
        &self,
        request: &Entry,
        content: Value,
    ) -> Result<(), SwitchboardError> {
        let parts = self.connected_parts()?;
        parts
            .commands
            .add_to_stream(&request.rejected(content))
            .await?;
        Ok(())
    }

    fn connected_parts(&self) -> Result<Parts, SwitchboardError> {
        self.inner
            .parts
            .read()
            .expect("parts lock poisoned")
            .clone()
            .ok_or(SwitchboardError::NotConnected)
    }

    fn clear_parts(&self) {
        *self.inner.parts.write().expect("parts lock poisoned") = None;
    }

    /// Current stream length; used by operational checks and tests.
    pub async fn stream_len(&self) -> Result<u64, SwitchboardError> {
        let parts = self.connected_parts()?;
        parts.commands.stream_len().await
    }
}

async fn teardown(dispatchers: &[Arc<Dispatcher>], workers: &[Arc<Worker>], ledger: &Arc<Ledger>) {
    for dispatcher in dispatchers {
        let _ = dispatcher.stop_listening().await;
    }
    for worker in workers {
        let _ = worker.stop_listening().await;
    }
    ledger.stop_sweeper().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct NoopRequestHandler;

    #[async_trait]
    impl RequestHandler for NoopRequestHandler {
        async fn call(&self, _: &Switchboard, _: Entry) -> Result<(), SwitchboardError> {
            Ok(())
        }
    }

    struct NoopErrorHandler;

    #[async_trait]
    impl ErrorHandler for NoopErrorHandler {
        async fn call(&self, _: &SwitchboardError) {}
    }

    #[test]
    fn test_new_coordinator_identity() {
        let board = Switchboard::new("events", "parent");
        assert_eq!(board.stream(), "events");
        assert_eq!(board.group(), "parent");
        assert_eq!(board.instance_id().len(), 8);
    }

    #[test]
    fn test_instance_ids_differ_per_coordinator() {
        let a = Switchboard::new("events", "parent");
        let b = Switchboard::new("events", "parent");
        assert_ne!(a.instance_id(), b.instance_id());
    }

    #[test]
    fn test_clones_share_identity() {
        let board = Switchboard::new("events", "parent");
        let clone = board.clone();
        assert_eq!(board.instance_id(), clone.instance_id());
    }

    #[tokio::test]
    async fn test_connect_requires_handlers() {
        let board = Switchboard::new("events", "parent");

        match board.connect(SwitchboardConfig::default()).await {
            Err(SwitchboardError::Configuration(message)) => {
                assert!(message.contains("on_request"));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }

        board.on_request(Arc::new(NoopRequestHandler));
        match board.connect(SwitchboardConfig::default()).await {
            Err(SwitchboardError::Configuration(message)) => {
                assert!(message.contains("on_error"));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_not_connected_operations() {
        let board = Switchboard::new("events", "parent");
        assert!(!board.connected());

        match board.send_to_group(json!("hi"), "child").await {
            Err(SwitchboardError::NotConnected) => {}
            other => panic!("expected NotConnected, got {other:?}"),
        }

        let request = Entry::request(json!("hi"), "child", "parent", "inst01");
        assert!(matches!(
            board.fulfill_request(&request, json!("ok")).await,
            Err(SwitchboardError::NotConnected)
        ));
        assert!(matches!(
            board.reject_request(&request, json!("no")).await,
            Err(SwitchboardError::NotConnected)
        ));

        // Disconnecting a disconnected coordinator is a no-op.
        assert!(board.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_request_handler_lookup() {
        let board = Switchboard::new("events", "parent");
        assert!(board.request_handler().is_err());

        board.on_request(Arc::new(NoopRequestHandler));
        board.on_error(Arc::new(NoopErrorHandler));
        assert!(board.request_handler().is_ok());
    }
}
