//! RPC client layered on a broker session.
//!
//! Outbound: encode the request, register the pending entry, then publish -
//! insertion happens-before the publish so a response can never arrive
//! before its pending entry exists.
//!
//! Inbound: every message whose topic carries the response suffix is
//! decoded and matched against the pending table by transaction id. A hit
//! completes the call exactly once and removes the entry atomically; a miss
//! (and every non-response message) goes to the user message handler.
//!
//! Timeouts are enforced by a background reaper that sweeps expired
//! deadlines and fires `Timeout`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::ClientError;
use crate::session::{BrokerSession, MessageHandler};
use yardproto::{Authority, Notification, RpcRequest, RpcResponse, TopicConfig};

/// Sweep interval for the timeout reaper.
const REAPER_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of an asynchronous call, delivered to the callback at most once.
#[derive(Debug)]
pub enum CallOutcome {
    /// The response arrived with `success == true`.
    Success(Option<Value>),
    /// The response arrived with `success == false`; code and message are
    /// relayed verbatim.
    Failure { code: i64, message: String },
    /// No response arrived before the deadline.
    Timeout,
}

/// What the demultiplexer hands a completed call.
enum Delivery {
    Response(RpcResponse),
    Timeout,
}

enum Completion {
    Callback(Box<dyn FnOnce(CallOutcome) + Send>),
    Waiter(oneshot::Sender<Delivery>),
}

impl Completion {
    fn complete(self, delivery: Delivery) {
        match self {
            Completion::Callback(cb) => cb(match delivery {
                Delivery::Response(response) if response.success => {
                    CallOutcome::Success(response.result)
                }
                Delivery::Response(response) => CallOutcome::Failure {
                    code: response.error_code,
                    message: response.error_message.unwrap_or_default(),
                },
                Delivery::Timeout => CallOutcome::Timeout,
            }),
            Completion::Waiter(tx) => {
                let _ = tx.send(delivery);
            }
        }
    }
}

/// One in-flight call awaiting its correlated response.
struct PendingRequest {
    deadline: Instant,
    completion: Completion,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingRequest>>>;

/// Request/response RPC over one broker session.
pub struct RpcClient {
    session: Arc<BrokerSession>,
    topics: TopicConfig,
    pending: PendingTable,
    user_handler: Arc<Mutex<Option<MessageHandler>>>,
    /// Runtime handle captured at construction, for call_blocking callers
    /// living outside the runtime.
    runtime: tokio::runtime::Handle,
    cancel: CancellationToken,
}

impl RpcClient {
    /// Wrap a session. Installs the response demultiplexer as the session's
    /// message handler and records the RPC wildcard subscription so every
    /// (re)connect restores it.
    pub async fn new(
        session: Arc<BrokerSession>,
        topics: TopicConfig,
    ) -> Result<Arc<Self>, ClientError> {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let user_handler: Arc<Mutex<Option<MessageHandler>>> = Arc::new(Mutex::new(None));

        let client = Arc::new(Self {
            session: session.clone(),
            topics: topics.clone(),
            pending: pending.clone(),
            user_handler: user_handler.clone(),
            runtime: tokio::runtime::Handle::current(),
            cancel: CancellationToken::new(),
        });

        // Demultiplexer: runs on the session's I/O task for every inbound
        // message.
        let demux_session = session.clone();
        let demux_topics = topics.clone();
        let demux_pending = pending.clone();
        let demux_user = user_handler.clone();
        session.set_message_handler(Arc::new(move |topic, payload| {
            dispatch_inbound(
                &demux_topics,
                &demux_pending,
                &demux_user,
                &demux_session,
                topic,
                payload,
            );
        }));

        // Cross-method wildcard so responses for any method reach us.
        session
            .subscribe(&topics.subscription_pattern(true), session.default_qos())
            .await?;

        client.spawn_reaper();
        Ok(client)
    }

    /// Build a request carrying this client's default per-call timeout
    /// (`message_timeout` from the session config).
    pub fn request(
        &self,
        method: &str,
        service: &str,
        authority: Authority,
        params: Option<Value>,
    ) -> RpcRequest {
        let timeout_ms = self.session.config().message_timeout.saturating_mul(1000);
        RpcRequest::new(method, service, authority, params, timeout_ms)
    }

    /// Fire-and-forget call with a completion callback.
    ///
    /// Encodes, registers the pending entry, publishes, and returns
    /// immediately. The callback fires exactly once with the outcome; a
    /// zero timeout times out immediately without publishing.
    pub async fn call_async(
        &self,
        request: RpcRequest,
        callback: impl FnOnce(CallOutcome) + Send + 'static,
    ) -> Result<(), ClientError> {
        if request.timeout_ms == 0 {
            callback(CallOutcome::Timeout);
            return Ok(());
        }
        self.dispatch_request(&request, Completion::Callback(Box::new(callback)))
            .await
    }

    /// Blocking-style call: awaits the outcome or the timeout.
    ///
    /// The effective deadline is the larger of the request's embedded
    /// timeout and `timeout_ms`. Returns the decoded response envelope for
    /// both success and remote failure; timeouts surface as
    /// [`ClientError::Timeout`].
    pub async fn call_sync(
        &self,
        mut request: RpcRequest,
        timeout_ms: u64,
    ) -> Result<RpcResponse, ClientError> {
        let effective = request.timeout_ms.max(timeout_ms);
        if effective == 0 {
            return Err(ClientError::Timeout);
        }
        request.timeout_ms = effective;

        let (tx, rx) = oneshot::channel();
        self.dispatch_request(&request, Completion::Waiter(tx))
            .await?;

        match rx.await {
            Ok(Delivery::Response(response)) => Ok(response),
            Ok(Delivery::Timeout) => Err(ClientError::Timeout),
            Err(_) => Err(ClientError::Internal(
                "completion channel dropped".to_string(),
            )),
        }
    }

    /// [`call_sync`](Self::call_sync) for callers outside the runtime.
    ///
    /// Parks the calling OS thread until the outcome arrives. Must not be
    /// invoked from a runtime worker thread.
    pub fn call_blocking(
        &self,
        request: RpcRequest,
        timeout_ms: u64,
    ) -> Result<RpcResponse, ClientError> {
        self.runtime
            .block_on(self.call_sync(request, timeout_ms))
    }

    /// Fire-and-forget notification; no pending entry, no correlation.
    pub async fn send_notification(
        &self,
        method: &str,
        service: &str,
        authority: Authority,
        params: Option<Value>,
    ) -> Result<(), ClientError> {
        let notification = Notification::new(method, service, authority, params);
        let payload = notification.encode()?;
        let topic = self.topics.notification_topic(service, method);
        self.session
            .publish(&topic, &payload, self.session.default_qos())
            .await?;
        self.session.record_notification_sent();
        Ok(())
    }

    /// Raw pass-throughs to the session.
    pub async fn publish_raw(&self, topic: &str, payload: &[u8]) -> Result<(), ClientError> {
        self.session
            .publish(topic, payload, self.session.default_qos())
            .await
    }

    pub async fn subscribe(&self, pattern: &str) -> Result<(), ClientError> {
        self.session
            .subscribe(pattern, self.session.default_qos())
            .await
    }

    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), ClientError> {
        self.session.unsubscribe(pattern).await
    }

    /// Handler for inbound messages that are not recognizable responses.
    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.user_handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn session(&self) -> &Arc<BrokerSession> {
        &self.session
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop the reaper and fail every pending call with `Timeout`.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let drained: Vec<(String, PendingRequest)> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        if !drained.is_empty() {
            debug!(
                "{}: failing {} pending request(s) on shutdown",
                self.session.client_id(),
                drained.len()
            );
        }
        for (id, request) in drained {
            trace!("{}: pending {} failed by shutdown", self.session.client_id(), id);
            request.completion.complete(Delivery::Timeout);
        }
    }

    /// Encode, register pending, publish. Insertion precedes the publish;
    /// a failed publish rolls the entry back out.
    async fn dispatch_request(
        &self,
        request: &RpcRequest,
        completion: Completion,
    ) -> Result<(), ClientError> {
        let payload = request.encode()?;
        let topic = self
            .topics
            .request_topic(&request.service, &request.method, &request.transaction_id);

        let deadline = Instant::now() + Duration::from_millis(request.timeout_ms);
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(
                request.transaction_id.clone(),
                PendingRequest {
                    deadline,
                    completion,
                },
            );
        }

        match self
            .session
            .publish(&topic, &payload, self.session.default_qos())
            .await
        {
            Ok(()) => {
                self.session.record_request_sent();
                trace!(
                    "{}: request {} dispatched to {}",
                    self.session.client_id(),
                    request.transaction_id,
                    topic
                );
                Ok(())
            }
            Err(e) => {
                // Never leak the pending entry.
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&request.transaction_id);
                Err(e)
            }
        }
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let pending = self.pending.clone();
        let cancel = self.cancel.clone();
        let name = self.session.client_id().to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let expired: Vec<(String, PendingRequest)> = {
                            let mut table = pending.lock().unwrap_or_else(|e| e.into_inner());
                            let ids: Vec<String> = table
                                .iter()
                                .filter(|(_, request)| now >= request.deadline)
                                .map(|(id, _)| id.clone())
                                .collect();
                            ids.into_iter()
                                .filter_map(|id| table.remove(&id).map(|r| (id, r)))
                                .collect()
                        };
                        for (id, request) in expired {
                            debug!("{}: request {} timed out", name, id);
                            request.completion.complete(Delivery::Timeout);
                        }
                    }
                }
            }
        });
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The response demultiplexer. Runs inline on the session's I/O task.
fn dispatch_inbound(
    topics: &TopicConfig,
    pending: &PendingTable,
    user_handler: &Arc<Mutex<Option<MessageHandler>>>,
    session: &Arc<BrokerSession>,
    topic: &str,
    payload: &[u8],
) {
    if topics.is_response_topic(topic) {
        match RpcResponse::decode(payload) {
            Ok(response) => {
                let entry = pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&response.transaction_id);
                if let Some(request) = entry {
                    session.record_response_received();
                    trace!(
                        "{}: response for {} matched",
                        session.client_id(),
                        response.transaction_id
                    );
                    request.completion.complete(Delivery::Response(response));
                    return;
                }
                // Unmatched response: late (already reaped) or foreign.
                debug!(
                    "{}: discarding orphan response for {}",
                    session.client_id(),
                    response.transaction_id
                );
                return;
            }
            Err(e) => {
                warn!(
                    "{}: undecodable response on {}: {}",
                    session.client_id(),
                    topic,
                    e
                );
                return;
            }
        }
    }

    let handler = user_handler
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    if let Some(handler) = handler {
        handler(topic, payload);
    }
}
