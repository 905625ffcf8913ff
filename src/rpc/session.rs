//! RPC session
//!
//! Multiplexes requests, responses and notifications over one transport.
//! Outbound messages go through a lock-guarded framed writer so each message
//! hits the stream in one piece. A dedicated reader task decodes inbound
//! frames, resolves pending requests by id, answers inbound requests from
//! registered handlers and forwards notifications in arrival order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{Level, debug, error, info, trace, warn};

use crate::io::transport::{BoxedReader, BoxedWriter, Transport};
use crate::log_rpc_message;
use crate::rpc::error::{DecodeError, RemoteError, RpcError};
use crate::rpc::framing::{Frame, ValueCodec};
use crate::rpc::message::Message;
use crate::rpc::value::Value;

/// Handler answering a request sent by the remote process
pub type RequestHandler = Arc<dyn Fn(Vec<Value>) -> Result<Value, RemoteError> + Send + Sync>;

/// Receiver of every notification sent by the remote process
pub type NotificationHandler = Arc<dyn Fn(String, Vec<Value>) + Send + Sync>;

/// Receiver of non-fatal protocol errors
pub type ErrorReporter = Arc<dyn Fn(&RpcError) + Send + Sync>;

type FrameWriter = FramedWrite<BoxedWriter, ValueCodec>;
type FrameReader = FramedRead<BoxedReader, ValueCodec>;
type ResponseSender = oneshot::Sender<Result<Value, RpcError>>;

/// Outstanding requests plus the closed flag, guarded together so no request
/// can be registered after the drain on close
#[derive(Default)]
struct PendingRequests {
    closed: bool,
    requests: HashMap<u64, ResponseSender>,
}

struct SessionShared {
    writer: tokio::sync::Mutex<FrameWriter>,
    next_id: AtomicU64,
    pending: Mutex<PendingRequests>,
    request_handlers: Mutex<HashMap<String, RequestHandler>>,
    notification_handler: Mutex<Option<NotificationHandler>>,
    error_reporter: Mutex<Option<ErrorReporter>>,
    closed: watch::Sender<bool>,
}

/// Handle to a running RPC session; clones share the same connection
#[derive(Clone)]
pub struct RpcSession {
    shared: Arc<SessionShared>,
    reader_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl RpcSession {
    /// Start a session over a transport, spawning the reader task
    pub fn new<T: Transport>(transport: T) -> Self {
        let (reader, writer) = transport.into_boxed();
        let (closed, _) = watch::channel(false);

        let shared = Arc::new(SessionShared {
            writer: tokio::sync::Mutex::new(FramedWrite::new(writer, ValueCodec::new())),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingRequests::default()),
            request_handlers: Mutex::new(HashMap::new()),
            notification_handler: Mutex::new(None),
            error_reporter: Mutex::new(None),
            closed,
        });

        let frames = FramedRead::new(reader, ValueCodec::new());
        let task = tokio::spawn(reader_loop(Arc::clone(&shared), frames));

        Self {
            shared,
            reader_task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Install the receiver of all inbound notifications
    pub fn on_notification<F>(&self, handler: F)
    where
        F: Fn(String, Vec<Value>) + Send + Sync + 'static,
    {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.shared.notification_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Register the handler for inbound requests of one method
    pub fn on_request<F>(&self, method: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        self.shared
            .request_handlers
            .lock()
            .unwrap()
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Install the receiver of non-fatal protocol errors
    pub fn on_protocol_error<F>(&self, reporter: F)
    where
        F: Fn(&RpcError) + Send + Sync + 'static,
    {
        *self.shared.error_reporter.lock().unwrap() = Some(Arc::new(reporter));
    }

    /// Send a request and wait for its response, without timeout
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let (id, receiver) = self.send_request(method, params).await?;
        match receiver.await {
            Ok(result) => result,
            Err(_) => {
                debug!("RpcSession: response channel for request {} dropped", id);
                Err(RpcError::SessionClosed)
            }
        }
    }

    /// Send a request and wait at most `timeout` for its response
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let (id, receiver) = self.send_request(method, params).await?;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::SessionClosed),
            Err(_) => {
                self.shared.pending.lock().unwrap().requests.remove(&id);
                warn!("RpcSession: request {} ({}) timed out", id, method);
                Err(RpcError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Send a notification; no response is expected
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::SessionClosed);
        }
        log_rpc_message!(Level::TRACE, "outgoing", method, &params);
        self.shared
            .write(Message::Notification {
                method: method.to_string(),
                params,
            })
            .await
    }

    async fn send_request(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<(u64, oneshot::Receiver<Result<Value, RpcError>>), RpcError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();

        {
            let mut pending = self.shared.pending.lock().unwrap();
            if pending.closed {
                return Err(RpcError::SessionClosed);
            }
            pending.requests.insert(id, sender);
        }

        log_rpc_message!(Level::TRACE, "outgoing", method, &params);

        let message = Message::Request {
            id,
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.shared.write(message).await {
            self.shared.pending.lock().unwrap().requests.remove(&id);
            return Err(e);
        }

        Ok((id, receiver))
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().unwrap().requests.len()
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolve once the session has closed for any reason
    pub async fn closed(&self) {
        let mut receiver = self.shared.closed.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }

    /// Close the session, failing every outstanding request
    pub async fn close(&self) {
        self.shared.shutdown("closed by client");

        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }

        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.close().await {
            debug!("RpcSession: error closing writer: {}", e);
        }
    }
}

impl SessionShared {
    /// Write one message under the writer lock
    async fn write(&self, message: Message) -> Result<(), RpcError> {
        let value = message.into_value();
        let result = {
            let mut writer = self.writer.lock().await;
            writer.send(value).await
        };

        if let Err(e) = result {
            error!("RpcSession: failed to write message: {}", e);
            self.shutdown("write failure");
            return Err(RpcError::Transport(e.to_string()));
        }
        Ok(())
    }

    /// Mark closed and fail every pending request; idempotent
    fn shutdown(&self, reason: &str) {
        let drained = {
            let mut pending = self.pending.lock().unwrap();
            if pending.closed {
                return;
            }
            pending.closed = true;
            std::mem::take(&mut pending.requests)
        };

        info!(
            "RpcSession: closing ({}), failing {} pending requests",
            reason,
            drained.len()
        );
        for (id, sender) in drained {
            if sender.send(Err(RpcError::SessionClosed)).is_err() {
                trace!("RpcSession: request {} abandoned before close", id);
            }
        }

        self.closed.send_replace(true);
    }

    /// Fail the request a malformed response belonged to, then report it
    fn malformed(&self, error: DecodeError, request_id: Option<u64>) {
        let sender =
            request_id.and_then(|id| self.pending.lock().unwrap().requests.remove(&id));
        if let Some(sender) = sender {
            if sender.send(Err(RpcError::Decode(error.clone()))).is_err() {
                debug!("RpcSession: receiver dropped for malformed response");
            }
        }
        self.report(RpcError::Decode(error));
    }

    fn report(&self, error: RpcError) {
        warn!("RpcSession: protocol error: {}", error);
        let reporter = self.error_reporter.lock().unwrap().clone();
        if let Some(reporter) = reporter {
            reporter(&error);
        }
    }

    async fn handle_message(&self, message: Message) {
        match message {
            Message::Response { id, result } => {
                log_rpc_message!(Level::TRACE, "incoming", "response", &result);
                let sender = self.pending.lock().unwrap().requests.remove(&id);
                match sender {
                    Some(sender) => {
                        if sender.send(result.map_err(RpcError::Remote)).is_err() {
                            debug!("RpcSession: response receiver dropped for request {}", id);
                        }
                    }
                    None => self.report(RpcError::UnknownRequestId(id)),
                }
            }
            Message::Request { id, method, params } => {
                log_rpc_message!(Level::TRACE, "incoming", &method, &params);
                let params = params.into_iter().map(Value::unpack_extensions).collect();
                let handler = self.request_handlers.lock().unwrap().get(&method).cloned();
                let result = match handler {
                    Some(handler) => handler(params),
                    None => {
                        self.report(RpcError::NoHandler(method.clone()));
                        Err(RemoteError::exception(format!(
                            "no handler for method {method}"
                        )))
                    }
                };
                if let Err(e) = self.write(Message::Response { id, result }).await {
                    warn!("RpcSession: failed to answer request {}: {}", id, e);
                }
            }
            Message::Notification { method, params } => {
                log_rpc_message!(Level::TRACE, "incoming", &method, &params);
                let params = params.into_iter().map(Value::unpack_extensions).collect();
                let handler = self.notification_handler.lock().unwrap().clone();
                match handler {
                    Some(handler) => handler(method, params),
                    None => trace!("RpcSession: no notification handler for {}", method),
                }
            }
        }
    }
}

async fn reader_loop(shared: Arc<SessionShared>, mut frames: FrameReader) {
    let reason = loop {
        match frames.next().await {
            Some(Ok(Frame::Value(value))) => match Message::from_value(value) {
                Ok(message) => shared.handle_message(message).await,
                Err(e) => shared.report(RpcError::Decode(e)),
            },
            Some(Ok(Frame::Malformed { error, request_id })) => {
                shared.malformed(error, request_id);
            }
            Some(Err(e)) => {
                error!("RpcSession: fatal stream error: {}", e);
                break "stream decode failure";
            }
            None => break "stream closed by remote",
        }
    };
    shared.shutdown(reason);
    trace!("RpcSession: reader task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::MemoryTransport;
    use crate::rpc::testing::FakeRemote;

    fn session_with_remote<F>(responder: F) -> (RpcSession, FakeRemote)
    where
        F: Fn(&str, &[Value]) -> Option<Result<Value, RemoteError>> + Send + Sync + 'static,
    {
        let (transport, peer) = MemoryTransport::pair();
        let remote = FakeRemote::spawn(peer, responder);
        (RpcSession::new(transport), remote)
    }

    #[tokio::test]
    async fn test_request_response() {
        let (session, remote) = session_with_remote(|method, params| match method {
            "echo" => Some(Ok(params[0].clone())),
            _ => Some(Err(RemoteError::exception("unknown"))),
        });

        let result = session.request("echo", vec![Value::from("hi")]).await.unwrap();
        assert_eq!(result, Value::from("hi"));

        let error = session.request("other", vec![]).await.unwrap_err();
        assert!(matches!(error, RpcError::Remote(ref remote) if remote.message == "unknown"));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(remote.methods(), vec!["echo", "other"]);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (session, remote) = session_with_remote(|_, _| None);

        let mut handles = Vec::new();
        for n in 0..5i64 {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                session.request("slow", vec![Value::from(n)]).await
            }));
        }

        let calls = remote.wait_for_calls(5).await;
        // Answer in reverse order, echoing each request's argument
        for call in calls.iter().rev() {
            remote
                .respond(call.id.unwrap(), Ok(call.params[0].clone()))
                .await;
        }

        for (n, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result, Value::from(n as i64));
        }
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_all_pending_requests() {
        let (session, remote) = session_with_remote(|_, _| None);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let session = session.clone();
            handles.push(tokio::spawn(async move { session.request("never", vec![]).await }));
        }
        remote.wait_for_calls(3).await;
        assert_eq!(session.pending_count(), 3);

        session.close().await;

        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(RpcError::SessionClosed)));
        }
        assert_eq!(session.pending_count(), 0);
        assert!(session.is_closed());
        assert!(matches!(
            session.request("late", vec![]).await,
            Err(RpcError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_remote_exit_closes_session() {
        let (session, remote) = session_with_remote(|_, _| None);

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.request("never", vec![]).await })
        };
        remote.wait_for_calls(1).await;

        remote.close().await;
        session.closed().await;

        assert!(matches!(pending.await.unwrap(), Err(RpcError::SessionClosed)));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_unframeable_bytes_close_session() {
        let (session, remote) = session_with_remote(|_, _| None);

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.request("never", vec![]).await })
        };
        remote.wait_for_calls(1).await;

        remote.send_raw(&[0xc1]).await;
        session.closed().await;
        assert!(matches!(pending.await.unwrap(), Err(RpcError::SessionClosed)));
    }

    fn collect_reports(session: &RpcSession) -> Arc<Mutex<Vec<String>>> {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        session.on_protocol_error(move |error| sink.lock().unwrap().push(error.to_string()));
        reported
    }

    #[tokio::test]
    async fn test_ill_typed_notification_is_reported_not_fatal() {
        let (session, remote) = session_with_remote(|_, _| Some(Ok(Value::from(1))));
        let reported = collect_reports(&session);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        session.on_notification(move |method, _| {
            let _ = tx.send(method);
        });

        // [2, "ev", ["\xff"]]
        remote
            .send_raw(&[0x93, 0x02, 0xa2, b'e', b'v', 0x91, 0xa1, 0xff])
            .await;
        remote.notify("after", vec![]).await;

        assert_eq!(rx.recv().await.unwrap(), "after");
        assert_eq!(session.request("ping", vec![]).await.unwrap(), Value::from(1));
        assert!(!session.is_closed());

        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].contains("UTF-8"));
    }

    #[tokio::test]
    async fn test_ill_typed_response_fails_only_its_request() {
        let (session, remote) = session_with_remote(|method, _| match method {
            "ping" => Some(Ok(Value::from(1))),
            _ => None,
        });
        let reported = collect_reports(&session);

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.request("get_line", vec![]).await })
        };
        let calls = remote.wait_for_calls(1).await;
        let id = calls[0].id.unwrap() as u8;

        // [1, id, nil, "\xff"]
        remote.send_raw(&[0x94, 0x01, id, 0xc0, 0xa1, 0xff]).await;

        assert!(matches!(
            pending.await.unwrap(),
            Err(RpcError::Decode(DecodeError::InvalidUtf8(_)))
        ));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.request("ping", vec![]).await.unwrap(), Value::from(1));
        assert_eq!(reported.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_excessive_nesting_is_reported_not_fatal() {
        let (session, remote) = session_with_remote(|_, _| Some(Ok(Value::from(1))));
        let reported = collect_reports(&session);

        let mut bytes = vec![0x93, 0x02, 0xa2, b'e', b'v'];
        bytes.extend(std::iter::repeat_n(0x91, 500));
        bytes.push(0xc0);
        remote.send_raw(&bytes).await;

        assert_eq!(session.request("ping", vec![]).await.unwrap(), Value::from(1));
        assert!(!session.is_closed());
        assert!(reported.lock().unwrap()[0].contains("Nesting"));
    }

    #[tokio::test]
    async fn test_unknown_response_id_is_reported_not_fatal() {
        let (session, remote) = session_with_remote(|_, _| Some(Ok(Value::from(1))));

        let reported = Arc::new(Mutex::new(Vec::new()));
        let reported_clone = Arc::clone(&reported);
        session.on_protocol_error(move |error| {
            reported_clone.lock().unwrap().push(error.to_string());
        });

        remote.respond(999, Ok(Value::Nil)).await;
        // Session keeps working afterwards
        assert_eq!(session.request("ping", vec![]).await.unwrap(), Value::from(1));

        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].contains("999"));
    }

    #[tokio::test]
    async fn test_notifications_forwarded_in_order_with_extensions_unpacked() {
        let (session, remote) = session_with_remote(|_, _| None);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        session.on_notification(move |method, params| {
            let _ = tx.send((method, params));
        });

        let nested = crate::rpc::codec::encode(&Value::from("inner")).unwrap();
        remote.notify("first", vec![Value::Ext(99, nested)]).await;
        remote.notify("second", vec![Value::from(2)]).await;

        let (method, params) = rx.recv().await.unwrap();
        assert_eq!(method, "first");
        assert_eq!(params, vec![Value::from("inner")]);

        let (method, params) = rx.recv().await.unwrap();
        assert_eq!(method, "second");
        assert_eq!(params, vec![Value::from(2)]);
    }

    #[tokio::test]
    async fn test_inbound_requests_use_registered_handlers() {
        let (session, remote) = session_with_remote(|_, _| None);
        session.on_request("host_clipboard", |params| Ok(Value::Array(params)));

        let result = remote
            .request("host_clipboard", vec![Value::from("text")])
            .await;
        assert_eq!(result, Ok(Value::from(vec!["text"])));

        let result = remote.request("missing_method", vec![]).await;
        let error = result.unwrap_err();
        assert!(error.message.contains("no handler for method missing_method"));

        // The reader loop survived the unhandled request
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_notify_expects_no_response() {
        let (session, remote) = session_with_remote(|_, _| None);

        session
            .notify("nvim_command", vec![Value::from("qall!")])
            .await
            .unwrap();
        let calls = remote.wait_for_calls(1).await;
        assert_eq!(calls[0].id, None);
        assert_eq!(calls[0].method, "nvim_command");
        assert_eq!(session.pending_count(), 0);

        session.close().await;
        assert!(matches!(
            session.notify("nvim_command", vec![]).await,
            Err(RpcError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_request_timeout_cleans_pending() {
        let (session, _remote) = session_with_remote(|_, _| None);
        let result = session
            .request_with_timeout("never", vec![], Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(RpcError::Timeout { .. })));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_ids_are_unique_and_increasing() {
        let (session, remote) = session_with_remote(|_, _| Some(Ok(Value::Nil)));
        for _ in 0..3 {
            session.request("noop", vec![]).await.unwrap();
        }
        let ids: Vec<u64> = remote.calls().iter().filter_map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
