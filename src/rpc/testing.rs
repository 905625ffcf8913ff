//! In-process stand-in for the remote editor
//!
//! `FakeRemote` sits on the peer end of a [`MemoryTransport`] and speaks the
//! RPC protocol: it records every request and notification it receives,
//! answers requests through a responder closure, and can push notifications,
//! requests or raw bytes towards the session under test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::io::transport::MemoryTransport;
use crate::rpc::error::RemoteError;
use crate::rpc::framing::{Frame, ValueCodec};
use crate::rpc::message::Message;
use crate::rpc::session::RpcSession;
use crate::rpc::value::Value;

/// Decides the answer to a request; `None` leaves it unanswered so the test
/// can respond later with [`FakeRemote::respond`]
pub type Responder = Arc<dyn Fn(&str, &[Value]) -> Option<Result<Value, RemoteError>> + Send + Sync>;

type PeerWriter = FramedWrite<WriteHalf<DuplexStream>, ValueCodec>;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// A request or notification received from the session
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// `None` for notifications
    pub id: Option<u64>,
    pub method: String,
    pub params: Vec<Value>,
}

pub struct FakeRemote {
    writer: Arc<tokio::sync::Mutex<Option<PeerWriter>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    call_added: Arc<Notify>,
    outgoing: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RemoteError>>>>>,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FakeRemote {
    /// Serve the protocol on `peer`
    pub fn spawn<F>(peer: DuplexStream, responder: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Option<Result<Value, RemoteError>> + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(peer);
        let writer = Arc::new(tokio::sync::Mutex::new(Some(FramedWrite::new(
            writer,
            ValueCodec::new(),
        ))));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let call_added = Arc::new(Notify::new());
        let outgoing: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RemoteError>>>>> = Arc::new(Mutex::new(HashMap::new()));
        let responder: Responder = Arc::new(responder);

        let task = tokio::spawn({
            let writer = Arc::clone(&writer);
            let calls = Arc::clone(&calls);
            let call_added = Arc::clone(&call_added);
            let outgoing = Arc::clone(&outgoing);
            async move {
                let mut frames = FramedRead::new(reader, ValueCodec::new());
                while let Some(Ok(frame)) = frames.next().await {
                    let Frame::Value(value) = frame else {
                        continue;
                    };
                    let Ok(message) = Message::from_value(value) else {
                        continue;
                    };
                    match message {
                        Message::Request { id, method, params } => {
                            let answer = responder(&method, &params);
                            calls.lock().unwrap().push(RecordedCall {
                                id: Some(id),
                                method,
                                params,
                            });
                            call_added.notify_waiters();
                            if let Some(result) = answer {
                                write_message(&writer, Message::Response { id, result }).await;
                            }
                        }
                        Message::Notification { method, params } => {
                            calls.lock().unwrap().push(RecordedCall {
                                id: None,
                                method,
                                params,
                            });
                            call_added.notify_waiters();
                        }
                        Message::Response { id, result } => {
                            if let Some(sender) = outgoing.lock().unwrap().remove(&id) {
                                let _ = sender.send(result);
                            }
                        }
                    }
                }
            }
        });

        Self {
            writer,
            calls,
            call_added,
            outgoing,
            next_id: AtomicU64::new(1),
            task: Mutex::new(Some(task)),
        }
    }

    /// A session connected to a fresh fake remote
    pub fn connect<F>(responder: F) -> (RpcSession, Self)
    where
        F: Fn(&str, &[Value]) -> Option<Result<Value, RemoteError>> + Send + Sync + 'static,
    {
        let (transport, peer) = MemoryTransport::pair();
        let remote = Self::spawn(peer, responder);
        (RpcSession::new(transport), remote)
    }

    /// Everything received so far, in arrival order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Method names received so far, in arrival order
    pub fn methods(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|call| call.method.clone())
            .collect()
    }

    /// Wait until at least `count` calls have arrived
    pub async fn wait_for_calls(&self, count: usize) -> Vec<RecordedCall> {
        let wait = async {
            loop {
                let notified = self.call_added.notified();
                {
                    let calls = self.calls.lock().unwrap();
                    if calls.len() >= count {
                        return calls.clone();
                    }
                }
                notified.await;
            }
        };
        tokio::time::timeout(WAIT_LIMIT, wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {count} calls"))
    }

    /// Answer a request left open by the responder
    pub async fn respond(&self, id: u64, result: Result<Value, RemoteError>) {
        write_message(&self.writer, Message::Response { id, result }).await;
    }

    /// Push a notification to the session
    pub async fn notify(&self, method: &str, params: Vec<Value>) {
        let message = Message::Notification {
            method: method.to_string(),
            params,
        };
        write_message(&self.writer, message).await;
    }

    /// Send a request to the session and wait for its answer
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        self.outgoing.lock().unwrap().insert(id, sender);

        let message = Message::Request {
            id,
            method: method.to_string(),
            params,
        };
        write_message(&self.writer, message).await;

        tokio::time::timeout(WAIT_LIMIT, receiver)
            .await
            .expect("timed out waiting for response")
            .expect("fake remote stopped before response")
    }

    /// Write bytes verbatim, bypassing the encoder
    pub async fn send_raw(&self, bytes: &[u8]) {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().expect("fake remote closed");
        writer.get_mut().write_all(bytes).await.unwrap();
        writer.get_mut().flush().await.unwrap();
    }

    /// Drop both halves of the stream so the session sees end of input
    pub async fn close(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.writer.lock().await.take();
    }
}

async fn write_message(writer: &tokio::sync::Mutex<Option<PeerWriter>>, message: Message) {
    let mut writer = writer.lock().await;
    if let Some(writer) = writer.as_mut() {
        writer.send(message.into_value()).await.unwrap();
    }
}
