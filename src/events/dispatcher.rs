//! Per-event fan-out of remote notifications
//!
//! Each event name owns a list of local receivers. Interest is registered
//! with the remote only when the first receiver arrives and withdrawn when
//! the last one leaves; all membership changes for one dispatcher run under
//! a single async lock so concurrent subscribe/unsubscribe cannot race the
//! remote calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::api::{ApiError, NvimApi};
use crate::rpc::{RpcSession, Value};

/// Registers and withdraws remote interest in one event name
#[async_trait]
pub trait RemoteInterest: Send + Sync {
    async fn register(&self, event: &str) -> Result<(), ApiError>;
    async fn unregister(&self, event: &str) -> Result<(), ApiError>;
}

/// Interest via `nvim_subscribe` / `nvim_unsubscribe`
pub struct SubscribeInterest {
    api: NvimApi,
}

impl SubscribeInterest {
    pub fn new(api: NvimApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl RemoteInterest for SubscribeInterest {
    async fn register(&self, event: &str) -> Result<(), ApiError> {
        self.api.subscribe(event).await
    }

    async fn unregister(&self, event: &str) -> Result<(), ApiError> {
        self.api.unsubscribe(event).await
    }
}

/// For events the remote sends without a subscription, such as buffer
/// updates after `nvim_buf_attach`
pub struct NoRemoteInterest;

#[async_trait]
impl RemoteInterest for NoRemoteInterest {
    async fn register(&self, _event: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn unregister(&self, _event: &str) -> Result<(), ApiError> {
        Ok(())
    }
}

struct EventEntry {
    interest: Arc<dyn RemoteInterest>,
    receivers: Vec<(u64, mpsc::UnboundedSender<Vec<Value>>)>,
}

struct DispatcherInner {
    default_interest: Arc<dyn RemoteInterest>,
    membership: tokio::sync::Mutex<()>,
    events: Mutex<HashMap<String, EventEntry>>,
    next_id: AtomicU64,
    cleared: AtomicBool,
}

#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

impl EventDispatcher {
    pub fn new(default_interest: Arc<dyn RemoteInterest>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                default_interest,
                membership: tokio::sync::Mutex::new(()),
                events: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                cleared: AtomicBool::new(false),
            }),
        }
    }

    /// Route every notification of `session` through this dispatcher
    pub fn attach(&self, session: &RpcSession) {
        let dispatcher = self.clone();
        session.on_notification(move |method, params| {
            dispatcher.dispatch(&method, params);
        });
    }

    /// Subscribe with the dispatcher's default interest
    pub async fn subscribe(&self, event: &str) -> Result<Subscription, ApiError> {
        let interest = Arc::clone(&self.inner.default_interest);
        self.subscribe_with(event, interest).await
    }

    /// Subscribe, registering `interest` if this is the first receiver
    ///
    /// Later subscribers to the same event share the interest installed by
    /// the first one.
    pub async fn subscribe_with(
        &self,
        event: &str,
        interest: Arc<dyn RemoteInterest>,
    ) -> Result<Subscription, ApiError> {
        let _membership = self.inner.membership.lock().await;

        let first = !self.inner.events.lock().unwrap().contains_key(event);
        if first {
            debug!("EventDispatcher: registering remote interest in {}", event);
            interest.register(event).await?;
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .events
            .lock()
            .unwrap()
            .entry(event.to_string())
            .or_insert_with(|| EventEntry {
                interest,
                receivers: Vec::new(),
            })
            .receivers
            .push((id, sender));
        self.inner.cleared.store(false, Ordering::SeqCst);

        Ok(Subscription {
            event: event.to_string(),
            id,
            receiver,
            dispatcher: Some(Arc::clone(&self.inner)),
        })
    }

    /// Deliver one notification to every receiver of `method`
    ///
    /// Returns the number of receivers reached.
    pub fn dispatch(&self, method: &str, params: Vec<Value>) -> usize {
        let events = self.inner.events.lock().unwrap();
        let Some(entry) = events.get(method) else {
            trace!("EventDispatcher: no receivers for {}", method);
            return 0;
        };

        let mut delivered = 0;
        for (_, sender) in &entry.receivers {
            if sender.send(params.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of local receivers of `event`
    pub fn receiver_count(&self, event: &str) -> usize {
        self.inner
            .events
            .lock()
            .unwrap()
            .get(event)
            .map_or(0, |entry| entry.receivers.len())
    }

    /// Drop every receiver without contacting the remote
    ///
    /// Used once the session is gone; receivers see end of stream.
    pub fn clear(&self) {
        self.inner.cleared.store(true, Ordering::SeqCst);
        let drained = std::mem::take(&mut *self.inner.events.lock().unwrap());
        if !drained.is_empty() {
            debug!("EventDispatcher: cleared {} events", drained.len());
        }
    }
}

impl DispatcherInner {
    async fn remove(&self, event: &str, id: u64) -> Result<(), ApiError> {
        let _membership = self.membership.lock().await;

        let withdrawn = {
            let mut events = self.events.lock().unwrap();
            let Some(entry) = events.get_mut(event) else {
                return Ok(());
            };
            entry.receivers.retain(|(receiver_id, _)| *receiver_id != id);
            if entry.receivers.is_empty() {
                events.remove(event).map(|entry| entry.interest)
            } else {
                None
            }
        };

        match withdrawn {
            Some(_) if self.cleared.load(Ordering::SeqCst) => Ok(()),
            Some(interest) => {
                debug!("EventDispatcher: withdrawing remote interest in {}", event);
                interest.unregister(event).await
            }
            None => Ok(()),
        }
    }
}

/// One receiver of one event name
///
/// Dropping the handle detaches it; the remote teardown then runs on a
/// spawned task. Use [`Subscription::unsubscribe`] to observe its result.
pub struct Subscription {
    event: String,
    id: u64,
    receiver: mpsc::UnboundedReceiver<Vec<Value>>,
    dispatcher: Option<Arc<DispatcherInner>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Next notification arguments; `None` once the dispatcher is cleared
    pub async fn recv(&mut self) -> Option<Vec<Value>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<Value>> {
        self.receiver.try_recv().ok()
    }

    pub async fn unsubscribe(mut self) -> Result<(), ApiError> {
        match self.dispatcher.take() {
            Some(dispatcher) => dispatcher.remove(&self.event, self.id).await,
            None => Ok(()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(dispatcher) = self.dispatcher.take() else {
            return;
        };
        let event = std::mem::take(&mut self.event);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = dispatcher.remove(&event, id).await {
                        warn!("EventDispatcher: teardown of {} failed: {}", event, e);
                    }
                });
            }
            Err(_) => warn!(
                "EventDispatcher: subscription to {} dropped outside a runtime",
                event
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::error::RemoteError;
    use crate::rpc::testing::FakeRemote;

    fn dispatcher_with_remote() -> (EventDispatcher, RpcSession, FakeRemote) {
        let (session, remote) = FakeRemote::connect(|_, _| Some(Ok(Value::Nil)));
        let api = NvimApi::new(session.clone());
        let dispatcher = EventDispatcher::new(Arc::new(SubscribeInterest::new(api)));
        dispatcher.attach(&session);
        (dispatcher, session, remote)
    }

    #[tokio::test]
    async fn test_remote_subscribe_only_on_first_and_last() {
        let (dispatcher, _session, remote) = dispatcher_with_remote();

        let first = dispatcher.subscribe("mirror_event").await.unwrap();
        let second = dispatcher.subscribe("mirror_event").await.unwrap();
        assert_eq!(remote.methods(), vec!["nvim_subscribe"]);
        assert_eq!(dispatcher.receiver_count("mirror_event"), 2);

        first.unsubscribe().await.unwrap();
        assert_eq!(remote.methods(), vec!["nvim_subscribe"]);

        second.unsubscribe().await.unwrap();
        assert_eq!(remote.methods(), vec!["nvim_subscribe", "nvim_unsubscribe"]);
        assert_eq!(dispatcher.receiver_count("mirror_event"), 0);

        let calls = remote.calls();
        assert_eq!(calls[0].params, vec![Value::from("mirror_event")]);
        assert_eq!(calls[1].params, vec![Value::from("mirror_event")]);
    }

    #[tokio::test]
    async fn test_fan_out_in_order() {
        let (dispatcher, _session, remote) = dispatcher_with_remote();
        let mut a = dispatcher.subscribe("tick").await.unwrap();
        let mut b = dispatcher.subscribe("tick").await.unwrap();

        for n in 0..3i64 {
            remote.notify("tick", vec![Value::from(n)]).await;
        }

        for n in 0..3i64 {
            assert_eq!(a.recv().await.unwrap(), vec![Value::from(n)]);
            assert_eq!(b.recv().await.unwrap(), vec![Value::from(n)]);
        }
    }

    #[tokio::test]
    async fn test_unregistered_event_is_ignored() {
        let (dispatcher, _session, _remote) = dispatcher_with_remote();
        assert_eq!(dispatcher.dispatch("nobody_listens", vec![]), 0);
    }

    #[tokio::test]
    async fn test_drop_detaches_and_unsubscribes() {
        let (dispatcher, _session, remote) = dispatcher_with_remote();
        let subscription = dispatcher.subscribe("gone").await.unwrap();
        drop(subscription);

        let calls = remote.wait_for_calls(2).await;
        assert_eq!(calls[1].method, "nvim_unsubscribe");
        assert_eq!(dispatcher.receiver_count("gone"), 0);
    }

    #[tokio::test]
    async fn test_clear_skips_remote_teardown() {
        let (dispatcher, _session, remote) = dispatcher_with_remote();
        let mut subscription = dispatcher.subscribe("closing").await.unwrap();

        dispatcher.clear();
        assert!(subscription.recv().await.is_none());
        subscription.unsubscribe().await.unwrap();

        assert_eq!(remote.methods(), vec!["nvim_subscribe"]);
    }

    #[tokio::test]
    async fn test_failed_registration_leaves_no_receiver() {
        let (session, _remote) =
            FakeRemote::connect(|_, _| Some(Err(RemoteError::exception("refused"))));
        let dispatcher =
            EventDispatcher::new(Arc::new(SubscribeInterest::new(NvimApi::new(session))));

        assert!(dispatcher.subscribe("refused").await.is_err());
        assert_eq!(dispatcher.receiver_count("refused"), 0);
    }

    #[tokio::test]
    async fn test_no_remote_interest() {
        let (dispatcher, _session, remote) = dispatcher_with_remote();
        let mut lines = dispatcher
            .subscribe_with("nvim_buf_lines_event", Arc::new(NoRemoteInterest))
            .await
            .unwrap();

        remote
            .notify("nvim_buf_lines_event", vec![Value::from(1i64)])
            .await;
        assert_eq!(lines.recv().await.unwrap(), vec![Value::from(1i64)]);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_subscribers_share_one_registration() {
        let (dispatcher, _session, remote) = dispatcher_with_remote();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.subscribe("shared").await.unwrap()
            }));
        }
        let mut subscriptions = Vec::new();
        for handle in handles {
            subscriptions.push(handle.await.unwrap());
        }

        assert_eq!(remote.methods(), vec!["nvim_subscribe"]);
        assert_eq!(dispatcher.receiver_count("shared"), 8);
    }
}
