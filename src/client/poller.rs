use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use tracing::warn;
use uuid::Uuid;

use crate::{AppResult, ChatError, messages::store::Message};

pub const POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);
/// Transient poll failures stay silent until this many happen in a row.
pub const POLL_FAILURE_NOTICE: u32 = 3;

/// Where `get-since` answers come from. The real implementation is
/// [`HttpSource`]; tests substitute their own.
pub trait MessageSource {
    async fn messages_since(
        &self,
        conversation_id: Uuid,
        after_seq: i64,
    ) -> AppResult<Vec<Message>>;
}

/// The server's reconciliation endpoint over HTTP.
pub struct HttpSource {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> HttpSource {
        HttpSource {
            base_url: base_url.into(),
            token: token.into(),
            http: reqwest::Client::new(),
        }
    }
}

impl MessageSource for HttpSource {
    async fn messages_since(
        &self,
        conversation_id: Uuid,
        after_seq: i64,
    ) -> AppResult<Vec<Message>> {
        let url = format!(
            "{}/api/conversations/{conversation_id}/messages/since?after={after_seq}",
            self.base_url.trim_end_matches('/'),
        );
        let body: serde_json::Value = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let data = body
            .get("data")
            .cloned()
            .ok_or_else(|| ChatError::Transient("malformed poll response".to_owned()))?;
        Ok(serde_json::from_value(data)?)
    }
}

/// The client's applied-message list. Every message goes through here no
/// matter how it arrived (push or poll) and is deduplicated by id, which is
/// what makes at-least-once delivery plus polling safe to run together.
#[derive(Default)]
pub struct ConversationView {
    messages: Vec<Message>,
    seen: HashSet<Uuid>,
}

impl ConversationView {
    pub fn apply(&mut self, msg: Message) -> bool {
        if !self.seen.insert(msg.id) {
            return false;
        }
        let key = (msg.created_at, msg.id);
        let pos = self
            .messages
            .partition_point(|m| (m.created_at, m.id) <= key);
        self.messages.insert(pos, msg);
        true
    }

    /// Highest applied sequence number; the poll cursor. The same monotone
    /// counter the server orders by, so a clock step cannot move it backwards.
    pub fn latest_seq(&self) -> i64 {
        self.messages.iter().map(|m| m.seq).max().unwrap_or(0)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.messages.iter().map(|m| m.id).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Poll succeeded; this many previously-unseen messages were applied.
    Applied(usize),
    /// A previous poll for this conversation is still in flight.
    Skipped,
    /// Transient failure, retrying silently on the next tick.
    Deferred,
    /// Failures have persisted long enough that the client should surface it.
    Degraded,
}

struct PollerInner<S> {
    source: S,
    conversation_id: Uuid,
    view: Mutex<ConversationView>,
    in_flight: AtomicBool,
    failures: AtomicU32,
}

/// Poll-based healing for gaps left by missed pushes. One in-flight request
/// per conversation at most: a tick that fires while one is outstanding is
/// skipped, not queued.
pub struct ReconciliationPoller<S> {
    inner: Arc<PollerInner<S>>,
}

impl<S> Clone for ReconciliationPoller<S> {
    fn clone(&self) -> Self {
        ReconciliationPoller {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: MessageSource> ReconciliationPoller<S> {
    pub fn new(source: S, conversation_id: Uuid) -> ReconciliationPoller<S> {
        ReconciliationPoller {
            inner: Arc::new(PollerInner {
                source,
                conversation_id,
                view: Mutex::new(ConversationView::default()),
                in_flight: AtomicBool::new(false),
                failures: AtomicU32::new(0),
            }),
        }
    }

    fn view(&self) -> std::sync::MutexGuard<'_, ConversationView> {
        self.inner.view.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feed a pushed message through the same dedup path the poller uses.
    pub fn apply_push(&self, msg: Message) -> bool {
        self.view().apply(msg)
    }

    pub fn applied_ids(&self) -> Vec<Uuid> {
        self.view().ids()
    }

    pub fn applied_len(&self) -> usize {
        self.view().len()
    }

    pub async fn tick(&self) -> PollOutcome {
        if self.inner.in_flight.swap(true, Ordering::SeqCst) {
            return PollOutcome::Skipped;
        }
        let after = self.view().latest_seq();
        let res = tokio::time::timeout(
            POLL_TIMEOUT,
            self.inner
                .source
                .messages_since(self.inner.conversation_id, after),
        )
        .await;
        self.inner.in_flight.store(false, Ordering::SeqCst);

        match res {
            Ok(Ok(msgs)) => {
                self.inner.failures.store(0, Ordering::SeqCst);
                let mut view = self.view();
                let applied = msgs.into_iter().filter(|m| view.apply(m.clone())).count();
                PollOutcome::Applied(applied)
            }
            Ok(Err(_)) | Err(_) => {
                let failures = self.inner.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= POLL_FAILURE_NOTICE {
                    PollOutcome::Degraded
                } else {
                    PollOutcome::Deferred
                }
            }
        }
    }

    /// Fixed-interval loop while the conversation is active.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if self.tick().await == PollOutcome::Degraded {
                warn!(
                    conversation = %self.inner.conversation_id,
                    "reconciliation has been failing for several intervals"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::store::MessageKind;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    fn msg(conversation_id: Uuid, seq: i64, created_at: i64) -> Message {
        Message {
            id: Uuid::now_v7(),
            conversation_id,
            sender_id: Some(Uuid::now_v7()),
            kind: MessageKind::Text,
            content: "hello".to_owned(),
            reply_to_id: None,
            attachment: None,
            reactions: Vec::new(),
            edited: false,
            edited_at: None,
            deleted: false,
            seq,
            created_at,
        }
    }

    struct FixedSource {
        messages: Vec<Message>,
        failing: StdAtomicBool,
    }

    impl FixedSource {
        fn new(messages: Vec<Message>) -> FixedSource {
            FixedSource {
                messages,
                failing: StdAtomicBool::new(false),
            }
        }
    }

    impl MessageSource for FixedSource {
        async fn messages_since(
            &self,
            _conversation_id: Uuid,
            after_seq: i64,
        ) -> AppResult<Vec<Message>> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ChatError::Transient("down".to_owned()));
            }
            Ok(self
                .messages
                .iter()
                .filter(|m| m.seq > after_seq)
                .cloned()
                .collect())
        }
    }

    struct SlowSource;

    impl MessageSource for SlowSource {
        async fn messages_since(
            &self,
            _conversation_id: Uuid,
            _after_seq: i64,
        ) -> AppResult<Vec<Message>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn push_then_poll_applies_each_message_once() {
        let conv = Uuid::now_v7();
        let pushed = msg(conv, 1, 100);
        let missed = msg(conv, 2, 200);
        let poller = ReconciliationPoller::new(
            FixedSource::new(vec![pushed.clone(), missed.clone()]),
            conv,
        );

        assert!(poller.apply_push(pushed.clone()));
        assert!(!poller.apply_push(pushed.clone()));

        // the push advanced the cursor, so the poll resumes past it and only
        // the missed message comes back
        let outcome = poller.tick().await;
        assert_eq!(outcome, PollOutcome::Applied(1));
        assert_eq!(poller.applied_len(), 2);

        let ids = poller.applied_ids();
        assert_eq!(ids, vec![pushed.id, missed.id]);
    }

    #[tokio::test]
    async fn replayed_poll_results_are_dropped_by_the_view() {
        let conv = Uuid::now_v7();
        let first = msg(conv, 1, 100);
        let poller = ReconciliationPoller::new(FixedSource::new(vec![first.clone()]), conv);

        assert_eq!(poller.tick().await, PollOutcome::Applied(1));
        // a push replaying the polled message is deduplicated by id
        assert!(!poller.apply_push(first.clone()));
        assert_eq!(poller.applied_len(), 1);
    }

    #[tokio::test]
    async fn view_orders_by_timestamp_then_id() {
        let conv = Uuid::now_v7();
        let mut view = ConversationView::default();
        let a = msg(conv, 3, 300);
        let b = msg(conv, 1, 100);
        let c = msg(conv, 2, 200);
        view.apply(a.clone());
        view.apply(b.clone());
        view.apply(c.clone());
        assert_eq!(view.ids(), vec![b.id, c.id, a.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_tick_is_skipped_not_queued() {
        let conv = Uuid::now_v7();
        let poller = ReconciliationPoller::new(SlowSource, conv);

        let racing = poller.clone();
        let first = tokio::spawn(async move { racing.tick().await });
        tokio::task::yield_now().await;

        assert_eq!(poller.tick().await, PollOutcome::Skipped);

        // let the slow request time out; the next tick runs again
        tokio::time::advance(POLL_TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(first.await.unwrap(), PollOutcome::Deferred);
    }

    #[tokio::test]
    async fn failures_stay_silent_then_escalate() {
        let conv = Uuid::now_v7();
        let source = FixedSource::new(Vec::new());
        source.failing.store(true, Ordering::SeqCst);
        let poller = ReconciliationPoller::new(source, conv);

        assert_eq!(poller.tick().await, PollOutcome::Deferred);
        assert_eq!(poller.tick().await, PollOutcome::Deferred);
        assert_eq!(poller.tick().await, PollOutcome::Degraded);
    }

    #[tokio::test]
    async fn success_resets_the_failure_counter() {
        let conv = Uuid::now_v7();
        let source = FixedSource::new(Vec::new());
        source.failing.store(true, Ordering::SeqCst);
        let poller = ReconciliationPoller::new(source, conv);

        poller.tick().await;
        poller.tick().await;
        poller.inner.source.failing.store(false, Ordering::SeqCst);
        assert_eq!(poller.tick().await, PollOutcome::Applied(0));

        poller.inner.source.failing.store(true, Ordering::SeqCst);
        assert_eq!(poller.tick().await, PollOutcome::Deferred);
    }
}
