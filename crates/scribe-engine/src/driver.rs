//! Streaming session driver: runs one turn per request and exposes its
//! events as an ordered stream that ends with exactly one terminal event.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info, warn, Instrument};

use scribe_core::events::TurnEvent;
use scribe_core::ids::ThreadId;
use scribe_store::{ConversationStore, ThreadLocks, ThreadState};

use crate::error::EngineError;
use crate::sink::EventSink;
use crate::supervisor::{Supervisor, TurnContext, TurnOutcome};

#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// Events buffered per stream before the turn waits for the client.
    pub channel_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

/// Per-request knobs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TurnOverrides {
    /// Replaces both the worker and the tool timeout for this turn.
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub query: String,
    pub thread_id: ThreadId,
    pub overrides: TurnOverrides,
}

impl TurnRequest {
    pub fn new(query: impl Into<String>, thread_id: ThreadId) -> Self {
        Self {
            query: query.into(),
            thread_id,
            overrides: TurnOverrides::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.overrides.timeout = Some(timeout);
        self
    }
}

enum TurnMode {
    Query(String),
    Resume,
}

pub struct SessionDriver {
    supervisor: Arc<Supervisor>,
    locks: Arc<ThreadLocks>,
    config: DriverConfig,
}

impl SessionDriver {
    pub fn new(supervisor: Arc<Supervisor>, config: DriverConfig) -> Self {
        Self {
            supervisor,
            locks: Arc::new(ThreadLocks::new()),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        self.supervisor.store()
    }

    /// Start a turn for `request.query`.
    ///
    /// The turn waits for any earlier turn on the same thread. If the thread's
    /// previous turn was interrupted and this is the same query, that turn is
    /// resumed instead of started over.
    pub fn open_stream(&self, request: TurnRequest) -> TurnStream {
        self.spawn_turn(request.thread_id, TurnMode::Query(request.query), request.overrides)
    }

    /// Resume the thread's interrupted turn.
    pub fn resume_stream(&self, thread_id: ThreadId, overrides: TurnOverrides) -> TurnStream {
        self.spawn_turn(thread_id, TurnMode::Resume, overrides)
    }

    /// Committed transcript; `None` for a thread never written.
    pub fn history(&self, thread_id: &ThreadId) -> Result<Option<ThreadState>, EngineError> {
        Ok(self.store().load(thread_id)?)
    }

    /// Whether a turn currently holds the thread.
    pub fn is_busy(&self, thread_id: &ThreadId) -> bool {
        self.locks.is_busy(thread_id)
    }

    fn spawn_turn(&self, thread_id: ThreadId, mode: TurnMode, overrides: TurnOverrides) -> TurnStream {
        let (sink, rx) = EventSink::channel(self.config.channel_capacity);
        let cancel = CancellationToken::new();
        let config = self.supervisor.config();
        let ctx = TurnContext {
            sink,
            cancel: cancel.clone(),
            worker_timeout: overrides.timeout.unwrap_or(config.worker_timeout),
            tool_timeout: overrides.timeout.unwrap_or(config.tool_timeout),
        };

        // Queue position is taken here, in submission order, not when the task first runs.
        let reservation = self.locks.reserve(&thread_id);
        let supervisor = Arc::clone(&self.supervisor);
        let locks = Arc::clone(&self.locks);
        let thread = thread_id.clone();
        let span = tracing::info_span!("turn", thread_id = %thread_id);

        tokio::spawn(
            async move {
                let guard = tokio::select! {
                    _ = ctx.cancel.cancelled() => None,
                    guard = reservation.acquire() => Some(guard),
                };
                if let Some(guard) = guard {
                    let result = run(&supervisor, &thread, mode, &ctx).await;
                    finish(&supervisor, &thread, result, &ctx.sink).await;
                    drop(guard);
                }
                locks.prune();
            }
            .instrument(span),
        );

        TurnStream {
            thread_id,
            events: ReceiverStream::new(rx),
            finished: false,
            _cancel: cancel.drop_guard(),
        }
    }
}

async fn run(
    supervisor: &Supervisor,
    thread_id: &ThreadId,
    mode: TurnMode,
    ctx: &TurnContext,
) -> Result<TurnOutcome, EngineError> {
    let query = match mode {
        TurnMode::Resume => return supervisor.resume_turn(thread_id, ctx).await,
        TurnMode::Query(query) => query,
    };

    if let Some((interrupted, _)) = supervisor.in_flight(thread_id)? {
        if interrupted.query == query {
            info!(turn_id = %interrupted.turn_id, "same query as the interrupted turn, resuming");
            return supervisor.resume_turn(thread_id, ctx).await;
        }
        supervisor.abandon(thread_id, "superseded by a new query")?;
    }
    supervisor.run_turn(thread_id, &query, ctx).await
}

/// Send the terminal event. A failed turn is marked so it is not resumed;
/// an aborted one keeps its checkpoint.
async fn finish(
    supervisor: &Supervisor,
    thread_id: &ThreadId,
    result: Result<TurnOutcome, EngineError>,
    sink: &EventSink,
) {
    let terminal = match result {
        Ok(outcome) => {
            info!(turn_id = %outcome.turn_id, steps = outcome.steps, "turn streamed");
            TurnEvent::End
        }
        Err(e) => {
            match &e {
                EngineError::Aborted => info!("turn aborted, checkpoint kept for resume"),
                EngineError::NothingToResume(_) => warn!(error = %e, "resume requested"),
                _ => {
                    error!(error = %e, kind = e.error_kind(), "turn failed");
                    if let Err(mark) = supervisor.abandon(thread_id, &e.to_string()) {
                        warn!(error = %mark, "could not mark failed turn");
                    }
                }
            }
            TurnEvent::error(e.user_message())
        }
    };
    // Nobody left to tell if the client is gone.
    let _ = sink.send(terminal).await;
}

/// The client's view of one turn.
///
/// Yields events in emission order and always ends with exactly one `End` or
/// `Error`. Dropping it cancels the turn; the thread is released as soon as
/// the turn task notices.
pub struct TurnStream {
    thread_id: ThreadId,
    events: ReceiverStream<TurnEvent>,
    finished: bool,
    _cancel: DropGuard,
}

impl TurnStream {
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }
}

impl Stream for TurnStream {
    type Item = TurnEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TurnEvent>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.events).poll_next(cx) {
            Poll::Ready(Some(event)) => {
                this.finished = event.is_terminal();
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(TurnEvent::error("The turn ended unexpectedly.")))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::checkpoint::{TurnCheckpoint, TurnPhase};
    use crate::supervisor::tests::{editorial_script, is_supervisor, is_writer, supervisor_with, REPORT};
    use crate::supervisor::SupervisorConfig;
    use crate::worker::RetryPolicy;
    use scribe_core::checkpoint::Checkpoint;
    use scribe_core::errors::GatewayError;
    use scribe_core::events::{ToolCallPhase, TurnEvent};
    use scribe_core::messages::Message;
    use scribe_llm::{MockProvider, MockResponse};
    use scribe_store::{MemoryStore, SqliteStore, StoreError, ThreadSummary};

    fn driver(mock: Arc<MockProvider>) -> (SessionDriver, Arc<dyn ConversationStore>) {
        let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
        let config = SupervisorConfig {
            worker_retry: RetryPolicy::none(),
            ..SupervisorConfig::default()
        };
        let supervisor = supervisor_with(mock, store.clone(), config);
        (SessionDriver::new(Arc::new(supervisor), DriverConfig::default()), store)
    }

    fn text(events: &[TurnEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::ContentDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn assert_single_terminal(events: &[TurnEvent]) {
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1, "{events:?}");
        assert!(events.last().unwrap().is_terminal());
    }

    fn latest(store: &dyn ConversationStore, thread: &ThreadId) -> TurnCheckpoint {
        TurnCheckpoint::from_checkpoint(&store.latest_checkpoint(thread).unwrap().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn fresh_thread_streams_to_end() {
        let mock = Arc::new(MockProvider::with_responder(editorial_script));
        let (driver, store) = driver(mock);
        let thread = ThreadId::from_raw("t1");
        assert!(driver.history(&thread).unwrap().is_none());

        let query = "Write a short witty review of 'Python', then check its word count";
        let events: Vec<TurnEvent> = driver
            .open_stream(TurnRequest::new(query, thread.clone()))
            .collect()
            .await;

        assert_single_terminal(&events);
        assert_eq!(events.last().unwrap(), &TurnEvent::End);

        let history = driver.history(&thread).unwrap().unwrap();
        assert_eq!(history.messages.first().unwrap(), &Message::user(query));
        let last = history.messages.last().unwrap();
        assert_eq!(last, &Message::assistant(text(&events)));
        assert!(last.content().contains("55 characters"));
        assert_eq!(latest(store.as_ref(), &thread).phase, TurnPhase::Done);
    }

    #[tokio::test]
    async fn failure_yields_one_error_event() {
        let mock = Arc::new(MockProvider::new(vec![MockResponse::Error(
            GatewayError::AuthenticationFailed("bad key".into()),
        )]));
        let (driver, store) = driver(mock);
        let thread = ThreadId::from_raw("broken");

        let events: Vec<TurnEvent> = driver
            .open_stream(TurnRequest::new("hello", thread.clone()))
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            TurnEvent::Error { message } => assert!(message.contains("API key"), "{message}"),
            other => panic!("expected error, got {other:?}"),
        }
        // the user message was committed; the turn is closed out as failed
        assert_eq!(driver.history(&thread).unwrap().unwrap().messages.len(), 1);
        assert_eq!(latest(store.as_ref(), &thread).phase, TurnPhase::Failed);
    }

    #[tokio::test]
    async fn partial_content_stays_before_error() {
        let mock = Arc::new(MockProvider::with_responder(|ctx| {
            if is_supervisor(ctx) && ctx.tool_result_count() == 0 {
                MockResponse::text_then_tool_calls(
                    "Let me ask the writer. ",
                    vec![("delegate_to_writer", json!({"request": "x"}))],
                )
            } else {
                MockResponse::stream_error(GatewayError::InvalidRequest("model gone".into()))
            }
        }));
        let (driver, _store) = driver(mock);

        let events: Vec<TurnEvent> = driver
            .open_stream(TurnRequest::new("go", ThreadId::from_raw("partial")))
            .collect()
            .await;

        assert_single_terminal(&events);
        assert_eq!(events[0], TurnEvent::content("Let me ask the writer. "));
        assert!(matches!(events.last().unwrap(), TurnEvent::Error { .. }));
    }

    #[tokio::test]
    async fn same_thread_turns_are_serialized() {
        let mock = Arc::new(MockProvider::with_responder(|ctx| {
            if !is_supervisor(ctx) {
                return MockResponse::text("draft");
            }
            match (ctx.last_user_text(), ctx.tool_result_count()) {
                (Some("first"), 0) => MockResponse::delayed(
                    Duration::from_millis(200),
                    MockResponse::tool_call("delegate_to_writer", json!({"request": "one"})),
                ),
                (Some("second"), n) if n < 2 => {
                    MockResponse::tool_call("delegate_to_writer", json!({"request": "two"}))
                }
                _ => MockResponse::text("ok"),
            }
        }));
        let (driver, _store) = driver(mock.clone());
        let thread = ThreadId::from_raw("shared");

        let first = driver.open_stream(TurnRequest::new("first", thread.clone()));
        let second = driver.open_stream(TurnRequest::new("second", thread.clone()));
        let (a, b) = tokio::join!(first.collect::<Vec<_>>(), second.collect::<Vec<_>>());
        assert_eq!(a.last().unwrap(), &TurnEvent::End);
        assert_eq!(b.last().unwrap(), &TurnEvent::End);

        // The second turn's first reasoning call already sees the first turn's answer.
        let second_ctx = mock
            .contexts()
            .into_iter()
            .find(|c| is_supervisor(c) && c.last_user_text() == Some("second"))
            .unwrap();
        assert_eq!(second_ctx.first_user_text(), Some("first"));
        assert!(second_ctx
            .messages
            .iter()
            .any(|m| m == &Message::assistant("ok")));

        let messages = driver.history(&thread).unwrap().unwrap().messages;
        let users: Vec<&str> = messages
            .iter()
            .filter(|m| matches!(m, Message::User { .. }))
            .map(|m| m.content())
            .collect();
        assert_eq!(users, ["first", "second"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_thread_turns_start_in_submission_order() {
        for round in 0..50 {
            let mock = Arc::new(MockProvider::with_responder(|_| MockResponse::text("ok")));
            let (driver, _store) = driver(mock.clone());
            let thread = ThreadId::from_raw(format!("ordered-{round}"));

            let streams: Vec<TurnStream> = ["first", "second", "third"]
                .into_iter()
                .map(|q| driver.open_stream(TurnRequest::new(q, thread.clone())))
                .collect();
            let results = futures::future::join_all(streams.into_iter().map(|s| s.collect::<Vec<_>>())).await;
            assert!(results.iter().all(|events| events.last() == Some(&TurnEvent::End)));

            let order: Vec<String> = mock
                .contexts()
                .iter()
                .filter_map(|c| c.last_user_text().map(str::to_string))
                .collect();
            assert_eq!(order, ["first", "second", "third"], "round {round}");
        }
    }

    #[tokio::test]
    async fn lock_table_is_pruned_after_turns() {
        let mock = Arc::new(MockProvider::with_responder(|_| MockResponse::text("ok")));
        let (driver, _store) = driver(mock);

        for n in 0..5 {
            let events: Vec<TurnEvent> = driver
                .open_stream(TurnRequest::new("hi", ThreadId::from_raw(format!("random-{n}"))))
                .collect()
                .await;
            assert_eq!(events.last().unwrap(), &TurnEvent::End);
        }
        for _ in 0..100 {
            if driver.locks.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(driver.locks.is_empty(), "{} entries left", driver.locks.len());
    }

    /// Delegates to a memory store but fails its `fail_on`-th commit.
    struct FlakyStore {
        inner: MemoryStore,
        commits: AtomicUsize,
        fail_on: usize,
    }

    impl ConversationStore for FlakyStore {
        fn backend(&self) -> &'static str {
            "flaky"
        }

        fn load(&self, thread_id: &ThreadId) -> Result<Option<ThreadState>, StoreError> {
            self.inner.load(thread_id)
        }

        fn commit(
            &self,
            thread_id: &ThreadId,
            messages: &[Message],
            checkpoint: Option<&Checkpoint>,
        ) -> Result<u64, StoreError> {
            if self.commits.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.commit(thread_id, messages, checkpoint)
        }

        fn latest_checkpoint(&self, thread_id: &ThreadId) -> Result<Option<Checkpoint>, StoreError> {
            self.inner.latest_checkpoint(thread_id)
        }

        fn list_threads(&self) -> Result<Vec<ThreadSummary>, StoreError> {
            self.inner.list_threads()
        }
    }

    #[tokio::test]
    async fn store_failure_ends_turn_without_touching_history() {
        // Commits: first turn's query and answer, second turn's query, then its answer fails.
        let store: Arc<dyn ConversationStore> = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            commits: AtomicUsize::new(0),
            fail_on: 4,
        });
        let mock = Arc::new(MockProvider::with_responder(|ctx| {
            MockResponse::text(if ctx.last_user_text() == Some("one") { "first answer" } else { "second answer" })
        }));
        let config = SupervisorConfig {
            worker_retry: RetryPolicy::none(),
            ..SupervisorConfig::default()
        };
        let driver = SessionDriver::new(
            Arc::new(supervisor_with(mock, store.clone(), config)),
            DriverConfig::default(),
        );
        let thread = ThreadId::from_raw("flaky");

        let events: Vec<TurnEvent> = driver.open_stream(TurnRequest::new("one", thread.clone())).collect().await;
        assert_eq!(events.last().unwrap(), &TurnEvent::End);
        let before = driver.history(&thread).unwrap().unwrap().messages;
        assert_eq!(before.len(), 2);

        let events: Vec<TurnEvent> = driver.open_stream(TurnRequest::new("two", thread.clone())).collect().await;
        assert_single_terminal(&events);
        match events.last().unwrap() {
            TurnEvent::Error { message } => {
                assert!(message.starts_with("Conversation memory is unavailable"), "{message}")
            }
            other => panic!("expected error, got {other:?}"),
        }

        let after = driver.history(&thread).unwrap().unwrap().messages;
        assert_eq!(&after[..2], &before[..]);
        assert_eq!(after.len(), 3);
        assert_eq!(after[2], Message::user("two"));
        assert_eq!(latest(store.as_ref(), &thread).phase, TurnPhase::Failed);
    }

    #[tokio::test]
    async fn different_threads_do_not_block() {
        let mock = Arc::new(MockProvider::with_responder(|ctx| {
            if ctx.last_user_text() == Some("slow") {
                MockResponse::delayed(Duration::from_secs(3600), MockResponse::text("late"))
            } else {
                MockResponse::text("quick")
            }
        }));
        let (driver, _store) = driver(mock);

        let slow = driver.open_stream(TurnRequest::new("slow", ThreadId::from_raw("a")));
        let start = Instant::now();
        let events: Vec<TurnEvent> = tokio::time::timeout(
            Duration::from_secs(5),
            driver
                .open_stream(TurnRequest::new("fast", ThreadId::from_raw("b")))
                .collect(),
        )
        .await
        .expect("independent thread was blocked");
        assert_eq!(events, [TurnEvent::content("quick"), TurnEvent::End]);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(driver.is_busy(&ThreadId::from_raw("a")));
        drop(slow);
    }

    #[tokio::test]
    async fn disconnect_releases_thread_and_allows_resume() {
        let mock = Arc::new(MockProvider::with_responder(|ctx| {
            if is_supervisor(ctx) || is_writer(ctx) {
                editorial_script(ctx)
            } else if ctx.tool_result_count() == 0 {
                MockResponse::delayed(
                    Duration::from_secs(3600),
                    MockResponse::tool_call("word_counter", json!({"text": "x"})),
                )
            } else {
                MockResponse::text(REPORT)
            }
        }));
        let (driver, store) = driver(mock);
        let thread = ThreadId::from_raw("dropped");

        let mut stream = driver.open_stream(TurnRequest::new("review python", thread.clone()));
        while let Some(event) = stream.next().await {
            if let TurnEvent::ToolCallDelta(meta) = &event {
                if meta.name == "delegate_to_reviewer" && meta.phase == ToolCallPhase::Started {
                    break;
                }
            }
        }
        drop(stream);

        for _ in 0..100 {
            if !driver.is_busy(&thread) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!driver.is_busy(&thread));
        assert!(latest(store.as_ref(), &thread).is_in_flight());

        // A replacement provider that answers the reviewer immediately.
        let healed = Arc::new(MockProvider::with_responder(editorial_script));
        let config = SupervisorConfig {
            worker_retry: RetryPolicy::none(),
            ..SupervisorConfig::default()
        };
        let restarted = SessionDriver::new(
            Arc::new(supervisor_with(healed.clone(), store.clone(), config)),
            DriverConfig::default(),
        );
        let events: Vec<TurnEvent> = restarted
            .resume_stream(thread.clone(), TurnOverrides::default())
            .collect()
            .await;

        assert_eq!(events.last().unwrap(), &TurnEvent::End);
        assert!(healed.contexts().iter().all(|c| !is_writer(c)));
        let history = restarted.history(&thread).unwrap().unwrap();
        assert_eq!(history.messages.last().unwrap().content(), text(&events));
    }

    #[tokio::test]
    async fn interrupted_turn_resumes_after_reopening_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.sqlite");
        let thread = ThreadId::from_raw("durable");
        let config = SupervisorConfig {
            worker_retry: RetryPolicy::none(),
            ..SupervisorConfig::default()
        };

        {
            let stalled = Arc::new(MockProvider::with_responder(|ctx| {
                if is_supervisor(ctx) || is_writer(ctx) {
                    editorial_script(ctx)
                } else {
                    MockResponse::delayed(Duration::from_secs(3600), MockResponse::text(REPORT))
                }
            }));
            let store: Arc<dyn ConversationStore> = Arc::new(SqliteStore::open(&path).unwrap());
            let driver = SessionDriver::new(
                Arc::new(supervisor_with(stalled, store, config.clone())),
                DriverConfig::default(),
            );
            let mut stream = driver.open_stream(TurnRequest::new("review python", thread.clone()));
            while let Some(event) = stream.next().await {
                if matches!(&event, TurnEvent::ToolCallDelta(meta) if meta.name == "delegate_to_reviewer") {
                    break;
                }
            }
            drop(stream);
            while driver.is_busy(&thread) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        let store: Arc<dyn ConversationStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let healed = Arc::new(MockProvider::with_responder(editorial_script));
        let driver = SessionDriver::new(
            Arc::new(supervisor_with(healed.clone(), store.clone(), config)),
            DriverConfig::default(),
        );
        let events: Vec<TurnEvent> = driver
            .resume_stream(thread.clone(), TurnOverrides::default())
            .collect()
            .await;

        assert_eq!(events.last().unwrap(), &TurnEvent::End);
        assert!(healed.contexts().iter().all(|c| !is_writer(c)));
        let messages = store.load(&thread).unwrap().unwrap().messages;
        assert_eq!(messages.last().unwrap().content(), text(&events));
        assert_eq!(latest(store.as_ref(), &thread).phase, TurnPhase::Done);
    }

    #[tokio::test]
    async fn resubmitting_the_interrupted_query_resumes_it() {
        let (driver, store) = driver(Arc::new(MockProvider::with_responder(editorial_script)));
        let thread = ThreadId::from_raw("again");

        // Leave an interrupted turn behind by hand.
        let mut cp = TurnCheckpoint::fresh("same query");
        cp.transition(TurnPhase::Planning);
        cp.reply = "Asking the writer. ".into();
        store
            .commit(
                &thread,
                &[Message::user("same query")],
                Some(&cp.to_checkpoint(&thread, 1).unwrap()),
            )
            .unwrap();

        let events: Vec<TurnEvent> = driver
            .open_stream(TurnRequest::new("same query", thread.clone()))
            .collect()
            .await;
        assert_eq!(events.first().unwrap(), &TurnEvent::content("Asking the writer. "));
        assert_eq!(events.last().unwrap(), &TurnEvent::End);

        let history = driver.history(&thread).unwrap().unwrap();
        let users = history
            .messages
            .iter()
            .filter(|m| matches!(m, Message::User { .. }))
            .count();
        assert_eq!(users, 1);
        assert_eq!(latest(store.as_ref(), &thread).turn_id, cp.turn_id);
    }

    #[tokio::test]
    async fn a_new_query_supersedes_the_interrupted_turn() {
        let (driver, store) = driver(Arc::new(MockProvider::with_responder(|_| {
            MockResponse::text("fresh answer")
        })));
        let thread = ThreadId::from_raw("superseded");

        let mut cp = TurnCheckpoint::fresh("old query");
        cp.transition(TurnPhase::Planning);
        store
            .commit(
                &thread,
                &[Message::user("old query")],
                Some(&cp.to_checkpoint(&thread, 1).unwrap()),
            )
            .unwrap();

        let events: Vec<TurnEvent> = driver
            .open_stream(TurnRequest::new("new query", thread.clone()))
            .collect()
            .await;
        assert_eq!(events, [TurnEvent::content("fresh answer"), TurnEvent::End]);

        // sequence 2 marked the old turn failed, 3.. belong to the new turn
        let latest = latest(store.as_ref(), &thread);
        assert_ne!(latest.turn_id, cp.turn_id);
        assert_eq!(latest.phase, TurnPhase::Done);
    }

    #[tokio::test]
    async fn resume_without_interrupted_turn_is_an_error() {
        let (driver, _store) = driver(Arc::new(MockProvider::new(vec![])));
        let events: Vec<TurnEvent> = driver
            .resume_stream(ThreadId::from_raw("nothing"), TurnOverrides::default())
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TurnEvent::Error { message } if message.contains("nothing")));
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_bounds_workers() {
        let mock = Arc::new(MockProvider::with_responder(|ctx| {
            if is_supervisor(ctx) {
                MockResponse::tool_call("delegate_to_writer", json!({"request": "slow"}))
            } else {
                MockResponse::delayed(Duration::from_secs(600), MockResponse::text("late"))
            }
        }));
        let (driver, _store) = driver(mock);

        let request = TurnRequest::new("go", ThreadId::from_raw("slow")).with_timeout(Duration::from_secs(2));
        let events: Vec<TurnEvent> = driver.open_stream(request).collect().await;

        match events.last().unwrap() {
            TurnEvent::Error { message } => assert!(message.contains("timed out"), "{message}"),
            other => panic!("expected error, got {other:?}"),
        }
    }
}
