//! The dispatcher: submit entry point, admission loop, cancellation and
//! shutdown.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    courier_auto_reply::Pipeline,
    courier_common::Envelope,
    courier_config::DispatchConfig,
    tokio::{sync::Notify, task::JoinHandle, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use courier_metrics::{counter, dispatch as dispatch_metrics, gauge, histogram};

use crate::{
    Error, Result,
    error::Context,
    pool::{WorkerPermit, WorkerPool},
    priority::{PrefixPriority, PriorityRule},
    session::{Admission, CancelReport, SessionTable},
};

/// Runs one admitted envelope. Implemented by the message pipeline; tests
/// plug in recorders.
#[async_trait]
pub trait EnvelopeProcessor: Send + Sync + 'static {
    /// `cancel` is tripped by `cancel_session`, `cancel_all` and `shutdown`.
    /// Honoring it is cooperative.
    async fn process(&self, envelope: Envelope, cancel: CancellationToken);
}

#[async_trait]
impl EnvelopeProcessor for Pipeline {
    async fn process(&self, envelope: Envelope, cancel: CancellationToken) {
        self.run(envelope, cancel).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatcherState {
    Running = 0,
    /// Shutdown in progress, or the worker pool closed under the loop.
    Stopping = 1,
    Stopped = 2,
    /// The loop hit a broken session invariant and exited.
    Failed = 3,
}

impl DispatcherState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Stopping,
            2 => Self::Stopped,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    pub state: DispatcherState,
    pub sessions: usize,
    pub queued: usize,
    /// Admitted runs not yet released.
    pub outstanding: usize,
    /// Runs executing on the worker pool.
    pub in_flight: usize,
}

struct Inner {
    config: DispatchConfig,
    table: SessionTable,
    pool: WorkerPool,
    processor: Arc<dyn EnvelopeProcessor>,
    priority: Arc<dyn PriorityRule>,
    accepting: AtomicBool,
    state: AtomicU8,
    stop: CancellationToken,
    wake: Notify,
}

impl Inner {
    fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `next` unless the dispatcher already failed.
    fn transition(&self, next: DispatcherState) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != DispatcherState::Failed as u8).then_some(next as u8)
            });
    }

    fn fail(&self, e: &Error) {
        error!(error = %e, "session bookkeeping broken, stopping dispatcher loop");
        self.state
            .store(DispatcherState::Failed as u8, Ordering::SeqCst);
        self.stop.cancel();
    }
}

/// Releases an admission when its run ends, including by panic.
struct AdmissionGuard {
    inner: Arc<Inner>,
    session_id: String,
    handle_id: u64,
    #[cfg(feature = "metrics")]
    started: std::time::Instant,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.inner.table.release(&self.session_id, self.handle_id) {
            self.inner.fail(&e);
        }
        #[cfg(feature = "metrics")]
        {
            gauge!(dispatch_metrics::RUNS_IN_FLIGHT).decrement(1.0);
            histogram!(dispatch_metrics::RUN_DURATION_SECONDS)
                .record(self.started.elapsed().as_secs_f64());
        }
        self.inner.wake.notify_one();
    }
}

pub struct Dispatcher {
    inner: Arc<Inner>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start the dispatcher loop with the configured prefix priority rule.
    /// Must be called inside a tokio runtime.
    pub fn start(config: DispatchConfig, processor: Arc<dyn EnvelopeProcessor>) -> Self {
        let priority = Arc::new(PrefixPriority::new(config.priority_prefixes.clone()));
        Self::start_with_priority(config, processor, priority)
    }

    pub fn start_with_priority(
        config: DispatchConfig,
        processor: Arc<dyn EnvelopeProcessor>,
        priority: Arc<dyn PriorityRule>,
    ) -> Self {
        let inner = Arc::new(Inner {
            table: SessionTable::new(config.session_concurrency),
            pool: WorkerPool::new(config.worker_pool_size),
            config,
            processor,
            priority,
            accepting: AtomicBool::new(true),
            state: AtomicU8::new(DispatcherState::Running as u8),
            stop: CancellationToken::new(),
            wake: Notify::new(),
        });
        let handle = tokio::spawn(run_loop(Arc::clone(&inner)));
        info!(
            session_concurrency = inner.table.ceiling(),
            worker_pool_size = inner.pool.size(),
            "dispatcher started"
        );
        Self {
            inner,
            loop_handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue an envelope for its session. Never blocks.
    pub fn submit(&self, envelope: Envelope) -> Result<()> {
        if !self.is_running() {
            #[cfg(feature = "metrics")]
            counter!(dispatch_metrics::ENVELOPES_REJECTED_TOTAL).increment(1);
            return Err(Error::ShuttingDown);
        }

        let priority = self.inner.priority.is_priority(&envelope);
        let envelope_id = envelope.id();
        let session_id = envelope.session_id().unwrap_or_default().to_string();
        let depth = match self.inner.table.submit(envelope, priority) {
            Ok(depth) => depth,
            Err(e) => {
                #[cfg(feature = "metrics")]
                counter!(dispatch_metrics::ENVELOPES_REJECTED_TOTAL).increment(1);
                return Err(e);
            },
        };

        // Shutdown may have drained the table between the check above and
        // the insert; make sure nothing is left behind.
        if !self.inner.accepting.load(Ordering::SeqCst) {
            self.inner.table.cancel(&session_id);
            return Err(Error::ShuttingDown);
        }

        #[cfg(feature = "metrics")]
        counter!(dispatch_metrics::ENVELOPES_SUBMITTED_TOTAL).increment(1);
        debug!(
            session_id,
            envelope_id = %envelope_id,
            priority,
            depth,
            "envelope queued"
        );
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Drop the session's queued envelopes and signal its running ones.
    pub fn cancel_session(&self, session_id: &str) -> CancelReport {
        let report = self.inner.table.cancel(session_id);
        info!(
            session_id,
            discarded = report.discarded,
            signalled = report.signalled,
            "session cancelled"
        );
        #[cfg(feature = "metrics")]
        counter!(dispatch_metrics::ENVELOPES_CANCELLED_TOTAL).increment(report.discarded as u64);
        report
    }

    pub fn cancel_all(&self) -> CancelReport {
        let report = self.inner.table.cancel_all();
        info!(
            discarded = report.discarded,
            signalled = report.signalled,
            "all sessions cancelled"
        );
        #[cfg(feature = "metrics")]
        counter!(dispatch_metrics::ENVELOPES_CANCELLED_TOTAL).increment(report.discarded as u64);
        report
    }

    pub fn is_running(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
            && self.inner.state() == DispatcherState::Running
    }

    pub fn state(&self) -> DispatcherState {
        self.inner.state()
    }

    pub fn stats(&self) -> DispatcherStats {
        let table = self.inner.table.stats();
        DispatcherStats {
            state: self.inner.state(),
            sessions: table.sessions,
            queued: table.queued,
            outstanding: table.outstanding,
            in_flight: self.inner.pool.in_flight(),
        }
    }

    /// Stop accepting work, cancel every session, stop the loop and wait
    /// for in-flight runs, each step bounded by `shutdown_timeout`.
    /// Calling it again returns immediately.
    pub async fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            debug!("dispatcher already shut down");
            return;
        }
        info!("dispatcher shutting down");
        self.inner.transition(DispatcherState::Stopping);

        self.cancel_all();
        self.inner.stop.cancel();

        let timeout = self.inner.config.shutdown_timeout();
        let handle = self
            .loop_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(joined) => {
                    if let Err(e) = joined.context("dispatcher loop panicked") {
                        error!(error = %e, "dispatcher loop ended abnormally");
                    }
                },
                Err(_) => {
                    warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "dispatcher loop did not stop in time, aborting"
                    );
                    handle.abort();
                },
            }
        }

        self.inner.pool.close();
        self.drain(timeout).await;

        self.inner.transition(DispatcherState::Stopped);
        info!("dispatcher stopped");
    }

    async fn drain(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let interval = self.inner.config.cancel_check_interval();
        loop {
            let remaining = self.inner.pool.in_flight();
            if remaining == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "shutdown timed out with runs still in flight");
                return;
            }
            debug!(remaining, "waiting for in-flight runs");
            tokio::time::sleep(interval).await;
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.inner.stop.cancel();
    }
}

async fn run_loop(inner: Arc<Inner>) {
    let idle = inner.config.idle_sweep_interval();
    // Session to try first on the next sweep: the one after the last
    // admission, or the one the pool turned away.
    let mut next_start: Option<String> = None;

    loop {
        if inner.stop.is_cancelled() {
            break;
        }

        let mut session_ids = inner.table.session_ids();
        session_ids.sort_unstable();
        let count = session_ids.len();
        let mut admitted = 0usize;
        let start = match &next_start {
            Some(next) if count > 0 => {
                session_ids.partition_point(|id| id.as_str() < next.as_str()) % count
            },
            _ => 0,
        };

        for offset in 0..count {
            let index = (start + offset) % count;
            let session_id = &session_ids[index];
            match inner.table.try_admit(session_id) {
                Ok(Some(admission)) => match inner.pool.try_reserve() {
                    Ok(permit) => {
                        admitted += 1;
                        next_start = Some(session_ids[(index + 1) % count].clone());
                        spawn_run(&inner, permit, admission);
                    },
                    Err(e) => {
                        if let Err(e) = inner.table.rollback(admission) {
                            inner.fail(&e);
                            return;
                        }
                        #[cfg(feature = "metrics")]
                        counter!(dispatch_metrics::ADMISSION_ROLLBACKS_TOTAL).increment(1);
                        if matches!(e, Error::PoolClosed) {
                            warn!("worker pool closed, dispatcher loop stopping");
                            inner.transition(DispatcherState::Stopping);
                            return;
                        }
                        debug!(session_id, "worker pool saturated, admission rolled back");
                        next_start = Some(session_id.clone());
                        break;
                    },
                },
                Ok(None) => {
                    if inner.table.remove_if_idle(session_id) {
                        debug!(session_id, "idle session removed");
                    }
                },
                Err(e) => {
                    inner.fail(&e);
                    return;
                },
            }
        }

        #[cfg(feature = "metrics")]
        gauge!(dispatch_metrics::SESSIONS_ACTIVE).set(inner.table.session_ids().len() as f64);

        if admitted == 0 {
            tokio::select! {
                () = inner.stop.cancelled() => break,
                () = inner.wake.notified() => {},
                () = tokio::time::sleep(idle) => {},
            }
        } else {
            tokio::task::yield_now().await;
        }
    }

    debug!("dispatcher loop exited");
}

fn spawn_run(inner: &Arc<Inner>, permit: WorkerPermit, admission: Admission) {
    let Admission {
        session_id,
        envelope,
        handle,
        ..
    } = admission;

    #[cfg(feature = "metrics")]
    {
        counter!(dispatch_metrics::ENVELOPES_ADMITTED_TOTAL).increment(1);
        gauge!(dispatch_metrics::RUNS_IN_FLIGHT).increment(1.0);
    }

    let guard = AdmissionGuard {
        inner: Arc::clone(inner),
        session_id,
        handle_id: handle.id,
        #[cfg(feature = "metrics")]
        started: std::time::Instant::now(),
    };
    let processor = Arc::clone(&inner.processor);
    permit.spawn(async move {
        let _guard = guard;
        processor.process(envelope, handle.cancel).await;
    });
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        courier_auto_reply::{GeneratorRegistry, ReplyGenerator},
        courier_channels::{ChannelOutbound, ChannelRegistry, gating::GroupPolicy},
        courier_common::{EnvelopeKind, Reply, types::attr},
        courier_config::CourierConfig,
        std::{collections::HashMap, sync::atomic::AtomicUsize},
        tokio::sync::Semaphore,
    };

    fn config(session_concurrency: usize, worker_pool_size: usize) -> DispatchConfig {
        DispatchConfig {
            session_concurrency,
            worker_pool_size,
            idle_sweep_interval_ms: 20,
            cancel_check_interval_ms: 5,
            shutdown_timeout_ms: 2_000,
            priority_prefixes: vec!["#".into()],
        }
    }

    fn envelope(session: &str, text: &str) -> Envelope {
        Envelope::text(text)
            .with_attribute(attr::SESSION_ID, session)
            .with_attribute(attr::RECEIVER, session)
            .with_attribute(attr::SENDER_ID, session)
    }

    async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Records start order and per-session concurrency. Runs optionally wait
    /// for a gate permit, then hold for a fixed time.
    #[derive(Default)]
    struct RunLog {
        started: Mutex<Vec<String>>,
        finished: AtomicUsize,
        active: Mutex<HashMap<String, usize>>,
        peak: Mutex<HashMap<String, usize>>,
        gate: Option<Arc<Semaphore>>,
        hold: Duration,
    }

    impl RunLog {
        fn gated() -> (Arc<Self>, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            let runs = Arc::new(Self {
                gate: Some(Arc::clone(&gate)),
                ..Default::default()
            });
            (runs, gate)
        }

        fn holding(hold: Duration) -> Arc<Self> {
            Arc::new(Self {
                hold,
                ..Default::default()
            })
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }

        fn finished(&self) -> usize {
            self.finished.load(Ordering::SeqCst)
        }

        fn peak(&self, session: &str) -> usize {
            self.peak.lock().unwrap().get(session).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl EnvelopeProcessor for RunLog {
        async fn process(&self, envelope: Envelope, _cancel: CancellationToken) {
            let session = envelope.session_id().unwrap().to_string();
            let text = envelope.text_payload().unwrap_or_default().to_string();
            self.started.lock().unwrap().push(text.clone());
            {
                let mut active = self.active.lock().unwrap();
                let now = active.entry(session.clone()).or_default();
                *now += 1;
                let mut peak = self.peak.lock().unwrap();
                let max = peak.entry(session.clone()).or_default();
                *max = (*max).max(*now);
            }

            if text == "panic" {
                panic!("processor blew up");
            }
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            tokio::time::sleep(self.hold).await;

            *self.active.lock().unwrap().get_mut(&session).unwrap() -= 1;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn admission_never_exceeds_session_ceiling() {
        let runs = RunLog::holding(Duration::from_millis(30));
        let dispatcher = Dispatcher::start(config(2, 8), runs.clone());
        for i in 0..5 {
            dispatcher.submit(envelope("s", &format!("m{i}"))).unwrap();
        }
        wait_until("all runs", || runs.finished() == 5).await;
        assert_eq!(runs.peak("s"), 2);
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reset_command_preempts_queued_message() {
        let (runs, gate) = RunLog::gated();
        let dispatcher = Dispatcher::start(config(1, 4), runs.clone());

        dispatcher.submit(envelope("u1", "blocker")).unwrap();
        wait_until("blocker admitted", || runs.started().len() == 1).await;

        dispatcher.submit(envelope("u1", "hello")).unwrap();
        dispatcher.submit(envelope("u1", "#reset")).unwrap();
        gate.add_permits(3);

        wait_until("all runs", || runs.finished() == 3).await;
        assert_eq!(runs.started(), vec!["blocker", "#reset", "hello"]);
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn busy_session_does_not_delay_others() {
        let (runs, gate) = RunLog::gated();
        let dispatcher = Dispatcher::start(config(1, 8), runs.clone());
        for text in ["x1", "x2", "x3"] {
            dispatcher.submit(envelope("x", text)).unwrap();
        }
        dispatcher.submit(envelope("y", "y1")).unwrap();

        wait_until("y admitted", || runs.started().contains(&"y1".to_string())).await;
        let x_started = runs
            .started()
            .iter()
            .filter(|text| text.starts_with('x'))
            .count();
        assert_eq!(x_started, 1);

        gate.add_permits(4);
        wait_until("all runs", || runs.finished() == 4).await;
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn saturated_pool_rolls_admission_back() {
        let (runs, gate) = RunLog::gated();
        let dispatcher = Dispatcher::start(config(4, 1), runs.clone());
        dispatcher.submit(envelope("a", "a1")).unwrap();
        dispatcher.submit(envelope("b", "b1")).unwrap();

        wait_until("first run", || runs.started().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.started().len(), 1);
        let stats = dispatcher.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.in_flight, 1);

        gate.add_permits(2);
        wait_until("both runs", || runs.finished() == 2).await;
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sessions_take_turns_for_a_single_worker() {
        let (runs, gate) = RunLog::gated();
        let dispatcher = Dispatcher::start(config(2, 1), runs.clone());

        dispatcher.submit(envelope("z", "blocker")).unwrap();
        wait_until("blocker admitted", || runs.started().len() == 1).await;

        for session in ["a", "b", "c"] {
            for n in 1..=2 {
                dispatcher
                    .submit(envelope(session, &format!("{session}{n}")))
                    .unwrap();
            }
        }
        gate.add_permits(7);

        wait_until("all runs", || runs.finished() == 7).await;
        assert_eq!(runs.started(), vec![
            "blocker", "a1", "b1", "c1", "a2", "b2", "c2"
        ]);
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn panicking_run_releases_its_admission() {
        let runs = RunLog::holding(Duration::ZERO);
        let dispatcher = Dispatcher::start(config(1, 2), runs.clone());
        dispatcher.submit(envelope("u1", "panic")).unwrap();
        dispatcher.submit(envelope("u1", "after")).unwrap();

        wait_until("follow-up run", || runs.finished() == 1).await;
        assert_eq!(runs.started(), vec!["panic", "after"]);
        assert!(dispatcher.is_running());
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_is_idempotent_and_rejects_new_work() {
        let runs = RunLog::holding(Duration::ZERO);
        let dispatcher = Dispatcher::start(config(1, 1), runs.clone());
        dispatcher.shutdown().await;
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);

        let started = Instant::now();
        dispatcher.shutdown().await;
        assert!(started.elapsed() < Duration::from_millis(50));

        assert!(!dispatcher.is_running());
        assert!(matches!(
            dispatcher.submit(envelope("u1", "late")),
            Err(Error::ShuttingDown)
        ));
        assert_eq!(runs.started().len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_waits_for_in_flight_runs() {
        let runs = RunLog::holding(Duration::from_millis(100));
        let dispatcher = Dispatcher::start(config(1, 1), runs.clone());
        dispatcher.submit(envelope("u1", "slow")).unwrap();
        wait_until("run started", || runs.started().len() == 1).await;

        dispatcher.shutdown().await;
        assert_eq!(runs.finished(), 1);
        assert_eq!(dispatcher.stats().in_flight, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn envelope_without_session_rejected() {
        let dispatcher = Dispatcher::start(config(1, 1), RunLog::holding(Duration::ZERO));
        assert!(matches!(
            dispatcher.submit(Envelope::text("orphan")),
            Err(Error::MissingSessionId { .. })
        ));
        dispatcher.shutdown().await;
    }

    // ── Through the real pipeline ───────────────────────────────────────────

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelOutbound for Recorder {
        fn id(&self) -> &str {
            "recorder"
        }

        async fn send(&self, _to: &str, reply: &Reply, _envelope: &Envelope) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push(reply.as_text().unwrap_or_default().to_string());
            Ok(())
        }
    }

    /// Echo generator that waits for a gate permit before answering.
    struct GatedEcho {
        gate: Arc<Semaphore>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReplyGenerator for GatedEcho {
        fn name(&self) -> &str {
            "gated-echo"
        }

        fn kinds(&self) -> &[EnvelopeKind] {
            &[EnvelopeKind::Text]
        }

        async fn generate(&self, envelope: &Envelope) -> anyhow::Result<Option<Reply>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await?.forget();
            Ok(envelope.text_payload().map(Reply::text))
        }
    }

    fn pipeline(
        courier: &CourierConfig,
        gate: Arc<Semaphore>,
    ) -> (Arc<Pipeline>, Arc<Recorder>, Arc<GatedEcho>) {
        let recorder = Arc::new(Recorder::default());
        let mut channels = ChannelRegistry::new();
        channels.register(recorder.clone()).unwrap();
        let echo = Arc::new(GatedEcho {
            gate,
            calls: AtomicUsize::new(0),
        });
        let mut generators = GeneratorRegistry::new();
        generators.register(echo.clone()).unwrap();
        let pipeline = Arc::new(Pipeline::new(courier, Arc::new(channels), generators));
        (pipeline, recorder, echo)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_session_drains_queue_and_suppresses_delivery() {
        let courier = CourierConfig::default();
        let gate = Arc::new(Semaphore::new(0));
        let (pipeline, recorder, echo) = pipeline(&courier, gate);
        let dispatcher = Dispatcher::start(config(1, 4), pipeline);

        for text in ["one", "two", "three", "four"] {
            dispatcher.submit(envelope("u1", text)).unwrap();
        }
        wait_until("first generation", || echo.calls.load(Ordering::SeqCst) == 1).await;

        let report = dispatcher.cancel_session("u1");
        assert_eq!(report, CancelReport {
            discarded: 3,
            signalled: 1
        });
        assert_eq!(dispatcher.stats().queued, 0);

        wait_until("cancelled run released", || dispatcher.stats().outstanding == 0).await;
        assert!(recorder.sent.lock().unwrap().is_empty());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn vetoed_group_message_drains_to_idle() {
        let mut courier = CourierConfig::default();
        courier.compose.group_policy = GroupPolicy::Allowlist;
        courier.compose.group_allowlist = vec!["ops".into()];
        let gate = Arc::new(Semaphore::new(10));
        let (pipeline, recorder, echo) = pipeline(&courier, gate);
        let dispatcher = Dispatcher::start(config(4, 4), pipeline);

        let group = envelope("family-chat", "hello")
            .with_attribute(attr::IS_GROUP, true)
            .with_attribute(attr::GROUP_ID, "family-chat")
            .with_attribute(attr::MENTIONED, true);
        dispatcher.submit(group).unwrap();

        wait_until("slot removed", || dispatcher.stats().sessions == 0).await;
        assert!(recorder.sent.lock().unwrap().is_empty());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replies_flow_end_to_end() {
        let courier = CourierConfig::default();
        let gate = Arc::new(Semaphore::new(10));
        let (pipeline, recorder, _echo) = pipeline(&courier, gate);
        let dispatcher = Dispatcher::start(config(1, 4), pipeline);

        dispatcher.submit(envelope("u1", "seg1/$seg2/$seg3")).unwrap();
        wait_until("segments sent", || recorder.sent.lock().unwrap().len() == 3).await;
        assert_eq!(*recorder.sent.lock().unwrap(), vec!["seg1", "seg2", "seg3"]);
        dispatcher.shutdown().await;
    }
}
