// =============================================================================
// Stream Session — one subscriber's lifecycle
// =============================================================================
//
//   Connecting ──► Streaming ──► Closed
//
// A session is spawned in `Connecting`. Its task moves to `Streaming`, takes
// the initial multi-interval snapshot, emits it with indicators (and an
// advisory signal when one is configured) and then runs the refresh loop:
//
//   - poll mode: every cadence tick fetch the newest primary-interval bars;
//   - push mode: every bar delivered by the provider's live feed.
//
// Each cycle upserts into the session's working series, recomputes the
// indicator tail and emits an incremental update. A failing cycle emits a
// recoverable error and the session keeps streaming. If the initial snapshot
// failed, the next tick retries the whole snapshot instead.
//
// Cycles run one at a time (ticks missed while a cycle is in flight are
// delayed, not bunched). Cancellation is a watch channel; every wait inside
// the task races it, and nothing is emitted once it has fired. `close()`
// awaits the task so no background work outlives the session.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::advisory::Advisor;
use crate::error::FeedError;
use crate::indicators::{IndicatorParams, IndicatorSet, IndicatorTail};
use crate::market_data::{Bar, BarSeries, DataAggregator, IntervalResult, Snapshot};
use crate::provider::BarStream;
use crate::runtime_config::RuntimeConfig;
use crate::types::{Interval, Symbol};

// =============================================================================
// State machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Streaming,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Connecting, SessionState::Streaming)
                | (SessionState::Streaming, SessionState::Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

// =============================================================================
// Outbound messages
// =============================================================================

/// Initial message: every interval's bars keyed by wire name, plus optional
/// signal and per-interval indicators. Intervals that failed in a partial
/// snapshot keep an empty series and are listed under `errors` as
/// `{interval: {error, kind}}`.
#[derive(Debug, Clone)]
pub struct SnapshotMessage {
    pub snapshot: Arc<Snapshot>,
    pub indicators: BTreeMap<Interval, IndicatorSet>,
    pub market_signal: Option<String>,
}

impl Serialize for SnapshotMessage {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(None)?;
        for (interval, result) in self.snapshot.iter() {
            map.serialize_entry(interval.as_str(), &result.bars)?;
        }
        let failures: BTreeMap<&str, ErrorMessage> = self
            .snapshot
            .failures()
            .into_iter()
            .map(|(interval, e)| (interval.as_str(), ErrorMessage::from(e)))
            .collect();
        if !failures.is_empty() {
            map.serialize_entry("errors", &failures)?;
        }
        if let Some(signal) = &self.market_signal {
            map.serialize_entry("marketSignal", signal)?;
        }
        if !self.indicators.is_empty() {
            map.serialize_entry("indicators", &self.indicators)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    pub real_time_update: Bar,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indicators: Option<IndicatorTail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    pub error: String,
    pub kind: &'static str,
}

impl From<&FeedError> for ErrorMessage {
    fn from(e: &FeedError) -> Self {
        Self {
            error: e.to_string(),
            kind: e.kind(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StreamMessage {
    Snapshot(SnapshotMessage),
    Update(UpdateMessage),
    Error(ErrorMessage),
}

impl StreamMessage {
    pub fn error(e: &FeedError) -> Self {
        StreamMessage::Error(ErrorMessage::from(e))
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Per-session settings, cut from the runtime configuration at subscribe time.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub intervals: Vec<Interval>,
    pub primary_interval: Interval,
    pub lookback: chrono::Duration,
    pub refresh: Duration,
    /// Bound on opening the provider's live feed.
    pub fetch_timeout: Duration,
    pub live_push: bool,
    pub indicators: IndicatorParams,
    pub annotate_updates: bool,
}

impl SessionConfig {
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            intervals: config.intervals.clone(),
            primary_interval: config.primary_interval,
            lookback: config.lookback(),
            refresh: config.refresh_interval(),
            fetch_timeout: config.fetch_timeout(),
            live_push: config.live_push,
            indicators: config.indicators,
            annotate_updates: config.advisory.annotate_updates,
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Owner side of a running session.
pub struct SessionHandle {
    id: Uuid,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
    state: Arc<Mutex<SessionState>>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Signal cancellation and wait for the session task to finish.
    pub async fn close(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            warn!(session = %self.id, error = %e, "session task ended abnormally");
            let mut state = self.state.lock();
            *state = SessionState::Closed;
        }
        debug!(session = %self.id, "session handle closed");
    }
}

// =============================================================================
// Session task
// =============================================================================

enum Wake {
    Tick,
    Pushed(Option<Result<Bar, FeedError>>),
}

pub struct StreamSession {
    id: Uuid,
    symbol: Symbol,
    config: SessionConfig,
    aggregator: DataAggregator,
    advisor: Option<Arc<Advisor>>,
    outbound: mpsc::Sender<StreamMessage>,
    state: Arc<Mutex<SessionState>>,
    cancel: watch::Receiver<bool>,

    context: String,
    primed: bool,
    working: BarSeries,
    working_cap: usize,
    last_annotation: Option<Instant>,
}

impl StreamSession {
    /// Start a session task for `symbol`. Messages are delivered on
    /// `outbound` until the handle is closed or the receiver is dropped.
    pub fn spawn(
        symbol: Symbol,
        config: SessionConfig,
        aggregator: DataAggregator,
        advisor: Option<Arc<Advisor>>,
        outbound: mpsc::Sender<StreamMessage>,
    ) -> SessionHandle {
        let id = Uuid::new_v4();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(SessionState::Connecting));

        let session = StreamSession {
            id,
            symbol,
            config,
            aggregator,
            advisor,
            outbound,
            state: state.clone(),
            cancel: cancel_rx.clone(),
            context: String::new(),
            primed: false,
            working: BarSeries::empty(),
            working_cap: 0,
            last_annotation: None,
        };

        let task = tokio::spawn(session.run(cancel_rx));

        SessionHandle {
            id,
            cancel: cancel_tx,
            task,
            state,
        }
    }

    async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        self.transition(SessionState::Streaming);
        info!(session = %self.id, symbol = %self.symbol, "session streaming");

        let alive = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => false,
            alive = self.start() => alive,
        };
        if !alive {
            self.finish();
            return;
        }

        let mut live = self.open_live_feed(&mut cancel).await;

        let refresh = self.config.refresh;
        let mut ticker = tokio::time::interval_at(Instant::now() + refresh, refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let poll = live.is_none() || !self.primed;
            let wake = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                item = next_pushed(&mut live) => Wake::Pushed(item),
                _ = ticker.tick(), if poll => Wake::Tick,
            };

            let alive = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => false,
                alive = self.cycle(wake, &mut live) => alive,
            };
            if !alive {
                break;
            }
        }

        self.finish();
    }

    /// Context load plus the first snapshot attempt. Returns `false` once the
    /// subscriber is gone.
    async fn start(&mut self) -> bool {
        if let Some(advisor) = &self.advisor {
            self.context = advisor.load_context().await;
        }
        self.emit_snapshot().await
    }

    async fn open_live_feed(&self, cancel: &mut watch::Receiver<bool>) -> Option<BarStream> {
        if !self.config.live_push {
            return None;
        }
        let provider = self.aggregator.provider().clone();
        let open = tokio::time::timeout(
            self.config.fetch_timeout,
            provider.live_bars(&self.symbol, self.config.primary_interval),
        );
        let opened = tokio::select! {
            biased;
            _ = cancelled(cancel) => return None,
            opened = open => opened,
        };
        let Ok(opened) = opened else {
            warn!(
                session = %self.id,
                provider = provider.name(),
                timeout_ms = self.config.fetch_timeout.as_millis() as u64,
                "live feed did not open in time — polling"
            );
            return None;
        };
        match opened {
            Ok(Some(stream)) => {
                info!(session = %self.id, provider = provider.name(), "live feed attached");
                Some(stream)
            }
            Ok(None) => {
                debug!(session = %self.id, provider = provider.name(), "no live feed — polling");
                None
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "live feed unavailable — polling");
                None
            }
        }
    }

    async fn cycle(&mut self, wake: Wake, live: &mut Option<BarStream>) -> bool {
        match wake {
            Wake::Tick if !self.primed => self.emit_snapshot().await,
            Wake::Tick => self.poll_refresh().await,
            Wake::Pushed(Some(Ok(bar))) => {
                if !self.primed {
                    debug!(session = %self.id, "pushed bar before first snapshot — skipped");
                    return true;
                }
                self.emit_update(BarSeries::from_unsorted(vec![bar]), true).await
            }
            Wake::Pushed(Some(Err(e))) => {
                warn!(session = %self.id, error = %e, "live feed error");
                self.emit_error(&e).await
            }
            Wake::Pushed(None) => {
                info!(session = %self.id, "live feed ended — falling back to polling");
                *live = None;
                true
            }
        }
    }

    // ── Snapshot ────────────────────────────────────────────────────────

    async fn emit_snapshot(&mut self) -> bool {
        let to = Utc::now();
        let from = to - self.config.lookback;

        let snapshot = match self
            .aggregator
            .aggregate(&self.symbol, &self.config.intervals, from, to)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(session = %self.id, kind = e.kind(), error = %e, "initial snapshot failed");
                return self.emit_error(&e).await;
            }
        };

        let params = self.config.indicators;
        let indicators: BTreeMap<Interval, IndicatorSet> = snapshot
            .iter()
            .map(|(interval, result)| (interval, IndicatorSet::compute(&result.bars, &params)))
            .collect();

        let market_signal = self.annotate(&snapshot).await;

        self.working = snapshot
            .series(self.config.primary_interval)
            .cloned()
            .unwrap_or_default();
        self.working_cap = self
            .working
            .len()
            .max(params.sma_slow + params.macd.consumer_offset());
        self.primed = true;

        debug!(
            session = %self.id,
            intervals = snapshot.len(),
            working = self.working.len(),
            "snapshot ready"
        );

        self.emit(StreamMessage::Snapshot(SnapshotMessage {
            snapshot,
            indicators,
            market_signal,
        }))
        .await
    }

    // ── Refresh ─────────────────────────────────────────────────────────

    async fn poll_refresh(&mut self) -> bool {
        let primary = self.config.primary_interval;
        let to = Utc::now();
        let from = to - primary.duration() * 2;

        match self.aggregator.fetch_one(&self.symbol, primary, from, to).await {
            Ok(recent) if recent.is_empty() => {
                debug!(session = %self.id, interval = %primary, "no new bars");
                true
            }
            Ok(recent) => self.emit_update(recent, false).await,
            Err(e) => {
                warn!(session = %self.id, kind = e.kind(), error = %e, "refresh failed");
                self.emit_error(&e).await
            }
        }
    }

    /// Polled updates are annotated every cycle; pushed ones are throttled
    /// by [`Self::annotation_due`].
    async fn emit_update(&mut self, recent: BarSeries, pushed: bool) -> bool {
        let Some(latest) = recent.last().copied() else {
            return true;
        };
        for bar in recent.bars() {
            self.working.upsert(*bar);
        }
        self.working.retain_last(self.working_cap);

        let tail = IndicatorSet::compute(&self.working, &self.config.indicators)
            .tail(&self.config.indicators);

        let market_signal = if self.config.annotate_updates && (!pushed || self.annotation_due()) {
            let mut snapshot = Snapshot::new(self.symbol.clone(), Utc::now());
            snapshot.insert(
                self.config.primary_interval,
                IntervalResult {
                    bars: self.working.clone(),
                    error: None,
                },
            );
            self.annotate(&snapshot).await
        } else {
            None
        };

        self.emit(StreamMessage::Update(UpdateMessage {
            real_time_update: latest,
            market_signal,
            indicators: Some(tail),
        }))
        .await
    }

    // ── Advisory ────────────────────────────────────────────────────────

    /// At most one push-driven annotation per refresh period.
    fn annotation_due(&self) -> bool {
        match self.last_annotation {
            Some(at) => at.elapsed() >= self.config.refresh,
            None => true,
        }
    }

    async fn annotate(&mut self, snapshot: &Snapshot) -> Option<String> {
        let advisor = self.advisor.clone()?;
        self.last_annotation = Some(Instant::now());
        advisor.signal(snapshot, &self.context).await
    }

    // ── Plumbing ────────────────────────────────────────────────────────

    /// Send unless cancelled. `false` means the session should stop.
    async fn emit(&self, message: StreamMessage) -> bool {
        let cancelled = *self.cancel.borrow();
        let streaming = *self.state.lock() == SessionState::Streaming;
        if cancelled || !streaming {
            debug!(session = %self.id, "emit suppressed after cancellation");
            return false;
        }
        if self.outbound.send(message).await.is_err() {
            debug!(session = %self.id, "subscriber gone");
            return false;
        }
        true
    }

    /// Report a cycle failure. Only a fatal error ends the session.
    async fn emit_error(&self, err: &FeedError) -> bool {
        self.emit(StreamMessage::error(err)).await && !err.is_fatal()
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            warn!(session = %self.id, from = %*state, to = %next, "invalid session transition");
            return false;
        }
        debug!(session = %self.id, from = %*state, to = %next, "session transition");
        *state = next;
        true
    }

    fn finish(&self) {
        self.transition(SessionState::Closed);
        info!(session = %self.id, symbol = %self.symbol, "session closed");
    }
}

/// Resolves once cancellation has been requested or the handle is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        let fired = *rx.borrow_and_update();
        if fired {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn next_pushed(live: &mut Option<BarStream>) -> Option<Result<Bar, FeedError>> {
    match live {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Tests
// =============================================================================
