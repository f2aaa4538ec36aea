//! In-memory provider for tests: canned per-interval responses, optional
//! latency, optional live feed, and the real RateLimiter in front.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::rate_limit::RateLimiter;
use super::{BarStream, QuoteProvider};
use crate::error::FeedError;
use crate::market_data::{Bar, BarSeries};
use crate::types::{Interval, Symbol};

pub struct ScriptedProvider {
    responses: Mutex<HashMap<Interval, Result<BarSeries, FeedError>>>,
    latency: Mutex<Option<Duration>>,
    live: Mutex<Option<mpsc::Receiver<Result<Bar, FeedError>>>>,
    stall_live: AtomicBool,
    limiter: Option<Arc<RateLimiter>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            latency: Mutex::new(None),
            live: Mutex::new(None),
            stall_live: AtomicBool::new(false),
            limiter: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn respond(&self, interval: Interval, result: Result<BarSeries, FeedError>) {
        self.responses.lock().insert(interval, result);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Install a live feed; the returned sender pushes bars into it.
    pub fn live_feed(&self) -> mpsc::Sender<Result<Bar, FeedError>> {
        let (tx, rx) = mpsc::channel(16);
        *self.live.lock() = Some(rx);
        tx
    }

    /// Opening the live feed never completes, like a connect that hangs.
    pub fn stall_live(&self) {
        self.stall_live.store(true, Ordering::SeqCst);
    }

    /// Fetches that got past the limiter.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuoteProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn fetch(
        &self,
        symbol: &Symbol,
        interval: Interval,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<BarSeries, FeedError> {
        if let Some(limiter) = &self.limiter {
            limiter.admit(symbol, interval)?;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.responses
            .lock()
            .get(&interval)
            .cloned()
            .unwrap_or_else(|| Ok(BarSeries::empty()))
    }

    async fn live_bars(
        &self,
        _symbol: &Symbol,
        _interval: Interval,
    ) -> Result<Option<BarStream>, FeedError> {
        if self.stall_live.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let Some(rx) = self.live.lock().take() else {
            return Ok(None);
        };
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Some(stream.boxed()))
    }
}

/// `n` daily bars starting 2024-01-01 with closes `close_at(i)`.
pub fn daily_series(n: usize, close_at: impl Fn(usize) -> f64) -> BarSeries {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let bars = (0..n)
        .map(|i| {
            let c = close_at(i);
            Bar {
                timestamp: start + chrono::Duration::days(i as i64),
                open: c,
                high: c + 0.5,
                low: c - 0.5,
                close: c,
            }
        })
        .collect();
    BarSeries::from_unsorted(bars)
}
