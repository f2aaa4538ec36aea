// =============================================================================
// Data Aggregator — concurrent multi-interval fetch merged into one Snapshot
// =============================================================================
//
// One fetch per distinct interval is issued concurrently and every fetch is
// awaited to completion (or to its timeout). Results are merged into a
// BTreeMap keyed by interval, so the snapshot never depends on which fetch
// finished first.
//
// Failure policy:
//   - one interval fails  => that entry holds an empty series plus its error;
//   - every interval fails => the whole aggregation fails with every cause.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use super::BarSeries;
use crate::error::FeedError;
use crate::provider::QuoteProvider;
use crate::types::{Interval, Symbol};

/// Outcome of one interval within an aggregation cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalResult {
    pub bars: BarSeries,
    pub error: Option<FeedError>,
}

impl IntervalResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Bars for several intervals of one symbol, all requested in one cycle.
/// Immutable once built.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub symbol: Symbol,
    pub taken_at: DateTime<Utc>,
    entries: BTreeMap<Interval, IntervalResult>,
}

impl Snapshot {
    pub fn new(symbol: Symbol, taken_at: DateTime<Utc>) -> Self {
        Self {
            symbol,
            taken_at,
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, interval: Interval, result: IntervalResult) {
        self.entries.insert(interval, result);
    }

    pub fn get(&self, interval: Interval) -> Option<&IntervalResult> {
        self.entries.get(&interval)
    }

    pub fn series(&self, interval: Interval) -> Option<&BarSeries> {
        self.get(interval).map(|r| &r.bars)
    }

    /// Entries in interval order.
    pub fn iter(&self) -> impl Iterator<Item = (Interval, &IntervalResult)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub fn failures(&self) -> Vec<(Interval, &FeedError)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.error.as_ref().map(|e| (*k, e)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serialises as `{ "<interval>": [bars...], ... }`.
impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(self.entries.len()))?;
        for (interval, result) in &self.entries {
            map.serialize_entry(interval.as_str(), &result.bars)?;
        }
        map.end()
    }
}

/// Fans out provider calls and fans the results back in.
#[derive(Clone)]
pub struct DataAggregator {
    provider: Arc<dyn QuoteProvider>,
    fetch_timeout: Duration,
}

impl DataAggregator {
    pub fn new(provider: Arc<dyn QuoteProvider>, fetch_timeout: Duration) -> Self {
        Self {
            provider,
            fetch_timeout,
        }
    }

    pub fn provider(&self) -> &Arc<dyn QuoteProvider> {
        &self.provider
    }

    /// One bounded fetch. A call that outlives the timeout surfaces as
    /// `UpstreamUnavailable`.
    pub async fn fetch_one(
        &self,
        symbol: &Symbol,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BarSeries, FeedError> {
        match tokio::time::timeout(self.fetch_timeout, self.provider.fetch(symbol, interval, from, to)).await {
            Ok(result) => result,
            Err(_) => Err(FeedError::UpstreamUnavailable(format!(
                "{} did not answer within {}s",
                self.provider.name(),
                self.fetch_timeout.as_secs_f64()
            ))),
        }
    }

    pub async fn aggregate(
        &self,
        symbol: &Symbol,
        intervals: &[Interval],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Arc<Snapshot>, FeedError> {
        let started = Instant::now();
        let intervals = Interval::normalize_set(intervals);

        let fetches = intervals.iter().map(|&interval| async move {
            (interval, self.fetch_one(symbol, interval, from, to).await)
        });
        let results = join_all(fetches).await;

        let mut snapshot = Snapshot::new(symbol.clone(), Utc::now());
        let mut causes = Vec::new();

        for (interval, result) in results {
            match result {
                Ok(bars) => {
                    debug!(symbol = %symbol, interval = %interval, bars = bars.len(), "interval fetched");
                    snapshot.insert(interval, IntervalResult { bars, error: None });
                }
                Err(e) => {
                    warn!(symbol = %symbol, interval = %interval, kind = e.kind(), error = %e, "interval fetch failed");
                    causes.push((interval, e.clone()));
                    snapshot.insert(
                        interval,
                        IntervalResult {
                            bars: BarSeries::empty(),
                            error: Some(e),
                        },
                    );
                }
            }
        }

        if !snapshot.is_empty() && causes.len() == snapshot.len() {
            warn!(symbol = %symbol, failed = causes.len(), "every interval failed");
            return Err(FeedError::AllIntervalsFailed(causes));
        }

        info!(
            symbol = %symbol,
            ok = snapshot.iter().filter(|(_, r)| r.is_ok()).count(),
            failed = causes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "aggregation complete"
        );
        Ok(Arc::new(snapshot))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
