// =============================================================================
// Advisory — optional natural-language market signal for a snapshot
// =============================================================================
//
// The annotator is an external, slow and unreliable dependency. `Advisor`
// wraps it so that callers get at most one bounded attempt and never an
// error: a failure becomes the configured placeholder (or nothing), and the
// market data is delivered either way.
//
// Every signal produced is also written to a plain-text file on a detached
// task. That write is best-effort and never delays the data path.
// =============================================================================

pub mod openai;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::market_data::Snapshot;
use crate::runtime_config::{AdvisoryConfig, Credentials};

/// Context used when the context file cannot be read.
pub const DEFAULT_CONTEXT: &str = "Error reading seed info. Default seed info will be used.";

#[async_trait]
pub trait AdvisoryAnnotator: Send + Sync {
    /// Produce a short signal for `snapshot`, seeded with `context`.
    /// Any failure is reported as [`FeedError::AnnotationUnavailable`].
    async fn annotate(&self, snapshot: &Snapshot, context: &str) -> Result<String, FeedError>;
}

/// Bounded, failure-absorbing front for an annotator.
pub struct Advisor {
    annotator: Arc<dyn AdvisoryAnnotator>,
    timeout: Duration,
    placeholder: Option<String>,
    signal_file: Option<PathBuf>,
    context_file: PathBuf,
}

impl Advisor {
    pub fn new(annotator: Arc<dyn AdvisoryAnnotator>, config: &AdvisoryConfig) -> Self {
        Self {
            annotator,
            timeout: Duration::from_secs(config.timeout_secs),
            placeholder: config.placeholder.clone(),
            signal_file: Some(config.signal_file.clone()),
            context_file: config.context_file.clone(),
        }
    }

    /// Build the configured advisor, or `None` when advisory is disabled or
    /// has no credentials.
    pub fn from_config(
        config: &AdvisoryConfig,
        credentials: &Credentials,
    ) -> anyhow::Result<Option<Arc<Self>>> {
        if !config.enabled {
            info!("advisory disabled by configuration");
            return Ok(None);
        }
        if credentials.openai_api_key.is_empty() {
            warn!("OPENAI_API_KEY is not set — market signals disabled");
            return Ok(None);
        }
        let annotator = openai::OpenAiAnnotator::new(credentials.openai_api_key.clone(), config)?;
        Ok(Some(Arc::new(Self::new(Arc::new(annotator), config))))
    }

    pub fn without_signal_file(mut self) -> Self {
        self.signal_file = None;
        self
    }

    /// Read the per-session context text.
    pub async fn load_context(&self) -> String {
        load_context(&self.context_file).await
    }

    /// One bounded annotation attempt. Never fails.
    pub async fn signal(&self, snapshot: &Snapshot, context: &str) -> Option<String> {
        let outcome = tokio::time::timeout(self.timeout, self.annotator.annotate(snapshot, context)).await;

        match outcome {
            Ok(Ok(text)) => {
                debug!(symbol = %snapshot.symbol, chars = text.len(), "market signal generated");
                self.persist(&text);
                Some(text)
            }
            Ok(Err(e)) => {
                warn!(symbol = %snapshot.symbol, error = %e, "market signal unavailable");
                self.placeholder.clone()
            }
            Err(_) => {
                warn!(
                    symbol = %snapshot.symbol,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "market signal timed out"
                );
                self.placeholder.clone()
            }
        }
    }

    fn persist(&self, text: &str) {
        let Some(path) = self.signal_file.clone() else {
            return;
        };
        let text = text.to_string();
        tokio::spawn(async move {
            match tokio::fs::write(&path, text).await {
                Ok(()) => debug!(path = %path.display(), "market signal written"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to write market signal"),
            }
        });
    }
}

/// Read a context file, falling back to [`DEFAULT_CONTEXT`].
pub async fn load_context(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read context file — using default");
            DEFAULT_CONTEXT.to_string()
        }
    }
}

/// Scripted annotator for tests.
#[cfg(test)]
pub mod scripted {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct ScriptedAnnotator {
        pub reply: Result<String, FeedError>,
        pub latency: Duration,
        pub calls: AtomicUsize,
    }

    impl ScriptedAnnotator {
        pub fn replying(text: &str) -> Self {
            Self {
                reply: Ok(text.to_string()),
                latency: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing() -> Self {
            Self {
                reply: Err(FeedError::AnnotationUnavailable("model overloaded".into())),
                latency: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn slow(latency: Duration) -> Self {
            Self {
                reply: Ok("late".into()),
                latency,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AdvisoryAnnotator for ScriptedAnnotator {
        async fn annotate(&self, _snapshot: &Snapshot, _context: &str) -> Result<String, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.reply.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedAnnotator;
    use super::*;
    use crate::types::Symbol;

    fn snapshot() -> Snapshot {
        Snapshot::new(Symbol::parse("EURUSD").unwrap(), chrono::Utc::now())
    }

    fn advisor(annotator: ScriptedAnnotator, config: &AdvisoryConfig) -> Advisor {
        Advisor::new(Arc::new(annotator), config).without_signal_file()
    }

    #[tokio::test]
    async fn success_returns_text() {
        let a = advisor(ScriptedAnnotator::replying("Signal: bullish"), &AdvisoryConfig::default());
        assert_eq!(a.signal(&snapshot(), "ctx").await.as_deref(), Some("Signal: bullish"));
    }

    #[tokio::test]
    async fn failure_without_placeholder_is_absent() {
        let a = advisor(ScriptedAnnotator::failing(), &AdvisoryConfig::default());
        assert_eq!(a.signal(&snapshot(), "ctx").await, None);
    }

    #[tokio::test]
    async fn failure_with_placeholder_uses_it() {
        let config = AdvisoryConfig {
            placeholder: Some("Error: Unable to generate market signal.".into()),
            ..AdvisoryConfig::default()
        };
        let a = advisor(ScriptedAnnotator::failing(), &config);
        assert_eq!(
            a.signal(&snapshot(), "ctx").await.as_deref(),
            Some("Error: Unable to generate market signal.")
        );
    }

    #[tokio::test]
    async fn slow_annotator_is_bounded() {
        let mut a = advisor(
            ScriptedAnnotator::slow(Duration::from_secs(30)),
            &AdvisoryConfig::default(),
        );
        a.timeout = Duration::from_millis(50);
        let started = std::time::Instant::now();
        assert_eq!(a.signal(&snapshot(), "ctx").await, None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_context_file_falls_back() {
        let path = std::env::temp_dir().join(format!("no-such-context-{}.txt", uuid::Uuid::new_v4()));
        assert_eq!(load_context(&path).await, DEFAULT_CONTEXT);
    }

    #[tokio::test]
    async fn signal_is_written_to_file() {
        let path = std::env::temp_dir().join(format!("signal-{}.txt", uuid::Uuid::new_v4()));
        let config = AdvisoryConfig {
            signal_file: path.clone(),
            ..AdvisoryConfig::default()
        };
        let a = Advisor::new(Arc::new(ScriptedAnnotator::replying("Signal: neutral")), &config);
        a.signal(&snapshot(), "ctx").await;

        let mut written = None;
        for _ in 0..50 {
            if let Ok(text) = tokio::fs::read_to_string(&path).await {
                written = Some(text);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(written.as_deref(), Some("Signal: neutral"));
        let _ = tokio::fs::remove_file(&path).await;
    }
}
