//! One aggregation run: fetch → parse → dedupe → test → batch → output.
//!
//! Source tasks run concurrently (bounded by `concurrent_limit`) and hand
//! their results to a single collector task that owns the
//! [`BatchProcessor`] and the [`ProxyHistory`]. Two tokens steer shutdown:
//! - `soft_stop`: no new fetches start; in-flight work completes
//! - `deadline`: in-flight fetches are abandoned; tests that already
//!   finished are still handed to the collector
//!
//! Either way the run drains and writes final outputs.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchPolicy, BatchProcessor, ResultFilter, ResultStore};
use crate::codec::{Codec, ParsedConfig};
use crate::config::{RuntimeConfig, SourceDescriptor};
use crate::dedup::Deduplicator;
use crate::error::FetchError;
use crate::fetcher::{FetchSettings, Fetcher};
use crate::history::ProxyHistory;
use crate::notify::Notifier;
use crate::output::FileSink;
use crate::state::machine::data;
use crate::state::{SourceEvent, StateManager, StateStats};
use crate::tester::{ConnectivityTester, TestedConfig, TesterSettings};

/// Results of one source handed to the collector.
const RESULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub sources_total: usize,
    pub sources_failed: usize,
    pub candidates_parsed: usize,
    pub candidates_tested: usize,
    pub unique_emitted: usize,
    pub batches_written: usize,
    pub stopped_early: bool,
    pub state_stats: StateStats,
}

/// Load-free entry point: validate `config` and run one round.
pub async fn run(config: RuntimeConfig) -> Result<RunSummary> {
    Aggregator::new(config)?.run().await
}

/// Everything a single run needs, built once from [`RuntimeConfig`].
pub struct Aggregator {
    config: RuntimeConfig,
    state: Arc<StateManager>,
    fetcher: Arc<Fetcher>,
    tester: Option<Arc<ConnectivityTester>>,
    codec: Codec,
}

impl Aggregator {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let state = Arc::new(StateManager::new(config.state_policy()));
        Self::with_state(config, state)
    }

    /// Use an existing state manager, so source health carries over
    /// between rounds in a long-lived process.
    pub fn with_state(config: RuntimeConfig, state: Arc<StateManager>) -> Result<Self> {
        for source in &config.sources {
            if state.state(&source.url).is_none() {
                state.register(source.clone());
            }
        }
        let fetcher = Fetcher::new(FetchSettings::from_config(&config))?.with_state(Arc::clone(&state));
        let tester = if config.enable_url_test {
            Some(Arc::new(ConnectivityTester::new(TesterSettings::from_config(&config))?))
        } else {
            None
        };
        Ok(Self {
            config,
            state,
            fetcher: Arc::new(fetcher),
            tester,
            codec: Codec::new(),
        })
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// Run one round. Dedup and notification state are per round, so
    /// calling this again starts from a clean slate.
    pub async fn run(&self) -> Result<RunSummary> {
        let dedup = Arc::new(Deduplicator::new());
        let notifier = Arc::new(Notifier::new());
        if self.tester.is_none() {
            notifier.no_tester();
        }

        let history_path = self.config.history_path();
        let history = ProxyHistory::load(&history_path).await;

        let soft_stop = CancellationToken::new();
        let deadline = CancellationToken::new();
        let deadline_timer = self.config.deadline().map(|limit| {
            let soft_stop = soft_stop.clone();
            let deadline = deadline.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                tracing::warn!(secs = limit.as_secs(), "pipeline: deadline reached, draining");
                soft_stop.cancel();
                deadline.cancel();
            })
        });

        let store = Arc::new(ResultStore::new());
        let sink = Arc::new(FileSink::new(&self.config.output_dir, self.config.formats.clone()));
        let processor = BatchProcessor::new(
            BatchPolicy::from_config(&self.config),
            ResultFilter::from_config(&self.config)?,
            store.clone(),
            Arc::new(self.codec),
            sink,
        )
        .with_notifier(notifier)
        .with_soft_stop(soft_stop.clone())
        .with_historic_pings(history.successful_pings());

        let (tx, rx) = mpsc::channel::<SourceResults>(RESULT_CHANNEL_CAPACITY);
        let collector = tokio::spawn(collect(rx, store, processor, history, self.codec));

        self.state.check_auto_transitions();
        let sources = self.state.sources_for_round();
        tracing::info!(sources = sources.len(), "pipeline: starting round");

        let worker = SourceWorker {
            fetcher: Arc::clone(&self.fetcher),
            tester: self.tester.clone(),
            state: Arc::clone(&self.state),
            dedup,
            codec: self.codec,
            gate: Arc::new(Semaphore::new(self.config.concurrent_limit.max(1))),
            soft_stop: soft_stop.clone(),
            deadline: deadline.clone(),
            results: tx,
        };
        let tasks: Vec<_> = sources
            .iter()
            .cloned()
            .map(|source| tokio::spawn(worker.clone().run(source)))
            .collect();
        drop(worker);

        let mut summary = RunSummary {
            sources_total: sources.len(),
            ..RunSummary::default()
        };
        for joined in futures_util::future::join_all(tasks).await {
            match joined {
                Ok(report) => {
                    summary.candidates_parsed += report.parsed;
                    summary.candidates_tested += report.tested;
                    if report.failed {
                        summary.sources_failed += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("pipeline: source task panicked: {e}");
                    summary.sources_failed += 1;
                }
            }
        }

        let (mut processor, history) = collector.await.context("result collector panicked")?;
        summary.stopped_early = soft_stop.is_cancelled();
        if let Some(timer) = deadline_timer {
            timer.abort();
        }

        processor.finalize().await.context("failed to write final output")?;
        if let Err(e) = history.save(&history_path).await {
            tracing::warn!("pipeline: proxy history not saved: {e}");
        }

        summary.unique_emitted = processor.unique_count();
        summary.batches_written = processor.batches_written();
        summary.state_stats = self.state.stats();
        tracing::info!(
            sources = summary.sources_total,
            failed = summary.sources_failed,
            parsed = summary.candidates_parsed,
            tested = summary.candidates_tested,
            unique = summary.unique_emitted,
            batches = summary.batches_written,
            stopped_early = summary.stopped_early,
            "pipeline: round complete"
        );
        Ok(summary)
    }
}

// ── Collector ────────────────────────────────────────────────────

#[derive(Debug)]
struct SourceResults {
    /// Every config that was tested, for the history.
    tested: Vec<TestedConfig>,
    /// Configs admitted by the deduplicator, in source order.
    admitted: Vec<TestedConfig>,
}

async fn collect(
    mut rx: mpsc::Receiver<SourceResults>,
    store: Arc<ResultStore>,
    mut processor: BatchProcessor,
    mut history: ProxyHistory,
    codec: Codec,
) -> (BatchProcessor, ProxyHistory) {
    while let Some(results) = rx.recv().await {
        history.update(&results.tested, &codec);
        store.extend(results.admitted);
        if let Err(e) = processor.process().await {
            tracing::warn!("pipeline: batch flush failed, will retry on next results: {e}");
        }
    }
    (processor, history)
}

// ── Source worker ────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SourceReport {
    parsed: usize,
    tested: usize,
    failed: bool,
}

#[derive(Clone)]
struct SourceWorker {
    fetcher: Arc<Fetcher>,
    tester: Option<Arc<ConnectivityTester>>,
    state: Arc<StateManager>,
    dedup: Arc<Deduplicator>,
    codec: Codec,
    gate: Arc<Semaphore>,
    soft_stop: CancellationToken,
    deadline: CancellationToken,
    results: mpsc::Sender<SourceResults>,
}

impl SourceWorker {
    async fn run(self, source: SourceDescriptor) -> SourceReport {
        let mut report = SourceReport::default();

        let _permit = tokio::select! {
            () = self.soft_stop.cancelled() => {
                tracing::debug!(source = %source.url, "pipeline: stop requested, not fetching");
                return report;
            }
            permit = self.gate.acquire() => match permit {
                Ok(p) => p,
                Err(_) => return report,
            },
        };
        if self.soft_stop.is_cancelled() {
            return report;
        }

        let available = tokio::select! {
            () = self.deadline.cancelled() => return report,
            ok = self.fetcher.test_source_availability(&source.url) => ok,
        };
        if !available {
            tracing::warn!(source = %source.url, "pipeline: source unavailable, skipping");
            self.fetcher.report_unavailable(&source.url);
            report.failed = true;
            return report;
        }

        let candidates = match self.fetcher.fetch_source(&self.deadline, &source).await {
            Ok(c) => c,
            Err(FetchError::Cancelled { .. }) => return report,
            Err(_) => {
                report.failed = true;
                return report;
            }
        };

        let configs = self.parse(&source, candidates.into_iter().map(|c| c.text));
        report.parsed = configs.len();
        if configs.is_empty() {
            return report;
        }

        let tested = match &self.tester {
            Some(tester) => {
                let tested = tester.test_all_until(configs, &self.deadline).await;
                report.tested = tested.len();
                if self.deadline.is_cancelled() {
                    tracing::debug!(source = %source.url, finished = tested.len(), "pipeline: deadline hit while testing");
                } else {
                    self.report_reachability(&source, &tested);
                }
                tested
            }
            None => configs.into_iter().map(TestedConfig::untested).collect(),
        };

        let url_test = self.tester.is_some();
        let admitted: Vec<TestedConfig> = tested
            .iter()
            .filter(|t| !url_test || t.reachable)
            .filter(|t| self.dedup.admit(&t.config))
            .cloned()
            .collect();
        tracing::info!(
            source = %source.url,
            parsed = report.parsed,
            admitted = admitted.len(),
            "pipeline: source done"
        );

        let results = SourceResults {
            tested: if url_test { tested } else { Vec::new() },
            admitted,
        };
        if self.results.send(results).await.is_err() {
            tracing::warn!(source = %source.url, "pipeline: collector gone, results dropped");
        }
        report
    }

    /// A source whose every tested config is unreachable counts as a failure.
    fn report_reachability(&self, source: &SourceDescriptor, tested: &[TestedConfig]) {
        if tested.is_empty() {
            return;
        }
        let reachable = tested.iter().filter(|t| t.reachable).count();
        let (event, reason) = if reachable == 0 {
            tracing::warn!(source = %source.url, tested = tested.len(), "pipeline: no reachable configs");
            (SourceEvent::Failure, "all_unreachable")
        } else {
            (SourceEvent::Success, "reachable")
        };
        self.state.signal(&source.url, event, data("reason", reason));
    }

    /// Parse candidates, keeping source order, and drop keys that are
    /// already emitted or repeated within this source.
    fn parse(&self, source: &SourceDescriptor, lines: impl Iterator<Item = String>) -> Vec<ParsedConfig> {
        let mut local: HashSet<String> = HashSet::new();
        lines
            .filter_map(|line| {
                let parsed = self.codec.parse(&line, &source.url);
                if parsed.is_none() {
                    tracing::debug!(source = %source.url, "pipeline: dropping malformed candidate");
                }
                parsed
            })
            .filter(|c| !self.dedup.contains(&c.semantic_key))
            .filter(|c| local.insert(c.semantic_key.clone()))
            .collect()
    }
}
