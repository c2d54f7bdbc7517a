//! Incremental batch processing of tested results.
//!
//! The processor only sees three narrow seams:
//! - [`ResultSource`]: an append-only sequence of tested results
//! - [`HashComputer`]: semantic and history hashing
//! - [`OutputSink`]: where batches, cumulative and final outputs go
//!
//! Two flush policies coexist and are selected by `strict_batch`:
//! - [`FlushPolicy::Strict`]: every batch boundary is an exact multiple of
//!   `save_every`; a short tail is only written by [`BatchProcessor::finalize`].
//! - [`FlushPolicy::Threshold`]: flush once the unique count reaches a
//!   threshold, then move the threshold up by `save_every`.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::codec::{Codec, ParsedConfig};
use crate::config::RuntimeConfig;
use crate::error::{ConfigError, PersistError};
use crate::notify::Notifier;
use crate::tester::TestedConfig;

// ── Seams ────────────────────────────────────────────────────────

/// A set of tested results flushed together. Immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub index: usize,
    pub members: Vec<TestedConfig>,
    pub cumulative: bool,
}

/// Append-only sequence of tested results.
pub trait ResultSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every result from `start` to the current end.
    fn slice_from(&self, start: usize) -> Vec<TestedConfig>;
}

pub trait HashComputer: Send + Sync {
    /// Functional identity, used to drop duplicates across batches.
    fn semantic_hash(&self, config: &ParsedConfig) -> String;

    /// Exact-text identity, used to look up cross-run history.
    fn history_key(&self, raw_text: &str) -> String;
}

impl HashComputer for Codec {
    fn semantic_hash(&self, config: &ParsedConfig) -> String {
        self.semantic_key(&config.raw_text)
            .unwrap_or_else(|| config.semantic_key.clone())
    }

    fn history_key(&self, raw_text: &str) -> String {
        Codec::history_key(self, raw_text)
    }
}

#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn write_batch(&self, batch: &Batch) -> Result<(), PersistError>;

    /// Re-emit everything unique so far (cumulative mode only).
    async fn write_cumulative(&self, records: &[TestedConfig]) -> Result<(), PersistError>;

    async fn write_final(&self, records: &[TestedConfig]) -> Result<(), PersistError>;
}

/// Shared append-only store the pipeline pushes tested results into.
#[derive(Debug, Default)]
pub struct ResultStore {
    results: RwLock<Vec<TestedConfig>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: TestedConfig) {
        self.results.write().push(result);
    }

    pub fn extend(&self, results: impl IntoIterator<Item = TestedConfig>) {
        self.results.write().extend(results);
    }
}

impl ResultSource for ResultStore {
    fn len(&self) -> usize {
        self.results.read().len()
    }

    fn slice_from(&self, start: usize) -> Vec<TestedConfig> {
        let results = self.results.read();
        results.get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }
}

// ── Filters ──────────────────────────────────────────────────────

/// Per-result acceptance rules, applied in a fixed order.
#[derive(Debug, Clone, Default)]
pub struct ResultFilter {
    tls_fragment: Option<String>,
    include_protocols: Vec<String>,
    exclude_protocols: Vec<String>,
    include_patterns: Vec<Regex>,
    exclude_patterns: Vec<Regex>,
    require_ping: bool,
}

impl ResultFilter {
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            tls_fragment: config.tls_fragment.clone().filter(|f| !f.is_empty()),
            include_protocols: config.include_protocols.clone(),
            exclude_protocols: config.exclude_protocols.clone(),
            include_patterns: compile_patterns(&config.include_patterns)?,
            exclude_patterns: compile_patterns(&config.exclude_patterns)?,
            require_ping: config.enable_url_test,
        })
    }

    pub fn accepts(&self, result: &TestedConfig, notifier: &Notifier) -> bool {
        let config = &result.config;
        if let Some(fragment) = &self.tls_fragment {
            if !config.protocol.rides_tls() {
                notifier.tls_fragment_without_tls(fragment, config.protocol);
            }
            if !config.raw_text.contains(fragment.as_str()) {
                return false;
            }
        }
        if !self.include_protocols.is_empty()
            && !self.include_protocols.iter().any(|p| config.protocol.matches_name(p))
        {
            return false;
        }
        if self.exclude_protocols.iter().any(|p| config.protocol.matches_name(p)) {
            return false;
        }
        if !self.include_patterns.is_empty()
            && !self.include_patterns.iter().any(|re| re.is_match(&config.raw_text))
        {
            return false;
        }
        if self.exclude_patterns.iter().any(|re| re.is_match(&config.raw_text)) {
            return false;
        }
        !(self.require_ping && result.ping_ms.is_none())
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|source| ConfigError::InvalidPattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

// ── Processor ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Flush exactly `save_every` new records at a time.
    Strict,
    /// Flush everything pending once the unique count reaches the threshold.
    Threshold,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchPolicy {
    /// `0` disables incremental flushing; only `finalize` writes.
    pub save_every: usize,
    pub flush: FlushPolicy,
    pub cumulative: bool,
    pub sort_by_ping: bool,
    /// `0` keeps everything.
    pub top_n: usize,
    /// `0` never requests a stop.
    pub stop_after_found: usize,
}

impl BatchPolicy {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            save_every: config.save_every,
            flush: if config.strict_batch {
                FlushPolicy::Strict
            } else {
                FlushPolicy::Threshold
            },
            cumulative: config.cumulative_batches,
            sort_by_ping: config.sort_by_ping,
            top_n: config.top_n,
            stop_after_found: config.stop_after_found,
        }
    }
}

/// What a single [`BatchProcessor::process`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub visited: usize,
    pub accepted: usize,
    pub batches_written: usize,
    pub stop_requested: bool,
}

pub struct BatchProcessor {
    policy: BatchPolicy,
    filter: ResultFilter,
    source: Arc<dyn ResultSource>,
    hasher: Arc<dyn HashComputer>,
    sink: Arc<dyn OutputSink>,
    notifier: Arc<Notifier>,
    soft_stop: Option<CancellationToken>,
    historic_pings: HashMap<String, f64>,

    last_processed: usize,
    saved_hashes: HashSet<String>,
    cumulative_unique: Vec<TestedConfig>,
    /// Prefix of `cumulative_unique` already written as a batch.
    flushed_upto: usize,
    batch_counter: usize,
    next_threshold: usize,
    stop_requested: bool,
}

impl BatchProcessor {
    pub fn new(
        policy: BatchPolicy,
        filter: ResultFilter,
        source: Arc<dyn ResultSource>,
        hasher: Arc<dyn HashComputer>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        let next_threshold = policy.save_every;
        Self {
            policy,
            filter,
            source,
            hasher,
            sink,
            notifier: Arc::new(Notifier::new()),
            soft_stop: None,
            historic_pings: HashMap::new(),
            last_processed: 0,
            saved_hashes: HashSet::new(),
            cumulative_unique: Vec::new(),
            flushed_upto: 0,
            batch_counter: 0,
            next_threshold,
            stop_requested: false,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Token cancelled once `stop_after_found` unique results are in.
    pub fn with_soft_stop(mut self, token: CancellationToken) -> Self {
        self.soft_stop = Some(token);
        self
    }

    /// Successful pings from earlier runs, keyed by history key.
    pub fn with_historic_pings(mut self, pings: HashMap<String, f64>) -> Self {
        self.historic_pings = pings;
        self
    }

    pub fn unique_count(&self) -> usize {
        self.cumulative_unique.len()
    }

    pub fn batches_written(&self) -> usize {
        self.batch_counter
    }

    pub fn last_processed_index(&self) -> usize {
        self.last_processed
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Ingest every result appended since the last call and flush when
    /// the policy says so. On a write error nothing ingested is lost;
    /// the pending records are flushed again on the next call.
    pub async fn process(&mut self) -> Result<ProcessReport, PersistError> {
        let mut report = self.ingest();
        if self.policy.save_every > 0 {
            report.batches_written = match self.policy.flush {
                FlushPolicy::Strict => self.flush_strict().await?,
                FlushPolicy::Threshold => self.flush_threshold().await?,
            };
        }
        report.stop_requested = self.check_soft_stop();
        Ok(report)
    }

    /// Final drain: ingest what is left and write every unique record,
    /// ranked, through the sink's final output. Returns the count written.
    pub async fn finalize(&mut self) -> Result<usize, PersistError> {
        self.ingest();
        let ranked = self.rank(self.cumulative_unique.clone());
        self.sink.write_final(&ranked).await?;
        tracing::info!(
            unique = self.cumulative_unique.len(),
            written = ranked.len(),
            batches = self.batch_counter,
            "batch: final output written"
        );
        Ok(ranked.len())
    }

    fn ingest(&mut self) -> ProcessReport {
        let fresh = self.source.slice_from(self.last_processed);
        self.last_processed += fresh.len();

        let mut report = ProcessReport {
            visited: fresh.len(),
            ..ProcessReport::default()
        };
        for result in fresh {
            if !self.filter.accepts(&result, &self.notifier) {
                tracing::debug!(config = %result.config.raw_text, "batch: filtered out");
                continue;
            }
            if !self.saved_hashes.insert(self.hasher.semantic_hash(&result.config)) {
                continue;
            }
            self.cumulative_unique.push(result);
            report.accepted += 1;
        }
        report
    }

    async fn flush_strict(&mut self) -> Result<usize, PersistError> {
        let mut written = 0;
        while self.cumulative_unique.len() - self.flushed_upto >= self.policy.save_every {
            let end = self.flushed_upto + self.policy.save_every;
            self.flush_to(end).await?;
            written += 1;
        }
        Ok(written)
    }

    async fn flush_threshold(&mut self) -> Result<usize, PersistError> {
        let len = self.cumulative_unique.len();
        if len < self.next_threshold || len == self.flushed_upto {
            return Ok(0);
        }
        self.flush_to(len).await?;
        self.next_threshold += self.policy.save_every;
        Ok(1)
    }

    /// Write a batch ending at `end` and commit only after the sink accepted it.
    async fn flush_to(&mut self, end: usize) -> Result<(), PersistError> {
        let start = if self.policy.cumulative { 0 } else { self.flushed_upto };
        let batch = Batch {
            index: self.batch_counter + 1,
            members: self.rank(self.cumulative_unique[start..end].to_vec()),
            cumulative: self.policy.cumulative,
        };
        if let Err(e) = self.sink.write_batch(&batch).await {
            tracing::warn!(batch = batch.index, "batch: flush failed, records kept for retry: {e}");
            return Err(e);
        }
        if self.policy.cumulative {
            let all = self.rank(self.cumulative_unique[..end].to_vec());
            self.sink.write_cumulative(&all).await?;
        }
        self.batch_counter = batch.index;
        self.flushed_upto = end;
        tracing::info!(
            batch = batch.index,
            records = batch.members.len(),
            unique = self.cumulative_unique.len(),
            "batch: flushed"
        );
        Ok(())
    }

    fn check_soft_stop(&mut self) -> bool {
        let target = self.policy.stop_after_found;
        if target == 0 || self.stop_requested || self.cumulative_unique.len() < target {
            return false;
        }
        self.stop_requested = true;
        tracing::info!(found = self.cumulative_unique.len(), target, "batch: target reached, stopping new fetches");
        if let Some(token) = &self.soft_stop {
            token.cancel();
        }
        true
    }

    /// Ascending ping; records without a ping fall back to their historic
    /// ping and sort after every measured one, unknown last. Then `top_n`.
    fn rank(&self, mut records: Vec<TestedConfig>) -> Vec<TestedConfig> {
        if self.policy.sort_by_ping {
            let keyed: Vec<(u8, f64)> = records.iter().map(|r| self.sort_key(r)).collect();
            let mut order: Vec<usize> = (0..records.len()).collect();
            order.sort_by(|&a, &b| {
                keyed[a]
                    .0
                    .cmp(&keyed[b].0)
                    .then_with(|| keyed[a].1.partial_cmp(&keyed[b].1).unwrap_or(Ordering::Equal))
            });
            let mut slots: Vec<Option<TestedConfig>> = records.into_iter().map(Some).collect();
            records = order.into_iter().filter_map(|i| slots[i].take()).collect();
        }
        if self.policy.top_n > 0 {
            records.truncate(self.policy.top_n);
        }
        records
    }

    fn sort_key(&self, record: &TestedConfig) -> (u8, f64) {
        if let Some(ping) = record.ping_ms {
            return (0, ping);
        }
        if self.historic_pings.is_empty() {
            return (2, 0.0);
        }
        match self
            .historic_pings
            .get(&self.hasher.history_key(&record.config.raw_text))
        {
            Some(ping) => (1, *ping),
            None => (2, 0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::test_support::tested;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Batch>>,
        cumulative: Mutex<Vec<usize>>,
        finals: Mutex<Vec<Vec<TestedConfig>>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl OutputSink for RecordingSink {
        async fn write_batch(&self, batch: &Batch) -> Result<(), PersistError> {
            if self.fail.load(AtomicOrdering::SeqCst) {
                return Err(PersistError::io(
                    "/unwritable/batch",
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
                ));
            }
            self.batches.lock().push(batch.clone());
            Ok(())
        }

        async fn write_cumulative(&self, records: &[TestedConfig]) -> Result<(), PersistError> {
            self.cumulative.lock().push(records.len());
            Ok(())
        }

        async fn write_final(&self, records: &[TestedConfig]) -> Result<(), PersistError> {
            self.finals.lock().push(records.to_vec());
            Ok(())
        }
    }

    fn policy(save_every: usize, flush: FlushPolicy) -> BatchPolicy {
        BatchPolicy {
            save_every,
            flush,
            cumulative: false,
            sort_by_ping: true,
            top_n: 0,
            stop_after_found: 0,
        }
    }

    fn processor(policy: BatchPolicy) -> (BatchProcessor, Arc<ResultStore>, Arc<RecordingSink>) {
        processor_with_filter(policy, ResultFilter::default())
    }

    fn processor_with_filter(
        policy: BatchPolicy,
        filter: ResultFilter,
    ) -> (BatchProcessor, Arc<ResultStore>, Arc<RecordingSink>) {
        let store = Arc::new(ResultStore::new());
        let sink = Arc::new(RecordingSink::default());
        let p = BatchProcessor::new(policy, filter, store.clone(), Arc::new(Codec::new()), sink.clone());
        (p, store, sink)
    }

    fn record(i: usize) -> TestedConfig {
        tested(&format!("trojan://pw@h{i}.example.com:443#n{i}"), Some(i as f64 + 1.0))
    }

    #[tokio::test]
    async fn strict_mode_flushes_exact_batches() {
        let (mut p, store, sink) = processor(policy(10, FlushPolicy::Strict));
        for i in 0..25 {
            store.push(record(i));
            p.process().await.unwrap();
        }
        {
            let batches = sink.batches.lock();
            assert_eq!(batches.len(), 2);
            assert!(batches.iter().all(|b| b.members.len() == 10));
            assert_eq!(batches[0].index, 1);
            assert_eq!(batches[1].index, 2);
        }

        assert_eq!(p.finalize().await.unwrap(), 25);
        assert_eq!(sink.batches.lock().len(), 2);
        assert_eq!(sink.finals.lock()[0].len(), 25);
    }

    #[tokio::test]
    async fn strict_mode_splits_a_large_slice() {
        let (mut p, store, sink) = processor(policy(4, FlushPolicy::Strict));
        store.extend((0..9).map(record));
        let report = p.process().await.unwrap();
        assert_eq!(report.visited, 9);
        assert_eq!(report.batches_written, 2);
        let batches = sink.batches.lock();
        assert_eq!(batches[0].members.len(), 4);
        assert_eq!(batches[1].members.len(), 4);
    }

    #[tokio::test]
    async fn threshold_mode_creeps() {
        let (mut p, store, sink) = processor(policy(10, FlushPolicy::Threshold));
        let mut next = 0;
        for _ in 0..4 {
            store.extend((next..next + 7).map(record));
            next += 7;
            p.process().await.unwrap();
        }
        let sizes: Vec<usize> = sink.batches.lock().iter().map(|b| b.members.len()).collect();
        assert_eq!(sizes, vec![14, 7]);
    }

    #[tokio::test]
    async fn duplicates_and_filtered_results_are_visited_once() {
        let filter = ResultFilter {
            require_ping: true,
            ..ResultFilter::default()
        };
        let (mut p, store, _sink) = processor_with_filter(policy(100, FlushPolicy::Strict), filter);
        store.push(record(1));
        store.push(tested("trojan://pw@h1.example.com:443?sni=x#other-name", Some(3.0)));
        store.push(tested("trojan://pw@dead.example.com:443", None));
        let report = p.process().await.unwrap();
        assert_eq!(report.visited, 3);
        assert_eq!(report.accepted, 1);
        assert_eq!(p.last_processed_index(), 3);

        let report = p.process().await.unwrap();
        assert_eq!(report.visited, 0);
    }

    #[tokio::test]
    async fn cumulative_batches_reemit_everything() {
        let mut pol = policy(2, FlushPolicy::Strict);
        pol.cumulative = true;
        let (mut p, store, sink) = processor(pol);
        store.extend((0..4).map(record));
        p.process().await.unwrap();
        let batches = sink.batches.lock();
        assert_eq!(batches[0].members.len(), 2);
        assert_eq!(batches[1].members.len(), 4);
        assert!(batches[1].cumulative);
        assert_eq!(*sink.cumulative.lock(), vec![2, 4]);
    }

    #[tokio::test]
    async fn failed_flush_keeps_state_for_retry() {
        let (mut p, store, sink) = processor(policy(3, FlushPolicy::Strict));
        sink.fail.store(true, AtomicOrdering::SeqCst);
        store.extend((0..3).map(record));
        assert!(matches!(p.process().await, Err(PersistError::Io { .. })));
        assert_eq!(p.unique_count(), 3);
        assert_eq!(p.batches_written(), 0);

        sink.fail.store(false, AtomicOrdering::SeqCst);
        let report = p.process().await.unwrap();
        assert_eq!(report.batches_written, 1);
        assert_eq!(sink.batches.lock()[0].members.len(), 3);
        assert_eq!(p.batches_written(), 1);
    }

    #[tokio::test]
    async fn stop_after_found_cancels_soft_stop_once() {
        let mut pol = policy(0, FlushPolicy::Strict);
        pol.stop_after_found = 3;
        let token = CancellationToken::new();
        let (p, store, sink) = processor(pol);
        let mut p = p.with_soft_stop(token.clone());

        store.extend((0..2).map(record));
        assert!(!p.process().await.unwrap().stop_requested);
        assert!(!token.is_cancelled());

        store.push(record(7));
        assert!(p.process().await.unwrap().stop_requested);
        assert!(token.is_cancelled());
        assert!(!p.process().await.unwrap().stop_requested);
        assert!(sink.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn ranking_sorts_by_ping_and_borrows_history() {
        let mut pol = policy(0, FlushPolicy::Strict);
        pol.top_n = 3;
        let (p, store, sink) = processor(pol);
        let remembered = "trojan://pw@old.example.com:443";
        let history = HashMap::from([(Codec::new().history_key(remembered), 5.0)]);
        let mut p = p.with_historic_pings(history);

        store.push(tested("trojan://pw@never.example.com:443", None));
        store.push(tested(remembered, None));
        store.push(tested("trojan://pw@slow.example.com:443", Some(300.0)));
        store.push(tested("trojan://pw@fast.example.com:443", Some(12.0)));
        p.finalize().await.unwrap();

        let finals = sink.finals.lock();
        let hosts: Vec<&str> = finals[0].iter().map(|r| r.config.host.as_str()).collect();
        assert_eq!(hosts, vec!["fast.example.com", "slow.example.com", "old.example.com"]);
    }

    #[test]
    fn filter_rules() {
        let notifier = Notifier::new();
        let config = RuntimeConfig {
            include_protocols: vec!["trojan".into(), "VLESS".into()],
            exclude_patterns: vec!["blocked".into()],
            tls_fragment: Some("sni=".into()),
            enable_url_test: false,
            ..RuntimeConfig::default()
        };
        let filter = ResultFilter::from_config(&config).unwrap();
        assert!(filter.accepts(&tested("trojan://pw@a.example.com:443?sni=x", None), &notifier));
        assert!(!filter.accepts(&tested("trojan://pw@a.example.com:443", None), &notifier));
        assert!(!filter.accepts(&tested("trojan://pw@blocked.example.com:443?sni=x", None), &notifier));
        assert!(!filter.accepts(
            &tested("ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ@example.com:443?sni=x", None),
            &notifier
        ));
    }

    #[test]
    fn bad_pattern_is_a_config_error() {
        let config = RuntimeConfig {
            include_patterns: vec!["(unclosed".into()],
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            ResultFilter::from_config(&config),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }
}
