//! One-time operator warnings, scoped to a single run.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::codec::Protocol;

/// Carries the "already warned" flags for a run. Shared by reference
/// between the pipeline and the batch processor.
#[derive(Debug, Default)]
pub struct Notifier {
    warned_tls_fragment_without_tls: AtomicBool,
    warned_no_tester: AtomicBool,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A TLS fragment filter is set but `protocol` does not ride TLS, so
    /// the filter may drop configs the operator expected to keep.
    /// Returns `true` the one time it actually logs.
    pub fn tls_fragment_without_tls(&self, fragment: &str, protocol: Protocol) -> bool {
        if self.warned_tls_fragment_without_tls.swap(true, Ordering::Relaxed) {
            return false;
        }
        tracing::warn!(
            fragment,
            protocol = %protocol,
            "tls_fragment filter is set but some configs do not use TLS; they only pass if their text contains the fragment"
        );
        true
    }

    /// URL testing is disabled: nothing is pinged, so ping sorting and the
    /// reachability filter have no effect.
    pub fn no_tester(&self) -> bool {
        if self.warned_no_tester.swap(true, Ordering::Relaxed) {
            return false;
        }
        tracing::warn!("enable_url_test is off; configs are emitted untested and unsorted by latency");
        true
    }
}
