//! Connectivity tester for parsed proxy endpoints.
//!
//! Measures TCP connect latency to `host:port` and, in full-test mode,
//! performs a TLS client handshake on top for protocols that usually ride
//! over TLS. Every connection test runs behind one shared semaphore so fan-out across
//! many sources never exceeds the configured concurrency.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::codec::{ParsedConfig, Protocol};
use crate::config::RuntimeConfig;

/// Outcome of one connection test.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TestOutcome {
    /// TCP connect latency; `None` when the connect failed or timed out.
    pub ping_ms: Option<f64>,
    /// `None` when no handshake was attempted.
    pub handshake_ok: Option<bool>,
}

impl TestOutcome {
    pub fn reachable(&self) -> bool {
        self.ping_ms.is_some() && self.handshake_ok != Some(false)
    }
}

/// A parsed config plus its test result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestedConfig {
    #[serde(flatten)]
    pub config: ParsedConfig,
    pub ping_ms: Option<f64>,
    pub reachable: bool,
    pub handshake_ok: Option<bool>,
    /// `None` when the config was never tested.
    pub tested_at: Option<DateTime<Utc>>,
}

impl TestedConfig {
    pub fn from_outcome(config: ParsedConfig, outcome: TestOutcome, tested_at: DateTime<Utc>) -> Self {
        Self {
            reachable: outcome.reachable(),
            ping_ms: outcome.ping_ms,
            handshake_ok: outcome.handshake_ok,
            tested_at: Some(tested_at),
            config,
        }
    }

    /// Record for a config that is emitted without probing.
    pub fn untested(config: ParsedConfig) -> Self {
        Self {
            config,
            ping_ms: None,
            reachable: false,
            handshake_ok: None,
            tested_at: None,
        }
    }
}

/// Tester settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TesterSettings {
    /// Budget for connect plus handshake.
    pub timeout: Duration,
    pub concurrency: usize,
    pub full_test: bool,
    pub verify_tls: bool,
}

impl Default for TesterSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3_000),
            concurrency: 128,
            full_test: false,
            verify_tls: false,
        }
    }
}

impl TesterSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            timeout: config.test_timeout(),
            concurrency: config.test_concurrency,
            full_test: config.full_test,
            verify_tls: config.verify_tls,
        }
    }
}

/// Bounded-concurrency TCP / TLS connection tester.
pub struct ConnectivityTester {
    settings: TesterSettings,
    gate: Arc<Semaphore>,
    tls: Option<TlsConnector>,
}

impl ConnectivityTester {
    pub fn new(settings: TesterSettings) -> Result<Self> {
        let tls = if settings.full_test {
            Some(build_tls_connector(settings.verify_tls)?)
        } else {
            None
        };
        Ok(Self {
            gate: Arc::new(Semaphore::new(settings.concurrency.max(1))),
            settings,
            tls,
        })
    }

    pub fn settings(&self) -> &TesterSettings {
        &self.settings
    }

    /// Test one endpoint under the shared concurrency gate.
    pub async fn test_connection(&self, host: &str, port: u16, protocol: Protocol) -> TestOutcome {
        let Ok(_permit) = self.gate.acquire().await else {
            return TestOutcome::default();
        };

        let deadline = self.settings.timeout;
        let start = Instant::now();
        let stream = match tokio::time::timeout(deadline, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!(host, port, "tester: connect failed: {e}");
                return TestOutcome::default();
            }
            Err(_) => {
                tracing::debug!(host, port, "tester: connect timed out");
                return TestOutcome::default();
            }
        };
        let ping_ms = start.elapsed().as_secs_f64() * 1_000.0;

        let handshake_ok = match &self.tls {
            Some(connector) if protocol.rides_tls() => {
                let remaining = deadline.saturating_sub(start.elapsed());
                Some(handshake(connector, host, stream, remaining).await)
            }
            _ => {
                drop(stream);
                None
            }
        };

        TestOutcome {
            ping_ms: Some(ping_ms),
            handshake_ok,
        }
    }

    /// Test every config; results come back in input order.
    pub async fn test_all(&self, configs: Vec<ParsedConfig>) -> Vec<TestedConfig> {
        self.test_all_until(configs, &CancellationToken::new()).await
    }

    /// Like [`Self::test_all`], but stops waiting once `cancel` fires and
    /// returns only the tests that finished, still in input order.
    pub async fn test_all_until(&self, configs: Vec<ParsedConfig>, cancel: &CancellationToken) -> Vec<TestedConfig> {
        let total = configs.len();
        let mut pending: FuturesUnordered<_> = configs
            .into_iter()
            .enumerate()
            .map(|(index, config)| async move {
                let outcome = self
                    .test_connection(&config.host, config.port, config.protocol)
                    .await;
                (index, TestedConfig::from_outcome(config, outcome, Utc::now()))
            })
            .collect();

        let mut done: Vec<Option<TestedConfig>> = vec![None; total];
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!(total, "tester: cancelled, keeping finished results");
                    break;
                }
                next = pending.next() => match next {
                    Some((index, tested)) => done[index] = Some(tested),
                    None => break,
                },
            }
        }
        done.into_iter().flatten().collect()
    }
}

async fn handshake(connector: &TlsConnector, host: &str, stream: TcpStream, budget: Duration) -> bool {
    let server_name = match ServerName::try_from(host.to_string()) {
        Ok(name) => name,
        Err(e) => {
            tracing::debug!(host, "tester: invalid SNI name: {e}");
            return false;
        }
    };
    match tokio::time::timeout(budget, connector.connect(server_name, stream)).await {
        Ok(Ok(_tls)) => true,
        Ok(Err(e)) => {
            tracing::debug!(host, "tester: TLS handshake failed: {e}");
            false
        }
        Err(_) => {
            tracing::debug!(host, "tester: TLS handshake timed out");
            false
        }
    }
}

fn build_tls_connector(verify: bool) -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("failed to configure TLS protocol versions: {e}"))?;

    let config = if verify {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts any server certificate; a completed handshake is all we measure.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
