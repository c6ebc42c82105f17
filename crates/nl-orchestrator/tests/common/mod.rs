//! Scripted market shared by the session integration tests
//!
//! Every collaborator call is appended to a [`Journal`] so tests can assert
//! on ordering, and every failure mode can be switched on from a [`Script`].

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use nl_core::config::SessionConfig;
use nl_core::traits::{
    ExeUnit, Market, MarketConnection, RemoteEndpoint, RemoteProcess, RemoteStream, Rental,
};
use nl_core::{
    MarketError, OfferPricing, OfferProposal, ProcessStatus, ProviderInfo, RentalSpec,
    SessionState,
};

pub const READY_MARKER: &str = "Listening on [::]:11434";

/// Base port for tunnel listeners - each test gets a unique offset
static PORT_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Get a free local port for this test
pub fn test_port() -> u16 {
    loop {
        let port = 41000 + PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return port;
        }
    }
}

/// Whether nothing is bound to `port` on loopback
pub fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Session config with short intervals for tests
pub fn test_config(local_port: u16) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.process.poll_interval = Duration::from_millis(10);
    config.rental.negotiation_timeout = Duration::from_secs(2);
    config.market.backoff.initial = Duration::from_millis(10);
    config.market.backoff.max = Duration::from_millis(50);
    config.market.backoff.jitter = 0.0;
    config.tunnel.local_port = local_port;
    config.shutdown.cleanup_step_timeout = Duration::from_secs(2);
    config
}

/// Offer from `provider` with the given memory and flat price
pub fn offer(id: &str, provider: &str, memory_gib: f64, price: f64) -> OfferProposal {
    OfferProposal {
        id: id.to_string(),
        provider: ProviderInfo {
            id: format!("0x{}", provider),
            name: provider.to_string(),
        },
        memory_gib,
        pricing: OfferPricing {
            start: price,
            cpu_per_hour: price,
            env_per_hour: price,
        },
    }
}

/// TCP server that echoes every byte back
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Connect to a local port, retrying while the listener comes up
pub async fn connect_local(port: u16) -> TcpStream {
    let mut last_err = None;
    for _ in 0..50 {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => return stream,
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    panic!("Failed to connect to tunnel at port {}: {:?}", port, last_err);
}

/// Wait until the session publishes `state`
pub async fn wait_for_state(states: &mut watch::Receiver<SessionState>, state: SessionState) {
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("session never reached {}", state))
        .unwrap_or_else(|_| panic!("state channel closed before {}", state));
}

/// Ordered record of collaborator calls
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries().iter().any(|e| e == entry)
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    /// Wait until `entry` is recorded
    pub async fn wait_for(&self, entry: &str) {
        timeout(Duration::from_secs(2), async {
            while !self.contains(entry) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} was never recorded", entry));
    }
}

/// Behaviour of the scripted market
#[derive(Clone)]
pub struct Script {
    /// Number of leading connect attempts that fail
    pub connect_failures: u32,
    /// Offers delivered in order
    pub offers: Vec<OfferProposal>,
    /// Offer ids whose rent call fails
    pub failing_rents: HashSet<String>,
    pub exe_unit_error: bool,
    pub launch_error: bool,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Delay before the scripted output is written
    pub output_delay: Duration,
    /// Status reported some time after the output; `None` keeps the process running
    pub exit: Option<(Duration, ProcessStatus)>,
    /// Where tunnel connections are forwarded
    pub remote_addr: Option<SocketAddr>,
    pub endpoint_error: bool,
    /// How long stopping the rental takes
    pub stop_delay: Duration,
    /// Stopping the rental reports an error after stopping the activity
    pub stop_error: bool,
    pub disconnect_error: bool,
    /// Local port checked for being free when the rental is stopped
    pub watch_port: Option<u16>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            connect_failures: 0,
            offers: vec![offer("offer-1", "provider-a", 32.0, 1.0)],
            failing_rents: HashSet::new(),
            exe_unit_error: false,
            launch_error: false,
            stdout: Vec::new(),
            stderr: Vec::new(),
            output_delay: Duration::ZERO,
            exit: None,
            remote_addr: None,
            endpoint_error: false,
            stop_delay: Duration::ZERO,
            stop_error: false,
            disconnect_error: false,
            watch_port: None,
        }
    }
}

impl Script {
    /// Server that logs the readiness marker on stderr and keeps running
    pub fn ready_server(remote_addr: SocketAddr) -> Self {
        Self {
            stdout: vec!["ollama starting".to_string()],
            stderr: vec![
                "time=2024-05-01 level=INFO msg=\"loading\"".to_string(),
                format!("time=2024-05-01 level=INFO msg=\"{} (version 0.1.32)\"", READY_MARKER),
            ],
            remote_addr: Some(remote_addr),
            ..Self::default()
        }
    }
}

pub struct MockMarket {
    script: Script,
    journal: Journal,
    connects: AtomicU32,
}

impl MockMarket {
    pub fn new(script: Script) -> (Arc<Self>, Journal) {
        let journal = Journal::default();
        let market = Arc::new(Self {
            script,
            journal: journal.clone(),
            connects: AtomicU32::new(0),
        });
        (market, journal)
    }
}

#[async_trait]
impl Market for MockMarket {
    async fn connect(&self) -> Result<Box<dyn MarketConnection>, MarketError> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.push("connect");
        if attempt <= self.script.connect_failures {
            return Err(MarketError::Unavailable("scripted connect failure".to_string()));
        }
        Ok(Box::new(MockConnection {
            script: self.script.clone(),
            journal: self.journal.clone(),
        }))
    }
}

struct MockConnection {
    script: Script,
    journal: Journal,
}

#[async_trait]
impl MarketConnection for MockConnection {
    async fn offers(
        &self,
        _spec: &RentalSpec,
    ) -> Result<mpsc::Receiver<OfferProposal>, MarketError> {
        self.journal.push("offers");
        let (tx, rx) = mpsc::channel(self.script.offers.len().max(1));
        for offer in &self.script.offers {
            let _ = tx.try_send(offer.clone());
        }
        Ok(rx)
    }

    async fn rent(
        &self,
        offer: OfferProposal,
        _spec: &RentalSpec,
    ) -> Result<Box<dyn Rental>, MarketError> {
        self.journal.push(format!("rent {}", offer.id));
        if self.script.failing_rents.contains(&offer.id) {
            return Err(MarketError::Rejected("scripted rent failure".to_string()));
        }
        Ok(Box::new(MockRental {
            provider: offer.provider,
            script: self.script.clone(),
            journal: self.journal.clone(),
            activity: CancellationToken::new(),
        }))
    }

    async fn disconnect(&self) -> Result<(), MarketError> {
        self.journal.push("disconnect");
        if self.script.disconnect_error {
            return Err(MarketError::Disconnected);
        }
        Ok(())
    }
}

struct MockRental {
    provider: ProviderInfo,
    script: Script,
    journal: Journal,
    activity: CancellationToken,
}

#[async_trait]
impl Rental for MockRental {
    fn provider(&self) -> &ProviderInfo {
        &self.provider
    }

    async fn exe_unit(&self) -> Result<Arc<dyn ExeUnit>, MarketError> {
        self.journal.push("exe_unit");
        if self.script.exe_unit_error {
            return Err(MarketError::Revoked("scripted activity failure".to_string()));
        }
        Ok(Arc::new(MockExeUnit {
            provider: self.provider.clone(),
            script: self.script.clone(),
            journal: self.journal.clone(),
            activity: self.activity.clone(),
        }))
    }

    async fn stop_and_finalize(&self) -> Result<(), MarketError> {
        match self.script.watch_port {
            Some(port) if port_is_free(port) => self.journal.push("rental_stop port_free"),
            Some(_) => self.journal.push("rental_stop port_busy"),
            None => self.journal.push("rental_stop"),
        }
        self.activity.cancel();
        if !self.script.stop_delay.is_zero() {
            tokio::time::sleep(self.script.stop_delay).await;
        }
        if self.script.stop_error {
            return Err(MarketError::Rejected("scripted finalize failure".to_string()));
        }
        Ok(())
    }
}

struct MockExeUnit {
    provider: ProviderInfo,
    script: Script,
    journal: Journal,
    activity: CancellationToken,
}

#[async_trait]
impl ExeUnit for MockExeUnit {
    fn provider(&self) -> &ProviderInfo {
        &self.provider
    }

    async fn run_and_stream(&self, command: &str) -> Result<RemoteProcess, MarketError> {
        self.journal.push(format!("run {}", command));
        if self.script.launch_error {
            return Err(MarketError::Unavailable("scripted launch failure".to_string()));
        }

        let (stdout_tx, stdout) = mpsc::channel(16);
        let (stderr_tx, stderr) = mpsc::channel(16);
        let (status_tx, status) = watch::channel(ProcessStatus::Running);
        let kill = self.activity.child_token();

        let script = self.script.clone();
        let journal = self.journal.clone();
        let killed = kill.clone();
        tokio::spawn(async move {
            let stopped = ProcessStatus::Exited { code: None };

            tokio::select! {
                _ = killed.cancelled() => {
                    journal.push("process_killed");
                    status_tx.send_replace(stopped.clone());
                    return;
                }
                _ = tokio::time::sleep(script.output_delay) => {}
            }

            for line in &script.stdout {
                let _ = stdout_tx.send(Bytes::from(format!("{}\n", line))).await;
            }
            for line in &script.stderr {
                let _ = stderr_tx.send(Bytes::from(format!("{}\n", line))).await;
            }

            let status = match script.exit {
                Some((delay, status)) => tokio::select! {
                    _ = killed.cancelled() => None,
                    _ = tokio::time::sleep(delay) => Some(status),
                },
                None => {
                    killed.cancelled().await;
                    None
                }
            };
            match status {
                Some(status) => {
                    journal.push("process_end");
                    status_tx.send_replace(status);
                }
                None => {
                    journal.push("process_killed");
                    status_tx.send_replace(stopped);
                }
            }
        });

        Ok(RemoteProcess {
            stdout,
            stderr,
            status,
            kill,
        })
    }

    async fn open_endpoint(
        &self,
        remote_port: u16,
    ) -> Result<Arc<dyn RemoteEndpoint>, MarketError> {
        self.journal.push(format!("open_endpoint {}", remote_port));
        if self.script.endpoint_error {
            return Err(MarketError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "scripted endpoint failure",
            )));
        }
        Ok(Arc::new(MockEndpoint {
            remote_port,
            target: self.script.remote_addr,
        }))
    }
}

struct MockEndpoint {
    remote_port: u16,
    target: Option<SocketAddr>,
}

#[async_trait]
impl RemoteEndpoint for MockEndpoint {
    fn remote_port(&self) -> u16 {
        self.remote_port
    }

    async fn connect(&self) -> std::io::Result<RemoteStream> {
        match self.target {
            Some(addr) => Ok(Box::new(TcpStream::connect(addr).await?)),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no remote service",
            )),
        }
    }
}
