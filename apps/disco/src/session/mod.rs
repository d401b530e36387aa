mod state;

pub use state::{ConnectionState, StateCallback, StateTracker};

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use crate::config::Config;
use crate::input::{InputError, InputSource};
use crate::protocol::{PhoneMessage, ProtocolVersion};
use crate::streaming::{self, EngineState, StreamError};
use crate::transport::{self, MessageSink, ResolvedTarget, TransportError, WsSink};

/// Everything needed to reach one console, consumed once by
/// [`PairingCoordinator::pair`]. Discarded on disconnect; a retry starts
/// from a fresh value.
#[derive(Debug, Clone)]
pub struct PairingSession {
    pub version: ProtocolVersion,
    pub pairing_code: Option<String>,
    pub console_ip: Option<String>,
    /// Local port advertised for punch pairing and bound for hole punching.
    pub punch_port: u16,
}

impl PairingSession {
    /// Direct addressing: no network negotiation, the target URL is built
    /// from the console address alone.
    pub fn direct(console_ip: impl Into<String>, version: ProtocolVersion) -> Self {
        Self {
            version,
            pairing_code: None,
            console_ip: Some(console_ip.into()),
            punch_port: 0,
        }
    }

    /// Code pairing: token exchange plus pairing-info lookup, with punch
    /// pairing when the console asks for it.
    pub fn with_code(code: impl Into<String>, version: ProtocolVersion, config: &Config) -> Self {
        let punch_port = rand::thread_rng().gen_range(config.punch_port_min..config.punch_port_max);
        Self {
            version,
            pairing_code: Some(code.into()),
            console_ip: None,
            punch_port,
        }
    }
}

/// Pairing-stage failures. Each one is terminal for the whole session and
/// maps to the state of the stage that produced it.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("pairing setup failed: {0}")]
    Setup(String),
    #[error("invalid console address: {0}")]
    InvalidAddress(String),
    #[error("token request failed: {0}")]
    Token(String),
    #[error("pairing code rejected: {0}")]
    InvalidPairingCode(String),
    #[error("punch pairing rejected: {0}")]
    PunchPairing(String),
    #[error("hole punching failed: {0}")]
    HolePunching(String),
}

impl PairingError {
    pub fn state(&self) -> ConnectionState {
        match self {
            PairingError::Setup(_) | PairingError::InvalidAddress(_) | PairingError::Token(_) => {
                ConnectionState::ErrorConnection
            }
            PairingError::InvalidPairingCode(_) => ConnectionState::ErrorInvalidPairingCode,
            PairingError::PunchPairing(_) => ConnectionState::ErrorPunchPairing,
            PairingError::HolePunching(_) => ConnectionState::ErrorHolePunching,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Controller(#[from] InputError),
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    ticket: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PairingInfo {
    #[serde(rename = "pairingUrl")]
    pairing_url: String,
    #[serde(rename = "tlsCertificate", default)]
    tls_certificate: Option<String>,
    #[serde(rename = "requiresPunchPairing", default)]
    requires_punch_pairing: bool,
}

#[derive(Debug, Serialize)]
struct PunchPairingRequest {
    #[serde(rename = "pairingCode")]
    pairing_code: String,
    #[serde(rename = "mobileIP")]
    mobile_ip: String,
    #[serde(rename = "mobilePort")]
    mobile_port: u16,
}

#[async_trait]
trait PairingBackend: Send + Sync {
    async fn request_token(&self, config: &Config) -> Result<String, PairingError>;

    async fn pairing_info(
        &self,
        config: &Config,
        token: &str,
        code: &str,
    ) -> Result<PairingInfo, PairingError>;

    async fn punch_pairing(
        &self,
        config: &Config,
        token: &str,
        request: &PunchPairingRequest,
    ) -> Result<(), PairingError>;
}

struct ReqwestPairingBackend {
    client: reqwest::Client,
}

impl ReqwestPairingBackend {
    fn new() -> Result<Self, PairingError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()
            .map_err(|err| PairingError::Setup(err.to_string()))?;
        Ok(Self { client })
    }
}

fn bearer(token: &str) -> String {
    format!("Ubi_v1 t={token}")
}

#[async_trait]
impl PairingBackend for ReqwestPairingBackend {
    async fn request_token(&self, config: &Config) -> Result<String, PairingError> {
        let response = self
            .client
            .post(&config.token_url)
            .header("Ubi-AppId", &config.app_id)
            .header("X-SkuId", &config.sku_id)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|err| PairingError::Token(err.to_string()))?;
        if !response.status().is_success() {
            return Err(PairingError::Token(format!(
                "http status {}",
                response.status()
            )));
        }
        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|err| PairingError::Token(err.to_string()))?;
        Ok(payload.ticket)
    }

    async fn pairing_info(
        &self,
        config: &Config,
        token: &str,
        code: &str,
    ) -> Result<PairingInfo, PairingError> {
        let response = self
            .client
            .get(&config.pairing_info_url)
            .query(&[("code", code)])
            .header("Ubi-AppId", &config.app_id)
            .header("X-SkuId", &config.sku_id)
            .header("Authorization", bearer(token))
            .send()
            .await
            .map_err(|err| PairingError::InvalidPairingCode(err.to_string()))?;
        if !response.status().is_success() {
            return Err(PairingError::InvalidPairingCode(format!(
                "http status {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|err| PairingError::InvalidPairingCode(err.to_string()))
    }

    async fn punch_pairing(
        &self,
        config: &Config,
        token: &str,
        request: &PunchPairingRequest,
    ) -> Result<(), PairingError> {
        let response = self
            .client
            .post(&config.punch_pairing_url)
            .header("Ubi-AppId", &config.app_id)
            .header("X-SkuId", &config.sku_id)
            .header("Authorization", bearer(token))
            .json(request)
            .send()
            .await
            .map_err(|err| PairingError::PunchPairing(err.to_string()))?;
        if !response.status().is_success() {
            return Err(PairingError::PunchPairing(format!(
                "http status {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|err| PairingError::PunchPairing(err.to_string()))?;
        if body != "OK" {
            return Err(PairingError::PunchPairing(format!(
                "unexpected response body {body:?}"
            )));
        }
        Ok(())
    }
}

/// Resolves how to reach the console and produces the target the transport
/// connects to. Every stage failure records its error state and aborts the
/// remaining stages.
pub struct PairingCoordinator {
    config: Arc<Config>,
    backend: Arc<dyn PairingBackend>,
}

impl PairingCoordinator {
    pub fn new(config: Arc<Config>) -> Result<Self, PairingError> {
        let backend = Arc::new(ReqwestPairingBackend::new()?);
        Ok(Self { config, backend })
    }

    #[cfg(test)]
    fn with_backend(config: Arc<Config>, backend: Arc<dyn PairingBackend>) -> Self {
        Self { config, backend }
    }

    pub async fn pair(
        &self,
        session: &PairingSession,
        state: &StateTracker,
    ) -> Result<ResolvedTarget, PairingError> {
        let result = self.pair_inner(session, state).await;
        if let Err(err) = &result {
            tracing::warn!(target: "disco::session", error = %err, "pairing failed");
            state.transition(err.state());
        }
        result
    }

    async fn pair_inner(
        &self,
        session: &PairingSession,
        state: &StateTracker,
    ) -> Result<ResolvedTarget, PairingError> {
        if let Some(console_ip) = session.console_ip.as_deref() {
            state.transition(ConnectionState::Pairing);
            return self.direct_target(console_ip, session.version);
        }

        let code = session.pairing_code.as_deref().ok_or_else(|| {
            PairingError::Setup("a console address or pairing code is required".into())
        })?;

        state.transition(ConnectionState::GettingToken);
        let token = self.backend.request_token(&self.config).await?;

        state.transition(ConnectionState::Pairing);
        let info = self.backend.pairing_info(&self.config, &token, code).await?;
        let url = pairing_url_to_ws(&info.pairing_url)?;

        let mut punched = None;
        if info.requires_punch_pairing {
            let request = PunchPairingRequest {
                pairing_code: code.to_string(),
                mobile_ip: local_ip().to_string(),
                mobile_port: session.punch_port,
            };
            self.backend
                .punch_pairing(&self.config, &token, &request)
                .await?;
            punched = Some(hole_punch(session.punch_port, self.config.hole_punch_timeout).await?);
        }

        Ok(ResolvedTarget {
            url,
            version: session.version,
            trust_pem: info.tls_certificate,
            punched,
        })
    }

    fn direct_target(
        &self,
        console_ip: &str,
        version: ProtocolVersion,
    ) -> Result<ResolvedTarget, PairingError> {
        let raw = format!(
            "wss://{console_ip}:{}/smartphone",
            self.config.direct_connect_port
        );
        let url = Url::parse(&raw)
            .map_err(|err| PairingError::InvalidAddress(format!("{console_ip}: {err}")))?;
        Ok(ResolvedTarget {
            url,
            version,
            trust_pem: None,
            punched: None,
        })
    }
}

/// The pairing-info URL comes back as https and is turned into the console's
/// WebSocket endpoint by swapping the scheme and appending the smartphone
/// path.
fn pairing_url_to_ws(raw: &str) -> Result<Url, PairingError> {
    let base = if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        raw.to_string()
    };
    let target = format!("{base}smartphone");
    Url::parse(&target)
        .map_err(|err| PairingError::InvalidPairingCode(format!("unusable pairing url {raw:?}: {err}")))
}

/// Bind the advertised port and wait for the console's reverse connection.
/// Exactly one accept; the listener is dropped on every path so the port is
/// never leaked.
async fn hole_punch(port: u16, limit: Duration) -> Result<TcpStream, PairingError> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|err| PairingError::HolePunching(format!("bind on port {port} failed: {err}")))?;
    tracing::debug!(target: "disco::session", port, "waiting for console reverse connection");
    match tokio::time::timeout(limit, listener.accept()).await {
        Ok(Ok((stream, peer))) => {
            tracing::debug!(target: "disco::session", %peer, "console connected");
            Ok(stream)
        }
        Ok(Err(err)) => Err(PairingError::HolePunching(err.to_string())),
        Err(_) => Err(PairingError::HolePunching(format!(
            "no connection within {limit:?}"
        ))),
    }
}

/// Local address advertised in the punch-pairing request.
fn local_ip() -> IpAddr {
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|interfaces| {
            interfaces
                .into_iter()
                .find(|iface| !iface.is_loopback() && iface.ip().is_ipv4())
                .map(|iface| iface.ip())
        })
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Run one single-attempt session end to end: pair, connect, stream until
/// something stops it, then tear everything down. Callers wanting a retry
/// construct a fresh [`PairingSession`] and call again.
pub async fn run(
    config: Arc<Config>,
    pairing: PairingSession,
    input: Box<dyn InputSource>,
    on_state: Option<StateCallback>,
) -> Result<(), SessionError> {
    let state = StateTracker::new(on_state);
    let engine = EngineState::new(input);
    let coordinator = match PairingCoordinator::new(config) {
        Ok(coordinator) => coordinator,
        Err(err) => {
            state.transition(err.state());
            disconnect(&state, &engine, None).await;
            return Err(err.into());
        }
    };

    let target = match coordinator.pair(&pairing, &state).await {
        Ok(target) => target,
        Err(err) => {
            disconnect(&state, &engine, None).await;
            return Err(err.into());
        }
    };

    state.transition(ConnectionState::Connecting);
    let ws = match transport::connect(target).await {
        Ok(ws) => ws,
        Err(err) => {
            state.transition(ConnectionState::ErrorConsoleConnection);
            disconnect(&state, &engine, None).await;
            return Err(err.into());
        }
    };
    state.transition(ConnectionState::Connected);

    let (writer, mut reader) = ws.split();
    let sink = WsSink::new(writer);

    // The handshake hello goes out exactly once, ahead of the loops.
    if let Err(err) = sink.send(PhoneMessage::Hello).await {
        disconnect(&state, &engine, Some(&sink)).await;
        return Err(err.into());
    }

    // The three steady-state duties share the transport until the first one
    // finishes; the select drops the siblings, which is their stop signal.
    let outcome = tokio::select! {
        result = streaming::tick_loop(&engine, &sink) => result,
        result = streaming::command_loop(&engine, &sink) => result,
        result = transport::receive_loop(&mut reader, &engine) => result.map_err(StreamError::from),
    };

    let outcome = match outcome {
        Ok(()) => Ok(()),
        Err(StreamError::Input(err)) => {
            state.transition(ConnectionState::ErrorController);
            Err(SessionError::Controller(err))
        }
        Err(StreamError::Transport(err)) => Err(SessionError::Transport(err)),
    };

    disconnect(&state, &engine, Some(&sink)).await;
    outcome
}

/// Unified teardown: release the controller, close the socket, land in
/// `Disconnected`. Idempotent; a second call is a no-op.
pub async fn disconnect(state: &StateTracker, engine: &EngineState, sink: Option<&WsSink>) {
    if state.current() == ConnectionState::Disconnected {
        return;
    }
    state.transition(ConnectionState::Disconnecting);
    if engine.release_input() {
        tracing::debug!(target: "disco::session", "controller released");
    }
    if let Some(sink) = sink {
        sink.close().await;
    }
    state.transition(ConnectionState::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockPairingBackend {
        calls: Mutex<Vec<&'static str>>,
        fail_token: bool,
        fail_pairing_info: bool,
        fail_punch: bool,
        requires_punch: bool,
        pairing_url: String,
        tls_certificate: Option<String>,
        /// When set, punch_pairing plays the console and dials the
        /// advertised port.
        dial_back: bool,
    }

    impl MockPairingBackend {
        fn happy(pairing_url: &str) -> Self {
            Self {
                pairing_url: pairing_url.to_string(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl PairingBackend for MockPairingBackend {
        async fn request_token(&self, _config: &Config) -> Result<String, PairingError> {
            self.calls.lock().push("token");
            if self.fail_token {
                return Err(PairingError::Token("http status 401".into()));
            }
            Ok("T1".to_string())
        }

        async fn pairing_info(
            &self,
            _config: &Config,
            token: &str,
            _code: &str,
        ) -> Result<PairingInfo, PairingError> {
            self.calls.lock().push("pairing_info");
            assert_eq!(token, "T1");
            if self.fail_pairing_info {
                return Err(PairingError::InvalidPairingCode("http status 404".into()));
            }
            Ok(PairingInfo {
                pairing_url: self.pairing_url.clone(),
                tls_certificate: self.tls_certificate.clone(),
                requires_punch_pairing: self.requires_punch,
            })
        }

        async fn punch_pairing(
            &self,
            _config: &Config,
            _token: &str,
            request: &PunchPairingRequest,
        ) -> Result<(), PairingError> {
            self.calls.lock().push("punch_pairing");
            if self.fail_punch {
                return Err(PairingError::PunchPairing("http status 403".into()));
            }
            if self.dial_back {
                let port = request.mobile_port;
                tokio::spawn(async move {
                    // The listener binds after this call returns; retry
                    // briefly like a console on a LAN would.
                    for _ in 0..50 {
                        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                });
            }
            Ok(())
        }
    }

    fn recording_tracker() -> (StateTracker, Arc<Mutex<Vec<ConnectionState>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let tracker = StateTracker::new(Some(Box::new(move |state| {
            sink.lock().push(state);
        })));
        (tracker, seen)
    }

    fn coordinator(backend: Arc<MockPairingBackend>) -> PairingCoordinator {
        PairingCoordinator::with_backend(Arc::new(Config::default()), backend)
    }

    #[tokio::test]
    async fn direct_mode_builds_url_without_network_calls() {
        let backend = Arc::new(MockPairingBackend::default());
        let coordinator = coordinator(backend.clone());
        let session = PairingSession::direct("192.168.1.5", ProtocolVersion::V1);
        let (tracker, seen) = recording_tracker();

        let target = coordinator.pair(&session, &tracker).await.unwrap();
        assert_eq!(target.url.as_str(), "wss://192.168.1.5:8080/smartphone");
        assert!(target.punched.is_none());
        assert!(target.trust_pem.is_none());
        assert!(backend.calls().is_empty());
        assert_eq!(*seen.lock(), vec![ConnectionState::Pairing]);
    }

    #[tokio::test]
    async fn direct_mode_rejects_malformed_address() {
        let backend = Arc::new(MockPairingBackend::default());
        let coordinator = coordinator(backend);
        let session = PairingSession::direct("not a host", ProtocolVersion::V2);
        let tracker = StateTracker::default();

        let err = coordinator.pair(&session, &tracker).await.unwrap_err();
        assert!(matches!(err, PairingError::InvalidAddress(_)));
        assert_eq!(tracker.current(), ConnectionState::ErrorConnection);
    }

    #[tokio::test]
    async fn code_mode_happy_path() {
        let backend = Arc::new(MockPairingBackend::happy("https://h/"));
        let coordinator = coordinator(backend.clone());
        let config = Config::default();
        let session = PairingSession::with_code("1234", ProtocolVersion::V2, &config);
        let (tracker, seen) = recording_tracker();

        let target = coordinator.pair(&session, &tracker).await.unwrap();
        assert_eq!(target.url.as_str(), "wss://h/smartphone");
        assert_eq!(target.version, ProtocolVersion::V2);
        assert!(target.punched.is_none());
        assert_eq!(backend.calls(), vec!["token", "pairing_info"]);
        assert_eq!(
            *seen.lock(),
            vec![ConnectionState::GettingToken, ConnectionState::Pairing]
        );
    }

    #[tokio::test]
    async fn token_failure_sets_error_connection() {
        let backend = Arc::new(MockPairingBackend {
            fail_token: true,
            ..MockPairingBackend::default()
        });
        let coordinator = coordinator(backend.clone());
        let config = Config::default();
        let session = PairingSession::with_code("1234", ProtocolVersion::V2, &config);
        let tracker = StateTracker::default();

        let err = coordinator.pair(&session, &tracker).await.unwrap_err();
        assert!(matches!(err, PairingError::Token(_)));
        assert_eq!(tracker.current(), ConnectionState::ErrorConnection);
        assert_eq!(backend.calls(), vec!["token"]);
    }

    #[tokio::test]
    async fn invalid_code_aborts_before_punch_pairing() {
        let backend = Arc::new(MockPairingBackend {
            fail_pairing_info: true,
            requires_punch: true,
            ..MockPairingBackend::default()
        });
        let coordinator = coordinator(backend.clone());
        let config = Config::default();
        let session = PairingSession::with_code("0000", ProtocolVersion::V2, &config);
        let tracker = StateTracker::default();

        let err = coordinator.pair(&session, &tracker).await.unwrap_err();
        assert!(matches!(err, PairingError::InvalidPairingCode(_)));
        assert_eq!(tracker.current(), ConnectionState::ErrorInvalidPairingCode);
        assert_eq!(backend.calls(), vec!["token", "pairing_info"]);
    }

    #[tokio::test]
    async fn punch_rejection_sets_error_punch_pairing() {
        let backend = Arc::new(MockPairingBackend {
            pairing_url: "https://h/".to_string(),
            requires_punch: true,
            fail_punch: true,
            ..MockPairingBackend::default()
        });
        let coordinator = coordinator(backend.clone());
        let config = Config::default();
        let session = PairingSession::with_code("1234", ProtocolVersion::V2, &config);
        let tracker = StateTracker::default();

        let err = coordinator.pair(&session, &tracker).await.unwrap_err();
        assert!(matches!(err, PairingError::PunchPairing(_)));
        assert_eq!(tracker.current(), ConnectionState::ErrorPunchPairing);
    }

    #[tokio::test]
    async fn punch_pairing_retains_the_accepted_socket() {
        let backend = Arc::new(MockPairingBackend {
            pairing_url: "https://h/".to_string(),
            requires_punch: true,
            dial_back: true,
            ..MockPairingBackend::default()
        });
        let coordinator = coordinator(backend.clone());
        let config = Config::default();
        let session = PairingSession::with_code("1234", ProtocolVersion::V2, &config);
        let tracker = StateTracker::default();

        let target = coordinator.pair(&session, &tracker).await.unwrap();
        assert!(target.punched.is_some());
        assert_eq!(
            backend.calls(),
            vec!["token", "pairing_info", "punch_pairing"]
        );
    }

    #[tokio::test]
    async fn hole_punch_timeout_frees_the_port() {
        let port = 38751;
        let err = hole_punch(port, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, PairingError::HolePunching(_)));

        // The listener must be gone; rebinding succeeds.
        let rebound = TcpListener::bind(("0.0.0.0", port)).await;
        assert!(rebound.is_ok());
    }

    struct ReleaseProbe {
        releases: Arc<AtomicUsize>,
    }

    impl Drop for ReleaseProbe {
        fn drop(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl InputSource for ReleaseProbe {
        fn drain_events(&mut self) -> Vec<crate::protocol::ButtonEvent> {
            Vec::new()
        }

        fn accel_sample(&mut self) -> Result<crate::protocol::AccelSample, InputError> {
            Ok([0.0, 0.0, 0.0])
        }
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let releases = Arc::new(AtomicUsize::new(0));
        let engine = EngineState::new(Box::new(ReleaseProbe {
            releases: releases.clone(),
        }));
        let tracker = StateTracker::default();

        disconnect(&tracker, &engine, None).await;
        assert_eq!(tracker.current(), ConnectionState::Disconnected);
        assert_eq!(releases.load(Ordering::SeqCst), 1);

        disconnect(&tracker, &engine, None).await;
        assert_eq!(tracker.current(), ConnectionState::Disconnected);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pairing_url_transformation() {
        assert_eq!(
            pairing_url_to_ws("https://h/").unwrap().as_str(),
            "wss://h/smartphone"
        );
        assert_eq!(
            pairing_url_to_ws("http://127.0.0.1:9001/").unwrap().as_str(),
            "ws://127.0.0.1:9001/smartphone"
        );
        assert!(pairing_url_to_ws("not a url").is_err());
    }

    #[test]
    fn punch_port_is_drawn_from_the_configured_range() {
        let config = Config::default();
        for _ in 0..100 {
            let session = PairingSession::with_code("1234", ProtocolVersion::V2, &config);
            assert!(session.punch_port >= config.punch_port_min);
            assert!(session.punch_port < config.punch_port_max);
        }
    }
}
