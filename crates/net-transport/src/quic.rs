//! QUIC transport implementation
//!
//! The offering side runs a QUIC server on an ephemeral port and
//! advertises it as a host candidate. Its offer carries the SHA-256 of its
//! self-signed certificate, which the answering side pins when it
//! connects. Frames travel on a single bidirectional stream, each prefixed
//! with its length as a big-endian `u32`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use quinn::{
    ClientConfig, Connection, Endpoint, IdleTimeout, RecvStream, SendStream, ServerConfig,
    TransportConfig, VarInt,
};
use rustls::crypto::WebPkiSupportedAlgorithms;
use sha2::{Digest, Sha256};
use shared_protocol::{IceCandidate, MAX_FRAME_SIZE, SessionDescription};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::{
    ALPN_PROTOCOL, DEFAULT_QUIC_PORT, EVENT_CHANNEL_CAPACITY, Transport, TransportError,
    TransportEvent, TransportResult,
};

const SDP_VERSION: &str = "hushlink-quic/1";
const CERT_FINGERPRINT_ATTR: &str = "sha-256=";
const STREAM_PREAMBLE: &[u8] = b"HUSH";

/// QUIC transport configuration
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Local socket address to bind
    pub bind_addr: SocketAddr,
    /// Address advertised in the host candidate. Detected when unset.
    pub advertise_ip: Option<IpAddr>,
    /// Server name presented in the TLS handshake
    pub server_name: String,
    pub idle_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_QUIC_PORT),
            advertise_ip: None,
            server_name: "hushlink.local".to_string(),
            idle_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(5),
        }
    }
}

/// QUIC transport for Hushlink
pub struct QuicTransport {
    this: Weak<QuicTransport>,
    config: QuicConfig,
    events: mpsc::Sender<TransportEvent>,
    endpoint: RwLock<Option<Endpoint>>,
    connection: RwLock<Option<Connection>>,
    send_stream: Arc<AsyncMutex<Option<SendStream>>>,
    /// Candidates received before the offer was applied
    pending_candidates: parking_lot::Mutex<Vec<SocketAddr>>,
    /// Set on the answering side, which dials the offerer
    dialer: AtomicBool,
    connecting: AtomicBool,
    closed: AtomicBool,
}

impl QuicTransport {
    /// Create a new, idle QUIC transport
    pub fn new(config: QuicConfig) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            events,
            endpoint: RwLock::new(None),
            connection: RwLock::new(None),
            send_stream: Arc::new(AsyncMutex::new(None)),
            pending_candidates: parking_lot::Mutex::new(Vec::new()),
            dialer: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        (transport, rx)
    }

    fn transport_config(&self) -> TransportResult<TransportConfig> {
        let millis = u32::try_from(self.config.idle_timeout.as_millis())
            .map_err(|_| TransportError::ConnectionFailed("idle timeout too long".to_string()))?;

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(millis))));
        transport.keep_alive_interval(Some(self.config.keep_alive));
        Ok(transport)
    }

    /// Create client TLS config pinned to the peer's certificate
    fn create_client_config(&self, cert_sha256: [u8; 32]) -> TransportResult<ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = PinnedServerVerification {
            expected: cert_sha256,
            algorithms: provider.signature_verification_algorithms.clone(),
        };

        let mut crypto = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        let mut config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        ));
        config.transport_config(Arc::new(self.transport_config()?));

        Ok(config)
    }

    /// Create server TLS config with a fresh self-signed certificate.
    /// Returns the config and the certificate's SHA-256.
    fn create_server_config(&self) -> TransportResult<(ServerConfig, [u8; 32])> {
        let certified_key = rcgen::generate_simple_self_signed(vec![self.config.server_name.clone()])
            .map_err(|e| TransportError::Certificate(e.to_string()))?;

        let cert_der = certified_key.cert.der().clone();
        let cert_sha256: [u8; 32] = Sha256::digest(cert_der.as_ref()).into();
        let key = rustls::pki_types::PrivatePkcs8KeyDer::from(certified_key.key_pair.serialize_der());

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut server_crypto = rustls::ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key.into())
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        server_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        let mut config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        ));
        config.transport_config(Arc::new(self.transport_config()?));

        Ok((config, cert_sha256))
    }

    fn advertised_ip(&self) -> IpAddr {
        if let Some(ip) = self.config.advertise_ip {
            return ip;
        }
        if !self.config.bind_addr.ip().is_unspecified() {
            return self.config.bind_addr.ip();
        }
        local_ip_address::local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    async fn emit(&self, event: TransportEvent) {
        emit(&self.events, event).await;
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed("transport closed".to_string()));
        }
        Ok(())
    }

    /// Dial `addr` in the background. Only the first call has an effect.
    fn spawn_connect(&self, addr: SocketAddr) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if self.connecting.swap(true, Ordering::SeqCst) {
            debug!("Already connecting, ignoring candidate {}", addr);
            return;
        }

        let Some(endpoint) = self.endpoint.read().clone() else {
            warn!("No client endpoint for candidate {}", addr);
            return;
        };

        tokio::spawn(async move {
            info!("Connecting to {} ({})", addr, this.config.server_name);

            let result = async {
                let connection = endpoint
                    .connect(addr, &this.config.server_name)
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
                    .await
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

                let (mut send, recv) = connection
                    .open_bi()
                    .await
                    .map_err(|e| TransportError::Stream(e.to_string()))?;
                send.write_all(STREAM_PREAMBLE)
                    .await
                    .map_err(|e| TransportError::Stream(e.to_string()))?;

                Ok::<_, TransportError>((connection, send, recv))
            }
            .await;

            match result {
                Ok((connection, send, recv)) => {
                    info!("Connected to {}", connection.remote_address());
                    this.attach(connection, send, recv).await;
                }
                Err(e) => {
                    error!("QUIC connect failed: {}", e);
                    this.emit(TransportEvent::Failed(e.to_string())).await;
                }
            }
        });
    }

    /// Wait for the answering side to connect
    fn spawn_accept(&self, endpoint: Endpoint) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            info!("Waiting for incoming connection...");

            let result = async {
                let incoming = endpoint.accept().await.ok_or_else(|| {
                    TransportError::ConnectionFailed("Endpoint closed".to_string())
                })?;
                let connection = incoming
                    .await
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

                let (send, mut recv) = connection
                    .accept_bi()
                    .await
                    .map_err(|e| TransportError::Stream(e.to_string()))?;

                let mut preamble = [0u8; STREAM_PREAMBLE.len()];
                recv.read_exact(&mut preamble)
                    .await
                    .map_err(|e| TransportError::Stream(e.to_string()))?;
                if preamble != STREAM_PREAMBLE {
                    connection.close(VarInt::from_u32(1), b"bad preamble");
                    return Err(TransportError::Stream("unexpected stream preamble".to_string()));
                }

                Ok::<_, TransportError>((connection, send, recv))
            }
            .await;

            match result {
                Ok((connection, send, recv)) => {
                    info!("Accepted connection from {}", connection.remote_address());
                    this.attach(connection, send, recv).await;
                }
                Err(e) if this.closed.load(Ordering::SeqCst) => {
                    debug!("Accept ended after close: {}", e);
                }
                Err(e) => {
                    error!("QUIC accept failed: {}", e);
                    this.emit(TransportEvent::Failed(e.to_string())).await;
                }
            }
        });
    }

    async fn attach(&self, connection: Connection, send: SendStream, recv: RecvStream) {
        if self.closed.load(Ordering::SeqCst) {
            connection.close(VarInt::from_u32(0), b"closed");
            return;
        }

        *self.connection.write() = Some(connection);
        *self.send_stream.lock().await = Some(send);
        self.emit(TransportEvent::ChannelOpen).await;

        let events = self.events.clone();
        tokio::spawn(read_frames(recv, events));
    }

    fn parse_offer(offer: &SessionDescription) -> TransportResult<[u8; 32]> {
        let mut parts = offer.sdp.split_whitespace();
        if parts.next() != Some(SDP_VERSION) {
            return Err(TransportError::NegotiationFailed(format!(
                "unsupported session description: {:?}",
                offer.sdp
            )));
        }

        let fingerprint = parts
            .find_map(|part| part.strip_prefix(CERT_FINGERPRINT_ATTR))
            .ok_or_else(|| {
                TransportError::NegotiationFailed("offer has no certificate fingerprint".to_string())
            })?;

        let mut expected = [0u8; 32];
        hex::decode_to_slice(fingerprint, &mut expected)
            .map_err(|e| TransportError::NegotiationFailed(e.to_string()))?;
        Ok(expected)
    }

    /// Get remote address
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.connection.read().as_ref().map(|c| c.remote_address())
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.connection.read().is_some()
    }
}

/// Parse `candidate:<foundation> <component> udp <priority> <ip> <port> typ host`
pub fn parse_host_candidate(candidate: &str) -> TransportResult<SocketAddr> {
    let fields: Vec<&str> = candidate.split_whitespace().collect();
    let invalid = || TransportError::InvalidCandidate(candidate.to_string());

    if fields.len() < 8
        || !fields[0].starts_with("candidate:")
        || !fields[2].eq_ignore_ascii_case("udp")
        || fields[6] != "typ"
    {
        return Err(invalid());
    }

    let ip: IpAddr = fields[4].parse().map_err(|_| invalid())?;
    let port: u16 = fields[5].parse().map_err(|_| invalid())?;
    Ok(SocketAddr::new(ip, port))
}

fn host_candidate(addr: SocketAddr) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:1 1 udp 2130706431 {} {} typ host", addr.ip(), addr.port()),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    }
}

async fn emit(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
    if events.send(event).await.is_err() {
        debug!("Transport event receiver dropped");
    }
}

/// Read length-prefixed frames until the stream ends
async fn read_frames(mut recv: RecvStream, events: mpsc::Sender<TransportEvent>) {
    loop {
        let mut len_buf = [0u8; 4];
        if let Err(e) = recv.read_exact(&mut len_buf).await {
            debug!("Frame stream ended: {}", e);
            break;
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            warn!("Peer sent oversized frame ({} bytes), closing", len);
            break;
        }

        let mut frame = vec![0u8; len];
        if let Err(e) = recv.read_exact(&mut frame).await {
            warn!("Frame receive error: {}", e);
            break;
        }

        if events
            .send(TransportEvent::Message(Bytes::from(frame)))
            .await
            .is_err()
        {
            debug!("Frame receiver channel closed");
            return;
        }
    }

    emit(&events, TransportEvent::ChannelClosed).await;
}

#[async_trait]
impl Transport for QuicTransport {
    async fn create_offer(&self) -> TransportResult<SessionDescription> {
        self.ensure_open()?;

        let (server_config, cert_sha256) = self.create_server_config()?;
        let endpoint = Endpoint::server(server_config, self.config.bind_addr)?;
        let local = endpoint.local_addr()?;
        *self.endpoint.write() = Some(endpoint.clone());

        let advertised = SocketAddr::new(self.advertised_ip(), local.port());
        info!("QUIC server listening on {} (advertised {})", local, advertised);

        self.spawn_accept(endpoint);
        self.emit(TransportEvent::LocalCandidate(host_candidate(advertised)))
            .await;

        Ok(SessionDescription::offer(format!(
            "{} {}{}",
            SDP_VERSION,
            CERT_FINGERPRINT_ATTR,
            hex::encode(cert_sha256)
        )))
    }

    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> TransportResult<SessionDescription> {
        self.ensure_open()?;

        let cert_sha256 = Self::parse_offer(offer)?;
        self.dialer.store(true, Ordering::SeqCst);
        let client_config = self.create_client_config(cert_sha256)?;

        let bind = SocketAddr::new(self.config.bind_addr.ip(), 0);
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_config);
        *self.endpoint.write() = Some(endpoint);

        let pending: Vec<SocketAddr> = std::mem::take(&mut *self.pending_candidates.lock());
        if let Some(addr) = pending.first() {
            self.spawn_connect(*addr);
        }

        Ok(SessionDescription::answer(SDP_VERSION))
    }

    async fn accept_answer(&self, answer: &SessionDescription) -> TransportResult<()> {
        self.ensure_open()?;
        if !answer.sdp.starts_with(SDP_VERSION) {
            return Err(TransportError::NegotiationFailed(format!(
                "unsupported answer: {:?}",
                answer.sdp
            )));
        }
        debug!("Answer applied, waiting for the peer to dial in");
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> TransportResult<()> {
        let addr = parse_host_candidate(&candidate.candidate)?;

        if self.endpoint.read().is_none() {
            debug!("Queueing candidate {} until the offer is applied", addr);
            self.pending_candidates.lock().push(addr);
            return Ok(());
        }

        if self.dialer.load(Ordering::SeqCst) {
            self.spawn_connect(addr);
        } else {
            debug!("Offering side ignores candidate {}", addr);
        }
        Ok(())
    }

    async fn send(&self, data: Bytes) -> TransportResult<()> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: data.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut guard = self.send_stream.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let len = (data.len() as u32).to_be_bytes();
        stream
            .write_all(&len)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        stream
            .write_all(&data)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(mut stream) = self.send_stream.lock().await.take() {
            let _ = stream.finish();
        }
        if let Some(conn) = self.connection.write().take() {
            conn.close(VarInt::from_u32(0), b"closed");
        }
        if let Some(endpoint) = self.endpoint.write().take() {
            endpoint.close(VarInt::from_u32(0), b"closed");
        }
        info!("QUIC transport closed");
    }
}

/// Accepts exactly one server certificate, identified by its SHA-256,
/// and checks handshake signatures against it.
#[derive(Debug)]
struct PinnedServerVerification {
    expected: [u8; 32],
    algorithms: WebPkiSupportedAlgorithms,
}

impl rustls::client::danger::ServerCertVerifier for PinnedServerVerification {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let actual: [u8; 32] = Sha256::digest(end_entity.as_ref()).into();
        if actual != self.expected {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> QuicConfig {
        QuicConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            advertise_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_host_candidate() {
        let addr = parse_host_candidate("candidate:1 1 udp 2130706431 192.168.1.20 50000 typ host")
            .unwrap();
        assert_eq!(addr, "192.168.1.20:50000".parse().unwrap());

        for bad in [
            "",
            "candidate:1 1 tcp 1 10.0.0.1 1 typ host",
            "candidate:1 1 udp 1 not-an-ip 1 typ host",
            "candidate:1 1 udp 1 10.0.0.1 99999 typ host",
            "1 1 udp 1 10.0.0.1 1 typ host",
        ] {
            assert!(parse_host_candidate(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_parse_offer() {
        let fp = [0xabu8; 32];
        let offer = SessionDescription::offer(format!("{} sha-256={}", SDP_VERSION, hex::encode(fp)));
        assert_eq!(QuicTransport::parse_offer(&offer).unwrap(), fp);

        let missing = SessionDescription::offer(SDP_VERSION);
        assert!(QuicTransport::parse_offer(&missing).is_err());

        let foreign = SessionDescription::offer("v=0\r\no=- 0 0 IN IP4 0.0.0.0");
        assert!(QuicTransport::parse_offer(&foreign).is_err());
    }

    #[tokio::test]
    async fn test_quic_channel() {
        let (offerer, mut offerer_rx) = QuicTransport::new(local_config());
        let (answerer, mut answerer_rx) = QuicTransport::new(local_config());

        let offer = offerer.create_offer().await.unwrap();
        let TransportEvent::LocalCandidate(candidate) = offerer_rx.recv().await.unwrap() else {
            panic!("expected a local candidate");
        };

        let answer = answerer.accept_offer(&offer).await.unwrap();
        offerer.accept_answer(&answer).await.unwrap();
        answerer.add_candidate(&candidate).await.unwrap();

        assert_eq!(answerer_rx.recv().await.unwrap(), TransportEvent::ChannelOpen);
        answerer.send(Bytes::from_static(b"first")).await.unwrap();

        assert_eq!(offerer_rx.recv().await.unwrap(), TransportEvent::ChannelOpen);
        assert_eq!(
            offerer_rx.recv().await.unwrap(),
            TransportEvent::Message(Bytes::from_static(b"first"))
        );

        offerer.send(Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(
            answerer_rx.recv().await.unwrap(),
            TransportEvent::Message(Bytes::from_static(b"second"))
        );

        offerer.close().await;
        answerer.close().await;
    }

    #[tokio::test]
    async fn test_pinned_certificate_mismatch() {
        let (offerer, mut offerer_rx) = QuicTransport::new(local_config());
        let (answerer, mut answerer_rx) = QuicTransport::new(local_config());

        offerer.create_offer().await.unwrap();
        let TransportEvent::LocalCandidate(candidate) = offerer_rx.recv().await.unwrap() else {
            panic!("expected a local candidate");
        };

        let forged = SessionDescription::offer(format!(
            "{} sha-256={}",
            SDP_VERSION,
            hex::encode([0u8; 32])
        ));
        answerer.accept_offer(&forged).await.unwrap();
        answerer.add_candidate(&candidate).await.unwrap();

        assert!(matches!(
            answerer_rx.recv().await.unwrap(),
            TransportEvent::Failed(_)
        ));

        offerer.close().await;
        answerer.close().await;
    }
}
