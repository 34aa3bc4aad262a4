//! QUIC binding for the authority protocol.
//!
//! Each remote call opens one bidirectional stream, writes a bincode encoded
//! `AuthorityRequest`, finishes the send side and reads the `AuthorityResponse`
//! back. The server spawns a task per connection and a task per call, so calls
//! for unrelated paths never queue behind each other.

use super::{Transport, TransportError};
use crate::authority::Authority;
use crate::protocol::{AuthorityRequest, AuthorityResponse, TransferId};
use crate::util::lock;
use anyhow::Result;
use async_trait::async_trait;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{
    ClientConfig as QuinnClientConfig, Connection, ConnectionError, Endpoint, RecvStream,
    SendStream, ServerConfig,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig as RustlsClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Upper bound for one framed message (a chunk plus its envelope).
const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Install the ring crypto provider unless the process already has one.
pub fn init_crypto() {
    let _ = CryptoProvider::install_default(rustls::crypto::ring::default_provider());
}

/// The authority presents a self-signed certificate; skip verification.
#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
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
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}

fn network(e: impl std::fmt::Display) -> TransportError {
    TransportError::Network(e.to_string())
}

/// Client side of the QUIC binding. The connection is re-established lazily
/// when the previous one was lost.
pub struct QuicTransport {
    endpoint: Endpoint,
    server_addr: SocketAddr,
    connection: AsyncMutex<Option<Connection>>,
}

impl QuicTransport {
    pub async fn connect(server_addr: SocketAddr) -> Result<Self> {
        init_crypto();
        let mut tls = RustlsClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        tls.dangerous()
            .set_certificate_verifier(Arc::new(SkipServerVerification));

        let quic_crypto = QuicClientConfig::try_from(tls)?;
        let bind: SocketAddr = if server_addr.is_ipv6() {
            "[::]:0".parse()?
        } else {
            "0.0.0.0:0".parse()?
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(QuinnClientConfig::new(Arc::new(quic_crypto)));

        let transport = Self {
            endpoint,
            server_addr,
            connection: AsyncMutex::new(None),
        };
        transport.connection().await?;
        Ok(transport)
    }

    async fn connection(&self) -> Result<Connection, TransportError> {
        let mut current = self.connection.lock().await;
        if let Some(conn) = current.as_ref() {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            warn!("connection to authority lost, reconnecting");
        }
        let conn = self
            .endpoint
            .connect(self.server_addr, "localhost")
            .map_err(network)?
            .await
            .map_err(network)?;
        info!("connected to authority at {}", self.server_addr);
        *current = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn call(&self, request: AuthorityRequest) -> Result<AuthorityResponse, TransportError> {
        let conn = self.connection().await?;
        let (mut send, mut recv) = conn.open_bi().await.map_err(network)?;
        let data = bincode::serialize(&request)?;
        send.write_all(&data).await.map_err(network)?;
        send.finish().map_err(network)?;
        let buf = recv.read_to_end(MAX_MESSAGE_BYTES).await.map_err(network)?;
        Ok(bincode::deserialize(&buf)?)
    }
}

/// Bind the authority's QUIC endpoint.
pub fn make_server_endpoint(bind_addr: SocketAddr) -> Result<Endpoint> {
    init_crypto();
    let server_config = configure_server()?;
    let endpoint = Endpoint::server(server_config, bind_addr)?;
    Ok(endpoint)
}

/// Self-signed certificate for `localhost`.
fn configure_server() -> Result<ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let cert_der = CertificateDer::from(cert.serialize_der()?);
    let key = PrivatePkcs8KeyDer::from(cert.serialize_private_key_der());
    let server_config = ServerConfig::with_single_cert(vec![cert_der], PrivateKeyDer::Pkcs8(key))?;
    Ok(server_config)
}

pub async fn serve(addr: SocketAddr, authority: Arc<Authority>) -> Result<()> {
    let endpoint = make_server_endpoint(addr)?;
    info!("authority listening on {}", endpoint.local_addr()?);
    serve_endpoint(endpoint, authority).await
}

/// Accept connections until the endpoint is closed.
pub async fn serve_endpoint(endpoint: Endpoint, authority: Arc<Authority>) -> Result<()> {
    while let Some(incoming) = endpoint.accept().await {
        let authority = authority.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(conn) => {
                    let remote = conn.remote_address();
                    info!(%remote, "connection accepted");
                    if let Err(e) = handle_connection(conn, authority).await {
                        warn!(%remote, "connection ended with error: {e:#}");
                    }
                }
                Err(e) => warn!("failed to establish connection: {e}"),
            }
        });
    }
    Ok(())
}

async fn handle_connection(conn: Connection, authority: Arc<Authority>) -> Result<()> {
    // transfers opened through this connection and not yet retired
    let owned: Arc<Mutex<HashSet<TransferId>>> = Arc::default();

    let outcome = loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let authority = authority.clone();
                let owned = owned.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_call(&authority, &owned, send, recv).await {
                        warn!("call failed: {e:#}");
                    }
                });
            }
            Err(ConnectionError::ApplicationClosed(_))
            | Err(ConnectionError::LocallyClosed)
            | Err(ConnectionError::TimedOut) => break Ok(()),
            Err(e) => break Err(e.into()),
        }
    };

    let leftovers: Vec<TransferId> = lock(&owned).drain().collect();
    for transfer in leftovers {
        debug!(transfer, "aborting transfer left open by closed connection");
        if let Err(e) = authority.close_transfer(transfer).await {
            debug!(transfer, "transfer already gone: {e}");
        }
    }
    outcome
}

async fn handle_call(
    authority: &Authority,
    owned: &Mutex<HashSet<TransferId>>,
    mut send: SendStream,
    mut recv: RecvStream,
) -> Result<()> {
    let buf = recv.read_to_end(MAX_MESSAGE_BYTES).await?;
    let request: AuthorityRequest = bincode::deserialize(&buf)?;
    let retired = request.retires_transfer();
    let response = authority.handle(request).await;
    {
        let mut owned = lock(owned);
        if let Some(id) = retired {
            owned.remove(&id);
        }
        if let Some(id) = response.opened_transfer() {
            owned.insert(id);
        }
    }
    let data = bincode::serialize(&response)?;
    send.write_all(&data).await?;
    send.finish()?;
    Ok(())
}
