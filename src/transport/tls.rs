//! TLS for the session layer and the `wss` transport.
//!
//! When a pre-shared key is configured, both peers derive the same CA and
//! leaf material from it: HKDF-SHA256 stretches the key into Ed25519 seeds,
//! the seeded keypairs feed certificate construction with fixed names,
//! serials, and validity, and each side then requires the other's leaf to
//! chain to the derived CA. The key never crosses the wire; possession is
//! proven by the TLS handshake itself.
//!
//! Without a key, the listener presents an ephemeral self-signed
//! certificate and the dialer accepts whatever it is shown: encryption
//! without authentication.

use {
    ed25519_dalek::pkcs8::EncodePrivateKey,
    rcgen::{
        generate_simple_self_signed, BasicConstraints, CertificateParams, DistinguishedName,
        DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
    },
    ring::hkdf,
    rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::CryptoProvider,
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
        server::WebPkiClientVerifier,
        ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
    },
    std::{
        io,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
    },
    thiserror::Error,
    tokio::io::{AsyncRead, AsyncWrite, ReadBuf},
    tokio_rustls::{TlsAcceptor, TlsConnector},
};

use crate::{
    config::SessionConfig,
    defaults,
    transport::{Conn, TransportError},
};

/// The DNS name carried in derived and ephemeral certificates, and the
/// server name a keyed dialer requests. Both peers hold the same leaf, so
/// the name is a constant rather than anything address-derived.
const PEER_NAME: &str = "zeekat";

const HKDF_SALT: &[u8] = b"zeekat keyed tls v1";
const CA_INFO: &[u8] = b"derived ca";
const LEAF_INFO: &[u8] = b"derived leaf";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsError {
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("certificate construction failed: {0}")]
    Certificate(#[from] rcgen::Error),
    #[error("invalid server name `{0}`")]
    InvalidServerName(String),
    #[error("client certificate verifier: {0}")]
    Verifier(rustls::server::VerifierBuilderError),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Certificates and the leaf private key shared by both keyed peers.
struct Identity {
    ca: CertificateDer<'static>,
    leaf_chain: Vec<CertificateDer<'static>>,
    leaf_key: PrivateKeyDer<'static>,
}

struct SeedLen;

impl hkdf::KeyType for SeedLen {
    fn len(&self) -> usize {
        32
    }
}

fn hkdf_seed(key: &str, info: &[u8]) -> Result<[u8; 32], TlsError> {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, HKDF_SALT);
    let prk = salt.extract(key.as_bytes());
    let info_slice = [info];
    let okm = prk
        .expand(&info_slice, SeedLen)
        .map_err(|_| TlsError::KeyDerivation)?;
    let mut seed = [0u8; 32];
    okm.fill(&mut seed).map_err(|_| TlsError::KeyDerivation)?;
    Ok(seed)
}

/// An Ed25519 keypair every holder of `key` can reproduce.
fn derived_keypair(key: &str, info: &[u8]) -> Result<KeyPair, TlsError> {
    let seed = hkdf_seed(key, info)?;
    let signing_key = ed25519_dalek::SigningKey::from_bytes(&seed);
    let document = signing_key
        .to_pkcs8_der()
        .map_err(|_| TlsError::KeyDerivation)?;
    Ok(KeyPair::try_from(document.as_bytes())?)
}

/// Fixed validity window; certificate fields must not depend on the clock
/// or either peer's environment.
fn fixed_validity(params: &mut CertificateParams) {
    params.not_before = rcgen::date_time_ymd(2000, 1, 1);
    params.not_after = rcgen::date_time_ymd(2999, 12, 31);
}

fn derive_identity(key: &str) -> Result<Identity, TlsError> {
    let ca_key = derived_keypair(key, CA_INFO)?;
    let leaf_key = derived_keypair(key, LEAF_INFO)?;

    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.distinguished_name = DistinguishedName::new();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "zeekat derived ca");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    ca_params.serial_number = Some(SerialNumber::from(vec![0x01]));
    fixed_validity(&mut ca_params);
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let mut leaf_params = CertificateParams::new(vec![PEER_NAME.to_string()])?;
    leaf_params.distinguished_name = DistinguishedName::new();
    leaf_params
        .distinguished_name
        .push(DnType::CommonName, PEER_NAME);
    leaf_params.use_authority_key_identifier_extension = true;
    leaf_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    leaf_params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    leaf_params.serial_number = Some(SerialNumber::from(vec![0x02]));
    fixed_validity(&mut leaf_params);
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key)?;

    Ok(Identity {
        ca: ca_cert.der().clone(),
        leaf_chain: vec![leaf_cert.der().clone()],
        leaf_key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
    })
}

fn derived_roots(ca: CertificateDer<'static>) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    roots.add(ca)?;
    Ok(roots)
}

/// Server config requiring a client certificate chained to the derived CA.
pub fn keyed_server_config(key: &str) -> Result<ServerConfig, TlsError> {
    let identity = derive_identity(key)?;
    let roots = derived_roots(identity.ca)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(TlsError::Verifier)?;
    Ok(ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.leaf_chain, identity.leaf_key)?)
}

/// Client config trusting only the derived CA and presenting the derived
/// leaf for mutual authentication.
pub fn keyed_client_config(key: &str) -> Result<ClientConfig, TlsError> {
    let identity = derive_identity(key)?;
    let roots = derived_roots(identity.ca)?;
    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(identity.leaf_chain, identity.leaf_key)?)
}

/// Server config with a freshly generated self-signed certificate, for
/// keyless `--ssl` sessions and the transport layer of `wss` listeners.
pub fn ephemeral_server_config() -> Result<ServerConfig, TlsError> {
    let certified = generate_simple_self_signed(vec![PEER_NAME.to_string()])?;
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    Ok(ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?)
}

/// Client config that accepts any certificate: encryption without
/// authentication, for keyless `--ssl` sessions and `wss` dialing.
pub fn insecure_client_config() -> ClientConfig {
    let provider = rustls::crypto::ring::default_provider();
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
        .with_no_client_auth()
}

/// Accepts every presented certificate while still checking handshake
/// signatures, so the connection is encrypted but the peer is unproven.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: CryptoProvider,
}

impl ServerCertVerifier for AcceptAnyCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// A transport connection after the optional session TLS layer.
pub enum SecureConn {
    Plain(Conn),
    Client(Box<tokio_rustls::client::TlsStream<Conn>>),
    Server(Box<tokio_rustls::server::TlsStream<Conn>>),
}

impl AsyncRead for SecureConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureConn::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SecureConn::Client(stream) => Pin::new(stream).poll_read(cx, buf),
            SecureConn::Server(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SecureConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SecureConn::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SecureConn::Client(stream) => Pin::new(stream).poll_write(cx, buf),
            SecureConn::Server(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureConn::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SecureConn::Client(stream) => Pin::new(stream).poll_flush(cx),
            SecureConn::Server(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureConn::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SecureConn::Client(stream) => Pin::new(stream).poll_shutdown(cx),
            SecureConn::Server(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Apply the dialer's side of the session TLS layer, if configured.
pub async fn secure_dialer(conn: Conn, config: &SessionConfig) -> Result<SecureConn, TransportError> {
    if !config.ssl {
        return Ok(SecureConn::Plain(conn));
    }
    let (client_config, server_name) = if config.keyed() {
        let name = ServerName::try_from(PEER_NAME).expect("constant server name is valid");
        (keyed_client_config(&config.key)?, name)
    } else {
        let name = ServerName::try_from(config.host.clone())
            .map_err(|_| TlsError::InvalidServerName(config.host.clone()))?;
        (insecure_client_config(), name)
    };
    let connector = TlsConnector::from(Arc::new(client_config));
    let stream = tokio::time::timeout(
        defaults::tls_handshake_timeout(),
        connector.connect(server_name, conn),
    )
    .await
    .map_err(|_| TransportError::HandshakeTimeout)??;
    Ok(SecureConn::Client(Box::new(stream)))
}

/// Apply the listener's side of the session TLS layer, if configured.
pub async fn secure_listener(
    conn: Conn,
    config: &SessionConfig,
) -> Result<SecureConn, TransportError> {
    if !config.ssl {
        return Ok(SecureConn::Plain(conn));
    }
    let server_config = if config.keyed() {
        keyed_server_config(&config.key)?
    } else {
        ephemeral_server_config()?
    };
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let stream = accept_with_timeout(&acceptor, conn).await?;
    Ok(SecureConn::Server(Box::new(stream)))
}

/// TLS-accept with the handshake deadline applied.
pub(crate) async fn accept_with_timeout<IO>(
    acceptor: &TlsAcceptor,
    stream: IO,
) -> Result<tokio_rustls::server::TlsStream<IO>, TransportError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(defaults::tls_handshake_timeout(), acceptor.accept(stream))
        .await
        .map_err(|_| TransportError::HandshakeTimeout)?
        .map_err(TransportError::Io)
}

/// Anonymous TLS dial for the transport layer of `wss`.
pub(crate) async fn connect_insecure<IO>(
    stream: IO,
    host: &str,
) -> Result<tokio_rustls::client::TlsStream<IO>, TransportError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let name = ServerName::try_from(host.to_string())
        .map_err(|_| TlsError::InvalidServerName(host.to_string()))?;
    let connector = TlsConnector::from(Arc::new(insecure_client_config()));
    tokio::time::timeout(
        defaults::tls_handshake_timeout(),
        connector.connect(name, stream),
    )
    .await
    .map_err(|_| TransportError::HandshakeTimeout)?
    .map_err(TransportError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn keyed_pair(
        server_key: &str,
        client_key: &str,
    ) -> (TlsAcceptor, TlsConnector, ServerName<'static>) {
        let acceptor = TlsAcceptor::from(Arc::new(keyed_server_config(server_key).unwrap()));
        let connector = TlsConnector::from(Arc::new(keyed_client_config(client_key).unwrap()));
        let name = ServerName::try_from(PEER_NAME).unwrap();
        (acceptor, connector, name)
    }

    #[test]
    fn derivation_is_deterministic_per_key() {
        let first = derive_identity("secret").unwrap();
        let second = derive_identity("secret").unwrap();
        assert_eq!(first.ca, second.ca);
        assert_eq!(first.leaf_chain, second.leaf_chain);

        let other = derive_identity("different").unwrap();
        assert_ne!(first.ca, other.ca);
    }

    #[tokio::test]
    async fn matching_keys_handshake_and_carry_bytes() {
        let (acceptor, connector, name) = keyed_pair("secret", "secret");
        let (client_end, server_end) = tokio::io::duplex(16 * 1024);

        let server = async move {
            let mut stream = acceptor.accept(server_end).await.unwrap();
            let mut greeting = [0u8; 5];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(&greeting, b"hello");
            stream.write_all(b"hi").await.unwrap();
            stream.flush().await.unwrap();
        };
        let client = async move {
            let mut stream = connector.connect(name, client_end).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
            stream.flush().await.unwrap();
            let mut reply = [0u8; 2];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"hi");
        };
        tokio::join!(server, client);
    }

    #[tokio::test]
    async fn mismatched_keys_fail_before_any_bytes() {
        let (acceptor, connector, name) = keyed_pair("secret", "not-the-secret");
        let (client_end, server_end) = tokio::io::duplex(16 * 1024);

        let server = async move { acceptor.accept(server_end).await };
        let client = async move { connector.connect(name, client_end).await };
        let (server_result, client_result) = tokio::join!(server, client);
        assert!(server_result.is_err() || client_result.is_err());
    }

    #[tokio::test]
    async fn anonymous_dialer_accepts_ephemeral_listener() {
        let acceptor = TlsAcceptor::from(Arc::new(ephemeral_server_config().unwrap()));
        let connector = TlsConnector::from(Arc::new(insecure_client_config()));
        let name = ServerName::try_from("whatever.invalid").unwrap();
        let (client_end, server_end) = tokio::io::duplex(16 * 1024);

        let server = async move {
            let mut stream = acceptor.accept(server_end).await.unwrap();
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).await.unwrap();
            assert_eq!(byte[0], 0x2a);
        };
        let client = async move {
            let mut stream = connector.connect(name, client_end).await.unwrap();
            stream.write_all(&[0x2a]).await.unwrap();
            stream.flush().await.unwrap();
        };
        tokio::join!(server, client);
    }
}
