//! TLS upgrade of an established connection.
//!
//! The upgrade happens in the middle of the handshake:
//!
//! 1. the server greeting advertises `CLIENT_SSL`;
//! 2. the client answers with a short SSL request (the first 32 bytes of a
//!    handshake response) in sequence 1;
//! 3. both sides run the TLS handshake on the raw socket;
//! 4. the full handshake response and the auth exchange continue inside
//!    TLS, with the packet sequence carrying on from step 2.
//!
//! The rustls implementation is behind the `tls` feature. Without it every
//! upgrade attempt fails with an SSL connection error.

use s2wire_core::Error;
use s2wire_core::error::{ConnectionError, ConnectionErrorKind};

use crate::config::{SslMode, TlsConfig};
use crate::protocol::framer::Transport;
use crate::protocol::{PacketWriter, capabilities};

/// Payload of the SSL request packet.
///
/// The extended capability bits travel in the last four bytes of the
/// reserved area.
pub fn ssl_request_payload(client_caps: u64, max_packet_size: u32, charset: u8) -> Vec<u8> {
    let caps = client_caps | capabilities::CLIENT_SSL;
    let mut w = PacketWriter::with_capacity(32);
    w.write_u32_le(caps as u32);
    w.write_u32_le(max_packet_size);
    w.write_u8(charset);
    w.write_zeros(19);
    w.write_u32_le((caps >> 32) as u32);
    w.into_bytes()
}

/// Decide whether to upgrade, given what the server offers.
pub fn should_upgrade(ssl_mode: SslMode, server_caps: u64) -> Result<bool, Error> {
    let offered = server_caps & capabilities::CLIENT_SSL != 0;
    match ssl_mode {
        SslMode::Disable => Ok(false),
        SslMode::Preferred => Ok(offered),
        _ if offered => Ok(true),
        _ => Err(tls_error("server does not support TLS but ssl_mode requires it")),
    }
}

/// Check that the certificate settings can satisfy the mode.
pub fn validate(ssl_mode: SslMode, tls: &TlsConfig) -> Result<(), Error> {
    if tls.client_cert_path.is_some() != tls.client_key_path.is_some() {
        return Err(tls_error(
            "client certificate and key must both be set for mutual TLS",
        ));
    }
    if matches!(ssl_mode, SslMode::VerifyCa | SslMode::VerifyIdentity)
        && tls.ca_cert_path.is_none()
        && !tls.danger_skip_verify
    {
        return Err(tls_error(
            "certificate verification needs ca_cert_path (or danger_skip_verify)",
        ));
    }
    Ok(())
}

pub(crate) fn tls_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: message.into(),
        source: None,
    })
}

/// Wrap a connected transport in TLS and complete the handshake.
#[cfg(feature = "tls")]
pub fn upgrade(
    stream: Box<dyn Transport>,
    tls: &TlsConfig,
    host: &str,
    ssl_mode: SslMode,
) -> Result<Box<dyn Transport>, Error> {
    let stream = rustls_impl::TlsStream::connect(stream, tls, host, ssl_mode)?;
    tracing::debug!(host, version = ?stream.protocol_version(), "TLS established");
    Ok(Box::new(stream))
}

#[cfg(not(feature = "tls"))]
pub fn upgrade(
    _stream: Box<dyn Transport>,
    _tls: &TlsConfig,
    _host: &str,
    _ssl_mode: SslMode,
) -> Result<Box<dyn Transport>, Error> {
    Err(tls_error(
        "TLS requested but s2wire was built without the `tls` feature",
    ))
}

#[cfg(feature = "tls")]
mod rustls_impl {
    use std::fs::File;
    use std::io::{self, BufReader, Read, Write};
    use std::path::Path;
    use std::sync::Arc;

    use rustls::client::WantsClientCert;
    use rustls::pki_types::{CertificateDer, ServerName};
    use rustls::{ClientConfig, ClientConnection, ConfigBuilder, RootCertStore};
    use s2wire_core::Error;

    use super::tls_error;
    use crate::config::{SslMode, TlsConfig};
    use crate::protocol::framer::Transport;

    pub(super) struct TlsStream {
        conn: ClientConnection,
        stream: Box<dyn Transport>,
    }

    impl TlsStream {
        pub(super) fn connect(
            mut stream: Box<dyn Transport>,
            tls: &TlsConfig,
            host: &str,
            ssl_mode: SslMode,
        ) -> Result<Self, Error> {
            let config = client_config(tls, ssl_mode)?;
            let name = tls.server_name.as_deref().unwrap_or(host);
            let server_name = ServerName::try_from(name.to_string())
                .map_err(|e| tls_error(format!("invalid TLS server name '{}': {}", name, e)))?;
            let mut conn = ClientConnection::new(Arc::new(config), server_name)
                .map_err(|e| tls_error(format!("TLS setup failed: {}", e)))?;

            while conn.is_handshaking() {
                conn.complete_io(&mut stream)
                    .map_err(|e| tls_error(format!("TLS handshake failed: {}", e)))?;
            }
            Ok(Self { conn, stream })
        }

        pub(super) fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
            self.conn.protocol_version()
        }

        fn flush_tls(&mut self) -> io::Result<()> {
            while self.conn.wants_write() {
                self.conn.write_tls(&mut self.stream)?;
            }
            Ok(())
        }
    }

    impl Read for TlsStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                match self.conn.reader().read(buf) {
                    Ok(n) if n > 0 => return Ok(n),
                    Ok(_) => return Ok(0),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
                if self.conn.read_tls(&mut self.stream)? == 0 {
                    return Ok(0);
                }
                self.conn
                    .process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
        }
    }

    impl Write for TlsStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self.conn.writer().write(buf)?;
            self.flush_tls()?;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.conn.writer().flush()?;
            self.flush_tls()?;
            self.stream.flush()
        }
    }

    fn client_config(tls: &TlsConfig, ssl_mode: SslMode) -> Result<ClientConfig, Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .map_err(|e| tls_error(format!("unsupported TLS versions: {}", e)))?;

        // Preferred and Required encrypt without insisting on a trusted chain.
        let skip = tls.danger_skip_verify
            || (matches!(ssl_mode, SslMode::Preferred | SslMode::Required)
                && tls.ca_cert_path.is_none());
        if skip {
            let builder = builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::AcceptAny));
            return with_client_auth(builder, tls);
        }

        let mut roots = RootCertStore::empty();
        match &tls.ca_cert_path {
            Some(path) => {
                for cert in load_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|e| tls_error(format!("bad CA certificate: {}", e)))?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        with_client_auth(builder.with_root_certificates(roots), tls)
    }

    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
        let file = File::open(path)
            .map_err(|e| tls_error(format!("cannot open '{}': {}", path.display(), e)))?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| tls_error(format!("cannot parse '{}': {}", path.display(), e)))?;
        if certs.is_empty() {
            return Err(tls_error(format!("no certificates in '{}'", path.display())));
        }
        Ok(certs)
    }

    fn with_client_auth(
        builder: ConfigBuilder<ClientConfig, WantsClientCert>,
        tls: &TlsConfig,
    ) -> Result<ClientConfig, Error> {
        let (Some(cert_path), Some(key_path)) = (&tls.client_cert_path, &tls.client_key_path)
        else {
            return Ok(builder.with_no_client_auth());
        };
        let certs = load_certs(cert_path)?;
        let file = File::open(key_path)
            .map_err(|e| tls_error(format!("cannot open '{}': {}", key_path.display(), e)))?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(file))
            .map_err(|e| tls_error(format!("cannot parse '{}': {}", key_path.display(), e)))?
            .ok_or_else(|| tls_error(format!("no private key in '{}'", key_path.display())))?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| tls_error(format!("client certificate rejected: {}", e)))
    }

    mod danger {
        use rustls::client::danger::{
            HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
        };
        use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
        use rustls::{DigitallySignedStruct, SignatureScheme};

        /// Accepts every server certificate.
        #[derive(Debug)]
        pub(super) struct AcceptAny;

        impl ServerCertVerifier for AcceptAny {
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
                rustls::crypto::ring::default_provider()
                    .signature_verification_algorithms
                    .supported_schemes()
            }
        }
    }
}
