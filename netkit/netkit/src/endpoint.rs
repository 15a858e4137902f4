// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Endpoints name where a service listens or dials: host, port, transport
//! kind and an optional TLS configuration. An endpoint is immutable once
//! constructed.

use crate::{Error, Result};
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    server::AllowAnyAuthenticatedClient,
    Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName,
};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Stream,
    Datagram,
}

/// TLS behavior attached to an endpoint.
///
/// Certificate provisioning stays outside the toolkit; these variants only
/// point at PEM files prepared by the operator.
#[derive(Clone, Debug, Default)]
pub enum TlsConfig {
    #[default]
    None,
    Server {
        cert: PathBuf,
        key: PathBuf,
        ca: Option<PathBuf>,
        require_client_cert: bool,
    },
    Client {
        ca: Option<PathBuf>,
        cert: Option<PathBuf>,
        key: Option<PathBuf>,
        verify: bool,
    },
}

impl TlsConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::None)
    }
}

#[derive(Clone, Debug)]
pub struct Endpoint {
    host: String,
    port: u16,
    kind: TransportKind,
    tls: TlsConfig,
}

impl Endpoint {
    pub fn stream(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            kind: TransportKind::Stream,
            tls: TlsConfig::None,
        }
    }

    pub fn datagram(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            kind: TransportKind::Datagram,
            tls: TlsConfig::None,
        }
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn tls(&self) -> &TlsConfig {
        &self.tls
    }

    /// `host:port` form accepted by the tokio binders and dialers
    pub fn addr(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    /// Builds the acceptor for a TLS server endpoint
    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        let TlsConfig::Server {
            cert,
            key,
            ca,
            require_client_cert,
        } = &self.tls
        else {
            return Ok(None);
        };

        let certs = load_certs(cert)?;
        let key = load_key(key)?;

        let builder = ServerConfig::builder().with_safe_defaults();
        let builder = if *require_client_cert {
            let ca = ca
                .as_deref()
                .ok_or_else(|| Error::Tls("client cert verification requires a CA file".into()))?;
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots
                    .add(&cert)
                    .map_err(|error| Error::Tls(error.to_string()))?;
            }
            builder.with_client_cert_verifier(Arc::new(AllowAnyAuthenticatedClient::new(roots)))
        } else {
            builder.with_no_client_auth()
        };

        let config = builder
            .with_single_cert(certs, key)
            .map_err(|error| Error::Tls(error.to_string()))?;

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }

    /// Builds the connector and server name for a TLS client endpoint
    pub fn tls_connector(&self) -> Result<Option<(TlsConnector, ServerName)>> {
        let TlsConfig::Client {
            ca,
            cert,
            key,
            verify,
        } = &self.tls
        else {
            return Ok(None);
        };

        let builder = ClientConfig::builder().with_safe_defaults();

        let config = if *verify {
            let mut roots = RootCertStore::empty();
            if let Some(ca) = ca {
                for cert in load_certs(ca)? {
                    roots
                        .add(&cert)
                        .map_err(|error| Error::Tls(error.to_string()))?;
                }
            }
            let builder = builder.with_root_certificates(roots);
            match (cert, key) {
                (Some(cert), Some(key)) => builder
                    .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                    .map_err(|error| Error::Tls(error.to_string()))?,
                (None, None) => builder.with_no_client_auth(),
                _ => {
                    return Err(Error::Tls(
                        "client auth requires both a certificate and a key".into(),
                    ))
                }
            }
        } else {
            let builder = builder.with_custom_certificate_verifier(Arc::new(NoVerify));
            match (cert, key) {
                (Some(cert), Some(key)) => builder
                    .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                    .map_err(|error| Error::Tls(error.to_string()))?,
                (None, None) => builder.with_no_client_auth(),
                _ => {
                    return Err(Error::Tls(
                        "client auth requires both a certificate and a key".into(),
                    ))
                }
            }
        };

        let name = ServerName::try_from(self.host.as_str())
            .map_err(|error| Error::Tls(error.to_string()))?;

        Ok(Some((TlsConnector::from(Arc::new(config)), name)))
    }
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> Result<PrivateKey> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    while let Some(item) = rustls_pemfile::read_one(&mut reader)? {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(PrivateKey(key)),
            _ => continue,
        }
    }

    Err(Error::Tls(format!(
        "no private key found in {}",
        path.display()
    )))
}

/// Accepts any server certificate; selected with `verify = false`
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_accessors() {
        let endpoint = Endpoint::stream("example.com", 9000);
        assert_eq!(endpoint.host(), "example.com");
        assert_eq!(endpoint.port(), 9000);
        assert_eq!(endpoint.kind(), TransportKind::Stream);
        assert!(!endpoint.tls().is_enabled());
    }

    #[test]
    fn plain_endpoint_has_no_tls_machinery() {
        let endpoint = Endpoint::stream("localhost", 1);
        assert!(endpoint.tls_acceptor().unwrap().is_none());
        assert!(endpoint.tls_connector().unwrap().is_none());
    }

    #[test]
    fn server_acceptor_with_required_client_cert() {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();

        let cert_path = dir.path().join("server.pem");
        let key_path = dir.path().join("server.key");
        let ca_path = dir.path().join("ca.pem");
        std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
        std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();
        std::fs::write(&ca_path, cert.serialize_pem().unwrap()).unwrap();

        let endpoint = Endpoint::stream("localhost", 1).with_tls(TlsConfig::Server {
            cert: cert_path,
            key: key_path,
            ca: Some(ca_path),
            require_client_cert: true,
        });
        assert!(endpoint.tls_acceptor().unwrap().is_some());
    }

    #[test]
    fn require_client_cert_without_ca_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();

        let cert_path = dir.path().join("server.pem");
        let key_path = dir.path().join("server.key");
        std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
        std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

        let endpoint = Endpoint::stream("localhost", 1).with_tls(TlsConfig::Server {
            cert: cert_path,
            key: key_path,
            ca: None,
            require_client_cert: true,
        });
        assert!(matches!(
            endpoint.tls_acceptor(),
            Err(Error::Tls(message)) if message.contains("CA")
        ));
    }

    #[test]
    fn client_auth_needs_cert_and_key() {
        let endpoint = Endpoint::stream("localhost", 1).with_tls(TlsConfig::Client {
            ca: None,
            cert: Some("client.pem".into()),
            key: None,
            verify: false,
        });
        assert!(matches!(
            endpoint.tls_connector(),
            Err(Error::Tls(message)) if message.contains("both")
        ));
    }
}
