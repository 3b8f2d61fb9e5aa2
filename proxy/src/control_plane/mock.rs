//! In-memory control plane used by this crate's own tests and available to
//! downstream embedders under the `testing` feature.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Api, ConnectionInfo};
use crate::error::ResolveError;
use crate::instance_id::InstanceId;

#[derive(Clone)]
enum Script {
    Info(ConnectionInfo),
    Fail(MockFailure),
}

#[derive(Clone)]
pub enum MockFailure {
    NotAuthorized,
    NotFound,
    Transient(String),
    Permanent(String),
}

/// A `control_plane::Api` test double whose responses are pre-programmed
/// per instance, plus an invocation counter so tests can assert "dialer
/// called exactly once" style properties.
pub struct MockApi {
    scripts: Mutex<HashMap<InstanceId, Script>>,
    calls: Mutex<HashMap<InstanceId, u64>>,
}

impl Default for MockApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a [`ConnectionInfo`] valid for `ttl` starting now whenever
    /// `id` is resolved.
    pub fn set_ok(&self, id: InstanceId, ip_address: IpAddr, ttl: Duration) {
        let info = ConnectionInfo {
            ip_address,
            tls_client_config: Arc::new(test_client_config()),
            not_after: SystemTime::now() + ttl,
        };
        self.scripts.lock().insert(id, Script::Info(info));
    }

    pub fn set_failure(&self, id: InstanceId, failure: MockFailure) {
        self.scripts.lock().insert(id, Script::Fail(failure));
    }

    pub fn call_count(&self, id: &InstanceId) -> u64 {
        self.calls.lock().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Api for MockApi {
    async fn resolve_connection_info(
        &self,
        id: &InstanceId,
    ) -> Result<ConnectionInfo, ResolveError> {
        *self.calls.lock().entry(id.clone()).or_insert(0) += 1;

        match self.scripts.lock().get(id) {
            Some(Script::Info(info)) => Ok(info.clone()),
            Some(Script::Fail(MockFailure::NotAuthorized)) => {
                Err(ResolveError::NotAuthorized(id.clone()))
            }
            Some(Script::Fail(MockFailure::NotFound)) => Err(ResolveError::NotFound(id.clone())),
            Some(Script::Fail(MockFailure::Transient(msg))) => Err(ResolveError::Transient {
                instance: id.clone(),
                message: msg.clone(),
            }),
            Some(Script::Fail(MockFailure::Permanent(msg))) => Err(ResolveError::Permanent {
                instance: id.clone(),
                message: msg.clone(),
            }),
            None => Err(ResolveError::NotFound(id.clone())),
        }
    }
}

/// A TLS-1.3 client config with no certificate verification, suitable only
/// for wiring a `ConnectionInfo` together in tests.
fn test_client_config() -> rustls::ClientConfig {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .expect("TLS1.3 is supported by the ring provider")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth()
}

#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_call_count_and_replays_script() {
        let api = MockApi::new();
        let id = InstanceId::parse("projects/p/locations/r/clusters/c/instances/i").unwrap();
        api.set_ok(id.clone(), "10.0.0.1".parse().unwrap(), Duration::from_secs(60));

        let info1 = api.resolve_connection_info(&id).await.unwrap();
        let info2 = api.resolve_connection_info(&id).await.unwrap();

        assert_eq!(info1.ip_address, info2.ip_address);
        assert_eq!(api.call_count(&id), 2);
    }

    #[tokio::test]
    async fn unscripted_instance_is_not_found() {
        let api = MockApi::new();
        let id = InstanceId::parse("projects/p/locations/r/clusters/c/instances/missing").unwrap();
        let err = api.resolve_connection_info(&id).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }
}
