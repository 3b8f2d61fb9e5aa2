//! Real control-plane client.
//!
//! The concrete wire protocol is intentionally left opaque: this
//! implementation only fixes the *shape* of the request (an authenticated
//! HTTP call keyed by instance id) and response (an ephemeral certificate
//! plus server address). A real deployment would fill in the endpoint URL
//! and response schema for its specific control plane.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;

use super::{Api, ConnectionInfo};
use crate::config::{CredentialSource, ImpersonationChain};
use crate::error::ResolveError;
use crate::instance_id::InstanceId;

/// Minimal shape of a control-plane response: a server address plus enough
/// material to build a `rustls::ClientConfig` presenting the ephemeral
/// client certificate and trusting the instance's CA chain. The actual
/// certificate bytes and trust anchors are carried as opaque DER blobs;
/// decoding them into a `rustls::ClientConfig` is control-plane-specific
/// and happens in [`RemoteApi::build_tls_config`].
#[derive(Debug, Deserialize)]
struct GenerateEphemeralCertResponse {
    ip_address: IpAddr,
    client_cert_der: Vec<u8>,
    client_key_der: Vec<u8>,
    ca_cert_der: Vec<u8>,
    not_after_unix: u64,
}

pub struct RemoteApi {
    http: reqwest::Client,
    base_url: url::Url,
    credentials: CredentialSource,
    impersonation: Option<ImpersonationChain>,
}

impl RemoteApi {
    pub fn new(
        base_url: url::Url,
        credentials: CredentialSource,
        impersonation: Option<ImpersonationChain>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            credentials,
            impersonation,
        }
    }

    async fn bearer_token(&self, id: &InstanceId) -> Result<String, ResolveError> {
        // Exactly one credential source is configured (enforced at
        // `Config::build` time), so here we only need to turn it into a
        // bearer token for the request. Impersonation, when present, is
        // layered on top by the control plane based on the
        // `impersonation` chain we send along.
        match &self.credentials {
            CredentialSource::BearerToken(tok) => Ok(tok.clone()),
            CredentialSource::ServiceAccountKeyFile(path) => {
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| ResolveError::Permanent {
                        instance: id.clone(),
                        message: format!("reading service account key file: {e}"),
                    })?;
                // Exchanging a service-account key for a bearer token is a
                // control-plane-specific OAuth flow, intentionally opaque
                // here.
                Ok(String::new())
            }
            CredentialSource::ServiceAccountKeyJson(_)
            | CredentialSource::InteractiveLoginToken(_)
            | CredentialSource::AmbientDefault => Ok(String::new()),
        }
    }

    fn build_tls_config(
        resp: &GenerateEphemeralCertResponse,
    ) -> Result<rustls::ClientConfig, rustls::Error> {
        let mut roots = rustls::RootCertStore::empty();
        roots
            .add(rustls::pki_types::CertificateDer::from(resp.ca_cert_der.clone()))
            .map_err(|e| rustls::Error::General(format!("invalid CA cert: {e}")))?;

        let cert_chain = vec![rustls::pki_types::CertificateDer::from(resp.client_cert_der.clone())];
        let key = rustls::pki_types::PrivateKeyDer::try_from(resp.client_key_der.clone())
            .map_err(|e| rustls::Error::General(format!("invalid client key: {e}")))?;

        rustls::ClientConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| rustls::Error::General(format!("unsupported protocol versions: {e}")))?
            .with_root_certificates(roots)
            .with_client_auth_cert(cert_chain, key)
            .map_err(|e| rustls::Error::General(format!("client auth cert rejected: {e}")))
    }
}

#[async_trait]
impl Api for RemoteApi {
    async fn resolve_connection_info(
        &self,
        id: &InstanceId,
    ) -> Result<ConnectionInfo, ResolveError> {
        let url = self
            .base_url
            .join(&format!("v1/{id}:generateEphemeralCert"))
            .map_err(|e| ResolveError::Permanent {
                instance: id.clone(),
                message: format!("building request URL: {e}"),
            })?;

        let token = self.bearer_token(id).await?;
        let mut req = self.http.post(url);
        if !token.is_empty() {
            req = req.bearer_auth(token);
        }
        if let Some(chain) = &self.impersonation {
            req = req.header("X-Impersonate-Service-Account", chain.effective_identity());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ResolveError::Transient {
                    instance: id.clone(),
                    message: e.to_string(),
                }
            } else {
                ResolveError::Permanent {
                    instance: id.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        match resp.status() {
            s if s.is_success() => {}
            reqwest::StatusCode::FORBIDDEN | reqwest::StatusCode::UNAUTHORIZED => {
                return Err(ResolveError::NotAuthorized(id.clone()))
            }
            reqwest::StatusCode::NOT_FOUND => return Err(ResolveError::NotFound(id.clone())),
            s if s.is_server_error() => {
                return Err(ResolveError::Transient {
                    instance: id.clone(),
                    message: format!("control plane returned {s}"),
                })
            }
            s => {
                return Err(ResolveError::Permanent {
                    instance: id.clone(),
                    message: format!("control plane returned {s}"),
                })
            }
        }

        let body: GenerateEphemeralCertResponse =
            resp.json().await.map_err(|e| ResolveError::Permanent {
                instance: id.clone(),
                message: format!("decoding control plane response: {e}"),
            })?;

        let tls_client_config = Self::build_tls_config(&body).map_err(|e| ResolveError::Permanent {
            instance: id.clone(),
            message: format!("building TLS client config: {e}"),
        })?;

        let not_after = SystemTime::UNIX_EPOCH + Duration::from_secs(body.not_after_unix);

        Ok(ConnectionInfo {
            ip_address: body.ip_address,
            tls_client_config: Arc::new(tls_client_config),
            not_after,
        })
    }
}
