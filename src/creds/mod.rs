//! Agent credentials: the CA and endpoint key-pairs behind mutually
//! authenticated agent RPC.
//!
//! An archive is minted as a unit and rotated as a unit. The server
//! certificate lists every participating host; the client certificate is
//! signed by the same CA. Archives are stored in the cluster package store
//! under `<cluster>/agent-credentials:<version>`.

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
};
use serde::{Deserialize, Serialize};
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::errors::{GravityError, Result};
use crate::ops::Locator;

/// Package name holding the archive for a cluster.
pub const CREDENTIALS_PACKAGE: &str = "agent-credentials";

/// How long a freshly minted archive stays valid.
pub const DEFAULT_VALIDITY_DAYS: i64 = 365;

/// PEM-encoded certificate plus private key for one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointPem {
    pub cert: String,
    pub key: String,
}

/// The rotation unit: CA plus server and client endpoint pairs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialsArchive {
    pub cluster: String,
    /// Every host identity the server certificate covers.
    pub hosts: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(rename = "CA")]
    pub ca_cert: String,
    #[serde(rename = "Server")]
    pub server: EndpointPem,
    #[serde(rename = "Client")]
    pub client: EndpointPem,
}

impl CredentialsArchive {
    /// Mint a fresh CA and endpoint pairs for the named cluster and hosts.
    pub fn mint(cluster: &str, hosts: &[String]) -> Result<Self> {
        let ca_key = KeyPair::generate().map_err(generation_error)?;
        let mut ca_params = CertificateParams::new(Vec::new()).map_err(generation_error)?;
        let mut ca_dn = DistinguishedName::new();
        ca_dn.push(DnType::CommonName, format!("{cluster} agents CA"));
        ca_params.distinguished_name = ca_dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).map_err(generation_error)?;

        let server_key = KeyPair::generate().map_err(generation_error)?;
        let mut server_params =
            CertificateParams::new(hosts.to_vec()).map_err(generation_error)?;
        let mut server_dn = DistinguishedName::new();
        server_dn.push(DnType::CommonName, format!("{cluster} agent"));
        server_params.distinguished_name = server_dn;
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .map_err(generation_error)?;

        let client_key = KeyPair::generate().map_err(generation_error)?;
        let mut client_params = CertificateParams::new(Vec::new()).map_err(generation_error)?;
        let mut client_dn = DistinguishedName::new();
        client_dn.push(DnType::CommonName, format!("{cluster} driver"));
        client_params.distinguished_name = client_dn;
        let client_cert = client_params
            .signed_by(&client_key, &ca_cert, &ca_key)
            .map_err(generation_error)?;

        let issued_at = Utc::now();
        Ok(Self {
            cluster: cluster.to_string(),
            hosts: hosts.to_vec(),
            issued_at,
            expires_at: issued_at + Duration::days(DEFAULT_VALIDITY_DAYS),
            ca_cert: ca_cert.pem(),
            server: EndpointPem {
                cert: server_cert.pem(),
                key: server_key.serialize_pem(),
            },
            client: EndpointPem {
                cert: client_cert.pem(),
                key: client_key.serialize_pem(),
            },
        })
    }

    /// Refuse to use an archive outside its validity window. The agent
    /// calls this on startup and reports the failure through its status.
    pub fn check_validity(&self, now: DateTime<Utc>) -> Result<()> {
        if now < self.issued_at {
            return Err(GravityError::AccessDenied(format!(
                "credentials for cluster {} are not yet valid (issued {})",
                self.cluster, self.issued_at
            )));
        }
        if now >= self.expires_at {
            return Err(GravityError::AccessDenied(format!(
                "credentials for cluster {} expired {}; redeploy agents to rotate",
                self.cluster, self.expires_at
            )));
        }
        Ok(())
    }

    /// True when the archive covers the same cluster and host set, which is
    /// what lets a repeated deployment reuse the stored package.
    pub fn covers(&self, cluster: &str, hosts: &[String]) -> bool {
        if self.cluster != cluster {
            return false;
        }
        let mut mine = self.hosts.clone();
        let mut theirs = hosts.to_vec();
        mine.sort();
        theirs.sort();
        mine == theirs
    }

    /// Locator of the archive package for a cluster at a version.
    pub fn locator(cluster: &str, version: semver::Version) -> Locator {
        Locator::new(cluster, CREDENTIALS_PACKAGE, version)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// TLS configuration for the agent listener: present the server
    /// identity, require client certificates signed by the archive CA.
    pub fn server_tls(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(Identity::from_pem(&self.server.cert, &self.server.key))
            .client_ca_root(Certificate::from_pem(&self.ca_cert))
    }

    /// TLS configuration for the driver side: pin the archive CA and
    /// present the client identity.
    pub fn client_tls(&self, server_name: &str) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(&self.ca_cert))
            .identity(Identity::from_pem(&self.client.cert, &self.client.key))
            .domain_name(server_name)
    }
}

fn generation_error(err: rcgen::Error) -> GravityError {
    GravityError::BadParameter(format!("failed to generate credentials: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> Vec<String> {
        vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()]
    }

    #[test]
    fn mint_produces_pem_bundle() {
        let archive = CredentialsArchive::mint("prod", &hosts()).unwrap();
        assert!(archive.ca_cert.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(archive.server.cert.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(archive.server.key.contains("PRIVATE KEY"));
        assert!(archive.client.cert.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(archive.hosts, hosts());
    }

    #[test]
    fn archive_round_trips_through_bytes() {
        let archive = CredentialsArchive::mint("prod", &hosts()).unwrap();
        let bytes = archive.to_bytes().unwrap();
        let back = CredentialsArchive::from_bytes(&bytes).unwrap();
        assert_eq!(back, archive);
    }

    #[test]
    fn serialized_form_uses_well_known_keys() {
        let archive = CredentialsArchive::mint("prod", &hosts()).unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&archive.to_bytes().unwrap()).unwrap();
        assert!(value.get("CA").is_some());
        assert!(value.get("Server").is_some());
        assert!(value.get("Client").is_some());
    }

    #[test]
    fn validity_window_is_enforced() {
        let archive = CredentialsArchive::mint("prod", &hosts()).unwrap();
        archive.check_validity(Utc::now()).unwrap();

        let expired = archive.expires_at + Duration::hours(1);
        let err = archive.check_validity(expired).unwrap_err();
        assert!(err.is_access_denied());
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn covers_matches_host_set_regardless_of_order() {
        let archive = CredentialsArchive::mint("prod", &hosts()).unwrap();
        let reversed: Vec<String> = hosts().into_iter().rev().collect();
        assert!(archive.covers("prod", &reversed));
        assert!(!archive.covers("staging", &hosts()));
        assert!(!archive.covers("prod", &["10.0.0.7".to_string()]));
    }

    #[test]
    fn fresh_mints_produce_distinct_material() {
        let one = CredentialsArchive::mint("prod", &hosts()).unwrap();
        let two = CredentialsArchive::mint("prod", &hosts()).unwrap();
        assert_ne!(one.ca_cert, two.ca_cert);
        assert_ne!(one.server.key, two.server.key);
    }
}
