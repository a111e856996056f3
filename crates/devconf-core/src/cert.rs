// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use tracing::{error, info};
use uuid::Uuid;

use devconf_types::{Ca, CertUsage, Certificate, Vpn, VpnClient};

use crate::error::{CoreError, Result};
use crate::store::ConfigStore;

// ---------------------------------------------------------------------------
// Issuer contract
// ---------------------------------------------------------------------------

/// Subject of a certificate to issue. Everything but the names and the
/// usage is copied from the issuing CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectProfile {
    pub ca_id: Uuid,
    pub name: String,
    pub common_name: String,
    pub key_length: u32,
    pub digest: String,
    pub country_code: String,
    pub state: String,
    pub city: String,
    pub organization: String,
    pub email: String,
    pub usage: CertUsage,
}

impl SubjectProfile {
    pub fn from_ca(ca: &Ca, name: &str, common_name: &str, usage: CertUsage) -> Self {
        Self {
            ca_id: ca.id,
            name: name.to_string(),
            common_name: common_name.to_string(),
            key_length: ca.key_length,
            digest: ca.digest.clone(),
            country_code: ca.country_code.clone(),
            state: ca.state.clone(),
            city: ca.city.clone(),
            organization: ca.organization.clone(),
            email: ca.email.clone(),
            usage,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IssuanceError {
    #[error("CA {0} not found")]
    UnknownCa(Uuid),

    #[error("unsupported digest: {0}")]
    UnsupportedDigest(String),

    #[error("openssl error: {0}")]
    Openssl(#[from] openssl::error::ErrorStack),

    #[error("issuer rejected request: {0}")]
    Rejected(String),
}

/// Certificate authority operations. The issuer owns certificate records:
/// what it issues it can look up and delete.
pub trait CertIssuer {
    fn issue(&self, profile: &SubjectProfile) -> std::result::Result<Certificate, IssuanceError>;
    /// Deleting an unknown certificate is not an error.
    fn delete(&self, cert_id: Uuid) -> std::result::Result<(), IssuanceError>;
    fn certificate(&self, cert_id: Uuid) -> std::result::Result<Option<Certificate>, IssuanceError>;
    fn ca(&self, ca_id: Uuid) -> std::result::Result<Option<Ca>, IssuanceError>;
}

// ---------------------------------------------------------------------------
// CertLifecycle
// ---------------------------------------------------------------------------

pub const CERT_CA_MISMATCH: &str = "The selected certificate must match the selected CA.";

/// Creates and destroys the certificates owned by VPN client bindings and
/// VPN servers.
#[derive(Debug)]
pub struct CertLifecycle<'a, I> {
    issuer: &'a I,
}

impl<'a, I: CertIssuer> CertLifecycle<'a, I> {
    pub fn new(issuer: &'a I) -> Self {
        Self { issuer }
    }

    fn load_ca(&self, ca_id: Uuid) -> Result<Ca> {
        self.issuer
            .ca(ca_id)?
            .ok_or(CoreError::not_found("ca", ca_id))
    }

    /// Issues the client certificate of `binding` when it manages one and
    /// has none yet. Returns the id of the newly issued certificate.
    #[tracing::instrument(skip_all, fields(vpn_id = %vpn.id, auto_cert = binding.auto_cert))]
    pub fn ensure(&self, binding: &mut VpnClient, vpn: &Vpn, common_name: &str) -> Result<Option<Uuid>> {
        if !binding.auto_cert || binding.cert_id.is_some() {
            return Ok(None);
        }
        let ca = self.load_ca(vpn.ca_id)?;
        let profile = SubjectProfile::from_ca(&ca, common_name, common_name, CertUsage::Client);
        let cert = self.issuer.issue(&profile)?;
        info!(cert_id = %cert.id, common_name, "issued client certificate");
        binding.cert_id = Some(cert.id);
        Ok(Some(cert.id))
    }

    /// Removes `binding` from the store, then deletes the certificate it owned.
    #[tracing::instrument(skip_all, fields(client_id = %binding.id, vpn_id = %binding.vpn_id))]
    pub fn release<S: ConfigStore>(&self, store: &S, binding: &VpnClient) -> Result<()> {
        store.delete_vpn_client(binding.id)?;
        if let Some(cert_id) = binding.cert_id.filter(|_| binding.auto_cert) {
            self.issuer.delete(cert_id)?;
            info!(%cert_id, "deleted client certificate");
        }
        Ok(())
    }

    /// Deletes a certificate issued for a binding that was never stored.
    pub fn discard(&self, cert_id: Uuid) {
        if let Err(e) = self.issuer.delete(cert_id) {
            error!(%cert_id, error = %e, "failed to discard unused certificate");
        }
    }

    /// Rejects a server certificate that was not issued by the VPN's CA.
    pub fn check_server_cert(&self, vpn: &Vpn) -> Result<()> {
        let Some(cert_id) = vpn.cert_id else {
            return Ok(());
        };
        let cert = self
            .issuer
            .certificate(cert_id)?
            .ok_or(CoreError::not_found("certificate", cert_id))?;
        if cert.ca_id != vpn.ca_id {
            return Err(CoreError::validation("cert", CERT_CA_MISMATCH));
        }
        Ok(())
    }

    /// Issues a server certificate for `vpn` when none is set.
    #[tracing::instrument(skip_all, fields(vpn_id = %vpn.id))]
    pub fn ensure_server(&self, vpn: &mut Vpn) -> Result<Option<Uuid>> {
        if vpn.cert_id.is_some() {
            return Ok(None);
        }
        let ca = self.load_ca(vpn.ca_id)?;
        let common_name = slugify(&vpn.name);
        let profile = SubjectProfile::from_ca(&ca, &vpn.name, &common_name, CertUsage::Server);
        let cert = self.issuer.issue(&profile)?;
        info!(cert_id = %cert.id, %common_name, "issued server certificate");
        vpn.cert_id = Some(cert.id);
        vpn.owns_cert = true;
        Ok(Some(cert.id))
    }

    /// Deletes the server certificate `vpn` owns, if any.
    pub fn release_server(&self, vpn: &Vpn) -> Result<()> {
        if let Some(cert_id) = vpn.cert_id.filter(|_| vpn.owns_cert) {
            self.issuer.delete(cert_id)?;
            info!(%cert_id, vpn_id = %vpn.id, "deleted server certificate");
        }
        Ok(())
    }
}

/// Lowercase ASCII slug: runs of whitespace and hyphens become one hyphen,
/// other punctuation is dropped.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else if c.is_whitespace() || c == '-' {
            pending_dash = true;
        }
    }
    slug
}
