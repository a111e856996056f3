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

//! In-process certificate authority built on openssl.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::{X509, X509Name, X509NameBuilder};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use devconf_types::{Ca, CertUsage, Certificate};

use crate::cert::{CertIssuer, IssuanceError, SubjectProfile};

type Result<T> = std::result::Result<T, IssuanceError>;

pub const DEFAULT_VALIDITY_DAYS: u32 = 365;
const CA_VALIDITY_DAYS: u32 = 3650;
const SERIAL_BITS: i32 = 128;

fn default_key_length() -> u32 {
    2048
}

fn default_digest() -> String {
    "sha256".to_string()
}

/// Parameters of a new self-signed CA.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CaRequest {
    pub name: String,
    pub common_name: String,
    #[serde(default = "default_key_length")]
    pub key_length: u32,
    #[serde(default = "default_digest")]
    pub digest: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub email: String,
}

impl CaRequest {
    pub fn new(name: impl Into<String>, common_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            common_name: common_name.into(),
            key_length: default_key_length(),
            digest: default_digest(),
            country_code: String::new(),
            state: String::new(),
            city: String::new(),
            organization: String::new(),
            email: String::new(),
        }
    }
}

/// Keeps CAs and the certificates they issued in memory.
#[derive(Debug)]
pub struct OpensslIssuer {
    cas: DashMap<Uuid, Ca>,
    certs: DashMap<Uuid, Certificate>,
    validity_days: u32,
}

impl Default for OpensslIssuer {
    fn default() -> Self {
        Self {
            cas: DashMap::new(),
            certs: DashMap::new(),
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }
}

impl OpensslIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Generates a key pair and a self-signed CA certificate.
    #[tracing::instrument(skip_all, fields(name = %req.name))]
    pub fn create_ca(&self, req: &CaRequest) -> Result<Ca> {
        let digest = digest(&req.digest)?;
        let key = generate_key(req.key_length)?;
        let name = subject_name(
            &req.country_code,
            &req.state,
            &req.city,
            &req.organization,
            &req.email,
            &req.common_name,
        )?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&random_serial()?.1)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(CA_VALIDITY_DAYS)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build()?)?;
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(ski)?;
        builder.sign(&key, digest)?;
        let cert = builder.build();

        let ca = Ca {
            id: Uuid::new_v4(),
            name: req.name.clone(),
            common_name: req.common_name.clone(),
            key_length: req.key_length,
            digest: req.digest.clone(),
            country_code: req.country_code.clone(),
            state: req.state.clone(),
            city: req.city.clone(),
            organization: req.organization.clone(),
            email: req.email.clone(),
            certificate: pem_string(cert.to_pem()?),
            private_key: pem_string(key.private_key_to_pem_pkcs8()?),
            created_at: Utc::now(),
        };
        info!(ca_id = %ca.id, "created CA");
        self.cas.insert(ca.id, ca.clone());
        Ok(ca)
    }

    /// Registers an existing CA. Its private key is required to issue.
    pub fn import_ca(&self, ca: Ca) -> Result<()> {
        X509::from_pem(ca.certificate.as_bytes())?;
        if !ca.private_key.is_empty() {
            PKey::private_key_from_pem(ca.private_key.as_bytes())?;
        }
        debug!(ca_id = %ca.id, "imported CA");
        self.cas.insert(ca.id, ca);
        Ok(())
    }

    pub fn certificates(&self) -> Vec<Certificate> {
        self.certs.iter().map(|c| c.value().clone()).collect()
    }
}

impl CertIssuer for OpensslIssuer {
    #[tracing::instrument(skip_all, fields(ca_id = %profile.ca_id, common_name = %profile.common_name))]
    fn issue(&self, profile: &SubjectProfile) -> Result<Certificate> {
        let ca = self
            .cas
            .get(&profile.ca_id)
            .map(|c| c.clone())
            .ok_or(IssuanceError::UnknownCa(profile.ca_id))?;
        if ca.private_key.is_empty() {
            return Err(IssuanceError::Rejected(format!(
                "CA {} has no private key",
                ca.id
            )));
        }
        let ca_cert = X509::from_pem(ca.certificate.as_bytes())?;
        let ca_key = PKey::private_key_from_pem(ca.private_key.as_bytes())?;

        let digest = digest(&profile.digest)?;
        let key = generate_key(profile.key_length)?;
        let name = subject_name(
            &profile.country_code,
            &profile.state,
            &profile.city,
            &profile.organization,
            &profile.email,
            &profile.common_name,
        )?;
        let (serial_hex, serial) = random_serial()?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(ca_cert.subject_name())?;
        builder.set_pubkey(&key)?;
        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(self.validity_days)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(BasicConstraints::new().build()?)?;
        let usage = match profile.usage {
            CertUsage::Client => ExtendedKeyUsage::new().client_auth().build()?,
            CertUsage::Server => ExtendedKeyUsage::new().server_auth().build()?,
        };
        builder.append_extension(usage)?;
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(&ca_cert), None))?;
        builder.append_extension(ski)?;
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(&ca_cert), None))?;
        builder.append_extension(aki)?;
        builder.sign(&ca_key, digest)?;
        let cert = builder.build();

        let now = Utc::now();
        let issued = Certificate {
            id: Uuid::new_v4(),
            ca_id: ca.id,
            name: profile.name.clone(),
            common_name: profile.common_name.clone(),
            usage: profile.usage,
            serial_number: serial_hex,
            certificate: pem_string(cert.to_pem()?),
            private_key: pem_string(key.private_key_to_pem_pkcs8()?),
            created_at: now,
            expires_at: now + Duration::days(i64::from(self.validity_days)),
        };
        info!(cert_id = %issued.id, usage = %issued.usage, "signed certificate");
        self.certs.insert(issued.id, issued.clone());
        Ok(issued)
    }

    fn delete(&self, cert_id: Uuid) -> Result<()> {
        if self.certs.remove(&cert_id).is_some() {
            debug!(%cert_id, "certificate removed");
        }
        Ok(())
    }

    fn certificate(&self, cert_id: Uuid) -> Result<Option<Certificate>> {
        Ok(self.certs.get(&cert_id).map(|c| c.clone()))
    }

    fn ca(&self, ca_id: Uuid) -> Result<Option<Ca>> {
        Ok(self.cas.get(&ca_id).map(|c| c.clone()))
    }
}

// -- openssl helpers ---------------------------------------------------------

fn digest(name: &str) -> Result<MessageDigest> {
    MessageDigest::from_name(name).ok_or_else(|| IssuanceError::UnsupportedDigest(name.to_string()))
}

fn generate_key(bits: u32) -> Result<PKey<Private>> {
    Ok(PKey::from_rsa(Rsa::generate(bits)?)?)
}

fn random_serial() -> Result<(String, Asn1Integer)> {
    let mut bn = BigNum::new()?;
    bn.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
    let hex = bn.to_hex_str()?.to_lowercase();
    Ok((hex, bn.to_asn1_integer()?))
}

fn subject_name(
    country: &str,
    state: &str,
    city: &str,
    organization: &str,
    email: &str,
    common_name: &str,
) -> Result<X509Name> {
    let mut name = X509NameBuilder::new()?;
    for (field, value) in [
        ("C", country),
        ("ST", state),
        ("L", city),
        ("O", organization),
        ("emailAddress", email),
        ("CN", common_name),
    ] {
        if !value.is_empty() {
            name.append_entry_by_text(field, value)?;
        }
    }
    Ok(name.build())
}

fn pem_string(pem: Vec<u8>) -> String {
    String::from_utf8_lossy(&pem).into_owned()
}
