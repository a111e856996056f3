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

//! devconf-types: Shared data model for the devconf ecosystem.
//!
//! This crate contains the records (configurations, templates, VPN servers,
//! VPN client bindings, certificates) and the template-set change messages
//! shared between the coordination engine and its front ends.

#![warn(missing_docs)]

pub mod event;

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// An empty configuration document (`{}`).
pub fn empty_document() -> Value {
    Value::Object(Map::new())
}

/// Whether a document carries no configuration at all (`null` or `{}`).
pub fn is_empty_document(doc: &Value) -> bool {
    match doc {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Synchronization status of a configuration against the deployed device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigStatus {
    /// Not applied yet.
    #[default]
    Modified,
    /// Applied and running on the device.
    Running,
    /// The configuration caused issues and was rolled back.
    Error,
}

impl fmt::Display for ConfigStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Modified => "modified",
            Self::Running => "running",
            Self::Error => "error",
        })
    }
}

/// Identity of the device a configuration belongs to. Read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Unique identifier.
    pub id: Uuid,
    /// Human-readable device name.
    pub name: String,
    /// Primary MAC address.
    pub mac_address: String,
    /// Unique key the device authenticates with.
    pub key: String,
}

/// A device configuration composed from templates plus its own fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning device, if bound.
    pub device: Option<Device>,
    /// Configuration dialect (e.g. `openwrt`).
    pub backend: String,
    /// The configuration's own document fragment, merged last.
    pub config: Value,
    /// Current synchronization status.
    pub status: ConfigStatus,
    /// Last address the configuration was fetched from.
    pub last_ip: Option<IpAddr>,
    /// When this configuration was created.
    pub created_at: DateTime<Utc>,
    /// Last time this configuration was saved.
    pub updated_at: DateTime<Utc>,
}

impl Configuration {
    /// A fresh, unsaved configuration in the `modified` state.
    pub fn new(backend: impl Into<String>, config: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            device: None,
            backend: backend.into(),
            config,
            status: ConfigStatus::Modified,
            last_ip: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bind this configuration to a device.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Display name: the device name, or the configuration id when unbound.
    pub fn name(&self) -> String {
        match &self.device {
            Some(device) => device.name.clone(),
            None => self.id.to_string(),
        }
    }
}

/// Kind of a template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    /// Plain configuration fragment.
    #[default]
    Generic,
    /// Fragment that connects the device to a VPN server.
    Vpn,
}

/// A reusable configuration fragment attached to configurations in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Unique identifier.
    pub id: Uuid,
    /// Unique template name.
    pub name: String,
    /// Configuration dialect of the fragment.
    pub backend: String,
    /// The fragment itself.
    pub config: Value,
    /// Attach automatically to new configurations with the same backend.
    pub default: bool,
    /// Generic or VPN template.
    #[serde(rename = "type")]
    pub kind: TemplateKind,
    /// VPN server this template connects to (VPN templates only).
    pub vpn_id: Option<Uuid>,
    /// Issue a client certificate per attached configuration (VPN templates only).
    pub auto_cert: bool,
    /// When this template was created.
    pub created_at: DateTime<Utc>,
    /// Last time this template was saved.
    pub updated_at: DateTime<Utc>,
}

impl Template {
    /// A generic template.
    pub fn new(name: impl Into<String>, backend: impl Into<String>, config: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            backend: backend.into(),
            config,
            default: false,
            kind: TemplateKind::Generic,
            vpn_id: None,
            auto_cert: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// A VPN template pointing at `vpn_id`. The fragment starts empty.
    pub fn vpn(
        name: impl Into<String>,
        backend: impl Into<String>,
        vpn_id: Uuid,
        auto_cert: bool,
    ) -> Self {
        Self {
            kind: TemplateKind::Vpn,
            vpn_id: Some(vpn_id),
            auto_cert,
            ..Self::new(name, backend, empty_document())
        }
    }

    /// Mark the template as default.
    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }

    /// The VPN referenced by a VPN template, `None` for generic templates.
    pub fn vpn_ref(&self) -> Option<Uuid> {
        match self.kind {
            TemplateKind::Vpn => self.vpn_id,
            TemplateKind::Generic => None,
        }
    }
}

/// A VPN server identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vpn {
    /// Unique identifier.
    pub id: Uuid,
    /// Unique server name.
    pub name: String,
    /// Hostname or address clients connect to.
    pub host: String,
    /// CA issuing the server and client certificates.
    pub ca_id: Uuid,
    /// Server certificate, created from the CA when left empty.
    pub cert_id: Option<Uuid>,
    /// Whether `cert_id` was issued for this server and is owned by it.
    pub owns_cert: bool,
    /// VPN dialect (e.g. `openvpn`).
    pub backend: String,
    /// Server-side configuration document.
    pub config: Value,
    /// Free-form notes.
    pub notes: String,
    /// When this server was created.
    pub created_at: DateTime<Utc>,
    /// Last time this server was saved.
    pub updated_at: DateTime<Utc>,
}

impl Vpn {
    /// A new VPN server without a certificate.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        ca_id: Uuid,
        backend: impl Into<String>,
        config: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            host: host.into(),
            ca_id,
            cert_id: None,
            owns_cert: false,
            backend: backend.into(),
            config,
            notes: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Binding between a configuration and a VPN server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpnClient {
    /// Unique identifier.
    pub id: Uuid,
    /// Bound configuration.
    pub config_id: Uuid,
    /// Bound VPN server.
    pub vpn_id: Uuid,
    /// Whether the binding manages its own client certificate.
    pub auto_cert: bool,
    /// Owned client certificate.
    pub cert_id: Option<Uuid>,
    /// When this binding was created.
    pub created_at: DateTime<Utc>,
}

impl VpnClient {
    /// A new binding without a certificate.
    pub fn new(config_id: Uuid, vpn_id: Uuid, auto_cert: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            config_id,
            vpn_id,
            auto_cert,
            cert_id: None,
            created_at: Utc::now(),
        }
    }
}

/// A certificate authority known to the issuer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ca {
    /// Unique identifier.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Subject common name.
    pub common_name: String,
    /// RSA key length used for issued certificates.
    pub key_length: u32,
    /// Signature digest (e.g. `sha256`).
    pub digest: String,
    /// Subject country code.
    pub country_code: String,
    /// Subject state or province.
    pub state: String,
    /// Subject city.
    pub city: String,
    /// Subject organization.
    pub organization: String,
    /// Subject email address.
    pub email: String,
    /// CA certificate in PEM format.
    pub certificate: String,
    /// CA private key in PEM format.
    #[serde(skip_serializing, default)]
    pub private_key: String,
    /// When this CA was created.
    pub created_at: DateTime<Utc>,
}

/// Intended usage of an issued certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertUsage {
    /// VPN client certificate.
    Client,
    /// VPN server certificate.
    Server,
}

impl fmt::Display for CertUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Server => "server",
        })
    }
}

/// An issued x509 certificate and its private key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    /// Unique identifier.
    pub id: Uuid,
    /// Issuing CA.
    pub ca_id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Subject common name.
    pub common_name: String,
    /// Client or server usage.
    pub usage: CertUsage,
    /// Serial number, hex encoded.
    pub serial_number: String,
    /// Certificate in PEM format.
    pub certificate: String,
    /// Private key in PEM format.
    #[serde(skip_serializing, default)]
    pub private_key: String,
    /// When the certificate was issued.
    pub created_at: DateTime<Utc>,
    /// End of the validity period.
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(ConfigStatus::Modified, "modified")]
    #[test_case(ConfigStatus::Running, "running")]
    #[test_case(ConfigStatus::Error, "error")]
    fn status_display_matches_serde(status: ConfigStatus, expected: &str) {
        assert_eq!(status.to_string(), expected);
        assert_eq!(serde_json::to_value(status).unwrap(), json!(expected));
    }

    #[test_case(json!(null), true)]
    #[test_case(json!({}), true)]
    #[test_case(json!({"general": {}}), false)]
    #[test_case(json!([]), false)]
    fn empty_document_detection(doc: Value, expected: bool) {
        assert_eq!(is_empty_document(&doc), expected);
    }

    #[test]
    fn name_falls_back_to_id() {
        let config = Configuration::new("openwrt", empty_document());
        assert_eq!(config.name(), config.id.to_string());

        let config = config.with_device(Device {
            id: Uuid::new_v4(),
            name: "ap-lobby".into(),
            mac_address: "00:11:22:33:44:55".into(),
            key: "k".into(),
        });
        assert_eq!(config.name(), "ap-lobby");
    }

    #[test]
    fn template_kind_serializes_as_type() {
        let template = Template::vpn("office", "openwrt", Uuid::nil(), true);
        let json = serde_json::to_value(&template).unwrap();
        assert_eq!(json["type"], "vpn");
        assert_eq!(template.vpn_ref(), Some(Uuid::nil()));
        assert_eq!(Template::new("g", "openwrt", empty_document()).vpn_ref(), None);
    }

    #[test]
    fn private_keys_are_not_serialized() {
        let cert = Certificate {
            id: Uuid::new_v4(),
            ca_id: Uuid::new_v4(),
            name: "c".into(),
            common_name: "c".into(),
            usage: CertUsage::Client,
            serial_number: "01".into(),
            certificate: "cert-pem".into(),
            private_key: "secret-pem".into(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
        };
        let json = serde_json::to_string(&cert).unwrap();
        assert!(json.contains("cert-pem"));
        assert!(!json.contains("secret-pem"));
    }
}
