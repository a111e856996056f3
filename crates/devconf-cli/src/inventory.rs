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

//! TOML description of CAs, VPN servers, templates and configurations.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use devconf_core::CaRequest;
use devconf_types::{ConfigStatus, TemplateKind, empty_document};

#[derive(Debug, Default, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub cas: Vec<CaEntry>,
    #[serde(default)]
    pub vpns: Vec<VpnEntry>,
    #[serde(default)]
    pub templates: Vec<TemplateEntry>,
    #[serde(default)]
    pub configurations: Vec<ConfigurationEntry>,
}

/// A CA generated on load, or imported from PEM files when both file
/// paths are given. Relative paths are resolved against the inventory.
#[derive(Debug, Clone, Deserialize)]
pub struct CaEntry {
    #[serde(flatten)]
    pub request: CaRequest,
    pub certificate_file: Option<PathBuf>,
    pub private_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VpnEntry {
    pub name: String,
    pub host: String,
    /// Name of the issuing CA.
    pub ca: String,
    #[serde(default = "default_vpn_backend")]
    pub backend: String,
    #[serde(default = "empty_document")]
    pub config: Value,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateEntry {
    pub name: String,
    #[serde(default = "default_device_backend")]
    pub backend: String,
    #[serde(default)]
    pub default: bool,
    #[serde(rename = "type", default)]
    pub kind: TemplateKind,
    /// Name of the VPN server of a `vpn` template.
    pub vpn: Option<String>,
    #[serde(default = "default_true")]
    pub auto_cert: bool,
    #[serde(default = "empty_document")]
    pub config: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigurationEntry {
    /// Device name, also used to refer to the configuration.
    pub name: String,
    pub id: Option<Uuid>,
    #[serde(default = "default_device_backend")]
    pub backend: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub key: String,
    /// Template names, attached in order after the defaults.
    #[serde(default)]
    pub templates: Vec<String>,
    #[serde(default = "empty_document")]
    pub config: Value,
    pub status: Option<ConfigStatus>,
}

fn default_vpn_backend() -> String {
    devconf_core::backend::OPENVPN.to_string()
}

fn default_device_backend() -> String {
    devconf_core::backend::OPENWRT.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse inventory: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{kind} \"{name}\" is defined twice")]
    Duplicate { kind: &'static str, name: String },

    #[error("{kind} \"{name}\" referenced by \"{by}\" is not defined")]
    Unresolved {
        kind: &'static str,
        name: String,
        by: String,
    },

    #[error("CA \"{0}\" needs both certificate_file and private_key_file")]
    IncompleteCa(String),
}

pub async fn load(path: &Path) -> Result<Inventory, InventoryError> {
    debug!(path = %path.display(), "loading inventory");
    let contents = read(path).await?;
    let inventory: Inventory = toml::from_str(&contents)?;
    inventory.check_names()?;
    info!(
        path = %path.display(),
        cas = inventory.cas.len(),
        vpns = inventory.vpns.len(),
        templates = inventory.templates.len(),
        configurations = inventory.configurations.len(),
        "loaded inventory"
    );
    Ok(inventory)
}

pub(crate) async fn read(path: &Path) -> Result<String, InventoryError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| InventoryError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn unique<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), InventoryError> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(InventoryError::Duplicate {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

impl Inventory {
    /// Names are unique per kind and every reference resolves.
    fn check_names(&self) -> Result<(), InventoryError> {
        unique("ca", self.cas.iter().map(|c| c.request.name.as_str()))?;
        unique("vpn", self.vpns.iter().map(|v| v.name.as_str()))?;
        unique("template", self.templates.iter().map(|t| t.name.as_str()))?;
        unique(
            "configuration",
            self.configurations.iter().map(|c| c.name.as_str()),
        )?;

        for ca in &self.cas {
            if ca.certificate_file.is_some() != ca.private_key_file.is_some() {
                return Err(InventoryError::IncompleteCa(ca.request.name.clone()));
            }
        }
        for vpn in &self.vpns {
            if !self.cas.iter().any(|c| c.request.name == vpn.ca) {
                return Err(unresolved("ca", &vpn.ca, &vpn.name));
            }
        }
        for template in &self.templates {
            if let Some(vpn) = &template.vpn {
                if !self.vpns.iter().any(|v| &v.name == vpn) {
                    return Err(unresolved("vpn", vpn, &template.name));
                }
            }
        }
        for config in &self.configurations {
            for name in &config.templates {
                if !self.templates.iter().any(|t| &t.name == name) {
                    return Err(unresolved("template", name, &config.name));
                }
            }
        }
        Ok(())
    }
}

fn unresolved(kind: &'static str, name: &str, by: &str) -> InventoryError {
    InventoryError::Unresolved {
        kind,
        name: name.to_string(),
        by: by.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    const SAMPLE: &str = r#"
[[cas]]
name = "Acme CA"
common_name = "acme-ca"
organization = "Acme"

[[vpns]]
name = "office"
host = "vpn.acme.test"
ca = "Acme CA"

[[vpns.config.openvpn]]
name = "office"
mode = "server"
port = 1194

[[templates]]
name = "base"
default = true
config = { general = { timezone = "UTC" } }

[[templates]]
name = "office"
type = "vpn"
vpn = "office"

[[configurations]]
name = "ap-lobby"
mac_address = "00:11:22:33:44:55"
templates = ["office"]
"#;

    #[test]
    fn parses_sample() {
        let inventory: Inventory = toml::from_str(SAMPLE).unwrap();
        inventory.check_names().unwrap();

        assert_eq!(inventory.cas[0].request.key_length, 2048);
        assert_eq!(inventory.cas[0].request.digest, "sha256");
        assert_eq!(inventory.vpns[0].backend, "openvpn");
        assert_eq!(inventory.vpns[0].config["openvpn"][0]["port"], json!(1194));
        assert_eq!(inventory.templates[0].kind, TemplateKind::Generic);
        assert_eq!(inventory.templates[1].kind, TemplateKind::Vpn);
        assert!(inventory.templates[1].auto_cert);
        assert_eq!(inventory.templates[1].config, json!({}));
        assert_eq!(inventory.configurations[0].backend, "openwrt");
        assert_eq!(inventory.configurations[0].status, None);
    }

    #[test]
    fn parse_empty_file() {
        let inventory: Inventory = toml::from_str("").unwrap();
        assert!(inventory.configurations.is_empty());
    }

    #[test_case("vpn = \"office\"", "vpn = \"remote\"", "vpn" ; "unknown vpn")]
    #[test_case("templates = [\"office\"]", "templates = [\"missing\"]", "template" ; "unknown template")]
    #[test_case("ca = \"Acme CA\"", "ca = \"Root CA\"", "ca" ; "unknown ca")]
    fn rejects_dangling_references(from: &str, to: &str, expected: &str) {
        let inventory: Inventory = toml::from_str(&SAMPLE.replace(from, to)).unwrap();
        match inventory.check_names() {
            Err(InventoryError::Unresolved { kind, .. }) => assert_eq!(kind, expected),
            other => panic!("expected an unresolved reference, got {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_names() {
        let doubled = format!("{SAMPLE}\n[[configurations]]\nname = \"ap-lobby\"\n");
        let inventory: Inventory = toml::from_str(&doubled).unwrap();
        assert!(matches!(
            inventory.check_names(),
            Err(InventoryError::Duplicate { kind: "configuration", .. })
        ));
    }

    #[test]
    fn ca_files_come_in_pairs() {
        let half = SAMPLE.replace(
            "organization = \"Acme\"",
            "organization = \"Acme\"\ncertificate_file = \"ca.pem\"",
        );
        let inventory: Inventory = toml::from_str(&half).unwrap();
        assert!(matches!(
            inventory.check_names(),
            Err(InventoryError::IncompleteCa(_))
        ));
    }
}
