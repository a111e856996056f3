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

use std::collections::BTreeMap;
use std::env;

use thiserror::Error;
use uuid::Uuid;

use devconf_types::Ca;

pub const DEFAULT_CERT_PATH: &str = "/etc/x509";

/// Process-wide settings, constant for the lifetime of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory on the device where certificate files are expected.
    pub cert_path: String,
    /// Default variables merged into every rendered context.
    pub context: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{var} must be a JSON object of string values: {source}")]
    InvalidContext {
        var: &'static str,
        source: serde_json::Error,
    },

    #[error("{var} must not be empty")]
    EmptyCertPath { var: &'static str },
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cert_path: DEFAULT_CERT_PATH.to_string(),
            context: BTreeMap::new(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, SettingsError> {
        let cert_path = match lookup("DEVCONF_CERT_PATH") {
            Some(path) if path.trim().is_empty() => {
                return Err(SettingsError::EmptyCertPath {
                    var: "DEVCONF_CERT_PATH",
                });
            }
            Some(path) => path.trim().trim_end_matches('/').to_string(),
            None => DEFAULT_CERT_PATH.to_string(),
        };

        let context = match lookup("DEVCONF_CONTEXT") {
            Some(raw) => serde_json::from_str(&raw).map_err(|source| {
                SettingsError::InvalidContext {
                    var: "DEVCONF_CONTEXT",
                    source,
                }
            })?,
            None => BTreeMap::new(),
        };

        Ok(Self { cert_path, context })
    }

    pub fn ca_path(&self, ca: &Ca) -> String {
        format!("{}/ca-{}-{}.pem", self.cert_path, ca.id.simple(), ca.common_name)
    }

    pub fn client_cert_path(&self, vpn_id: Uuid) -> String {
        format!("{}/client-{}.pem", self.cert_path, vpn_id.simple())
    }

    pub fn client_key_path(&self, vpn_id: Uuid) -> String {
        format!("{}/key-{}.pem", self.cert_path, vpn_id.simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    fn lookup(vars: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let vars: HashMap<&'static str, String> =
            vars.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn reads_context_object() {
        let settings = Settings::from_lookup(lookup(&[
            ("DEVCONF_CERT_PATH", "/etc/ssl/devconf/"),
            ("DEVCONF_CONTEXT", r#"{"ntp": "pool.ntp.org", "vlan": "20"}"#),
        ]))
        .unwrap();
        assert_eq!(settings.cert_path, "/etc/ssl/devconf");
        assert_eq!(settings.context["ntp"], "pool.ntp.org");
        assert_eq!(settings.context.len(), 2);
    }

    #[test_case(r#"["a"]"# ; "array")]
    #[test_case(r#"{"vlan": 20}"# ; "non string value")]
    #[test_case("{" ; "truncated")]
    fn rejects_malformed_context(raw: &str) {
        let result = Settings::from_lookup(lookup(&[("DEVCONF_CONTEXT", raw)]));
        assert!(matches!(result, Err(SettingsError::InvalidContext { .. })));
    }

    #[test]
    fn rejects_blank_cert_path() {
        let result = Settings::from_lookup(lookup(&[("DEVCONF_CERT_PATH", "  ")]));
        assert!(matches!(result, Err(SettingsError::EmptyCertPath { .. })));
    }

    #[test]
    fn client_paths_use_vpn_hex_id() {
        let settings = Settings::default();
        let vpn_id = Uuid::parse_str("6f1c8e1e-6b6f-4a4e-9e1b-2f1d5b7c9a01").unwrap();
        assert_eq!(
            settings.client_cert_path(vpn_id),
            "/etc/x509/client-6f1c8e1e6b6f4a4e9e1b2f1d5b7c9a01.pem"
        );
        assert_eq!(
            settings.client_key_path(vpn_id),
            "/etc/x509/key-6f1c8e1e6b6f4a4e9e1b2f1d5b7c9a01.pem"
        );
    }
}
