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

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use devconf_types::Configuration;

use crate::backend::{AutoClientKeys, ClientCertKeys};
use crate::cert::CertIssuer;
use crate::error::{CoreError, Result};
use crate::settings::Settings;
use crate::store::ConfigStore;

/// Variables available to `{{name}}` placeholders of a rendered document.
pub type Context = BTreeMap<String, String>;

/// Names of the context variables contributed by one VPN binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnContextKeys {
    pub ca_path: String,
    pub ca_contents: String,
    pub cert_path: String,
    pub cert_contents: String,
    pub key_path: String,
    pub key_contents: String,
}

impl VpnContextKeys {
    pub fn for_vpn(vpn_id: Uuid) -> Self {
        let id = vpn_id.simple();
        Self {
            ca_path: format!("ca_path_{id}"),
            ca_contents: format!("ca_contents_{id}"),
            cert_path: format!("cert_path_{id}"),
            cert_contents: format!("cert_contents_{id}"),
            key_path: format!("key_path_{id}"),
            key_contents: format!("key_contents_{id}"),
        }
    }

    /// Placeholders referring to these keys, for generated client fragments.
    pub fn auto_client_keys(&self, auto_cert: bool) -> AutoClientKeys {
        AutoClientKeys {
            ca_path: placeholder(&self.ca_path),
            ca_contents: placeholder(&self.ca_contents),
            cert: auto_cert.then(|| ClientCertKeys {
                cert_path: placeholder(&self.cert_path),
                cert_contents: placeholder(&self.cert_contents),
                key_path: placeholder(&self.key_path),
                key_contents: placeholder(&self.key_contents),
            }),
        }
    }
}

fn placeholder(name: &str) -> String {
    format!("{{{{{name}}}}}")
}

/// Assembles the context of a configuration from device identity,
/// process-wide defaults and its VPN bindings.
pub struct ContextBuilder<'a, S, I> {
    store: &'a S,
    issuer: &'a I,
    settings: &'a Settings,
}

impl<'a, S: ConfigStore, I: CertIssuer> ContextBuilder<'a, S, I> {
    pub fn new(store: &'a S, issuer: &'a I, settings: &'a Settings) -> Self {
        Self {
            store,
            issuer,
            settings,
        }
    }

    #[tracing::instrument(skip_all, fields(config_id = %config.id))]
    pub fn build_context(&self, config: &Configuration) -> Result<Context> {
        let mut context = Context::new();
        if let Some(device) = &config.device {
            context.insert("id".into(), device.id.to_string());
            context.insert("key".into(), device.key.clone());
            context.insert("name".into(), device.name.clone());
            context.insert("mac_address".into(), device.mac_address.clone());
        }
        context.extend(
            self.settings
                .context
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        for binding in self.store.vpn_clients(config.id)? {
            let vpn = self
                .store
                .vpn(binding.vpn_id)?
                .ok_or(CoreError::not_found("vpn", binding.vpn_id))?;
            let ca = self
                .issuer
                .ca(vpn.ca_id)?
                .ok_or(CoreError::not_found("ca", vpn.ca_id))?;
            let keys = VpnContextKeys::for_vpn(vpn.id);

            context.insert(keys.ca_path, self.settings.ca_path(&ca));
            context.insert(keys.ca_contents, ca.certificate);

            let Some(cert_id) = binding.cert_id else {
                continue;
            };
            let cert = self
                .issuer
                .certificate(cert_id)?
                .ok_or(CoreError::not_found("certificate", cert_id))?;
            context.insert(keys.cert_path, self.settings.client_cert_path(vpn.id));
            context.insert(keys.cert_contents, cert.certificate);
            context.insert(keys.key_path, self.settings.client_key_path(vpn.id));
            context.insert(keys.key_contents, cert.private_key);
        }

        debug!(vars = context.len(), "context built");
        Ok(context)
    }
}

/// Replaces `{{name}}` and `{{ name }}` placeholders in every string of
/// `document`. Placeholders without a context value are kept as is.
pub fn evaluate_context(document: &Value, context: &Context) -> Value {
    match document {
        Value::String(s) => Value::String(substitute(s, context)),
        Value::Array(items) => Value::Array(items.iter().map(|v| evaluate_context(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), evaluate_context(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute(input: &str, context: &Context) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            rest = &rest[start..];
            break;
        };
        let raw = &after[..end];
        match context.get(raw.trim()) {
            Some(value) => out.push_str(value),
            None => {
                out.push_str("{{");
                out.push_str(raw);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{MockIssuer, sample_vpn};
    use devconf_types::{Device, VpnClient};
    use serde_json::json;
    use test_case::test_case;

    #[test_case("{{ hostname }}", "ap-1" ; "spaced")]
    #[test_case("{{hostname}}.lan", "ap-1.lan" ; "tight")]
    #[test_case("{{ missing }}", "{{ missing }}" ; "unknown kept")]
    #[test_case("a {{hostname}} {{ vlan }}", "a ap-1 20" ; "several")]
    #[test_case("open {{hostname", "open {{hostname" ; "unterminated")]
    fn substitutes_placeholders(input: &str, expected: &str) {
        let context = Context::from([
            ("hostname".to_string(), "ap-1".to_string()),
            ("vlan".to_string(), "20".to_string()),
        ]);
        assert_eq!(substitute(input, &context), expected);
    }

    #[test]
    fn evaluates_nested_strings_only() {
        let context = Context::from([("ntp".to_string(), "pool.ntp.org".to_string())]);
        let doc = json!({"system": {"ntp": ["{{ntp}}"], "enabled": true, "port": 123}});
        assert_eq!(
            evaluate_context(&doc, &context),
            json!({"system": {"ntp": ["pool.ntp.org"], "enabled": true, "port": 123}})
        );
    }

    #[test]
    fn placeholders_wrap_key_names() {
        let vpn_id = Uuid::new_v4();
        let keys = VpnContextKeys::for_vpn(vpn_id).auto_client_keys(false);
        assert_eq!(keys.ca_path, format!("{{{{ca_path_{}}}}}", vpn_id.simple()));
        assert!(keys.cert.is_none());
    }

    #[test]
    fn device_vars_then_settings_then_vpns() {
        let store = MemoryStore::new();
        let issuer = MockIssuer::new();
        let ca = issuer.add_ca("Acme CA");
        let mut settings = Settings::default();
        settings.context.insert("name".into(), "override".into());
        settings.context.insert("ntp".into(), "pool.ntp.org".into());

        let with_cert = sample_vpn(ca.id);
        let mut without_cert = sample_vpn(ca.id);
        without_cert.name = "branch".into();
        store.save_vpn(&with_cert).unwrap();
        store.save_vpn(&without_cert).unwrap();

        let device = Device {
            id: Uuid::new_v4(),
            name: "ap-lobby".into(),
            mac_address: "00:11:22:33:44:55".into(),
            key: "secret".into(),
        };
        let config = Configuration::new("openwrt", json!({})).with_device(device.clone());

        let profile =
            crate::cert::SubjectProfile::from_ca(&ca, "ap", "ap", devconf_types::CertUsage::Client);
        let cert = issuer.issue(&profile).unwrap();
        let mut first = VpnClient::new(config.id, with_cert.id, true);
        first.cert_id = Some(cert.id);
        store.insert_vpn_client(&first).unwrap();
        store
            .insert_vpn_client(&VpnClient::new(config.id, without_cert.id, false))
            .unwrap();

        let context = ContextBuilder::new(&store, &issuer, &settings)
            .build_context(&config)
            .unwrap();

        assert_eq!(context["name"], "override");
        assert_eq!(context["mac_address"], device.mac_address);
        assert_eq!(context["id"], device.id.to_string());
        assert_eq!(context["ntp"], "pool.ntp.org");

        let a = VpnContextKeys::for_vpn(with_cert.id);
        let b = VpnContextKeys::for_vpn(without_cert.id);
        assert_eq!(
            context[&a.ca_path],
            format!("/etc/x509/ca-{}-{}.pem", ca.id.simple(), ca.common_name)
        );
        assert_eq!(context[&a.cert_contents], cert.certificate);
        assert_eq!(context[&a.key_contents], cert.private_key);
        assert_eq!(
            context[&a.key_path],
            format!("/etc/x509/key-{}.pem", with_cert.id.simple())
        );
        assert!(context.contains_key(&b.ca_contents));
        assert!(!context.contains_key(&b.cert_path));
        assert!(!context.contains_key(&b.key_contents));

        let vpn_keys = context.keys().filter(|k| k.contains('_') && k.len() > 32).count();
        assert_eq!(vpn_keys, 6 + 2);
    }

    #[test]
    fn no_device_no_identity_vars() {
        let store = MemoryStore::new();
        let issuer = MockIssuer::new();
        let settings = Settings::default();
        let config = Configuration::new("openwrt", json!({}));

        let context = ContextBuilder::new(&store, &issuer, &settings)
            .build_context(&config)
            .unwrap();
        assert!(context.is_empty());
    }
}
