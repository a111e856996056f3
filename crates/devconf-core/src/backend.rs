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

use std::collections::HashSet;

use serde_json::{Map, Value, json};
use tracing::debug;

pub const OPENWRT: &str = "openwrt";
pub const OPENWISP: &str = "openwisp";
pub const OPENVPN: &str = "openvpn";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unknown backend \"{0}\"")]
    UnknownBackend(String),

    #[error("{0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, BackendError>;

/// Context variable names a VPN client fragment refers to, already wrapped
/// as `{{name}}` placeholders. `cert` is `None` for VPNs that do not use
/// client certificates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoClientKeys {
    pub ca_path: String,
    pub ca_contents: String,
    pub cert: Option<ClientCertKeys>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertKeys {
    pub cert_path: String,
    pub cert_contents: String,
    pub key_path: String,
    pub key_contents: String,
}

/// Merge and validation rules of the configuration dialects.
pub trait ConfigBackend {
    /// Validates `document` against dialect `backend`, returning the
    /// validated document.
    fn validate(&self, backend: &str, document: &Value) -> Result<Value>;

    /// Merges `overlay` on top of `base`.
    fn merge(&self, base: Value, overlay: &Value) -> Value {
        merge_documents(base, overlay)
    }

    /// Builds the client side of a VPN connection for the server instance
    /// `server`. Returns `None` when dialect `backend` has no such support.
    fn auto_client_config(
        &self,
        backend: &str,
        host: &str,
        server: &Value,
        keys: &AutoClientKeys,
    ) -> Result<Option<Value>>;
}

/// Objects merge recursively, arrays concatenate and any other value in
/// `overlay` replaces the one in `base`. A `null` overlay leaves `base` as is.
pub fn merge_documents(base: Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(key) {
                    Some(existing) => merge_documents(existing, value),
                    None => value.clone(),
                };
                base.insert(key.clone(), merged);
            }
            Value::Object(base)
        }
        (Value::Array(mut base), Value::Array(overlay)) => {
            base.extend(overlay.iter().cloned());
            Value::Array(base)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay.clone(),
    }
}

// ---------------------------------------------------------------------------
// NetJSON backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Device,
    Vpn,
}

fn dialect(backend: &str) -> Result<Dialect> {
    match backend {
        OPENWRT | OPENWISP => Ok(Dialect::Device),
        OPENVPN => Ok(Dialect::Vpn),
        other => Err(BackendError::UnknownBackend(other.to_string())),
    }
}

const INTERFACE_TYPES: &[&str] = &["ethernet", "wireless", "bridge", "virtual", "loopback", "other"];
const OPENVPN_MODES: &[&str] = &["server", "p2p"];
const OPENVPN_PROTOS: &[&str] = &["udp", "tcp-client", "tcp-server", "udp6", "tcp6-client", "tcp6-server"];
const OPENVPN_DEV_TYPES: &[&str] = &["tun", "tap"];

/// Settings copied verbatim from the server instance into generated clients.
const CLIENT_COPY_KEYS: &[&str] = &[
    "name", "dev_type", "dev", "comp_lzo", "auth", "cipher", "tls_cipher", "keepalive",
    "persist_tun", "persist_key", "mute", "mute_replay_warnings", "reneg_sec", "tls_timeout",
    "float", "fast_io", "verb", "mtu_disc", "mtu_test", "mssfix", "fragment",
    "script_security", "user", "group", "log",
];

const DEFAULT_OPENVPN_PORT: u16 = 1194;

/// Built-in NetJSON dialects: `openwrt` and `openwisp` for devices,
/// `openvpn` for VPN servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetJsonBackend;

impl NetJsonBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ConfigBackend for NetJsonBackend {
    #[tracing::instrument(skip(self, document))]
    fn validate(&self, backend: &str, document: &Value) -> Result<Value> {
        let dialect = dialect(backend)?;
        let Some(root) = document.as_object() else {
            return Err(BackendError::Invalid(
                "configuration must be a JSON object".to_string(),
            ));
        };

        if dialect == Dialect::Device {
            validate_general(root)?;
            validate_interfaces(root)?;
            named_entries(root, "radios", "name")?;
        }

        let instances = named_entries(root, "openvpn", "name")?;
        if dialect == Dialect::Vpn && instances.is_empty() {
            return Err(BackendError::Invalid(
                "openvpn: at least one instance is required".to_string(),
            ));
        }
        for (i, instance) in instances.iter().enumerate() {
            validate_openvpn(i, instance)?;
        }

        validate_files(root)?;

        debug!(backend, "document validated");
        Ok(document.clone())
    }

    fn auto_client_config(
        &self,
        backend: &str,
        host: &str,
        server: &Value,
        keys: &AutoClientKeys,
    ) -> Result<Option<Value>> {
        match dialect(backend)? {
            Dialect::Vpn => openvpn_auto_client(host, server, keys).map(Some),
            Dialect::Device => Ok(None),
        }
    }
}

// -- Validation helpers ------------------------------------------------------

fn invalid(message: String) -> BackendError {
    BackendError::Invalid(message)
}

fn validate_general(root: &Map<String, Value>) -> Result<()> {
    let Some(general) = root.get("general") else {
        return Ok(());
    };
    let general = general
        .as_object()
        .ok_or_else(|| invalid("general: must be an object".to_string()))?;
    match general.get("hostname") {
        Some(hostname) if !hostname.is_string() => {
            Err(invalid("general.hostname: must be a string".to_string()))
        }
        _ => Ok(()),
    }
}

/// Entries of the array at `key`, each an object with a unique non-empty
/// string under `id_field`. A missing key yields no entries.
fn named_entries<'a>(
    root: &'a Map<String, Value>,
    key: &str,
    id_field: &str,
) -> Result<Vec<&'a Map<String, Value>>> {
    let Some(value) = root.get(key) else {
        return Ok(Vec::new());
    };
    let items = value
        .as_array()
        .ok_or_else(|| invalid(format!("{key}: must be an array")))?;

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let entry = item
            .as_object()
            .ok_or_else(|| invalid(format!("{key}[{i}]: must be an object")))?;
        let id = entry
            .get(id_field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid(format!("{key}[{i}].{id_field}: must be a non-empty string")))?;
        if !seen.insert(id) {
            return Err(invalid(format!("{key}: duplicate {id_field} \"{id}\"")));
        }
        entries.push(entry);
    }
    Ok(entries)
}

fn check_choice(
    entry: &Map<String, Value>,
    path: &str,
    field: &str,
    choices: &[&str],
) -> Result<()> {
    match entry.get(field) {
        None => Ok(()),
        Some(Value::String(s)) if choices.contains(&s.as_str()) => Ok(()),
        Some(other) => Err(invalid(format!(
            "{path}.{field}: {other} is not one of {}",
            choices.join(", ")
        ))),
    }
}

fn validate_interfaces(root: &Map<String, Value>) -> Result<()> {
    for (i, iface) in named_entries(root, "interfaces", "name")?.iter().enumerate() {
        let path = format!("interfaces[{i}]");
        if !iface.contains_key("type") {
            return Err(invalid(format!("{path}.type: is required")));
        }
        check_choice(iface, &path, "type", INTERFACE_TYPES)?;
    }
    Ok(())
}

fn validate_openvpn(i: usize, instance: &Map<String, Value>) -> Result<()> {
    let path = format!("openvpn[{i}]");
    check_choice(instance, &path, "mode", OPENVPN_MODES)?;
    check_choice(instance, &path, "proto", OPENVPN_PROTOS)?;
    check_choice(instance, &path, "dev_type", OPENVPN_DEV_TYPES)?;
    match instance.get("port") {
        Some(port) if !port.as_u64().is_some_and(|p| (1..=65535).contains(&p)) => {
            Err(invalid(format!("{path}.port: must be between 1 and 65535")))
        }
        _ => Ok(()),
    }
}

fn validate_files(root: &Map<String, Value>) -> Result<()> {
    for (i, file) in named_entries(root, "files", "path")?.iter().enumerate() {
        if !file.get("contents").is_some_and(Value::is_string) {
            return Err(invalid(format!("files[{i}].contents: must be a string")));
        }
        if file.get("mode").is_some_and(|mode| !mode.is_string()) {
            return Err(invalid(format!("files[{i}].mode: must be a string")));
        }
    }
    Ok(())
}

// -- OpenVPN client generation -----------------------------------------------

fn openvpn_auto_client(host: &str, server: &Value, keys: &AutoClientKeys) -> Result<Value> {
    let server = server
        .as_object()
        .ok_or_else(|| invalid("openvpn server instance must be an object".to_string()))?;

    let mut client = Map::new();
    client.insert("mode".into(), json!("p2p"));
    client.insert("nobind".into(), json!(true));
    client.insert("resolv_retry".into(), json!("infinite"));
    client.insert("tls_client".into(), json!(true));

    let port = server
        .get("port")
        .cloned()
        .unwrap_or_else(|| json!(DEFAULT_OPENVPN_PORT));
    client.insert("remote".into(), json!([{ "host": host, "port": port }]));

    let proto = match server.get("proto").and_then(Value::as_str) {
        Some("tcp-server") => "tcp-client",
        Some("tcp6-server") => "tcp6-client",
        Some(proto) => proto,
        None => "udp",
    };
    client.insert("proto".into(), json!(proto));

    if server.get("mode").and_then(Value::as_str) == Some("server") {
        client.insert("pull".into(), json!(true));
    }

    for key in CLIENT_COPY_KEYS {
        if let Some(value) = server.get(*key) {
            client.insert((*key).to_string(), value.clone());
        }
    }

    let mut files = vec![json!({
        "path": keys.ca_path,
        "contents": keys.ca_contents,
        "mode": "0644",
    })];
    client.insert("ca".into(), json!(keys.ca_path));

    if let Some(cert) = &keys.cert {
        client.insert("cert".into(), json!(cert.cert_path));
        client.insert("key".into(), json!(cert.key_path));
        files.push(json!({
            "path": cert.cert_path,
            "contents": cert.cert_contents,
            "mode": "0644",
        }));
        files.push(json!({
            "path": cert.key_path,
            "contents": cert.key_contents,
            "mode": "0600",
        }));
    }

    Ok(json!({ "openvpn": [client], "files": files }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn keys(with_cert: bool) -> AutoClientKeys {
        AutoClientKeys {
            ca_path: "{{ca_path_x}}".into(),
            ca_contents: "{{ca_contents_x}}".into(),
            cert: with_cert.then(|| ClientCertKeys {
                cert_path: "{{cert_path_x}}".into(),
                cert_contents: "{{cert_contents_x}}".into(),
                key_path: "{{key_path_x}}".into(),
                key_contents: "{{key_contents_x}}".into(),
            }),
        }
    }

    fn server() -> Value {
        json!({
            "name": "office",
            "mode": "server",
            "proto": "tcp-server",
            "port": 1195,
            "dev": "tun0",
            "dev_type": "tun",
            "cipher": "AES-256-GCM",
            "dh": "dh.pem",
        })
    }

    #[test]
    fn merge_overrides_scalars_and_concatenates_arrays() {
        let base = json!({
            "general": {"hostname": "base", "timezone": "UTC"},
            "interfaces": [{"name": "eth0", "type": "ethernet"}],
        });
        let overlay = json!({
            "general": {"hostname": "edge"},
            "interfaces": [{"name": "wlan0", "type": "wireless"}],
        });
        let merged = merge_documents(base, &overlay);
        assert_eq!(merged["general"], json!({"hostname": "edge", "timezone": "UTC"}));
        assert_eq!(merged["interfaces"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn merge_null_overlay_keeps_base() {
        let base = json!({"general": {}});
        assert_eq!(merge_documents(base.clone(), &Value::Null), base);
    }

    #[test_case(OPENWRT, json!({}) ; "empty device document")]
    #[test_case(OPENWISP, json!({"general": {"hostname": "ap"}, "interfaces": [{"name": "eth0", "type": "ethernet"}]}) ; "device with interface")]
    #[test_case(OPENVPN, json!({"openvpn": [{"name": "office", "mode": "server", "proto": "udp"}]}) ; "vpn server")]
    #[test_case(OPENWRT, json!({"files": [{"path": "/etc/x", "contents": "y", "mode": "0644"}]}) ; "files")]
    fn accepts_valid_documents(backend: &str, doc: Value) {
        assert_eq!(NetJsonBackend.validate(backend, &doc).unwrap(), doc);
    }

    #[test_case(OPENWRT, json!([]), "must be a JSON object" ; "not an object")]
    #[test_case(OPENWRT, json!({"general": "x"}), "general: must be an object" ; "general not object")]
    #[test_case(OPENWRT, json!({"interfaces": [{"name": "eth0", "type": "ethernet"}, {"name": "eth0", "type": "bridge"}]}), "duplicate name \"eth0\"" ; "duplicate interface")]
    #[test_case(OPENWRT, json!({"interfaces": [{"name": "eth0", "type": "modem"}]}), "interfaces[0].type" ; "unknown interface type")]
    #[test_case(OPENWRT, json!({"interfaces": [{"name": "eth0"}]}), "is required" ; "missing interface type")]
    #[test_case(OPENVPN, json!({}), "at least one instance" ; "vpn without instance")]
    #[test_case(OPENVPN, json!({"openvpn": [{"name": "a", "mode": "client"}]}), "openvpn[0].mode" ; "bad openvpn mode")]
    #[test_case(OPENVPN, json!({"openvpn": [{"name": "a", "port": 70000}]}), "port" ; "bad port")]
    #[test_case(OPENWRT, json!({"files": [{"path": "/a", "contents": 1}]}), "files[0].contents" ; "file contents not string")]
    fn rejects_invalid_documents(backend: &str, doc: Value, expected: &str) {
        let err = NetJsonBackend.validate(backend, &doc).unwrap_err();
        assert!(err.to_string().contains(expected), "{err}");
    }

    #[test]
    fn rejects_unknown_backend() {
        let err = NetJsonBackend.validate("junos", &json!({})).unwrap_err();
        assert!(matches!(err, BackendError::UnknownBackend(_)));
    }

    #[test]
    fn auto_client_with_certificate() {
        let doc = NetJsonBackend
            .auto_client_config(OPENVPN, "vpn.example.com", &server(), &keys(true))
            .unwrap()
            .unwrap();

        let client = &doc["openvpn"][0];
        assert_eq!(client["mode"], "p2p");
        assert_eq!(client["proto"], "tcp-client");
        assert_eq!(client["remote"], json!([{"host": "vpn.example.com", "port": 1195}]));
        assert_eq!(client["pull"], true);
        assert_eq!(client["cipher"], "AES-256-GCM");
        assert_eq!(client["cert"], "{{cert_path_x}}");
        assert!(client.get("dh").is_none());

        let files = doc["files"].as_array().unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[2]["mode"], "0600");

        // the generated fragment is itself a valid device fragment
        NetJsonBackend.validate(OPENWRT, &doc).unwrap();
    }

    #[test]
    fn auto_client_without_certificate() {
        let doc = NetJsonBackend
            .auto_client_config(OPENVPN, "vpn.example.com", &json!({"name": "office"}), &keys(false))
            .unwrap()
            .unwrap();
        let client = &doc["openvpn"][0];
        assert_eq!(client["proto"], "udp");
        assert_eq!(client["remote"][0]["port"], 1194);
        assert!(client.get("cert").is_none());
        assert!(client.get("key").is_none());
        assert_eq!(doc["files"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn auto_client_unsupported_for_device_dialects() {
        let result = NetJsonBackend
            .auto_client_config(OPENWRT, "h", &server(), &keys(true))
            .unwrap();
        assert!(result.is_none());
    }
}
