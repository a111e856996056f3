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

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use devconf_types::{Configuration, Template, Vpn, VpnClient};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("vpn client for configuration {config_id} and vpn {vpn_id} already exists")]
    DuplicateVpnClient { config_id: Uuid, vpn_id: Uuid },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("storage backend error: {0}")]
    Backend(String),
}

type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Record storage used by the engine.
///
/// Implementations must enforce uniqueness of VPN client bindings per
/// (configuration, vpn) pair in `insert_vpn_client`, reporting a
/// [`StoreError::DuplicateVpnClient`] to the loser of a race.
pub trait ConfigStore {
    fn configuration(&self, id: Uuid) -> Result<Option<Configuration>>;
    fn save_configuration(&self, config: &Configuration) -> Result<()>;
    /// Deletes the configuration and its template attachments.
    fn delete_configuration(&self, id: Uuid) -> Result<()>;

    fn template(&self, id: Uuid) -> Result<Option<Template>>;
    fn save_template(&self, template: &Template) -> Result<()>;
    /// Default templates for `backend`; every default template when `backend` is empty.
    fn default_templates(&self, backend: &str) -> Result<Vec<Template>>;

    /// Attached templates in attachment order.
    fn attached_templates(&self, config_id: Uuid) -> Result<Vec<Template>>;
    /// Appends templates to the attachment list, skipping ones already
    /// attached. Returns the ids actually appended.
    fn attach_templates(&self, config_id: Uuid, template_ids: &[Uuid]) -> Result<Vec<Uuid>>;
    fn detach_templates(&self, config_id: Uuid, template_ids: &[Uuid]) -> Result<()>;
    fn clear_templates(&self, config_id: Uuid) -> Result<()>;

    fn vpn(&self, id: Uuid) -> Result<Option<Vpn>>;
    fn save_vpn(&self, vpn: &Vpn) -> Result<()>;
    fn delete_vpn(&self, id: Uuid) -> Result<()>;

    fn vpn_client(&self, config_id: Uuid, vpn_id: Uuid) -> Result<Option<VpnClient>>;
    fn vpn_clients(&self, config_id: Uuid) -> Result<Vec<VpnClient>>;
    fn vpn_clients_for_vpn(&self, vpn_id: Uuid) -> Result<Vec<VpnClient>>;
    fn insert_vpn_client(&self, client: &VpnClient) -> Result<()>;
    fn delete_vpn_client(&self, id: Uuid) -> Result<Option<VpnClient>>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-process store. Bindings are keyed by (configuration, vpn) so the
/// uniqueness constraint is checked and claimed in a single map entry.
#[derive(Debug, Default)]
pub struct MemoryStore {
    configurations: DashMap<Uuid, Configuration>,
    templates: DashMap<Uuid, Template>,
    attachments: DashMap<Uuid, Vec<Uuid>>,
    vpns: DashMap<Uuid, Vpn>,
    vpn_clients: DashMap<(Uuid, Uuid), VpnClient>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted_clients(&self, pred: impl Fn(&VpnClient) -> bool) -> Vec<VpnClient> {
        let mut clients: Vec<VpnClient> = self
            .vpn_clients
            .iter()
            .filter(|entry| pred(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        clients.sort_by_key(|c| (c.created_at, c.vpn_id));
        clients
    }
}

impl ConfigStore for MemoryStore {
    #[tracing::instrument(skip(self))]
    fn configuration(&self, id: Uuid) -> Result<Option<Configuration>> {
        Ok(self.configurations.get(&id).map(|c| c.clone()))
    }

    #[tracing::instrument(skip_all, fields(config_id = %config.id))]
    fn save_configuration(&self, config: &Configuration) -> Result<()> {
        self.configurations.insert(config.id, config.clone());
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn delete_configuration(&self, id: Uuid) -> Result<()> {
        self.configurations.remove(&id);
        self.attachments.remove(&id);
        self.vpn_clients.retain(|(config_id, _), _| *config_id != id);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn template(&self, id: Uuid) -> Result<Option<Template>> {
        Ok(self.templates.get(&id).map(|t| t.clone()))
    }

    #[tracing::instrument(skip_all, fields(template_id = %template.id))]
    fn save_template(&self, template: &Template) -> Result<()> {
        self.templates.insert(template.id, template.clone());
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn default_templates(&self, backend: &str) -> Result<Vec<Template>> {
        let mut defaults: Vec<Template> = self
            .templates
            .iter()
            .filter(|t| t.default && (backend.is_empty() || t.backend == backend))
            .map(|t| t.clone())
            .collect();
        defaults.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defaults)
    }

    #[tracing::instrument(skip(self))]
    fn attached_templates(&self, config_id: Uuid) -> Result<Vec<Template>> {
        let ids = self
            .attachments
            .get(&config_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        ids.into_iter()
            .map(|id| {
                self.template(id)?.ok_or(StoreError::NotFound {
                    entity: "template",
                    id,
                })
            })
            .collect()
    }

    #[tracing::instrument(skip(self))]
    fn attach_templates(&self, config_id: Uuid, template_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        if !self.configurations.contains_key(&config_id) {
            return Err(StoreError::NotFound {
                entity: "configuration",
                id: config_id,
            });
        }
        if let Some(&missing) = template_ids.iter().find(|id| !self.templates.contains_key(*id)) {
            return Err(StoreError::NotFound {
                entity: "template",
                id: missing,
            });
        }
        let mut attached = self.attachments.entry(config_id).or_default();
        let mut appended = Vec::new();
        for &id in template_ids {
            if !attached.contains(&id) {
                attached.push(id);
                appended.push(id);
            }
        }
        Ok(appended)
    }

    #[tracing::instrument(skip(self))]
    fn detach_templates(&self, config_id: Uuid, template_ids: &[Uuid]) -> Result<()> {
        if let Some(mut attached) = self.attachments.get_mut(&config_id) {
            attached.retain(|id| !template_ids.contains(id));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn clear_templates(&self, config_id: Uuid) -> Result<()> {
        self.attachments.remove(&config_id);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn vpn(&self, id: Uuid) -> Result<Option<Vpn>> {
        Ok(self.vpns.get(&id).map(|v| v.clone()))
    }

    #[tracing::instrument(skip_all, fields(vpn_id = %vpn.id))]
    fn save_vpn(&self, vpn: &Vpn) -> Result<()> {
        self.vpns.insert(vpn.id, vpn.clone());
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn delete_vpn(&self, id: Uuid) -> Result<()> {
        self.vpns.remove(&id);
        self.vpn_clients.retain(|(_, vpn_id), _| *vpn_id != id);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn vpn_client(&self, config_id: Uuid, vpn_id: Uuid) -> Result<Option<VpnClient>> {
        Ok(self.vpn_clients.get(&(config_id, vpn_id)).map(|c| c.clone()))
    }

    #[tracing::instrument(skip(self))]
    fn vpn_clients(&self, config_id: Uuid) -> Result<Vec<VpnClient>> {
        Ok(self.sorted_clients(|c| c.config_id == config_id))
    }

    #[tracing::instrument(skip(self))]
    fn vpn_clients_for_vpn(&self, vpn_id: Uuid) -> Result<Vec<VpnClient>> {
        Ok(self.sorted_clients(|c| c.vpn_id == vpn_id))
    }

    #[tracing::instrument(skip_all, fields(config_id = %client.config_id, vpn_id = %client.vpn_id))]
    fn insert_vpn_client(&self, client: &VpnClient) -> Result<()> {
        match self.vpn_clients.entry((client.config_id, client.vpn_id)) {
            Entry::Occupied(_) => Err(StoreError::DuplicateVpnClient {
                config_id: client.config_id,
                vpn_id: client.vpn_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(client.clone());
                Ok(())
            }
        }
    }

    #[tracing::instrument(skip(self))]
    fn delete_vpn_client(&self, id: Uuid) -> Result<Option<VpnClient>> {
        let key = self
            .vpn_clients
            .iter()
            .find(|entry| entry.value().id == id)
            .map(|entry| *entry.key());
        Ok(key.and_then(|key| self.vpn_clients.remove(&key).map(|(_, client)| client)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use devconf_types::empty_document;
    use serde_json::json;

    fn store_with_config() -> (MemoryStore, Configuration) {
        let store = MemoryStore::new();
        let config = Configuration::new("openwrt", empty_document());
        store.save_configuration(&config).unwrap();
        (store, config)
    }

    fn saved_template(store: &MemoryStore, name: &str) -> Template {
        let template = Template::new(name, "openwrt", json!({"general": {}}));
        store.save_template(&template).unwrap();
        template
    }

    #[test]
    fn attachments_keep_order_and_skip_duplicates() {
        let (store, config) = store_with_config();
        let a = saved_template(&store, "a");
        let b = saved_template(&store, "b");

        assert_eq!(store.attach_templates(config.id, &[b.id, a.id]).unwrap(), vec![b.id, a.id]);
        assert!(store.attach_templates(config.id, &[b.id]).unwrap().is_empty());

        let names: Vec<_> = store
            .attached_templates(config.id)
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn attach_unknown_template_fails() {
        let (store, config) = store_with_config();
        let err = store.attach_templates(config.id, &[Uuid::new_v4()]).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "template", .. }));
    }

    #[test]
    fn detach_and_clear() {
        let (store, config) = store_with_config();
        let a = saved_template(&store, "a");
        let b = saved_template(&store, "b");
        store.attach_templates(config.id, &[a.id, b.id]).unwrap();

        store.detach_templates(config.id, &[a.id]).unwrap();
        assert_eq!(store.attached_templates(config.id).unwrap(), vec![b]);

        store.clear_templates(config.id).unwrap();
        assert!(store.attached_templates(config.id).unwrap().is_empty());
    }

    #[test]
    fn vpn_client_unique_per_pair() {
        let (store, config) = store_with_config();
        let vpn_id = Uuid::new_v4();

        store
            .insert_vpn_client(&VpnClient::new(config.id, vpn_id, true))
            .unwrap();
        let err = store
            .insert_vpn_client(&VpnClient::new(config.id, vpn_id, false))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateVpnClient { .. }));
        assert_eq!(store.vpn_clients(config.id).unwrap().len(), 1);
    }

    #[test]
    fn delete_vpn_client_by_id() {
        let (store, config) = store_with_config();
        let client = VpnClient::new(config.id, Uuid::new_v4(), false);
        store.insert_vpn_client(&client).unwrap();

        let removed = store.delete_vpn_client(client.id).unwrap();
        assert_eq!(removed, Some(client.clone()));
        assert_eq!(store.delete_vpn_client(client.id).unwrap(), None);
        assert!(store.vpn_clients(config.id).unwrap().is_empty());
    }

    #[test]
    fn default_templates_filter_by_backend() {
        let store = MemoryStore::new();
        let openwrt = Template::new("wrt", "openwrt", empty_document()).as_default();
        let openwisp = Template::new("wisp", "openwisp", empty_document()).as_default();
        let manual = Template::new("manual", "openwrt", empty_document());
        for t in [&openwrt, &openwisp, &manual] {
            store.save_template(t).unwrap();
        }

        assert_eq!(store.default_templates("openwrt").unwrap(), vec![openwrt]);
        assert_eq!(store.default_templates("").unwrap().len(), 2);
    }

    #[test]
    fn deleting_configuration_drops_bindings() {
        let (store, config) = store_with_config();
        store
            .insert_vpn_client(&VpnClient::new(config.id, Uuid::new_v4(), false))
            .unwrap();
        store.delete_configuration(config.id).unwrap();
        assert!(store.configuration(config.id).unwrap().is_none());
        assert!(store.vpn_clients(config.id).unwrap().is_empty());
    }
}
