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

//! Replays an inventory through the engine.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use devconf_core::cert::IssuanceError;
use devconf_core::{
    Context, CoreError, Engine, MemoryStore, NetJsonBackend, OpensslIssuer, Settings,
};
use devconf_types::{Ca, ConfigStatus, Configuration, Device, Template, Vpn};

use crate::inventory::{self, CaEntry, Inventory, InventoryError};

pub type DevconfEngine = Engine<MemoryStore, NetJsonBackend, OpensslIssuer>;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error("CA \"{name}\": {source}")]
    Ca {
        name: String,
        source: IssuanceError,
    },

    #[error("{kind} \"{name}\": {source}")]
    Rejected {
        kind: &'static str,
        name: String,
        source: CoreError,
    },

    #[error("configuration \"{0}\" is not defined")]
    UnknownConfiguration(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

type Result<T> = std::result::Result<T, WorkspaceError>;

fn rejected<'a>(kind: &'static str, name: &'a str) -> impl FnOnce(CoreError) -> WorkspaceError + 'a {
    move |source| WorkspaceError::Rejected {
        kind,
        name: name.to_string(),
        source,
    }
}

/// An engine populated from an inventory, with configurations addressable
/// by device name.
pub struct Workspace {
    engine: DevconfEngine,
    configurations: HashMap<String, Uuid>,
}

impl Workspace {
    pub async fn load(path: &Path, settings: Settings) -> Result<Self> {
        let inventory = inventory::load(path).await?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_inventory(inventory, base, settings).await
    }

    /// CAs first, then VPN servers, templates and configurations, each in
    /// file order.
    #[tracing::instrument(skip_all)]
    pub async fn from_inventory(inventory: Inventory, base: &Path, settings: Settings) -> Result<Self> {
        let engine = Engine::new(
            MemoryStore::new(),
            NetJsonBackend::new(),
            OpensslIssuer::new(),
            settings,
        );

        let mut cas = HashMap::new();
        for entry in &inventory.cas {
            let ca = install_ca(engine.issuer(), entry, base).await?;
            cas.insert(entry.request.name.clone(), ca.id);
        }

        let mut vpns = HashMap::new();
        for entry in inventory.vpns {
            let ca_id = resolve(&cas, "ca", &entry.ca, &entry.name)?;
            let mut vpn = Vpn::new(&entry.name, &entry.host, ca_id, &entry.backend, entry.config);
            vpn.notes = entry.notes;
            let vpn = engine.save_vpn(vpn).map_err(rejected("vpn", &entry.name))?;
            debug!(name = %entry.name, vpn_id = %vpn.id, "vpn saved");
            vpns.insert(entry.name, vpn.id);
        }

        let mut templates = HashMap::new();
        for entry in inventory.templates {
            let template = Template {
                kind: entry.kind,
                default: entry.default,
                vpn_id: match &entry.vpn {
                    Some(name) => Some(resolve(&vpns, "vpn", name, &entry.name)?),
                    None => None,
                },
                auto_cert: entry.auto_cert,
                ..Template::new(&entry.name, &entry.backend, entry.config)
            };
            let template = engine
                .save_template(template)
                .map_err(rejected("template", &entry.name))?;
            templates.insert(entry.name, template.id);
        }

        let mut configurations = HashMap::new();
        for entry in inventory.configurations {
            let device = Device {
                id: entry.id.unwrap_or_else(Uuid::new_v4),
                name: entry.name.clone(),
                mac_address: entry.mac_address,
                key: entry.key,
            };
            let config = Configuration::new(&entry.backend, entry.config).with_device(device);
            let config = engine
                .create_configuration(config)
                .map_err(rejected("configuration", &entry.name))?;

            let ids = entry
                .templates
                .iter()
                .map(|name| resolve(&templates, "template", name, &entry.name))
                .collect::<Result<Vec<_>>>()?;
            engine
                .add_templates(config.id, &ids)
                .map_err(rejected("configuration", &entry.name))?;
            match entry.status {
                Some(ConfigStatus::Running) => {
                    engine.mark_running(config.id)?;
                }
                Some(ConfigStatus::Error) => {
                    engine.mark_error(config.id)?;
                }
                Some(ConfigStatus::Modified) | None => {}
            }
            configurations.insert(entry.name, config.id);
        }

        info!(configurations = configurations.len(), "workspace ready");
        Ok(Self {
            engine,
            configurations,
        })
    }

    pub fn engine(&self) -> &DevconfEngine {
        &self.engine
    }

    pub fn configuration_id(&self, name: &str) -> Result<Uuid> {
        self.configurations
            .get(name)
            .copied()
            .ok_or_else(|| WorkspaceError::UnknownConfiguration(name.to_string()))
    }

    pub fn render(&self, name: &str) -> Result<Value> {
        Ok(self.engine.render(self.configuration_id(name)?)?)
    }

    pub fn context(&self, name: &str) -> Result<Context> {
        Ok(self.engine.context(self.configuration_id(name)?)?)
    }
}

fn resolve(ids: &HashMap<String, Uuid>, kind: &'static str, name: &str, by: &str) -> Result<Uuid> {
    ids.get(name).copied().ok_or_else(|| {
        InventoryError::Unresolved {
            kind,
            name: name.to_string(),
            by: by.to_string(),
        }
        .into()
    })
}

async fn install_ca(issuer: &OpensslIssuer, entry: &CaEntry, base: &Path) -> Result<Ca> {
    let ca_error = |source| WorkspaceError::Ca {
        name: entry.request.name.clone(),
        source,
    };
    let (Some(cert_file), Some(key_file)) = (&entry.certificate_file, &entry.private_key_file)
    else {
        let ca = issuer.create_ca(&entry.request).map_err(ca_error)?;
        info!(name = %ca.name, "generated CA");
        return Ok(ca);
    };

    let req = &entry.request;
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
        certificate: inventory::read(&base.join(cert_file)).await?,
        private_key: inventory::read(&base.join(key_file)).await?,
        created_at: Utc::now(),
    };
    issuer.import_ca(ca.clone()).map_err(ca_error)?;
    info!(name = %ca.name, "imported CA");
    Ok(ca)
}
