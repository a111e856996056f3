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

use tracing::{error, info, warn};
use uuid::Uuid;

use devconf_types::event::{TemplateChange, TemplateSetChanged};
use devconf_types::{Configuration, Template, VpnClient};

use crate::cert::{CertIssuer, CertLifecycle};
use crate::dispatch::TemplateSetHandler;
use crate::error::{CoreError, Result};
use crate::store::ConfigStore;

/// Keeps VPN client bindings in step with the VPN templates attached to a
/// configuration.
pub struct VpnClientCoordinator<'a, S, I> {
    store: &'a S,
    certs: CertLifecycle<'a, I>,
}

impl<'a, S: ConfigStore, I: CertIssuer> VpnClientCoordinator<'a, S, I> {
    pub fn new(store: &'a S, issuer: &'a I) -> Self {
        Self {
            store,
            certs: CertLifecycle::new(issuer),
        }
    }

    /// Rejects templates that would bind a VPN twice.
    fn check_unbound(&self, config: &Configuration, templates: &[Template]) -> Result<()> {
        let mut seen = HashSet::new();
        for vpn_id in templates.iter().filter_map(Template::vpn_ref) {
            let taken = !seen.insert(vpn_id) || self.store.vpn_client(config.id, vpn_id)?.is_some();
            if taken {
                warn!(config_id = %config.id, %vpn_id, "vpn already bound");
                return Err(CoreError::Conflict {
                    config_id: config.id,
                    vpn_id,
                });
            }
        }
        Ok(())
    }

    /// Creates a binding for each VPN template. On failure the bindings
    /// created so far are released again.
    #[tracing::instrument(skip_all, fields(config_id = %config.id))]
    pub fn post_add<'t>(
        &self,
        config: &Configuration,
        templates: impl IntoIterator<Item = &'t Template>,
    ) -> Result<Vec<VpnClient>> {
        let mut created = Vec::new();
        for template in templates {
            match self.bind(config, template) {
                Ok(binding) => created.push(binding),
                Err(e) => {
                    self.rollback(&created);
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    fn bind(&self, config: &Configuration, template: &Template) -> Result<VpnClient> {
        let vpn_id = template
            .vpn_ref()
            .ok_or(CoreError::validation("vpn", "template has no VPN"))?;
        let vpn = self
            .store
            .vpn(vpn_id)?
            .ok_or(CoreError::not_found("vpn", vpn_id))?;

        let mut binding = VpnClient::new(config.id, vpn.id, template.auto_cert);
        let issued = self.certs.ensure(&mut binding, &vpn, &config.name())?;
        if let Err(e) = self.store.insert_vpn_client(&binding) {
            if let Some(cert_id) = issued {
                self.certs.discard(cert_id);
            }
            return Err(e.into());
        }
        info!(client_id = %binding.id, %vpn_id, "vpn client created");
        Ok(binding)
    }

    fn rollback(&self, created: &[VpnClient]) {
        for binding in created {
            if let Err(e) = self.certs.release(self.store, binding) {
                error!(client_id = %binding.id, error = %e, "failed to roll back vpn client");
            }
        }
    }

    /// Destroys the bindings of the removed VPN templates.
    #[tracing::instrument(skip_all, fields(config_id = %config.id))]
    pub fn post_remove<'t>(
        &self,
        config: &Configuration,
        templates: impl IntoIterator<Item = &'t Template>,
    ) -> Result<usize> {
        let mut destroyed = 0;
        for vpn_id in templates.into_iter().filter_map(Template::vpn_ref) {
            if let Some(binding) = self.store.vpn_client(config.id, vpn_id)? {
                self.certs.release(self.store, &binding)?;
                info!(client_id = %binding.id, %vpn_id, "vpn client destroyed");
                destroyed += 1;
            }
        }
        Ok(destroyed)
    }

    /// Destroys every binding of a configuration.
    #[tracing::instrument(skip(self))]
    pub fn destroy_all(&self, config_id: Uuid) -> Result<usize> {
        self.release_each(self.store.vpn_clients(config_id)?)
    }

    /// Destroys every binding referencing a VPN.
    #[tracing::instrument(skip(self))]
    pub fn destroy_for_vpn(&self, vpn_id: Uuid) -> Result<usize> {
        self.release_each(self.store.vpn_clients_for_vpn(vpn_id)?)
    }

    fn release_each(&self, bindings: Vec<VpnClient>) -> Result<usize> {
        for binding in &bindings {
            self.certs.release(self.store, binding)?;
            info!(client_id = %binding.id, vpn_id = %binding.vpn_id, "vpn client destroyed");
        }
        Ok(bindings.len())
    }
}

impl<S: ConfigStore, I: CertIssuer> TemplateSetHandler for VpnClientCoordinator<'_, S, I> {
    fn name(&self) -> &'static str {
        "vpn-clients"
    }

    fn handle(&self, config: &mut Configuration, event: &TemplateSetChanged) -> Result<()> {
        match event.kind {
            TemplateChange::PreAdd => self.check_unbound(config, &event.templates),
            TemplateChange::PostAdd => self.post_add(config, event.vpn_templates()).map(|_| ()),
            TemplateChange::PostRemove => self.post_remove(config, event.vpn_templates()).map(|_| ()),
            TemplateChange::PostClear => self.destroy_all(config.id).map(|_| ()),
        }
    }
}
