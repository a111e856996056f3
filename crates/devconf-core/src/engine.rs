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

//! Request-scoped entry points tying the components together.

use std::collections::HashSet;

use chrono::Utc;
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use devconf_types::event::{TemplateChange, TemplateSetChanged};
use devconf_types::{
    ConfigStatus, Configuration, Template, TemplateKind, Vpn, empty_document, is_empty_document,
};

use crate::backend::ConfigBackend;
use crate::cert::{CertIssuer, CertLifecycle};
use crate::context::{Context, ContextBuilder, VpnContextKeys, evaluate_context};
use crate::coordinator::VpnClientCoordinator;
use crate::dispatch::Dispatcher;
use crate::error::{CoreError, Result};
use crate::merge::TemplateMerger;
use crate::settings::Settings;
use crate::status::StatusMachine;
use crate::store::ConfigStore;

pub const VPN_REQUIRED: &str = "A VPN must be selected when template type is \"VPN\"";

pub struct Engine<S, B, I> {
    store: S,
    backend: B,
    issuer: I,
    settings: Settings,
}

impl<S: ConfigStore, B: ConfigBackend, I: CertIssuer> Engine<S, B, I> {
    pub fn new(store: S, backend: B, issuer: I, settings: Settings) -> Self {
        Self {
            store,
            backend,
            issuer,
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn issuer(&self) -> &I {
        &self.issuer
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn status(&self) -> StatusMachine<'_, S> {
        StatusMachine::new(&self.store)
    }

    fn merger(&self) -> TemplateMerger<'_, S, B> {
        TemplateMerger::new(&self.store, &self.backend)
    }

    fn coordinator(&self) -> VpnClientCoordinator<'_, S, I> {
        VpnClientCoordinator::new(&self.store, &self.issuer)
    }

    /// Runs `f` with the handlers subscribed in delivery order.
    fn with_dispatcher<T>(&self, f: impl FnOnce(&Dispatcher<'_>) -> Result<T>) -> Result<T> {
        let merger = self.merger();
        let coordinator = self.coordinator();
        let status = self.status();
        let dispatcher = Dispatcher::new()
            .subscribe(&merger)
            .subscribe(&coordinator)
            .subscribe(&status);
        f(&dispatcher)
    }

    fn load_configuration(&self, id: Uuid) -> Result<Configuration> {
        self.store
            .configuration(id)?
            .ok_or(CoreError::not_found("configuration", id))
    }

    fn load_vpn(&self, id: Uuid) -> Result<Vpn> {
        self.store.vpn(id)?.ok_or(CoreError::not_found("vpn", id))
    }

    /// Templates by id in the given order, repeated ids collapsed.
    fn resolve_templates(&self, ids: &[Uuid]) -> Result<Vec<Template>> {
        let mut seen = HashSet::new();
        let mut templates = Vec::with_capacity(ids.len());
        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            let template = self
                .store
                .template(id)?
                .ok_or(CoreError::not_found("template", id))?;
            templates.push(template);
        }
        Ok(templates)
    }

    /// Validates the configuration's own document on top of `templates`.
    fn validate_document(&self, config: &Configuration, templates: &[Template]) -> Result<()> {
        let document = self.merger().combine(templates, config);
        self.backend.validate(&config.backend, &document)?;
        Ok(())
    }

    // -- Configurations ------------------------------------------------------

    /// Stores a new configuration and attaches the default templates of its
    /// backend. Nothing is kept when attaching fails.
    #[tracing::instrument(skip_all, fields(config_id = %config.id, backend = %config.backend))]
    pub fn create_configuration(&self, mut config: Configuration) -> Result<Configuration> {
        self.validate_document(&config, &[])?;
        let defaults = self.store.default_templates(&config.backend)?;
        config.status = ConfigStatus::Modified;
        self.store.save_configuration(&config)?;
        info!(defaults = defaults.len(), "configuration created");

        if !defaults.is_empty() {
            let ids: Vec<Uuid> = defaults.iter().map(|t| t.id).collect();
            if let Err(e) = self.add_templates(config.id, &ids) {
                self.store.delete_configuration(config.id)?;
                return Err(e);
            }
        }
        self.load_configuration(config.id)
    }

    /// Saves changes to a stored configuration; a changed document resets
    /// the status to `modified`.
    #[tracing::instrument(skip_all, fields(config_id = %config.id))]
    pub fn save_configuration(&self, mut config: Configuration) -> Result<Configuration> {
        if self.store.configuration(config.id)?.is_none() {
            return self.create_configuration(config);
        }
        self.status().clean(&mut config)?;
        let templates = self.store.attached_templates(config.id)?;
        self.validate_document(&config, &templates)?;
        config.updated_at = Utc::now();
        self.store.save_configuration(&config)?;
        Ok(config)
    }

    #[tracing::instrument(skip(self))]
    pub fn delete_configuration(&self, id: Uuid) -> Result<()> {
        self.load_configuration(id)?;
        let released = self.coordinator().destroy_all(id)?;
        self.store.delete_configuration(id)?;
        info!(released, "configuration deleted");
        Ok(())
    }

    /// Attaches templates after the whole resulting set validated. Generic
    /// templates already attached are skipped.
    #[tracing::instrument(skip(self))]
    pub fn add_templates(&self, config_id: Uuid, template_ids: &[Uuid]) -> Result<Configuration> {
        let mut config = self.load_configuration(config_id)?;
        let attached: HashSet<Uuid> = self
            .store
            .attached_templates(config_id)?
            .iter()
            .map(|t| t.id)
            .collect();
        let templates: Vec<Template> = self
            .resolve_templates(template_ids)?
            .into_iter()
            .filter(|t| t.vpn_ref().is_some() || !attached.contains(&t.id))
            .collect();
        if templates.is_empty() {
            return Ok(config);
        }
        let ids: Vec<Uuid> = templates.iter().map(|t| t.id).collect();

        self.with_dispatcher(|dispatcher| {
            let pre = TemplateSetChanged::new(TemplateChange::PreAdd, templates.clone());
            dispatcher.dispatch(&mut config, &pre)?;

            let appended = self.store.attach_templates(config_id, &ids)?;

            let post = TemplateSetChanged::new(TemplateChange::PostAdd, templates);
            if let Err(e) = dispatcher.dispatch(&mut config, &post) {
                if let Err(detach) = self.store.detach_templates(config_id, &appended) {
                    error!(error = %detach, "failed to detach templates after rejected add");
                }
                return Err(e);
            }
            Ok(())
        })?;
        Ok(config)
    }

    #[tracing::instrument(skip(self))]
    pub fn remove_templates(&self, config_id: Uuid, template_ids: &[Uuid]) -> Result<Configuration> {
        let mut config = self.load_configuration(config_id)?;
        let wanted: HashSet<Uuid> = template_ids.iter().copied().collect();
        let removed: Vec<Template> = self
            .store
            .attached_templates(config_id)?
            .into_iter()
            .filter(|t| wanted.contains(&t.id))
            .collect();
        if removed.is_empty() {
            return Ok(config);
        }
        let ids: Vec<Uuid> = removed.iter().map(|t| t.id).collect();

        // Bindings are released before the templates are detached, so a
        // template whose binding survives a failed release stays attached.
        let event = TemplateSetChanged::new(TemplateChange::PostRemove, removed);
        if let Err(e) = self.with_dispatcher(|dispatcher| dispatcher.dispatch(&mut config, &event)) {
            if let Err(cleanup) = self.detach_released(&mut config, &event.templates) {
                error!(error = %cleanup, "failed to detach released templates");
            }
            return Err(e);
        }
        self.store.detach_templates(config_id, &ids)?;
        Ok(config)
    }

    #[tracing::instrument(skip(self))]
    pub fn clear_templates(&self, config_id: Uuid) -> Result<Configuration> {
        let mut config = self.load_configuration(config_id)?;
        let attached = self.store.attached_templates(config_id)?;

        let event = TemplateSetChanged::new(TemplateChange::PostClear, attached);
        if let Err(e) = self.with_dispatcher(|dispatcher| dispatcher.dispatch(&mut config, &event)) {
            if let Err(cleanup) = self.detach_released(&mut config, &event.templates) {
                error!(error = %cleanup, "failed to detach released templates");
            }
            return Err(e);
        }
        self.store.clear_templates(config_id)?;
        Ok(config)
    }

    /// After a failed removal, detaches the VPN templates whose bindings are
    /// already gone and marks the configuration modified if any was.
    fn detach_released(&self, config: &mut Configuration, templates: &[Template]) -> Result<()> {
        let mut released = Vec::new();
        for template in templates {
            let Some(vpn_id) = template.vpn_ref() else {
                continue;
            };
            if self.store.vpn_client(config.id, vpn_id)?.is_none() {
                released.push(template.id);
            }
        }
        if released.is_empty() {
            return Ok(());
        }
        self.store.detach_templates(config.id, &released)?;
        warn!(detached = released.len(), "removal partially applied");
        if config.status != ConfigStatus::Modified {
            self.status().mark_modified(config, true)?;
        }
        Ok(())
    }

    /// The merged, validated document with context placeholders evaluated.
    #[tracing::instrument(skip(self))]
    pub fn render(&self, config_id: Uuid) -> Result<Value> {
        let config = self.load_configuration(config_id)?;
        let document = self.merger().render(&config)?;
        let context = ContextBuilder::new(&self.store, &self.issuer, &self.settings)
            .build_context(&config)?;
        Ok(evaluate_context(&document, &context))
    }

    pub fn context(&self, config_id: Uuid) -> Result<Context> {
        let config = self.load_configuration(config_id)?;
        ContextBuilder::new(&self.store, &self.issuer, &self.settings).build_context(&config)
    }

    pub fn mark_modified(&self, config_id: Uuid) -> Result<Configuration> {
        self.transition(config_id, ConfigStatus::Modified)
    }

    pub fn mark_running(&self, config_id: Uuid) -> Result<Configuration> {
        self.transition(config_id, ConfigStatus::Running)
    }

    pub fn mark_error(&self, config_id: Uuid) -> Result<Configuration> {
        self.transition(config_id, ConfigStatus::Error)
    }

    fn transition(&self, config_id: Uuid, status: ConfigStatus) -> Result<Configuration> {
        let mut config = self.load_configuration(config_id)?;
        self.status().set_status(&mut config, status, true)?;
        Ok(config)
    }

    // -- Templates -----------------------------------------------------------

    /// Saves a template. A VPN template must name a VPN and gets the VPN's
    /// client fragment when its own document is empty; a generic template
    /// drops any VPN settings.
    #[tracing::instrument(skip_all, fields(template_id = %template.id, name = %template.name))]
    pub fn save_template(&self, mut template: Template) -> Result<Template> {
        match template.kind {
            TemplateKind::Vpn => {
                let vpn_id = template
                    .vpn_id
                    .ok_or_else(|| CoreError::validation("vpn", VPN_REQUIRED))?;
                let vpn = self.load_vpn(vpn_id)?;
                if is_empty_document(&template.config) {
                    template.config = self.auto_client(&vpn, template.auto_cert)?;
                }
            }
            TemplateKind::Generic => {
                template.vpn_id = None;
                template.auto_cert = false;
            }
        }
        self.backend.validate(&template.backend, &template.config)?;
        template.updated_at = Utc::now();
        self.store.save_template(&template)?;
        Ok(template)
    }

    // -- VPN servers ---------------------------------------------------------

    /// Client fragment for connecting to `vpn`, referring to the binding's
    /// context variables. Empty when the VPN dialect has no client support.
    pub fn auto_client(&self, vpn: &Vpn, auto_cert: bool) -> Result<Value> {
        let server = vpn
            .config
            .get(&vpn.backend)
            .and_then(Value::as_array)
            .and_then(|instances| instances.first());
        let Some(server) = server else {
            return Ok(empty_document());
        };
        let keys = VpnContextKeys::for_vpn(vpn.id).auto_client_keys(auto_cert);
        let fragment = self
            .backend
            .auto_client_config(&vpn.backend, &vpn.host, server, &keys)?;
        Ok(fragment.unwrap_or_else(empty_document))
    }

    /// Validates and saves a VPN server, issuing its certificate when none
    /// is set.
    #[tracing::instrument(skip_all, fields(vpn_id = %vpn.id, name = %vpn.name))]
    pub fn save_vpn(&self, mut vpn: Vpn) -> Result<Vpn> {
        self.backend.validate(&vpn.backend, &vpn.config)?;
        let certs = CertLifecycle::new(&self.issuer);
        certs.check_server_cert(&vpn)?;
        let issued = certs.ensure_server(&mut vpn)?;
        vpn.updated_at = Utc::now();
        if let Err(e) = self.store.save_vpn(&vpn) {
            if let Some(cert_id) = issued {
                certs.discard(cert_id);
            }
            return Err(e.into());
        }
        Ok(vpn)
    }

    /// Deletes a VPN server with every binding referencing it.
    #[tracing::instrument(skip(self))]
    pub fn delete_vpn(&self, id: Uuid) -> Result<()> {
        let vpn = self.load_vpn(id)?;
        let released = self.coordinator().destroy_for_vpn(id)?;
        self.store.delete_vpn(id)?;
        CertLifecycle::new(&self.issuer).release_server(&vpn)?;
        info!(released, "vpn deleted");
        Ok(())
    }
}
