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

use serde_json::Value;
use tracing::debug;

use devconf_types::event::{TemplateChange, TemplateSetChanged};
use devconf_types::{Configuration, Template, empty_document};

use crate::backend::{BackendError, ConfigBackend};
use crate::dispatch::TemplateSetHandler;
use crate::error::{CoreError, Result};
use crate::store::ConfigStore;

pub const CONFLICT_PREFIX: &str = "There is a conflict with the specified templates. ";

/// Layers template fragments under a configuration's own document.
pub struct TemplateMerger<'a, S, B> {
    store: &'a S,
    backend: &'a B,
}

impl<'a, S: ConfigStore, B: ConfigBackend> TemplateMerger<'a, S, B> {
    pub fn new(store: &'a S, backend: &'a B) -> Self {
        Self { store, backend }
    }

    /// Templates in order, then the configuration's own fragment.
    pub fn combine(&self, templates: &[Template], config: &Configuration) -> Value {
        let merged = templates
            .iter()
            .fold(empty_document(), |doc, t| self.backend.merge(doc, &t.config));
        self.backend.merge(merged, &config.config)
    }

    /// Combines and validates. A rejected document is reported as a
    /// template conflict carrying the backend's diagnostic.
    pub fn validate_combination(
        &self,
        config: &Configuration,
        templates: &[Template],
    ) -> Result<Value> {
        let document = self.combine(templates, config);
        self.backend
            .validate(&config.backend, &document)
            .map_err(|e| match e {
                BackendError::Invalid(message) => {
                    CoreError::validation("templates", format!("{CONFLICT_PREFIX}{message}"))
                }
                other => CoreError::from(other),
            })
    }

    /// The validated document of `config` with its attached templates.
    #[tracing::instrument(skip_all, fields(config_id = %config.id))]
    pub fn render(&self, config: &Configuration) -> Result<Value> {
        let templates = self.store.attached_templates(config.id)?;
        debug!(templates = templates.len(), "rendering");
        self.validate_combination(config, &templates)
    }
}

impl<S: ConfigStore, B: ConfigBackend> TemplateSetHandler for TemplateMerger<'_, S, B> {
    fn name(&self) -> &'static str {
        "template-merger"
    }

    fn handle(&self, config: &mut Configuration, event: &TemplateSetChanged) -> Result<()> {
        if event.kind != TemplateChange::PreAdd {
            return Ok(());
        }
        let mut templates = self.store.attached_templates(config.id)?;
        let mut seen: HashSet<_> = templates.iter().map(|t| t.id).collect();
        for template in &event.templates {
            if seen.insert(template.id) {
                templates.push(template.clone());
            }
        }
        self.validate_combination(config, &templates)?;
        Ok(())
    }
}
