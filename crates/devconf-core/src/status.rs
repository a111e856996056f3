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

use tracing::{debug, info};

use devconf_types::event::TemplateSetChanged;
use devconf_types::{ConfigStatus, Configuration};

use crate::dispatch::TemplateSetHandler;
use crate::error::Result;
use crate::store::ConfigStore;

/// Tracks whether a configuration has been applied by its device.
pub struct StatusMachine<'a, S> {
    store: &'a S,
}

impl<'a, S: ConfigStore> StatusMachine<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Sets `status` unconditionally, persisting it when `save` is set.
    #[tracing::instrument(skip(self, config), fields(config_id = %config.id))]
    pub fn set_status(&self, config: &mut Configuration, status: ConfigStatus, save: bool) -> Result<()> {
        if config.status != status {
            info!(from = %config.status, to = %status, "status changed");
        }
        config.status = status;
        if save {
            self.store.save_configuration(config)?;
        }
        Ok(())
    }

    pub fn mark_modified(&self, config: &mut Configuration, save: bool) -> Result<()> {
        self.set_status(config, ConfigStatus::Modified, save)
    }

    pub fn mark_running(&self, config: &mut Configuration, save: bool) -> Result<()> {
        self.set_status(config, ConfigStatus::Running, save)
    }

    pub fn mark_error(&self, config: &mut Configuration, save: bool) -> Result<()> {
        self.set_status(config, ConfigStatus::Error, save)
    }

    /// Forces `modified` when `backend` or `config` differ from the stored
    /// record. A configuration never stored is left untouched.
    pub fn clean(&self, config: &mut Configuration) -> Result<()> {
        let Some(stored) = self.store.configuration(config.id)? else {
            return Ok(());
        };
        if stored.backend != config.backend || stored.config != config.config {
            debug!(config_id = %config.id, "document changed");
            self.mark_modified(config, false)?;
        }
        Ok(())
    }
}

impl<S: ConfigStore> TemplateSetHandler for StatusMachine<'_, S> {
    fn name(&self) -> &'static str {
        "status"
    }

    fn handle(&self, config: &mut Configuration, event: &TemplateSetChanged) -> Result<()> {
        if event.kind.is_committed() && config.status != ConfigStatus::Modified {
            self.mark_modified(config, true)?;
        }
        Ok(())
    }
}
