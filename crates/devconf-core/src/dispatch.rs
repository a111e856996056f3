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

use tracing::{debug, warn};

use devconf_types::Configuration;
use devconf_types::event::TemplateSetChanged;

use crate::error::Result;

/// A component reacting to changes of a configuration's template set.
pub trait TemplateSetHandler {
    fn name(&self) -> &'static str;

    /// Returning an error aborts delivery to the handlers that follow.
    fn handle(&self, config: &mut Configuration, event: &TemplateSetChanged) -> Result<()>;
}

/// Delivers template-set events to handlers in subscription order.
#[derive(Default)]
pub struct Dispatcher<'a> {
    handlers: Vec<&'a dyn TemplateSetHandler>,
}

impl<'a> Dispatcher<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(mut self, handler: &'a dyn TemplateSetHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    #[tracing::instrument(skip_all, fields(config_id = %config.id, kind = ?event.kind))]
    pub fn dispatch(&self, config: &mut Configuration, event: &TemplateSetChanged) -> Result<()> {
        for handler in &self.handlers {
            debug!(handler = handler.name(), "delivering");
            if let Err(e) = handler.handle(config, event) {
                warn!(handler = handler.name(), error = %e, "handler rejected event");
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use devconf_types::event::TemplateChange;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder<'l> {
        name: &'static str,
        log: &'l Mutex<Vec<&'static str>>,
        fail: bool,
    }

    impl TemplateSetHandler for Recorder<'_> {
        fn name(&self) -> &'static str {
            self.name
        }

        fn handle(&self, _config: &mut Configuration, _event: &TemplateSetChanged) -> Result<()> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                return Err(CoreError::validation("templates", "nope"));
            }
            Ok(())
        }
    }

    #[test]
    fn delivers_in_order_and_stops_on_error() {
        let log = Mutex::new(Vec::new());
        let a = Recorder { name: "a", log: &log, fail: false };
        let b = Recorder { name: "b", log: &log, fail: true };
        let c = Recorder { name: "c", log: &log, fail: false };
        let dispatcher = Dispatcher::new().subscribe(&a).subscribe(&b).subscribe(&c);

        let mut config = Configuration::new("openwrt", json!({}));
        let event = TemplateSetChanged::new(TemplateChange::PostAdd, vec![]);
        assert!(dispatcher.dispatch(&mut config, &event).is_err());
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }
}
