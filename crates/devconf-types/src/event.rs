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

//! Messages describing changes to a configuration's attached template set.

use serde::{Deserialize, Serialize};

use crate::Template;

/// Phase of a template-set change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateChange {
    /// Templates are about to be attached; nothing is committed yet.
    PreAdd,
    /// Templates were attached.
    PostAdd,
    /// Templates are being detached. Their attachment is dropped once every
    /// handler accepted the change.
    PostRemove,
    /// Every template is being detached, as for `PostRemove`.
    PostClear,
}

impl TemplateChange {
    /// True for the phases that change the template set.
    pub fn is_committed(self) -> bool {
        !matches!(self, Self::PreAdd)
    }
}

/// A change to the template set of one configuration, carrying the resolved
/// templates it affects. `PostClear` carries every attached template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSetChanged {
    /// Phase of the change.
    pub kind: TemplateChange,
    /// Affected templates, in attachment order.
    pub templates: Vec<Template>,
}

impl TemplateSetChanged {
    /// A change of `kind` affecting `templates`.
    pub fn new(kind: TemplateChange, templates: Vec<Template>) -> Self {
        Self { kind, templates }
    }

    /// Affected templates of type VPN.
    pub fn vpn_templates(&self) -> impl Iterator<Item = &Template> {
        self.templates.iter().filter(|t| t.vpn_ref().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::empty_document;
    use uuid::Uuid;

    #[test]
    fn vpn_templates_filters_generic() {
        let event = TemplateSetChanged::new(
            TemplateChange::PostAdd,
            vec![
                Template::new("base", "openwrt", empty_document()),
                Template::vpn("office", "openwrt", Uuid::new_v4(), true),
            ],
        );
        let names: Vec<_> = event.vpn_templates().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["office"]);
        assert!(event.kind.is_committed());
        assert!(!TemplateChange::PreAdd.is_committed());
    }
}
