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

//! devconf-core: configuration lifecycle engine.
//!
//! Composes device configurations from ordered templates, keeps VPN client
//! bindings and their certificates in step with attached VPN templates,
//! tracks the deployment status of each configuration and renders the final
//! document with its context variables.

pub mod backend;
pub mod cert;
pub mod context;
pub mod coordinator;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod issuer;
pub mod merge;
pub mod settings;
pub mod status;
pub mod store;

#[cfg(test)]
mod testing;

pub use backend::{ConfigBackend, NetJsonBackend};
pub use cert::{CertIssuer, CertLifecycle, SubjectProfile};
pub use context::{Context, ContextBuilder};
pub use coordinator::VpnClientCoordinator;
pub use dispatch::{Dispatcher, TemplateSetHandler};
pub use engine::Engine;
pub use error::{CoreError, Result};
pub use issuer::{CaRequest, OpensslIssuer};
pub use merge::TemplateMerger;
pub use settings::Settings;
pub use status::StatusMachine;
pub use store::{ConfigStore, MemoryStore};
