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

use uuid::Uuid;

use crate::backend::BackendError;
use crate::cert::IssuanceError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("vpn client for configuration {config_id} and vpn {vpn_id} already exists")]
    Conflict { config_id: Uuid, vpn_id: Uuid },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("certificate issuance failed: {0}")]
    Issuance(#[from] IssuanceError),

    #[error("store error: {0}")]
    Store(StoreError),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// The record field a validation error is scoped to.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Validation { field, .. } => Some(field),
            _ => None,
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateVpnClient { config_id, vpn_id } => {
                Self::Conflict { config_id, vpn_id }
            }
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::Backend(_) => {
                tracing::error!(error = %err, "store error");
                Self::Store(err)
            }
        }
    }
}

impl From<BackendError> for CoreError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::UnknownBackend(_) => Self::validation("backend", err.to_string()),
            BackendError::Invalid(message) => Self::Validation {
                field: "config",
                message,
            },
        }
    }
}
