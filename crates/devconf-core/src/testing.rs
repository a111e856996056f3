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

//! Shared fixtures for unit tests.

use std::sync::Mutex;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde_json::json;
use uuid::Uuid;

use devconf_types::{Ca, Certificate, Vpn};

use crate::backend::OPENVPN;
use crate::cert::{CertIssuer, IssuanceError, SubjectProfile};

// -- Mock issuer that records calls --

#[derive(Default)]
pub struct MockIssuer {
    cas: DashMap<Uuid, Ca>,
    certs: DashMap<Uuid, Certificate>,
    issued: Mutex<Vec<SubjectProfile>>,
    deleted: Mutex<Vec<Uuid>>,
    fail_after: Mutex<Option<usize>>,
}

impl MockIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ca(&self, name: &str) -> Ca {
        let ca = Ca {
            id: Uuid::new_v4(),
            name: name.into(),
            common_name: name.to_lowercase().replace(' ', "-"),
            key_length: 2048,
            digest: "sha256".into(),
            country_code: "IT".into(),
            state: "RM".into(),
            city: "Rome".into(),
            organization: "Acme".into(),
            email: "ops@acme.test".into(),
            certificate: format!("-----BEGIN CERTIFICATE-----\n{name}\n-----END CERTIFICATE-----\n"),
            private_key: String::new(),
            created_at: Utc::now(),
        };
        self.cas.insert(ca.id, ca.clone());
        ca
    }

    /// Makes every issuance after the next `n` fail.
    pub fn fail_after(&self, n: usize) {
        *self.fail_after.lock().unwrap() = Some(n);
    }

    pub fn issued_profiles(&self) -> Vec<SubjectProfile> {
        self.issued.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<Uuid> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn live_certificates(&self) -> usize {
        self.certs.len()
    }
}

impl CertIssuer for MockIssuer {
    fn issue(&self, profile: &SubjectProfile) -> Result<Certificate, IssuanceError> {
        {
            let mut budget = self.fail_after.lock().unwrap();
            match budget.as_mut() {
                Some(0) => return Err(IssuanceError::Rejected("issuer offline".into())),
                Some(n) => *n -= 1,
                None => {}
            }
        }
        if !self.cas.contains_key(&profile.ca_id) {
            return Err(IssuanceError::UnknownCa(profile.ca_id));
        }
        let now = Utc::now();
        let cert = Certificate {
            id: Uuid::new_v4(),
            ca_id: profile.ca_id,
            name: profile.name.clone(),
            common_name: profile.common_name.clone(),
            usage: profile.usage,
            serial_number: format!("{:x}", self.issued.lock().unwrap().len() + 1),
            certificate: format!("cert:{}", profile.common_name),
            private_key: format!("key:{}", profile.common_name),
            created_at: now,
            expires_at: now + Duration::days(365),
        };
        self.issued.lock().unwrap().push(profile.clone());
        self.certs.insert(cert.id, cert.clone());
        Ok(cert)
    }

    fn delete(&self, cert_id: Uuid) -> Result<(), IssuanceError> {
        self.deleted.lock().unwrap().push(cert_id);
        self.certs.remove(&cert_id);
        Ok(())
    }

    fn certificate(&self, cert_id: Uuid) -> Result<Option<Certificate>, IssuanceError> {
        Ok(self.certs.get(&cert_id).map(|c| c.clone()))
    }

    fn ca(&self, ca_id: Uuid) -> Result<Option<Ca>, IssuanceError> {
        Ok(self.cas.get(&ca_id).map(|c| c.clone()))
    }
}

// -- Helpers --

pub fn sample_vpn(ca_id: Uuid) -> Vpn {
    Vpn::new(
        "office",
        "vpn.acme.test",
        ca_id,
        OPENVPN,
        json!({
            "openvpn": [{
                "name": "office",
                "mode": "server",
                "proto": "udp",
                "port": 1195,
                "dev": "tun0",
                "dev_type": "tun",
                "cipher": "AES-256-GCM",
            }]
        }),
    )
}
