//! In-memory registry of per-user devices and endpoints.
//!
//! Layout: `user_id → device_id → Device`, each device holding
//! `endpoint_id → (endpoint, last_active)`. All mutating operations
//! take the single writer lock; selection takes the reader lock.
//! Selection is O(endpoints) per user.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use chorus_domain::{Error, Result};

use crate::device::{Capabilities, Device, Endpoint, EndpointEntry};

/// Counts exposed on the stats surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegistryStats {
    pub users: usize,
    pub devices: usize,
    pub endpoints: usize,
}

/// Thread-safe registry of all connected devices, keyed by user.
#[derive(Default)]
pub struct DeviceRegistry {
    users: RwLock<HashMap<String, HashMap<String, Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a device record.
    pub fn upsert_device(&self, device: Device) {
        let mut users = self.users.write();
        tracing::info!(
            user_id = %device.user_id,
            device_id = %device.device_id,
            session_id = %device.session_id,
            "device registered"
        );
        users
            .entry(device.user_id.clone())
            .or_default()
            .insert(device.device_id.clone(), device);
    }

    /// Close all endpoints and remove the device. Drops the user entry
    /// when it becomes empty.
    pub fn remove_device(&self, user_id: &str, device_id: &str) -> Result<()> {
        let mut users = self.users.write();
        let devices = users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?;
        let device = devices
            .remove(device_id)
            .ok_or_else(|| Error::NotFound(format!("device {device_id}")))?;
        for entry in device.endpoints.values() {
            entry.endpoint.close();
        }
        if devices.is_empty() {
            users.remove(user_id);
        }
        tracing::info!(user_id = %user_id, device_id = %device_id, "device removed");
        Ok(())
    }

    /// Attach an endpoint to a device. Idempotent on endpoint id.
    pub fn attach_endpoint(
        &self,
        user_id: &str,
        device_id: &str,
        endpoint: Arc<dyn Endpoint>,
    ) -> Result<()> {
        let mut users = self.users.write();
        let device = users
            .get_mut(user_id)
            .and_then(|d| d.get_mut(device_id))
            .ok_or_else(|| Error::NotFound(format!("device {device_id}")))?;
        let id = endpoint.id().to_string();
        if device.endpoints.contains_key(&id) {
            return Ok(());
        }
        tracing::debug!(user_id = %user_id, device_id = %device_id, endpoint_id = %id, "endpoint attached");
        device.endpoints.insert(
            id,
            EndpointEntry {
                endpoint,
                last_active: Utc::now(),
            },
        );
        Ok(())
    }

    /// Detach an endpoint. No-op when absent.
    pub fn detach_endpoint(&self, user_id: &str, device_id: &str, endpoint_id: &str) {
        let mut users = self.users.write();
        if let Some(device) = users.get_mut(user_id).and_then(|d| d.get_mut(device_id)) {
            if device.endpoints.remove(endpoint_id).is_some() {
                tracing::debug!(
                    user_id = %user_id,
                    device_id = %device_id,
                    endpoint_id = %endpoint_id,
                    "endpoint detached"
                );
            }
        }
    }

    /// Update `last_active` on the device and every endpoint.
    pub fn touch_device(&self, user_id: &str, device_id: &str) -> Result<()> {
        let mut users = self.users.write();
        let device = users
            .get_mut(user_id)
            .and_then(|d| d.get_mut(device_id))
            .ok_or_else(|| Error::NotFound(format!("device {device_id}")))?;
        let now = Utc::now();
        device.last_active = now;
        for entry in device.endpoints.values_mut() {
            entry.last_active = now;
        }
        Ok(())
    }

    /// All endpoints of a user, across devices.
    pub fn list_user_endpoints(&self, user_id: &str) -> Vec<Arc<dyn Endpoint>> {
        let users = self.users.read();
        users
            .get(user_id)
            .map(|devices| {
                devices
                    .values()
                    .flat_map(|d| d.endpoints.values())
                    .map(|e| e.endpoint.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All endpoints of a user with `text_sink`.
    pub fn text_fanout_endpoints(&self, user_id: &str) -> Vec<Arc<dyn Endpoint>> {
        let users = self.users.read();
        users
            .get(user_id)
            .map(|devices| {
                devices
                    .values()
                    .flat_map(|d| d.endpoints.values())
                    .filter(|e| e.endpoint.caps().text_sink)
                    .map(|e| e.endpoint.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The single endpoint satisfying every required capability with
    /// the greatest `last_active`. Ties break on the owning device's
    /// `last_active`, then arbitrarily.
    pub fn select_endpoint_mru(
        &self,
        user_id: &str,
        required: Capabilities,
    ) -> Option<Arc<dyn Endpoint>> {
        let users = self.users.read();
        let devices = users.get(user_id)?;

        let mut best: Option<(
            chrono::DateTime<Utc>,
            chrono::DateTime<Utc>,
            Arc<dyn Endpoint>,
        )> = None;

        for device in devices.values() {
            for entry in device.endpoints.values() {
                if !entry.endpoint.caps().satisfies(&required) {
                    continue;
                }
                let candidate = (entry.last_active, device.last_active);
                let dominated = match &best {
                    Some((ep_at, dev_at, _)) => {
                        candidate.0 > *ep_at || (candidate.0 == *ep_at && candidate.1 > *dev_at)
                    }
                    None => true,
                };
                if dominated {
                    best = Some((candidate.0, candidate.1, entry.endpoint.clone()));
                }
            }
        }

        best.map(|(_, _, ep)| ep)
    }

    /// Devices of a user whose `last_active` is older than the cutoff.
    /// Used by the session sweeper.
    pub fn idle_devices(&self, idle_for: chrono::Duration) -> Vec<(String, String)> {
        let cutoff = Utc::now() - idle_for;
        let users = self.users.read();
        users
            .values()
            .flat_map(|devices| devices.values())
            .filter(|d| d.last_active < cutoff)
            .map(|d| (d.user_id.clone(), d.device_id.clone()))
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let users = self.users.read();
        let devices = users.values().map(|d| d.len()).sum();
        let endpoints = users
            .values()
            .flat_map(|d| d.values())
            .map(|d| d.endpoints.len())
            .sum();
        RegistryStats {
            users: users.len(),
            devices,
            endpoints,
        }
    }
}
