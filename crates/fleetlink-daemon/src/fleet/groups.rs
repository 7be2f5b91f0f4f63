//! Named device groups.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::FleetError;

/// A named, ordered, duplicate-free set of device ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub device_ids: Vec<String>,
}

impl DeviceGroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device_ids: Vec::new(),
        }
    }

    /// Returns false if the device was already a member.
    pub fn add(&mut self, device_id: &str) -> bool {
        if self.contains(device_id) {
            return false;
        }
        self.device_ids.push(device_id.to_string());
        true
    }

    pub fn remove(&mut self, device_id: &str) -> bool {
        let before = self.device_ids.len();
        self.device_ids.retain(|d| d != device_id);
        self.device_ids.len() != before
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.device_ids.iter().any(|d| d == device_id)
    }

    fn dedup(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.device_ids.retain(|d| seen.insert(d.clone()));
    }
}

/// Group CRUD. Not synchronized; the orchestrator owns the lock.
#[derive(Debug, Default, Clone)]
pub struct GroupRegistry {
    groups: BTreeMap<String, DeviceGroup>,
}

impl GroupRegistry {
    pub fn create(
        &mut self,
        id: &str,
        name: &str,
        device_ids: &[String],
    ) -> Result<DeviceGroup, FleetError> {
        if id.is_empty() {
            return Err(FleetError::InvalidGroup("group id must not be empty".into()));
        }
        if self.groups.contains_key(id) {
            return Err(FleetError::GroupExists {
                group_id: id.to_string(),
            });
        }
        let mut group = DeviceGroup::new(id, name);
        for device_id in device_ids {
            group.add(device_id);
        }
        self.groups.insert(id.to_string(), group.clone());
        Ok(group)
    }

    pub fn delete(&mut self, id: &str) -> bool {
        self.groups.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&DeviceGroup> {
        self.groups.get(id)
    }

    /// All groups sorted by id.
    pub fn list(&self) -> Vec<DeviceGroup> {
        self.groups.values().cloned().collect()
    }

    pub fn add_device(&mut self, group_id: &str, device_id: &str) -> Result<bool, FleetError> {
        Ok(self.get_mut(group_id)?.add(device_id))
    }

    pub fn remove_device(&mut self, group_id: &str, device_id: &str) -> Result<bool, FleetError> {
        Ok(self.get_mut(group_id)?.remove(device_id))
    }

    pub fn members(&self, group_id: &str) -> Result<Vec<String>, FleetError> {
        self.groups
            .get(group_id)
            .map(|g| g.device_ids.clone())
            .ok_or_else(|| FleetError::GroupNotFound {
                group_id: group_id.to_string(),
            })
    }

    /// Replace all groups, deduplicating member lists.
    pub fn replace_all(&mut self, groups: Vec<DeviceGroup>) {
        self.groups = groups
            .into_iter()
            .map(|mut g| {
                g.dedup();
                (g.id.clone(), g)
            })
            .collect();
    }

    fn get_mut(&mut self, group_id: &str) -> Result<&mut DeviceGroup, FleetError> {
        self.groups
            .get_mut(group_id)
            .ok_or_else(|| FleetError::GroupNotFound {
                group_id: group_id.to_string(),
            })
    }
}
