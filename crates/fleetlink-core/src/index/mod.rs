//! In-memory device/account index.
//!
//! Maps end-user accounts to the devices they granted, plus a reverse
//! device→account map. Every mutation repairs both directions inside one
//! critical section, so readers never observe an orphan in either map.
//!
//! Registered observers run after the write lock is released. They must not
//! block; they may call back into the index.

pub mod callback;
pub mod model;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use callback::{CallbackAction, DeviceCallback};
pub use model::{Account, AccountDevice};

/// Snapshot format version written by [`DeviceIndex::export_snapshot`].
const SNAPSHOT_VERSION: u32 = 1;

/// Index errors.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Unrecognized callback action: {0}")]
    UnknownCallbackAction(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Observer invoked when an account is first inserted.
pub type AccountHandler = Arc<dyn Fn(&Account) + Send + Sync>;

/// Observer invoked when a device is newly granted: `(user_id, device)`.
pub type DeviceHandler = Arc<dyn Fn(&str, &AccountDevice) + Send + Sync>;

#[derive(Debug, Serialize, Deserialize)]
struct IndexSnapshot {
    version: u32,
    accounts: Vec<Account>,
}

#[derive(Debug, Default)]
struct IndexState {
    accounts: HashMap<String, Account>,
    /// device id -> owning user id
    owners: HashMap<String, String>,
}

impl IndexState {
    /// Remove `device_id` from whichever account other than `keep_user` owns it.
    fn detach_from_other_owner(&mut self, device_id: &str, keep_user: &str) {
        let Some(owner) = self.owners.get(device_id) else {
            return;
        };
        if owner == keep_user {
            return;
        }
        let owner = owner.clone();
        if let Some(account) = self.accounts.get_mut(&owner) {
            account.devices.retain(|d| d.device_id != device_id);
        }
        self.owners.remove(device_id);
        info!(device_id, from = %owner, to = keep_user, "Device moved between accounts");
    }

    /// Insert or replace a whole account, repairing the reverse map.
    /// Returns `true` if the account is new.
    fn put_account(&mut self, mut account: Account) -> bool {
        account.devices = dedup_devices(account.devices);
        let user_id = account.user_id.clone();

        for device in &account.devices {
            self.detach_from_other_owner(&device.device_id, &user_id);
        }

        let kept: HashSet<&str> = account.devices.iter().map(|d| d.device_id.as_str()).collect();
        let previous = self.accounts.get(&user_id);
        let is_new = previous.is_none();
        if let Some(previous) = previous {
            let dropped: Vec<String> = previous
                .devices
                .iter()
                .filter(|d| !kept.contains(d.device_id.as_str()))
                .map(|d| d.device_id.clone())
                .collect();
            for device_id in dropped {
                debug!(
                    user_id = %user_id,
                    device_id = %device_id,
                    "Device dropped by account replace"
                );
                self.owners.remove(&device_id);
            }
        }

        for device in &account.devices {
            self.owners.insert(device.device_id.clone(), user_id.clone());
        }
        self.accounts.insert(user_id, account);
        is_new
    }

    fn remove_account(&mut self, user_id: &str) -> bool {
        let Some(account) = self.accounts.remove(user_id) else {
            return false;
        };
        for device in &account.devices {
            self.owners.remove(&device.device_id);
        }
        true
    }

    fn lookup(&self, device_id: &str) -> Option<(&AccountDevice, &Account)> {
        let owner = self.owners.get(device_id)?;
        let account = self.accounts.get(owner)?;
        let device = account.device(device_id)?;
        Some((device, account))
    }
}

/// Keep one entry per device id: first position, last value.
fn dedup_devices(devices: Vec<AccountDevice>) -> Vec<AccountDevice> {
    let mut out: Vec<AccountDevice> = Vec::with_capacity(devices.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    for device in devices {
        if let Some(&pos) = positions.get(&device.device_id) {
            out[pos] = device;
        } else {
            positions.insert(device.device_id.clone(), out.len());
            out.push(device);
        }
    }
    out
}

fn validate_device(device: &AccountDevice) -> Result<(), IndexError> {
    if device.device_id.is_empty() {
        return Err(IndexError::InvalidInput("device id must not be empty".into()));
    }
    Ok(())
}

/// Thread-safe directory of accounts and their granted devices.
#[derive(Default)]
pub struct DeviceIndex {
    state: RwLock<IndexState>,
    account_handlers: RwLock<Vec<AccountHandler>>,
    device_handlers: RwLock<Vec<DeviceHandler>>,
}

impl DeviceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for first-time account inserts.
    pub fn on_account_added(&self, handler: impl Fn(&Account) + Send + Sync + 'static) {
        self.account_handlers.write().push(Arc::new(handler));
    }

    /// Register an observer for newly granted devices.
    pub fn on_device_added(&self, handler: impl Fn(&str, &AccountDevice) + Send + Sync + 'static) {
        self.device_handlers.write().push(Arc::new(handler));
    }

    fn notify_account_added(&self, account: &Account) {
        let handlers = self.account_handlers.read().clone();
        for handler in handlers {
            handler(account);
        }
    }

    fn notify_device_added(&self, user_id: &str, device: &AccountDevice) {
        let handlers = self.device_handlers.read().clone();
        for handler in handlers {
            handler(user_id, device);
        }
    }

    /// Upsert an account by user id. Devices missing from the new list lose
    /// their reverse-index entries.
    pub fn add_or_replace_account(&self, account: Account) -> Result<(), IndexError> {
        if account.user_id.is_empty() {
            return Err(IndexError::InvalidInput("user id must not be empty".into()));
        }
        for device in &account.devices {
            validate_device(device)?;
        }

        let user_id = account.user_id.clone();
        let added = {
            let mut state = self.state.write();
            if state.put_account(account) {
                state.accounts.get(&user_id).cloned()
            } else {
                None
            }
        };

        match added {
            Some(account) => {
                info!(user_id = %user_id, devices = account.devices.len(), "Account added");
                self.notify_account_added(&account);
            }
            None => debug!(user_id = %user_id, "Account replaced"),
        }
        Ok(())
    }

    /// Remove an account and all its devices. Returns whether it existed.
    pub fn remove_account(&self, user_id: &str) -> bool {
        let removed = self.state.write().remove_account(user_id);
        if removed {
            info!(user_id, "Account removed");
        }
        removed
    }

    /// Insert or replace one device under `user_id`, creating the account if
    /// needed.
    pub fn upsert_device(&self, user_id: &str, device: AccountDevice) -> Result<(), IndexError> {
        if user_id.is_empty() {
            return Err(IndexError::InvalidInput("user id must not be empty".into()));
        }
        validate_device(&device)?;

        let (created_account, inserted) = {
            let mut state = self.state.write();
            state.detach_from_other_owner(&device.device_id, user_id);

            let mut created_account = None;
            if !state.accounts.contains_key(user_id) {
                let account = Account::new(user_id);
                created_account = Some(account.clone());
                state.accounts.insert(user_id.to_string(), account);
            }

            let device_id = device.device_id.clone();
            let inserted = match state.accounts.get_mut(user_id) {
                Some(account) => {
                    account.last_activity = Utc::now();
                    if let Some(existing) = account.device_mut(&device_id) {
                        *existing = device;
                        None
                    } else {
                        account.devices.push(device.clone());
                        Some(device)
                    }
                }
                None => None,
            };
            state.owners.insert(device_id, user_id.to_string());
            (created_account, inserted)
        };

        if let Some(account) = created_account {
            info!(user_id, "Account created by device grant");
            self.notify_account_added(&account);
        }
        if let Some(device) = inserted {
            info!(user_id, device_id = %device.device_id, host = %device.host, "Device granted");
            self.notify_device_added(user_id, &device);
        }
        Ok(())
    }

    /// Remove one device from `user_id`. Returns whether it was present.
    pub fn remove_device(&self, user_id: &str, device_id: &str) -> bool {
        let mut state = self.state.write();
        let Some(account) = state.accounts.get_mut(user_id) else {
            return false;
        };
        let before = account.devices.len();
        account.devices.retain(|d| d.device_id != device_id);
        if account.devices.len() == before {
            return false;
        }
        account.last_activity = Utc::now();
        state.owners.remove(device_id);
        drop(state);
        info!(user_id, device_id, "Device revoked");
        true
    }

    /// Look up a device and its owning account via the reverse index.
    pub fn get_device(&self, device_id: &str) -> Option<(AccountDevice, Account)> {
        let state = self.state.read();
        state
            .lookup(device_id)
            .map(|(device, account)| (device.clone(), account.clone()))
    }

    /// Look up just the device record.
    pub fn device(&self, device_id: &str) -> Option<AccountDevice> {
        self.state.read().lookup(device_id).map(|(d, _)| d.clone())
    }

    pub fn owner_of(&self, device_id: &str) -> Option<String> {
        self.state.read().owners.get(device_id).cloned()
    }

    pub fn account(&self, user_id: &str) -> Option<Account> {
        self.state.read().accounts.get(user_id).cloned()
    }

    /// All accounts, sorted by user id.
    pub fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<_> = self.state.read().accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        accounts
    }

    fn collect_devices(&self, filter: impl Fn(&AccountDevice) -> bool) -> Vec<AccountDevice> {
        let mut devices: Vec<_> = self
            .state
            .read()
            .accounts
            .values()
            .flat_map(|a| a.devices.iter())
            .filter(|d| filter(d))
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    /// All devices, sorted by device id.
    pub fn all_devices(&self) -> Vec<AccountDevice> {
        self.collect_devices(|_| true)
    }

    pub fn devices_by_host(&self, host: &str) -> Vec<AccountDevice> {
        self.collect_devices(|d| d.host == host)
    }

    pub fn devices_by_type(&self, device_type: &str) -> Vec<AccountDevice> {
        self.collect_devices(|d| d.device_type == device_type)
    }

    pub fn online_devices(&self) -> Vec<AccountDevice> {
        self.collect_devices(|d| d.online)
    }

    pub fn controllable_devices(&self) -> Vec<AccountDevice> {
        self.collect_devices(AccountDevice::can_control)
    }

    /// Deduplicated, sorted relay hosts with at least one granted device.
    pub fn hosts(&self) -> Vec<String> {
        let state = self.state.read();
        let mut hosts: Vec<String> = state
            .accounts
            .values()
            .flat_map(|a| a.devices.iter())
            .filter(|d| !d.host.is_empty())
            .map(|d| d.host.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        drop(state);
        hosts.sort();
        hosts
    }

    pub fn device_count(&self) -> usize {
        self.state.read().owners.len()
    }

    pub fn account_count(&self) -> usize {
        self.state.read().accounts.len()
    }

    /// Flip a device's online flag and bump its account's activity stamp.
    pub fn update_online_status(&self, device_id: &str, online: bool) -> bool {
        let mut state = self.state.write();
        let Some(owner) = state.owners.get(device_id).cloned() else {
            return false;
        };
        let Some(account) = state.accounts.get_mut(&owner) else {
            return false;
        };
        let Some(device) = account.device_mut(device_id) else {
            return false;
        };
        device.online = online;
        account.last_activity = Utc::now();
        true
    }

    /// Apply a grant/revoke webhook payload.
    pub fn handle_callback(&self, callback: &DeviceCallback) -> Result<CallbackAction, IndexError> {
        let action = callback.parsed_action().inspect_err(|e| {
            warn!(
                user_id = %callback.user_id,
                device_id = %callback.device_id,
                error = %e,
                "Rejected device callback"
            );
        })?;
        match action {
            CallbackAction::Add => self.upsert_device(&callback.user_id, callback.to_device())?,
            CallbackAction::Remove => {
                if !self.remove_device(&callback.user_id, &callback.device_id) {
                    debug!(
                        user_id = %callback.user_id,
                        device_id = %callback.device_id,
                        "Revoke for unknown device ignored"
                    );
                }
            }
        }
        Ok(action)
    }

    /// Verify the bidirectional invariant. Returns a description of the first
    /// violation found.
    pub fn check_consistency(&self) -> Result<(), String> {
        let state = self.state.read();
        let mut seen: HashSet<&str> = HashSet::new();
        for (user_id, account) in &state.accounts {
            if &account.user_id != user_id {
                return Err(format!("account keyed {user_id} has user id {}", account.user_id));
            }
            for device in &account.devices {
                if !seen.insert(device.device_id.as_str()) {
                    return Err(format!("device {} listed twice", device.device_id));
                }
                match state.owners.get(&device.device_id) {
                    Some(owner) if owner == user_id => {}
                    Some(owner) => {
                        return Err(format!(
                            "device {} listed by {user_id} but indexed to {owner}",
                            device.device_id
                        ));
                    }
                    None => return Err(format!("device {} not reverse-indexed", device.device_id)),
                }
            }
        }
        for (device_id, owner) in &state.owners {
            let listed = state
                .accounts
                .get(owner)
                .is_some_and(|a| a.device(device_id).is_some());
            if !listed {
                return Err(format!("reverse entry {device_id} -> {owner} is orphaned"));
            }
        }
        Ok(())
    }

    /// Serialize the full index.
    pub fn export_snapshot(&self) -> Result<Vec<u8>, IndexError> {
        let snapshot = IndexSnapshot {
            version: SNAPSHOT_VERSION,
            accounts: self.accounts(),
        };
        Ok(serde_json::to_vec_pretty(&snapshot)?)
    }

    /// Replace the whole index from a snapshot. Malformed input leaves the
    /// current state untouched.
    pub fn import_snapshot(&self, bytes: &[u8]) -> Result<(), IndexError> {
        let snapshot: IndexSnapshot = serde_json::from_slice(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(IndexError::InvalidInput(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut fresh = IndexState::default();
        for account in snapshot.accounts {
            if account.user_id.is_empty() {
                return Err(IndexError::InvalidInput("user id must not be empty".into()));
            }
            for device in &account.devices {
                validate_device(device)?;
            }
            fresh.put_account(account);
        }

        let accounts = fresh.accounts.len();
        let devices = fresh.owners.len();
        *self.state.write() = fresh;
        info!(accounts, devices, "Index restored from snapshot");
        Ok(())
    }

    /// Write a snapshot file, replacing any previous one atomically.
    pub fn save_to(&self, path: &Path) -> Result<(), IndexError> {
        let bytes = self.export_snapshot()?;
        write_atomic(path, &bytes)?;
        Ok(())
    }

    /// Load a snapshot file if it exists. Returns whether one was loaded.
    pub fn load_from(&self, path: &Path) -> Result<bool, IndexError> {
        if !path.exists() {
            return Ok(false);
        }
        let bytes = std::fs::read(path)?;
        self.import_snapshot(&bytes)?;
        Ok(true)
    }
}

/// Write `bytes` to `path` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dev(id: &str, host: &str, access: &str) -> AccountDevice {
        AccountDevice::new(id, "SHSW-1", host, access)
    }

    fn assert_consistent(index: &DeviceIndex) {
        if let Err(e) = index.check_consistency() {
            panic!("index inconsistent: {e}");
        }
    }

    #[test]
    fn upsert_creates_account_and_reverse_entry() {
        let index = DeviceIndex::new();
        index.upsert_device("u1", dev("d1", "h1", "01")).unwrap();

        let (device, account) = index.get_device("d1").unwrap();
        assert_eq!(device.device_id, "d1");
        assert_eq!(account.user_id, "u1");
        assert_eq!(index.owner_of("d1").as_deref(), Some("u1"));
        assert_consistent(&index);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let index = DeviceIndex::new();
        index.upsert_device("u1", dev("d1", "h1", "00")).unwrap();
        index.upsert_device("u1", dev("d2", "h1", "00")).unwrap();
        index.upsert_device("u1", dev("d1", "h2", "01")).unwrap();

        let account = index.account("u1").unwrap();
        let ids: Vec<_> = account.devices.iter().map(|d| d.device_id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2"]);
        assert_eq!(account.devices[0].host, "h2");
        assert!(account.devices[0].can_control());
        assert_consistent(&index);
    }

    #[test]
    fn device_added_fires_only_on_true_insert() {
        let index = DeviceIndex::new();
        let added = Arc::new(AtomicUsize::new(0));
        let accounts = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&added);
        index.on_device_added(move |_, _| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&accounts);
        index.on_account_added(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        index.upsert_device("u1", dev("d1", "h1", "01")).unwrap();
        index.upsert_device("u1", dev("d1", "h1", "00")).unwrap();
        index.upsert_device("u1", dev("d2", "h1", "00")).unwrap();

        assert_eq!(added.load(Ordering::SeqCst), 2);
        assert_eq!(accounts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn account_added_fires_only_on_first_insert() {
        let index = DeviceIndex::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        index.on_account_added(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        index.add_or_replace_account(Account::new("u1")).unwrap();
        index.add_or_replace_account(Account::new("u1")).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replace_drops_omitted_devices_from_reverse_index() {
        let index = DeviceIndex::new();
        index
            .add_or_replace_account(
                Account::new("u1").with_devices(vec![dev("d1", "h1", "01"), dev("d2", "h1", "01")]),
            )
            .unwrap();
        index
            .add_or_replace_account(Account::new("u1").with_devices(vec![dev("d2", "h1", "01")]))
            .unwrap();

        assert!(index.get_device("d1").is_none());
        assert!(index.get_device("d2").is_some());
        assert_eq!(index.device_count(), 1);
        assert_consistent(&index);
    }

    #[test]
    fn device_moves_between_accounts() {
        let index = DeviceIndex::new();
        index.upsert_device("u1", dev("d1", "h1", "01")).unwrap();
        index.upsert_device("u2", dev("d1", "h1", "01")).unwrap();

        assert_eq!(index.owner_of("d1").as_deref(), Some("u2"));
        assert!(index.account("u1").unwrap().devices.is_empty());
        assert_consistent(&index);

        index
            .add_or_replace_account(Account::new("u3").with_devices(vec![dev("d1", "h1", "01")]))
            .unwrap();
        assert_eq!(index.owner_of("d1").as_deref(), Some("u3"));
        assert!(index.account("u2").unwrap().devices.is_empty());
        assert_consistent(&index);
    }

    #[test]
    fn duplicate_ids_in_one_account_are_collapsed() {
        let index = DeviceIndex::new();
        index
            .add_or_replace_account(
                Account::new("u1").with_devices(vec![dev("d1", "h1", "00"), dev("d1", "h2", "01")]),
            )
            .unwrap();
        let account = index.account("u1").unwrap();
        assert_eq!(account.devices.len(), 1);
        assert_eq!(account.devices[0].host, "h2");
        assert_consistent(&index);
    }

    #[test]
    fn remove_account_clears_reverse_entries() {
        let index = DeviceIndex::new();
        index.upsert_device("u1", dev("d1", "h1", "01")).unwrap();
        index.upsert_device("u1", dev("d2", "h1", "01")).unwrap();

        assert!(index.remove_account("u1"));
        assert!(!index.remove_account("u1"));
        assert_eq!(index.device_count(), 0);
        assert!(index.get_device("d1").is_none());
        assert_consistent(&index);
    }

    #[test]
    fn remove_device_requires_matching_owner() {
        let index = DeviceIndex::new();
        index.upsert_device("u1", dev("d1", "h1", "01")).unwrap();

        assert!(!index.remove_device("u2", "d1"));
        assert!(index.remove_device("u1", "d1"));
        assert!(!index.remove_device("u1", "d1"));
        assert_consistent(&index);
    }

    #[test]
    fn invariant_holds_after_mixed_operations() {
        let index = DeviceIndex::new();
        for i in 0..20 {
            let user = format!("u{}", i % 4);
            index.upsert_device(&user, dev(&format!("d{}", i % 7), "h", "01")).unwrap();
            assert_consistent(&index);
            if i % 5 == 0 {
                index.remove_device(&user, &format!("d{}", (i + 1) % 7));
                assert_consistent(&index);
            }
            if i % 6 == 0 {
                index
                    .add_or_replace_account(
                        Account::new(user.clone())
                            .with_devices(vec![dev(&format!("d{}", i % 3), "h", "00")]),
                    )
                    .unwrap();
                assert_consistent(&index);
            }
            if i % 9 == 0 {
                index.remove_account("u1");
                assert_consistent(&index);
            }
        }
    }

    #[test]
    fn queries_filter_and_sort() {
        let index = DeviceIndex::new();
        index.upsert_device("u1", dev("d3", "h2", "01")).unwrap();
        index.upsert_device("u2", dev("d1", "h1", "00")).unwrap();
        index
            .upsert_device("u2", AccountDevice::new("d2", "SHDM-1", "h1", "01"))
            .unwrap();
        index.update_online_status("d2", true);

        let ids = |v: Vec<AccountDevice>| v.into_iter().map(|d| d.device_id).collect::<Vec<_>>();
        assert_eq!(ids(index.all_devices()), vec!["d1", "d2", "d3"]);
        assert_eq!(ids(index.devices_by_host("h1")), vec!["d1", "d2"]);
        assert_eq!(ids(index.devices_by_type("SHDM-1")), vec!["d2"]);
        assert_eq!(ids(index.online_devices()), vec!["d2"]);
        assert_eq!(ids(index.controllable_devices()), vec!["d2", "d3"]);
        assert_eq!(index.hosts(), vec!["h1", "h2"]);
        let users: Vec<_> = index.accounts().into_iter().map(|a| a.user_id).collect();
        assert_eq!(users, vec!["u1", "u2"]);
    }

    #[test]
    fn update_online_status_bumps_activity() {
        let index = DeviceIndex::new();
        index.upsert_device("u1", dev("d1", "h1", "01")).unwrap();
        let before = index.account("u1").unwrap().last_activity;

        assert!(index.update_online_status("d1", true));
        assert!(!index.update_online_status("missing", true));

        let account = index.account("u1").unwrap();
        assert!(account.devices[0].online);
        assert!(account.last_activity >= before);
    }

    #[test]
    fn callback_add_and_remove() {
        let index = DeviceIndex::new();
        let mut cb = DeviceCallback {
            user_id: "u1".into(),
            device_id: "d1".into(),
            device_type: "SHSW-1".into(),
            access_groups: "01".into(),
            host: "h1".into(),
            name: "Porch".into(),
            action: "add".into(),
        };
        assert_eq!(index.handle_callback(&cb).unwrap(), CallbackAction::Add);
        assert_eq!(index.device("d1").unwrap().name, "Porch");

        cb.action = "remove".into();
        assert_eq!(index.handle_callback(&cb).unwrap(), CallbackAction::Remove);
        assert!(index.device("d1").is_none());

        cb.action = "suspend".into();
        assert!(matches!(
            index.handle_callback(&cb),
            Err(IndexError::UnknownCallbackAction(_))
        ));
        assert_consistent(&index);
    }

    #[test]
    fn empty_ids_are_rejected() {
        let index = DeviceIndex::new();
        assert!(index.upsert_device("", dev("d1", "h", "01")).is_err());
        assert!(index.upsert_device("u1", dev("", "h", "01")).is_err());
        assert!(index.add_or_replace_account(Account::new("")).is_err());
        assert_eq!(index.account_count(), 0);
    }

    #[test]
    fn snapshot_round_trip_restores_reverse_index() {
        let index = DeviceIndex::new();
        index.upsert_device("u1", dev("d1", "h1", "01")).unwrap();
        index.upsert_device("u2", dev("d2", "h2", "00")).unwrap();
        let bytes = index.export_snapshot().unwrap();

        let restored = DeviceIndex::new();
        restored.import_snapshot(&bytes).unwrap();
        assert_eq!(restored.accounts(), index.accounts());
        assert_eq!(restored.owner_of("d2").as_deref(), Some("u2"));
        assert_consistent(&restored);
    }

    #[test]
    fn malformed_snapshot_leaves_state_untouched() {
        let index = DeviceIndex::new();
        index.upsert_device("u1", dev("d1", "h1", "01")).unwrap();

        assert!(index.import_snapshot(b"{\"version\":1,\"accounts\":[{").is_err());
        assert!(index.import_snapshot(br#"{"version":99,"accounts":[]}"#).is_err());
        assert!(index.get_device("d1").is_some());
    }

    #[test]
    fn save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("index.json");
        let index = DeviceIndex::new();
        index.upsert_device("u1", dev("d1", "h1", "01")).unwrap();
        index.save_to(&path).unwrap();

        let restored = DeviceIndex::new();
        assert!(restored.load_from(&path).unwrap());
        assert!(restored.get_device("d1").is_some());
        assert!(!restored.load_from(&dir.path().join("missing.json")).unwrap());
    }
}
