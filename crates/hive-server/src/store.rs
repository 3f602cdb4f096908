//! Persistence contract used by the hub, plus an in-memory implementation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};

use hive_protocol::{
    AccessKey, Device, DeviceClass, DeviceCommand, DeviceEquipment, DeviceNotification, Network,
    User, now_ms,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} conflicts with an existing record: {detail}")]
    Conflict { entity: &'static str, detail: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
}

/// Stored record with a numeric identity.
pub trait Entity: Clone + Send + Sync + 'static {
    const NAME: &'static str;

    fn id(&self) -> i64;

    fn set_id(&mut self, id: i64);

    /// Fill in a creation timestamp if the record kind carries one.
    fn stamp(&mut self, _now_ms: u64) {}
}

/// `save` assigns an id (and timestamp, where applicable) to new records
/// and replaces existing ones; `get` returns `None` for unknown ids.
pub trait Repository<T>: Send + Sync {
    fn save(&self, entity: &mut T) -> Result<(), StoreError>;

    fn get(&self, id: i64) -> Result<Option<T>, StoreError>;
}

pub trait UserRepository: Repository<User> {
    fn get_by_login(&self, login: &str) -> Result<Option<User>, StoreError>;
}

pub trait AccessKeyRepository: Repository<AccessKey> {
    fn get_by_key(&self, key: &str) -> Result<Option<AccessKey>, StoreError>;
}

pub trait NetworkRepository: Repository<Network> {
    fn get_by_name(&self, name: &str) -> Result<Option<Network>, StoreError>;
}

pub trait DeviceClassRepository: Repository<DeviceClass> {
    fn get_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<DeviceClass>, StoreError>;
}

pub trait DeviceRepository: Repository<Device> {
    fn get_by_guid(&self, guid: &Uuid) -> Result<Option<Device>, StoreError>;
}

pub trait NotificationRepository: Repository<DeviceNotification> {
    /// Notifications strictly newer than `since_ms`, oldest first.
    /// `None` for `device_ids` means every device.
    fn get_by_devices(
        &self,
        device_ids: Option<&[i64]>,
        since_ms: u64,
    ) -> Result<Vec<DeviceNotification>, StoreError>;
}

pub trait CommandRepository: Repository<DeviceCommand> {
    /// Commands for `device_id` strictly newer than `since_ms`, oldest first.
    fn get_by_device(
        &self,
        device_id: i64,
        since_ms: u64,
    ) -> Result<Vec<DeviceCommand>, StoreError>;
}

pub trait EquipmentRepository: Repository<DeviceEquipment> {
    fn get_by_device_and_code(
        &self,
        device_id: i64,
        code: &str,
    ) -> Result<Option<DeviceEquipment>, StoreError>;
}

/// Every repository the hub needs, behind one handle.
pub trait DataContext: Send + Sync {
    fn users(&self) -> &dyn UserRepository;
    fn access_keys(&self) -> &dyn AccessKeyRepository;
    fn networks(&self) -> &dyn NetworkRepository;
    fn device_classes(&self) -> &dyn DeviceClassRepository;
    fn devices(&self) -> &dyn DeviceRepository;
    fn notifications(&self) -> &dyn NotificationRepository;
    fn commands(&self) -> &dyn CommandRepository;
    fn equipment(&self) -> &dyn EquipmentRepository;
}

macro_rules! entity {
    ($ty:ty, $name:literal) => {
        impl Entity for $ty {
            const NAME: &'static str = $name;

            fn id(&self) -> i64 {
                self.id
            }

            fn set_id(&mut self, id: i64) {
                self.id = id;
            }
        }
    };
    ($ty:ty, $name:literal, stamped) => {
        impl Entity for $ty {
            const NAME: &'static str = $name;

            fn id(&self) -> i64 {
                self.id
            }

            fn set_id(&mut self, id: i64) {
                self.id = id;
            }

            fn stamp(&mut self, now_ms: u64) {
                if self.timestamp_ms == 0 {
                    self.timestamp_ms = now_ms;
                }
            }
        }
    };
}

entity!(User, "user");
entity!(AccessKey, "access key");
entity!(Network, "network");
entity!(DeviceClass, "device class");
entity!(Device, "device");
entity!(DeviceNotification, "notification", stamped);
entity!(DeviceCommand, "command", stamped);
entity!(DeviceEquipment, "equipment", stamped);

/// One table of records ordered by id.
pub struct MemoryTable<T> {
    rows: RwLock<BTreeMap<i64, T>>,
    next_id: AtomicI64,
}

impl<T: Entity> MemoryTable<T> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn find(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|row| pred(row))
            .cloned()
    }

    fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|row| pred(row))
            .cloned()
            .collect()
    }

    /// Save with a uniqueness check against other rows.
    fn save_unique(
        &self,
        entity: &mut T,
        clashes: impl Fn(&T, &T) -> bool,
        detail: impl Fn(&T) -> String,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        if rows
            .values()
            .any(|row| row.id() != entity.id() && clashes(row, entity))
        {
            return Err(StoreError::Conflict {
                entity: T::NAME,
                detail: detail(entity),
            });
        }
        self.insert(&mut rows, entity)
    }

    fn insert(&self, rows: &mut BTreeMap<i64, T>, entity: &mut T) -> Result<(), StoreError> {
        if entity.id() == 0 {
            entity.set_id(self.next_id.fetch_add(1, Ordering::Relaxed));
            entity.stamp(now_ms());
        } else if !rows.contains_key(&entity.id()) {
            // Seeded rows arrive with their own ids.
            self.next_id.fetch_max(entity.id() + 1, Ordering::Relaxed);
            entity.stamp(now_ms());
        }
        rows.insert(entity.id(), entity.clone());
        Ok(())
    }
}

impl<T: Entity> Default for MemoryTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Repository<T> for MemoryTable<T> {
    fn save(&self, entity: &mut T) -> Result<(), StoreError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        self.insert(&mut rows, entity)
    }

    fn get(&self, id: i64) -> Result<Option<T>, StoreError> {
        Ok(self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }
}

/// Implement `Repository<$ty>` for a newtype over `MemoryTable<$ty>` with a
/// uniqueness rule applied on save.
macro_rules! unique_table {
    ($name:ident, $ty:ty, |$a:ident, $b:ident| $clash:expr, |$e:ident| $detail:expr) => {
        #[derive(Default)]
        pub struct $name(MemoryTable<$ty>);

        impl Repository<$ty> for $name {
            fn save(&self, entity: &mut $ty) -> Result<(), StoreError> {
                self.0
                    .save_unique(entity, |$a, $b| $clash, |$e| $detail)
            }

            fn get(&self, id: i64) -> Result<Option<$ty>, StoreError> {
                self.0.get(id)
            }
        }
    };
}

unique_table!(
    UserTable,
    User,
    |a, b| a.login.eq_ignore_ascii_case(&b.login),
    |e| format!("login {}", e.login)
);
unique_table!(
    AccessKeyTable,
    AccessKey,
    |a, b| a.key == b.key,
    |e| format!("key {}", e.label)
);
unique_table!(
    DeviceTable,
    Device,
    |a, b| a.guid == b.guid,
    |e| format!("guid {}", e.guid)
);
unique_table!(
    EquipmentTable,
    DeviceEquipment,
    |a, b| a.device_id == b.device_id && a.code == b.code,
    |e| format!("code {} on device {}", e.code, e.device_id)
);

impl UserRepository for UserTable {
    fn get_by_login(&self, login: &str) -> Result<Option<User>, StoreError> {
        Ok(self.0.find(|u| u.login.eq_ignore_ascii_case(login)))
    }
}

impl AccessKeyRepository for AccessKeyTable {
    fn get_by_key(&self, key: &str) -> Result<Option<AccessKey>, StoreError> {
        Ok(self.0.find(|k| k.key == key))
    }
}

impl NetworkRepository for MemoryTable<Network> {
    fn get_by_name(&self, name: &str) -> Result<Option<Network>, StoreError> {
        Ok(self.find(|n| n.name == name))
    }
}

impl DeviceClassRepository for MemoryTable<DeviceClass> {
    fn get_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<DeviceClass>, StoreError> {
        Ok(self.find(|c| c.name == name && c.version == version))
    }
}

impl DeviceRepository for DeviceTable {
    fn get_by_guid(&self, guid: &Uuid) -> Result<Option<Device>, StoreError> {
        Ok(self.0.find(|d| d.guid == *guid))
    }
}

impl NotificationRepository for MemoryTable<DeviceNotification> {
    fn get_by_devices(
        &self,
        device_ids: Option<&[i64]>,
        since_ms: u64,
    ) -> Result<Vec<DeviceNotification>, StoreError> {
        let mut found = self.filter(|n| {
            n.timestamp_ms > since_ms && device_ids.is_none_or(|ids| ids.contains(&n.device_id))
        });
        found.sort_by_key(|n| (n.timestamp_ms, n.id));
        Ok(found)
    }
}

impl CommandRepository for MemoryTable<DeviceCommand> {
    fn get_by_device(
        &self,
        device_id: i64,
        since_ms: u64,
    ) -> Result<Vec<DeviceCommand>, StoreError> {
        let mut found = self.filter(|c| c.device_id == device_id && c.timestamp_ms > since_ms);
        found.sort_by_key(|c| (c.timestamp_ms, c.id));
        Ok(found)
    }
}

impl EquipmentRepository for EquipmentTable {
    fn get_by_device_and_code(
        &self,
        device_id: i64,
        code: &str,
    ) -> Result<Option<DeviceEquipment>, StoreError> {
        Ok(self.0.find(|e| e.device_id == device_id && e.code == code))
    }
}

/// Process-local store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    users: UserTable,
    access_keys: AccessKeyTable,
    networks: MemoryTable<Network>,
    device_classes: MemoryTable<DeviceClass>,
    devices: DeviceTable,
    notifications: MemoryTable<DeviceNotification>,
    commands: MemoryTable<DeviceCommand>,
    equipment: EquipmentTable,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataContext for MemoryStore {
    fn users(&self) -> &dyn UserRepository {
        &self.users
    }

    fn access_keys(&self) -> &dyn AccessKeyRepository {
        &self.access_keys
    }

    fn networks(&self) -> &dyn NetworkRepository {
        &self.networks
    }

    fn device_classes(&self) -> &dyn DeviceClassRepository {
        &self.device_classes
    }

    fn devices(&self) -> &dyn DeviceRepository {
        &self.devices
    }

    fn notifications(&self) -> &dyn NotificationRepository {
        &self.notifications
    }

    fn commands(&self) -> &dyn CommandRepository {
        &self.commands
    }

    fn equipment(&self) -> &dyn EquipmentRepository {
        &self.equipment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_protocol::UserRole;

    #[test]
    fn save_assigns_id_and_timestamp() {
        let store = MemoryStore::new();
        let mut n = DeviceNotification::new("temp", 1);
        store.notifications().save(&mut n).unwrap();
        assert!(n.id > 0);
        assert!(n.timestamp_ms > 0);

        let loaded = store.notifications().get(n.id).unwrap().unwrap();
        assert_eq!(loaded.notification, "temp");
        assert!(store.notifications().get(n.id + 100).unwrap().is_none());
    }

    #[test]
    fn explicit_timestamp_is_kept() {
        let store = MemoryStore::new();
        let mut c = DeviceCommand::new("on", 1);
        c.timestamp_ms = 5;
        store.commands().save(&mut c).unwrap();
        assert_eq!(store.commands().get(c.id).unwrap().unwrap().timestamp_ms, 5);
    }

    #[test]
    fn explicit_ids_are_kept_and_skipped_by_later_inserts() {
        let store = MemoryStore::new();
        let mut seeded = Network {
            id: 77,
            name: "seeded".into(),
            ..Default::default()
        };
        store.networks().save(&mut seeded).unwrap();
        let mut fresh = Network {
            name: "fresh".into(),
            ..Default::default()
        };
        store.networks().save(&mut fresh).unwrap();
        assert_eq!(seeded.id, 77);
        assert_eq!(fresh.id, 78);
        assert_eq!(store.networks().get_by_name("seeded").unwrap().map(|n| n.id), Some(77));
    }

    #[test]
    fn duplicate_login_conflicts() {
        let store = MemoryStore::new();
        store
            .users()
            .save(&mut User::new("admin", UserRole::Administrator))
            .unwrap();
        let mut again = User::new("ADMIN", UserRole::Client);
        assert!(matches!(
            store.users().save(&mut again),
            Err(StoreError::Conflict { .. })
        ));

        let mut existing = store.users().get_by_login("Admin").unwrap().unwrap();
        existing.login_attempts = 3;
        store.users().save(&mut existing).unwrap();
        assert_eq!(store.users().get(existing.id).unwrap().unwrap().login_attempts, 3);
    }

    #[test]
    fn notifications_since_filter_by_device_and_time() {
        let store = MemoryStore::new();
        for (device, ts) in [(1, 10), (2, 20), (1, 30)] {
            let mut n = DeviceNotification::new("x", device);
            n.timestamp_ms = ts;
            store.notifications().save(&mut n).unwrap();
        }
        let all = store.notifications().get_by_devices(None, 10).unwrap();
        assert_eq!(all.iter().map(|n| n.timestamp_ms).collect::<Vec<_>>(), vec![20, 30]);
        let one = store.notifications().get_by_devices(Some(&[1]), 0).unwrap();
        assert_eq!(one.len(), 2);
    }

    #[test]
    fn equipment_lookup_by_device_and_code() {
        let store = MemoryStore::new();
        let mut e = DeviceEquipment {
            code: "led".into(),
            device_id: 4,
            ..Default::default()
        };
        store.equipment().save(&mut e).unwrap();
        let found = store.equipment().get_by_device_and_code(4, "led").unwrap();
        assert_eq!(found.map(|f| f.id), Some(e.id));
        assert!(store.equipment().get_by_device_and_code(5, "led").unwrap().is_none());
    }
}
