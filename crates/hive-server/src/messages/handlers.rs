use std::sync::Arc;

use anyhow::{Context, anyhow};
use hive_protocol::DeviceEquipment;

use super::{MessageHandler, NotificationContext};
use crate::store::DataContext;

/// Copies the `status` parameter of a notification onto its device.
pub struct DeviceStatusHandler {
    store: Arc<dyn DataContext>,
}

impl DeviceStatusHandler {
    pub fn new(store: Arc<dyn DataContext>) -> Self {
        Self { store }
    }
}

impl MessageHandler for DeviceStatusHandler {
    fn notification_inserted(&self, ctx: &NotificationContext) -> anyhow::Result<()> {
        let status = ctx
            .notification
            .parameter_str("status")
            .ok_or_else(|| anyhow!("device-status notification without 'status' parameter"))?;
        let mut device = self
            .store
            .devices()
            .get(ctx.device.id)?
            .with_context(|| format!("device {} vanished", ctx.device.id))?;
        device.status = Some(status.to_string());
        self.store.devices().save(&mut device)?;
        tracing::debug!(device = %device.guid, status, "device status updated");
        Ok(())
    }
}

/// Keeps the latest state of each piece of equipment, keyed by the
/// `equipment` parameter.
pub struct EquipmentHandler {
    store: Arc<dyn DataContext>,
}

impl EquipmentHandler {
    pub fn new(store: Arc<dyn DataContext>) -> Self {
        Self { store }
    }
}

impl MessageHandler for EquipmentHandler {
    fn notification_inserted(&self, ctx: &NotificationContext) -> anyhow::Result<()> {
        let code = ctx
            .notification
            .parameter_str("equipment")
            .ok_or_else(|| anyhow!("equipment notification without 'equipment' parameter"))?
            .to_string();
        let mut parameters = ctx.notification.parameters.clone();
        if let Some(map) = parameters.as_mut().and_then(|p| p.as_object_mut()) {
            map.remove("equipment");
        }

        let mut equipment = self
            .store
            .equipment()
            .get_by_device_and_code(ctx.device.id, &code)?
            .unwrap_or_else(|| DeviceEquipment {
                code: code.clone(),
                device_id: ctx.device.id,
                ..Default::default()
            });
        equipment.timestamp_ms = ctx.notification.timestamp_ms;
        equipment.parameters = parameters;
        self.store.equipment().save(&mut equipment)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use hive_protocol::{Device, DeviceNotification};
    use serde_json::json;
    use uuid::Uuid;

    fn setup() -> (Arc<dyn DataContext>, Device) {
        let store = MemoryStore::new();
        let mut device = Device {
            guid: Uuid::new_v4(),
            name: "lamp".into(),
            ..Default::default()
        };
        store.devices().save(&mut device).unwrap();
        (Arc::new(store), device)
    }

    fn ctx(device: &Device, name: &str, parameters: serde_json::Value, ts: u64) -> NotificationContext {
        let mut notification = DeviceNotification::new(name, device.id);
        notification.parameters = Some(parameters);
        notification.timestamp_ms = ts;
        NotificationContext {
            device: device.clone(),
            notification,
            user: None,
        }
    }

    #[test]
    fn status_is_copied_to_device() {
        let (store, device) = setup();
        let handler = DeviceStatusHandler::new(store.clone());
        handler
            .notification_inserted(&ctx(&device, "device-status", json!({"status": "Online"}), 1))
            .unwrap();
        let stored = store.devices().get(device.id).unwrap().unwrap();
        assert_eq!(stored.status.as_deref(), Some("Online"));

        assert!(handler
            .notification_inserted(&ctx(&device, "device-status", json!({}), 2))
            .is_err());
    }

    #[test]
    fn equipment_state_is_upserted() {
        let (store, device) = setup();
        let handler = EquipmentHandler::new(store.clone());
        handler
            .notification_inserted(&ctx(&device, "equipment", json!({"equipment": "led", "on": true}), 10))
            .unwrap();
        handler
            .notification_inserted(&ctx(&device, "equipment", json!({"equipment": "led", "on": false}), 20))
            .unwrap();

        let state = store
            .equipment()
            .get_by_device_and_code(device.id, "led")
            .unwrap()
            .unwrap();
        assert_eq!(state.timestamp_ms, 20);
        assert_eq!(state.parameters, Some(json!({"on": false})));
    }
}
