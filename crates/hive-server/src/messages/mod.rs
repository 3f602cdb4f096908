//! Pipeline every device notification and command goes through: received
//! hooks, persistence, inserted hooks, then a bus broadcast.

pub mod handlers;

use std::collections::HashSet;
use std::sync::Arc;

use hive_bus::{DeviceCommandAdded, DeviceCommandUpdated, DeviceNotificationAdded, MessageBus};
use hive_protocol::{Device, DeviceCommand, DeviceNotification, User};
use uuid::Uuid;

use crate::store::{DataContext, StoreError};

pub use handlers::{DeviceStatusHandler, EquipmentHandler};

/// Outcome of a `*_received` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Drop the message: later hooks are skipped and nothing is stored.
    Abort,
}

pub struct NotificationContext {
    pub device: Device,
    pub notification: DeviceNotification,
    pub user: Option<User>,
}

pub struct CommandContext {
    pub device: Device,
    pub command: DeviceCommand,
    pub user: Option<User>,
}

/// Hooks into the pipeline. Every hook defaults to doing nothing.
pub trait MessageHandler: Send + Sync {
    fn notification_received(&self, _ctx: &mut NotificationContext) -> anyhow::Result<Flow> {
        Ok(Flow::Continue)
    }

    fn notification_inserted(&self, _ctx: &NotificationContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn command_received(&self, _ctx: &mut CommandContext) -> anyhow::Result<Flow> {
        Ok(Flow::Continue)
    }

    fn command_inserted(&self, _ctx: &CommandContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn command_updated(&self, _ctx: &CommandContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Which messages a handler sees. A `None` set matches everything; a
/// device without a network matches network id 0.
#[derive(Debug, Clone, Default)]
pub struct HandlerFilter {
    pub notification_names: Option<HashSet<String>>,
    pub command_names: Option<HashSet<String>>,
    pub device_guids: Option<HashSet<Uuid>>,
    pub device_class_ids: Option<HashSet<i64>>,
    pub network_ids: Option<HashSet<i64>>,
}

fn admits<T: Eq + std::hash::Hash>(set: &Option<HashSet<T>>, value: &T) -> bool {
    set.as_ref().is_none_or(|s| s.contains(value))
}

impl HandlerFilter {
    fn matches_device(&self, device: &Device) -> bool {
        admits(&self.device_guids, &device.guid)
            && admits(&self.device_class_ids, &device.device_class_id)
            && admits(&self.network_ids, &device.network_id.unwrap_or(0))
    }

    pub fn matches_notification(&self, device: &Device, notification: &DeviceNotification) -> bool {
        admits(&self.notification_names, &notification.notification) && self.matches_device(device)
    }

    pub fn matches_command(&self, device: &Device, command: &DeviceCommand) -> bool {
        admits(&self.command_names, &command.command) && self.matches_device(device)
    }
}

pub struct MessageHandlerInfo {
    pub name: String,
    pub handler: Arc<dyn MessageHandler>,
    pub filter: HandlerFilter,
}

impl MessageHandlerInfo {
    pub fn new(name: impl Into<String>, handler: Arc<dyn MessageHandler>, filter: HandlerFilter) -> Self {
        Self {
            name: name.into(),
            handler,
            filter,
        }
    }
}

pub struct MessageManager {
    handlers: Vec<MessageHandlerInfo>,
    store: Arc<dyn DataContext>,
    bus: Arc<MessageBus>,
}

impl MessageManager {
    pub fn new(handlers: Vec<MessageHandlerInfo>, store: Arc<dyn DataContext>, bus: Arc<MessageBus>) -> Self {
        Self { handlers, store, bus }
    }

    fn matching_notification(&self, device: &Device, notification: &DeviceNotification) -> Vec<&MessageHandlerInfo> {
        self.handlers
            .iter()
            .filter(|h| h.filter.matches_notification(device, notification))
            .collect()
    }

    fn matching_command(&self, device: &Device, command: &DeviceCommand) -> Vec<&MessageHandlerInfo> {
        self.handlers
            .iter()
            .filter(|h| h.filter.matches_command(device, command))
            .collect()
    }

    /// Run a notification through the pipeline. Returns the stored record,
    /// or `None` if a hook dropped it.
    pub async fn handle_notification(
        &self,
        device: Device,
        notification: DeviceNotification,
        user: Option<User>,
    ) -> Result<Option<DeviceNotification>, StoreError> {
        let mut ctx = NotificationContext {
            device,
            notification,
            user,
        };

        // Handlers are matched against the message as it arrived.
        let matching = self.matching_notification(&ctx.device, &ctx.notification);
        for info in &matching {
            match info.handler.notification_received(&mut ctx) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Abort) => {
                    tracing::debug!(handler = %info.name, notification = %ctx.notification.notification, "notification dropped");
                    return Ok(None);
                }
                Err(e) => tracing::error!(handler = %info.name, "notification_received hook failed: {e:#}"),
            }
        }

        ctx.notification.device_id = ctx.device.id;
        self.store.notifications().save(&mut ctx.notification)?;

        for info in &matching {
            if let Err(e) = info.handler.notification_inserted(&ctx) {
                tracing::error!(handler = %info.name, "notification_inserted hook failed: {e:#}");
            }
        }

        self.bus
            .notify(DeviceNotificationAdded {
                device_id: ctx.device.id,
                device_guid: ctx.device.guid.to_string(),
                notification_id: ctx.notification.id,
            })
            .await;
        Ok(Some(ctx.notification))
    }

    pub async fn handle_command(
        &self,
        device: Device,
        command: DeviceCommand,
        user: Option<User>,
    ) -> Result<Option<DeviceCommand>, StoreError> {
        let mut ctx = CommandContext {
            device,
            command,
            user,
        };

        let matching = self.matching_command(&ctx.device, &ctx.command);
        for info in &matching {
            match info.handler.command_received(&mut ctx) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Abort) => {
                    tracing::debug!(handler = %info.name, command = %ctx.command.command, "command dropped");
                    return Ok(None);
                }
                Err(e) => tracing::error!(handler = %info.name, "command_received hook failed: {e:#}"),
            }
        }

        ctx.command.device_id = ctx.device.id;
        self.store.commands().save(&mut ctx.command)?;

        for info in &matching {
            if let Err(e) = info.handler.command_inserted(&ctx) {
                tracing::error!(handler = %info.name, "command_inserted hook failed: {e:#}");
            }
        }

        self.bus
            .notify(DeviceCommandAdded {
                device_id: ctx.device.id,
                device_guid: ctx.device.guid.to_string(),
                command_id: ctx.command.id,
            })
            .await;
        Ok(Some(ctx.command))
    }

    /// Persist a command status update reported by its device.
    pub async fn handle_command_update(
        &self,
        device: Device,
        command: DeviceCommand,
        user: Option<User>,
    ) -> Result<DeviceCommand, StoreError> {
        let mut ctx = CommandContext {
            device,
            command,
            user,
        };
        self.store.commands().save(&mut ctx.command)?;

        for info in self.matching_command(&ctx.device, &ctx.command) {
            if let Err(e) = info.handler.command_updated(&ctx) {
                tracing::error!(handler = %info.name, "command_updated hook failed: {e:#}");
            }
        }

        self.bus
            .notify(DeviceCommandUpdated {
                device_id: ctx.device.id,
                device_guid: ctx.device.guid.to_string(),
                command_id: ctx.command.id,
            })
            .await;
        Ok(ctx.command)
    }
}
