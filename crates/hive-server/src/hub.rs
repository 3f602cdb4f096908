//! Wiring of one hub node: bus, message pipeline, controllers and router.

use std::sync::Arc;

use anyhow::{Context, Result};
use hive_bus::{DeviceCommandAdded, DeviceCommandUpdated, DeviceNotificationAdded, MessageBus, Transport};

use crate::actions::{ActionController, Router};
use crate::config::{ServerConfig, build_handlers};
use crate::controllers::{ClientController, DeviceController};
use crate::messages::MessageManager;
use crate::store::DataContext;

pub struct Hub {
    pub router: Router,
    pub bus: Arc<MessageBus>,
    pub messages: Arc<MessageManager>,
    pub store: Arc<dyn DataContext>,
}

impl Hub {
    /// Start the bus on `transport` and mount `/client` and `/device`.
    pub async fn start(
        config: &ServerConfig,
        store: Arc<dyn DataContext>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let bus = MessageBus::start(transport)
            .await
            .context("failed to start message bus")?;
        let handlers = build_handlers(&config.message_handlers, &store)?;
        let messages = Arc::new(MessageManager::new(handlers, store.clone(), bus.clone()));

        let client = Arc::new(ClientController::new(
            store.clone(),
            messages.clone(),
            config.server_info(),
            config.authentication.max_login_attempts,
        ));
        let device = Arc::new(DeviceController::new(
            store.clone(),
            messages.clone(),
            config.server_info(),
        ));

        let notified = client.clone();
        bus.subscribe(move |event: DeviceNotificationAdded| notified.handle_device_notification(event));
        let updated = client.clone();
        bus.subscribe(move |event: DeviceCommandUpdated| updated.handle_command_update(event));
        let commanded = device.clone();
        bus.subscribe(move |event: DeviceCommandAdded| commanded.handle_device_command(event));

        let mut router = Router::new();
        let client_table = client.action_table();
        router.register_controller("/client", Arc::new(ActionController::new(client, client_table)));
        let device_table = device.action_table();
        router.register_controller("/device", Arc::new(ActionController::new(device, device_table)));

        tracing::info!(handlers = config.message_handlers.len(), "hub started");
        Ok(Arc::new(Self {
            router,
            bus,
            messages,
            store,
        }))
    }

    pub async fn stop(&self) {
        self.bus.stop().await;
        tracing::info!("hub stopped");
    }
}
