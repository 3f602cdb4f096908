//! Device hub served over WebSockets.
//!
//! Devices connect on `/device` and publish notifications; clients connect on
//! `/client`, send commands and subscribe to notifications. Every stored
//! message is broadcast on the [`hive_bus::MessageBus`] so each node of a
//! cluster pushes it to its own subscribers.

pub mod access;
pub mod actions;
pub mod config;
pub mod controllers;
pub mod filters;
pub mod hub;
pub mod messages;
pub mod session;
pub mod store;
pub mod subscriptions;
pub mod ws;

pub use config::ServerConfig;
pub use hub::Hub;
pub use store::MemoryStore;
