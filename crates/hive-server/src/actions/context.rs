use std::sync::Arc;

use hive_protocol::{AccessKey, Device, User, parse_guid};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::ActionError;
use crate::session::{Connection, SessionState};

/// One inbound request on its way through filters to a handler.
pub struct ActionContext {
    pub connection: Arc<Connection>,
    pub action: String,
    request: Map<String, Value>,
    /// Principal established by a filter for this request only.
    pub auth: Option<SessionState>,
}

impl ActionContext {
    pub fn new(connection: Arc<Connection>, action: impl Into<String>, request: Map<String, Value>) -> Self {
        Self {
            connection,
            action: action.into(),
            request,
            auth: None,
        }
    }

    pub fn request(&self) -> &Map<String, Value> {
        &self.request
    }

    /// Raw value of `name`; JSON `null` counts as absent.
    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.request.get(name).filter(|v| !v.is_null())
    }

    /// Typed parameter; a missing value yields `T::default()`.
    pub fn param<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, ActionError> {
        Ok(self.optional(name)?.unwrap_or_default())
    }

    pub fn optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ActionError> {
        match self.raw(name) {
            None => Ok(None),
            Some(value) => T::deserialize(value)
                .map(Some)
                .map_err(|_| ActionError::InvalidParameter(name.to_string())),
        }
    }

    pub fn required<T: DeserializeOwned>(&self, name: &str) -> Result<T, ActionError> {
        self.optional(name)?.ok_or_else(|| ActionError::missing(name))
    }

    pub fn guid(&self, name: &str) -> Result<Option<Uuid>, ActionError> {
        match self.raw(name) {
            None => Ok(None),
            Some(Value::String(text)) => parse_guid(text)
                .map(Some)
                .ok_or_else(|| ActionError::InvalidParameter(name.to_string())),
            Some(_) => Err(ActionError::InvalidParameter(name.to_string())),
        }
    }

    /// A single guid or an array of guids; `None` when absent.
    pub fn guid_list(&self, name: &str) -> Result<Option<Vec<Uuid>>, ActionError> {
        let invalid = || ActionError::InvalidParameter(name.to_string());
        match self.raw(name) {
            None => Ok(None),
            Some(Value::String(text)) => Ok(Some(vec![parse_guid(text).ok_or_else(invalid)?])),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| item.as_str().and_then(parse_guid).ok_or_else(invalid))
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(_) => Err(invalid()),
        }
    }

    /// The request principal if a filter set one, else the connection session.
    pub fn principal(&self) -> SessionState {
        match &self.auth {
            Some(state) => state.clone(),
            None => self.connection.session(),
        }
    }

    pub fn user(&self) -> Option<User> {
        self.principal().user().cloned()
    }

    pub fn access_key(&self) -> Option<AccessKey> {
        self.principal().access_key().cloned()
    }

    pub fn device(&self) -> Option<Device> {
        self.principal().device().cloned()
    }
}
