use thiserror::Error;

use crate::store::StoreError;

/// Failure of a single request. None of these close the connection.
#[derive(Error, Debug)]
pub enum ActionError {
    /// A user-facing rejection; the message is sent to the client as is.
    #[error("{0}")]
    Request(String),

    #[error("Invalid format for parameter {0}")]
    InvalidParameter(String),

    #[error("Can't find action {action} in controller {controller}")]
    UnknownAction { action: String, controller: String },

    #[error("storage failure: {0}")]
    Store(#[from] StoreError),

    #[error("internal failure: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ActionError {
    pub fn request(message: impl Into<String>) -> Self {
        ActionError::Request(message.into())
    }

    pub fn missing(name: &str) -> Self {
        ActionError::Request(format!("Please specify '{name}'"))
    }

    /// True for failures caused by the request rather than the server.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            ActionError::Request(_)
                | ActionError::InvalidParameter(_)
                | ActionError::UnknownAction { .. }
        )
    }

    /// Text placed in the error envelope. Server faults are not described.
    pub fn client_message(&self) -> String {
        if self.is_request_error() {
            self.to_string()
        } else {
            "Server error".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_faults_are_masked() {
        let err = ActionError::from(anyhow::anyhow!("db exploded"));
        assert!(!err.is_request_error());
        assert_eq!(err.client_message(), "Server error");

        let err = ActionError::from(StoreError::NotFound {
            entity: "device",
            id: 3,
        });
        assert_eq!(err.client_message(), "Server error");
    }

    #[test]
    fn request_errors_are_passed_through() {
        assert_eq!(
            ActionError::InvalidParameter("deviceGuid".into()).client_message(),
            "Invalid format for parameter deviceGuid"
        );
        assert_eq!(
            ActionError::missing("command").client_message(),
            "Please specify 'command'"
        );
        assert_eq!(
            ActionError::UnknownAction {
                action: "fly".into(),
                controller: "client".into()
            }
            .client_message(),
            "Can't find action fly in controller client"
        );
    }
}
