//! Authentication and authorization filters shared by the controllers.

use std::sync::Arc;

use hive_protocol::{UserStatus, now_ms, parse_guid};

use crate::actions::{ActionContext, ActionError, ActionFilter};
use crate::session::SessionState;
use crate::store::DataContext;

const INVALID_CREDENTIALS: &str = "Invalid login or password";
const INVALID_ACCESS_KEY: &str = "Invalid access key";
const NOT_AUTHENTICATED: &str = "Please authenticate to invoke this action";

/// Reads `login`/`password` or `accessKey` from the request and, when
/// present, authenticates the user for this request.
pub struct AuthenticateClient {
    store: Arc<dyn DataContext>,
    max_login_attempts: u32,
}

impl AuthenticateClient {
    pub fn new(store: Arc<dyn DataContext>, max_login_attempts: u32) -> Self {
        Self {
            store,
            max_login_attempts,
        }
    }

    fn by_password(&self, login: &str, password: &str) -> Result<SessionState, ActionError> {
        let Some(mut user) = self.store.users().get_by_login(login)? else {
            return Err(ActionError::request(INVALID_CREDENTIALS));
        };
        if user.status != UserStatus::Active || !user.has_password() {
            return Err(ActionError::request(INVALID_CREDENTIALS));
        }

        if !user.is_valid_password(password) {
            user.login_attempts += 1;
            if self.max_login_attempts > 0 && user.login_attempts >= self.max_login_attempts {
                tracing::warn!(login = %user.login, "too many failed logins, locking user out");
                user.status = UserStatus::LockedOut;
            }
            self.store.users().save(&mut user)?;
            return Err(ActionError::request(INVALID_CREDENTIALS));
        }

        user.login_attempts = 0;
        user.last_login_ms = Some(now_ms());
        self.store.users().save(&mut user)?;
        Ok(SessionState::User {
            user,
            access_key: None,
        })
    }

    fn by_access_key(&self, key: &str) -> Result<SessionState, ActionError> {
        let access_key = match self.store.access_keys().get_by_key(key)? {
            Some(k) if !k.is_expired(now_ms()) => k,
            _ => return Err(ActionError::request(INVALID_ACCESS_KEY)),
        };
        let user = match self.store.users().get(access_key.user_id)? {
            Some(u) if u.status == UserStatus::Active => u,
            _ => return Err(ActionError::request(INVALID_ACCESS_KEY)),
        };
        Ok(SessionState::User {
            user,
            access_key: Some(access_key),
        })
    }
}

impl ActionFilter for AuthenticateClient {
    fn authenticate(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        let login: Option<String> = ctx.optional("login")?;
        let key: Option<String> = ctx.optional("accessKey")?;
        let state = match (login, key) {
            (Some(login), _) => {
                let password: String = ctx.param("password")?;
                self.by_password(&login, &password)?
            }
            (None, Some(key)) => self.by_access_key(&key)?,
            (None, None) => return Ok(()),
        };
        ctx.auth = Some(state);
        Ok(())
    }
}

/// Requires an authenticated user. With an access key, the key must grant
/// `permission` from the connection's host.
pub struct AuthorizeClient {
    permission: Option<&'static str>,
}

impl AuthorizeClient {
    pub fn new(permission: Option<&'static str>) -> Self {
        Self { permission }
    }
}

impl ActionFilter for AuthorizeClient {
    fn authorize(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let principal = ctx.principal();
        if principal.user().is_none() {
            return Err(ActionError::request(NOT_AUTHENTICATED));
        }
        if let (Some(key), Some(permission)) = (principal.access_key(), self.permission) {
            if key
                .permissions_for(permission, ctx.connection.host())
                .next()
                .is_none()
            {
                return Err(ActionError::request(
                    "The access key used does not allow execution of this action",
                ));
            }
        }
        Ok(())
    }
}

/// Authenticates a device from `deviceId` + `deviceKey` when both are sent.
pub struct AuthenticateDevice {
    store: Arc<dyn DataContext>,
}

impl AuthenticateDevice {
    pub fn new(store: Arc<dyn DataContext>) -> Self {
        Self { store }
    }
}

impl ActionFilter for AuthenticateDevice {
    fn authenticate(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        let id: Option<String> = ctx.optional("deviceId")?;
        let key: Option<String> = ctx.optional("deviceKey")?;
        let (Some(id), Some(key)) = (id, key) else {
            return Ok(());
        };
        let guid = parse_guid(&id).ok_or_else(|| ActionError::InvalidParameter("deviceId".into()))?;
        match self.store.devices().get_by_guid(&guid)? {
            Some(device) if device.is_valid_key(&key) => {
                ctx.auth = Some(SessionState::Device(device));
                Ok(())
            }
            _ => Err(ActionError::request("Device not found")),
        }
    }
}

pub struct AuthorizeDevice;

impl ActionFilter for AuthorizeDevice {
    fn authorize(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        if ctx.device().is_none() {
            return Err(ActionError::request(NOT_AUTHENTICATED));
        }
        Ok(())
    }
}

/// A device may register itself, or update the record it authenticated as.
pub struct AuthorizeDeviceRegistration {
    store: Arc<dyn DataContext>,
}

impl AuthorizeDeviceRegistration {
    pub fn new(store: Arc<dyn DataContext>) -> Self {
        Self { store }
    }
}

impl ActionFilter for AuthorizeDeviceRegistration {
    fn authorize(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let Some(guid) = ctx.guid("deviceId")? else {
            return Err(ActionError::missing("deviceId"));
        };
        let Some(existing) = self.store.devices().get_by_guid(&guid)? else {
            return Ok(());
        };
        match ctx.device() {
            Some(device) if device.id == existing.id => Ok(()),
            _ => Err(ActionError::request("Not authorized")),
        }
    }
}
