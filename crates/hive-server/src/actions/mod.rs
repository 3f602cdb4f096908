//! Action dispatch: tables of named handlers built once per controller,
//! filter chains, and the path router that feeds them.

mod context;
mod controller;
mod error;
mod router;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

pub use context::ActionContext;
pub use controller::{ActionController, Controller, ControllerDispatch};
pub use error::ActionError;
pub use router::Router;

pub type ActionResult = Result<Map<String, Value>, ActionError>;

pub type ActionFuture = Pin<Box<dyn Future<Output = ActionResult> + Send>>;

type Handler<C> = Arc<dyn Fn(Arc<C>, ActionContext) -> ActionFuture + Send + Sync>;

/// Gate run before an action. All `authenticate` calls of an action's
/// filters run first, then all `authorize` calls, each in order.
pub trait ActionFilter: Send + Sync {
    fn authenticate(&self, _ctx: &mut ActionContext) -> Result<(), ActionError> {
        Ok(())
    }

    fn authorize(&self, _ctx: &ActionContext) -> Result<(), ActionError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Guid,
    Integer,
    String,
    Object,
    /// Milliseconds since the Unix epoch.
    Timestamp,
    Bool,
    Any,
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }

    fn check(&self, request: &Map<String, Value>) -> Result<(), ActionError> {
        let Some(value) = request.get(self.name).filter(|v| !v.is_null()) else {
            return if self.required {
                Err(ActionError::missing(self.name))
            } else {
                Ok(())
            };
        };
        let ok = match self.kind {
            ParamKind::Guid => value.as_str().and_then(hive_protocol::parse_guid).is_some(),
            ParamKind::Integer => value.is_i64(),
            ParamKind::String => value.is_string(),
            ParamKind::Object => value.is_object(),
            ParamKind::Timestamp => value.is_u64(),
            ParamKind::Bool => value.is_boolean(),
            ParamKind::Any => true,
        };
        if ok {
            Ok(())
        } else {
            Err(ActionError::InvalidParameter(self.name.to_string()))
        }
    }
}

/// A named action: filters, declared parameters and the handler.
pub struct ActionInfo<C> {
    name: String,
    filters: Vec<Arc<dyn ActionFilter>>,
    params: Vec<ParamSpec>,
    handler: Handler<C>,
}

impl<C: Send + Sync + 'static> ActionInfo<C> {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<C>, ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            filters: Vec::new(),
            params: Vec::new(),
            handler: Arc::new(move |controller: Arc<C>, ctx: ActionContext| -> ActionFuture {
                Box::pin(handler(controller, ctx))
            }),
        }
    }

    pub fn filter(mut self, filter: Arc<dyn ActionFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn invoke(&self, controller: Arc<C>, mut ctx: ActionContext) -> ActionResult {
        for filter in &self.filters {
            filter.authenticate(&mut ctx)?;
        }
        for filter in &self.filters {
            filter.authorize(&ctx)?;
        }
        for spec in &self.params {
            spec.check(ctx.request())?;
        }
        (self.handler)(controller, ctx).await
    }
}

/// Every action of one controller type, keyed by name.
pub struct ActionTable<C> {
    controller: String,
    actions: HashMap<String, ActionInfo<C>>,
    ping: Option<ActionInfo<C>>,
}

impl<C: Send + Sync + 'static> ActionTable<C> {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
            actions: HashMap::new(),
            ping: None,
        }
    }

    pub fn action(mut self, info: ActionInfo<C>) -> Self {
        self.actions.insert(info.name.clone(), info);
        self
    }

    /// Action run when the transport reports a ping from the peer.
    pub fn on_ping(mut self, info: ActionInfo<C>) -> Self {
        self.ping = Some(info);
        self
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }

    pub fn get(&self, action: &str) -> Option<&ActionInfo<C>> {
        self.actions.get(action)
    }

    pub fn ping(&self) -> Option<&ActionInfo<C>> {
        self.ping.as_ref()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionState, test_connection};
    use hive_protocol::Device;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    struct Step {
        label: &'static str,
        log: Arc<Recorder>,
        deny_auth: bool,
    }

    impl ActionFilter for Step {
        fn authenticate(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
            self.log.0.lock().unwrap().push(format!("authn:{}", self.label));
            ctx.auth = Some(SessionState::Device(Device::default()));
            Ok(())
        }

        fn authorize(&self, _ctx: &ActionContext) -> Result<(), ActionError> {
            self.log.0.lock().unwrap().push(format!("authz:{}", self.label));
            if self.deny_auth {
                return Err(ActionError::request("denied"));
            }
            Ok(())
        }
    }

    fn ctx(request: Value) -> ActionContext {
        let (conn, _rx) = test_connection("/test");
        let Value::Object(map) = request else {
            panic!("object expected")
        };
        ActionContext::new(conn, "echo", map)
    }

    async fn echo_handler(rec: Arc<Recorder>, ctx: ActionContext) -> ActionResult {
        rec.0.lock().unwrap().push("invoke".into());
        let n: i64 = ctx.param("n")?;
        assert!(ctx.device().is_some());
        Ok(hive_protocol::fields([("n", json!(n))]))
    }

    async fn record_handler(rec: Arc<Recorder>, _ctx: ActionContext) -> ActionResult {
        rec.0.lock().unwrap().push("invoke".into());
        Ok(Map::new())
    }

    fn echo(log: Arc<Recorder>) -> ActionInfo<Recorder> {
        ActionInfo::new("echo", echo_handler)
            .filter(Arc::new(Step {
                label: "a",
                log: log.clone(),
                deny_auth: false,
            }))
            .filter(Arc::new(Step {
                label: "b",
                log,
                deny_auth: false,
            }))
            .param(ParamSpec::required("n", ParamKind::Integer))
    }

    #[tokio::test]
    async fn filters_run_authentication_then_authorization_then_handler() {
        let log = Arc::new(Recorder::default());
        let info = echo(log.clone());
        let out = info.invoke(log.clone(), ctx(json!({"n": 4}))).await.unwrap();
        assert_eq!(out["n"], 4);
        assert_eq!(
            *log.0.lock().unwrap(),
            vec!["authn:a", "authn:b", "authz:a", "authz:b", "invoke"]
        );
    }

    #[tokio::test]
    async fn denied_authorization_skips_handler() {
        let log = Arc::new(Recorder::default());
        let info = ActionInfo::new("x", record_handler).filter(Arc::new(Step {
            label: "a",
            log: log.clone(),
            deny_auth: true,
        }));
        let err = info.invoke(log.clone(), ctx(json!({}))).await.unwrap_err();
        assert_eq!(err.to_string(), "denied");
        assert!(!log.0.lock().unwrap().contains(&"invoke".to_string()));
    }

    #[tokio::test]
    async fn parameter_coercion_failure_names_parameter() {
        let log = Arc::new(Recorder::default());
        let info = echo(log.clone());
        let err = info
            .invoke(log.clone(), ctx(json!({"n": "four"})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid format for parameter n");

        let err = info.invoke(log, ctx(json!({}))).await.unwrap_err();
        assert_eq!(err.to_string(), "Please specify 'n'");
    }

    #[test]
    fn param_kinds() {
        let request = json!({
            "g": uuid::Uuid::new_v4().to_string(),
            "ts": 1_700_000_000_000u64,
            "neg": -1,
            "o": {},
            "b": true,
        });
        let Value::Object(map) = request else { unreachable!() };
        assert!(ParamSpec::required("g", ParamKind::Guid).check(&map).is_ok());
        assert!(ParamSpec::required("ts", ParamKind::Timestamp).check(&map).is_ok());
        assert!(ParamSpec::required("neg", ParamKind::Timestamp).check(&map).is_err());
        assert!(ParamSpec::required("o", ParamKind::Object).check(&map).is_ok());
        assert!(ParamSpec::required("b", ParamKind::Bool).check(&map).is_ok());
        assert!(ParamSpec::required("o", ParamKind::String).check(&map).is_err());
        assert!(ParamSpec::optional("absent", ParamKind::Guid).check(&map).is_ok());
    }

    #[test]
    fn table_lookup() {
        let log = Arc::new(Recorder::default());
        let table = ActionTable::new("test").action(echo(log));
        assert!(table.get("echo").is_some());
        assert!(table.get("nope").is_none());
        assert!(table.ping().is_none());
        assert_eq!(table.controller(), "test");
    }
}
