//! Value-keyed routing of payloads to handlers.
//!
//! A router extracts the value at its configured key path and resolves it
//! against an explicit route table, falling back to a wildcard route (any
//! unmapped value) and then a default route (key absent). A matched route
//! may itself be a subrouter, which dispatches on its own key path with a
//! configurable payload scope.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use bw_common::{HandlerError, Message};

use crate::middleware::MiddlewareContext;

/// Payload slice handed to a resolved handler.
#[derive(Debug, Clone)]
pub struct ScopedPayload {
    /// The payload the matched route dispatched on.
    pub current: Value,
    /// The original full payload, present only under [`PayloadScope::Both`].
    pub root: Option<Value>,
}

/// A registered message handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        message: &Message,
        payload: &ScopedPayload,
        ctx: &mut MiddlewareContext,
    ) -> Result<Value, HandlerError>;
}

/// Narrow validation interface; the actual schema library is a collaborator.
pub trait PayloadSchema: Send + Sync {
    fn validate(&self, payload: &Value) -> Result<(), String>;
}

/// What a handler behind a subrouter receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadScope {
    /// Only the nested slice the subrouter dispatched on.
    #[default]
    Current,
    /// The original full payload.
    Root,
    /// Both the nested slice and the original payload.
    Both,
}

/// Behavior when no route, wildcard, or default matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmatchedPolicy {
    /// Unmatched messages are reported as failures.
    #[default]
    Strict,
    /// Unmatched messages are dropped silently.
    Lenient,
}

/// Behavior when schema validation rejects a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationPolicy {
    /// Validation failures are reported as failures.
    #[default]
    Surface,
    /// Validation failures drop the message silently.
    Skip,
}

/// How a dispatch was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Wildcard,
    Default,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RouteError {
    #[error("no route for dispatch value {value:?}")]
    NotFound { value: Option<String> },

    #[error("validation failed on route '{route}': {message}")]
    Validation { route: String, message: String },
}

enum RouteTarget {
    Handler(Arc<dyn Handler>),
    Subrouter {
        router: Arc<Router>,
        scope: PayloadScope,
    },
}

struct Route {
    target: RouteTarget,
    schema: Option<Arc<dyn PayloadSchema>>,
}

/// A successful dispatch: the handler to invoke and the payload it should see.
pub struct Resolution {
    pub handler: Arc<dyn Handler>,
    pub payload: ScopedPayload,
    /// Dot-joined path of matched values, e.g. `create.user`. Stable per
    /// route; used as the circuit-breaker key and in log events.
    pub label: String,
    pub matched: MatchKind,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("payload", &self.payload)
            .field("label", &self.label)
            .field("matched", &self.matched)
            .finish_non_exhaustive()
    }
}

/// Route table keyed by dispatch value. Registration order is preserved.
pub struct Router {
    key_path: String,
    routes: IndexMap<String, Route>,
    wildcard: Option<Route>,
    default_route: Option<Route>,
}

impl Router {
    pub fn new(key_path: impl Into<String>) -> Self {
        Self {
            key_path: key_path.into(),
            routes: IndexMap::new(),
            wildcard: None,
            default_route: None,
        }
    }

    pub fn key_path(&self) -> &str {
        &self.key_path
    }

    /// Register a handler for an exact dispatch value. At most one route per
    /// value; re-registering replaces the previous route.
    pub fn route(&mut self, value: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.insert_route(value.into(), RouteTarget::Handler(handler), None)
    }

    pub fn route_with_schema(
        &mut self,
        value: impl Into<String>,
        handler: Arc<dyn Handler>,
        schema: Arc<dyn PayloadSchema>,
    ) -> &mut Self {
        self.insert_route(value.into(), RouteTarget::Handler(handler), Some(schema))
    }

    /// Register the wildcard route, matched by any value without an exact route.
    pub fn wildcard(&mut self, handler: Arc<dyn Handler>) -> &mut Self {
        self.wildcard = Some(Route {
            target: RouteTarget::Handler(handler),
            schema: None,
        });
        self
    }

    /// Register the default route, used when the dispatch key is absent.
    pub fn default_route(&mut self, handler: Arc<dyn Handler>) -> &mut Self {
        self.default_route = Some(Route {
            target: RouteTarget::Handler(handler),
            schema: None,
        });
        self
    }

    /// Mount a nested router under an exact dispatch value.
    pub fn subrouter(
        &mut self,
        value: impl Into<String>,
        router: Arc<Router>,
        scope: PayloadScope,
    ) -> &mut Self {
        self.insert_route(value.into(), RouteTarget::Subrouter { router, scope }, None)
    }

    fn insert_route(
        &mut self,
        value: String,
        target: RouteTarget,
        schema: Option<Arc<dyn PayloadSchema>>,
    ) -> &mut Self {
        if self.routes.contains_key(&value) {
            debug!(key_path = %self.key_path, value = %value, "Replacing existing route");
        }
        self.routes.insert(value, Route { target, schema });
        self
    }

    /// Resolve a payload to a handler.
    ///
    /// Deterministic and side-effect free: the same payload always resolves
    /// to the same handler. Match priority is exact > wildcard > default.
    pub fn dispatch(&self, payload: &Value) -> Result<Resolution, RouteError> {
        self.dispatch_inner(payload, payload, Vec::new(), PayloadScope::Current)
    }

    fn dispatch_inner(
        &self,
        current: &Value,
        root: &Value,
        mut labels: Vec<String>,
        scope: PayloadScope,
    ) -> Result<Resolution, RouteError> {
        let value = match current.get(&self.key_path) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        let (route, matched, label) = match &value {
            Some(v) => {
                if let Some(route) = self.routes.get(v) {
                    (route, MatchKind::Exact, v.clone())
                } else if let Some(route) = &self.wildcard {
                    (route, MatchKind::Wildcard, "*".to_string())
                } else if let Some(route) = &self.default_route {
                    (route, MatchKind::Default, "_default".to_string())
                } else {
                    return Err(RouteError::NotFound {
                        value: value.clone(),
                    });
                }
            }
            None => {
                if let Some(route) = &self.default_route {
                    (route, MatchKind::Default, "_default".to_string())
                } else {
                    return Err(RouteError::NotFound { value: None });
                }
            }
        };

        labels.push(label);
        let route_label = labels.join(".");

        if let Some(schema) = &route.schema {
            schema
                .validate(current)
                .map_err(|message| RouteError::Validation {
                    route: route_label.clone(),
                    message,
                })?;
        }

        match &route.target {
            RouteTarget::Handler(handler) => {
                debug!(route = %route_label, matched = ?matched, "Route matched");
                let payload = match scope {
                    PayloadScope::Current => ScopedPayload {
                        current: current.clone(),
                        root: None,
                    },
                    PayloadScope::Root => ScopedPayload {
                        current: root.clone(),
                        root: None,
                    },
                    PayloadScope::Both => ScopedPayload {
                        current: current.clone(),
                        root: Some(root.clone()),
                    },
                };
                Ok(Resolution {
                    handler: handler.clone(),
                    payload,
                    label: route_label,
                    matched,
                })
            }
            RouteTarget::Subrouter {
                router,
                scope: child_scope,
            } => {
                // Descend into the nested slice when the payload carries an
                // object under the matched value; flat payloads dispatch on
                // the same object with the subrouter's own key path.
                let child = match value.as_deref().and_then(|v| current.get(v)) {
                    Some(nested @ Value::Object(_)) => nested,
                    _ => current,
                };
                router.dispatch_inner(child, root, labels, *child_scope)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NamedHandler(&'static str);

    #[async_trait]
    impl Handler for NamedHandler {
        async fn handle(
            &self,
            _message: &Message,
            _payload: &ScopedPayload,
            _ctx: &mut MiddlewareContext,
        ) -> Result<Value, HandlerError> {
            Ok(json!({ "handler": self.0 }))
        }
    }

    struct RequireField(&'static str);

    impl PayloadSchema for RequireField {
        fn validate(&self, payload: &Value) -> Result<(), String> {
            if payload.get(self.0).is_some() {
                Ok(())
            } else {
                Err(format!("missing field '{}'", self.0))
            }
        }
    }

    fn handler(name: &'static str) -> Arc<dyn Handler> {
        Arc::new(NamedHandler(name))
    }

    #[test]
    fn exact_match_outranks_wildcard_and_default() {
        let mut router = Router::new("action");
        router.route("update", handler("update"));
        router.wildcard(handler("wild"));
        router.default_route(handler("default"));

        let res = router.dispatch(&json!({"action": "update"})).unwrap();
        assert_eq!(res.matched, MatchKind::Exact);
        assert_eq!(res.label, "update");

        let res = router.dispatch(&json!({"action": "unknown"})).unwrap();
        assert_eq!(res.matched, MatchKind::Wildcard);
        assert_eq!(res.label, "*");

        let res = router.dispatch(&json!({"other": 1})).unwrap();
        assert_eq!(res.matched, MatchKind::Default);
        assert_eq!(res.label, "_default");
    }

    #[test]
    fn unmatched_value_without_fallback_is_not_found() {
        let mut router = Router::new("action");
        router.route("update", handler("update"));

        let err = router.dispatch(&json!({"action": "delete"})).unwrap_err();
        assert!(matches!(err, RouteError::NotFound { value: Some(v) } if v == "delete"));

        let err = router.dispatch(&json!({})).unwrap_err();
        assert!(matches!(err, RouteError::NotFound { value: None }));
    }

    #[test]
    fn dispatch_is_deterministic() {
        let mut router = Router::new("action");
        router.route("create", handler("create"));
        router.wildcard(handler("wild"));

        let payload = json!({"action": "create"});
        for _ in 0..3 {
            let res = router.dispatch(&payload).unwrap();
            assert_eq!(res.label, "create");
            assert_eq!(res.matched, MatchKind::Exact);
        }
    }

    #[test]
    fn nested_routers_build_dotted_labels() {
        let mut create = Router::new("entity");
        create.route("user", handler("create_user"));
        create.route("order", handler("create_order"));

        let mut root = Router::new("action");
        root.subrouter("create", Arc::new(create), PayloadScope::Current);
        root.route("delete", handler("delete"));

        let res = root
            .dispatch(&json!({"action": "create", "entity": "user"}))
            .unwrap();
        assert_eq!(res.label, "create.user");
        assert_eq!(res.matched, MatchKind::Exact);
    }

    #[test]
    fn nested_slice_descends_into_object_under_matched_value() {
        let mut create = Router::new("entity");
        create.route("user", handler("create_user"));

        let mut root = Router::new("action");
        root.subrouter("create", Arc::new(create), PayloadScope::Both);

        let payload = json!({
            "action": "create",
            "create": {"entity": "user", "name": "ada"}
        });
        let res = root.dispatch(&payload).unwrap();
        assert_eq!(res.label, "create.user");
        assert_eq!(res.payload.current, json!({"entity": "user", "name": "ada"}));
        assert_eq!(res.payload.root.as_ref().unwrap(), &payload);
    }

    #[test]
    fn root_scope_hands_back_the_full_payload() {
        let mut sub = Router::new("entity");
        sub.route("user", handler("user"));

        let mut root = Router::new("action");
        root.subrouter("create", Arc::new(sub), PayloadScope::Root);

        let payload = json!({"action": "create", "entity": "user"});
        let res = root.dispatch(&payload).unwrap();
        assert_eq!(res.payload.current, payload);
        assert!(res.payload.root.is_none());
    }

    #[test]
    fn schema_rejection_reports_route_label() {
        let mut router = Router::new("action");
        router.route_with_schema(
            "create",
            handler("create"),
            Arc::new(RequireField("order_id")),
        );

        let err = router.dispatch(&json!({"action": "create"})).unwrap_err();
        match err {
            RouteError::Validation { route, message } => {
                assert_eq!(route, "create");
                assert!(message.contains("order_id"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn numeric_dispatch_values_are_stringified() {
        let mut router = Router::new("version");
        router.route("2", handler("v2"));

        let res = router.dispatch(&json!({"version": 2})).unwrap();
        assert_eq!(res.label, "2");
    }
}
