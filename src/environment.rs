//! Per-request environment
//!
//! The [`Environment`] is the key/value view of the request being served
//! (rack-style header keys, remote address, user, locale...). The middleware
//! takes a snapshot per invocation and binds it to the handler's task, so the
//! leveled API can read it without any state shared between requests.
//!
//! Layers running inside the middleware can still add context to the
//! request they are serving: [`RequestContext::attach`] updates the bound
//! environment at once, and a [`RequestContext`] inserted straight into the
//! extensions is picked up when a report is built from the served request.

use actix_web::dev::ServiceRequest;
use actix_web::HttpMessage;
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use crate::event::ExceptionEvent;
use crate::utils::client_ip;

/// Key holding the current user
pub const CURRENT_USER_KEY: &str = "current_user";

/// Key the leveled API writes the outgoing message under
pub const MESSAGE_KEY: &str = "message";

/// Keys rendered in the environment section of a report, in no particular order
pub const ENV_WHITELIST: &[&str] = &[
    "HTTP_HOST",
    "HTTP_ORIGIN",
    "HTTP_REFERER",
    "CONTENT_TYPE",
    "HTTP_USER_AGENT",
    "REMOTE_ADDR",
    "REQUEST_URI",
    MESSAGE_KEY,
    CURRENT_USER_KEY,
    "page_ctx_id",
    "locale",
    "HTTP_X_FORWARDED_FOR",
    "HTTP_X_REAL_IP",
    "HTTP_X_REQUEST_ID",
    "HTTP_X_CLASSIFICATION",
];

tokio::task_local! {
    static CURRENT: LiveEnvironment;
}

/// Insertion-ordered string-keyed map of request data
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Environment {
    entries: Vec<(String, Value)>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing an existing entry in place or appending a new one
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy every entry of `other` over this environment
    pub fn merge(&mut self, other: &Environment) {
        for (key, value) in other.iter() {
            self.insert(key, value.clone());
        }
    }

    /// Merge the [`RequestContext`] extension of `req`, if it has one
    pub fn merge_request_context(&mut self, req: &impl HttpMessage) {
        if let Some(context) = req.extensions().get::<RequestContext>() {
            self.merge(&context.0);
        }
    }

    /// Snapshot of an incoming request
    ///
    /// Sensitive headers are left out. Entries of a [`RequestContext`]
    /// extension are appended last and win over header-derived keys.
    pub fn from_request(req: &ServiceRequest) -> Self {
        let mut env = Self::new();
        env.insert("REQUEST_METHOD", req.method().as_str());
        env.insert("REQUEST_URI", req.uri().to_string());

        let peer_addr = req.peer_addr().map(|addr| addr.ip().to_string());
        if let Some(ip) = client_ip(req.headers(), peer_addr.as_deref()) {
            env.insert("REMOTE_ADDR", ip);
        }

        for (name, value) in req.headers() {
            if is_sensitive_header(name.as_str()) {
                continue;
            }
            env.insert(rack_key(name.as_str()), String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        env.merge_request_context(req);
        env
    }

    /// Copy of the environment bound to the current task, empty when none is
    pub fn current() -> Self {
        CURRENT.try_with(LiveEnvironment::snapshot).unwrap_or_default()
    }

    /// Merge the [`RequestContext`] of `req` into the environment bound to
    /// the current task; no-op outside a bound task
    pub fn refresh_current(req: &impl HttpMessage) {
        let _ = CURRENT.try_with(|live| live.merge_request_context(req));
    }

    /// Run `fut` with this environment bound as the current one
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        LiveEnvironment::new(self).scope(fut).await
    }

    /// Run `f` with this environment bound as the current one
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        LiveEnvironment::new(self).sync_scope(f)
    }
}

/// Environment of one in-flight request
///
/// Clones share the same entries. The middleware keeps one clone and binds
/// another to the request's task, so context added by inner layers is seen
/// by the report built once the request is done.
#[derive(Debug, Clone, Default)]
pub struct LiveEnvironment(Rc<RefCell<Environment>>);

impl LiveEnvironment {
    pub fn new(env: Environment) -> Self {
        Self(Rc::new(RefCell::new(env)))
    }

    pub fn snapshot(&self) -> Environment {
        self.0.borrow().clone()
    }

    pub fn merge(&self, other: &Environment) {
        self.0.borrow_mut().merge(other);
    }

    pub fn merge_request_context(&self, req: &impl HttpMessage) {
        self.0.borrow_mut().merge_request_context(req);
    }

    /// Run `fut` with this environment bound as the current one
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// Run `f` with this environment bound as the current one
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(self, f)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = Self::new();
        for (key, value) in iter {
            env.insert(key, value);
        }
        env
    }
}

/// Request extension carrying context entries set by upstream layers
///
/// ```rust,ignore
/// req.extensions_mut().insert(RequestContext::from_iter([
///     ("current_user", json!({ "id": 42, "email": "a@b.c" })),
///     ("locale", json!("en")),
/// ]));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestContext(pub Environment);

impl RequestContext {
    /// Add these entries to `req`'s context and to the environment bound to
    /// the current task
    ///
    /// Existing context entries with other keys are kept. Use this from a
    /// layer wrapped by the middleware so that reports built for errors and
    /// panics, which no longer have the request at hand, still carry it.
    pub fn attach(self, req: &impl HttpMessage) {
        let _ = CURRENT.try_with(|live| live.merge(&self.0));
        let mut extensions = req.extensions_mut();
        match extensions.get_mut::<RequestContext>() {
            Some(existing) => existing.0.merge(&self.0),
            None => {
                extensions.insert(self);
            }
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for RequestContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        RequestContext(iter.into_iter().collect())
    }
}

/// Request extension: an exception an upstream layer caught and wants reported
#[derive(Debug, Clone)]
pub struct ReportedException(pub ExceptionEvent);

/// `user-agent` -> `HTTP_USER_AGENT`; content headers keep their CGI names
fn rack_key(header: &str) -> String {
    let key = header.to_uppercase().replace('-', "_");
    match key.as_str() {
        "CONTENT_TYPE" | "CONTENT_LENGTH" => key,
        _ => format!("HTTP_{key}"),
    }
}

fn is_sensitive_header(name: &str) -> bool {
    matches!(
        name,
        "authorization" | "cookie" | "set-cookie" | "proxy-authorization" | "x-api-key" | "x-auth-token"
    )
}
