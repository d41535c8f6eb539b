//! Per-request context

use crate::error::{Error, SharedError};
use crate::handler::{BoxedHandler, RetryOperation};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// State carried through a middleware chain for one request.
///
/// The context owns the chain-execution cursor: [`next`](Self::next) runs the
/// remaining handlers of the installed chain and [`abort`](Self::abort)
/// prevents every handler after the current one from running, whichever
/// layer it was registered in.
pub struct Context {
    /// Unique request ID for tracing
    pub request_id: String,

    /// HTTP method
    pub method: Method,

    /// Request path
    pub path: String,

    /// Request headers
    pub headers: HeaderMap,

    keys: HashMap<String, serde_json::Value>,
    status: Option<StatusCode>,
    body: Option<serde_json::Value>,
    response_headers: HeaderMap,
    errors: Vec<SharedError>,
    chain: Arc<[BoxedHandler]>,
    cursor: usize,
    aborted: bool,
    retry: Option<RetryOperation>,
    started_at: Instant,
}

impl Context {
    /// Create a new context for a `GET /` request
    pub fn new() -> Self {
        Self::request(Method::GET, "/")
    }

    /// Create a new context for the given method and path
    pub fn request(method: Method, path: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            keys: HashMap::new(),
            status: None,
            body: None,
            response_headers: HeaderMap::new(),
            errors: Vec::new(),
            chain: Arc::from(Vec::<BoxedHandler>::new()),
            cursor: 0,
            aborted: false,
            retry: None,
            started_at: Instant::now(),
        }
    }

    /// Add a request header (builder style)
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Time elapsed since the context was created
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    // --- chain control ---------------------------------------------------

    /// Run the remaining handlers of the installed chain
    pub fn next(&mut self) {
        while !self.aborted {
            let Some(handler) = self.chain.get(self.cursor).cloned() else {
                break;
            };
            self.cursor += 1;
            handler.handle(self);
        }
    }

    /// Stop the chain; no further handler runs
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Write a JSON response and stop the chain
    pub fn abort_with_json<T: Serialize>(&mut self, status: StatusCode, body: T) {
        self.json(status, body);
        self.abort();
    }

    /// Whether the chain was aborted
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Install `chain`, run it to completion, then restore the chain that was
    /// running before. The aborted flag is not restored, so an abort inside a
    /// nested chain also stops the enclosing one.
    pub fn run_chain(&mut self, chain: Arc<[BoxedHandler]>) {
        let previous_chain = std::mem::replace(&mut self.chain, chain);
        let previous_cursor = std::mem::replace(&mut self.cursor, 0);
        self.next();
        self.chain = previous_chain;
        self.cursor = previous_cursor;
    }

    // --- key/value storage -------------------------------------------------

    /// Store a value under `key`
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.keys.insert(key.into(), value.into());
    }

    /// Get the value stored under `key`
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.keys.get(key)
    }

    /// Get a string value stored under `key`
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.keys.get(key).and_then(|v| v.as_str())
    }

    // --- response ----------------------------------------------------------

    /// Write a JSON response body
    pub fn json<T: Serialize>(&mut self, status: StatusCode, body: T) {
        match serde_json::to_value(body) {
            Ok(value) => {
                self.status = Some(status);
                self.body = Some(value);
            }
            Err(e) => {
                tracing::warn!(request_id = %self.request_id, error = %e, "Failed to serialize response body");
                self.status = Some(StatusCode::INTERNAL_SERVER_ERROR);
                self.push_error(Error::Serialization(e));
            }
        }
    }

    /// Response status, if one was written
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Set the response status without a body
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// Response body, if one was written
    pub fn body(&self) -> Option<&serde_json::Value> {
        self.body.as_ref()
    }

    /// Whether a response has been written
    pub fn is_written(&self) -> bool {
        self.status.is_some()
    }

    /// Set a response header
    pub fn set_response_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.response_headers.insert(name, value);
    }

    /// Response headers
    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    // --- errors ------------------------------------------------------------

    /// Attach an error to the request
    pub fn push_error<E>(&mut self, err: E)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.errors.push(Arc::new(err));
    }

    /// Attach an already shared error to the request
    pub fn push_shared_error(&mut self, err: SharedError) {
        self.errors.push(err);
    }

    /// Errors attached so far
    pub fn errors(&self) -> &[SharedError] {
        &self.errors
    }

    /// Most recently attached error
    pub fn last_error(&self) -> Option<&SharedError> {
        self.errors.last()
    }

    /// Whether any error was attached
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Drain attached errors
    pub fn take_errors(&mut self) -> Vec<SharedError> {
        std::mem::take(&mut self.errors)
    }

    // --- retry -------------------------------------------------------------

    /// Register the operation the retry recovery action re-executes
    pub fn set_retry_operation<F>(&mut self, op: F)
    where
        F: Fn(&mut Context) -> Result<(), SharedError> + Send + Sync + 'static,
    {
        self.retry = Some(Arc::new(op));
    }

    /// The registered retry operation
    pub fn retry_operation(&self) -> Option<RetryOperation> {
        self.retry.clone()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("status", &self.status)
            .field("errors", &self.errors.len())
            .field("cursor", &self.cursor)
            .field("chain_len", &self.chain.len())
            .field("aborted", &self.aborted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl Recorder {
        fn push(&self, name: &'static str) {
            self.0.lock().unwrap().push(name);
        }

        fn take(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }

    fn recording(recorder: &Recorder, name: &'static str) -> BoxedHandler {
        let recorder = recorder.clone();
        handler_fn(move |_ctx| recorder.push(name))
    }

    #[test]
    fn test_request_context() {
        let mut ctx = Context::request(Method::POST, "/orders");
        assert!(!ctx.request_id.is_empty());
        assert_eq!(ctx.path, "/orders");

        ctx.set("user_id", "123");
        assert_eq!(ctx.get_str("user_id"), Some("123"));
        assert!(ctx.get("missing").is_none());
    }

    #[test]
    fn test_chain_runs_in_order_without_explicit_next() {
        let recorder = Recorder::default();
        let chain: Arc<[BoxedHandler]> = Arc::from(vec![
            recording(&recorder, "a"),
            recording(&recorder, "b"),
            recording(&recorder, "c"),
        ]);

        let mut ctx = Context::new();
        ctx.run_chain(chain);
        assert_eq!(recorder.take(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_next_runs_downstream_before_returning() {
        let recorder = Recorder::default();
        let outer = {
            let recorder = recorder.clone();
            handler_fn(move |ctx| {
                recorder.push("outer:before");
                ctx.next();
                recorder.push("outer:after");
            })
        };
        let chain: Arc<[BoxedHandler]> = Arc::from(vec![outer, recording(&recorder, "inner")]);

        let mut ctx = Context::new();
        ctx.run_chain(chain);
        assert_eq!(
            recorder.take(),
            vec!["outer:before", "inner", "outer:after"]
        );
    }

    #[test]
    fn test_abort_stops_remaining_handlers() {
        let recorder = Recorder::default();
        let chain: Arc<[BoxedHandler]> = Arc::from(vec![
            recording(&recorder, "first"),
            handler_fn(|ctx| ctx.abort_with_json(StatusCode::FORBIDDEN, "denied")),
            recording(&recorder, "never"),
        ]);

        let mut ctx = Context::new();
        ctx.run_chain(chain);
        assert_eq!(recorder.take(), vec!["first"]);
        assert!(ctx.is_aborted());
        assert_eq!(ctx.status(), Some(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_nested_chain_abort_propagates() {
        let recorder = Recorder::default();
        let inner: Arc<[BoxedHandler]> = Arc::from(vec![handler_fn(|ctx| ctx.abort())]);
        let chain: Arc<[BoxedHandler]> = Arc::from(vec![
            handler_fn(move |ctx| ctx.run_chain(inner.clone())),
            recording(&recorder, "after-nested"),
        ]);

        let mut ctx = Context::new();
        ctx.run_chain(chain);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_error_accumulator() {
        let mut ctx = Context::new();
        assert!(!ctx.has_errors());

        ctx.push_error(Error::Timeout("upstream".to_string()));
        ctx.push_error(Error::Validation("name".to_string()));
        assert_eq!(ctx.errors().len(), 2);
        assert!(ctx.last_error().unwrap().to_string().contains("Validation"));

        let drained = ctx.take_errors();
        assert_eq!(drained.len(), 2);
        assert!(!ctx.has_errors());
    }

    #[test]
    fn test_json_response() {
        let mut ctx = Context::new();
        assert!(!ctx.is_written());
        ctx.json(StatusCode::CREATED, serde_json::json!({"id": 7}));
        assert_eq!(ctx.status(), Some(StatusCode::CREATED));
        assert_eq!(ctx.body().unwrap()["id"], 7);
    }

    #[test]
    fn test_retry_operation_roundtrip() {
        let mut ctx = Context::new();
        assert!(ctx.retry_operation().is_none());
        ctx.set_retry_operation(|ctx| {
            ctx.set("retried", true);
            Ok(())
        });

        let op = ctx.retry_operation().unwrap();
        op(&mut ctx).unwrap();
        assert_eq!(ctx.get("retried"), Some(&serde_json::json!(true)));
    }
}
