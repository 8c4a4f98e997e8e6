//! In-memory stand-in for an express-style server/client pair.
//!
//! Backend challenges register route handlers and then call them through a
//! `request` client, with no network stack involved. The route table is the
//! same type on both sides of the sandbox boundary:
//!
//! - guest code gets the `express()` global; the prelude keeps handler
//!   functions in an array and the [`MockRegistry`] in `OpState` stores
//!   their indices.
//! - Rust callers use [`MockApp`] with [`Handler`] trait objects.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

/// HTTP methods the mock understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl Method {
    /// Upper-case method name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = MockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Ok(Self::Get),
            "post" => Ok(Self::Post),
            "put" => Ok(Self::Put),
            "delete" => Ok(Self::Delete),
            _ => Err(MockError::UnknownMethod(s.to_string())),
        }
    }
}

/// Errors raised by the mock server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MockError {
    /// Dispatch to a `(method, path)` nobody registered.
    #[error("no matching route for {method} {path}")]
    NoMatchingRoute {
        /// Requested method.
        method: Method,
        /// Requested path.
        path: String,
    },

    /// `listen` with a port outside `0..=65535`.
    #[error("invalid port {0}: ports must be integers between 0 and 65535")]
    InvalidPort(String),

    /// A method name other than get/post/put/delete.
    #[error("unsupported method `{0}`")]
    UnknownMethod(String),

    /// A guest server id that was never created.
    #[error("unknown mock server #{0}")]
    UnknownServer(u32),

    /// The handler failed before responding.
    #[error("{0}")]
    Handler(String),

    /// The handler finished without calling `res.send(...)`.
    #[error("handler completed without sending a response")]
    NoResponse,
}

/// Snapshot returned by `getState()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerState {
    /// The port passed to `listen`, if any.
    pub port: Option<u16>,
    /// Whether `listen` has been called.
    pub is_listening: bool,
}

/// `(method, path) -> handler`.
///
/// Registering a pair twice replaces the earlier handler. Routes are never
/// removed.
#[derive(Debug, Clone)]
pub struct RouteTable<H> {
    routes: HashMap<(Method, String), H>,
}

impl<H> Default for RouteTable<H> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<H> RouteTable<H> {
    /// Register `handler`, returning the handler it replaced.
    pub fn insert(&mut self, method: Method, path: impl Into<String>, handler: H) -> Option<H> {
        self.routes.insert((method, path.into()), handler)
    }

    /// Look up the handler for `(method, path)`.
    pub fn resolve(&self, method: Method, path: &str) -> Result<&H, MockError> {
        self.routes
            .get(&(method, path.to_string()))
            .ok_or_else(|| MockError::NoMatchingRoute {
                method,
                path: path.to_string(),
            })
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no route is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// A route table plus listening state.
#[derive(Debug, Clone)]
pub struct MockServer<H> {
    routes: RouteTable<H>,
    state: ServerState,
}

impl<H> Default for MockServer<H> {
    fn default() -> Self {
        Self {
            routes: RouteTable::default(),
            state: ServerState::default(),
        }
    }
}

impl<H> MockServer<H> {
    /// Register a route.
    pub fn route(&mut self, method: Method, path: impl Into<String>, handler: H) -> Option<H> {
        self.routes.insert(method, path, handler)
    }

    /// Look up a route.
    pub fn resolve(&self, method: Method, path: &str) -> Result<&H, MockError> {
        self.routes.resolve(method, path)
    }

    /// Record `port` and mark the server listening.
    pub fn listen(&mut self, port: i64) -> Result<(), MockError> {
        let port = u16::try_from(port).map_err(|_| MockError::InvalidPort(port.to_string()))?;
        self.state = ServerState {
            port: Some(port),
            is_listening: true,
        };
        Ok(())
    }

    /// Current state.
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// The route table.
    pub fn routes(&self) -> &RouteTable<H> {
        &self.routes
    }
}

/// Mock servers created by one guest run, addressed by index.
///
/// Guest handlers live in the isolate; the table stores their slot in the
/// prelude's handler array.
#[derive(Debug, Default)]
pub struct MockRegistry {
    servers: Vec<MockServer<u32>>,
}

impl MockRegistry {
    /// Create a server and return its id.
    pub fn create(&mut self) -> u32 {
        self.servers.push(MockServer::default());
        (self.servers.len() - 1) as u32
    }

    /// Borrow a server.
    pub fn server(&self, id: u32) -> Result<&MockServer<u32>, MockError> {
        self.servers
            .get(id as usize)
            .ok_or(MockError::UnknownServer(id))
    }

    /// Mutably borrow a server.
    pub fn server_mut(&mut self, id: u32) -> Result<&mut MockServer<u32>, MockError> {
        self.servers
            .get_mut(id as usize)
            .ok_or(MockError::UnknownServer(id))
    }
}

/// The request object handed to a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// The dispatched payload.
    pub body: Value,
}

/// The response object handed to a handler. Sending consumes it.
#[derive(Debug)]
pub struct Response {
    tx: oneshot::Sender<Value>,
}

impl Response {
    /// Resolve the pending request with `value`.
    pub fn send(self, value: Value) {
        // The caller may have stopped waiting; nothing to report then.
        let _ = self.tx.send(value);
    }
}

/// A route handler for [`MockApp`].
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Handle a request. Returning an error rejects the pending request,
    /// unless `res.send` already resolved it.
    async fn handle(&self, req: Request, res: Response) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Request, Response) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, req: Request, res: Response) -> anyhow::Result<()> {
        (self)(req, res).await
    }
}

/// Rust-side counterpart of the guest `express()` object.
///
/// Registration takes `&mut self` and dispatch takes `&self`, so routes
/// cannot change while requests are in flight.
#[derive(Default)]
pub struct MockApp {
    server: MockServer<Arc<dyn Handler>>,
}

impl MockApp {
    /// Create an app with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `method` + `path`.
    pub fn route(
        &mut self,
        method: Method,
        path: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> &mut Self {
        self.server.route(method, path, Arc::new(handler));
        self
    }

    /// `app.get(path, handler)`.
    pub fn get(&mut self, path: impl Into<String>, handler: impl Handler + 'static) -> &mut Self {
        self.route(Method::Get, path, handler)
    }

    /// `app.post(path, handler)`.
    pub fn post(&mut self, path: impl Into<String>, handler: impl Handler + 'static) -> &mut Self {
        self.route(Method::Post, path, handler)
    }

    /// `app.put(path, handler)`.
    pub fn put(&mut self, path: impl Into<String>, handler: impl Handler + 'static) -> &mut Self {
        self.route(Method::Put, path, handler)
    }

    /// `app.delete(path, handler)`.
    pub fn delete(
        &mut self,
        path: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> &mut Self {
        self.route(Method::Delete, path, handler)
    }

    /// Record the port, mark the app listening, then run `callback`.
    pub fn listen(&mut self, port: i64, callback: impl FnOnce()) -> Result<(), MockError> {
        self.server.listen(port)?;
        callback();
        Ok(())
    }

    /// `getState()`.
    pub fn state(&self) -> ServerState {
        self.server.state()
    }

    /// The `request` client.
    pub fn request(&self) -> MockClient<'_> {
        MockClient { app: self }
    }
}

/// Dispatches requests to a [`MockApp`]. Each call gets its own response
/// channel, so concurrent requests never see each other's results.
#[derive(Clone, Copy)]
pub struct MockClient<'a> {
    app: &'a MockApp,
}

impl MockClient<'_> {
    /// `request.get(path, payload)`.
    pub async fn get(&self, path: &str, payload: Value) -> Result<Value, MockError> {
        self.dispatch(Method::Get, path, payload).await
    }

    /// `request.post(path, payload)`.
    pub async fn post(&self, path: &str, payload: Value) -> Result<Value, MockError> {
        self.dispatch(Method::Post, path, payload).await
    }

    /// `request.put(path, payload)`.
    pub async fn put(&self, path: &str, payload: Value) -> Result<Value, MockError> {
        self.dispatch(Method::Put, path, payload).await
    }

    /// `request.delete(path, payload)`.
    pub async fn delete(&self, path: &str, payload: Value) -> Result<Value, MockError> {
        self.dispatch(Method::Delete, path, payload).await
    }

    /// Look up the route and run its handler on a later scheduler turn.
    pub async fn dispatch(
        &self,
        method: Method,
        path: &str,
        payload: Value,
    ) -> Result<Value, MockError> {
        let handler = Arc::clone(self.app.server.resolve(method, path)?);
        tokio::task::yield_now().await;

        let (tx, mut rx) = oneshot::channel();
        let outcome = handler
            .handle(Request { body: payload }, Response { tx })
            .await;
        match outcome {
            Ok(()) => rx.await.map_err(|_| MockError::NoResponse),
            Err(e) => rx.try_recv().map_err(|_| MockError::Handler(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn echo(req: Request, res: Response) -> std::future::Ready<anyhow::Result<()>> {
        res.send(json!({ "echo": req.body }));
        std::future::ready(Ok(()))
    }

    #[test]
    fn method_parses_case_insensitively() {
        assert_eq!("GET".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("delete".parse::<Method>().unwrap(), Method::Delete);
        assert!(matches!(
            "patch".parse::<Method>(),
            Err(MockError::UnknownMethod(_))
        ));
    }

    #[test]
    fn route_table_replaces_duplicates() {
        let mut table = RouteTable::default();
        assert_eq!(table.insert(Method::Get, "/x", 1), None);
        assert_eq!(table.insert(Method::Get, "/x", 2), Some(1));
        assert_eq!(table.insert(Method::Post, "/x", 3), None);
        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve(Method::Get, "/x"), Ok(&2));
    }

    #[test]
    fn unregistered_route_reports_method_and_path() {
        let table: RouteTable<u32> = RouteTable::default();
        let err = table.resolve(Method::Put, "/missing").unwrap_err();
        assert_eq!(err.to_string(), "no matching route for PUT /missing");
    }

    #[test]
    fn listen_records_state() {
        let mut server: MockServer<u32> = MockServer::default();
        assert_eq!(server.state(), ServerState::default());
        server.listen(3000).unwrap();
        assert_eq!(
            server.state(),
            ServerState {
                port: Some(3000),
                is_listening: true
            }
        );
        assert!(matches!(server.listen(70000), Err(MockError::InvalidPort(_))));
        assert!(matches!(server.listen(-1), Err(MockError::InvalidPort(_))));
    }

    #[test]
    fn state_serializes_for_the_guest() {
        let state = ServerState {
            port: Some(8080),
            is_listening: true,
        };
        assert_eq!(
            serde_json::to_value(state).unwrap(),
            json!({ "port": 8080, "isListening": true })
        );
    }

    #[test]
    fn registry_addresses_servers_by_id() {
        let mut registry = MockRegistry::default();
        let a = registry.create();
        let b = registry.create();
        registry.server_mut(a).unwrap().route(Method::Get, "/", 7);
        assert!(registry.server(b).unwrap().routes().is_empty());
        assert_eq!(registry.server(a).unwrap().resolve(Method::Get, "/"), Ok(&7));
        assert_eq!(registry.server(9).unwrap_err(), MockError::UnknownServer(9));
    }

    #[tokio::test]
    async fn get_resolves_with_sent_value() {
        let mut app = MockApp::new();
        app.get("/x", echo);
        let value = app.request().get("/x", json!({ "n": 1 })).await.unwrap();
        assert_eq!(value, json!({ "echo": { "n": 1 } }));
    }

    #[tokio::test]
    async fn unregistered_path_rejects() {
        let mut app = MockApp::new();
        app.get("/x", echo);
        let err = app.request().post("/x", Value::Null).await.unwrap_err();
        assert_eq!(
            err,
            MockError::NoMatchingRoute {
                method: Method::Post,
                path: "/x".into()
            }
        );
    }

    #[tokio::test]
    async fn failing_handler_rejects() {
        let mut app = MockApp::new();
        app.post("/fail", |_req: Request, _res: Response| async {
            Err::<(), _>(anyhow::anyhow!("database unavailable"))
        });
        let err = app.request().post("/fail", Value::Null).await.unwrap_err();
        assert_eq!(err, MockError::Handler("database unavailable".into()));
    }

    #[tokio::test]
    async fn send_before_failure_still_resolves() {
        let mut app = MockApp::new();
        app.put("/late", |_req: Request, res: Response| async move {
            res.send(json!("done"));
            Err::<(), _>(anyhow::anyhow!("cleanup failed"))
        });
        let value = app.request().put("/late", Value::Null).await.unwrap();
        assert_eq!(value, json!("done"));
    }

    #[tokio::test]
    async fn handler_without_send_reports_no_response() {
        let mut app = MockApp::new();
        app.delete("/silent", |_req: Request, _res: Response| async {
            Ok::<(), anyhow::Error>(())
        });
        let err = app.request().delete("/silent", Value::Null).await.unwrap_err();
        assert_eq!(err, MockError::NoResponse);
    }

    #[tokio::test]
    async fn concurrent_requests_do_not_cross_talk() {
        let mut app = MockApp::new();
        app.get("/slow", |req: Request, res: Response| async move {
            let delay = req.body["delay"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            res.send(req.body["id"].clone());
            Ok::<(), anyhow::Error>(())
        });
        let client = app.request();
        let (a, b, c) = tokio::join!(
            client.get("/slow", json!({ "id": "a", "delay": 30 })),
            client.get("/slow", json!({ "id": "b", "delay": 0 })),
            client.get("/slow", json!({ "id": "c", "delay": 10 })),
        );
        assert_eq!(a.unwrap(), json!("a"));
        assert_eq!(b.unwrap(), json!("b"));
        assert_eq!(c.unwrap(), json!("c"));
    }

    #[test]
    fn listen_runs_callback_synchronously() {
        let mut app = MockApp::new();
        let mut called = false;
        app.listen(4000, || called = true).unwrap();
        assert!(called);
        assert!(app.state().is_listening);
    }
}
