//! Route table: normalized path -> access policy + handler factory.

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;
use tracing::debug;

use crate::handlers::{HandlerFactory, Params, RequestStream, SessionChannel};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no handler registered for path {0}")]
    NotFound(String),
}

/// Who may use a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    AllUsers,
    Users(HashSet<String>),
}

/// A registered route.
#[derive(Debug, Clone)]
pub struct Route {
    pub path: String,
    pub access: Access,
}

impl Route {
    pub fn new(path: impl Into<String>, access: Access) -> Self {
        Self {
            path: path.into(),
            access,
        }
    }

    /// Whether `user` is allowed to reach this route.
    pub fn allows(&self, user: &str) -> bool {
        match &self.access {
            Access::AllUsers => true,
            Access::Users(names) => names.contains(user),
        }
    }
}

struct Entry {
    route: Route,
    factory: HandlerFactory,
}

/// Read-only after startup; shared between connections behind an `Arc`.
#[derive(Default)]
pub struct Router {
    entries: HashMap<String, Entry>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route under its routing key. A later registration for the
    /// same key replaces the earlier one.
    pub fn register(&mut self, mut route: Route, factory: HandlerFactory) {
        let key = routing_key(&route.path).to_string();
        route.path.clone_from(&key);
        if self.entries.contains_key(&key) {
            debug!("Route {} registered again, replacing previous handler", key);
        }
        self.entries.insert(key, Entry { route, factory });
    }

    pub fn lookup(&self, key: &str) -> Option<&Route> {
        self.entries.get(key).map(|entry| &entry.route)
    }

    /// All registered routing keys, sorted ascending.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Start a fresh handler for `key` on its own task and return immediately.
    pub fn dispatch(
        &self,
        key: &str,
        channel: SessionChannel,
        requests: RequestStream,
        params: Params,
    ) -> Result<(), RouteError> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| RouteError::NotFound(key.to_string()))?;

        debug!("Handle {} with a new handler", key);
        let mut handler = (entry.factory)();
        handler.inject_parameters(params);
        tokio::spawn(async move {
            handler.handle(channel, requests).await;
        });
        Ok(())
    }
}

/// The part of a requested path before the first `?`.
pub fn routing_key(path: &str) -> &str {
    match path.split_once('?') {
        Some((key, _)) => key,
        None => path,
    }
}

/// Query parameters of a requested path. Repeated names are joined with `,`.
pub fn extract_params(path: &str) -> Params {
    let Some((_, query)) = path.split_once('?') else {
        return Params::new();
    };

    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        grouped
            .entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }

    grouped
        .into_iter()
        .map(|(name, values)| (name, values.join(",")))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::{mpsc, oneshot};

    use super::*;
    use crate::handlers::testing::RecordingControl;
    use crate::handlers::{Handler, PendingRequests};

    #[test]
    fn test_routing_key() {
        assert_eq!(routing_key("/echo"), "/echo");
        assert_eq!(routing_key("/echo?a=1"), "/echo");
        assert_eq!(routing_key("/echo?a=1?b=2"), "/echo");
        assert_eq!(routing_key("/echo?"), "/echo");
    }

    #[test]
    fn test_extract_params() {
        assert!(extract_params("/echo").is_empty());

        let params = extract_params("/echo?host=db1&tag=a&tag=b&msg=hello%20world");
        assert_eq!(params.len(), 3);
        assert_eq!(params["host"], "db1");
        assert_eq!(params["tag"], "a,b");
        assert_eq!(params["msg"], "hello world");
    }

    #[test]
    fn test_same_path_different_queries_share_key() {
        assert_eq!(routing_key("/x?a=1"), routing_key("/x?b=2"));
        assert_ne!(extract_params("/x?a=1"), extract_params("/x?b=2"));
    }

    #[test]
    fn test_route_access() {
        let open = Route::new("/open", Access::AllUsers);
        assert!(open.allows("anyone"));
        assert!(open.allows(""));

        let admin = Route::new("/admin", Access::Users(HashSet::from(["alice".to_string()])));
        assert!(admin.allows("alice"));
        assert!(!admin.allows("bob"));
        assert!(!admin.allows("Alice"));
    }

    struct ProbeHandler {
        params: Params,
        done: Option<oneshot::Sender<Params>>,
    }

    #[async_trait]
    impl Handler for ProbeHandler {
        fn inject_parameters(&mut self, params: Params) {
            self.params = params;
        }

        async fn handle(&mut self, _channel: SessionChannel, _requests: RequestStream) {
            if let Some(done) = self.done.take() {
                let _ = done.send(self.params.clone());
            }
        }
    }

    fn channel() -> (SessionChannel, RequestStream) {
        let (stream, _peer) = tokio::io::duplex(64);
        let (_tx, rx) = mpsc::channel(1);
        (
            SessionChannel::new(stream, Arc::new(RecordingControl::default())),
            RequestStream::new(PendingRequests::new(1), rx),
        )
    }

    #[tokio::test]
    async fn test_dispatch_unknown_route() {
        let router = Router::new();
        let (ch, reqs) = channel();
        let err = router.dispatch("/missing", ch, reqs, Params::new()).unwrap_err();
        assert!(matches!(err, RouteError::NotFound(key) if key == "/missing"));
    }

    #[tokio::test]
    async fn test_dispatch_last_registration_wins() {
        let created = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));

        let mut router = Router::new();
        router.register(
            Route::new("/job", Access::AllUsers),
            Arc::new(|| -> Box<dyn Handler> { panic!("replaced factory must not run") }),
        );
        let counter = created.clone();
        router.register(
            Route::new("/job?ignored=1", Access::Users(HashSet::new())),
            Arc::new(move || -> Box<dyn Handler> {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::new(ProbeHandler {
                    params: Params::new(),
                    done: tx.lock().unwrap().take(),
                })
            }),
        );

        assert_eq!(router.keys(), ["/job"]);
        assert!(!router.lookup("/job").unwrap().allows("alice"));

        let (ch, reqs) = channel();
        let params = Params::from([("k".to_string(), "v".to_string())]);
        router.dispatch("/job", ch, reqs, params.clone()).unwrap();

        assert_eq!(rx.await.unwrap(), params);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }
}
