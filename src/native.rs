use std::sync::{Arc, Mutex, MutexGuard};

use http::{HeaderMap, Method};
use reqwest::Client as ReqwestClient;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::request::{Body, XmlDocument};
use crate::sync::guard;

/// Ready state of a native request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ReadyState {
    /// Not opened yet, or aborted
    #[default]
    Unsent = 0,
    /// `open` was called
    Opened = 1,
    /// Status and headers are known
    HeadersReceived = 2,
    /// Body is being received
    Loading = 3,
    /// The request finished, successfully or not
    Done = 4,
}

impl ReadyState {
    /// Check if this is the terminal state
    pub fn is_done(self) -> bool {
        self == ReadyState::Done
    }
}

/// Completion notification hook, called on every ready state change
pub type ReadyStateObserver = Arc<dyn Fn() + Send + Sync>;

/// The host-provided request primitive a [`Transport`](crate::transport::Transport) wraps
///
/// It performs the actual network I/O and reports readiness through the
/// observer. Implementations must not hold internal locks while calling the
/// observer, since the observer reads back through this same interface.
pub trait NativeRequest: Send + Sync {
    /// Prepare a request, resetting any previous response
    fn open(
        &self,
        method: &Method,
        url: &str,
        asynchronous: bool,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<()>;

    /// Set a header on the opened request
    fn set_request_header(&self, name: &str, value: &str) -> Result<()>;

    /// Issue the opened request
    fn send(&self, body: Option<Body>) -> Result<()>;

    /// Abort the request in flight, if any
    fn abort(&self);

    /// Current ready state
    fn ready_state(&self) -> ReadyState;

    /// HTTP status, 0 until headers are received or after a network failure
    fn status(&self) -> u16;

    /// Raw response body
    fn response_text(&self) -> Option<String>;

    /// Response body as a document, when the server sent XML
    fn response_xml(&self) -> Option<XmlDocument>;

    /// All response headers, one `name: value` per line
    fn get_all_response_headers(&self) -> String;

    /// A single response header
    fn get_response_header(&self, name: &str) -> Option<String>;

    /// Attach or detach the state-change observer
    fn set_observer(&self, observer: Option<ReadyStateObserver>);
}

/// Creates native request handles for new transports
pub trait NativeFactory: Send + Sync {
    /// Create a fresh native request
    fn create(&self) -> Arc<dyn NativeRequest>;
}

impl<F> NativeFactory for F
where
    F: Fn() -> Arc<dyn NativeRequest> + Send + Sync,
{
    fn create(&self) -> Arc<dyn NativeRequest> {
        self()
    }
}

/// Factory for [`ReqwestNative`] handles sharing one reqwest client
#[derive(Debug, Clone, Default)]
pub struct ReqwestFactory {
    client: ReqwestClient,
}

impl ReqwestFactory {
    /// Create a factory around an existing reqwest client
    pub fn new(client: ReqwestClient) -> Self {
        Self { client }
    }

    /// Get the underlying reqwest client
    pub fn client(&self) -> &ReqwestClient {
        &self.client
    }
}

impl NativeFactory for ReqwestFactory {
    fn create(&self) -> Arc<dyn NativeRequest> {
        Arc::new(ReqwestNative::new(self.client.clone()))
    }
}

/// Native request backed by reqwest
///
/// `send` spawns the exchange on the current tokio runtime and reports
/// `HeadersReceived`, `Loading` and `Done` through the observer. A network
/// failure finishes with status 0, the way a browser reports it. Requests
/// always run without blocking, whatever the `asynchronous` flag says.
pub struct ReqwestNative {
    client: ReqwestClient,
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<NativeState>,
    observer: Mutex<Option<ReadyStateObserver>>,
}

#[derive(Default)]
struct NativeState {
    ready_state: ReadyState,
    status: u16,
    method: Option<Method>,
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    request_headers: Vec<(String, String)>,
    response_headers: HeaderMap,
    response_text: Option<String>,
    response_xml: Option<XmlDocument>,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl ReqwestNative {
    /// Create a native request on top of a reqwest client
    pub fn new(client: ReqwestClient) -> Self {
        Self {
            client,
            shared: Arc::new(Shared::default()),
        }
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, NativeState> {
        guard(&self.state)
    }

    fn notify(&self) {
        let observer = guard(&self.observer).clone();
        if let Some(observer) = observer {
            observer();
        }
    }

    /// Apply `update` unless the request was aborted or reopened meanwhile
    fn advance(&self, generation: u64, update: impl FnOnce(&mut NativeState)) -> bool {
        let mut state = self.state();
        if state.generation != generation {
            return false;
        }
        update(&mut state);
        trace!(ready_state = ?state.ready_state, status = state.status, "native ready state changed");
        true
    }

    fn fail(&self, generation: u64) {
        let finished = self.advance(generation, |state| {
            state.status = 0;
            state.response_headers.clear();
            state.response_text = Some(String::new());
            state.ready_state = ReadyState::Done;
        });
        if finished {
            self.notify();
        }
    }

    async fn drive(self: Arc<Self>, request: reqwest::RequestBuilder, generation: u64) {
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "native request failed");
                self.fail(generation);
                return;
            }
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let is_xml = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("xml"))
            .unwrap_or(false);

        if !self.advance(generation, |state| {
            state.status = status;
            state.response_headers = headers;
            state.ready_state = ReadyState::HeadersReceived;
        }) {
            return;
        }
        self.notify();

        if !self.advance(generation, |state| state.ready_state = ReadyState::Loading) {
            return;
        }
        self.notify();

        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to read native response body");
                self.fail(generation);
                return;
            }
        };

        if self.advance(generation, |state| {
            state.response_xml = is_xml.then(|| XmlDocument::new(text.clone()));
            state.response_text = Some(text);
            state.ready_state = ReadyState::Done;
        }) {
            self.notify();
        }
    }
}

impl NativeRequest for ReqwestNative {
    fn open(
        &self,
        method: &Method,
        url: &str,
        _asynchronous: bool,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        url::Url::parse(url)?;

        let mut state = self.shared.state();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        let generation = state.generation + 1;
        *state = NativeState {
            ready_state: ReadyState::Opened,
            method: Some(method.clone()),
            url: Some(url.to_string()),
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            generation,
            ..NativeState::default()
        };
        Ok(())
    }

    fn set_request_header(&self, name: &str, value: &str) -> Result<()> {
        let mut state = self.shared.state();
        if state.ready_state != ReadyState::Opened {
            return Err(Error::invalid_request("setRequestHeader called before open"));
        }
        state.request_headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn send(&self, body: Option<Body>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let (request, generation) = {
            let mut state = self.shared.state();
            let (Some(method), Some(url)) = (state.method.clone(), state.url.clone()) else {
                return Err(Error::invalid_request("send called before open"));
            };
            if state.ready_state != ReadyState::Opened {
                return Err(Error::invalid_request("request already sent"));
            }

            let mut request = self.client.request(method, url.as_str());
            for (name, value) in &state.request_headers {
                // computed by the connection itself
                if name.eq_ignore_ascii_case("content-length") {
                    continue;
                }
                request = request.header(name.as_str(), value.as_str());
            }
            if let Some(username) = &state.username {
                request = request.basic_auth(username, state.password.as_ref());
            }
            if let Some(body) = body {
                request = request.body(body.into_string());
            }

            state.generation += 1;
            (request, state.generation)
        };

        debug!(generation, "native request dispatched");
        let task = runtime.spawn(Arc::clone(&self.shared).drive(request, generation));

        let mut state = self.shared.state();
        if state.generation == generation {
            state.task = Some(task);
        }
        Ok(())
    }

    fn abort(&self) {
        let mut state = self.shared.state();
        state.generation += 1;
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.ready_state = ReadyState::Unsent;
        state.status = 0;
    }

    fn ready_state(&self) -> ReadyState {
        self.shared.state().ready_state
    }

    fn status(&self) -> u16 {
        self.shared.state().status
    }

    fn response_text(&self) -> Option<String> {
        self.shared.state().response_text.clone()
    }

    fn response_xml(&self) -> Option<XmlDocument> {
        self.shared.state().response_xml.clone()
    }

    fn get_all_response_headers(&self) -> String {
        self.shared
            .state()
            .response_headers
            .iter()
            .map(|(name, value)| format!("{}: {}\r\n", name, value.to_str().unwrap_or("")))
            .collect()
    }

    fn get_response_header(&self, name: &str) -> Option<String> {
        self.shared
            .state()
            .response_headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn set_observer(&self, observer: Option<ReadyStateObserver>) {
        *guard(&self.shared.observer) = observer;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted native request for driving transports in unit tests.

    use super::*;

    #[derive(Default)]
    struct Script {
        ready_state: ReadyState,
        status: u16,
        opened: Option<(Method, String, bool, Option<String>, Option<String>)>,
        request_headers: Vec<(String, String)>,
        sent: Vec<Option<Body>>,
        aborts: usize,
        response_text: Option<String>,
        response_xml: Option<XmlDocument>,
        response_headers: Vec<(String, String)>,
    }

    #[derive(Default)]
    pub(crate) struct ScriptedNative {
        script: Mutex<Script>,
        observer: Mutex<Option<ReadyStateObserver>>,
    }

    impl ScriptedNative {
        fn notify(&self) {
            let observer = guard(&self.observer).clone();
            if let Some(observer) = observer {
                observer();
            }
        }

        pub(crate) fn step(&self, ready_state: ReadyState) {
            guard(&self.script).ready_state = ready_state;
            self.notify();
        }

        pub(crate) fn respond(&self, status: u16, text: &str) {
            self.respond_with(status, text, &[]);
        }

        pub(crate) fn respond_with(&self, status: u16, text: &str, headers: &[(&str, &str)]) {
            {
                let mut script = guard(&self.script);
                script.status = status;
                script.response_text = Some(text.to_string());
                script.response_headers = headers
                    .iter()
                    .map(|(n, v)| (n.to_string(), v.to_string()))
                    .collect();
                script.ready_state = ReadyState::Done;
            }
            self.notify();
        }

        pub(crate) fn respond_xml(&self, status: u16, markup: &str) {
            guard(&self.script).response_xml = Some(XmlDocument::new(markup));
            self.respond(status, markup);
        }

        pub(crate) fn opened_url(&self) -> Option<String> {
            guard(&self.script).opened.as_ref().map(|o| o.1.clone())
        }

        pub(crate) fn opened_method(&self) -> Option<Method> {
            guard(&self.script).opened.as_ref().map(|o| o.0.clone())
        }

        pub(crate) fn opened_credentials(&self) -> (Option<String>, Option<String>) {
            guard(&self.script)
                .opened
                .as_ref()
                .map(|o| (o.3.clone(), o.4.clone()))
                .unwrap_or_default()
        }

        pub(crate) fn request_header(&self, name: &str) -> Option<String> {
            guard(&self.script)
                .request_headers
                .iter()
                .rev()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        }

        pub(crate) fn sent_bodies(&self) -> Vec<Option<Body>> {
            guard(&self.script).sent.clone()
        }

        pub(crate) fn aborts(&self) -> usize {
            guard(&self.script).aborts
        }

        pub(crate) fn has_observer(&self) -> bool {
            guard(&self.observer).is_some()
        }
    }

    impl NativeRequest for ScriptedNative {
        fn open(
            &self,
            method: &Method,
            url: &str,
            asynchronous: bool,
            username: Option<&str>,
            password: Option<&str>,
        ) -> Result<()> {
            let mut script = guard(&self.script);
            script.opened = Some((
                method.clone(),
                url.to_string(),
                asynchronous,
                username.map(str::to_string),
                password.map(str::to_string),
            ));
            script.request_headers.clear();
            script.response_text = None;
            script.response_xml = None;
            script.status = 0;
            script.ready_state = ReadyState::Opened;
            Ok(())
        }

        fn set_request_header(&self, name: &str, value: &str) -> Result<()> {
            guard(&self.script)
                .request_headers
                .push((name.to_string(), value.to_string()));
            Ok(())
        }

        fn send(&self, body: Option<Body>) -> Result<()> {
            guard(&self.script).sent.push(body);
            Ok(())
        }

        fn abort(&self) {
            let mut script = guard(&self.script);
            script.aborts += 1;
            script.ready_state = ReadyState::Unsent;
        }

        fn ready_state(&self) -> ReadyState {
            guard(&self.script).ready_state
        }

        fn status(&self) -> u16 {
            guard(&self.script).status
        }

        fn response_text(&self) -> Option<String> {
            guard(&self.script).response_text.clone()
        }

        fn response_xml(&self) -> Option<XmlDocument> {
            guard(&self.script).response_xml.clone()
        }

        fn get_all_response_headers(&self) -> String {
            guard(&self.script)
                .response_headers
                .iter()
                .map(|(n, v)| format!("{}: {}\r\n", n, v))
                .collect()
        }

        fn get_response_header(&self, name: &str) -> Option<String> {
            guard(&self.script)
                .response_headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        }

        fn set_observer(&self, observer: Option<ReadyStateObserver>) {
            *guard(&self.observer) = observer;
        }
    }

    /// Factory that remembers every handle it created, in order
    #[derive(Default)]
    pub(crate) struct ScriptedFactory {
        created: Mutex<Vec<Arc<ScriptedNative>>>,
    }

    impl ScriptedFactory {
        pub(crate) fn native(&self, index: usize) -> Arc<ScriptedNative> {
            Arc::clone(&guard(&self.created)[index])
        }

        pub(crate) fn created(&self) -> usize {
            guard(&self.created).len()
        }
    }

    impl NativeFactory for ScriptedFactory {
        fn create(&self) -> Arc<dyn NativeRequest> {
            let native = Arc::new(ScriptedNative::default());
            guard(&self.created).push(Arc::clone(&native));
            native
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedNative;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_ready_state_order() {
        assert!(ReadyState::Unsent < ReadyState::Opened);
        assert!(ReadyState::Loading < ReadyState::Done);
        assert!(ReadyState::Done.is_done());
        assert_eq!(ReadyState::default(), ReadyState::Unsent);
    }

    #[test]
    fn test_closure_factory() {
        let factory = || -> Arc<dyn NativeRequest> { Arc::new(ScriptedNative::default()) };
        let native = factory.create();
        assert_eq!(native.ready_state(), ReadyState::Unsent);
    }

    #[test]
    fn test_reqwest_native_rejects_relative_url() {
        let native = ReqwestNative::new(ReqwestClient::new());
        let result = native.open(&Method::GET, "/relative", true, None, None);
        assert!(matches!(result, Err(Error::Url(_))));
        assert_eq!(native.ready_state(), ReadyState::Unsent);
    }

    #[test]
    fn test_reqwest_native_needs_runtime() {
        let native = ReqwestNative::new(ReqwestClient::new());
        native
            .open(&Method::GET, "http://localhost/", true, None, None)
            .unwrap();
        assert!(matches!(native.send(None), Err(Error::NoRuntime)));
    }

    #[test]
    fn test_reqwest_native_header_before_open() {
        let native = ReqwestNative::new(ReqwestClient::new());
        assert!(native.set_request_header("X-Test", "1").is_err());
    }

    #[tokio::test]
    async fn test_reqwest_native_network_failure_reports_status_zero() {
        let native = Arc::new(ReqwestNative::new(ReqwestClient::new()));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let calls = Arc::new(AtomicUsize::new(0));

        let observed = Arc::downgrade(&native);
        let counter = Arc::clone(&calls);
        native.set_observer(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(native) = observed.upgrade() {
                if native.ready_state().is_done() {
                    if let Some(tx) = guard(&tx).take() {
                        let _ = tx.send(native.status());
                    }
                }
            }
        })));

        // port 9 (discard) is not listening on loopback
        native
            .open(&Method::GET, "http://127.0.0.1:9/", true, None, None)
            .unwrap();
        native.send(None).unwrap();

        assert_eq!(rx.await.unwrap(), 0);
        assert_eq!(native.response_text().as_deref(), Some(""));
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_abort_resets_state() {
        let native = ReqwestNative::new(ReqwestClient::new());
        native
            .open(&Method::GET, "http://localhost/", true, None, None)
            .unwrap();
        native.abort();
        assert_eq!(native.ready_state(), ReadyState::Unsent);
        assert_eq!(native.status(), 0);
    }
}
