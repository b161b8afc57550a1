use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use http::Method;
use tracing::{debug, trace, warn};

use crate::error::{Error, ErrorKind, RequestError, Result};
use crate::native::{NativeRequest, ReadyState, ReadyStateObserver};
use crate::pool::{Pool, PoolShared};
use crate::request::{append_query, Body, Params, RequestOptions, TransportOptions, XmlDocument};
use crate::response::{ResponseEvent, ResponsePromise};
use crate::status::{self, CompletedResponse};
use crate::sync::guard;

/// Pooled wrapper around one native request handle
///
/// A transport tracks the options of the request it is about to send and
/// mirrors the native status and ready state while it runs. Once the request
/// finishes, its [`ResponsePromise`] is fulfilled and the transport goes back
/// to the pool.
///
/// Clones refer to the same transport; equality is identity.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    id: u64,
    pool: Weak<PoolShared>,
    defaults: Arc<TransportOptions>,
    state: Mutex<TransportState>,
}

struct TransportState {
    native: Option<Arc<dyn NativeRequest>>,
    options: TransportOptions,
    status: Option<u16>,
    ready_state: ReadyState,
    response_text: Option<String>,
    response_xml: Option<XmlDocument>,
}

impl Transport {
    /// Create a transport and register it with `pool` as available
    pub fn new(pool: &Pool) -> Self {
        let transport = Self::unregistered(pool);
        pool.register(&transport);
        transport
    }

    /// Create a transport with option overrides and register it with `pool`
    pub fn with_options(pool: &Pool, overrides: &RequestOptions) -> Self {
        let transport = Self::new(pool);
        transport.set_options(overrides);
        transport
    }

    pub(crate) fn unregistered(pool: &Pool) -> Self {
        let shared = pool.shared();
        let defaults = Arc::clone(&shared.defaults);

        Self {
            inner: Arc::new(TransportInner {
                id: shared.next_id(),
                pool: Arc::downgrade(shared),
                state: Mutex::new(TransportState {
                    native: Some(shared.factory.create()),
                    options: (*defaults).clone(),
                    status: None,
                    ready_state: ReadyState::Unsent,
                    response_text: None,
                    response_xml: None,
                }),
                defaults,
            }),
        }
    }

    /// Identifier, unique within the pool
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Reset the options to the pool defaults deep-merged with `overrides`
    pub fn set_options(&self, overrides: &RequestOptions) {
        self.state().options = TransportOptions::merged(&self.inner.defaults, overrides);
    }

    /// Deep-merge `overrides` into the current options
    pub fn merge_options(&self, overrides: &RequestOptions) {
        self.state().options.merge(overrides);
    }

    /// Current options
    pub fn options(&self) -> TransportOptions {
        self.state().options.clone()
    }

    /// Last observed HTTP status
    pub fn status(&self) -> Option<u16> {
        self.state().status
    }

    /// Last observed ready state
    pub fn ready_state(&self) -> ReadyState {
        self.state().ready_state
    }

    /// Raw response body, once the request is done
    pub fn response_text(&self) -> Option<String> {
        self.state().response_text.clone()
    }

    /// Response document, once the request is done and the server sent XML
    pub fn response_xml(&self) -> Option<XmlDocument> {
        self.state().response_xml.clone()
    }

    /// Check if [`Transport::destroy`] was called
    pub fn is_destroyed(&self) -> bool {
        self.state().native.is_none()
    }

    /// Send with the configured params and body
    pub fn send(&self) -> Result<ResponsePromise> {
        self.send_with(None, None, None)
    }

    /// Send the request
    ///
    /// `params` and `body` override the configured ones when given. Without a
    /// `promise` a fresh one is created, bound to the configured context.
    /// Map params are serialized into a query string, appended to the URL for
    /// GET and DELETE, and used as the body of a POST or PUT that has none.
    pub fn send_with(
        &self,
        params: Option<Params>,
        body: Option<Body>,
        promise: Option<ResponsePromise>,
    ) -> Result<ResponsePromise> {
        let native = self.native()?;
        let options = self.options();
        let url = options
            .url
            .clone()
            .ok_or_else(|| Error::invalid_request("No URL configured for request"))?;

        self.lock();

        let promise = promise
            .unwrap_or_else(|| ResponsePromise::new(Some(self.clone()), options.context.clone()));
        let params = params.or(options.params.clone());
        let body = body.or(options.body.clone());

        if let Err(err) = self.dispatch(&*native, &options, url, params, body, &promise) {
            native.set_observer(None);
            self.release();
            return Err(err);
        }

        Ok(promise)
    }

    fn dispatch(
        &self,
        native: &dyn NativeRequest,
        options: &TransportOptions,
        mut url: String,
        params: Option<Params>,
        mut body: Option<Body>,
        promise: &ResponsePromise,
    ) -> Result<()> {
        let method = &options.method;
        let query = params.map(|p| p.serialize()).unwrap_or_default();

        if *method == Method::GET || *method == Method::DELETE {
            url = append_query(&url, &query);
        }
        if (*method == Method::POST || *method == Method::PUT) && body.is_none() && !query.is_empty() {
            body = Some(Body::Text(query));
        }

        native.open(
            method,
            &url,
            options.asynchronous,
            options.username.as_deref(),
            options.password.as_deref(),
        )?;

        for (name, value) in options.headers.iter() {
            let value = value
                .to_str()
                .map_err(|e| Error::invalid_request(format!("Invalid header value for {}: {}", name, e)))?;
            native.set_request_header(name.as_str(), value)?;
        }
        if let Some(body) = body.as_ref().filter(|b| !b.is_empty()) {
            native.set_request_header("Content-Length", &body.len().to_string())?;
        }
        native.set_request_header("Content-Type", &options.mime_type)?;

        native.set_observer(Some(self.observer(promise.clone())));
        native.send(body)?;

        debug!(transport = self.id(), %method, %url, "request sent");
        Ok(())
    }

    fn observer(&self, promise: ResponsePromise) -> ReadyStateObserver {
        let transport = Arc::downgrade(&self.inner);
        Arc::new(move || {
            if let Some(inner) = transport.upgrade() {
                Transport { inner }.on_ready_state_change(&promise);
            }
        })
    }

    fn on_ready_state_change(&self, promise: &ResponsePromise) {
        let Ok(native) = self.native() else {
            return;
        };
        let ready_state = native.ready_state();
        self.sync(&*native, ready_state);
        trace!(transport = self.id(), ?ready_state, "ready state changed");

        if !ready_state.is_done() {
            return;
        }
        native.set_observer(None);

        let response = {
            let state = self.state();
            CompletedResponse {
                status: state.status.unwrap_or_default(),
                method: state.options.method.clone(),
                url: state.options.url.clone().unwrap_or_default(),
                mime_type: state.options.mime_type.clone(),
                location: native.get_response_header("location"),
                response_text: state.response_text.clone(),
                response_xml: state.response_xml.clone(),
            }
        };

        match status::classify(&response) {
            Ok(payload) => {
                debug!(transport = self.id(), status = response.status, "request succeeded");
                let _release = ReleaseOnDrop(self);
                let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                    promise.fulfill(ResponseEvent::Success(payload));
                }));
                if let Err(cause) = delivered {
                    let message = panic_message(cause.as_ref());
                    warn!(transport = self.id(), %message, "success callback panicked");
                    promise.handle_error(RequestError::new(
                        ErrorKind::Generic,
                        format!("success callback panicked: {}", message),
                    ));
                }
                promise.fulfill(ResponseEvent::Complete);
            }
            Err(error) => {
                debug!(transport = self.id(), status = response.status, kind = %error.kind(), "request failed");
                self.release();
                promise.handle_error(error);
                promise.fulfill(ResponseEvent::Complete);
            }
        }
    }

    fn sync(&self, native: &dyn NativeRequest, ready_state: ReadyState) {
        let status = native.status();
        let (text, xml) = if ready_state.is_done() {
            (native.response_text(), native.response_xml())
        } else {
            (None, None)
        };

        let mut state = self.state();
        state.status = Some(status);
        state.ready_state = ready_state;
        state.response_text = text;
        state.response_xml = xml;
    }

    /// Abort the request in flight and give the transport back to the pool
    pub fn abort(&self) {
        self.release();
        if let Ok(native) = self.native() {
            native.abort();
        }
    }

    /// Abort, detach from the native handle and leave the pool for good
    pub fn destroy(&self) {
        let native = {
            let mut state = self.state();
            state.response_xml = None;
            state.native.take()
        };
        if let Some(native) = native {
            native.abort();
            native.set_observer(None);
        }
        if let Some(pool) = self.pool() {
            pool.unregister(self);
        }
        debug!(transport = self.id(), "transport destroyed");
    }

    /// All response headers of the native handle
    pub fn get_all_response_headers(&self) -> Result<String> {
        Ok(self.native()?.get_all_response_headers())
    }

    /// One response header of the native handle
    pub fn get_response_header(&self, name: &str) -> Result<Option<String>> {
        Ok(self.native()?.get_response_header(name))
    }

    /// Set a header directly on the native handle
    pub fn set_request_header(&self, name: &str, value: &str) -> Result<()> {
        self.native()?.set_request_header(name, value)
    }

    fn lock(&self) {
        if let Some(pool) = self.pool() {
            pool.lock(self);
        }
    }

    fn release(&self) {
        if let Some(pool) = self.pool() {
            pool.release(self);
        }
    }

    fn pool(&self) -> Option<Pool> {
        self.inner.pool.upgrade().map(Pool::from_shared)
    }

    fn native(&self) -> Result<Arc<dyn NativeRequest>> {
        self.state().native.clone().ok_or(Error::TransportDestroyed)
    }

    fn state(&self) -> MutexGuard<'_, TransportState> {
        guard(&self.inner.state)
    }
}

/// Gives the transport back to its pool when dropped, even while unwinding
struct ReleaseOnDrop<'a>(&'a Transport);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

impl PartialEq for Transport {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Transport {}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").field("id", &self.inner.id).finish_non_exhaustive()
    }
}
