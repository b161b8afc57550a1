use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use serde_json::Value;

use crate::error::{Error, ErrorKind, RequestError};
use crate::promise::{Invocation, Promise};
use crate::request::{Context, XmlDocument};
use crate::sync::guard;
use crate::transport::Transport;

/// Callback names supported by a [`ResponsePromise`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCallback {
    /// The request finished with 200 or 201
    Success,
    /// The request finished with any other outcome
    Error,
    /// Fired once after either of the above
    Complete,
}

impl ResponseCallback {
    /// Name of the callback
    pub fn name(self) -> &'static str {
        match self {
            ResponseCallback::Success => "success",
            ResponseCallback::Error => "error",
            ResponseCallback::Complete => "complete",
        }
    }
}

impl fmt::Display for ResponseCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResponseCallback {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ResponseCallback::Success),
            "error" => Ok(ResponseCallback::Error),
            "complete" => Ok(ResponseCallback::Complete),
            other => Err(Error::invalid_request(format!("Unknown callback: {}", other))),
        }
    }
}

/// Success payload of a request
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The server sent an XML document
    Xml(XmlDocument),
    /// The body parsed as JSON
    Json(Value),
    /// The raw body
    Text(String),
}

impl Payload {
    /// Get the JSON value if this is a JSON payload
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Get the raw text if this is a text payload
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Get the document if this is an XML payload
    pub fn as_xml(&self) -> Option<&XmlDocument> {
        match self {
            Payload::Xml(document) => Some(document),
            _ => None,
        }
    }

    /// Deserialize a JSON payload into `T`
    pub fn json<T>(&self) -> crate::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        match self {
            Payload::Json(value) => Ok(T::deserialize(value)?),
            Payload::Text(text) => Ok(serde_json::from_str(text)?),
            Payload::Xml(_) => Err(Error::invalid_request("XML payload is not JSON")),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Xml(document) => f.write_str(document.as_str()),
            Payload::Json(value) => write!(f, "{}", value),
            Payload::Text(text) => f.write_str(text),
        }
    }
}

/// What a [`ResponsePromise`] is fulfilled with
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    Success(Payload),
    Error(RequestError),
    Complete,
}

impl ResponseEvent {
    /// The callback this event fulfills
    pub fn callback(&self) -> ResponseCallback {
        match self {
            ResponseEvent::Success(_) => ResponseCallback::Success,
            ResponseEvent::Error(_) => ResponseCallback::Error,
            ResponseEvent::Complete => ResponseCallback::Complete,
        }
    }
}

/// Invocation details handed to response callbacks
pub type ResponseInvocation = Invocation<Transport>;

type Inner = Promise<ResponseCallback, Transport, ResponseEvent>;

/// Promise for the outcome of one request
///
/// Handlers may be registered before or after the request finishes; a
/// result that arrives first is held until a handler shows up.
///
/// # Examples
///
/// ```rust,no_run
/// use xhrpool::{Client, RequestOptions};
///
/// # async fn run() -> xhrpool::Result<()> {
/// let client = Client::new();
/// client
///     .get(RequestOptions::new().url("https://example.com/api/items"))
///     .await?
///     .on_success(|payload, _| println!("{}", payload))
///     .on_error(|error, _| eprintln!("{}", error))
///     .on_complete(|_| println!("done"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ResponsePromise {
    inner: Inner,
}

impl ResponsePromise {
    /// Create a response promise
    pub fn new(promiser: Option<Transport>, context: Option<Context>) -> Self {
        Self {
            inner: Promise::new(promiser, context),
        }
    }

    /// The transport serving this request, once one was assigned
    pub fn promiser(&self) -> Option<Transport> {
        self.inner.promiser()
    }

    /// Assign the transport serving this request
    pub fn set_promiser(&self, transport: Transport) {
        self.inner.set_promiser(transport);
    }

    /// Register a handler for any of the three callbacks
    pub fn on<F>(&self, name: ResponseCallback, mut handler: F) -> &Self
    where
        F: FnMut(ResponseEvent, &ResponseInvocation, &ResponsePromise) + Send + 'static,
    {
        self.inner.on(name, move |event, invocation, inner| {
            let promise = ResponsePromise {
                inner: inner.clone(),
            };
            handler(event, invocation, &promise)
        });
        self
    }

    /// Register the success handler
    pub fn on_success<F>(&self, mut handler: F) -> &Self
    where
        F: FnMut(Payload, &ResponseInvocation) + Send + 'static,
    {
        self.inner
            .on(ResponseCallback::Success, move |event, invocation, _| {
                if let ResponseEvent::Success(payload) = event {
                    handler(payload, invocation)
                }
            });
        self
    }

    /// Register the error handler
    pub fn on_error<F>(&self, mut handler: F) -> &Self
    where
        F: FnMut(RequestError, &ResponseInvocation) + Send + 'static,
    {
        self.inner
            .on(ResponseCallback::Error, move |event, invocation, _| {
                if let ResponseEvent::Error(error) = event {
                    handler(error, invocation)
                }
            });
        self
    }

    /// Register the complete handler
    pub fn on_complete<F>(&self, mut handler: F) -> &Self
    where
        F: FnMut(&ResponseInvocation) + Send + 'static,
    {
        self.inner
            .on(ResponseCallback::Complete, move |_, invocation, _| handler(invocation));
        self
    }

    /// Fulfill the callback matching `event`
    pub fn fulfill(&self, event: ResponseEvent) -> &Self {
        self.inner.fulfill(event.callback(), event);
        self
    }

    /// Normalize `error` and fulfill the error callback with it
    ///
    /// Plain strings become a generic [`RequestError`].
    pub fn handle_error(&self, error: impl Into<RequestError>) -> &Self {
        self.fulfill(ResponseEvent::Error(error.into()))
    }

    /// Check if a handler is registered for `name`
    pub fn is_registered(&self, name: ResponseCallback) -> bool {
        self.inner.is_registered(&name)
    }

    /// Check if an invocation of `name` waits for a handler
    pub fn has_pending(&self, name: ResponseCallback) -> bool {
        self.inner.has_pending(&name)
    }

    /// Wait for the request to complete
    ///
    /// Registers its own success, error and complete handlers, replacing any
    /// registered before. The future stays pending if the request is
    /// aborted.
    pub async fn outcome(&self) -> Result<Payload, RequestError> {
        let (tx, rx) = oneshot::channel();
        let result: Arc<Mutex<Option<Result<Payload, RequestError>>>> = Arc::new(Mutex::new(None));
        let sender = Mutex::new(Some(tx));

        let on_success = Arc::clone(&result);
        let on_error = Arc::clone(&result);
        self.on_success(move |payload, _| store(&on_success, Ok(payload)))
            .on_error(move |error, _| store(&on_error, Err(error)))
            .on_complete(move |_| {
                let outcome = take(&result).unwrap_or_else(|| {
                    Err(RequestError::new(
                        ErrorKind::Generic,
                        "request completed without a result",
                    ))
                });
                if let Some(tx) = take(&sender) {
                    let _ = tx.send(outcome);
                }
            });

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RequestError::new(
                ErrorKind::Generic,
                "request was dropped before completing",
            )),
        }
    }
}

fn store<T>(slot: &Mutex<Option<T>>, value: T) {
    *guard(slot) = Some(value);
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    guard(slot).take()
}
