//! Named-callback promises.
//!
//! A [`Promise`] decouples the moment a result is produced from the moment
//! somebody is ready to handle it. Each callback name moves through a small
//! state machine:
//!
//! ```text
//!  (empty) --fulfill--> (pending) --on--> (registered)
//!  (empty) --on--> (registered) --fulfill--> handler runs, stays (registered)
//! ```
//!
//! Only one invocation is kept per name while no handler is registered. A
//! second `fulfill` before `on` replaces the first one, which is then lost.
//!
//! A handler that panics stays registered and the panic propagates to the
//! caller of `fulfill` or `on`; invocations queued by the handler itself
//! before it panicked are dropped.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::request::Context;
use crate::sync::guard;

/// The value a handler runs against: the explicit context, else the promiser
pub enum Receiver<P> {
    /// Context supplied when the promise was created
    Context(Context),
    /// The object that made the promise
    Promiser(P),
    /// Neither was available
    Unbound,
}

impl<P: Clone> Clone for Receiver<P> {
    fn clone(&self) -> Self {
        match self {
            Receiver::Context(context) => Receiver::Context(Arc::clone(context)),
            Receiver::Promiser(promiser) => Receiver::Promiser(promiser.clone()),
            Receiver::Unbound => Receiver::Unbound,
        }
    }
}

/// What a handler gets besides its payload
#[derive(Clone)]
pub struct Invocation<P> {
    receiver: Receiver<P>,
    promiser: Option<P>,
}

impl<P> Invocation<P> {
    /// The receiver the handler is bound to
    pub fn receiver(&self) -> &Receiver<P> {
        &self.receiver
    }

    /// The promiser at the time of fulfillment
    pub fn promiser(&self) -> Option<&P> {
        self.promiser.as_ref()
    }

    /// The explicit context, downcast to the caller's type
    pub fn context<T: Any>(&self) -> Option<&T> {
        match &self.receiver {
            Receiver::Context(context) => context.downcast_ref::<T>(),
            _ => None,
        }
    }
}

/// Callback registered on a promise
pub type Handler<K, P, A> = Box<dyn FnMut(A, &Invocation<P>, &Promise<K, P, A>) + Send>;

struct Pending<P, A> {
    args: A,
    invocation: Invocation<P>,
}

enum Slot<K, P, A> {
    Pending(Pending<P, A>),
    Registered(Handler<K, P, A>),
    /// A handler for this name is running right now
    Running {
        pending: Option<Pending<P, A>>,
        replacement: Option<Handler<K, P, A>>,
    },
}

struct Inner<K, P, A> {
    promiser: Mutex<Option<P>>,
    context: Option<Context>,
    slots: Mutex<HashMap<K, Slot<K, P, A>>>,
}

/// Deferred callback object keyed by callback name
///
/// `K` names the callbacks, `P` is the promiser handed to every invocation and
/// `A` the payload. Clones share the same state.
pub struct Promise<K, P, A> {
    inner: Arc<Inner<K, P, A>>,
}

impl<K, P, A> Clone for Promise<K, P, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, P, A> Promise<K, P, A>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    P: Clone + Send + 'static,
    A: Send + 'static,
{
    /// Create a promise
    pub fn new(promiser: Option<P>, context: Option<Context>) -> Self {
        Self {
            inner: Arc::new(Inner {
                promiser: Mutex::new(promiser),
                context,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The current promiser
    pub fn promiser(&self) -> Option<P> {
        guard(&self.inner.promiser).clone()
    }

    /// Replace the promiser used for later fulfillments
    pub fn set_promiser(&self, promiser: P) {
        *guard(&self.inner.promiser) = Some(promiser);
    }

    /// The explicit invocation context, if any
    pub fn context(&self) -> Option<&Context> {
        self.inner.context.as_ref()
    }

    /// Register a handler for `name`
    ///
    /// If `name` was already fulfilled, the queued invocation is replayed
    /// right away before this returns.
    pub fn on<F>(&self, name: K, handler: F) -> &Self
    where
        F: FnMut(A, &Invocation<P>, &Promise<K, P, A>) + Send + 'static,
    {
        let handler: Handler<K, P, A> = Box::new(handler);

        let pending = {
            let mut slots = self.slots();
            match slots.remove(&name) {
                Some(Slot::Pending(pending)) => {
                    slots.insert(
                        name.clone(),
                        Slot::Running {
                            pending: None,
                            replacement: None,
                        },
                    );
                    pending
                }
                Some(Slot::Running { pending, .. }) => {
                    slots.insert(
                        name,
                        Slot::Running {
                            pending,
                            replacement: Some(handler),
                        },
                    );
                    return self;
                }
                Some(Slot::Registered(_)) | None => {
                    debug!(callback = ?name, "stashing callback for later use");
                    slots.insert(name, Slot::Registered(handler));
                    return self;
                }
            }
        };

        debug!(callback = ?name, "executing queued up callback");
        self.run(name, handler, pending);
        self
    }

    /// Fulfill `name` with `args`
    ///
    /// Runs the registered handler synchronously, or queues the invocation
    /// until one is registered.
    pub fn fulfill(&self, name: K, args: A) -> &Self {
        let pending = Pending {
            args,
            invocation: self.invocation(),
        };

        let handler = {
            let mut slots = self.slots();
            match slots.remove(&name) {
                Some(Slot::Registered(handler)) => {
                    slots.insert(
                        name.clone(),
                        Slot::Running {
                            pending: None,
                            replacement: None,
                        },
                    );
                    handler
                }
                Some(Slot::Running {
                    pending: previous,
                    replacement,
                }) => {
                    if previous.is_some() {
                        warn!(callback = ?name, "overwriting queued invocation");
                    }
                    slots.insert(
                        name,
                        Slot::Running {
                            pending: Some(pending),
                            replacement,
                        },
                    );
                    return self;
                }
                Some(Slot::Pending(_)) => {
                    warn!(callback = ?name, "overwriting queued invocation");
                    slots.insert(name, Slot::Pending(pending));
                    return self;
                }
                None => {
                    debug!(callback = ?name, "no callback registered, queueing");
                    slots.insert(name, Slot::Pending(pending));
                    return self;
                }
            }
        };

        debug!(callback = ?name, "calling callback immediately");
        self.run(name, handler, pending);
        self
    }

    /// Check if a handler is registered for `name`
    pub fn is_registered(&self, name: &K) -> bool {
        matches!(
            self.slots().get(name),
            Some(Slot::Registered(_)) | Some(Slot::Running { .. })
        )
    }

    /// Check if an invocation for `name` is waiting for a handler
    pub fn has_pending(&self, name: &K) -> bool {
        matches!(
            self.slots().get(name),
            Some(Slot::Pending(_)) | Some(Slot::Running { pending: Some(_), .. })
        )
    }

    fn run(&self, name: K, mut handler: Handler<K, P, A>, mut pending: Pending<P, A>) {
        loop {
            let Pending { args, invocation } = pending;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(args, &invocation, self)));

            let mut slots = self.slots();
            if let Err(payload) = outcome {
                if let Some(Slot::Running {
                    replacement: Some(replacement),
                    ..
                }) = slots.remove(&name)
                {
                    handler = replacement;
                }
                warn!(callback = ?name, "callback panicked, keeping it registered");
                slots.insert(name, Slot::Registered(handler));
                drop(slots);
                panic::resume_unwind(payload);
            }

            match slots.remove(&name) {
                Some(Slot::Running {
                    pending: next,
                    replacement,
                }) => {
                    if let Some(replacement) = replacement {
                        handler = replacement;
                    }
                    match next {
                        Some(next) => {
                            slots.insert(
                                name.clone(),
                                Slot::Running {
                                    pending: None,
                                    replacement: None,
                                },
                            );
                            pending = next;
                        }
                        None => {
                            slots.insert(name, Slot::Registered(handler));
                            return;
                        }
                    }
                }
                Some(other) => {
                    slots.insert(name, other);
                    return;
                }
                None => {
                    slots.insert(name, Slot::Registered(handler));
                    return;
                }
            }
        }
    }

    fn invocation(&self) -> Invocation<P> {
        let promiser = self.promiser();
        let receiver = match (&self.inner.context, &promiser) {
            (Some(context), _) => Receiver::Context(Arc::clone(context)),
            (None, Some(promiser)) => Receiver::Promiser(promiser.clone()),
            (None, None) => Receiver::Unbound,
        };
        Invocation { receiver, promiser }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot<K, P, A>>> {
        guard(&self.inner.slots)
    }
}

impl<K, P, A> fmt::Debug for Promise<K, P, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("context", &self.inner.context.is_some())
            .finish_non_exhaustive()
    }
}
