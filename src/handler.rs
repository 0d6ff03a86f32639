//! The per-request handler contract and the role-indexed factory registry.
//!
//! Handlers are the user-supplied half of the server. A [`HandlerFactory`]
//! is consulted at BeginRequest time; the [`Handler`] it creates is then
//! driven by the worker pool in cooperative steps until it reports
//! completion. All handlers are registered at process startup; there is no
//! dynamic loading.

use std::sync::Arc;

use crate::protocol::RecordType;
use crate::request::Request;


/// The per-request logic executed by the worker pool.
///
/// A step may run on any worker thread; handlers must not assume they are
/// resumed on the thread that executed their previous step.
pub trait Handler: Send {
    /// Performs one unit of work for the request.
    ///
    /// Returns `true` when the request is complete. Returning `false`
    /// re-enqueues the handler at the back of the work queue, yielding the
    /// worker to other requests; use this to wait for more input or to break
    /// up long-running responses.
    ///
    /// A handler normally calls [`Request::finish`] before returning `true`.
    /// If it does not, the request is finished with application status 0.
    fn step(&mut self, request: &Request) -> bool;

    /// Called on the I/O task when a STDIN or DATA chunk arrives.
    ///
    /// `chunk` is empty for the end-of-stream record. The data has already
    /// been appended to the matching input stream, so this is purely a
    /// notification and may be ignored.
    fn on_receive_data(&mut self, request: &Request, stream: RecordType, chunk: &[u8]) {
        let _ = (request, stream, chunk);
    }

    /// Called when the FastCGI client aborts the request.
    fn on_abort(&mut self, request: &Request) {
        request.finish(1);
    }
}

/// Creates [`Handler`] instances for the roles it claims.
pub trait HandlerFactory: Send + Sync {
    /// Tests whether this factory serves the given raw FastCGI role code.
    ///
    /// Must be a pure function of the role code.
    fn accepts_role(&self, role: u16) -> bool;

    /// Creates a handler for a freshly begun request.
    fn create(&self, request: &Request) -> Box<dyn Handler>;
}


/// The set of handler factories known to the server, indexed by role.
///
/// Factories are probed in registration order; the first one accepting a
/// role wins. A role no factory accepts is answered on the wire with
/// END_REQUEST and protocol status UNKNOWN_ROLE.
#[derive(Default)]
pub struct Registry {
    factories: Vec<Arc<dyn HandlerFactory>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Registry").field("factories", &self.factories.len()).finish()
    }
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler factory.
    pub fn register(&mut self, factory: impl HandlerFactory + 'static) -> &mut Self {
        self.factories.push(Arc::new(factory));
        self
    }

    /// Finds the factory serving `role`, if any.
    #[must_use]
    pub fn find(&self, role: u16) -> Option<&Arc<dyn HandlerFactory>> {
        self.factories.iter().find(|f| f.accepts_role(role))
    }

    /// Tests whether no factories are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}


/// A [`HandlerFactory`] built from a role predicate and a closure.
///
/// The common case of a single stateless responder does not warrant a
/// hand-written factory type.
pub struct FnFactory<F> {
    roles: fn(u16) -> bool,
    make: F,
}

impl<F> FnFactory<F>
where
    F: Fn(&Request) -> Box<dyn Handler> + Send + Sync,
{
    /// Creates a factory from a role predicate and a handler constructor.
    pub fn new(roles: fn(u16) -> bool, make: F) -> Self {
        Self { roles, make }
    }

    /// Creates a factory serving only the Responder role.
    pub fn responder(make: F) -> Self {
        Self::new(|role| role == crate::protocol::Role::Responder.into(), make)
    }
}

impl<F> HandlerFactory for FnFactory<F>
where
    F: Fn(&Request) -> Box<dyn Handler> + Send + Sync,
{
    fn accepts_role(&self, role: u16) -> bool {
        (self.roles)(role)
    }

    fn create(&self, request: &Request) -> Box<dyn Handler> {
        (self.make)(request)
    }
}
