use std::sync::Arc;

use http::Method;
use serde_json::Value;

use crate::error::Error;
use crate::promise::{Promise, Resolution};
use crate::response::Response;

/// A request as it flows through the middleware chain, before the engine
/// resolves it against the client options. Middlewares may rewrite any
/// field before delegating.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, Value)>,
    pub query: Vec<(String, String)>,
    pub body: Value,
    pub attempt: usize,
}

/// Wraps request submission. A middleware may mutate the request before
/// delegating to `next`, transform the returned promise, short-circuit with
/// its own promise, or reject. Registration order applies on the way in and
/// reverses as the promises unwind.
pub trait Middleware: Send + Sync {
    fn handle(&self, request: RequestDescriptor, next: Next<'_>) -> Promise<Response>;
}

impl<F> Middleware for F
where
    F: Fn(RequestDescriptor, Next<'_>) -> Promise<Response> + Send + Sync,
{
    fn handle(&self, request: RequestDescriptor, next: Next<'_>) -> Promise<Response> {
        self(request, next)
    }
}

/// The remainder of the chain. Calling [`Next::run`] delegates to the next
/// middleware, or to the engine once the chain is exhausted.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Fn(RequestDescriptor) -> Promise<Response>,
}

impl Next<'_> {
    pub fn run(&self, request: RequestDescriptor) -> Promise<Response> {
        match self.chain.split_first() {
            None => (self.terminal)(request),
            Some((first, rest)) => first.handle(
                request,
                Next {
                    chain: rest,
                    terminal: self.terminal,
                },
            ),
        }
    }
}

pub(crate) fn run_chain(
    middlewares: &[Arc<dyn Middleware>],
    terminal: &dyn Fn(RequestDescriptor) -> Promise<Response>,
    request: RequestDescriptor,
) -> Promise<Response> {
    Next {
        chain: middlewares,
        terminal,
    }
    .run(request)
}

/// Adapts a closure into a [`Middleware`], pinning down the higher-ranked
/// signature so plain closures infer cleanly at registration sites.
pub fn middleware_fn<F>(function: F) -> impl Middleware
where
    F: for<'a> Fn(RequestDescriptor, Next<'a>) -> Promise<Response> + Send + Sync,
{
    struct FnMiddleware<F>(F);

    impl<F> Middleware for FnMiddleware<F>
    where
        F: for<'a> Fn(RequestDescriptor, Next<'a>) -> Promise<Response> + Send + Sync,
    {
        fn handle(&self, request: RequestDescriptor, next: Next<'_>) -> Promise<Response> {
            (self.0)(request, next)
        }
    }

    FnMiddleware(function)
}

/// Built-in middleware that turns responses with an error status (>= 400)
/// into rejections carrying the response, for callers that opt into
/// status-based failures.
pub fn reject_error_statuses() -> impl Middleware {
    struct RejectErrorStatuses;

    impl Middleware for RejectErrorStatuses {
        fn handle(&self, request: RequestDescriptor, next: Next<'_>) -> Promise<Response> {
            next.run(request).then(|response: Response| {
                if response.status().as_u16() >= 400 {
                    Err(Error::from_response(&response))
                } else {
                    Ok(Resolution::Value(response))
                }
            })
        }
    }

    RejectErrorStatuses
}
