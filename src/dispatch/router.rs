//! Opcode router.
//!
//! The router is the terminal step of every middleware chain. It looks the
//! packet's opcode up, runs the handler and writes the response back on the
//! connection with the sequence number advanced by one.

use crate::dispatch::context::{Context, Middleware};
use crate::error::{BoxError, Error};
use crate::protocol::Payload;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Route handler: produces the response payload for one request.
pub type Handler = Arc<dyn Fn(&mut Context) -> Result<Payload, BoxError> + Send + Sync>;

/// Callback for failed requests.
pub type ErrorHandler = Arc<dyn Fn(&mut Context, &Error) + Send + Sync>;

pub struct Router {
    handlers: RwLock<HashMap<i16, Handler>>,
    not_found: RwLock<Middleware>,
    error: RwLock<ErrorHandler>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            not_found: RwLock::new(Arc::new(|ctx: &mut Context| {
                debug!(operate = ctx.packet().operate, "No route for operate");
            })),
            error: RwLock::new(Arc::new(|ctx: &mut Context, err: &Error| {
                warn!(operate = ctx.packet().operate, error = %err, "Request failed");
            })),
        }
    }

    /// Register `handler` for `operate`, replacing any earlier one.
    pub fn route<F>(&self, operate: i16, handler: F) -> &Self
    where
        F: Fn(&mut Context) -> Result<Payload, BoxError> + Send + Sync + 'static,
    {
        self.handlers.write().insert(operate, Arc::new(handler));
        self
    }

    /// Called when no handler is registered for the opcode.
    pub fn on_not_found<F>(&self, handler: F) -> &Self
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        *self.not_found.write() = Arc::new(handler);
        self
    }

    /// Called when decoding, the handler, or encoding fails.
    pub fn on_error<F>(&self, handler: F) -> &Self
    where
        F: Fn(&mut Context, &Error) + Send + Sync + 'static,
    {
        *self.error.write() = Arc::new(handler);
        self
    }

    pub fn contains(&self, operate: i16) -> bool {
        self.handlers.read().contains_key(&operate)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Dispatch the context's packet to its handler.
    pub(crate) fn handle_request(&self, ctx: &mut Context) {
        let operate = ctx.packet().operate;
        let handler = self.handlers.read().get(&operate).cloned();

        let Some(handler) = handler else {
            let not_found = self.not_found.read().clone();
            not_found(ctx);
            ctx.abort();
            return;
        };

        let response = match handler(ctx) {
            Ok(response) => response,
            Err(e) => {
                self.handle_error(ctx, &Error::Handler(e));
                ctx.abort();
                return;
            }
        };

        let written = ctx.reply(&response);
        ctx.set_response(response);
        if let Err(e) = written {
            self.handle_error(ctx, &Error::Codec(e));
            ctx.abort();
        }
    }

    pub(crate) fn handle_error(&self, ctx: &mut Context, err: &Error) {
        let handler = self.error.read().clone();
        handler(ctx, err);
    }

    /// The terminal middleware dispatching into this router.
    pub(crate) fn middleware(self: &Arc<Self>) -> Middleware {
        let router = Arc::clone(self);
        Arc::new(move |ctx: &mut Context| router.handle_request(ctx))
    }
}

/// Adapt a typed action into a route handler.
///
/// The request body is deserialized into `Req` and the returned `Resp` is
/// serialized as JSON.
pub fn json_handler<Req, Resp, F>(
    action: F,
) -> impl Fn(&mut Context) -> Result<Payload, BoxError> + Send + Sync + 'static
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: Fn(&mut Context, Req) -> Result<Resp, BoxError> + Send + Sync + 'static,
{
    move |ctx: &mut Context| {
        let request: Req = ctx.bind()?;
        let response = action(ctx, request)?;
        Ok(Payload::json(&response)?)
    }
}
