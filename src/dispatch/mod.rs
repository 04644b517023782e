//! Request dispatch: per-request context, middleware chain and routing.

mod context;
mod pipeline;
mod router;

pub use context::{Context, Dispatcher, Middleware};
pub use pipeline::Pipeline;
pub use router::{json_handler, ErrorHandler, Handler, Router};
