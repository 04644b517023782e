//! pollnet: a sharded reactor server core.
//!
//! Connections are accepted by an [`acceptor::Acceptor`], registered with a
//! readiness [`runtime::Poller`] and fanned out to shard threads by fd. Each
//! ready connection has one framed message read, which a worker decodes and
//! runs through the middleware chain and the opcode [`dispatch::Router`].
//!
//! ```no_run
//! use pollnet::{json_handler, Config, Schema, Server};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize)]
//! struct Echo { foo: String }
//!
//! #[derive(Serialize)]
//! struct Reply { val: String }
//!
//! # fn main() -> pollnet::Result<()> {
//! let mut server = Server::new(Config::default())?;
//! server
//!     .router()
//!     .route(1, json_handler(|_ctx, req: Echo| Ok(Reply { val: req.foo })));
//! server.listen(Schema::tcp("127.0.0.1:8900"));
//!
//! let (_stop, stop_rx) = crossbeam_channel::bounded::<()>(0);
//! server.run(stop_rx)?;
//! # Ok(())
//! # }
//! ```

pub mod acceptor;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod runtime;
pub mod server;

pub use acceptor::{Acceptor, Protocol, Schema};
pub use client::Client;
pub use config::Config;
pub use dispatch::{json_handler, Context, Middleware, Router};
pub use error::{BoxError, Error, Result};
pub use protocol::{Codec, ContentType, Packet, Payload};
pub use runtime::Connection;
pub use server::Server;
