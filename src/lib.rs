//! netcore — hub-and-spoke messaging and RPC fabric.
//!
//! Nodes join named groups on a central broker (the [`Tree`]) and exchange
//! framed envelopes, remote commands, and bulk byte streams. Around the wire
//! sits the [`Endpoint`] runtime: named handlers, middleware, and a
//! request/response correlator. The broker never interprets payloads —
//! it authenticates, tracks membership, and routes.
//!
//! Layering, leaves first:
//!
//! ```text
//! protocol   frame codec (length-prefixed, self-describing packets)
//! pipe       multiplex pipe: concurrent chunked "missions" over one stream
//!            + MultiPipe fan-in over several pipes
//! tree       the broker: handshake, roster, cmd/for routing, flow relays
//! endpoint   route table, middleware/hooks, correlator, worker pool
//! node       broker client: commands, forwards, flow pushes
//! support    event bus, scheduler, TTL cache, blueprints
//! ```
//!
//! Everything is plain threads and blocking I/O; there is no async runtime.
//!
//! ## A minimal exchange
//!
//! ```no_run
//! use netcore::{Endpoint, Pipe, Response};
//! use std::net::TcpStream;
//!
//! let socket = TcpStream::connect("127.0.0.1:1305")?;
//! let pipe = Pipe::new(socket.try_clone()?, socket);
//! let ep = Endpoint::new(pipe);
//! ep.request("echo", |req| Ok(Some(Response::new("echo", req.meta().to_vec()))));
//! ep.start()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod cache;
pub mod endpoint;
pub mod event;
pub mod ident;
pub mod node;
pub mod pipe;
pub mod protocol;
pub mod scheduler;
pub mod tree;

pub use cache::Cache;
pub use endpoint::{
    Blueprint, Endpoint, EndpointError, Payload, Request, Response, SendOptions, SendTicket,
};
pub use event::EventEmitter;
pub use node::{Node, NodeError, NodeIdentity};
pub use pipe::{MultiPipe, Pipe, PipeError};
pub use protocol::{Frame, ProtocolError};
pub use scheduler::Scheduler;
pub use tree::Tree;
