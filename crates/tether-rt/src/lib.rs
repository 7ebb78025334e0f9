//! Tether: a coroutine-driven TCP server runtime.
//!
//! Two layers that compose but stand alone:
//!
//! - **Fibers** ([`fiber`]): a per-thread cooperative scheduler with
//!   explicit yield/resume, offering per-fiber private stacks or a shared
//!   arena with copy-on-switch stack saving, plus a bridge that suspends a
//!   fiber on a reactor timer.
//! - **The network server** ([`server`]): reactor-per-thread I/O
//!   ([`reactor`]), framed per-connection state machines ([`linkage`]) over
//!   plain or TLS transports ([`io`]), accepting sockets ([`listener`]),
//!   and 64-bit channels ([`channel`]) that route to their owning reactor
//!   by modulus and survive reconnects for outgoing peers. Message
//!   processing optionally moves to a worker pool with hash pinning.
//!
//! ## A minimal echo server
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_rt::{Context, Handler, HandlerChoice, ListenOption, Server};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn get_message_length(&self, _ctx: &Context, buf: &[u8]) -> isize {
//!         if buf.len() < 4 {
//!             return 0;
//!         }
//!         u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as isize
//!     }
//!
//!     fn on_message(&self, ctx: &Context, buf: &[u8]) -> i32 {
//!         ctx.server().send(ctx.channel(), buf);
//!         1
//!     }
//! }
//!
//! let mut server = Server::new();
//! server.listen(ListenOption::new(7000, HandlerChoice::Shared(Arc::new(Echo)))).unwrap();
//! server.initialize(2, 0, None);
//! ```

pub mod channel;
pub mod fiber;
pub mod handler;
pub mod interface;
pub mod io;
pub mod linkage;
pub mod listener;
pub mod reactor;
pub mod server;
pub mod timer;

pub use channel::Channel;
pub use fiber::{CoId, CoStatus, Scheduler, StackMode};
pub use handler::{Context, Handler, HandlerChoice, HandlerFactory, Tuner};
pub use interface::{Resolver, SocketOptions};
pub use io::{IoAction, IoStatus, PlainIo, TlsIo, TlsPeer, Transport};
pub use linkage::{LinkHandler, Linkage};
pub use listener::{AcceptSink, Listener};
pub use reactor::{ClientId, LinkageBase, Reactor, ReactorHandle, ReactorSeed};
pub use server::{
    ClientTls, ConnectOption, ListenOption, Server, ServerConfig, ServerHandle,
};
pub use timer::TimerWheel;
