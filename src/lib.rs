// src/lib.rs
//! A single-threaded, edge-triggered HTTP/1.x server built around one
//! stackful coroutine per connection. Each connection lives in its own
//! mmap arena — guard page, coroutine stack, control block — and is
//! torn down by the listener's reaper one reactor tick after its body
//! returns.

#[cfg(not(target_os = "linux"))]
compile_error!("mazurka requires Linux (epoll, accept4, glibc ucontext)");

pub mod arena;
pub mod conn;
pub mod coroutine;
pub mod error;
pub mod http;
pub mod list;
pub mod parser;
pub mod reactor;
pub mod router;
pub mod server;
pub mod syscalls;

// Re-exports for users
pub use conn::Status;
pub use error::{MazurkaError, MazurkaResult};
pub use http::{Request, Response};
pub use reactor::{Reactor, StopHandle};
pub use router::Router;
pub use server::Server;
