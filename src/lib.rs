//! Reactor-pattern TCP networking for Linux.
//!
//! The crate is built around per-thread [`EventLoop`]s. Each loop owns an
//! epoll instance, a timer queue multiplexed onto one timerfd, and an
//! eventfd used to wake the loop when another thread hands it work. File
//! descriptors are registered through [`Channel`]s; TCP servers and clients
//! compose the pieces into a usable public surface.
//!
//! # Example
//!
//! An echo server answering on an OS-assigned port:
//!
//! ```no_run
//! use ripple_io::{EventLoop, TcpServer};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let addr = "127.0.0.1:0".parse().unwrap();
//! let server = TcpServer::new(&event_loop, &addr, "echo", false).unwrap();
//!
//! server.set_message_callback(|conn, buf, _receive_time| {
//!     let msg = buf.retrieve_all_as_bytes();
//!     conn.send(&msg);
//! });
//!
//! server.set_thread_num(4);
//! server.start();
//! event_loop.run();
//! ```
//!
//! All callbacks run on the loop that owns the underlying descriptor; work
//! from other threads is funneled in with [`EventLoop::run_in_loop`] and
//! [`EventLoop::queue_in_loop`]. Callbacks must not block: defer anything of
//! indeterminate duration back onto a loop or to an external executor.

#[macro_use]
mod sys;

mod acceptor;
mod buffer;
mod callbacks;
mod channel;
mod connector;
mod event_loop;
mod event_loop_thread;
mod event_loop_thread_pool;
mod poller;
mod ready;
mod tcp_client;
mod tcp_connection;
mod tcp_server;
mod timer;
mod timer_queue;
mod timestamp;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionRef,
    ThreadInitCallback, TimerCallback, WriteCompleteCallback,
};
pub use channel::Channel;
pub use connector::Connector;
pub use event_loop::{EventLoop, Task};
pub use event_loop_thread::EventLoopThread;
pub use event_loop_thread_pool::EventLoopThreadPool;
pub use ready::Ready;
pub use sys::socket::Socket;
pub use tcp_client::TcpClient;
pub use tcp_connection::TcpConnection;
pub use tcp_server::TcpServer;
pub use timer::TimerId;
pub use timestamp::Timestamp;
