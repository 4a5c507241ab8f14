use std::net::SocketAddr;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::event_loop::EventLoop;
use crate::sys::socket::Socket;
use crate::tcp_connection::TcpConnection;
use crate::timestamp::Timestamp;

/// Shared handle to a connection; every callback receives one of these.
pub type TcpConnectionRef = Arc<TcpConnection>;

/// Fires on both connect and disconnect; distinguish with
/// [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Fires when bytes arrive; the handler consumes them by mutating the
/// buffer (`retrieve` and friends).
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionRef, &mut Buffer, Timestamp) + Send + Sync>;

/// Fires when the output buffer drains to zero.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Fires when the output buffer length crosses the high-water mark going
/// up; the second argument is the queued size at the crossing.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionRef, usize) + Send + Sync>;

/// Internal: wired by TcpServer/TcpClient to unregister a closed
/// connection.
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

pub type TimerCallback = Box<dyn FnMut() + Send>;

/// Runs inside each worker thread once, before its loop starts.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

pub(crate) type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr) + Send>;

pub(crate) fn default_connection_callback(conn: &TcpConnectionRef) {
    log::trace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

pub(crate) fn default_message_callback(
    _conn: &TcpConnectionRef,
    buf: &mut Buffer,
    _receive_time: Timestamp,
) {
    buf.retrieve_all();
}
