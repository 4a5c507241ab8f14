use std::any::Any;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::socket::Socket;
use crate::timestamp::Timestamp;

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;
const STATE_DISCONNECTING: u8 = 3;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

fn state_name(state: u8) -> &'static str {
    match state {
        STATE_DISCONNECTED => "Disconnected",
        STATE_CONNECTING => "Connecting",
        STATE_CONNECTED => "Connected",
        STATE_DISCONNECTING => "Disconnecting",
        _ => "Unknown",
    }
}

/// One established TCP connection, for both server and client use.
///
/// The connection owns its socket and closes it at destruction. All I/O and
/// callback dispatch happen on the owning loop's thread; `send`, `shutdown`
/// and `force_close` may be called from anywhere and marshal themselves
/// there. During event dispatch the connection is kept alive by the
/// channel's tie, so a callback can never outlive it.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
    high_water_mark: AtomicUsize,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    self_weak: Weak<TcpConnection>,
}

impl TcpConnection {
    /// Wraps an already connected socket. Users never call this; servers
    /// and clients do.
    pub(crate) fn new(
        event_loop: &Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        if let Err(e) = socket.set_keep_alive(true) {
            log::warn!("TcpConnection [{}]: SO_KEEPALIVE: {}", name, e);
        }

        let fd = socket.as_raw_fd();
        let channel = Channel::new(Arc::downgrade(event_loop), fd);
        log::debug!("TcpConnection::new [{}] fd = {}", name, fd);

        let conn = Arc::new_cyclic(|self_weak: &Weak<TcpConnection>| TcpConnection {
            event_loop: event_loop.clone(),
            name,
            state: AtomicU8::new(STATE_CONNECTING),
            reading: AtomicBool::new(false),
            socket,
            channel,
            local_addr,
            peer_addr,
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_mark_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            context: Mutex::new(None),
            self_weak: self_weak.clone(),
        });

        {
            let weak = conn.self_weak.clone();
            conn.channel.set_read_callback(move |receive_time| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(receive_time);
                }
            });
        }
        {
            let weak = conn.self_weak.clone();
            conn.channel.set_write_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            });
        }
        {
            let weak = conn.self_weak.clone();
            conn.channel.set_close_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            });
        }
        {
            let weak = conn.self_weak.clone();
            conn.channel.set_error_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            });
        }

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CONNECTED
    }

    pub fn disconnected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_DISCONNECTED
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_mark_cb.lock().unwrap() = Some(cb);
        self.high_water_mark.store(mark, Ordering::SeqCst);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        self.socket.set_tcp_nodelay(on)
    }

    /// Kernel `TCP_INFO` for this connection.
    pub fn tcp_info(&self) -> io::Result<libc::tcp_info> {
        self.socket.tcp_info()
    }

    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.context.lock().unwrap() = Some(context);
    }

    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.context.lock().unwrap().take()
    }

    /// Sends `data`, copying it when the call comes from a foreign thread.
    pub fn send(&self, data: &[u8]) {
        if self.state.load(Ordering::SeqCst) != STATE_CONNECTED {
            return;
        }

        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let weak = self.self_weak.clone();
            self.event_loop.queue_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.send_in_loop(&owned);
                }
            });
        }
    }

    /// Sends the readable content of `buf`, draining it.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        if self.state.load(Ordering::SeqCst) != STATE_CONNECTED {
            return;
        }

        let data = buf.retrieve_all_as_bytes();
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(&data);
        } else {
            let weak = self.self_weak.clone();
            self.event_loop.queue_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.send_in_loop(&data);
                }
            });
        }
    }

    /// Half-closes the write side once the output buffer drains.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                STATE_CONNECTED,
                STATE_DISCONNECTING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            let weak = self.self_weak.clone();
            self.event_loop.run_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.shutdown_in_loop();
                }
            });
        }
    }

    /// Closes regardless of queued output.
    pub fn force_close(&self) {
        let state = self.state.load(Ordering::SeqCst);
        if state == STATE_CONNECTED || state == STATE_DISCONNECTING {
            self.state.store(STATE_DISCONNECTING, Ordering::SeqCst);
            let weak = self.self_weak.clone();
            self.event_loop.queue_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close_in_loop();
                }
            });
        }
    }

    pub fn force_close_with_delay(&self, delay: Duration) {
        let state = self.state.load(Ordering::SeqCst);
        if state == STATE_CONNECTED || state == STATE_DISCONNECTING {
            let weak = self.self_weak.clone();
            self.event_loop.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    pub fn start_read(&self) {
        let weak = self.self_weak.clone();
        self.event_loop.run_in_loop(move || {
            if let Some(conn) = weak.upgrade() {
                if !conn.reading.load(Ordering::SeqCst) || !conn.channel.is_reading() {
                    conn.channel.enable_reading();
                    conn.reading.store(true, Ordering::SeqCst);
                }
            }
        });
    }

    pub fn stop_read(&self) {
        let weak = self.self_weak.clone();
        self.event_loop.run_in_loop(move || {
            if let Some(conn) = weak.upgrade() {
                if conn.reading.load(Ordering::SeqCst) || conn.channel.is_reading() {
                    conn.channel.disable_reading();
                    conn.reading.store(false, Ordering::SeqCst);
                }
            }
        });
    }

    /// Called once when the server or client adopts the connection.
    pub(crate) fn connect_established(&self) {
        self.event_loop.assert_in_loop_thread();
        assert_eq!(self.state.load(Ordering::SeqCst), STATE_CONNECTING);
        self.state.store(STATE_CONNECTED, Ordering::SeqCst);

        let owner: Arc<dyn Any + Send + Sync> = self.shared();
        self.channel.tie(&owner);
        self.channel.enable_reading();
        self.reading.store(true, Ordering::SeqCst);

        let cb = self.connection_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(&self.shared());
        }
    }

    /// Called once when the server or client removes the connection from
    /// its map; fires the connection callback with `connected() == false`
    /// exactly once.
    pub(crate) fn connect_destroyed(&self) {
        self.event_loop.assert_in_loop_thread();

        if self.state.load(Ordering::SeqCst) == STATE_CONNECTED {
            self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
            self.channel.disable_all();

            let cb = self.connection_cb.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb(&self.shared());
            }
        }

        self.channel.remove();
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();

        if self.state.load(Ordering::SeqCst) == STATE_DISCONNECTED {
            log::warn!("TcpConnection [{}]: disconnected, give up writing", self.name);
            return;
        }

        let mut nwrote = 0usize;
        let mut fault = false;
        let mut output = self.output_buffer.lock().unwrap();

        // try a direct write when nothing is queued yet
        if output.readable_bytes() == 0 && !self.channel.is_writing() {
            match self.socket.write(data) {
                Ok(n) => {
                    nwrote = n;
                    if nwrote == data.len() {
                        let cb = self.write_complete_cb.lock().unwrap().clone();
                        if let Some(cb) = cb {
                            let conn = self.shared();
                            self.event_loop.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(e) => {
                    if e.kind() != ErrorKind::WouldBlock {
                        log::error!("TcpConnection [{}]: write: {}", self.name, e);
                        if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET))
                        {
                            fault = true;
                        }
                    }
                }
            }
        }

        let remaining = data.len() - nwrote;
        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::SeqCst);

            if old_len + remaining >= mark && old_len < mark {
                let cb = self.high_water_mark_cb.lock().unwrap().clone();
                if let Some(cb) = cb {
                    let conn = self.shared();
                    let size = old_len + remaining;
                    self.event_loop.queue_in_loop(move || cb(&conn, size));
                }
            }

            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();

        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                log::error!("TcpConnection [{}]: shutdown: {}", self.name, e);
            }
        }
    }

    fn force_close_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();

        let state = self.state.load(Ordering::SeqCst);
        if state == STATE_CONNECTED || state == STATE_DISCONNECTING {
            self.handle_close();
        }
    }

    fn handle_read(&self, receive_time: Timestamp) {
        self.event_loop.assert_in_loop_thread();

        let result = {
            let mut input = self.input_buffer.lock().unwrap();
            input.read_fd(self.socket.as_raw_fd())
        };

        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                let cb = self.message_cb.lock().unwrap().clone();
                if let Some(cb) = cb {
                    let conn = self.shared();
                    let mut input = self.input_buffer.lock().unwrap();
                    cb(&conn, &mut input, receive_time);
                } else {
                    self.input_buffer.lock().unwrap().retrieve_all();
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => (),
            Err(e) => {
                log::error!("TcpConnection [{}]: read: {}", self.name, e);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.event_loop.assert_in_loop_thread();

        if !self.channel.is_writing() {
            log::trace!(
                "TcpConnection [{}]: fd = {} is down, no more writing",
                self.name,
                self.channel.fd()
            );
            return;
        }

        let mut output = self.output_buffer.lock().unwrap();
        match self.socket.write(output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    drop(output);

                    let cb = self.write_complete_cb.lock().unwrap().clone();
                    if let Some(cb) = cb {
                        let conn = self.shared();
                        self.event_loop.queue_in_loop(move || cb(&conn));
                    }

                    if self.state.load(Ordering::SeqCst) == STATE_DISCONNECTING {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => (),
            Err(e) => log::error!("TcpConnection [{}]: handle_write: {}", self.name, e),
        }
    }

    fn handle_close(&self) {
        self.event_loop.assert_in_loop_thread();

        let state = self.state.load(Ordering::SeqCst);
        log::trace!(
            "TcpConnection [{}]: fd = {} state = {}",
            self.name,
            self.channel.fd(),
            state_name(state)
        );
        assert!(state == STATE_CONNECTED || state == STATE_DISCONNECTING);

        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
        self.channel.disable_all();

        let conn = self.shared();
        let connection_cb = self.connection_cb.lock().unwrap().clone();
        if let Some(cb) = connection_cb {
            cb(&conn);
        }
        let close_cb = self.close_cb.lock().unwrap().clone();
        if let Some(cb) = close_cb {
            cb(&conn);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => log::error!("TcpConnection [{}]: SO_ERROR = {}", self.name, e),
            Ok(None) => (),
            Err(e) => log::error!("TcpConnection [{}]: getsockopt SO_ERROR: {}", self.name, e),
        }
    }

    /// The shared handle this connection was created as.
    fn shared(&self) -> Arc<TcpConnection> {
        self.self_weak.upgrade().expect("connection handle alive")
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        log::debug!(
            "TcpConnection::drop [{}] fd = {} state = {}",
            self.name,
            self.channel.fd(),
            state_name(self.state.load(Ordering::SeqCst))
        );
    }
}

#[cfg(test)]
mod test {
    use super::state_name;

    #[test]
    fn state_names_cover_the_machine() {
        assert_eq!(state_name(super::STATE_DISCONNECTED), "Disconnected");
        assert_eq!(state_name(super::STATE_CONNECTING), "Connecting");
        assert_eq!(state_name(super::STATE_CONNECTED), "Connected");
        assert_eq!(state_name(super::STATE_DISCONNECTING), "Disconnecting");
    }
}
