use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnectionRef, ThreadInitCallback, WriteCompleteCallback,
};
use crate::event_loop::EventLoop;
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::sys::socket::Socket;
use crate::tcp_connection::TcpConnection;
use crate::timestamp::Timestamp;

/// A TCP server: an [`Acceptor`] on the base loop plus a pool of worker
/// loops that own the accepted connections.
///
/// Each accepted descriptor is assigned round-robin to a worker loop; its
/// lifetime callbacks fire there. The name-to-connection map is touched
/// only from the base loop's thread.
pub struct TcpServer {
    event_loop: Arc<EventLoop>,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    thread_pool: Arc<EventLoopThreadPool>,
    connection_cb: Mutex<ConnectionCallback>,
    message_cb: Mutex<MessageCallback>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    thread_init_cb: Mutex<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<IndexMap<String, TcpConnectionRef>>,
    self_weak: Weak<TcpServer>,
}

impl TcpServer {
    /// Binds `listen_addr` (port 0 picks an ephemeral port; see
    /// [`listen_addr`](TcpServer::listen_addr)) without accepting yet.
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: &SocketAddr,
        name: &str,
        reuse_port: bool,
    ) -> io::Result<Arc<TcpServer>> {
        let acceptor = Acceptor::new(event_loop, listen_addr, reuse_port)?;
        let bound = acceptor.local_addr()?;

        let server = Arc::new_cyclic(|self_weak: &Weak<TcpServer>| TcpServer {
            event_loop: event_loop.clone(),
            ip_port: bound.to_string(),
            name: name.to_string(),
            acceptor,
            thread_pool: Arc::new(EventLoopThreadPool::new(event_loop.clone(), name)),
            connection_cb: Mutex::new(Arc::new(default_connection_callback)),
            message_cb: Mutex::new(Arc::new(default_message_callback)),
            write_complete_cb: Mutex::new(None),
            thread_init_cb: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(IndexMap::new()),
            self_weak: self_weak.clone(),
        });

        let weak = server.self_weak.clone();
        server
            .acceptor
            .set_new_connection_callback(move |socket, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer_addr);
                }
            });

        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound address formatted as `host:port`.
    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// The actual bound address.
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// Number of worker loops; must be called before
    /// [`start`](TcpServer::start). Zero keeps every connection on the base
    /// loop.
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(!self.started.load(Ordering::SeqCst));
        self.thread_pool.set_thread_num(num_threads);
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&TcpConnectionRef) + Send + Sync + 'static) {
        *self.connection_cb.lock().unwrap() = Arc::new(cb);
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&TcpConnectionRef, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        *self.message_cb.lock().unwrap() = Arc::new(cb);
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&TcpConnectionRef) + Send + Sync + 'static,
    ) {
        *self.write_complete_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Runs once inside each worker thread, before its loop starts.
    pub fn set_thread_init_callback(
        &self,
        cb: impl Fn(&Arc<EventLoop>) + Send + Sync + 'static,
    ) {
        *self.thread_init_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Starts the worker pool and begins listening. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.thread_pool
            .start(self.thread_init_cb.lock().unwrap().clone());

        assert!(!self.acceptor.listening());
        let acceptor = self.acceptor.clone();
        self.event_loop.run_in_loop(move || acceptor.listen());
    }

    fn new_connection(&self, socket: Socket, peer_addr: SocketAddr) {
        self.event_loop.assert_in_loop_thread();

        let io_loop = self.thread_pool.get_next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);

        log::info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name,
            conn_name,
            peer_addr
        );

        let local_addr = socket.local_addr().unwrap_or_else(|e| {
            log::error!("TcpServer [{}]: getsockname: {}", self.name, e);
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        });

        let conn = TcpConnection::new(&io_loop, conn_name.clone(), socket, local_addr, peer_addr);

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());

        conn.set_connection_callback(self.connection_cb.lock().unwrap().clone());
        conn.set_message_callback(self.message_cb.lock().unwrap().clone());
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }

        let weak = self.self_weak.clone();
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        let established = conn.clone();
        io_loop.run_in_loop(move || established.connect_established());
    }

    fn remove_connection(&self, conn: &TcpConnectionRef) {
        let weak = self.self_weak.clone();
        let conn = conn.clone();
        self.event_loop.run_in_loop(move || {
            if let Some(server) = weak.upgrade() {
                server.remove_connection_in_loop(&conn);
            }
        });
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionRef) {
        self.event_loop.assert_in_loop_thread();
        log::info!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            self.name,
            conn.name()
        );

        let removed = self.connections.lock().unwrap().shift_remove(conn.name());
        if removed.is_none() {
            log::warn!(
                "TcpServer [{}]: connection {} was not in the map",
                self.name,
                conn.name()
            );
        }

        let io_loop = conn.event_loop().clone();
        let conn = conn.clone();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.event_loop.assert_in_loop_thread();
        log::trace!("TcpServer::drop [{}]", self.name);

        let connections: Vec<TcpConnectionRef> =
            self.connections.lock().unwrap().drain(..).map(|(_, c)| c).collect();

        for conn in connections {
            let io_loop = conn.event_loop().clone();
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
