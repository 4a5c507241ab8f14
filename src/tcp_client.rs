use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::buffer::Buffer;
use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnectionRef, WriteCompleteCallback,
};
use crate::connector::Connector;
use crate::event_loop::EventLoop;
use crate::sys::socket::Socket;
use crate::tcp_connection::TcpConnection;
use crate::timestamp::Timestamp;

/// A TCP client: a [`Connector`] plus a single connection slot.
///
/// The slot is mutex-guarded because [`disconnect`](TcpClient::disconnect)
/// may be called from any thread. With retry enabled, losing an established
/// connection restarts the connector from its initial backoff.
pub struct TcpClient {
    event_loop: Arc<EventLoop>,
    connector: Arc<Connector>,
    name: String,
    connection_cb: Mutex<ConnectionCallback>,
    message_cb: Mutex<MessageCallback>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<TcpConnectionRef>>,
    self_weak: Weak<TcpClient>,
}

impl TcpClient {
    pub fn new(
        event_loop: &Arc<EventLoop>,
        server_addr: SocketAddr,
        name: &str,
    ) -> Arc<TcpClient> {
        let connector = Connector::new(event_loop, server_addr);

        let client = Arc::new_cyclic(|self_weak: &Weak<TcpClient>| TcpClient {
            event_loop: event_loop.clone(),
            connector,
            name: name.to_string(),
            connection_cb: Mutex::new(Arc::new(default_connection_callback)),
            message_cb: Mutex::new(Arc::new(default_message_callback)),
            write_complete_cb: Mutex::new(None),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(1),
            connection: Mutex::new(None),
            self_weak: self_weak.clone(),
        });

        let weak = client.self_weak.clone();
        client.connector.set_new_connection_callback(move |socket| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(socket);
            }
        });

        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.connector.server_addr()
    }

    /// The current connection, if established.
    pub fn connection(&self) -> Option<TcpConnectionRef> {
        self.connection.lock().unwrap().clone()
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry.load(Ordering::SeqCst)
    }

    /// Reconnect automatically after an established connection drops.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::SeqCst);
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

    pub fn connect(&self) {
        log::info!(
            "TcpClient::connect [{}] - connecting to {}",
            self.name,
            self.connector.server_addr()
        );
        self.connect.store(true, Ordering::SeqCst);
        self.connector.start();
    }

    /// Gracefully shuts down the established connection. Safe from any
    /// thread.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::SeqCst);
        if let Some(conn) = self.connection.lock().unwrap().clone() {
            conn.shutdown();
        }
    }

    /// Abandons an in-progress connect attempt.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::SeqCst);
        self.connector.stop();
    }

    fn new_connection(&self, socket: Socket) {
        self.event_loop.assert_in_loop_thread();

        let peer_addr = socket.peer_addr().unwrap_or_else(|e| {
            log::error!("TcpClient [{}]: getpeername: {}", self.name, e);
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        });
        let local_addr = socket.local_addr().unwrap_or_else(|e| {
            log::error!("TcpClient [{}]: getsockname: {}", self.name, e);
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        });

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, conn_id);

        let conn = TcpConnection::new(
            &self.event_loop,
            conn_name,
            socket,
            local_addr,
            peer_addr,
        );

        conn.set_connection_callback(self.connection_cb.lock().unwrap().clone());
        conn.set_message_callback(self.message_cb.lock().unwrap().clone());
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }

        let weak = self.self_weak.clone();
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(client) = weak.upgrade() {
                client.remove_connection(conn);
            }
        }));

        *self.connection.lock().unwrap() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &TcpConnectionRef) {
        self.event_loop.assert_in_loop_thread();

        {
            let mut slot = self.connection.lock().unwrap();
            if let Some(held) = slot.as_ref() {
                assert!(Arc::ptr_eq(held, conn));
            }
            *slot = None;
        }

        let destroyed = conn.clone();
        self.event_loop
            .queue_in_loop(move || destroyed.connect_destroyed());

        if self.retry.load(Ordering::SeqCst) && self.connect.load(Ordering::SeqCst) {
            log::info!(
                "TcpClient::connect [{}] - reconnecting to {}",
                self.name,
                self.connector.server_addr()
            );
            self.connector.restart();
        } else {
            self.connector.stop();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        log::debug!("TcpClient::drop [{}]", self.name);

        let conn = self.connection.lock().unwrap().take();
        match conn {
            Some(conn) => {
                // the client is going away while its connection lives on;
                // rewire the close path to plain destruction
                conn.set_close_callback(Arc::new(|conn: &TcpConnectionRef| {
                    let destroyed = conn.clone();
                    conn.event_loop()
                        .queue_in_loop(move || destroyed.connect_destroyed());
                }));
                conn.force_close();
            }
            None => {
                self.connector.stop();
            }
        }
    }
}
