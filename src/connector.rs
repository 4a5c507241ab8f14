use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::socket::{address_family, Socket};

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;

const INIT_RETRY_DELAY_MS: u64 = 500;
const MAX_RETRY_DELAY_MS: u64 = 30 * 1000;

/// Non-blocking connect with exponential backoff.
///
/// One attempt wraps its in-progress descriptor in a write-interested
/// channel; completion is judged by `SO_ERROR` on writability. Retryable
/// errno values double the delay up to 30 s. [`stop`](Connector::stop) wins
/// against an in-flight retry: the rescheduled attempt observes the flag
/// and abandons.
pub struct Connector {
    event_loop: Arc<EventLoop>,
    server_addr: SocketAddr,
    connect: AtomicBool,
    state: AtomicU8,
    retry_delay_ms: AtomicU64,
    channel: Mutex<Option<Arc<Channel>>>,
    socket: Mutex<Option<Socket>>,
    new_connection_cb: Mutex<Option<Box<dyn FnMut(Socket) + Send>>>,
    self_weak: Weak<Connector>,
}

impl Connector {
    pub fn new(event_loop: &Arc<EventLoop>, server_addr: SocketAddr) -> Arc<Connector> {
        Arc::new_cyclic(|self_weak| Connector {
            event_loop: event_loop.clone(),
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(STATE_DISCONNECTED),
            retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY_MS),
            channel: Mutex::new(None),
            socket: Mutex::new(None),
            new_connection_cb: Mutex::new(None),
            self_weak: self_weak.clone(),
        })
    }

    /// The callback receives the connected socket; channel bookkeeping is
    /// already detached so ownership transfers cleanly.
    pub fn set_new_connection_callback(&self, cb: impl FnMut(Socket) + Send + 'static) {
        *self.new_connection_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Safe from any thread.
    pub fn start(&self) {
        self.connect.store(true, Ordering::SeqCst);
        let weak = self.self_weak.clone();
        self.event_loop.run_in_loop(move || {
            if let Some(connector) = weak.upgrade() {
                connector.start_in_loop();
            }
        });
    }

    /// Must be called on the owning loop.
    pub fn restart(&self) {
        self.event_loop.assert_in_loop_thread();
        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
        self.retry_delay_ms
            .store(INIT_RETRY_DELAY_MS, Ordering::SeqCst);
        self.connect.store(true, Ordering::SeqCst);
        self.start_in_loop();
    }

    /// Safe from any thread.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::SeqCst);
        let weak = self.self_weak.clone();
        self.event_loop.queue_in_loop(move || {
            if let Some(connector) = weak.upgrade() {
                connector.stop_in_loop();
            }
        });
    }

    fn start_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        assert_eq!(self.state.load(Ordering::SeqCst), STATE_DISCONNECTED);

        if self.connect.load(Ordering::SeqCst) {
            self.do_connect();
        } else {
            log::debug!("Connector: do not connect to {}", self.server_addr);
        }
    }

    fn stop_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();

        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTING => {
                self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                if let Some(socket) = self.remove_and_reset_channel() {
                    self.retry(socket);
                }
            }
            STATE_CONNECTED => {
                // the descriptor was handed off on connect; only the state
                // latch remains, and a later start() asserts disconnected
                self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
            }
            _ => (),
        }
    }

    fn do_connect(&self) {
        let socket = match Socket::new_nonblocking(address_family(&self.server_addr)) {
            Ok(socket) => socket,
            Err(e) => {
                log::error!("Connector: socket: {}", e);
                panic!("Connector failed to create a socket: {}", e);
            }
        };

        let result = socket.connect(&self.server_addr);
        let errno = match &result {
            Ok(()) => 0,
            Err(e) => e.raw_os_error().unwrap_or(0),
        };

        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN | libc::EALREADY => {
                self.connecting(socket)
            }

            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => self.retry(socket),

            _ => {
                log::error!(
                    "Connector: unexpected connect error to {}: {}",
                    self.server_addr,
                    result.unwrap_err()
                );
            }
        }
    }

    /// Parks the in-progress descriptor behind a write-interested channel.
    fn connecting(&self, socket: Socket) {
        use std::os::unix::io::AsRawFd;

        self.state.store(STATE_CONNECTING, Ordering::SeqCst);

        let channel = Channel::new(Arc::downgrade(&self.event_loop), socket.as_raw_fd());
        *self.socket.lock().unwrap() = Some(socket);

        {
            let weak = self.self_weak.clone();
            channel.set_write_callback(move || {
                if let Some(connector) = weak.upgrade() {
                    connector.handle_write();
                }
            });
        }
        {
            let weak = self.self_weak.clone();
            channel.set_error_callback(move || {
                if let Some(connector) = weak.upgrade() {
                    connector.handle_error();
                }
            });
        }

        *self.channel.lock().unwrap() = Some(channel.clone());
        channel.enable_writing();
    }

    /// Detaches the attempt's channel and reclaims the socket. The channel
    /// itself is dropped from the pending-task drain, never from inside its
    /// own dispatch.
    fn remove_and_reset_channel(&self) -> Option<Socket> {
        if let Some(channel) = self.channel.lock().unwrap().take() {
            channel.disable_all();
            channel.remove();
            self.event_loop.queue_in_loop(move || drop(channel));
        }
        self.socket.lock().unwrap().take()
    }

    fn handle_write(&self) {
        log::trace!(
            "Connector::handle_write state = {}",
            self.state.load(Ordering::SeqCst)
        );

        if self.state.load(Ordering::SeqCst) != STATE_CONNECTING {
            return;
        }

        let socket = match self.remove_and_reset_channel() {
            Some(socket) => socket,
            None => return,
        };

        match socket.take_error() {
            Ok(Some(e)) => {
                log::warn!("Connector: SO_ERROR = {} for {}", e, self.server_addr);
                self.retry(socket);
            }
            Err(e) => {
                log::warn!("Connector: getsockopt SO_ERROR: {}", e);
                self.retry(socket);
            }
            Ok(None) => {
                if socket.is_self_connect() {
                    log::warn!("Connector: self connect to {}", self.server_addr);
                    self.retry(socket);
                } else {
                    self.state.store(STATE_CONNECTED, Ordering::SeqCst);
                    if self.connect.load(Ordering::SeqCst) {
                        let mut cb = self.new_connection_cb.lock().unwrap();
                        match cb.as_mut() {
                            Some(cb) => cb(socket),
                            None => log::warn!("Connector: connected but no callback"),
                        }
                    }
                }
            }
        }
    }

    fn handle_error(&self) {
        log::error!(
            "Connector::handle_error state = {}",
            self.state.load(Ordering::SeqCst)
        );

        if self.state.load(Ordering::SeqCst) == STATE_CONNECTING {
            if let Some(socket) = self.remove_and_reset_channel() {
                if let Ok(Some(e)) = socket.take_error() {
                    log::debug!("Connector: SO_ERROR = {}", e);
                }
                self.retry(socket);
            }
        }
    }

    /// Closes the failed descriptor and schedules a fresh attempt after the
    /// current delay, doubling it up to the cap.
    fn retry(&self, socket: Socket) {
        drop(socket);
        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);

        if !self.connect.load(Ordering::SeqCst) {
            log::debug!("Connector: do not connect to {}", self.server_addr);
            return;
        }

        let delay_ms = self.retry_delay_ms.load(Ordering::SeqCst);
        log::info!(
            "Connector: retry connecting to {} in {} ms",
            self.server_addr,
            delay_ms
        );

        let weak = self.self_weak.clone();
        self.event_loop
            .run_after(Duration::from_millis(delay_ms), move || {
                if let Some(connector) = weak.upgrade() {
                    connector.start_in_loop();
                }
            });

        self.retry_delay_ms.store(
            std::cmp::min(delay_ms * 2, MAX_RETRY_DELAY_MS),
            Ordering::SeqCst,
        );
    }
}
