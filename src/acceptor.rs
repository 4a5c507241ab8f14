use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::callbacks::NewConnectionCallback;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::fd::FileDesc;
use crate::sys::socket::{address_family, Socket};

/// A listening socket and its channel; accepted descriptors are handed to
/// a callback as owned [`Socket`]s.
pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    accept_socket: Socket,
    accept_channel: Arc<Channel>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    listening: AtomicBool,
    /// Spare descriptor sacrificed to drain the queue on EMFILE.
    idle_fd: Mutex<Option<FileDesc>>,
}

impl Acceptor {
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let accept_socket = Socket::new_nonblocking(address_family(listen_addr))?;
        accept_socket.set_reuse_addr(true)?;
        if reuse_port {
            accept_socket.set_reuse_port(true)?;
        }
        accept_socket.bind_addr(listen_addr)?;

        let idle_fd = open_dev_null()?;
        let accept_channel = Channel::new(Arc::downgrade(event_loop), accept_socket.as_raw_fd());

        let acceptor = Arc::new(Acceptor {
            event_loop: event_loop.clone(),
            accept_socket,
            accept_channel,
            new_connection_cb: Mutex::new(None),
            listening: AtomicBool::new(false),
            idle_fd: Mutex::new(Some(idle_fd)),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.accept_channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(
        &self,
        cb: impl FnMut(Socket, SocketAddr) + Send + 'static,
    ) {
        *self.new_connection_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// The bound address; useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.accept_socket.local_addr()
    }

    pub fn listen(&self) {
        self.event_loop.assert_in_loop_thread();
        self.listening.store(true, Ordering::SeqCst);

        if let Err(e) = self.accept_socket.listen() {
            log::error!("Acceptor: listen: {}", e);
            panic!("Acceptor failed to listen: {}", e);
        }

        self.accept_channel.enable_reading();
    }

    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();

        loop {
            match self.accept_socket.accept() {
                Ok((socket, peer_addr)) => {
                    let mut cb = self.new_connection_cb.lock().unwrap();
                    match cb.as_mut() {
                        Some(cb) => cb(socket, peer_addr),
                        None => log::warn!("Acceptor: no callback, dropping {}", peer_addr),
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.raw_os_error() == Some(libc::EMFILE) => {
                    log::error!("Acceptor: file descriptors exhausted");
                    self.drain_with_idle_fd();
                }
                Err(e) => {
                    log::error!("Acceptor: accept: {}", e);
                    break;
                }
            }
        }
    }

    /// Closes the spare descriptor, accepts the pending connection so the
    /// peer sees an orderly close instead of a busy-accept loop, then
    /// reopens the spare.
    fn drain_with_idle_fd(&self) {
        let mut idle = self.idle_fd.lock().unwrap();
        *idle = None;

        match syscall!(accept(
            self.accept_socket.as_raw_fd(),
            std::ptr::null_mut(),
            std::ptr::null_mut()
        )) {
            Ok(fd) => drop(FileDesc::new(fd)),
            Err(e) => log::error!("Acceptor: drain accept: {}", e),
        }

        match open_dev_null() {
            Ok(fd) => *idle = Some(fd),
            Err(e) => log::error!("Acceptor: reopen idle fd: {}", e),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.accept_channel.disable_all();
        self.accept_channel.remove();
    }
}

fn open_dev_null() -> io::Result<FileDesc> {
    let fd = syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC
    ))?;
    Ok(FileDesc::new(fd))
}
