use std::io::{self, Error, ErrorKind, Read, Write};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{c_int, c_void, sockaddr, socklen_t, SOCK_CLOEXEC, SOCK_NONBLOCK};

use super::fd::FileDesc;

pub fn setsockopt<T>(sock: &Socket, opt: c_int, val: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        sock.as_raw_fd(),
        opt,
        val,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(sock: &Socket, opt: c_int, val: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        sock.as_raw_fd(),
        opt,
        val,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    Ok(slot)
}

pub fn address_family(addr: &SocketAddr) -> c_int {
    match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    }
}

pub(crate) fn sockaddr_from_addr(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(a) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = a.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                };
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = a.port().to_be();
                (*sin6).sin6_addr.s6_addr = a.ip().octets();
                (*sin6).sin6_flowinfo = a.flowinfo();
                (*sin6).sin6_scope_id = a.scope_id();
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as socklen_t)
        }
    }
}

pub(crate) fn sockaddr_to_addr(
    storage: &libc::sockaddr_storage,
    len: usize,
) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let sin = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let sin6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid address family")),
    }
}

fn sockname<F>(f: F) -> io::Result<SocketAddr>
where
    F: FnOnce(*mut sockaddr, *mut socklen_t) -> io::Result<c_int>,
{
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    f(&mut storage as *mut _ as *mut _, &mut len)?;
    sockaddr_to_addr(&storage, len as usize)
}

/// An owned TCP socket descriptor.
///
/// The descriptor is created (or accepted) non-blocking and close-on-exec,
/// and is closed when the `Socket` drops.
#[derive(Debug)]
pub struct Socket(FileDesc);

impl Socket {
    /// Creates a non-blocking stream socket for `family`
    /// (`AF_INET`/`AF_INET6`).
    pub fn new_nonblocking(family: c_int) -> io::Result<Socket> {
        let fd = syscall!(socket(
            family,
            libc::SOCK_STREAM | SOCK_NONBLOCK | SOCK_CLOEXEC,
            libc::IPPROTO_TCP
        ))?;

        Ok(Socket(FileDesc::new(fd)))
    }

    pub fn bind_addr(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = sockaddr_from_addr(addr);
        syscall!(bind(
            self.as_raw_fd(),
            &storage as *const _ as *const sockaddr,
            len
        ))?;
        Ok(())
    }

    pub fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.as_raw_fd(), libc::SOMAXCONN))?;
        Ok(())
    }

    /// Accepts one pending connection; the returned socket is non-blocking
    /// and close-on-exec.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        let fd = loop {
            match syscall!(accept4(
                self.as_raw_fd(),
                &mut storage as *mut _ as *mut sockaddr,
                &mut len,
                SOCK_NONBLOCK | SOCK_CLOEXEC
            )) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                other => break other,
            }
        }?;

        let addr = sockaddr_to_addr(&storage, len as usize)?;
        Ok((Socket(FileDesc::new(fd)), addr))
    }

    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = sockaddr_from_addr(addr);
        syscall!(connect(
            self.as_raw_fd(),
            &storage as *const _ as *const sockaddr,
            len
        ))?;
        Ok(())
    }

    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.as_raw_fd(), libc::SHUT_WR))?;
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sockname(|storage, len| syscall!(getsockname(self.as_raw_fd(), storage, len)))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        sockname(|storage, len| syscall!(getpeername(self.as_raw_fd(), storage, len)))
    }

    /// True when the connection loops back onto itself: the kernel can pair
    /// an in-progress connect with its own ephemeral port on loopback.
    pub fn is_self_connect(&self) -> bool {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => local == peer,
            _ => false,
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.0).read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.0).write(buf)
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as c_int)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as c_int)
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as c_int)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as c_int)
    }

    /// Pending `SO_ERROR`, cleared by the call.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self, libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    /// Kernel `TCP_INFO` snapshot. The kernel may fill fewer bytes than the
    /// full struct on older releases; unfilled fields read as zero.
    pub fn tcp_info(&self) -> io::Result<libc::tcp_info> {
        let mut info: libc::tcp_info = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::tcp_info>() as socklen_t;
        syscall!(getsockopt(
            self.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut c_void,
            &mut len
        ))?;
        Ok(info)
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.raw()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.0.2.7:2007".parse().unwrap();
        let (storage, len) = sockaddr_from_addr(&addr);
        let back = sockaddr_to_addr(&storage, len as usize).unwrap();
        assert_eq!(addr, back);
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let (storage, len) = sockaddr_from_addr(&addr);
        let back = sockaddr_to_addr(&storage, len as usize).unwrap();
        assert_eq!(addr, back);
    }

    #[test]
    fn bind_and_report_local_addr() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = Socket::new_nonblocking(address_family(&addr)).unwrap();
        sock.bind_addr(&addr).unwrap();
        let bound = sock.local_addr().unwrap();
        assert_eq!(bound.ip(), addr.ip());
        assert_ne!(bound.port(), 0);
    }
}
