//! Timed socket IO.
//!
//! Backend writes go out as iovec batches. On a short write the already
//! sent bytes are trimmed off and the rest reissued; the retry budget is
//! the cumulative `send_timeout`, after which the error is final. Reads
//! carry separate first-byte and between-bytes deadlines.

use crate::error::{CoreError, CoreResult};
use palisade::params::Params;
use palisade::vtim;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::uio::writev;
use std::io::IoSlice;
use std::os::fd::AsFd;

/// The four deadlines every backend conversation carries.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Backend connect timeout, seconds.
    pub connect: f64,
    /// First response byte, seconds.
    pub first_byte: f64,
    /// Between response bytes, seconds.
    pub between_bytes: f64,
    /// Cumulative write budget, seconds.
    pub send: f64,
}

impl Timeouts {
    /// Lift the configured defaults.
    pub fn from_params(p: &Params) -> Timeouts {
        Timeouts {
            connect: p.connect_timeout,
            first_byte: p.first_byte_timeout,
            between_bytes: p.between_bytes_timeout,
            send: p.send_timeout,
        }
    }
}

fn wait_writable<F: AsFd>(fd: &F, deadline: f64) -> CoreResult<()> {
    let remaining = deadline - vtim::real_now();
    if remaining <= 0.0 {
        return Err(CoreError::SendTimeout);
    }
    let timeout =
        PollTimeout::try_from(vtim::duration(remaining)).unwrap_or(PollTimeout::MAX);
    let mut pfds = [PollFd::new(fd.as_fd(), PollFlags::POLLOUT)];
    let n = loop {
        match poll(&mut pfds, timeout) {
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
            Ok(n) => break n,
        }
    };
    if n == 0 {
        return Err(CoreError::SendTimeout);
    }
    Ok(())
}

fn wait_readable<F: AsFd>(fd: &F, budget: f64, which: &'static str) -> CoreResult<()> {
    let timeout = PollTimeout::try_from(vtim::duration(budget)).unwrap_or(PollTimeout::MAX);
    let mut pfds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
    let n = loop {
        match poll(&mut pfds, timeout) {
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
            Ok(n) => break n,
        }
    };
    if n == 0 {
        return Err(CoreError::ReadTimeout { which });
    }
    Ok(())
}

/// Write all of `bufs`, retrying partial writes by trimming sent bytes,
/// until done or the cumulative send timeout expires. Returns the byte
/// count written.
pub fn send_iovecs<F: AsFd>(fd: &F, bufs: &[&[u8]], tmo: &Timeouts) -> CoreResult<usize> {
    let total: usize = bufs.iter().map(|b| b.len()).sum();
    if total == 0 {
        return Ok(0);
    }
    let deadline = vtim::real_now() + tmo.send;
    let mut sent = 0usize;

    while sent < total {
        // Rebuild the iovec with already-sent bytes trimmed off the front.
        let mut iovs: Vec<IoSlice<'_>> = Vec::with_capacity(bufs.len());
        let mut skip = sent;
        for b in bufs {
            if skip >= b.len() {
                skip -= b.len();
                continue;
            }
            iovs.push(IoSlice::new(&b[skip..]));
            skip = 0;
        }

        match writev(fd, &iovs) {
            Ok(0) => {
                return Err(CoreError::NoConnection {
                    reason: "peer closed during write".to_string(),
                });
            }
            Ok(n) => {
                sent += n;
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::EAGAIN) => {
                wait_writable(fd, deadline)?;
            }
            Err(e) => return Err(e.into()),
        }
        if sent < total && vtim::real_now() >= deadline {
            return Err(CoreError::SendTimeout);
        }
    }
    Ok(sent)
}

/// Read into `buf` honoring first-byte / between-bytes deadlines. Returns
/// the bytes read; zero means orderly EOF before any byte.
pub fn recv_timed(stream: &std::net::TcpStream, buf: &mut [u8], tmo: &Timeouts) -> CoreResult<usize> {
    use std::io::Read;
    let mut got = 0usize;
    let mut stream = stream;
    while got < buf.len() {
        let budget = if got == 0 { tmo.first_byte } else { tmo.between_bytes };
        let which = if got == 0 { "first-byte" } else { "between-bytes" };
        wait_readable(&stream, budget, which)?;
        match stream.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(got)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    fn tmo() -> Timeouts {
        Timeouts {
            connect: 1.0,
            first_byte: 1.0,
            between_bytes: 0.2,
            send: 2.0,
        }
    }

    #[test]
    fn test_send_iovecs_full_delivery() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let tx = TcpStream::connect(addr).unwrap();
        let (mut rx, _) = listener.accept().unwrap();

        let parts: [&[u8]; 3] = [b"GET / HTTP/1.1\r\n", b"Host: x\r\n", b"\r\n"];
        let n = send_iovecs(&tx, &parts, &tmo()).unwrap();
        assert_eq!(n, parts.iter().map(|p| p.len()).sum::<usize>());

        let mut got = vec![0u8; n];
        rx.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    }

    #[test]
    fn test_send_timeout_on_stuffed_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let tx = TcpStream::connect(addr).unwrap();
        let (_rx, _) = listener.accept().unwrap();
        tx.set_nonblocking(true).unwrap();

        // Nobody reads; the kernel buffers fill and the budget runs out.
        let chunk = vec![0u8; 1 << 20];
        let parts: Vec<&[u8]> = (0..64).map(|_| chunk.as_slice()).collect();
        let mut t = tmo();
        t.send = 0.3;
        let r = send_iovecs(&tx, &parts, &t);
        assert!(matches!(r, Err(CoreError::SendTimeout)));
    }

    #[test]
    fn test_recv_first_byte_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let rx = TcpStream::connect(addr).unwrap();
        let (_tx, _) = listener.accept().unwrap();

        let mut t = tmo();
        t.first_byte = 0.15;
        let mut buf = [0u8; 16];
        let r = recv_timed(&rx, &mut buf, &t);
        assert!(matches!(
            r,
            Err(CoreError::ReadTimeout { which: "first-byte" })
        ));
    }
}
