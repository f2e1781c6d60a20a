// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte transports the tunnel can pump between.
//!
//! `TcpStream` waits with `poll(2)`; [`MemoryTransport`] is an
//! in-process pipe so the tunnel logic can run without sockets.

use crate::util::{raw_descriptor, RawDescriptor};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of the generic two-transport wait.
const PAIR_POLL_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Nothing happened before the timeout.
    Idle,
    /// Data, or an orderly end of stream, can be read without blocking.
    Readable,
    /// The peer hung up or the transport is in error.
    Closed,
}

pub trait Transport: Read + Write + Send {
    /// Wait up to `timeout` for the transport to become readable.
    ///
    /// An interrupted wait reports `Idle` so callers simply loop.
    fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness>;

    /// Release the transport. Further reads and writes fail.
    ///
    /// The gateway closes both sides once a relay ends.
    fn close(&mut self);

    /// Wait on two transports at once.
    fn wait_pair(a: &Self, b: &Self, timeout: Duration) -> io::Result<(Readiness, Readiness)>
    where
        Self: Sized,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let ready = (a.wait_readable(Duration::ZERO)?, b.wait_readable(Duration::ZERO)?);
            let now = Instant::now();
            if ready != (Readiness::Idle, Readiness::Idle) || now >= deadline {
                return Ok(ready);
            }
            thread::sleep(PAIR_POLL_SLICE.min(deadline - now));
        }
    }
}

fn to_readiness(revents: libc::c_short) -> Readiness {
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        Readiness::Closed
    } else if revents & libc::POLLIN != 0 {
        // Pending data is still delivered when POLLHUP comes with it.
        Readiness::Readable
    } else if revents & libc::POLLHUP != 0 {
        Readiness::Closed
    } else {
        Readiness::Idle
    }
}

fn poll_descriptors(fds: &[RawDescriptor], timeout: Duration) -> io::Result<Vec<Readiness>> {
    let mut poll_fds: Vec<libc::pollfd> =
        fds.iter().map(|&fd| libc::pollfd { fd, events: libc::POLLIN, revents: 0 }).collect();
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: `poll_fds` is a valid, initialized array of `poll_fds.len()`
    // pollfd entries that outlives the call.
    let ret =
        unsafe { libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as libc::nfds_t, timeout_ms) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(vec![Readiness::Idle; fds.len()]);
        }
        return Err(err);
    }
    Ok(poll_fds.iter().map(|p| to_readiness(p.revents)).collect())
}

/// Wait for a single descriptor, such as a listening socket.
pub(crate) fn wait_descriptor(fd: RawDescriptor, timeout: Duration) -> io::Result<Readiness> {
    Ok(poll_descriptors(&[fd], timeout)?[0])
}

impl Transport for TcpStream {
    fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        wait_descriptor(raw_descriptor(self), timeout)
    }

    fn close(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }

    fn wait_pair(a: &Self, b: &Self, timeout: Duration) -> io::Result<(Readiness, Readiness)> {
        let ready = poll_descriptors(&[raw_descriptor(a), raw_descriptor(b)], timeout)?;
        Ok((ready[0], ready[1]))
    }
}

#[derive(Default)]
struct Inbound {
    data: VecDeque<u8>,
    /// The remote side finished writing; reads return 0 once drained.
    eof: bool,
    /// Hung up, or closed locally.
    closed: bool,
}

#[derive(Default)]
struct Shared {
    inbound: Mutex<Inbound>,
    outbound: Mutex<Vec<u8>>,
    changed: Condvar,
}

/// An in-memory transport.
///
/// Clones share state: a test keeps one clone to feed inbound bytes
/// and inspect what was written, and hands the other to the code
/// under test.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn inbound(&self) -> MutexGuard<'_, Inbound> {
        self.shared.inbound.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue bytes for the reader.
    pub fn feed(&self, bytes: &[u8]) {
        self.inbound().data.extend(bytes);
        self.shared.changed.notify_all();
    }

    /// Signal end of stream after the queued bytes.
    pub fn finish(&self) {
        self.inbound().eof = true;
        self.shared.changed.notify_all();
    }

    /// Simulate a peer hang-up.
    pub fn hang_up(&self) {
        self.inbound().closed = true;
        self.shared.changed.notify_all();
    }

    /// Everything written to this transport so far.
    pub fn written(&self) -> Vec<u8> {
        self.shared.outbound.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inbound().closed
    }
}

impl Read for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound();
        if inbound.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        if inbound.data.is_empty() {
            if inbound.eof {
                return Ok(0);
            }
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
        }
        let n = buf.len().min(inbound.data.len());
        for (dst, src) in buf.iter_mut().zip(inbound.data.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for MemoryTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.inbound().closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"));
        }
        self.shared.outbound.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        let inbound = self.inbound();
        let (inbound, _) = self
            .shared
            .changed
            .wait_timeout_while(inbound, timeout, |i| i.data.is_empty() && !i.eof && !i.closed)
            .unwrap_or_else(|e| e.into_inner());
        Ok(if inbound.closed {
            Readiness::Closed
        } else if !inbound.data.is_empty() || inbound.eof {
            Readiness::Readable
        } else {
            Readiness::Idle
        })
    }

    fn close(&mut self) {
        self.hang_up();
    }
}
