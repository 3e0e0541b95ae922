//! Signalling paths between a node and its peers.
//!
//! Sockets are bound up front by [`UdpPaths::bind`] so that a node never
//! starts half-connected. Reading starts later with [`UdpPaths::open`]: one
//! blocking reader thread per socket wraps every datagram into an
//! [`Event::Message`] and posts it to the node's queue. [`UdpPaths::close`]
//! stops and joins the readers; the sockets stay bound until the paths are
//! dropped.
//!
//! Outgoing traffic goes through the [`Transmit`] seam so the transaction
//! manager can be driven without real sockets.

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    event::Event,
    message::{Datagram, PeerId, SocketId, MAX_DATAGRAM_SIZE},
    queue::{EventSender, QueueError},
};

/// How often a blocked reader wakes up to check whether it should stop.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("no listen address configured")]
    NoListenAddress,
    #[error("unknown socket {0}")]
    UnknownSocket(SocketId),
    #[error(transparent)]
    IO(#[from] io::Error),
}

/// Sends one datagram to a peer from one of the node's sockets.
pub trait Transmit {
    fn transmit(&self, socket: SocketId, peer: PeerId, payload: Bytes) -> Result<(), TransportError>;
}

impl<T: Transmit + ?Sized> Transmit for Arc<T> {
    fn transmit(&self, socket: SocketId, peer: PeerId, payload: Bytes) -> Result<(), TransportError> {
        (**self).transmit(socket, peer, payload)
    }
}

pub struct UdpPaths {
    sockets: Vec<Arc<UdpSocket>>,
    local_addrs: Vec<SocketAddr>,
    running: Arc<AtomicBool>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpPaths {
    /// Binds every address, failing on the first one that cannot be bound.
    /// Sockets bound before the failure are released again.
    pub fn bind(addrs: &[SocketAddr]) -> Result<Self, TransportError> {
        if addrs.is_empty() {
            return Err(TransportError::NoListenAddress);
        }
        let mut sockets = Vec::with_capacity(addrs.len());
        let mut local_addrs = Vec::with_capacity(addrs.len());
        for &addr in addrs {
            let socket =
                UdpSocket::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
            let local = socket.local_addr()?;
            tracing::debug!(%addr, %local, "signalling socket bound");
            local_addrs.push(local);
            sockets.push(Arc::new(socket));
        }
        Ok(Self {
            sockets,
            local_addrs,
            running: Arc::new(AtomicBool::new(false)),
            readers: Mutex::new(Vec::new()),
        })
    }

    /// Addresses the sockets actually got, in [`SocketId`] order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn local_addr(&self, socket: SocketId) -> Option<SocketAddr> {
        self.local_addrs.get(socket.0 as usize).copied()
    }

    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts one reader thread per socket. Opening open paths is a no-op.
    pub fn open(&self, queue: &EventSender, label: &str) -> Result<(), TransportError> {
        let mut readers = self.readers.lock();
        if !readers.is_empty() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);
        if let Err(err) = self.spawn_readers(&mut readers, queue, label) {
            drop(readers);
            self.close();
            return Err(err);
        }
        tracing::info!(sockets = self.sockets.len(), "signalling paths open");
        Ok(())
    }

    fn spawn_readers(
        &self,
        readers: &mut Vec<JoinHandle<()>>,
        queue: &EventSender,
        label: &str,
    ) -> Result<(), TransportError> {
        for (index, socket) in self.sockets.iter().enumerate() {
            let id = SocketId(index as u16);
            socket.set_read_timeout(Some(READ_POLL_INTERVAL))?;
            let socket = socket.clone();
            let queue = queue.clone();
            let running = self.running.clone();
            let handle = thread::Builder::new()
                .name(format!("{label}-udp{index}"))
                .spawn(move || read_loop(id, &socket, &queue, &running))?;
            readers.push(handle);
        }
        Ok(())
    }

    /// Stops the readers and waits for them. Closing closed paths is a no-op.
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        let readers: Vec<_> = self.readers.lock().drain(..).collect();
        if readers.is_empty() {
            return;
        }
        for reader in readers {
            if reader.join().is_err() {
                tracing::error!("signalling reader thread panicked");
            }
        }
        tracing::info!("signalling paths closed");
    }
}

impl Transmit for UdpPaths {
    fn transmit(&self, socket: SocketId, peer: PeerId, payload: Bytes) -> Result<(), TransportError> {
        let sock = self
            .sockets
            .get(socket.0 as usize)
            .ok_or(TransportError::UnknownSocket(socket))?;
        sock.send_to(&payload, peer.addr())?;
        Ok(())
    }
}

impl Drop for UdpPaths {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(id: SocketId, socket: &UdpSocket, queue: &EventSender, running: &AtomicBool) {
    // one spare byte: a datagram filling it was cut short and must not decode
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
    while running.load(Ordering::Acquire) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(err) => {
                // e.g. ICMP port unreachable surfacing as ConnectionReset
                tracing::debug!(socket = %id, error = %err, "recv failed");
                continue;
            }
        };
        let datagram = Datagram {
            socket: id,
            peer: PeerId::new(from),
            payload: Bytes::copy_from_slice(&buf[..len]),
        };
        match queue.post(Event::Message(datagram)) {
            Ok(()) => {}
            Err(QueueError::Full(_)) => {
                tracing::warn!(socket = %id, peer = %from, len, "event queue full, datagram dropped");
            }
            Err(QueueError::Disconnected) => break,
        }
    }
    tracing::trace!(socket = %id, "reader stopped");
}

/// Transmitter that keeps every datagram instead of sending it.
#[cfg(any(test, feature = "testing"))]
#[derive(Clone, Default)]
pub struct RecordingTransmit {
    sent: Arc<Mutex<Vec<Datagram>>>,
}

#[cfg(any(test, feature = "testing"))]
impl RecordingTransmit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Datagram> {
        self.sent.lock().clone()
    }

    /// Returns and forgets everything sent so far.
    pub fn take(&self) -> Vec<Datagram> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

#[cfg(any(test, feature = "testing"))]
impl Transmit for RecordingTransmit {
    fn transmit(&self, socket: SocketId, peer: PeerId, payload: Bytes) -> Result<(), TransportError> {
        self.sent.lock().push(Datagram {
            socket,
            peer,
            payload,
        });
        Ok(())
    }
}
