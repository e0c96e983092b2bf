//! `Socket` — the client-side dispatch shim.
//!
//! A socket is one of a closed set of kinds, each owning a pooled channel
//! of the matching type. Requests arrive as [`Request`] values and are
//! routed by pattern matching; the reply is a [`Reply`] value that converts
//! to a syscall-style return with [`Reply::as_ret`].
//!
//! ```text
//! Socket<W>
//!   ├─ Stream(StreamSocket)      ── PooledChannel<StreamChannel<W>>
//!   ├─ Datagram(DatagramSocket)  ── PooledChannel<DatagramChannel<W>>
//!   ├─ Raw(RawSocket)            ── PooledChannel<DatagramChannel<W>>
//!   └─ Uninit                    ── no channel, every request is EBADF
//! ```
//!
//! Dispatch never allocates. The channel goes back to its pool when the
//! socket is closed or dropped, whichever comes first.

use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;

use sockem_core::buffer::PacketAllocator;
use sockem_core::error::{Result, SockError};
use sockem_core::notifier::Notifier;
use sockem_core::Endpoint;

use crate::channel_pool::{ChannelPool, ChannelRef, PooledChannel};
use crate::config::TransportConfig;
use crate::datagram::DatagramChannel;
use crate::stream::StreamChannel;
use crate::DefaultNotifier;

/// Socket kinds a process can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
    Raw,
}

/// The per-process channel pools, one per channel type.
pub struct ChannelPools<W: Notifier = DefaultNotifier> {
    pub datagram: Arc<ChannelPool<DatagramChannel<W>>>,
    pub stream: Arc<ChannelPool<StreamChannel<W>>>,
}

impl<W: Notifier> ChannelPools<W> {
    /// Pools sized by `cfg`; drained buffers go to `reclaim`.
    pub fn new(cfg: &TransportConfig, reclaim: Arc<dyn PacketAllocator>) -> Result<Self> {
        Ok(Self {
            datagram: ChannelPool::new(cfg.dgram_sockets, Arc::clone(&reclaim))?,
            stream: ChannelPool::new(cfg.stream_sockets, reclaim)?,
        })
    }
}

/// A client request against one socket.
pub enum Request<'a> {
    Send {
        pid: u32,
        iov: &'a [IoSlice<'a>],
        dest: Option<Endpoint>,
    },
    Recv {
        pid: u32,
        iov: &'a mut [IoSliceMut<'a>],
        src: Option<&'a mut Endpoint>,
    },
    GetFlags,
    SetFlags(i32),
    RecvClear,
    Connect(Endpoint),
}

/// Outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Bytes sent or received, or 0 for requests without a count.
    Done(usize),
    Flags(i32),
    /// Wakeup signals coalesced since the last clear.
    Cleared(u64),
    Error(SockError),
}

impl Reply {
    /// Syscall convention: the count on success, `-errno` on failure.
    pub fn as_ret(&self) -> i64 {
        match self {
            Reply::Done(n) => *n as i64,
            Reply::Flags(f) => i64::from(*f),
            Reply::Cleared(c) => *c as i64,
            Reply::Error(e) => -i64::from(e.errno()),
        }
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

impl<T: Into<Reply>> From<Result<T>> for Reply {
    fn from(r: Result<T>) -> Self {
        match r {
            Ok(v) => v.into(),
            Err(e) => Reply::Error(e),
        }
    }
}

impl From<usize> for Reply {
    fn from(n: usize) -> Self {
        Reply::Done(n)
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Reply::Done(0)
    }
}

pub struct StreamSocket<W: Notifier = DefaultNotifier> {
    chan: PooledChannel<StreamChannel<W>>,
}

impl<W: Notifier> StreamSocket<W> {
    pub fn open(pools: &ChannelPools<W>) -> Result<Self> {
        Ok(Self { chan: pools.stream.acquire()? })
    }

    fn handle(&mut self, req: Request<'_>) -> Reply {
        match req {
            Request::Send { pid, iov, dest } => self.chan.send(pid, iov, dest).into(),
            Request::Recv { pid, iov, src } => self.chan.recv(pid, iov, src).into(),
            Request::GetFlags => Reply::Flags(self.chan.flags()),
            Request::SetFlags(f) => {
                self.chan.set_flags(f);
                Reply::Done(0)
            }
            Request::RecvClear => self.chan.recv_clear().map(Reply::Cleared).into(),
            Request::Connect(peer) => {
                self.chan.connect(peer);
                Reply::Done(0)
            }
        }
    }

    pub fn channel(&self) -> &StreamChannel<W> {
        &self.chan
    }

    /// Stack-side handle on this socket's channel.
    pub fn attach(&self) -> ChannelRef<StreamChannel<W>> {
        self.chan.attach()
    }
}

pub struct DatagramSocket<W: Notifier = DefaultNotifier> {
    chan: PooledChannel<DatagramChannel<W>>,
}

impl<W: Notifier> DatagramSocket<W> {
    pub fn open(pools: &ChannelPools<W>) -> Result<Self> {
        Ok(Self { chan: pools.datagram.acquire()? })
    }

    fn handle(&mut self, req: Request<'_>) -> Reply {
        match req {
            Request::Send { iov, dest, pid } => self.chan.send(pid, iov, dest).into(),
            Request::Recv { iov, src, .. } => match self.chan.recv(iov) {
                Ok(info) => {
                    if let Some(src) = src {
                        *src = info.src;
                    }
                    Reply::Done(info.len)
                }
                Err(e) => Reply::Error(e),
            },
            Request::GetFlags => Reply::Flags(self.chan.flags()),
            Request::SetFlags(f) => {
                self.chan.set_flags(f);
                Reply::Done(0)
            }
            Request::RecvClear => self.chan.recv_clear().map(Reply::Cleared).into(),
            Request::Connect(peer) => {
                self.chan.connect(peer);
                Reply::Done(0)
            }
        }
    }

    pub fn channel(&self) -> &DatagramChannel<W> {
        &self.chan
    }

    /// Stack-side handle on this socket's channel.
    pub fn attach(&self) -> ChannelRef<DatagramChannel<W>> {
        self.chan.attach()
    }
}

/// Raw IP socket. Same channel and request handling as a datagram socket;
/// the stack is what treats its payloads as whole IP packets.
pub struct RawSocket<W: Notifier = DefaultNotifier> {
    inner: DatagramSocket<W>,
}

impl<W: Notifier> RawSocket<W> {
    pub fn open(pools: &ChannelPools<W>) -> Result<Self> {
        Ok(Self { inner: DatagramSocket::open(pools)? })
    }

    fn handle(&mut self, req: Request<'_>) -> Reply {
        self.inner.handle(req)
    }

    pub fn channel(&self) -> &DatagramChannel<W> {
        self.inner.channel()
    }

    pub fn attach(&self) -> ChannelRef<DatagramChannel<W>> {
        self.inner.attach()
    }
}

pub enum Socket<W: Notifier = DefaultNotifier> {
    Stream(StreamSocket<W>),
    Datagram(DatagramSocket<W>),
    Raw(RawSocket<W>),
    Uninit,
}

impl<W: Notifier> Default for Socket<W> {
    fn default() -> Self {
        Socket::Uninit
    }
}

impl<W: Notifier> Socket<W> {
    /// Open a socket of `kind`, taking a channel from the matching pool.
    ///
    /// Fails with `PoolExhausted` when no channel is free.
    pub fn open(kind: SocketKind, pools: &ChannelPools<W>) -> Result<Self> {
        let sock = match kind {
            SocketKind::Stream => Socket::Stream(StreamSocket::open(pools)?),
            SocketKind::Datagram => Socket::Datagram(DatagramSocket::open(pools)?),
            SocketKind::Raw => Socket::Raw(RawSocket::open(pools)?),
        };
        tracing::debug!(?kind, "socket opened");
        Ok(sock)
    }

    pub fn kind(&self) -> Option<SocketKind> {
        match self {
            Socket::Stream(_) => Some(SocketKind::Stream),
            Socket::Datagram(_) => Some(SocketKind::Datagram),
            Socket::Raw(_) => Some(SocketKind::Raw),
            Socket::Uninit => None,
        }
    }

    /// Route one request to the socket's protocol handler.
    pub fn handle_request(&mut self, req: Request<'_>) -> Reply {
        match self {
            Socket::Stream(s) => s.handle(req),
            Socket::Datagram(s) => s.handle(req),
            Socket::Raw(s) => s.handle(req),
            Socket::Uninit => Reply::Error(SockError::NotInitialized),
        }
    }

    /// Release the channel. The socket is `Uninit` afterwards.
    pub fn close(&mut self) {
        if let Some(kind) = self.kind() {
            tracing::debug!(?kind, "socket closed");
        }
        *self = Socket::Uninit;
    }

    /// Readiness fd the client waits on, if the notifier has one.
    pub fn wait_fd(&self) -> Option<std::os::fd::RawFd> {
        match self {
            Socket::Stream(s) => s.channel().client_wake().raw_fd(),
            Socket::Datagram(s) => s.channel().client_wake().raw_fd(),
            Socket::Raw(s) => s.channel().client_wake().raw_fd(),
            Socket::Uninit => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counting_notifier::CountingNotifier;
    use crate::heap_packets::HeapPackets;
    use sockem_core::TaggedBuf;

    type Pools = ChannelPools<CountingNotifier>;

    fn pools(dgram: usize, stream: usize) -> (Pools, Arc<HeapPackets>) {
        let packets = Arc::new(HeapPackets::new(64, 1500));
        let cfg = TransportConfig::new().dgram_sockets(dgram).stream_sockets(stream);
        (Pools::new(&cfg, packets.clone()).unwrap(), packets)
    }

    const PEER: Endpoint = Endpoint::new([192, 0, 2, 1], 4000);

    #[test]
    fn test_uninit_rejects_everything() {
        let mut sock = Socket::<CountingNotifier>::default();
        let reply = sock.handle_request(Request::GetFlags);
        assert_eq!(reply, Reply::Error(SockError::NotInitialized));
        assert_eq!(reply.as_ret(), -i64::from(libc::EBADF));
        assert!(sock.wait_fd().is_none());
    }

    #[test]
    fn test_open_exhausts_and_close_returns() {
        let (pools, _) = pools(1, 1);
        let mut a = Socket::open(SocketKind::Datagram, &pools).unwrap();
        assert_eq!(
            Socket::open(SocketKind::Raw, &pools).err(),
            Some(SockError::PoolExhausted)
        );
        // Stream sockets have their own pool
        let s = Socket::open(SocketKind::Stream, &pools).unwrap();
        assert_eq!(s.kind(), Some(SocketKind::Stream));

        a.close();
        assert!(a.kind().is_none());
        assert_eq!(pools.datagram.available(), 1);
        let raw = Socket::open(SocketKind::Raw, &pools).unwrap();
        drop(raw);
        drop(s);
        assert_eq!(pools.stream.available(), 1);
    }

    #[test]
    fn test_flags_and_clear() {
        let (pools, _) = pools(1, 1);
        let mut sock = Socket::open(SocketKind::Stream, &pools).unwrap();
        assert_eq!(sock.handle_request(Request::GetFlags), Reply::Flags(0));
        assert_eq!(sock.handle_request(Request::SetFlags(libc::O_NONBLOCK)), Reply::Done(0));
        assert_eq!(
            sock.handle_request(Request::GetFlags).as_ret(),
            i64::from(libc::O_NONBLOCK)
        );
        assert_eq!(sock.handle_request(Request::RecvClear), Reply::Cleared(0));
    }

    #[test]
    fn test_datagram_round_trip() {
        let (pools, packets) = pools(1, 0);
        let mut sock = Socket::open(SocketKind::Datagram, &pools).unwrap();
        let server = match &sock {
            Socket::Datagram(d) => d.attach(),
            _ => unreachable!(),
        };

        // Unconnected send without destination
        let payload = b"query";
        let iov = [IoSlice::new(payload)];
        let reply = sock.handle_request(Request::Send { pid: 5, iov: &iov, dest: None });
        assert_eq!(reply.as_ret(), -i64::from(libc::EDESTADDRREQ));

        sock.handle_request(Request::Connect(PEER));
        let reply = sock.handle_request(Request::Send { pid: 5, iov: &iov, dest: None });
        assert_eq!(reply, Reply::Done(5));

        // Stack echoes it back
        let entry = server.take().unwrap();
        let p = packets.alloc(entry.total_len()).unwrap();
        let n = unsafe {
            entry.gather(std::slice::from_raw_parts_mut(p.payload.as_ptr(), p.capacity))
        };
        server
            .deliver(TaggedBuf::new(p.handle, p.payload, n as u16).unwrap(), entry.dest)
            .unwrap();

        let mut out = [0u8; 32];
        let mut src = Endpoint::UNSPECIFIED;
        let reply = {
            let mut bufs = [IoSliceMut::new(&mut out)];
            sock.handle_request(Request::Recv { pid: 5, iov: &mut bufs, src: Some(&mut src) })
        };
        assert_eq!(reply, Reply::Done(5));
        assert_eq!(&out[..5], b"query");
        assert_eq!(src, PEER);

        let mut empty = [0u8; 4];
        let mut bufs = [IoSliceMut::new(&mut empty)];
        let reply = sock.handle_request(Request::Recv { pid: 5, iov: &mut bufs, src: None });
        assert_eq!(reply.as_ret(), -i64::from(libc::EAGAIN));
        assert!(reply.is_err());
    }

    #[test]
    fn test_stream_round_trip() {
        let (pools, packets) = pools(0, 1);
        let mut sock = Socket::open(SocketKind::Stream, &pools).unwrap();
        let server = match &sock {
            Socket::Stream(s) => s.attach(),
            _ => unreachable!(),
        };

        let iov = [IoSlice::new(b"abc"), IoSlice::new(b"def")];
        let reply = sock.handle_request(Request::Send { pid: 1, iov: &iov, dest: None });
        assert_eq!(reply, Reply::Done(6));

        let p = packets.alloc(6).unwrap();
        let out = unsafe { std::slice::from_raw_parts_mut(p.payload.as_ptr(), 6) };
        assert_eq!(server.drain_outbound(out), 6);
        server.deliver(TaggedBuf::new(p.handle, p.payload, 6).unwrap()).unwrap();

        let mut got = [0u8; 4];
        let reply = {
            let mut bufs = [IoSliceMut::new(&mut got)];
            sock.handle_request(Request::Recv { pid: 1, iov: &mut bufs, src: None })
        };
        assert_eq!(reply, Reply::Done(4));
        assert_eq!(&got, b"abcd");

        // Closing with a partial descriptor hands it back to the allocator
        assert_eq!(packets.in_use(), 1);
        drop(server);
        sock.close();
        assert_eq!(packets.in_use(), 0);
    }
}
