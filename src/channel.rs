//! Duplex message channel over a connected Unix domain socket.
//!
//! A [`Channel`] frames [`Message`]s onto one stream socket and carries their
//! descriptors as `SCM_RIGHTS` ancillary data on the same write. Send and
//! receive are serialized by independent locks.
//!
//! Two I/O disciplines share the same framing state machines:
//! - **blocking** ([`Channel::send`], [`Channel::recv`]) for worker threads
//!   such as vCPU threads; waits with `poll(2)` bounded by the channel timeout.
//! - **cooperative** ([`Channel::send_async`], [`Channel::recv_async`]) for
//!   tasks on the owning Link's event loop; waits suspend on the tokio reactor
//!   instead of blocking the loop thread.
//!
//! The socket is always non-blocking; only the waiting differs.

use std::fmt;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use devproxy_protocol::{Encoded, Frame, Header, Message, HEADER_SIZE, MAX_FDS};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};

use crate::{Error, Result};

/// Most descriptors the kernel attaches to one `sendmsg` (`SCM_MAX_FD`).
/// Receiving into room for this many means the control data is never
/// truncated, so every descriptor that arrives is owned and closed even
/// when the frame is rejected for carrying more than [`MAX_FDS`].
const SCM_MAX_FD: usize = 253;

/// One framed, fd-passing duplex stream.
pub struct Channel {
    name: String,
    io: AsyncFd<OwnedFd>,
    pub(crate) send_lock: AsyncMutex<()>,
    pub(crate) recv_lock: AsyncMutex<()>,
    timeout: Duration,
    broken: AtomicBool,
    broken_reason: Mutex<Option<String>>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("fd", &self.io.get_ref().as_raw_fd())
            .field("broken", &self.is_broken())
            .finish()
    }
}

/// Outcome of one non-blocking step of a frame transfer.
enum Progress<T> {
    Done(T),
    WouldBlock,
}

impl Channel {
    /// Wrap a connected stream socket.
    ///
    /// The descriptor is switched to non-blocking mode and registered with the
    /// reactor of `handle`, which must be the runtime that will drive any
    /// cooperative I/O on this channel.
    pub fn new(name: impl Into<String>, fd: OwnedFd, handle: &Handle, timeout: Duration) -> Result<Self> {
        let name = name.into();
        ensure_socket(&fd)?;

        let stream = UnixStream::from(fd);
        stream.set_nonblocking(true)?;
        let fd = OwnedFd::from(stream);

        let io = {
            let _enter = handle.enter();
            AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?
        };
        debug!(channel = %name, fd = io.get_ref().as_raw_fd(), "channel attached");

        Ok(Self {
            name,
            io,
            send_lock: AsyncMutex::new(()),
            recv_lock: AsyncMutex::new(()),
            timeout,
            broken: AtomicBool::new(false),
            broken_reason: Mutex::new(None),
        })
    }

    /// Create a connected pair of channels, both registered with `handle`.
    pub fn pair(handle: &Handle, timeout: Duration) -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((
            Self::new("pair-a", OwnedFd::from(a), handle, timeout)?,
            Self::new("pair-b", OwnedFd::from(b), handle, timeout)?,
        ))
    }

    /// Channel name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Underlying socket descriptor, for event-loop registration.
    pub fn raw_fd(&self) -> RawFd {
        self.io.get_ref().as_raw_fd()
    }

    /// Interest set the event loop watches. Hangup and error conditions are
    /// always reported alongside readability.
    pub fn interest(&self) -> Interest {
        Interest::READABLE
    }

    /// Uniform timeout applied to every blocking or cooperative wait.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True once a fatal error has made this channel unusable.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Shut down both directions so that any peer or local waiter observes
    /// end-of-stream.
    pub fn shutdown(&self) {
        self.mark_broken("channel shut down");
        if let Err(e) = nix::sys::socket::shutdown(self.raw_fd(), nix::sys::socket::Shutdown::Both) {
            if e != Errno::ENOTCONN {
                debug!(channel = %self.name, "shutdown: {}", e);
            }
        }
    }

    pub(crate) fn mark_broken(&self, reason: &str) {
        if !self.broken.swap(true, Ordering::SeqCst) {
            *self.broken_reason.lock() = Some(reason.to_string());
        }
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.is_broken() {
            let reason = self
                .broken_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "unknown".into());
            return Err(Error::ChannelBroken(format!("{}: {}", self.name, reason)));
        }
        Ok(())
    }

    /// Record a fatal failure and pass the error through.
    pub(crate) fn fail<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            if e.is_fatal() {
                warn!(channel = %self.name, "channel failed: {}", e);
                self.mark_broken(&e.to_string());
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Blocking discipline
    // -----------------------------------------------------------------------

    /// Send one message, blocking the calling thread until it is fully written.
    pub fn send(&self, msg: &Message) -> Result<()> {
        self.check_usable()?;
        let encoded = msg.encode()?;
        let _guard = self.send_lock.blocking_lock();
        let deadline = Instant::now() + self.timeout;
        let result = self.send_blocking(&encoded, deadline);
        self.fail(result)
    }

    /// Receive one validated message, blocking the calling thread.
    pub fn recv(&self) -> Result<Message> {
        self.check_usable()?;
        let _guard = self.recv_lock.blocking_lock();
        let deadline = Instant::now() + self.timeout;
        let result = self.recv_blocking(deadline);
        self.fail(result)
    }

    pub(crate) fn send_blocking(&self, encoded: &Encoded, deadline: Instant) -> Result<()> {
        let mut writer = FrameWriter::new(encoded);
        loop {
            match writer.step(self.raw_fd())? {
                Progress::Done(()) => break,
                Progress::WouldBlock => self.wait_blocking(PollFlags::POLLOUT, deadline)?,
            }
        }
        trace!(channel = %self.name, size = encoded.payload.len(), fds = encoded.fds.len(), "sent");
        Ok(())
    }

    /// Receive with the receive lock already held by the caller.
    pub(crate) fn recv_blocking(&self, deadline: Instant) -> Result<Message> {
        let mut reader = FrameReader::default();
        let frame = loop {
            match reader.step(self.raw_fd())? {
                Progress::Done(frame) => break frame,
                Progress::WouldBlock => self.wait_blocking(PollFlags::POLLIN, deadline)?,
            }
        };
        self.decode(frame)
    }

    fn wait_blocking(&self, events: PollFlags, deadline: Instant) -> Result<()> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!(
                    "{}: no progress within {:?}",
                    self.name, self.timeout
                )));
            }
            let millis = remaining.as_millis().clamp(1, u16::MAX as u128) as u16;
            let mut fds = [PollFd::new(self.io.get_ref().as_fd(), events)];
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(0) => continue,
                // Hangup and error are surfaced by the next send/recv attempt.
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cooperative discipline
    // -----------------------------------------------------------------------

    /// Send one message from an event-loop task.
    pub async fn send_async(&self, msg: &Message) -> Result<()> {
        self.check_usable()?;
        let encoded = msg.encode()?;
        let _guard = self.send_lock.lock().await;
        let result = match tokio::time::timeout(self.timeout, self.send_cooperative(&encoded)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("{}: send stalled", self.name))),
        };
        self.fail(result)
    }

    /// Receive one validated message from an event-loop task, bounded by the
    /// channel timeout.
    pub async fn recv_async(&self) -> Result<Message> {
        self.check_usable()?;
        let _guard = self.recv_lock.lock().await;
        let result = self.recv_cooperative_bounded().await;
        self.fail(result)
    }

    /// Wait indefinitely for the next incoming request. Used by the event loop
    /// of the serving side, where idleness is not an error.
    pub async fn next_request(&self) -> Result<Message> {
        self.check_usable()?;
        let _guard = self.recv_lock.lock().await;
        let result = self.recv_cooperative().await;
        self.fail(result)
    }

    pub(crate) async fn recv_cooperative_bounded(&self) -> Result<Message> {
        match tokio::time::timeout(self.timeout, self.recv_cooperative()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{}: no reply within {:?}",
                self.name, self.timeout
            ))),
        }
    }

    pub(crate) async fn send_cooperative(&self, encoded: &Encoded) -> Result<()> {
        let mut writer = FrameWriter::new(encoded);
        loop {
            let mut guard = self.io.writable().await?;
            match writer.step(self.raw_fd())? {
                Progress::Done(()) => break,
                Progress::WouldBlock => guard.clear_ready(),
            }
        }
        trace!(channel = %self.name, size = encoded.payload.len(), fds = encoded.fds.len(), "sent");
        Ok(())
    }

    pub(crate) async fn recv_cooperative(&self) -> Result<Message> {
        let mut reader = FrameReader::default();
        let frame = loop {
            let mut guard = self.io.readable().await?;
            match reader.step(self.raw_fd())? {
                Progress::Done(frame) => break frame,
                Progress::WouldBlock => guard.clear_ready(),
            }
        };
        self.decode(frame)
    }

    fn decode(&self, frame: Frame) -> Result<Message> {
        let msg = Message::decode(frame)?;
        trace!(channel = %self.name, command = ?msg.command(), fds = msg.fds.len(), "received");
        Ok(msg)
    }
}

/// Reject descriptors that are not sockets before wrapping them.
fn ensure_socket(fd: &OwnedFd) -> Result<()> {
    let stat = nix::sys::stat::fstat(fd.as_raw_fd())?;
    if stat.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return Err(Error::Device(format!(
            "descriptor {} is not a socket",
            fd.as_raw_fd()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Framing state machines
// ---------------------------------------------------------------------------

/// Writes header then payload, attaching the fd list to the first write that
/// makes progress. Short writes resume where they stopped.
struct FrameWriter<'a> {
    encoded: &'a Encoded,
    written: usize,
    fds_sent: bool,
}

impl<'a> FrameWriter<'a> {
    fn new(encoded: &'a Encoded) -> Self {
        Self {
            encoded,
            written: 0,
            fds_sent: encoded.fds.is_empty(),
        }
    }

    fn total(&self) -> usize {
        HEADER_SIZE + self.encoded.payload.len()
    }

    fn step(&mut self, fd: RawFd) -> Result<Progress<()>> {
        while self.written < self.total() {
            let (header, payload) = if self.written < HEADER_SIZE {
                (&self.encoded.header[self.written..], &self.encoded.payload[..])
            } else {
                (&[][..], &self.encoded.payload[self.written - HEADER_SIZE..])
            };
            let iov = [IoSlice::new(header), IoSlice::new(payload)];
            let rights = [ControlMessage::ScmRights(&self.encoded.fds)];
            let cmsgs: &[ControlMessage<'_>] = if self.fds_sent { &[] } else { &rights };

            match sendmsg::<()>(fd, &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
                Ok(0) => return Err(Error::ChannelClosed("zero-length write".into())),
                Ok(n) => {
                    self.written += n;
                    self.fds_sent = true;
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(Progress::WouldBlock),
                Err(e) => return Err(Error::ChannelClosed(format!("write failed: {}", e))),
            }
        }
        Ok(Progress::Done(()))
    }
}

/// Accumulates exactly one header and then exactly `size` payload bytes
/// across short reads, collecting any descriptors that arrive on the way.
#[derive(Default)]
struct FrameReader {
    header: [u8; HEADER_SIZE],
    header_read: usize,
    parsed: Option<Header>,
    body: Vec<u8>,
    body_read: usize,
    fds: Vec<OwnedFd>,
}

impl FrameReader {
    fn step(&mut self, fd: RawFd) -> Result<Progress<Frame>> {
        loop {
            if let Some(header) = self.parsed {
                if self.body_read == self.body.len() {
                    return Ok(Progress::Done(Frame {
                        header,
                        body: std::mem::take(&mut self.body),
                        fds: std::mem::take(&mut self.fds),
                    }));
                }
            }

            let received = {
                let buf: &mut [u8] = if self.parsed.is_none() {
                    &mut self.header[self.header_read..]
                } else {
                    &mut self.body[self.body_read..]
                };
                let mut iov = [IoSliceMut::new(buf)];
                let mut cmsg_space = nix::cmsg_space!([RawFd; SCM_MAX_FD]);
                match recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_space), MsgFlags::MSG_CMSG_CLOEXEC) {
                    Ok(msg) => {
                        let mut fds = Vec::new();
                        let cmsgs = msg.cmsgs().map_err(|_| {
                            Error::Protocol(devproxy_protocol::ProtocolError::TooManyFds(MAX_FDS + 1))
                        })?;
                        for cmsg in cmsgs {
                            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                                for r in raw {
                                    // SAFETY: the kernel just installed `r` in our table
                                    // and nothing else records it.
                                    fds.push(unsafe { OwnedFd::from_raw_fd(r) });
                                }
                            }
                        }
                        Ok((msg.bytes, fds))
                    }
                    Err(e) => Err(e),
                }
            };

            let (n, fds) = match received {
                Ok(r) => r,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(Progress::WouldBlock),
                Err(e) => return Err(Error::ChannelClosed(format!("read failed: {}", e))),
            };
            self.fds.extend(fds);
            if self.fds.len() > MAX_FDS {
                return Err(devproxy_protocol::ProtocolError::TooManyFds(self.fds.len()).into());
            }

            if n == 0 {
                let detail = if self.header_read == 0 && self.parsed.is_none() {
                    "peer hung up".to_string()
                } else {
                    "peer hung up mid-message".to_string()
                };
                return Err(Error::ChannelClosed(detail));
            }

            if self.parsed.is_none() {
                self.header_read += n;
                if self.header_read == HEADER_SIZE {
                    let header = Header::decode(&self.header)?;
                    let size = header.check_size()?;
                    self.body = vec![0u8; size];
                    self.body_read = 0;
                    self.parsed = Some(header);
                }
            } else {
                self.body_read += n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devproxy_protocol::{ConfigAccess, Payload, SyncEntry};
    use std::io::Write;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_send_recv_blocking() {
        let rt = runtime();
        let (a, b) = Channel::pair(rt.handle(), Duration::from_secs(2)).unwrap();

        let msg = Message::new(Payload::ConfigRead(ConfigAccess {
            addr: 0x10,
            val: 0,
            len: 4,
        }));
        a.send(&msg).unwrap();
        let got = b.recv().unwrap();
        assert_eq!(got.payload, msg.payload);
    }

    #[test]
    fn test_fds_travel_with_message() {
        let rt = runtime();
        let (a, b) = Channel::pair(rt.handle(), Duration::from_secs(2)).unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"shared").unwrap();
        let msg = Message::with_fds(
            Payload::SyncMemory(vec![SyncEntry {
                address: 0x1000,
                size: 0x1000,
                fd_offset: 0,
            }]),
            vec![OwnedFd::from(file)],
        );
        a.send(&msg).unwrap();

        let got = b.recv().unwrap();
        assert_eq!(got.fds.len(), 1);
        let received = std::fs::File::from(got.fds.into_iter().next().unwrap());
        assert_eq!(received.metadata().unwrap().len(), 6);
    }

    #[test]
    fn test_short_reads_accumulate() {
        let rt = runtime();
        let (raw, peer) = UnixStream::pair().unwrap();
        let chan = Channel::new("short", OwnedFd::from(peer), rt.handle(), Duration::from_secs(2)).unwrap();

        let encoded = Message::ret(0xabcd).encode().unwrap();
        let mut bytes = encoded.header.to_vec();
        bytes.extend_from_slice(&encoded.payload);

        let writer = std::thread::spawn(move || {
            let mut raw = raw;
            for chunk in bytes.chunks(3) {
                raw.write_all(chunk).unwrap();
                std::thread::sleep(Duration::from_millis(5));
            }
            raw
        });

        let got = chan.recv().unwrap();
        assert_eq!(got.payload, Payload::Ret(0xabcd));
        drop(writer.join().unwrap());
    }

    #[test]
    fn test_eof_is_fatal() {
        let rt = runtime();
        let (a, b) = Channel::pair(rt.handle(), Duration::from_secs(2)).unwrap();
        drop(a);
        assert!(matches!(b.recv(), Err(Error::ChannelClosed(_))));
        assert!(b.is_broken());
        assert!(matches!(b.recv(), Err(Error::ChannelBroken(_))));
    }

    #[test]
    fn test_recv_timeout_breaks_channel() {
        let rt = runtime();
        let (_a, b) = Channel::pair(rt.handle(), Duration::from_millis(50)).unwrap();
        assert!(matches!(b.recv(), Err(Error::Timeout(_))));
        assert!(b.is_broken());
    }

    #[test]
    fn test_invalid_frame_is_rejected() {
        let rt = runtime();
        let (raw, peer) = UnixStream::pair().unwrap();
        let chan = Channel::new("bad", OwnedFd::from(peer), rt.handle(), Duration::from_secs(2)).unwrap();

        let header = Header {
            command: 4242,
            payload_kind: 0,
            size: 0,
        };
        let mut raw = raw;
        raw.write_all(&header.encode()).unwrap();
        assert!(matches!(chan.recv(), Err(Error::Protocol(_))));
        assert!(chan.is_broken());
    }

    #[test]
    fn test_excess_fds_rejected_and_closed() {
        let rt = runtime();
        let (raw, peer) = UnixStream::pair().unwrap();
        let chan = Channel::new("flood", OwnedFd::from(peer), rt.handle(), Duration::from_secs(2)).unwrap();

        // Every passed descriptor is a copy of `passed`; `watch` sees EOF only
        // once all of them are closed.
        let (passed, watch) = UnixStream::pair().unwrap();
        let copies = [passed.as_raw_fd(); MAX_FDS + 1];
        let header = Message::new(Payload::Ping).encode().unwrap().header;
        sendmsg::<()>(
            raw.as_raw_fd(),
            &[IoSlice::new(&header)],
            &[ControlMessage::ScmRights(&copies)],
            MsgFlags::empty(),
            None,
        )
        .unwrap();
        drop(passed);

        assert!(matches!(
            chan.recv(),
            Err(Error::Protocol(devproxy_protocol::ProtocolError::TooManyFds(_)))
        ));
        assert!(chan.is_broken());

        watch.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(std::io::Read::read(&mut &watch, &mut buf).unwrap(), 0);
        drop(raw);
    }

    #[test]
    fn test_rejects_non_socket() {
        let rt = runtime();
        let file = tempfile::tempfile().unwrap();
        let err = Channel::new("file", OwnedFd::from(file), rt.handle(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Device(_)));
    }

    #[test]
    fn test_cooperative_round_trip() {
        let rt = runtime();
        let (a, b) = Channel::pair(rt.handle(), Duration::from_secs(2)).unwrap();
        rt.block_on(async {
            let sender = async {
                a.send_async(&Message::new(Payload::Ping)).await.unwrap();
            };
            let receiver = async { b.recv_async().await.unwrap() };
            let ((), got) = tokio::join!(sender, receiver);
            assert_eq!(got.payload, Payload::Ping);
        });
    }
}
