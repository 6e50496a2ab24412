//! Call/reply discipline over a [`Channel`].
//!
//! A call sends one request and takes the very next message on the channel
//! as its reply. Pairing is by position only, so a call holds the channel's
//! receive lock from before the send until the reply is read; a second caller
//! cannot get its request onto the wire in between.
//!
//! Every call is bounded by the channel timeout. A call that times out or
//! receives a reply of the wrong type leaves the pairing unknowable, so the
//! channel is marked broken.

use std::time::Instant;

use devproxy_protocol::{DeviceIdentity, Message, Payload};
use parking_lot::MutexGuard;
use tracing::trace;

use crate::channel::Channel;
use crate::{Error, Result};

impl Channel {
    /// Issue `request` and block the calling thread until its reply arrives.
    pub fn call(&self, request: Message) -> Result<Message> {
        self.check_usable()?;
        let encoded = request.encode()?;
        let command = request.command();

        let _pairing = self.recv_lock.blocking_lock();
        let deadline = Instant::now() + self.timeout();
        let result = {
            let sent = {
                let _send = self.send_lock.blocking_lock();
                self.send_blocking(&encoded, deadline)
            };
            sent.and_then(|()| self.recv_blocking(deadline))
        };
        trace!(channel = %self.name(), ?command, ok = result.is_ok(), "call");
        self.fail(result)
    }

    /// Issue `request` from a task on the Link event loop, suspending instead
    /// of blocking while the reply is outstanding.
    pub async fn call_async(&self, request: Message) -> Result<Message> {
        self.check_usable()?;
        let encoded = request.encode()?;
        let command = request.command();

        let _pairing = self.recv_lock.lock().await;
        let exchange = async {
            {
                let _send = self.send_lock.lock().await;
                self.send_cooperative(&encoded).await?;
            }
            self.recv_cooperative().await
        };
        let result = match tokio::time::timeout(self.timeout(), exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{}: no reply to {:?} within {:?}",
                self.name(),
                command,
                self.timeout()
            ))),
        };
        trace!(channel = %self.name(), ?command, ok = result.is_ok(), "call");
        self.fail(result)
    }

    /// Blocking call expecting a `RET` reply.
    pub fn call_ret(&self, request: Message) -> Result<u64> {
        let reply = self.call(request)?;
        self.fail(ret_value(reply))
    }

    /// Cooperative call expecting a `RET` reply.
    pub async fn call_ret_async(&self, request: Message) -> Result<u64> {
        let reply = self.call_async(request).await?;
        self.fail(ret_value(reply))
    }

    /// Blocking identity query.
    pub fn call_identity(&self) -> Result<DeviceIdentity> {
        let reply = self.call(Message::new(Payload::GetIdentity))?;
        self.fail(match reply.payload {
            Payload::Identity(id) => Ok(id),
            other => Err(unexpected("IDENTITY", &other)),
        })
    }

    /// Blocking fetch of the whole configuration space.
    pub fn call_config_snapshot(&self) -> Result<Vec<u8>> {
        let reply = self.call(Message::new(Payload::ConfigSnapshot))?;
        self.fail(match reply.payload {
            Payload::ConfigSpace(bytes) => Ok(bytes),
            other => Err(unexpected("CONFIG_SPACE", &other)),
        })
    }
}

/// Release a coarse lock around a blocking call.
///
/// Used when the caller holds a lock that the event-loop thread may need in
/// order to produce the reply. The lock is reacquired before returning.
pub fn call_unlocked<T>(guard: &mut MutexGuard<'_, T>, channel: &Channel, request: Message) -> Result<Message> {
    MutexGuard::unlocked(guard, || channel.call(request))
}

/// Unwrap the scalar of a `RET` reply.
pub fn ret_value(reply: Message) -> Result<u64> {
    match reply.payload {
        Payload::Ret(val) => Ok(val),
        other => Err(unexpected("RET", &other)),
    }
}

fn unexpected(wanted: &str, got: &Payload) -> Error {
    Error::ChannelBroken(format!("expected {} reply, got {:?}", wanted, got.command()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use devproxy_protocol::ConfigAccess;
    use parking_lot::Mutex;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn read(addr: u32) -> Message {
        Message::new(Payload::ConfigRead(ConfigAccess { addr, val: 0, len: 4 }))
    }

    #[test]
    fn test_blocking_call_pairs_reply() {
        let rt = runtime();
        let (client, server) = Channel::pair(rt.handle(), Duration::from_secs(2)).unwrap();

        let responder = std::thread::spawn(move || {
            let req = server.recv().unwrap();
            match req.payload {
                Payload::ConfigRead(access) => server.send(&Message::ret(access.addr as u64 + 1)).unwrap(),
                other => panic!("unexpected {:?}", other),
            }
            server
        });

        assert_eq!(client.call_ret(read(0x40)).unwrap(), 0x41);
        responder.join().unwrap();
    }

    #[test]
    fn test_wrong_reply_breaks_channel() {
        let rt = runtime();
        let (client, server) = Channel::pair(rt.handle(), Duration::from_secs(2)).unwrap();

        let responder = std::thread::spawn(move || {
            let _ = server.recv().unwrap();
            server.send(&Message::new(Payload::Ping)).unwrap();
            server
        });

        assert!(matches!(client.call_ret(read(0)), Err(Error::ChannelBroken(_))));
        assert!(client.is_broken());
        responder.join().unwrap();
    }

    #[test]
    fn test_call_timeout_is_fatal() {
        let rt = runtime();
        let (client, _server) = Channel::pair(rt.handle(), Duration::from_millis(50)).unwrap();
        assert!(matches!(client.call(read(0)), Err(Error::Timeout(_))));
        assert!(matches!(client.call(read(0)), Err(Error::ChannelBroken(_))));
    }

    #[test]
    fn test_call_unlocked_releases_guard() {
        let rt = runtime();
        let (client, server) = Channel::pair(rt.handle(), Duration::from_secs(2)).unwrap();
        let big_lock = Arc::new(Mutex::new(0u64));

        // The responder needs the coarse lock to compute its reply.
        let lock = big_lock.clone();
        let responder = std::thread::spawn(move || {
            let _ = server.recv().unwrap();
            let value = {
                let mut counter = lock.lock();
                *counter += 1;
                *counter
            };
            server.send(&Message::ret(value)).unwrap();
            server
        });

        let mut guard = big_lock.lock();
        let reply = call_unlocked(&mut guard, &client, read(0)).unwrap();
        assert_eq!(ret_value(reply).unwrap(), 1);
        assert_eq!(*guard, 1);
        drop(guard);
        responder.join().unwrap();
    }

    #[test]
    fn test_cooperative_call() {
        let rt = runtime();
        let (client, server) = Channel::pair(rt.handle(), Duration::from_secs(2)).unwrap();

        rt.block_on(async {
            let serve = async {
                let req = server.next_request().await.unwrap();
                assert_eq!(req.command(), devproxy_protocol::Command::Ping);
                server.send_async(&Message::ret(0)).await.unwrap();
            };
            let (val, ()) = tokio::join!(client.call_ret_async(Message::new(Payload::Ping)), serve);
            assert_eq!(val.unwrap(), 0);
        });
    }
}
