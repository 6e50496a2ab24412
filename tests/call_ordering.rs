//! Concurrent callers on one channel: every request is answered before the
//! next one reaches the wire, and each caller gets its own reply.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use devproxy::devproxy_protocol::{ConfigAccess, Message, Payload};
use devproxy::Channel;
use nix::errno::Errno;
use nix::sys::socket::{recv, MsgFlags};

const CALLS_PER_THREAD: u32 = 200;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn read(addr: u32) -> Message {
    Message::new(Payload::ConfigRead(ConfigAccess { addr, val: 0, len: 4 }))
}

/// Answer `total` requests with `addr + 1`, asserting before every reply
/// that the peer has not put anything else on the wire.
fn spawn_strict_responder(server: Channel, total: usize, violations: Arc<AtomicUsize>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut peek = [0u8; 1];
        for _ in 0..total {
            let request = server.recv().unwrap();
            let Payload::ConfigRead(access) = request.payload else {
                panic!("unexpected request {:?}", request.command());
            };

            // Give a misbehaving second caller time to interleave.
            thread::sleep(Duration::from_micros(50));
            match recv(server.raw_fd(), &mut peek, MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT) {
                Err(Errno::EAGAIN) => {}
                _ => {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
            }

            server.send(&Message::ret(access.addr as u64 + 1)).unwrap();
        }
    })
}

#[test]
fn test_two_threads_never_interleave() {
    let rt = runtime();
    let (client, server) = Channel::pair(rt.handle(), Duration::from_secs(5)).unwrap();
    let client = Arc::new(client);
    let violations = Arc::new(AtomicUsize::new(0));

    let responder = spawn_strict_responder(server, 2 * CALLS_PER_THREAD as usize, violations.clone());

    let callers: Vec<_> = (0..2u32)
        .map(|t| {
            let client = client.clone();
            thread::spawn(move || {
                for i in 0..CALLS_PER_THREAD {
                    let addr = t * 0x10000 + i * 4;
                    assert_eq!(client.call_ret(read(addr)).unwrap(), addr as u64 + 1);
                }
            })
        })
        .collect();

    for caller in callers {
        caller.join().unwrap();
    }
    responder.join().unwrap();
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(!client.is_broken());
}

#[test]
fn test_blocking_and_cooperative_callers_share_channel() {
    let rt = runtime();
    let (client, server) = Channel::pair(rt.handle(), Duration::from_secs(5)).unwrap();
    let client = Arc::new(client);
    let violations = Arc::new(AtomicUsize::new(0));

    let responder = spawn_strict_responder(server, 2 * CALLS_PER_THREAD as usize, violations.clone());

    let blocking = {
        let client = client.clone();
        thread::spawn(move || {
            for i in 0..CALLS_PER_THREAD {
                let addr = 0x1_0000 + i * 4;
                assert_eq!(client.call_ret(read(addr)).unwrap(), addr as u64 + 1);
            }
        })
    };

    rt.block_on(async {
        for i in 0..CALLS_PER_THREAD {
            let addr = i * 4;
            assert_eq!(client.call_ret_async(read(addr)).await.unwrap(), addr as u64 + 1);
        }
    });

    blocking.join().unwrap();
    responder.join().unwrap();
    assert_eq!(violations.load(Ordering::SeqCst), 0);
}

#[test]
fn test_broken_channel_fails_every_caller() {
    let rt = runtime();
    let (client, server) = Channel::pair(rt.handle(), Duration::from_millis(100)).unwrap();
    let client = Arc::new(client);

    // The responder swallows the first request and never answers.
    let responder = thread::spawn(move || {
        let _ = server.recv().unwrap();
        thread::sleep(Duration::from_millis(300));
        server
    });

    let first = client.call(read(0));
    assert!(matches!(first, Err(devproxy::Error::Timeout(_))));
    assert!(client.is_broken());

    let callers: Vec<_> = (0..2)
        .map(|_| {
            let client = client.clone();
            thread::spawn(move || client.call(read(4)).is_err())
        })
        .collect();
    for caller in callers {
        assert!(caller.join().unwrap());
    }
    drop(responder.join().unwrap());
}
