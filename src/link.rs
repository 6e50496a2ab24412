//! Link: the owner of one or more channels, the event loop that drives them
//! and, optionally, the remote process at the other end.
//!
//! The event loop is a single-threaded tokio runtime. Each attached channel
//! gets a reader task; arrived messages are handed to the dispatch callback
//! one at a time, on the loop thread, so a callback never races with itself.
//! The Link never looks inside a message.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use devproxy_protocol::Message;
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::config::LinkConfig;
use crate::{Error, Result};

/// Descriptor number a spawned remote process finds its socket on.
pub const REMOTE_FD: i32 = 3;

/// How long a remote process gets to exit on its own before it is killed.
const REMOTE_EXIT_GRACE: Duration = Duration::from_secs(2);

/// What arrived on a channel.
#[derive(Debug)]
pub enum LinkEvent {
    /// A complete, validated message.
    Message(Message),
    /// The channel hit end-of-stream or a fatal error and is being torn down.
    Hangup(Error),
}

/// What the event loop should do after a dispatch.
#[derive(Debug)]
pub enum Dispatch {
    /// Send this message back on the channel the event came from.
    Reply(Message),
    /// Nothing to send.
    NoReply,
    /// Stop the event loop.
    Shutdown,
}

/// Callback the event loop hands every [`LinkEvent`] to.
pub type DispatchFn = Box<dyn FnMut(&Channel, LinkEvent) -> Dispatch + Send>;

/// A spawned remote process owned by a Link.
#[derive(Debug)]
pub struct RemoteProcess {
    child: Child,
}

impl RemoteProcess {
    /// Process id of the remote.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Wait for the process to exit, killing it once `grace` has passed.
    fn reap(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(pid = self.child.id(), "remote exited: {}", status);
                    return;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(pid = self.child.id(), "failed to poll remote: {}", e);
                    break;
                }
            }
        }
        warn!(pid = self.child.id(), "remote did not exit, killing");
        if let Err(e) = self.child.kill() {
            debug!("kill: {}", e);
        }
        let _ = self.child.wait();
    }
}

pub struct Link {
    name: String,
    config: LinkConfig,
    runtime: Arc<Runtime>,
    channels: Mutex<Vec<Arc<Channel>>>,
    dispatch: Mutex<Option<DispatchFn>>,
    attach_tx: mpsc::UnboundedSender<Arc<Channel>>,
    attach_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Channel>>>>,
    stop_tx: watch::Sender<bool>,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
    loop_thread_id: Mutex<Option<ThreadId>>,
    remote: Mutex<Option<RemoteProcess>>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.name)
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}

impl Link {
    /// Create a Link with its own event-loop context and no channels.
    pub fn create(name: impl Into<String>, config: LinkConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (attach_tx, attach_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            name: name.into(),
            config,
            runtime: Arc::new(runtime),
            channels: Mutex::new(Vec::new()),
            dispatch: Mutex::new(None),
            attach_tx,
            attach_rx: Mutex::new(Some(attach_rx)),
            stop_tx,
            loop_thread: Mutex::new(None),
            loop_thread_id: Mutex::new(None),
            remote: Mutex::new(None),
        }))
    }

    /// Create a Link over a freshly spawned remote process. The child gets
    /// one end of a socket pair on descriptor [`REMOTE_FD`].
    pub fn spawn_remote(
        name: impl Into<String>,
        program: &Path,
        args: &[String],
        config: LinkConfig,
    ) -> Result<Arc<Self>> {
        let link = Self::create(name, config)?;
        let (ours, theirs) = UnixStream::pair()?;
        let theirs = OwnedFd::from(theirs);
        let child_fd = theirs.as_raw_fd();

        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null());
        // SAFETY: only async-signal-safe calls (dup2/fcntl) run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if child_fd == REMOTE_FD {
                    nix::fcntl::fcntl(
                        child_fd,
                        nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::empty()),
                    )?;
                } else {
                    nix::unistd::dup2(child_fd, REMOTE_FD)?;
                }
                Ok(())
            });
        }
        let child = cmd
            .spawn()
            .map_err(|e| Error::Device(format!("failed to spawn {}: {}", program.display(), e)))?;
        drop(theirs);
        info!(link = %link.name, pid = child.id(), program = %program.display(), "spawned remote");

        *link.remote.lock() = Some(RemoteProcess { child });
        link.attach_channel(OwnedFd::from(ours))?;
        Ok(link)
    }

    /// Link name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration this Link was created with.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Handle to the event-loop runtime.
    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    /// Process id of the owned remote process, if any.
    pub fn remote_pid(&self) -> Option<u32> {
        self.remote.lock().as_ref().map(RemoteProcess::pid)
    }

    /// Wrap a connected socket as a channel of this Link.
    pub fn attach_channel(&self, fd: OwnedFd) -> Result<Arc<Channel>> {
        let index = self.channels.lock().len();
        let name = format!("{}/{}", self.name, index);
        let channel = Arc::new(Channel::new(
            name,
            fd,
            self.runtime.handle(),
            self.config.call_timeout,
        )?);
        self.channels.lock().push(channel.clone());
        // A closed receiver means the loop is gone for good; nothing to wake.
        let _ = self.attach_tx.send(channel.clone());
        Ok(channel)
    }

    /// The first attached channel, used for calls.
    pub fn control(&self) -> Result<Arc<Channel>> {
        self.channels
            .lock()
            .first()
            .cloned()
            .ok_or_else(|| Error::ChannelClosed(format!("{}: no channel attached", self.name)))
    }

    /// Install the callback that receives every arrived message. Channels
    /// only get reader tasks when a callback is installed before the event
    /// loop starts; a call-only Link leaves its channels to callers.
    pub fn set_dispatch_callback<F>(&self, callback: F)
    where
        F: FnMut(&Channel, LinkEvent) -> Dispatch + Send + 'static,
    {
        *self.dispatch.lock() = Some(Box::new(callback));
    }

    /// True when the current thread is running this Link's event loop.
    pub fn on_loop_thread(&self) -> bool {
        *self.loop_thread_id.lock() == Some(std::thread::current().id())
    }

    /// Blocking call on the control channel. Must not be used from the event
    /// loop thread; use [`Link::call_async`] there.
    pub fn call(&self, request: Message) -> Result<Message> {
        if self.on_loop_thread() {
            return Err(Error::InvalidState {
                operation: "blocking call",
                state: "on event loop thread".into(),
            });
        }
        self.control()?.call(request)
    }

    /// Cooperative call on the control channel.
    pub async fn call_async(&self, request: Message) -> Result<Message> {
        self.control()?.call_async(request).await
    }

    /// Drive all channels on the calling thread until [`Link::stop`] is
    /// called, the callback asks for shutdown, or every channel is gone.
    pub fn run_event_loop(&self) -> Result<()> {
        let attach_rx = self.attach_rx.lock().take().ok_or_else(|| Error::InvalidState {
            operation: "run_event_loop",
            state: "already running".into(),
        })?;
        *self.loop_thread_id.lock() = Some(std::thread::current().id());
        info!(link = %self.name, "event loop started");

        let attach_rx = self.runtime.block_on(self.drive(attach_rx));

        *self.loop_thread_id.lock() = None;
        *self.attach_rx.lock() = Some(attach_rx);
        info!(link = %self.name, "event loop stopped");
        Ok(())
    }

    /// Run the event loop on a dedicated thread.
    pub fn spawn_event_loop(self: &Arc<Self>) -> Result<()> {
        let link = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("link-{}", self.name))
            .spawn(move || {
                if let Err(e) = link.run_event_loop() {
                    error!(link = %link.name, "event loop failed: {}", e);
                }
            })?;
        *self.loop_thread.lock() = Some(handle);
        Ok(())
    }

    async fn drive(
        &self,
        mut attach_rx: mpsc::UnboundedReceiver<Arc<Channel>>,
    ) -> mpsc::UnboundedReceiver<Arc<Channel>> {
        let mut stop = self.stop_tx.subscribe();
        if *stop.borrow() {
            return attach_rx;
        }

        let (event_tx, mut event_rx) = mpsc::channel::<(Arc<Channel>, Result<Message>)>(16);
        let mut readers = JoinSet::new();
        let serving = self.dispatch.lock().is_some();
        let mut live = 0usize;

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                Some(channel) = attach_rx.recv() => {
                    if serving {
                        live += 1;
                        readers.spawn(read_requests(channel, event_tx.clone()));
                    }
                }
                Some((channel, next)) = event_rx.recv() => {
                    let hangup = next.is_err();
                    let event = match next {
                        Ok(msg) => LinkEvent::Message(msg),
                        Err(e) => LinkEvent::Hangup(e),
                    };
                    let action = self.dispatch_one(&channel, event);
                    if hangup {
                        self.teardown(&channel);
                        live = live.saturating_sub(1);
                    }
                    match action {
                        Dispatch::Reply(reply) => {
                            if let Err(e) = channel.send_async(&reply).await {
                                error!(channel = %channel.name(), "failed to send reply: {}", e);
                                // The reader notices the dead socket and reports the hangup.
                                channel.shutdown();
                            }
                        }
                        Dispatch::NoReply => {}
                        Dispatch::Shutdown => {
                            info!(link = %self.name, "dispatch requested shutdown");
                            break;
                        }
                    }
                    if serving && live == 0 {
                        debug!(link = %self.name, "no channels left");
                        break;
                    }
                }
            }
        }

        readers.abort_all();
        while readers.join_next().await.is_some() {}
        attach_rx
    }

    fn dispatch_one(&self, channel: &Channel, event: LinkEvent) -> Dispatch {
        match self.dispatch.lock().as_mut() {
            Some(callback) => callback(channel, event),
            None => Dispatch::NoReply,
        }
    }

    fn teardown(&self, channel: &Arc<Channel>) {
        channel.shutdown();
        self.channels.lock().retain(|c| !Arc::ptr_eq(c, channel));
        debug!(channel = %channel.name(), "channel torn down");
    }

    /// Ask the event loop to stop. A stopped Link stays stopped.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Stop the loop, close every channel and reap the remote process.
    pub fn destroy(&self) {
        self.stop();
        let channels: Vec<_> = self.channels.lock().drain(..).collect();
        for channel in &channels {
            channel.shutdown();
        }

        if let Some(handle) = self.loop_thread.lock().take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }

        if let Some(mut remote) = self.remote.lock().take() {
            remote.reap(REMOTE_EXIT_GRACE);
        }
        debug!(link = %self.name, "link destroyed");
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn read_requests(channel: Arc<Channel>, events: mpsc::Sender<(Arc<Channel>, Result<Message>)>) {
    loop {
        let next = channel.next_request().await;
        let done = next.is_err();
        if events.send((channel.clone(), next)).await.is_err() || done {
            return;
        }
    }
}
