//! Interrupt fast path.
//!
//! The orchestrator creates an injection event and a resample event per
//! device, binds them to the device's interrupt line in the host interrupt
//! controller (KVM irqfd), and hands duplicates to the remote process once
//! via SET_IRQ_OBJECTS. From then on the remote raises interrupts by writing
//! the injection event directly; the message channel is not involved.
//!
//! INTx is level-triggered. The controller signals the resample event at
//! end-of-interrupt; if the remote still holds the line asserted it signals
//! the injection event again.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use devproxy_protocol::{IrqSetup, Message, Payload};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use crate::{Error, Result};

/// Number of INTx lines.
pub const INTX_LINES: u8 = 4;

/// Resolve the host interrupt line for a device at `slot` using interrupt
/// `pin` (1 = INTA .. 4 = INTD), swizzled onto four lines starting at
/// `base_gsi`. Pin 0 means the device has no interrupt.
pub fn intx_route(slot: u8, pin: u8, base_gsi: u32) -> Option<u32> {
    if pin == 0 || pin > INTX_LINES {
        return None;
    }
    let line = (slot as u32 + pin as u32 - 1) % INTX_LINES as u32;
    Some(base_gsi + line)
}

// ---------------------------------------------------------------------------
// Orchestrator side
// ---------------------------------------------------------------------------

/// Injection and resample events bound to one interrupt line.
#[derive(Debug)]
pub struct IrqObjects {
    pub trigger: EventFd,
    pub resample: EventFd,
    pub gsi: u32,
    /// INTx line (pin - 1) the device signals on.
    pub intx_line: i32,
}

impl IrqObjects {
    pub fn new(gsi: u32, intx_line: i32) -> Result<Self> {
        Ok(Self {
            trigger: EventFd::new(EFD_NONBLOCK)?,
            resample: EventFd::new(EFD_NONBLOCK)?,
            gsi,
            intx_line,
        })
    }

    /// SET_IRQ_OBJECTS request carrying duplicates of both events.
    pub fn to_message(&self) -> Result<Message> {
        let fds = vec![dup_fd(self.trigger.as_raw_fd())?, dup_fd(self.resample.as_raw_fd())?];
        Ok(Message::with_fds(
            Payload::SetIrqObjects(IrqSetup {
                intx_line: self.intx_line,
            }),
            fds,
        ))
    }
}

fn dup_fd(raw: RawFd) -> Result<OwnedFd> {
    // SAFETY: `raw` belongs to an EventFd that outlives this borrow.
    let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
    Ok(borrowed.try_clone_to_owned()?)
}

/// Host interrupt controller binding for the fast path.
pub trait InterruptController: Send + Sync {
    /// Route `objects.trigger` to `objects.gsi`, with resample notification.
    fn register_irqfd(&self, objects: &IrqObjects) -> Result<()>;

    /// Undo [`InterruptController::register_irqfd`].
    fn unregister_irqfd(&self, objects: &IrqObjects) -> Result<()>;
}

/// Interrupt controller that only records routes. Used where no in-kernel
/// irqchip exists; the trigger event is consumed by whoever owns it.
///
/// INTx lines are shared, so a route is one trigger event on one line and
/// a line may carry several.
#[derive(Debug, Default)]
pub struct SoftIrqChip {
    routes: Mutex<Vec<(u32, RawFd)>>,
}

impl SoftIrqChip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Line of every bound event, in binding order.
    pub fn routes(&self) -> Vec<u32> {
        self.routes.lock().iter().map(|&(gsi, _)| gsi).collect()
    }
}

impl InterruptController for SoftIrqChip {
    fn register_irqfd(&self, objects: &IrqObjects) -> Result<()> {
        let route = (objects.gsi, objects.trigger.as_raw_fd());
        let mut routes = self.routes.lock();
        if routes.contains(&route) {
            return Err(Error::Device(format!(
                "event {} already routed to gsi {}",
                route.1, route.0
            )));
        }
        routes.push(route);
        Ok(())
    }

    fn unregister_irqfd(&self, objects: &IrqObjects) -> Result<()> {
        let route = (objects.gsi, objects.trigger.as_raw_fd());
        self.routes.lock().retain(|r| *r != route);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Remote side
// ---------------------------------------------------------------------------

/// The remote end of the fast path.
#[derive(Debug)]
pub struct RemoteIrq {
    intx_line: i32,
    trigger: OwnedFd,
    asserted: Arc<AtomicBool>,
    signalled: Arc<AtomicU64>,
    resample_task: Option<JoinHandle<()>>,
}

impl RemoteIrq {
    /// Adopt the two descriptors of a SET_IRQ_OBJECTS request and start the
    /// resample task on `handle`.
    pub fn from_setup(setup: IrqSetup, fds: Vec<OwnedFd>, handle: &Handle) -> Result<Self> {
        let mut fds = fds.into_iter();
        let (Some(trigger), Some(resample), None) = (fds.next(), fds.next(), fds.next()) else {
            return Err(Error::Device("SET_IRQ_OBJECTS needs exactly two descriptors".into()));
        };
        set_nonblocking(&resample)?;

        let asserted = Arc::new(AtomicBool::new(false));
        let signalled = Arc::new(AtomicU64::new(0));
        let resample_task = {
            let _enter = handle.enter();
            let resample = AsyncFd::new(resample)?;
            let trigger = trigger.try_clone()?;
            let asserted = asserted.clone();
            let signalled = signalled.clone();
            handle.spawn(resample_loop(resample, trigger, asserted, signalled))
        };
        debug!(intx_line = setup.intx_line, "interrupt objects installed");

        Ok(Self {
            intx_line: setup.intx_line,
            trigger,
            asserted,
            signalled,
            resample_task: Some(resample_task),
        })
    }

    /// INTx line the orchestrator bound the events to.
    pub fn intx_line(&self) -> i32 {
        self.intx_line
    }

    /// Current level of the line.
    pub fn level(&self) -> bool {
        self.asserted.load(Ordering::SeqCst)
    }

    /// Number of times the injection event has been written.
    pub fn signal_count(&self) -> u64 {
        self.signalled.load(Ordering::SeqCst)
    }

    /// Drive the line. Raising a lowered line injects an interrupt; the
    /// resample task re-injects while it stays high.
    pub fn set_level(&self, level: bool) -> Result<()> {
        let was = self.asserted.swap(level, Ordering::SeqCst);
        if level && !was {
            signal(&self.trigger, &self.signalled)?;
        }
        Ok(())
    }

    /// Inject one interrupt without latching the line.
    pub fn pulse(&self) -> Result<()> {
        signal(&self.trigger, &self.signalled)
    }
}

impl Drop for RemoteIrq {
    fn drop(&mut self) {
        if let Some(task) = self.resample_task.take() {
            task.abort();
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

fn signal(trigger: &OwnedFd, counter: &AtomicU64) -> Result<()> {
    loop {
        match nix::unistd::write(trigger.as_fd(), &1u64.to_ne_bytes()) {
            Ok(_) => {
                counter.fetch_add(1, Ordering::SeqCst);
                trace!("interrupt injected");
                return Ok(());
            }
            Err(Errno::EINTR) => continue,
            // Counter saturated: the controller has not consumed earlier
            // injections yet, so the line is already pending.
            Err(Errno::EAGAIN) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

async fn resample_loop(
    resample: AsyncFd<OwnedFd>,
    trigger: OwnedFd,
    asserted: Arc<AtomicBool>,
    signalled: Arc<AtomicU64>,
) {
    let mut buf = [0u8; 8];
    loop {
        let mut guard = match resample.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("resample wait failed: {}", e);
                return;
            }
        };
        match nix::unistd::read(resample.get_ref().as_raw_fd(), &mut buf) {
            Ok(_) => {
                if asserted.load(Ordering::SeqCst) {
                    if let Err(e) = signal(&trigger, &signalled) {
                        warn!("re-injection failed: {}", e);
                        return;
                    }
                }
            }
            Err(Errno::EAGAIN) => guard.clear_ready(),
            Err(Errno::EINTR) => {}
            Err(e) => {
                warn!("resample read failed: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_intx_swizzle() {
        assert_eq!(intx_route(0, 0, 16), None);
        assert_eq!(intx_route(0, 1, 16), Some(16));
        assert_eq!(intx_route(1, 1, 16), Some(17));
        assert_eq!(intx_route(3, 2, 16), Some(16));
        assert_eq!(intx_route(5, 4, 16), Some(16));
        assert_eq!(intx_route(0, 5, 16), None);
    }

    #[test]
    fn test_soft_irqchip_routes() {
        let chip = SoftIrqChip::new();
        let objects = IrqObjects::new(17, 1).unwrap();
        chip.register_irqfd(&objects).unwrap();
        assert!(chip.register_irqfd(&objects).is_err());
        assert_eq!(chip.routes(), vec![17]);
        chip.unregister_irqfd(&objects).unwrap();
        assert!(chip.routes().is_empty());
    }

    #[test]
    fn test_soft_irqchip_shared_line() {
        let chip = SoftIrqChip::new();
        let first = IrqObjects::new(16, 0).unwrap();
        let second = IrqObjects::new(16, 0).unwrap();
        chip.register_irqfd(&first).unwrap();
        chip.register_irqfd(&second).unwrap();
        assert_eq!(chip.routes(), vec![16, 16]);

        chip.unregister_irqfd(&first).unwrap();
        assert_eq!(chip.routes(), vec![16]);
        chip.unregister_irqfd(&second).unwrap();
        assert!(chip.routes().is_empty());
    }

    #[test]
    fn test_set_irq_objects_message() {
        let objects = IrqObjects::new(16, 0).unwrap();
        let msg = objects.to_message().unwrap();
        assert_eq!(msg.fds.len(), 2);
        assert!(msg.encode().is_ok());
    }

    #[tokio::test]
    async fn test_remote_irq_level_and_resample() {
        let objects = IrqObjects::new(16, 0).unwrap();
        let msg = objects.to_message().unwrap();
        let Payload::SetIrqObjects(setup) = msg.payload else {
            panic!("wrong payload");
        };
        let irq = RemoteIrq::from_setup(setup, msg.fds, &Handle::current()).unwrap();

        irq.set_level(true).unwrap();
        assert_eq!(objects.trigger.read().unwrap(), 1);
        // Already high: no second injection until resample.
        irq.set_level(true).unwrap();
        assert_eq!(irq.signal_count(), 1);

        // End-of-interrupt while still asserted re-injects.
        objects.resample.write(1).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while irq.signal_count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(objects.trigger.read().unwrap(), 1);

        irq.set_level(false).unwrap();
        irq.pulse().unwrap();
        assert_eq!(objects.trigger.read().unwrap(), 1);
        assert!(!irq.level());
    }
}
