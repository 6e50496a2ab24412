//! Remote agent for devproxy
//!
//! Runs one device model out of the orchestrator's process:
//! - adopts the connected socket inherited on `--fd` (3 by default)
//! - builds the device from a spec file
//! - answers proxy requests on the Link event loop until the orchestrator
//!   hangs up, a protocol violation occurs, or SIGTERM/SIGINT arrives

#[cfg(not(target_os = "linux"))]
compile_error!("remote-agent is Linux-only");

mod seccomp;

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use devproxy::config::{load_device_spec, DeviceSpec};
use devproxy::link::{Link, REMOTE_FD};
use devproxy::remote::{RemoteDispatcher, ScratchDevice};
use devproxy::{Error, Result};
use devproxy_protocol::fd_is_open;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "remote-agent", version, about = "Serve a devproxy device model over an inherited socket")]
struct Args {
    /// Descriptor of the connected socket
    #[arg(long, default_value_t = REMOTE_FD)]
    fd: RawFd,
    /// Device spec (YAML or JSON); a scratch device is served without one
    #[arg(long, env = "DEVPROXY_DEVICE")]
    device: Option<PathBuf>,
    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Install a seccomp-bpf allowlist once set up
    #[arg(long)]
    seccomp: bool,
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| Error::Config(format!("invalid log file '{}'", path.display())))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

fn load_spec(path: Option<&Path>) -> Result<DeviceSpec> {
    match path {
        Some(path) => load_device_spec(path),
        None => Ok(DeviceSpec::scratch(0x1b36, 0x0005)),
    }
}

fn run(args: &Args) -> Result<()> {
    let spec = load_spec(args.device.as_deref())?;
    if !fd_is_open(args.fd) {
        return Err(Error::Config(format!("descriptor {} is not open", args.fd)));
    }

    let link = Link::create(format!("remote-{}", spec.name), spec.link_config())?;
    // SAFETY: the descriptor was inherited for this agent alone.
    let socket = unsafe { OwnedFd::from_raw_fd(args.fd) };
    link.attach_channel(socket)?;

    info!(
        device = %spec.name,
        "serving {:04x}:{:04x} on fd {}",
        spec.vendor_id,
        spec.device_id,
        args.fd
    );
    let dispatcher = RemoteDispatcher::new(ScratchDevice::new(spec), link.handle());
    let gave_up = dispatcher.shutdown_flag();
    dispatcher.install(&link);

    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    let signal_link = Arc::clone(&link);
    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!("received signal {}, stopping", signal);
                signal_link.stop();
            }
        })?;

    if args.seccomp {
        seccomp::install_filter()?;
    }

    link.run_event_loop()?;
    link.destroy();
    info!(peer_lost = gave_up.load(Ordering::SeqCst), "remote agent exiting");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _guard = match init_logging(args.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("remote-agent: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("remote agent failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["remote-agent"]).unwrap();
        assert_eq!(args.fd, REMOTE_FD);
        assert!(args.device.is_none());
        assert!(!args.seccomp);
    }

    #[test]
    fn test_load_spec_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.yaml");
        std::fs::write(
            &path,
            "name: nic0\nvendor_id: 32902\ndevice_id: 4110\nwindows:\n  - size: 131072\n",
        )
        .unwrap();
        let spec = load_spec(Some(&path)).unwrap();
        assert_eq!(spec.name, "nic0");
        assert_eq!(spec.windows.len(), 1);
        assert!(load_spec(None).is_ok());
    }

    #[test]
    fn test_load_spec_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "name: bad\nvendor_id: 1\ndevice_id: 2\nconfig_size: 100\n").unwrap();
        assert!(matches!(load_spec(Some(&path)), Err(Error::Config(_))));
    }
}
