use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use devproxy::config::{load_device_spec, DeviceSpec};
use devproxy::regs;
use devproxy::{Machine, ProxyConfig, ProxyDevice, Transport};

/// Bus base for memory windows assigned by `probe`.
const MEMORY_WINDOW_BASE: u64 = 0xc000_0000;
/// Bus base for I/O windows assigned by `probe`.
const IO_WINDOW_BASE: u64 = 0xc000;
/// Guest RAM given to the probe machine so memory sync has something to send.
const PROBE_RAM_SIZE: u64 = 16 << 20;

#[derive(Parser)]
#[command(name = "devproxy", version, about = "Run and inspect out-of-process device models")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Spawn a remote agent, attach a proxy and print what it exposes
    Probe {
        /// Device spec (YAML or JSON)
        #[arg(long)]
        device: PathBuf,
        /// Remote agent executable
        #[arg(long, env = "DEVPROXY_AGENT")]
        agent: Option<PathBuf>,
        /// Dump the whole configuration space instead of the header
        #[arg(long)]
        full: bool,
    },
    /// Spawn a remote agent and measure ping round trips
    Ping {
        #[arg(long)]
        device: PathBuf,
        #[arg(long, env = "DEVPROXY_AGENT")]
        agent: Option<PathBuf>,
        #[arg(long, default_value_t = 10)]
        count: u32,
    },
    /// Check a device spec without running it
    Validate {
        #[arg(long)]
        device: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Probe { device, agent, full } => cmd_probe(&device, agent, full),
        Command::Ping {
            device,
            agent,
            count,
        } => cmd_ping(&device, agent, count),
        Command::Validate { device } => cmd_validate(&device),
    }
}

fn default_agent() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let exe = std::env::current_exe()?;
    let dir = exe.parent().ok_or("cannot locate the devproxy binary directory")?;
    Ok(dir.join("remote-agent"))
}

fn attach(
    machine: &Machine,
    spec: &DeviceSpec,
    spec_path: &Path,
    agent: Option<PathBuf>,
) -> Result<Arc<ProxyDevice>, Box<dyn std::error::Error>> {
    let program = match agent {
        Some(path) => path,
        None => default_agent()?,
    };
    let transport = Transport::Spawn {
        program,
        args: vec!["--device".into(), spec_path.display().to_string()],
    };
    let config = ProxyConfig::new(spec.name.clone(), transport).link(spec.link_config());
    Ok(machine.add_proxy(config)?)
}

fn cmd_probe(spec_path: &Path, agent: Option<PathBuf>, full: bool) -> Result<(), Box<dyn std::error::Error>> {
    let spec = load_device_spec(spec_path)?;
    let machine = Machine::new();
    machine.address_space().add_ram(0, PROBE_RAM_SIZE)?;
    let device = attach(&machine, &spec, spec_path, agent)?;

    println!("device: {} ({})", device.id(), device.state());
    if let Some(pid) = device.remote_pid() {
        println!("remote pid: {}", pid);
    }
    if let Some(id) = device.identity() {
        println!(
            "identity: {:04x}:{:04x} class {:04x} subsystem {:04x}",
            id.vendor_id, id.device_id, id.class_code, id.subsystem_id
        );
    }

    let mut memory_base = MEMORY_WINDOW_BASE;
    let mut io_base = IO_WINDOW_BASE;
    for (index, window) in device.windows().iter().enumerate() {
        if !window.present {
            continue;
        }
        let base = if window.is_memory { &mut memory_base } else { &mut io_base };
        *base = base.next_multiple_of(window.size);
        device.assign_window(index, *base)?;
        let first = machine.mmio_read(*base, 4, window.is_memory);
        println!(
            "window {}: {} {:#x} bytes at {:#x} (first dword {:#010x})",
            index,
            if window.is_memory { "memory" } else { "io" },
            window.size,
            *base,
            first
        );
        *base += window.size;
    }

    let limit = if full {
        spec.config_size as u32
    } else {
        regs::DEVICE_SPECIFIC
    };
    println!("configuration space:");
    for line in (0..limit).step_by(16) {
        let words: Vec<String> = (0..4)
            .map(|i| format!("{:08x}", device.config_read(line + i * 4, 4)))
            .collect();
        println!("  {:03x}: {}", line, words.join(" "));
    }

    device.ping()?;
    println!("ping: ok");
    machine.remove_proxy(device.id())?;
    Ok(())
}

fn cmd_ping(spec_path: &Path, agent: Option<PathBuf>, count: u32) -> Result<(), Box<dyn std::error::Error>> {
    let spec = load_device_spec(spec_path)?;
    let machine = Machine::new();
    let device = attach(&machine, &spec, spec_path, agent)?;

    let mut total = Duration::ZERO;
    for seq in 0..count {
        let start = Instant::now();
        device.ping()?;
        let elapsed = start.elapsed();
        total += elapsed;
        println!("ping {}: {:?}", seq, elapsed);
    }
    if count > 0 {
        println!("average: {:?}", total / count);
    }
    machine.remove_proxy(device.id())?;
    Ok(())
}

fn cmd_validate(spec_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let spec = load_device_spec(spec_path)?;
    println!(
        "valid: {} ({:04x}:{:04x}, {} windows)",
        spec_path.display(),
        spec.vendor_id,
        spec.device_id,
        spec.windows.len()
    );
    Ok(())
}
