use std::path::{Path, PathBuf};

use kvm_ioctls::{Cap, Kvm};

#[allow(dead_code)]
pub fn require_kvm_usable() -> Result<(), String> {
    if !Path::new("/dev/kvm").exists() {
        return Err("/dev/kvm not available".to_string());
    }

    let kvm = Kvm::new().map_err(|e| format!("failed to open /dev/kvm: {e}"))?;
    let api = kvm.get_api_version();
    if api < 12 {
        return Err(format!("unexpected KVM API version {api}"));
    }
    for (cap, name) in [
        (Cap::Irqchip, "IRQCHIP"),
        (Cap::UserMemory, "USER_MEMORY"),
        (Cap::Irqfd, "IRQFD"),
    ] {
        if !kvm.check_extension(cap) {
            return Err(format!("missing KVM capability: {name}"));
        }
    }
    kvm.create_vm()
        .map_err(|e| format!("failed to create KVM VM: {e}"))?;
    Ok(())
}

/// Locate a built `remote-agent`: `DEVPROXY_AGENT` if set, otherwise next to
/// the test binary's target directory.
#[allow(dead_code)]
pub fn require_remote_agent() -> Result<PathBuf, String> {
    if let Some(path) = std::env::var_os("DEVPROXY_AGENT") {
        let path = PathBuf::from(path);
        return if path.is_file() {
            Ok(path)
        } else {
            Err(format!("DEVPROXY_AGENT does not exist: {}", path.display()))
        };
    }

    let exe = std::env::current_exe().map_err(|e| format!("current_exe: {e}"))?;
    // target/<profile>/deps/<test> -> target/<profile>/remote-agent
    let candidate = exe
        .parent()
        .and_then(Path::parent)
        .map(|dir| dir.join("remote-agent"))
        .ok_or_else(|| "cannot locate target directory".to_string())?;
    if candidate.is_file() {
        Ok(candidate)
    } else {
        Err(format!(
            "remote-agent not built at {} (run `cargo build -p remote-agent`)",
            candidate.display()
        ))
    }
}
