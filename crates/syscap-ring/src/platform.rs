//! Host capability probes

#[cfg(target_os = "linux")]
use std::path::Path;
#[cfg(target_os = "linux")]
use tracing::warn;

/// Check if BPF ring producers can run on this system
#[cfg(target_os = "linux")]
pub fn check_bpf_available() -> bool {
    if !Path::new("/sys/fs/bpf").exists() {
        warn!("BPF filesystem not mounted at /sys/fs/bpf");
        return false;
    }

    if !Path::new("/sys/kernel/btf/vmlinux").exists() {
        warn!("BTF not available - CO-RE producers may not load");
    }

    true
}

#[cfg(not(target_os = "linux"))]
pub fn check_bpf_available() -> bool {
    false
}

/// Kernel version as (major, minor, patch)
#[cfg(target_os = "linux")]
pub fn kernel_version() -> Option<(u32, u32, u32)> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").ok()?;
    parse_release(&release)
}

#[cfg(not(target_os = "linux"))]
pub fn kernel_version() -> Option<(u32, u32, u32)> {
    None
}

fn parse_release(release: &str) -> Option<(u32, u32, u32)> {
    let parts: Vec<&str> = release.trim().split('.').collect();
    if parts.len() < 2 {
        return None;
    }

    let major = parts[0].parse().ok()?;
    let minor = parts[1].split('-').next()?.parse().ok()?;
    let patch = parts
        .get(2)
        .and_then(|p| p.split('-').next())
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    Some((major, minor, patch))
}

/// Check if running as root
#[cfg(target_os = "linux")]
pub fn is_root() -> bool {
    unsafe { libc::getuid() == 0 }
}

#[cfg(not(target_os = "linux"))]
pub fn is_root() -> bool {
    false
}

/// Number of online CPUs, i.e. how many per-CPU buffers to open
pub fn online_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_release() {
        assert_eq!(parse_release("6.8.0-45-generic\n"), Some((6, 8, 0)));
        assert_eq!(parse_release("5.15"), Some((5, 15, 0)));
        assert_eq!(parse_release("4.19.112-1"), Some((4, 19, 112)));
        assert_eq!(parse_release("garbage"), None);
    }

    #[test]
    fn test_online_cpus() {
        assert!(online_cpus() >= 1);
    }
}
