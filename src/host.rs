//! Probes and helpers for the machine a runner executes on: process memory,
//! hostname and IP discovery, hashed working directories, and environment
//! merging.

#[cfg(target_os = "linux")]
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::error::{DroverError, Result};

/// MiB assumed for our own footprint when the probe fails.
pub const SELF_MEM_FALLBACK_MIB: u32 = 10;

/// Proportional set size of the given process and all of its descendants,
/// in MiB.
///
/// PSS shares pages fairly between the processes mapping them, so summing
/// over a process tree doesn't double-count a shared interpreter or shell.
#[cfg(target_os = "linux")]
pub fn current_memory(pid: u32) -> Result<u32> {
    let mut total_kib: u64 = pss_kib(pid)?;
    for child in descendants_of(pid) {
        // children may exit while we walk; ignore the ones that did
        if let Ok(kib) = pss_kib(child) {
            total_kib += kib;
        }
    }
    Ok((total_kib / 1024) as u32)
}

/// Fallback for platforms without /proc: resident set size via sysinfo,
/// self process tree not included.
#[cfg(not(target_os = "linux"))]
pub fn current_memory(pid: u32) -> Result<u32> {
    let mut sys = System::new();
    let pid = Pid::from(pid as usize);
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    let process = sys
        .process(pid)
        .ok_or_else(|| DroverError::Internal(format!("no such process: {pid}")))?;
    Ok((process.memory() / (1024 * 1024)) as u32)
}

#[cfg(target_os = "linux")]
fn pss_kib(pid: u32) -> Result<u64> {
    // smaps_rollup is a single pre-summed line per field; fall back to
    // summing smaps on kernels too old to have it
    let rollup = std::fs::read_to_string(format!("/proc/{pid}/smaps_rollup"))
        .or_else(|_| std::fs::read_to_string(format!("/proc/{pid}/smaps")))?;
    let mut total = 0u64;
    for line in rollup.lines() {
        if let Some(rest) = line.strip_prefix("Pss:") {
            if let Some(kib) = rest.trim().split_whitespace().next() {
                total += kib.parse::<u64>().unwrap_or(0);
            }
        }
    }
    Ok(total)
}

#[cfg(target_os = "linux")]
fn descendants_of(root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if let Some(ppid) = ppid_of(pid) {
            children.entry(ppid).or_default().push(pid);
        }
    }
    let mut found = Vec::new();
    let mut queue = vec![root];
    while let Some(pid) = queue.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                found.push(kid);
                queue.push(kid);
            }
        }
    }
    found
}

#[cfg(target_os = "linux")]
fn ppid_of(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // field 4, after the parenthesised comm which may contain spaces
    let after_comm = stat.rsplit_once(')')?.1;
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

/// Resident set size of this process in MiB, or `None` if the probe fails.
pub fn self_memory() -> Option<u32> {
    let mut sys = System::new();
    let pid = Pid::from(std::process::id() as usize);
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    let process = sys.process(pid)?;
    Some((process.memory() / (1024 * 1024)) as u32)
}

/// This machine's hostname, or "localhost" when it cannot be determined.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
    #[cfg(not(unix))]
    {
        "localhost".to_string()
    }
}

/// The first non-loopback IPv4 address bound to a live interface. With
/// `prefer` set to a CIDR like "192.168.0.0/18", only addresses inside that
/// network are considered.
pub fn current_ip(prefer: &str) -> Result<Ipv4Addr> {
    let wanted = if prefer.is_empty() {
        None
    } else {
        Some(parse_cidr(prefer)?)
    };

    #[cfg(unix)]
    {
        use nix::net::if_::InterfaceFlags;

        let addrs = nix::ifaddrs::getifaddrs()
            .map_err(|e| DroverError::Internal(format!("could not list interfaces: {e}")))?;
        for ifaddr in addrs {
            if !ifaddr.flags.contains(InterfaceFlags::IFF_UP)
                || ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
            {
                continue;
            }
            let Some(storage) = ifaddr.address else {
                continue;
            };
            let Some(sin) = storage.as_sockaddr_in() else {
                continue;
            };
            let ip = sin.ip();
            match wanted {
                Some((net, mask)) if !cidr_contains(net, mask, ip) => continue,
                _ => return Ok(ip),
            }
        }
    }

    Err(DroverError::Internal(
        "no suitable IPv4 address found".to_string(),
    ))
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u32)> {
    let (addr, bits) = cidr
        .split_once('/')
        .ok_or_else(|| DroverError::Internal(format!("invalid CIDR: {cidr}")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| DroverError::Internal(format!("invalid CIDR address: {cidr}")))?;
    let bits: u32 = bits
        .parse()
        .map_err(|_| DroverError::Internal(format!("invalid CIDR prefix: {cidr}")))?;
    if bits > 32 {
        return Err(DroverError::Internal(format!("invalid CIDR prefix: {cidr}")));
    }
    Ok((addr, bits))
}

fn cidr_contains(net: Ipv4Addr, bits: u32, ip: Ipv4Addr) -> bool {
    let mask = if bits == 0 {
        0
    } else {
        u32::MAX << (32 - bits)
    };
    (u32::from(net) & mask) == (u32::from(ip) & mask)
}

/// Create a unique working directory for a job under `root`, hashed into a
/// fan-out so that hundreds of thousands of jobs can share one `root`
/// without bloating any single directory listing. Returns the working
/// directory and a sibling tmp directory.
pub fn mk_hashed_dir(root: &Path, key: &str) -> Result<(PathBuf, PathBuf)> {
    let digest = Sha256::digest(key.as_bytes());
    let hex: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    let mut dir = root.to_path_buf();
    for level in 0..4 {
        dir.push(&hex[level * 2..level * 2 + 2]);
    }
    dir.push(key);
    let cwd = dir.join("cwd");
    let tmp = dir.join("tmp");
    std::fs::create_dir_all(&cwd)?;
    std::fs::create_dir_all(&tmp)?;
    Ok((cwd, tmp))
}

/// Right-biased merge of environment "key=value" strings: `overrides` win
/// on name clashes, unmatched overrides are appended, original order is
/// preserved.
pub fn env_override(env: Vec<String>, overrides: &[String]) -> Vec<String> {
    let mut override_map: Vec<(String, String)> = overrides
        .iter()
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect();

    let mut merged = Vec::with_capacity(env.len() + override_map.len());
    for entry in env {
        let name = entry.split_once('=').map(|(k, _)| k).unwrap_or(&entry);
        if let Some(pos) = override_map.iter().position(|(k, _)| k == name) {
            let (k, v) = override_map.remove(pos);
            merged.push(format!("{k}={v}"));
        } else {
            merged.push(entry);
        }
    }
    for (k, v) in override_map {
        merged.push(format!("{k}={v}"));
    }
    merged
}
