//! The pool/host/VM graph and its lookup surface.
//!
//! The whole graph is one immutable value built by a parser run.  VMs
//! are addressed by index pairs rather than references, so sessions can
//! keep a cheap handle alongside an `Arc` of the snapshot they were
//! spawned under.

use serde::{Deserialize, Serialize};
use xvp_auth::OtpPolicy;

pub const MAX_POOL_NAME: usize = 80;
pub const MAX_MANAGER: usize = 32;
pub const MAX_HOSTNAME: usize = 80;
pub const MAX_ADDRESS: usize = 15;
pub const UUID_LEN: usize = 36;

/// VNC display port range: display 0 is 5900.
pub const VNC_PORT_MIN: u16 = 5900;
pub const VNC_PORT_MAX: u16 = 5999;

/// One hypervisor node in a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub hostname: String,
    /// Explicit dotted-quad address, empty when the hostname is used.
    pub address: String,
    /// Whether the hostname itself is an IPv4 literal (no domain suffix).
    pub hostname_is_ipv4: bool,
}

/// One proxied virtual machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    /// Listening port; 0 means reachable via the multiplex port only.
    pub port: u16,
    /// Display name; `uuid=<uuid>` when configured by UUID.
    pub name: String,
    pub uuid: Option<String>,
    /// Encrypted VNC password.
    pub password: [u8; 8],
}

/// An administrative pool of hosts and VMs sharing a manager credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    /// DNS domain with a leading dot, or empty.
    pub domain: String,
    pub manager: String,
    /// Encrypted manager password.
    pub password: [u8; 16],
    pub hosts: Vec<Host>,
    pub vms: Vec<Vm>,
}

/// Index of a VM within the configuration graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmId {
    pub pool: usize,
    pub vm: usize,
}

/// What a listening port maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The shared multiplex port: the VM is chosen during the handshake.
    Multiplex,
    Vm(VmId),
}

/// The complete configuration, immutable between reloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub otp: OtpPolicy,
    pub multiplex_port: Option<u16>,
    pub pools: Vec<Pool>,
}

impl Config {
    pub fn vm(&self, id: VmId) -> &Vm {
        &self.pools[id.pool].vms[id.vm]
    }

    pub fn pool(&self, id: VmId) -> &Pool {
        &self.pools[id.pool]
    }

    pub fn pool_by_name(&self, name: &str) -> Option<usize> {
        self.pools.iter().position(|p| p.name == name)
    }

    pub fn host_by_name(&self, pool: usize, hostname: &str) -> Option<&Host> {
        self.pools[pool].hosts.iter().find(|h| h.hostname == hostname)
    }

    /// Find a VM by display name, in one pool or across all of them.
    pub fn vm_by_name(&self, pool: Option<usize>, name: &str) -> Option<VmId> {
        self.pool_range(pool).find_map(|p| {
            self.pools[p]
                .vms
                .iter()
                .position(|vm| vm.name == name)
                .map(|vm| VmId { pool: p, vm })
        })
    }

    /// Find a UUID-configured VM, in one pool or across all of them.
    pub fn vm_by_uuid(&self, pool: Option<usize>, uuid: &str) -> Option<VmId> {
        self.pool_range(pool).find_map(|p| {
            self.pools[p]
                .vms
                .iter()
                .position(|vm| vm.uuid.as_deref() == Some(uuid))
                .map(|vm| VmId { pool: p, vm })
        })
    }

    /// Find what listens on a port.  Port 0 never matches.
    pub fn target_by_port(&self, port: u16) -> Option<Target> {
        if port == 0 {
            return None;
        }
        if self.multiplex_port == Some(port) {
            return Some(Target::Multiplex);
        }
        self.vm_ids()
            .find(|&id| self.vm(id).port == port)
            .map(Target::Vm)
    }

    /// All VM ids in configuration order.
    pub fn vm_ids(&self) -> impl Iterator<Item = VmId> + '_ {
        self.pools.iter().enumerate().flat_map(|(pool, p)| {
            (0..p.vms.len()).map(move |vm| VmId { pool, vm })
        })
    }

    /// Ports to listen on: each VM with its own port, plus the multiplex
    /// port when configured.
    pub fn listen_targets(&self) -> Vec<(Target, u16)> {
        let mut out = Vec::new();
        if let Some(port) = self.multiplex_port {
            out.push((Target::Multiplex, port));
        }
        for id in self.vm_ids() {
            let port = self.vm(id).port;
            if port > 0 {
                out.push((Target::Vm(id), port));
            }
        }
        out
    }

    /// A VM whose name matches a host's name or address is the control
    /// domain console of that host.
    pub fn vm_is_host(&self, id: VmId) -> bool {
        let name = &self.vm(id).name;
        self.pool(id)
            .hosts
            .iter()
            .any(|h| &h.hostname == name || &h.address == name)
    }

    /// Display name of a target for log lines.
    pub fn target_name(&self, target: Target) -> &str {
        match target {
            Target::Multiplex => "[multiplexer]",
            Target::Vm(id) => &self.vm(id).name,
        }
    }

    fn pool_range(&self, pool: Option<usize>) -> std::ops::Range<usize> {
        match pool {
            Some(p) => p..p + 1,
            None => 0..self.pools.len(),
        }
    }

    /// Log the effective configuration at debug level.
    pub fn log_summary(&self) {
        let mode = match self.otp.mode {
            xvp_auth::OtpMode::Deny => "DENY",
            xvp_auth::OtpMode::Allow => "ALLOW",
            xvp_auth::OtpMode::Require => "REQUIRE",
        };
        let ipcheck = match self.otp.ipcheck {
            xvp_auth::IpCheck::Off => "OFF",
            xvp_auth::IpCheck::On => "ON",
            xvp_auth::IpCheck::Http => "HTTP",
        };
        log::debug!("> OTP {} IPCHECK {} {}", mode, ipcheck, self.otp.window);
        if let Some(port) = self.multiplex_port {
            log::debug!("> MULTIPLEX {}", port);
        }
        for pool in &self.pools {
            log::debug!("> POOL \"{}\"", pool.name);
            log::debug!(
                ">   DOMAIN \"{}\"",
                pool.domain.strip_prefix('.').unwrap_or(&pool.domain)
            );
            log::debug!(">   MANAGER \"{}\"", pool.manager);
            for host in &pool.hosts {
                if host.address.is_empty() {
                    log::debug!(">   HOST \"{}\"", host.hostname);
                } else {
                    log::debug!(">   HOST {} \"{}\"", host.address, host.hostname);
                }
            }
            for vm in &pool.vms {
                if vm.port > 0 {
                    log::debug!(">   VM {} {}", vm.port, vm.name);
                } else {
                    log::debug!(">   VM - {}", vm.name);
                }
            }
        }
    }
}

/// Is `address` a dotted-quad IPv4 literal?
pub fn is_ipv4(address: &str) -> bool {
    if address.len() > MAX_ADDRESS {
        return false;
    }
    let parts: Vec<&str> = address.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|p| {
            !p.is_empty()
                && p.bytes().all(|b| b.is_ascii_digit())
                && p.parse::<u32>().map(|v| v <= 255).unwrap_or(false)
        })
}

/// Is `text` shaped like a XenServer UUID?  36 characters, dashes at
/// positions 8, 13, 18 and 23, lowercase hex elsewhere.
pub fn is_uuid(text: &str) -> bool {
    const DASHES: [usize; 4] = [8, 13, 18, 23];
    let bytes = text.as_bytes();
    if bytes.len() != UUID_LEN {
        return false;
    }
    bytes.iter().enumerate().all(|(i, &b)| {
        if DASHES.contains(&i) {
            b == b'-'
        } else {
            b.is_ascii_hexdigit() && !b.is_ascii_uppercase()
        }
    })
}
