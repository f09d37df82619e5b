//! Host facts for registration and usage samples for heartbeats.

use std::net::{IpAddr, UdpSocket};
use std::collections::BTreeMap;
use sysinfo::{Disks, Networks, System};

use crate::types::{NodeMetadata, ResourceReport};

const UNSPECIFIED_MAC: &str = "00:00:00:00:00:00";

/// Static facts gathered once at start-up.
#[derive(Debug, Clone)]
pub struct HostFacts {
    pub hostname: String,
    pub mac_address: Option<String>,
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub metadata: NodeMetadata,
}

pub struct Sampler {
    system: System,
}

impl Sampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        // The first CPU reading is only a baseline
        system.refresh_cpu_usage();
        Self { system }
    }

    pub fn facts(&self) -> HostFacts {
        let hostname = hostname::get()
            .ok()
            .map(|h| h.to_string_lossy().to_string())
            .or_else(System::host_name)
            .unwrap_or_else(|| "localhost".to_string());

        let networks = Networks::new_with_refreshed_list();
        let mac_address = pick_mac(
            networks
                .iter()
                .map(|(name, data)| (name.as_str(), data.mac_address().to_string())),
        );

        HostFacts {
            metadata: NodeMetadata {
                os_type: System::name(),
                architecture: Some(std::env::consts::ARCH.to_string()),
                hostname: Some(hostname.clone()),
                kernel_version: System::kernel_version(),
                labels: Default::default(),
                tags: Vec::new(),
            },
            hostname,
            mac_address,
            cpu_cores: num_cpus::get() as u32,
            memory_bytes: self.system.total_memory(),
            disk_bytes: local_disks().total,
        }
    }

    /// CPU, memory and disk utilisation since the previous sample.
    pub fn sample(&mut self) -> ResourceReport {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        let memory_percent = (total > 0)
            .then(|| self.system.used_memory() as f64 / total as f64 * 100.0);

        let disks = local_disks();
        ResourceReport {
            cpu_percent: Some(f64::from(self.system.global_cpu_usage())),
            memory_percent,
            pods_running: None,
            disk_used_bytes: (disks.total > 0).then_some(disks.used),
            disk_percent: disks.percent(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskTotals {
    pub total: u64,
    pub used: u64,
}

impl DiskTotals {
    pub fn percent(&self) -> Option<f64> {
        (self.total > 0).then(|| self.used as f64 / self.total as f64 * 100.0)
    }
}

fn local_disks() -> DiskTotals {
    let disks = Disks::new_with_refreshed_list();
    sum_disks(disks.list().iter().map(|d| {
        (
            d.name().to_string_lossy().to_string(),
            d.total_space(),
            d.available_space(),
        )
    }))
}

/// Totals across `(device, total, available)` entries. A device mounted at
/// several paths counts once.
pub fn sum_disks(disks: impl Iterator<Item = (String, u64, u64)>) -> DiskTotals {
    let devices: BTreeMap<String, (u64, u64)> = disks
        .filter(|(_, total, _)| *total > 0)
        .map(|(name, total, available)| (name, (total, available)))
        .collect();
    devices
        .values()
        .fold(DiskTotals::default(), |acc, (total, available)| DiskTotals {
            total: acc.total + total,
            used: acc.used + total.saturating_sub(*available),
        })
}

/// First hardware address of a non-loopback interface, by interface name.
pub fn pick_mac<'a>(interfaces: impl Iterator<Item = (&'a str, String)>) -> Option<String> {
    let mut candidates: Vec<(&str, String)> = interfaces
        .filter(|(name, _)| !name.starts_with("lo"))
        .filter(|(_, mac)| !mac.is_empty() && mac != UNSPECIFIED_MAC)
        .collect();
    candidates.sort();
    candidates.into_iter().next().map(|(_, mac)| mac.to_lowercase())
}

/// Address of the interface that routes outbound traffic. No packet is sent.
pub fn detect_outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("1.1.1.1:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_mac_skips_loopback_and_zero() {
        let ifaces = vec![
            ("lo", "00:00:00:00:00:00".to_string()),
            ("wlan0", "AA:BB:CC:00:00:02".to_string()),
            ("eth0", "aa:bb:cc:00:00:01".to_string()),
            ("docker0", UNSPECIFIED_MAC.to_string()),
        ];
        assert_eq!(
            pick_mac(ifaces.into_iter()),
            Some("aa:bb:cc:00:00:01".to_string())
        );
        assert_eq!(pick_mac(std::iter::empty()), None);
    }

    #[test]
    fn test_sum_disks_counts_each_device_once() {
        let disks = vec![
            ("/dev/sda1".to_string(), 100, 40),
            ("/dev/sda1".to_string(), 100, 40),
            ("/dev/sdb1".to_string(), 300, 300),
            ("tmpfs".to_string(), 0, 0),
        ];
        let totals = sum_disks(disks.into_iter());
        assert_eq!(totals, DiskTotals { total: 400, used: 60 });
        assert_eq!(totals.percent(), Some(15.0));
        assert_eq!(sum_disks(std::iter::empty()).percent(), None);
    }

    #[test]
    fn test_sample_reports_memory() {
        let mut sampler = Sampler::new();
        let facts = sampler.facts();
        assert!(facts.cpu_cores >= 1);
        assert!(!facts.hostname.is_empty());

        let report = sampler.sample();
        if facts.memory_bytes > 0 {
            let pct = report.memory_percent.unwrap();
            assert!((0.0..=100.0).contains(&pct));
        }
    }
}
