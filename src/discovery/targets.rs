use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use ipnetwork::Ipv4Network;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

/// An IPv4 address configured on a local, up, non-loopback interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub name: String,
    pub addr: Ipv4Addr,
    pub network: Ipv4Network,
}

/// Enumerate local IPv4 interfaces. Errors from the OS yield an empty list.
pub fn local_interfaces() -> Vec<LocalInterface> {
    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to enumerate interfaces");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for ifa in addrs {
        if !ifa.flags.contains(InterfaceFlags::IFF_UP)
            || ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        {
            continue;
        }
        let addr = match ifa.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            Some(sin) => *SocketAddrV4::from(*sin).ip(),
            None => continue,
        };
        let mask = match ifa.netmask.as_ref().and_then(|m| m.as_sockaddr_in()) {
            Some(sin) => *SocketAddrV4::from(*sin).ip(),
            None => continue,
        };
        if is_link_local(addr) {
            continue;
        }
        match Ipv4Network::with_netmask(addr, mask) {
            Ok(network) => out.push(LocalInterface {
                name: ifa.interface_name.clone(),
                addr,
                network,
            }),
            Err(e) => tracing::debug!(interface = %ifa.interface_name, error = %e, "Skipping interface"),
        }
    }
    out
}

/// IPv4 addresses from the contents of `/proc/net/arp`.
///
/// The first line is a header. Loopback and link-local entries are dropped.
pub fn parse_arp_table(contents: &str) -> Vec<Ipv4Addr> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|ip| ip.parse::<Ipv4Addr>().ok())
        .filter(|ip| !ip.is_loopback() && !is_link_local(*ip))
        .collect()
}

pub fn is_link_local(ip: Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    a == 169 && b == 254
}

/// Usable host addresses of a range.
///
/// Network and broadcast addresses are skipped, except for /31 and /32
/// where every address is a host.
pub fn range_hosts(network: Ipv4Network) -> impl Iterator<Item = Ipv4Addr> {
    let keep_all = network.prefix() >= 31;
    let net = network.network();
    let bcast = network.broadcast();
    network
        .iter()
        .filter(move |ip| keep_all || (*ip != net && *ip != bcast))
}

/// Ordered, deduplicated, capped list of probe targets.
#[derive(Debug)]
pub struct TargetSet {
    port: u16,
    cap: usize,
    excluded: HashSet<Ipv4Addr>,
    seen: HashSet<SocketAddrV4>,
    targets: Vec<SocketAddrV4>,
}

impl TargetSet {
    /// `excluded` holds the scanner's own addresses.
    pub fn new(port: u16, cap: usize, excluded: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        Self {
            port,
            cap,
            excluded: excluded.into_iter().collect(),
            seen: HashSet::new(),
            targets: Vec::new(),
        }
    }

    /// Add `ip` on the probe port.
    pub fn push_ip(&mut self, ip: Ipv4Addr) -> bool {
        self.push_addr(SocketAddrV4::new(ip, self.port))
    }

    /// Add a full address, e.g. a known node on a non-default port.
    pub fn push_addr(&mut self, addr: SocketAddrV4) -> bool {
        if self.is_full()
            || is_link_local(*addr.ip())
            || addr.ip().is_unspecified()
            || self.excluded.contains(addr.ip())
        {
            return false;
        }
        if !self.seen.insert(addr) {
            return false;
        }
        self.targets.push(addr);
        true
    }

    /// Add every usable host of `network`. Returns how many were added.
    pub fn extend_range(&mut self, network: Ipv4Network) -> usize {
        let mut added = 0;
        for ip in range_hosts(network) {
            if self.is_full() {
                tracing::warn!(%network, cap = self.cap, "Target cap reached, range truncated");
                break;
            }
            if self.push_ip(ip) {
                added += 1;
            }
        }
        added
    }

    pub fn is_full(&self) -> bool {
        self.targets.len() >= self.cap
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn into_targets(self) -> Vec<SocketAddr> {
        self.targets.into_iter().map(SocketAddr::V4).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn range_hosts_skips_network_and_broadcast() {
        let hosts: Vec<Ipv4Addr> = range_hosts(net("10.0.0.0/30")).collect();
        assert_eq!(
            hosts,
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
        );
    }

    #[test]
    fn tiny_ranges_keep_every_address() {
        assert_eq!(range_hosts(net("10.0.0.0/31")).count(), 2);
        assert_eq!(
            range_hosts(net("127.0.0.1/32")).collect::<Vec<_>>(),
            vec![Ipv4Addr::LOCALHOST]
        );
    }

    #[test]
    fn target_set_excludes_self_and_link_local() {
        let me = Ipv4Addr::new(192, 168, 1, 10);
        let mut set = TargetSet::new(8080, 100, [me]);
        set.extend_range(net("192.168.1.8/29"));
        assert!(!set.push_ip(Ipv4Addr::new(169, 254, 1, 1)));

        let targets = set.into_targets();
        // .9 .. .14 minus self
        assert_eq!(targets.len(), 5);
        assert!(!targets.contains(&SocketAddr::from((me, 8080))));
        assert!(targets.iter().all(|t| t.port() == 8080));
    }

    #[test]
    fn target_set_dedups_and_keeps_order() {
        let mut set = TargetSet::new(8080, 100, []);
        let known = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 9000);
        assert!(set.push_addr(known));
        assert!(set.push_ip(Ipv4Addr::new(10, 0, 0, 7)));
        assert!(!set.push_ip(Ipv4Addr::new(10, 0, 0, 7)));
        set.extend_range(net("10.0.0.6/31"));

        let targets = set.into_targets();
        assert_eq!(targets[0], SocketAddr::V4(known));
        assert_eq!(targets.len(), 3);
    }

    #[test]
    fn target_set_is_capped() {
        let mut set = TargetSet::new(8080, 10, []);
        let added = set.extend_range(net("10.1.0.0/16"));
        assert_eq!(added, 10);
        assert!(set.is_full());
        assert!(!set.push_ip(Ipv4Addr::new(10, 2, 0, 1)));
        assert_eq!(set.len(), 10);
    }

    #[test]
    fn parses_proc_net_arp() {
        let table = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
169.254.3.3      0x1         0x2         aa:bb:cc:dd:ee:01     *        eth0
127.0.0.1        0x1         0x2         00:00:00:00:00:00     *        lo
192.168.1.23     0x1         0x2         aa:bb:cc:dd:ee:02     *        wlan0
garbage
";
        assert_eq!(
            parse_arp_table(table),
            vec![Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(192, 168, 1, 23)]
        );
    }
}
