//! Mixer discovery by active UDP probing
//!
//! Every usable host of a CIDR block gets two argument-less probes
//! (`/xinfo` and `/-prefs/name`) on the mixer control port. Replies are read
//! on a dedicated ephemeral socket until the timeout; the first reply that
//! looks like it came from a mixer wins. Nothing is ranked and nothing is
//! retried: packet loss and firewalls cause false negatives, and the caller
//! falls back to a manually entered address.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{OscError, Result};
use crate::osc::{address, codec, into_messages, OscMessage, OscTypeExt, MIXER_PORT};
use crate::transport::{bind_udp, MAX_DATAGRAM};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Largest range scanned automatically per interface (a /16)
pub const DEFAULT_MAX_HOSTS: u64 = 65_534;

/// An IPv4 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(OscError::InvalidCidr(format!("{}/{}", addr, prefix)));
        }
        Ok(Self { addr, prefix })
    }

    /// Build from an interface address and netmask. The prefix is the run of
    /// leading one bits; a zero mask yields `None`.
    pub fn from_netmask(addr: Ipv4Addr, netmask: Ipv4Addr) -> Option<Self> {
        let mask = u32::from(netmask);
        if mask == 0 {
            return None;
        }
        Some(Self {
            addr,
            prefix: mask.leading_ones() as u8,
        })
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & self.mask())
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()) | !self.mask())
    }

    /// Usable hosts: network + 1 through broadcast - 1
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.network()) as u64 + 1;
        let last = (u32::from(self.broadcast()) as u64).saturating_sub(1);
        (first..=last).map(|v| Ipv4Addr::from(v as u32))
    }

    pub fn host_count(&self) -> u64 {
        let first = u32::from(self.network()) as u64 + 1;
        let last = (u32::from(self.broadcast()) as u64).saturating_sub(1);
        (last + 1).saturating_sub(first)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.network())
    }
}

impl FromStr for Cidr {
    type Err = OscError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || OscError::InvalidCidr(s.to_string());
        let (ip, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = ip.trim().parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.trim().parse().map_err(|_| invalid())?;
        Cidr::new(addr, prefix).map_err(|_| invalid())
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// A non-loopback IPv4 interface usable for scanning
#[derive(Debug, Clone)]
pub struct LocalNetwork {
    pub interface: String,
    pub cidr: Cidr,
    pub broadcast: Option<Ipv4Addr>,
}

/// Enumerate non-loopback IPv4 interfaces with a non-zero netmask
pub fn local_networks() -> Result<Vec<LocalNetwork>> {
    let mut out: Vec<LocalNetwork> = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        if iface.is_loopback() {
            continue;
        }
        let if_addrs::IfAddr::V4(v4) = &iface.addr else {
            continue;
        };
        let Some(cidr) = Cidr::from_netmask(v4.ip, v4.netmask) else {
            continue;
        };
        if out.iter().any(|n| n.cidr.network() == cidr.network() && n.cidr.prefix == cidr.prefix) {
            continue;
        }
        out.push(LocalNetwork {
            interface: iface.name.clone(),
            cidr,
            broadcast: v4.broadcast,
        });
    }
    Ok(out)
}

/// Does this reply look like it came from a mixer?
///
/// Accepts answers to either probe (carrying at least one string argument,
/// so a bare echo of the probe is rejected), pushed feedback on `/xremote`,
/// and channel parameters.
pub fn is_mixer_reply(msg: &OscMessage) -> bool {
    let has_string = msg.args.iter().any(|a| a.as_str().is_some());
    match msg.addr.as_str() {
        address::XINFO | address::PREFS_NAME => has_string,
        address::XREMOTE => true,
        addr => addr.starts_with("/ch/"),
    }
}

/// Active scanner with its own short-lived socket per scan
#[derive(Debug, Clone)]
pub struct Discovery {
    port: u16,
    timeout: Duration,
    max_hosts: u64,
}

impl Discovery {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self {
            port,
            timeout,
            max_hosts: DEFAULT_MAX_HOSTS,
        }
    }

    /// Skip interface ranges larger than this in automatic mode
    pub fn with_max_hosts(mut self, max_hosts: u64) -> Self {
        self.max_hosts = max_hosts;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Scan an explicit range, or every local interface when `None`
    pub async fn discover(&self, cidr: Option<Cidr>) -> Result<SocketAddr> {
        match cidr {
            Some(cidr) => self.scan_range(cidr).await,
            None => self.scan_interfaces().await,
        }
    }

    /// Probe every usable host of `cidr`
    pub async fn scan_range(&self, cidr: Cidr) -> Result<SocketAddr> {
        let hosts = cidr.host_count();
        info!("🔎 Scanning {} ({} hosts) for a mixer on port {}", cidr, hosts, self.port);

        let socket = bind_udp(0, true)?;
        let probes = [
            codec::encode_message(&address::xinfo())?,
            codec::encode_message(&address::prefs_name())?,
        ];

        if hosts > 0 {
            for host in cidr.hosts() {
                let dst = SocketAddr::from((host, self.port));
                for probe in &probes {
                    if let Err(e) = socket.send_to(probe, dst).await {
                        trace!("Probe to {} failed: {}", dst, e);
                    }
                }
            }
        }

        let port = self.port;
        self.await_first_responder(&socket, |msg, from| match from.ip() {
            IpAddr::V4(ip) => from.port() == port && cidr.contains(ip) && is_mixer_reply(msg),
            IpAddr::V6(_) => false,
        })
        .await
    }

    /// Try each local interface range in turn, stopping at the first hit
    pub async fn scan_interfaces(&self) -> Result<SocketAddr> {
        let networks = local_networks()?;
        if networks.is_empty() {
            warn!("No usable IPv4 interface to scan");
        }
        self.scan_networks(networks).await
    }

    async fn scan_networks(&self, networks: Vec<LocalNetwork>) -> Result<SocketAddr> {
        for net in networks {
            if net.cidr.host_count() > self.max_hosts {
                warn!(
                    "Skipping {} on {}: {} hosts exceeds scan limit {}",
                    net.cidr,
                    net.interface,
                    net.cidr.host_count(),
                    self.max_hosts
                );
                continue;
            }
            debug!("Scanning interface {} ({})", net.interface, net.cidr);
            match self.scan_range(net.cidr).await {
                Ok(found) => return Ok(found),
                Err(OscError::DiscoveryTimeout { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(self.timeout_error())
    }

    /// One `/-prefs/name` probe to the limited broadcast address and to every
    /// interface's directed broadcast address
    pub async fn broadcast(&self) -> Result<SocketAddr> {
        let mut targets = vec![Ipv4Addr::BROADCAST];
        match local_networks() {
            Ok(networks) => targets.extend(networks.iter().filter_map(|n| n.broadcast)),
            Err(e) => debug!("Interface enumeration failed: {}", e),
        }
        self.broadcast_to(targets).await
    }

    async fn broadcast_to(&self, targets: Vec<Ipv4Addr>) -> Result<SocketAddr> {
        let socket = bind_udp(0, true)?;
        let probe = codec::encode_message(&address::prefs_name())?;

        info!("🔎 Broadcasting mixer probe to {} address(es)", targets.len());
        for ip in targets {
            let dst = SocketAddr::from((ip, self.port));
            if let Err(e) = socket.send_to(&probe, dst).await {
                debug!("Broadcast probe to {} failed: {}", dst, e);
            }
        }

        let port = self.port;
        self.await_first_responder(&socket, |msg, from| from.port() == port && is_mixer_reply(msg))
            .await
    }

    /// Read replies until one is accepted or the deadline passes
    async fn await_first_responder<F>(&self, socket: &UdpSocket, accept: F) -> Result<SocketAddr>
    where
        F: Fn(&OscMessage, SocketAddr) -> bool,
    {
        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
            let (len, from) = match received {
                Err(_elapsed) => return Err(self.timeout_error()),
                Ok(Err(e)) => {
                    trace!("Discovery receive error: {}", e);
                    continue;
                }
                Ok(Ok(received)) => received,
            };

            let messages = match codec::decode(&buf[..len]) {
                Ok(packet) => into_messages(packet),
                Err(e) => {
                    trace!("Ignoring undecodable reply from {}: {}", from, e);
                    continue;
                }
            };

            if let Some(msg) = messages.iter().find(|m| accept(m, from)) {
                info!("🎛️ Mixer found at {} (replied {})", from.ip(), msg.addr);
                return Ok(SocketAddr::new(from.ip(), self.port));
            }
            debug!("Ignoring non-mixer reply from {}", from);
        }
    }

    fn timeout_error(&self) -> OscError {
        OscError::DiscoveryTimeout {
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new(MIXER_PORT, DEFAULT_TIMEOUT)
    }
}

/// Reply to probes like a mixer would; used by tests
#[cfg(test)]
pub(crate) async fn spawn_fake_mixer(name: &'static str) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    use crate::osc::{message, OscPacket, OscType};

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let Ok(OscPacket::Message(msg)) = codec::decode(&buf[..len]) else {
                continue;
            };
            let reply = match msg.addr.as_str() {
                address::XINFO => message(
                    address::XINFO,
                    vec![
                        OscType::String(addr.ip().to_string()),
                        OscType::String(name.to_string()),
                        OscType::String("XR18".to_string()),
                        OscType::String("1.22".to_string()),
                    ],
                ),
                address::PREFS_NAME => {
                    message(address::PREFS_NAME, vec![OscType::String(name.to_string())])
                }
                _ => continue,
            };
            let bytes = codec::encode_message(&reply).unwrap();
            let _ = socket.send_to(&bytes, from).await;
        }
    });
    (addr, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osc::{bare, message, OscType};

    #[test]
    fn test_parse_cidr() {
        let cidr: Cidr = "192.168.1.77/24".parse().unwrap();
        assert_eq!(cidr.network(), Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(cidr.broadcast(), Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(cidr.host_count(), 254);
        assert_eq!(cidr.to_string(), "192.168.1.77/24");

        assert!(" 10.0.0.1 / 8 ".parse::<Cidr>().is_ok());
        for bad in ["", "10.0.0.1", "10.0.0.1/33", "10.0.0/8", "abc/24", "10.0.0.1/x"] {
            assert!(matches!(bad.parse::<Cidr>(), Err(OscError::InvalidCidr(_))), "{}", bad);
        }
    }

    #[test]
    fn test_host_range() {
        let cidr: Cidr = "10.1.2.3/30".parse().unwrap();
        let hosts: Vec<Ipv4Addr> = cidr.hosts().collect();
        assert_eq!(hosts, vec![Ipv4Addr::new(10, 1, 2, 1), Ipv4Addr::new(10, 1, 2, 2)]);

        let single: Cidr = "10.1.2.3/32".parse().unwrap();
        assert_eq!(single.hosts().count(), 0);
        assert_eq!(single.host_count(), 0);

        let pair: Cidr = "10.1.2.3/31".parse().unwrap();
        assert_eq!(pair.host_count(), 0);

        let all: Cidr = "0.0.0.0/0".parse().unwrap();
        assert_eq!(all.host_count(), (1u64 << 32) - 2);
    }

    #[test]
    fn test_from_netmask() {
        let cidr = Cidr::from_netmask(Ipv4Addr::new(172, 16, 5, 9), Ipv4Addr::new(255, 255, 240, 0))
            .unwrap();
        assert_eq!(cidr.prefix, 20);
        assert_eq!(cidr.network(), Ipv4Addr::new(172, 16, 0, 0));
        assert!(cidr.contains(Ipv4Addr::new(172, 16, 15, 255)));
        assert!(!cidr.contains(Ipv4Addr::new(172, 16, 16, 0)));
        assert!(Cidr::from_netmask(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::UNSPECIFIED).is_none());
    }

    #[test]
    fn test_reply_predicate() {
        let named = message(address::PREFS_NAME, vec![OscType::String("XR18".into())]);
        assert!(is_mixer_reply(&named));
        assert!(!is_mixer_reply(&bare(address::PREFS_NAME)));
        assert!(!is_mixer_reply(&bare(address::XINFO)));
        assert!(is_mixer_reply(&bare(address::XREMOTE)));
        assert!(is_mixer_reply(&message("/ch/01/mix/on", vec![OscType::Int(1)])));
        assert!(!is_mixer_reply(&bare("/status")));
    }

    #[tokio::test]
    async fn test_first_responder_wins() {
        let (mixer, task) = spawn_fake_mixer("Stage").await;

        let discovery = Discovery::new(mixer.port(), Duration::from_secs(2));
        let found = discovery
            .scan_range("127.0.0.1/30".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(found, mixer);

        task.abort();
    }

    #[tokio::test]
    async fn test_timeout_on_silent_range() {
        // Bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let timeout = Duration::from_millis(300);
        let discovery = Discovery::new(port, timeout);
        let started = std::time::Instant::now();
        let result = discovery.scan_range("127.0.0.1/30".parse().unwrap()).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(OscError::DiscoveryTimeout { timeout_ms: 300 })));
        assert!(elapsed >= Duration::from_millis(280), "returned too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1500), "returned too late: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_empty_range_times_out() {
        let discovery = Discovery::new(MIXER_PORT, Duration::from_millis(50));
        let result = discovery.scan_range("127.0.0.1/32".parse().unwrap()).await;
        assert!(matches!(result, Err(OscError::DiscoveryTimeout { .. })));
    }

    fn network(name: &str, cidr: &str) -> LocalNetwork {
        LocalNetwork {
            interface: name.to_string(),
            cidr: cidr.parse().unwrap(),
            broadcast: None,
        }
    }

    #[tokio::test]
    async fn test_interface_scan_moves_past_silent_network() {
        let (mixer, task) = spawn_fake_mixer("Stage").await;

        let discovery = Discovery::new(mixer.port(), Duration::from_millis(200)).with_max_hosts(254);
        let networks = vec![
            // No hosts: times out
            network("lo-empty", "127.0.0.9/32"),
            // Over the host cap: skipped without probing
            network("big", "127.0.0.0/16"),
            network("lo", "127.0.0.1/30"),
        ];
        let started = std::time::Instant::now();
        let found = discovery.scan_networks(networks).await.unwrap();
        assert_eq!(found, mixer);
        assert!(started.elapsed() >= Duration::from_millis(180));

        task.abort();
    }

    #[tokio::test]
    async fn test_interface_scan_all_silent_times_out() {
        let discovery = Discovery::new(MIXER_PORT, Duration::from_millis(50));
        let networks = vec![network("a", "127.0.0.9/32"), network("b", "127.0.0.10/32")];
        assert!(matches!(
            discovery.scan_networks(networks).await,
            Err(OscError::DiscoveryTimeout { timeout_ms: 50 })
        ));
        assert!(matches!(
            discovery.scan_networks(Vec::new()).await,
            Err(OscError::DiscoveryTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_broadcast_finds_responder() {
        let (mixer, task) = spawn_fake_mixer("Stage").await;

        let discovery = Discovery::new(mixer.port(), Duration::from_secs(2));
        let found = discovery.broadcast_to(vec![Ipv4Addr::LOCALHOST]).await.unwrap();
        assert_eq!(found, mixer);

        task.abort();
    }

    #[tokio::test]
    async fn test_broadcast_without_responder_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let discovery = Discovery::new(port, Duration::from_millis(100));
        assert!(matches!(
            discovery.broadcast_to(vec![Ipv4Addr::LOCALHOST]).await,
            Err(OscError::DiscoveryTimeout { timeout_ms: 100 })
        ));
        // Full path: limited broadcast plus interface broadcasts; send
        // failures are logged and the result is still a timeout
        assert!(matches!(
            discovery.broadcast().await,
            Err(OscError::DiscoveryTimeout { .. })
        ));
    }
}
