//! LAN discovery: enumerates the local RFC1918 `/24`, probes every
//! candidate address for a live peer in parallel, and aggregates the
//! results.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{NetfsError, Result};
use crate::transport::{self, Sender};

/// A discovered peer. Identity is `ip`; peers are never persisted and live
/// only for the duration of one discovery sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub ip: Ipv4Addr,
}

const HOST_ENDPOINT: &str = "/netfs/api/server/host";

/// Returns true if `ip` falls within one of the three RFC1918 private
/// address blocks.
fn is_rfc1918(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    a == 10 || (a == 172 && (16..=31).contains(&b)) || (a == 192 && b == 168)
}

/// Enumerates this host's local IPv4 interface addresses, in whatever
/// order the OS reports them.
fn local_interface_ips() -> Vec<Ipv4Addr> {
    match local_ip_address::list_afinet_netifas() {
        Ok(ifaces) => ifaces
            .into_iter()
            .filter_map(|(_, addr)| match addr {
                std::net::IpAddr::V4(v4) => Some(v4),
                std::net::IpAddr::V6(_) => None,
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// LAN discovery over a single configured `timeout` and `port`.
pub struct Network {
    sender: Arc<dyn Sender>,
    timeout: Duration,
}

impl Network {
    pub fn new(sender: Arc<dyn Sender>, timeout: Duration) -> Self {
        Self { sender, timeout }
    }

    /// Enumerates interface addresses, selects the first RFC1918 one, and
    /// pairs it with the local hostname.
    pub fn local_host() -> Result<Peer> {
        let ip = local_interface_ips().into_iter().find(|ip| is_rfc1918(*ip)).ok_or(NetfsError::LocalIpNotFound)?;
        let name = hostname::get().map(|os| os.to_string_lossy().into_owned()).unwrap_or_else(|_| "unknown".to_string());
        Ok(Peer { name, ip })
    }

    /// Enumerates all 256 candidate addresses in the enclosing `/24`.
    ///
    /// Derives the third octet from the local RFC1918 address's own third
    /// octet rather than assuming `a.b.1.0/24`, so discovery works on any
    /// `/24` the host actually sits in.
    pub fn ips() -> Result<Vec<Ipv4Addr>> {
        let local = Self::local_host()?.ip;
        let [a, b, c, _] = local.octets();
        Ok((0..=255u8).map(|d| Ipv4Addr::new(a, b, c, d)).collect())
    }

    /// Probes a single address for the peer endpoint. Returns `None` if the
    /// peer does not respond within `timeout` or answers with an error.
    pub async fn host(&self, ip: Ipv4Addr) -> Option<Peer> {
        match transport::send_json::<Peer>(self.sender.as_ref(), ip, HOST_ENDPOINT, &[], None::<&()>).await {
            Ok(peer) => Some(peer),
            Err(err) => {
                debug!(%ip, error = %err, "peer probe failed");
                None
            }
        }
    }

    /// Fans `host` out across every address in the local `/24`, in
    /// parallel, collecting every peer that responded. A single
    /// unresponsive address cannot delay the others past `timeout`.
    pub async fn hosts(&self) -> Result<Vec<Peer>> {
        let ips = Self::ips()?;
        let probes = ips.into_iter().map(|ip| self.host(ip));
        let results = futures::future::join_all(probes).await;
        Ok(results.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1918_blocks_are_recognized() {
        assert!(is_rfc1918(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(is_rfc1918(Ipv4Addr::new(172, 16, 5, 5)));
        assert!(is_rfc1918(Ipv4Addr::new(172, 31, 255, 255)));
        assert!(!is_rfc1918(Ipv4Addr::new(172, 32, 0, 1)));
        assert!(is_rfc1918(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!is_rfc1918(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[tokio::test]
    async fn discovery_skips_unresponsive_peers_and_keeps_live_ones() {
        use crate::transport::callback::CallbackNetwork;
        use crate::transport::{Receiver, Response};

        let net = CallbackNetwork::new();
        let live_ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        let silent_ip: Ipv4Addr = "10.0.0.6".parse().unwrap();

        let receiver = net.receiver(live_ip);
        receiver.bind(
            HOST_ENDPOINT,
            Arc::new(|_req| async move { Response::json(Peer { name: "alice".into(), ip: "10.0.0.5".parse().unwrap() }) }),
        );

        let network = Network::new(Arc::new(net.sender()), Duration::from_millis(50));
        let live = network.host(live_ip).await;
        assert_eq!(live.unwrap().name, "alice");

        let silent = network.host(silent_ip).await;
        assert!(silent.is_none());
    }
}
