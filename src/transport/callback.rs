//! An in-process transport: delivers requests directly to registered
//! handlers, bypassing sockets entirely. Used by tests to wire up several
//! simulated peers within a single process without touching the network.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{NetfsError, Result};
use crate::transport::{Handler, Receiver, Request, Sender};

type Endpoints = Arc<Mutex<HashMap<String, Arc<dyn Handler>>>>;

/// A shared registry of simulated peers, each keyed by the `Ipv4Addr` it
/// would otherwise be reachable at.
#[derive(Clone, Default)]
pub struct CallbackNetwork {
    peers: Arc<Mutex<HashMap<Ipv4Addr, Endpoints>>>,
}

impl CallbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the receiver a simulated peer at `ip` should bind endpoints
    /// to. Calling this more than once for the same `ip` returns the same
    /// underlying endpoint table.
    pub fn receiver(&self, ip: Ipv4Addr) -> CallbackReceiver {
        let endpoints = self.peers.lock().expect("peer table lock poisoned").entry(ip).or_default().clone();
        CallbackReceiver { endpoints }
    }

    /// Returns a sender any simulated peer can use to reach any other peer
    /// registered on this network.
    pub fn sender(&self) -> CallbackSender {
        CallbackSender { peers: self.peers.clone() }
    }
}

/// Registers handlers for a simulated peer. `start`/`stop` are no-ops: the
/// handlers are already reachable the moment they're bound.
pub struct CallbackReceiver {
    endpoints: Endpoints,
}

#[async_trait]
impl Receiver for CallbackReceiver {
    fn bind(&self, endpoint: &str, handler: Arc<dyn Handler>) {
        self.endpoints.lock().expect("endpoint table lock poisoned").insert(endpoint.to_string(), handler);
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Delivers a request directly to a simulated peer's registered handler.
pub struct CallbackSender {
    peers: Arc<Mutex<HashMap<Ipv4Addr, Endpoints>>>,
}

#[async_trait]
impl Sender for CallbackSender {
    async fn send(&self, ip: Ipv4Addr, endpoint: &str, params: &[(String, String)], body: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let endpoints = self
            .peers
            .lock()
            .expect("peer table lock poisoned")
            .get(&ip)
            .cloned()
            .ok_or(NetfsError::Timeout)?;

        let handler = endpoints
            .lock()
            .expect("endpoint table lock poisoned")
            .get(endpoint)
            .cloned()
            .ok_or_else(|| NetfsError::UnexpectedAnswer { status: 404, body: format!("no handler bound for {endpoint}") })?;

        let request = Request::new(params.iter().cloned().collect(), body.unwrap_or_default());
        let response = handler.handle(request).await?;
        response.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Response;

    #[tokio::test]
    async fn delivers_request_to_the_bound_peer() {
        let network = CallbackNetwork::new();
        let peer_ip: Ipv4Addr = "192.168.1.10".parse().unwrap();

        let receiver = network.receiver(peer_ip);
        receiver.bind("/netfs/api/host", Arc::new(|_req: Request| async move { Response::json("peer-a") }));

        let sender = network.sender();
        let raw = sender.send(peer_ip, "/netfs/api/host", &[], None).await.unwrap();
        let decoded: String = serde_json::from_slice(&raw).unwrap();
        assert_eq!(decoded, "peer-a");
    }

    #[tokio::test]
    async fn unreachable_peer_times_out() {
        let network = CallbackNetwork::new();
        let sender = network.sender();
        let unreachable: Ipv4Addr = "192.168.1.200".parse().unwrap();
        let err = sender.send(unreachable, "/netfs/api/host", &[], None).await.unwrap_err();
        assert!(matches!(err, NetfsError::Timeout));
    }
}
