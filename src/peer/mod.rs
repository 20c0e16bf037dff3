//! The peer client: thin typed wrappers over a [`Sender`] that the task
//! engine (and an out-of-scope TUI/CLI) use to speak to a remote peer's
//! endpoint table without hand-building requests.

use std::sync::Arc;

use crate::error::Result;
use crate::network::Peer;
use crate::task::{CopyHandle, RemoteFile};
use crate::transport::{self, Sender};
use crate::volume::FileInfo;

const EP_FILE_INFO: &str = "/netfs/api/file/info";
const EP_FILE_CHILDREN: &str = "/netfs/api/file/children";
const EP_FILE_CREATE: &str = "/netfs/api/file/create";
const EP_FILE_WRITE: &str = "/netfs/api/file/write";
const EP_FILE_REMOVE: &str = "/netfs/api/file/remove";
const EP_FILE_COPY_START: &str = "/netfs/api/file/copy/start";
const EP_FILE_COPY_STATUS: &str = "/netfs/api/file/copy/status";
const EP_FILE_COPY_CANCEL: &str = "/netfs/api/file/copy/cancel";

/// Speaks to a remote `Peer` over a [`Sender`], one method per endpoint in
/// the server's endpoint table. `peer.ip` selects the target on every call.
pub struct PeerClient {
    sender: Arc<dyn Sender>,
}

impl PeerClient {
    pub fn new(sender: Arc<dyn Sender>) -> PeerClient {
        PeerClient { sender }
    }

    pub async fn info(&self, peer: &Peer, vp: &str) -> Result<FileInfo> {
        let params = [("path".to_string(), vp.to_string())];
        transport::send_json(self.sender.as_ref(), peer.ip, EP_FILE_INFO, &params, None::<&()>).await
    }

    pub async fn children(&self, peer: &Peer, vp: &str, skip: usize, limit: usize) -> Result<Vec<FileInfo>> {
        let params = [("path".to_string(), vp.to_string()), ("skip".to_string(), skip.to_string()), ("limit".to_string(), limit.to_string())];
        transport::send_json(self.sender.as_ref(), peer.ip, EP_FILE_CHILDREN, &params, None::<&()>).await
    }

    pub async fn create(&self, peer: &Peer, info: &FileInfo) -> Result<()> {
        transport::send_json_body(self.sender.as_ref(), peer.ip, EP_FILE_CREATE, info).await
    }

    pub async fn write(&self, peer: &Peer, vp: &str, bytes: &[u8]) -> Result<()> {
        let params = [("path".to_string(), vp.to_string())];
        transport::send_raw_body(self.sender.as_ref(), peer.ip, EP_FILE_WRITE, &params, bytes.to_vec()).await
    }

    pub async fn remove(&self, peer: &Peer, vp: &str) -> Result<()> {
        let params = [("path".to_string(), vp.to_string())];
        self.sender.send(peer.ip, EP_FILE_REMOVE, &params, None).await.map(|_| ())
    }

    pub async fn copy_start(&self, peer: &Peer, source: RemoteFile, target: RemoteFile) -> Result<CopyHandle> {
        transport::send_json(self.sender.as_ref(), peer.ip, EP_FILE_COPY_START, &[], Some(&(source, target))).await
    }

    pub async fn copy_status(&self, peer: &Peer, id: u64) -> Result<CopyHandle> {
        let params = [("id".to_string(), id.to_string())];
        transport::send_json(self.sender.as_ref(), peer.ip, EP_FILE_COPY_STATUS, &params, None::<&()>).await
    }

    pub async fn copy_cancel(&self, peer: &Peer, id: u64) -> Result<()> {
        let params = [("id".to_string(), id.to_string())];
        self.sender.send(peer.ip, EP_FILE_COPY_CANCEL, &params, None).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::transport::callback::CallbackNetwork;
    use crate::transport::{Receiver, Request, Response};
    use crate::volume::FileType;

    fn peer(ip: &str) -> Peer {
        Peer { name: "peer".into(), ip: ip.parse::<Ipv4Addr>().unwrap() }
    }

    #[tokio::test]
    async fn info_round_trips_through_the_callback_transport() {
        let network = CallbackNetwork::new();
        let ip: Ipv4Addr = "10.0.0.9".parse().unwrap();
        let receiver = network.receiver(ip);
        receiver.bind(
            EP_FILE_INFO,
            Arc::new(|req: Request| async move {
                assert_eq!(req.param("path"), Some("root:/a"));
                Response::json(FileInfo { name: "a".into(), virtual_path: "root:/a".into(), file_type: FileType::File, size: 3, parent_path: "root:/".into() })
            }),
        );

        let client = PeerClient::new(Arc::new(network.sender()));
        let info = client.info(&peer("10.0.0.9"), "root:/a").await.unwrap();
        assert_eq!(info.size, 3);
    }

    #[tokio::test]
    async fn write_sends_the_raw_body_to_the_write_endpoint() {
        let network = CallbackNetwork::new();
        let ip: Ipv4Addr = "10.0.0.9".parse().unwrap();
        let receiver = network.receiver(ip);
        receiver.bind(
            EP_FILE_WRITE,
            Arc::new(|req: Request| async move {
                assert_eq!(req.raw_body(), b"hello");
                Response::json(())
            }),
        );

        let client = PeerClient::new(Arc::new(network.sender()));
        client.write(&peer("10.0.0.9"), "root:/a", b"hello").await.unwrap();
    }
}
