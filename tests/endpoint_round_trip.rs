//! Drives every bound endpoint through actual request encoding/decoding
//! (query params + JSON bodies) over the callback transport, rather than
//! calling handler functions directly. This is the one place the wire
//! format itself (not just the handler logic) is under test.

use std::net::Ipv4Addr;
use std::sync::Arc;

use netfs::config::{Config, VolumeConfig, VolumePerm};
use netfs::error::NetfsError;
use netfs::network::Peer;
use netfs::server::{self, Server};
use netfs::transport::{self, callback::CallbackNetwork, Sender};
use netfs::volume::{FileInfo, FileType};

fn config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.tasks_waiting_second = 1;
    config.volumes = vec![VolumeConfig { name: "root".into(), os_path: dir.to_string_lossy().into_owned(), perm: vec![VolumePerm::Read, VolumePerm::Write] }];
    config
}

#[tokio::test]
async fn file_lifecycle_round_trips_through_json_and_raw_wire_encoding() {
    let dir = tempfile::tempdir().unwrap();
    let network = CallbackNetwork::new();
    let ip: Ipv4Addr = "10.0.0.30".parse().unwrap();

    let server = Server::new(&config(dir.path()), Arc::new(network.receiver(ip)), Arc::new(network.sender())).unwrap();
    server.start().await.unwrap();

    let sender = network.sender();

    transport::send_json_body(
        &sender,
        ip,
        server::EP_FILE_CREATE,
        &FileInfo { name: "doc".into(), virtual_path: "root:/doc".into(), file_type: FileType::File, size: 0, parent_path: "root:/".into() },
    )
    .await
    .unwrap();

    transport::send_raw_body(&sender, ip, server::EP_FILE_WRITE, &[("path".to_string(), "root:/doc".to_string())], b"hello netfs".to_vec()).await.unwrap();

    let info: FileInfo = transport::send_json(&sender, ip, server::EP_FILE_INFO, &[("path".to_string(), "root:/doc".to_string())], None::<&()>).await.unwrap();
    assert_eq!(info.size, 11);
    assert_eq!(info.name, "doc");

    let children: Vec<FileInfo> =
        transport::send_json(&sender, ip, server::EP_FILE_CHILDREN, &[("path".to_string(), "root:/".to_string()), ("skip".to_string(), "0".to_string()), ("limit".to_string(), "10".to_string())], None::<&()>)
            .await
            .unwrap();
    assert!(children.iter().any(|c| c.virtual_path == "root:/doc"));

    sender.send(ip, server::EP_FILE_REMOVE, &[("path".to_string(), "root:/doc".to_string())], None).await.unwrap();
    let err: Result<FileInfo, NetfsError> = transport::send_json(&sender, ip, server::EP_FILE_INFO, &[("path".to_string(), "root:/doc".to_string())], None::<&()>).await;
    assert!(err.is_err());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn server_host_and_stop_endpoints_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let network = CallbackNetwork::new();
    let ip: Ipv4Addr = "10.0.0.31".parse().unwrap();

    let server = Server::new(&config(dir.path()), Arc::new(network.receiver(ip)), Arc::new(network.sender())).unwrap();
    server.start().await.unwrap();

    let sender = network.sender();
    let host: Peer = transport::send_json(&sender, ip, server::EP_SERVER_HOST, &[], None::<&()>).await.unwrap();
    assert_eq!(host, server.local_host().clone());

    // The callback transport never tags a source address, so this request
    // is trusted even though it didn't "originate" from the server's own
    // `local_host`, matching the documented behaviour for transports with
    // no real network origin to report.
    sender.send(ip, server::EP_SERVER_STOP, &[], None).await.unwrap();

    server.stop().await.unwrap();
}
