//! End-to-end peer-to-peer copy: two `Server`s wired over the in-process
//! callback transport, a file created and populated on one, copied to the
//! other one chunk at a time, status polled through to completion.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use netfs::config::{Config, VolumeConfig, VolumePerm};
use netfs::network::Peer;
use netfs::peer::PeerClient;
use netfs::server::Server;
use netfs::task::{RemoteFile, TaskStatus};
use netfs::transport::callback::CallbackNetwork;

fn config(volume_dir: &std::path::Path, buffer_size: u64) -> Config {
    let mut config = Config::default();
    config.buffer_size = buffer_size;
    config.max_available_tasks = 2;
    config.tasks_waiting_second = 1;
    config.volumes = vec![VolumeConfig { name: "root".into(), os_path: volume_dir.to_string_lossy().into_owned(), perm: vec![VolumePerm::Read, VolumePerm::Write] }];
    config
}

#[tokio::test]
async fn copy_moves_a_file_between_two_peers_in_multiple_chunks() {
    let source_dir = tempfile::tempdir().unwrap();
    let target_dir = tempfile::tempdir().unwrap();

    let network = CallbackNetwork::new();
    let source_ip: Ipv4Addr = "10.0.0.11".parse().unwrap();
    let target_ip: Ipv4Addr = "10.0.0.12".parse().unwrap();

    let source_server = Server::new(&config(source_dir.path(), 4), Arc::new(network.receiver(source_ip)), Arc::new(network.sender())).unwrap();
    let target_server = Server::new(&config(target_dir.path(), 4), Arc::new(network.receiver(target_ip)), Arc::new(network.sender())).unwrap();

    source_server.start().await.unwrap();
    target_server.start().await.unwrap();

    let client = PeerClient::new(Arc::new(network.sender()));
    let source_peer = Peer { name: "source".into(), ip: source_ip };
    let target_peer = Peer { name: "target".into(), ip: target_ip };

    client
        .create(
            &source_peer,
            &netfs::volume::FileInfo {
                name: "payload".into(),
                virtual_path: "root:/payload".into(),
                file_type: netfs::volume::FileType::File,
                size: 0,
                parent_path: "root:/".into(),
            },
        )
        .await
        .unwrap();
    client.write(&source_peer, "root:/payload", b"the quick brown fox jumps over the lazy dog").await.unwrap();

    let source = RemoteFile { peer: source_peer.clone(), virtual_path: "root:/payload".into() };
    let target = RemoteFile { peer: target_peer.clone(), virtual_path: "root:/payload".into() };
    let handle = client.copy_start(&source_peer, source, target).await.unwrap();
    assert_eq!(handle.status, TaskStatus::Waiting);

    let mut attempts = 0;
    loop {
        let status = client.copy_status(&source_peer, handle.id).await.unwrap();
        if status.status.is_terminal() || attempts > 200 {
            assert_eq!(status.status, TaskStatus::Completed);
            break;
        }
        attempts += 1;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let copied = client.info(&target_peer, "root:/payload").await.unwrap();
    assert_eq!(copied.size, "the quick brown fox jumps over the lazy dog".len() as i64);

    source_server.stop().await.unwrap();
    target_server.stop().await.unwrap();
}

#[tokio::test]
async fn cancel_stops_a_copy_before_it_reaches_completion() {
    let source_dir = tempfile::tempdir().unwrap();
    let target_dir = tempfile::tempdir().unwrap();

    let network = CallbackNetwork::new();
    let source_ip: Ipv4Addr = "10.0.0.21".parse().unwrap();
    let target_ip: Ipv4Addr = "10.0.0.22".parse().unwrap();

    // A tiny buffer and a large payload give the scheduler many chunks to
    // work through, leaving a wide window to cancel mid-flight.
    let source_server = Server::new(&config(source_dir.path(), 4), Arc::new(network.receiver(source_ip)), Arc::new(network.sender())).unwrap();
    let target_server = Server::new(&config(target_dir.path(), 4), Arc::new(network.receiver(target_ip)), Arc::new(network.sender())).unwrap();

    source_server.start().await.unwrap();
    target_server.start().await.unwrap();

    let client = PeerClient::new(Arc::new(network.sender()));
    let source_peer = Peer { name: "source".into(), ip: source_ip };
    let target_peer = Peer { name: "target".into(), ip: target_ip };

    client
        .create(
            &source_peer,
            &netfs::volume::FileInfo { name: "big".into(), virtual_path: "root:/big".into(), file_type: netfs::volume::FileType::File, size: 0, parent_path: "root:/".into() },
        )
        .await
        .unwrap();
    client.write(&source_peer, "root:/big", &vec![7u8; 4096]).await.unwrap();

    let source = RemoteFile { peer: source_peer.clone(), virtual_path: "root:/big".into() };
    let target = RemoteFile { peer: target_peer.clone(), virtual_path: "root:/big".into() };
    let handle = client.copy_start(&source_peer, source, target).await.unwrap();

    client.copy_cancel(&source_peer, handle.id).await.unwrap();

    let mut attempts = 0;
    loop {
        let status = client.copy_status(&source_peer, handle.id).await.unwrap();
        if status.status.is_terminal() || attempts > 200 {
            assert_eq!(status.status, TaskStatus::Cancelled);
            break;
        }
        attempts += 1;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    source_server.stop().await.unwrap();
    target_server.stop().await.unwrap();
}
