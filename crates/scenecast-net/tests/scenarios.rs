//! End-to-end scenarios over loopback sockets.

use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scenecast_net::collation::CollatedPacketDecoder;
use scenecast_net::messages::{
    ControlId, DrawType, MeshMessageId, ObjectAttributes, ObjectMessageId, routing,
};
use scenecast_net::{
    Connection, FrameEvent, MeshSet, MonitorMode, PacketBuffer, PacketReader, Resource,
    ServerInfoMessage, ServerSettings, ShapeKind, SimpleMesh, SimpleShape, TcpServer,
};

fn settings(collate: bool, compress: bool) -> ServerSettings {
    ServerSettings {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        listen_port: 0,
        collate,
        compress,
        poll_interval_ms: 10,
        ..ServerSettings::default()
    }
}

/// Start a synchronous server and commit one client.
fn serve_one(settings: ServerSettings) -> (TcpServer, PacketReader<TcpStream>) {
    let server = TcpServer::new(settings, ServerInfoMessage::default());
    server.monitor().start(MonitorMode::Synchronous).unwrap();
    let client = TcpStream::connect((Ipv4Addr::LOCALHOST, server.port())).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    assert!(server.monitor().wait_for_connections(Duration::from_secs(2)));
    assert_eq!(server.commit_connections(), 1);
    (server, PacketReader::new(client))
}

/// One received outer packet and the packets it expanded to.
struct Received {
    outer: PacketBuffer,
    inner: Vec<PacketBuffer>,
}

fn receive(reader: &mut PacketReader<TcpStream>) -> Received {
    let outer = reader.next_packet().unwrap().expect("stream closed");
    let mut decoder = CollatedPacketDecoder::new();
    decoder.set_packet(outer.clone()).unwrap();
    let mut inner = Vec::new();
    while let Some(packet) = decoder.next().unwrap() {
        inner.push(packet);
    }
    Received { outer, inner }
}

/// Read until an end-of-frame control packet, returning every inner packet.
fn receive_frame(reader: &mut PacketReader<TcpStream>) -> Vec<PacketBuffer> {
    let mut packets = Vec::new();
    loop {
        let received = receive(reader);
        let done = received.inner.iter().any(|p| {
            p.header().routing_id == routing::CONTROL
                && p.header().message_id == ControlId::Frame as u16
        });
        packets.extend(received.inner);
        if done {
            return packets;
        }
    }
}

fn ids(packets: &[PacketBuffer]) -> Vec<(u16, u16)> {
    packets
        .iter()
        .map(|p| (p.header().routing_id, p.header().message_id))
        .collect()
}

fn shared_mesh() -> Arc<dyn Resource> {
    Arc::new(
        SimpleMesh::new(9, DrawType::Triangles)
            .with_vertices(vec![[1.0, 2.0, 3.0]; 12])
            .with_indices((0..12).collect()),
    )
}

#[test]
fn test_collated_compressed_frame() {
    let (server, mut reader) = serve_one(settings(true, true));

    let handshake = receive(&mut reader);
    assert_eq!(handshake.outer.header().routing_id, routing::SERVER_INFO);

    let simple = SimpleShape::new(ShapeKind::Sphere, 1);
    let complex = SimpleShape::new(ShapeKind::PointCloud, 2).with_data_chunks(vec![
        vec![1; 100],
        vec![2; 100],
        vec![3; 100],
    ]);
    assert!(server.create(&simple).is_ok());
    assert!(server.create(&complex).is_ok());
    assert!(server.update_frame(1.0 / 30.0, true).is_ok());

    // The frame flushes the collation, then the end-of-frame follows on its own.
    let collated = receive(&mut reader);
    assert_eq!(collated.outer.header().routing_id, routing::COLLATED_PACKET);
    let mut payload = collated.outer.reader();
    let flags = payload.read_u16().unwrap();
    assert_eq!(flags & 1, 1, "collated packet should be compressed");

    let create = ObjectMessageId::Create as u16;
    let data = ObjectMessageId::Data as u16;
    let sphere = ShapeKind::Sphere.routing_id();
    let cloud = ShapeKind::PointCloud.routing_id();
    assert_eq!(
        ids(&collated.inner),
        vec![
            (sphere, create),
            (cloud, create),
            (cloud, data),
            (cloud, data),
            (cloud, data),
        ]
    );

    let frame = receive(&mut reader);
    assert_eq!(frame.outer.header().routing_id, routing::CONTROL);
    assert_eq!(
        ids(&frame.inner),
        vec![(routing::CONTROL, ControlId::Frame as u16)]
    );
    server.close();
}

#[test]
fn test_shared_resource_destroyed_with_last_reference() {
    let (server, mut reader) = serve_one(settings(false, false));
    let mesh = shared_mesh();
    let first = MeshSet::new(1).with_part(Arc::clone(&mesh), ObjectAttributes::default());
    let second = MeshSet::new(2).with_part(Arc::clone(&mesh), ObjectAttributes::default());

    server.create(&first);
    server.create(&second);
    let connection = server.connection(0).unwrap();
    assert_eq!(connection.reference_count(mesh.as_ref()), 2);

    assert!(server.update_transfers(0).is_ok());
    server.update_frame(0.0, true);
    let setup = receive_frame(&mut reader);
    let finalise = (routing::MESH, MeshMessageId::Finalise as u16);
    assert_eq!(ids(&setup).iter().filter(|id| **id == finalise).count(), 1);

    let mesh_destroy = (routing::MESH, MeshMessageId::Destroy as u16);
    let set_destroy = (
        ShapeKind::MeshSet.routing_id(),
        ObjectMessageId::Destroy as u16,
    );

    server.destroy(&first);
    assert_eq!(connection.reference_count(mesh.as_ref()), 1);
    server.update_frame(0.0, true);
    let after_first = ids(&receive_frame(&mut reader));
    assert!(after_first.contains(&set_destroy));
    assert!(!after_first.contains(&mesh_destroy));

    server.destroy(&second);
    assert_eq!(connection.reference_count(mesh.as_ref()), 0);
    server.update_frame(0.0, true);
    let after_second = ids(&receive_frame(&mut reader));
    let mesh_at = after_second.iter().position(|id| *id == mesh_destroy);
    let set_at = after_second.iter().position(|id| *id == set_destroy);
    assert!(mesh_at.is_some(), "resource destroy not sent");
    assert!(mesh_at < set_at, "resource released before the shape");
    server.close();
}

#[test]
fn test_corrupt_packet_skipped_in_stream() {
    let mut bytes = Vec::new();
    for id in 1..=3u32 {
        let mut packet = PacketBuffer::new();
        packet.reset(routing::CONTROL, ControlId::Frame as u16);
        packet.write_u32(id).unwrap();
        packet.finalise().unwrap();
        bytes.extend_from_slice(packet.data().unwrap());
    }
    let packet_len = bytes.len() / 3;
    // Flip the CRC trailer of the middle packet.
    bytes[2 * packet_len - 1] ^= 0xFF;

    let mut reader = PacketReader::new(Cursor::new(bytes));
    let mut values = Vec::new();
    let mut failures = 0;
    while let Some(event) = reader.next_event().unwrap() {
        match event {
            FrameEvent::Packet(packet) => values.push(packet.reader().read_u32().unwrap()),
            FrameEvent::ChecksumFailure { .. } => failures += 1,
        }
    }
    assert_eq!(values, vec![1, 3]);
    assert_eq!(failures, 1);
    assert!(reader.stream().discarded_bytes() > 0);
}

#[test]
fn test_reconciliation_is_idempotent() {
    let server = TcpServer::new(settings(false, false), ServerInfoMessage::default());
    server.monitor().start(MonitorMode::Synchronous).unwrap();
    let _client = TcpStream::connect((Ipv4Addr::LOCALHOST, server.port())).unwrap();
    assert!(server.monitor().wait_for_connections(Duration::from_secs(2)));

    let list = server.monitor().connections();
    let mut notified = 0;
    assert_eq!(server.update_connections(&list, |_, _| notified += 1), 1);
    assert_eq!(server.update_connections(&list, |_, _| notified += 1), 0);
    assert_eq!(notified, 1);
    assert_eq!(server.connection_count(), 1);

    assert_eq!(server.update_connections(&[], |_, _| notified += 1), 0);
    assert_eq!(server.connection_count(), 0);
    assert_eq!(notified, 1);
}

#[test]
fn test_async_monitor_commits_on_frame() {
    let server = TcpServer::new(settings(true, false), ServerInfoMessage::default());
    server.monitor().start(MonitorMode::Asynchronous).unwrap();
    let client = TcpStream::connect((Ipv4Addr::LOCALHOST, server.port())).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut reader = PacketReader::new(client);
    assert!(server.monitor().wait_for_connections(Duration::from_secs(2)));

    // Nothing is committed until the producer ends a frame.
    assert_eq!(server.connection_count(), 0);
    server.update_frame(0.0, true);
    assert_eq!(server.connection_count(), 1);
    assert_eq!(
        receive(&mut reader).outer.header().routing_id,
        routing::SERVER_INFO
    );

    server.create(&SimpleShape::new(ShapeKind::Box, 4));
    server.update_frame(0.0, true);
    let frame = receive_frame(&mut reader);
    assert_eq!(
        ids(&frame),
        vec![
            (ShapeKind::Box.routing_id(), ObjectMessageId::Create as u16),
            (routing::CONTROL, ControlId::Frame as u16),
        ]
    );

    server.close();
    assert_eq!(server.monitor().mode(), MonitorMode::Inactive);
}

#[test]
fn test_disconnected_client_pruned() {
    let server = TcpServer::new(settings(false, false), ServerInfoMessage::default());
    server.monitor().start(MonitorMode::Synchronous).unwrap();
    let client = TcpStream::connect((Ipv4Addr::LOCALHOST, server.port())).unwrap();
    assert!(server.monitor().wait_for_connections(Duration::from_secs(2)));
    server.commit_connections();
    drop(client);

    let deadline = Instant::now() + Duration::from_secs(2);
    while server.connection_count() > 0 {
        assert!(Instant::now() < deadline, "client not pruned");
        server.monitor().monitor_connections();
        server.commit_connections();
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(server.update_frame(0.0, true).to_signed(), 0);
}
