use bytes::{BufMut, Bytes, BytesMut};

use mqtt_packet::{
    Disconnect, Packet, PacketId, Publish, PublishAck, PublishComplete, PublishReceived,
    PublishRelease, QoS, Subscribe, Unsubscribe, WriteTo,
};

/// Turns an already-built `Packet` into its wire bytes.
///
/// The engine never keeps a `Packet<'_>` around -- it borrows from whatever
/// buffer decoded it, or from the arguments passed to a public method -- so
/// every frame is serialized here, once, on the way into the outbound queue.
fn serialize(packet: Packet<'_>) -> Bytes {
    let mut buf = BytesMut::with_capacity(packet.size());
    packet.write_to(&mut buf);
    buf.freeze()
}

pub fn publish(packet_id: Option<PacketId>, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Bytes {
    serialize(Packet::Publish(Publish {
        dup: false,
        qos,
        retain,
        topic_name: topic,
        packet_id,
        properties: None,
        payload,
    }))
}

pub fn publish_ack(packet_id: PacketId) -> Bytes {
    serialize(Packet::PublishAck(PublishAck {
        packet_id,
        reason_code: None,
        properties: None,
    }))
}

pub fn publish_received(packet_id: PacketId) -> Bytes {
    serialize(Packet::PublishReceived(PublishReceived {
        packet_id,
        reason_code: None,
        properties: None,
    }))
}

pub fn publish_release(packet_id: PacketId) -> Bytes {
    serialize(Packet::PublishRelease(PublishRelease {
        packet_id,
        reason_code: None,
        properties: None,
    }))
}

pub fn publish_complete(packet_id: PacketId) -> Bytes {
    serialize(Packet::PublishComplete(PublishComplete {
        packet_id,
        reason_code: None,
        properties: None,
    }))
}

pub fn subscribe(packet_id: PacketId, filters: &[(&str, QoS)]) -> Bytes {
    serialize(Packet::Subscribe(Subscribe {
        packet_id,
        properties: None,
        subscriptions: filters.to_vec(),
    }))
}

pub fn unsubscribe(packet_id: PacketId, filters: &[&str]) -> Bytes {
    serialize(Packet::Unsubscribe(Unsubscribe {
        packet_id,
        properties: None,
        topic_filters: filters.to_vec(),
    }))
}

pub fn disconnect() -> Bytes {
    serialize(Packet::Disconnect(Disconnect {
        reason_code: None,
        properties: None,
    }))
}

pub fn ping() -> Bytes {
    serialize(Packet::Ping)
}
