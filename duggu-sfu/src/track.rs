//! Forwarding of one published track to the rest of the room

use std::sync::Arc;

use duggu_core::models::{PeerId, RoomId};
use tracing::{debug, info, warn};

use crate::engine::RemoteTrack;
use crate::manager::SfuManager;

/// Publish `remote` to the room and pump its packets until it ends.
///
/// The forwarding track is registered and the room renegotiated before the
/// first packet is read, and deregistered (with another renegotiation) once
/// the remote side stops.
pub(crate) async fn forward_track(
    manager: Arc<SfuManager>,
    room_id: RoomId,
    peer_id: PeerId,
    remote: Arc<dyn RemoteTrack>,
) {
    let track_id = remote.id();

    let local = match manager.engine().create_local_track(remote.as_ref()).await {
        Ok(local) => local,
        Err(e) => {
            warn!(room_id = %room_id, peer_id = %peer_id, track_id = %track_id, error = %e, "Failed to create forwarding track");
            return;
        }
    };

    if !manager.register_track(room_id, Arc::clone(&local)).await {
        debug!(room_id = %room_id, track_id = %track_id, "Room gone before track could be forwarded");
        return;
    }
    info!(
        room_id = %room_id,
        peer_id = %peer_id,
        track_id = %track_id,
        kind = %remote.kind(),
        "Forwarding track"
    );
    manager.signal_peer_connections(room_id).await;

    let mut packets: u64 = 0;
    loop {
        let packet = match remote.read_rtp().await {
            Ok(packet) => packet,
            Err(e) => {
                debug!(room_id = %room_id, track_id = %track_id, error = %e, "Remote track ended");
                break;
            }
        };
        // one subscriber failing must not starve the others
        if let Err(e) = local.write_rtp(&packet).await {
            debug!(room_id = %room_id, track_id = %track_id, error = %e, "Forwarding write failed");
            continue;
        }
        packets += 1;
    }

    manager.deregister_track(room_id, &track_id).await;
    info!(room_id = %room_id, track_id = %track_id, packets, "Stopped forwarding track");
    manager.signal_peer_connections(room_id).await;
}
