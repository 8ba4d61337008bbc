use serde::Serialize;

use crate::RoomId;

/// An event as delivered to a session, stamped with the room it came from and
/// the room's sequence number.
///
/// Sequence numbers are strictly increasing and gap-free within one room. No
/// ordering is promised across rooms.
#[derive(Debug, Clone, Serialize)]
pub struct Sequenced<E> {
    pub room_id: RoomId,
    pub seq: u64,
    pub event: E,
}
