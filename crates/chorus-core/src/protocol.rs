//! Protocol constants shared by the hub, rooms and connections.

/// Backplane topic carrying presence and private-room invites.
pub const GENERAL_TOPIC: &str = "general";

/// Byte separating coalesced envelopes inside one outbound frame.
pub const FRAME_DELIMITER: u8 = b'*';

/// System notice broadcast to a public room when someone joins.
pub fn welcome_message(name: &str) -> String {
    format!("{name} joined the room")
}

/// Name of the private room shared by two users.
///
/// Order-independent: both participants derive the same name.
pub fn private_room_name(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}{b}")
    } else {
        format!("{b}{a}")
    }
}
