//! Control Protocol Definitions
//!
//! Single-byte control messages exchanged around the reliable channel.
//! A datagram of exactly one byte carrying one of these values is a control
//! message; anything else is engine data.

/// Out-of-band control message
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControlMessage {
    Connect = 1,
    AcceptConnection = 2,
    Disconnect = 3,
    TooManyUsers = 4,
}

impl ControlMessage {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ControlMessage::Connect),
            2 => Some(ControlMessage::AcceptConnection),
            3 => Some(ControlMessage::Disconnect),
            4 => Some(ControlMessage::TooManyUsers),
            _ => None,
        }
    }

    /// Classify a datagram. Only 1-byte datagrams can be control messages.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        match datagram {
            [byte] => Self::from_u8(*byte),
            _ => None,
        }
    }

    /// Wire representation
    pub fn as_bytes(self) -> [u8; 1] {
        [self as u8]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(ControlMessage::Connect.as_bytes(), [1]);
        assert_eq!(ControlMessage::AcceptConnection.as_bytes(), [2]);
        assert_eq!(ControlMessage::Disconnect.as_bytes(), [3]);
        assert_eq!(ControlMessage::TooManyUsers.as_bytes(), [4]);
    }

    #[test]
    fn test_only_single_bytes_are_control() {
        assert_eq!(ControlMessage::parse(&[3]), Some(ControlMessage::Disconnect));
        assert_eq!(ControlMessage::parse(&[3, 0]), None);
        assert_eq!(ControlMessage::parse(&[]), None);
        assert_eq!(ControlMessage::parse(&[0]), None);
        assert_eq!(ControlMessage::parse(&[5]), None);
    }
}
