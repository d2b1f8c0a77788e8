#[derive(Eq, PartialEq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum MessageType {
    /// Application payload handed to whoever consumes peer messages
    Data = 0,
    /// Version and capability handshake sent when a peer is added
    SessionHello = 1,
    Unknown = 255,
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            0 => MessageType::Data,
            1 => MessageType::SessionHello,
            _ => MessageType::Unknown,
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}
