use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("packet too short: len is {len} but at least {required} bytes are required")]
    ShortPacket { len: usize, required: usize },
    #[error("invalid client id")]
    InvalidClientId,
    #[error("invalid packet tag: {0:#04x}")]
    InvalidTag(u8),
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e) => e,
            e => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
