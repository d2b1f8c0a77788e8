use rand::Rng;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

pub const CLIENT_ID_LEN: usize = 6;
const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Identifier the relay side assigns to each local UDP sender.
///
/// Always six ASCII alphanumeric bytes, so it can be carried verbatim in the
/// tunnel header and printed without escaping.
#[repr(transparent)]
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Copy, Clone)]
pub struct ClientId([u8; CLIENT_ID_LEN]);

impl ClientId {
    pub fn random() -> ClientId {
        let mut rng = rand::thread_rng();
        let mut id = [0u8; CLIENT_ID_LEN];
        for v in id.iter_mut() {
            *v = ALPHABET[rng.gen_range(0..ALPHABET.len())];
        }
        ClientId(id)
    }
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl AsRef<[u8]> for ClientId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for ClientId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let id: [u8; CLIENT_ID_LEN] = value.try_into().map_err(|_| Error::InvalidClientId)?;
        if !id.iter().all(u8::is_ascii_alphanumeric) {
            return Err(Error::InvalidClientId);
        }
        Ok(ClientId(id))
    }
}

impl FromStr for ClientId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClientId::try_from(s.as_bytes())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::{ClientId, CLIENT_ID_LEN};

    #[test]
    fn test_random_alphabet() {
        for _ in 0..1000 {
            let id = ClientId::random();
            assert_eq!(id.as_ref().len(), CLIENT_ID_LEN);
            assert!(id.as_ref().iter().all(u8::is_ascii_alphanumeric));
            assert_eq!(id.as_str().len(), CLIENT_ID_LEN);
        }
    }

    #[test]
    fn test_parse() {
        let id: ClientId = "xY7z09".parse().unwrap();
        assert_eq!(id.to_string(), "xY7z09");
        assert_eq!(format!("{id:?}"), "ClientId(xY7z09)");
        assert!("xY7z0".parse::<ClientId>().is_err());
        assert!("xY7z09a".parse::<ClientId>().is_err());
        assert!("xY z09".parse::<ClientId>().is_err());
    }
}
