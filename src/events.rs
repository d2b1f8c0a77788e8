//! Notifications from the tunnel layer to its embedding application.
//!
//! Components hold an [`EventSender`]; the application drains the matching
//! [`EventReceiver`] on whatever task it likes, so nothing in the tunnel
//! layer ever runs application code on its own tasks.

use bytes::BytesMut;
use peerlink_core::transport::PeerId;
use std::io;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Number of distinct local UDP clients seen by the relay side
    ClientCountChanged(usize),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    /// A peer's hello failed the version or password gate
    ClientBlocked { peer: PeerId, version: String },
    /// Identity-addressed message that is not part of the handshake
    PeerMessage { peer: PeerId, data: BytesMut },
}

#[derive(Clone)]
pub struct EventSender {
    sender: flume::Sender<Event>,
}

impl EventSender {
    /// Sender whose events go nowhere.
    pub fn discard() -> Self {
        let (sender, _) = flume::unbounded();
        Self { sender }
    }
    pub(crate) fn send(&self, event: Event) {
        if self.sender.send(event).is_err() {
            log::trace!("event receiver dropped");
        }
    }
}

pub struct EventReceiver {
    receiver: flume::Receiver<Event>,
}

impl EventReceiver {
    pub async fn recv(&self) -> io::Result<Event> {
        self.receiver
            .recv_async()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "shutdown"))
    }
    pub fn try_recv(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
    pub fn drain(&self) -> Vec<Event> {
        self.receiver.drain().collect()
    }
}

pub fn channel() -> (EventSender, EventReceiver) {
    let (sender, receiver) = flume::unbounded();
    (EventSender { sender }, EventReceiver { receiver })
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_channel() {
        let (sender, receiver) = channel();
        sender.send(Event::PeerJoined(7.into()));
        sender.clone().send(Event::ClientCountChanged(1));
        assert_eq!(receiver.recv().await.unwrap(), Event::PeerJoined(7.into()));
        assert_eq!(receiver.drain(), vec![Event::ClientCountChanged(1)]);
        assert!(receiver.try_recv().is_none());
        drop(sender);
        assert!(receiver.recv().await.is_err());
    }

    #[test]
    fn test_discard() {
        EventSender::discard().send(Event::PeerLeft(1.into()));
    }
}
