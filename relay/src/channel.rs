//! Handle to an attached bridge channel.

use tokio::sync::mpsc;

/// Unique channel identifier
pub type ChannelId = uuid::Uuid;

/// Outbound messages buffered per channel before senders wait
pub const OUTBOUND_CAPACITY: usize = 100;

/// Cloneable handle held by the registry and by in-flight requests.
/// The connection task owns the matching receiver and the socket.
#[derive(Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    tx: mpsc::Sender<String>,
    opened_at: std::time::Instant,
}

impl ChannelHandle {
    pub fn open(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            id: uuid::Uuid::new_v4(),
            tx,
            opened_at: std::time::Instant::now(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn opened_at(&self) -> std::time::Instant {
        self.opened_at
    }

    /// False once the connection task has stopped reading outbound messages
    pub fn is_writable(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue one text message for the bridge
    pub async fn send(&self, text: String) -> Result<(), mpsc::error::SendError<String>> {
        self.tx.send(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_receiver_is_not_writable() {
        let (handle, mut rx) = ChannelHandle::open(4);
        assert!(handle.is_writable());
        handle.send("hello".into()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));

        rx.close();
        assert!(!handle.is_writable());
        assert!(handle.send("late".into()).await.is_err());
    }
}
