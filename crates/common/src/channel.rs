//! Generic async/blocking mailbox bridge.
//!
//! The kernel device source reads udev's netlink socket synchronously, off
//! the Tokio runtime; the hypervisor workers speak QMP/crosvm over sockets
//! that are driven from async tasks. Both feed the same Orchestrator
//! mailbox. `mailbox::<T>()` gives each side a handle that works from
//! either context rather than forcing a single calling convention.

use async_channel::{Receiver, Sender, bounded};

/// Sending half of a mailbox. Cheap to clone; every producer gets its own.
#[derive(Debug)]
pub struct MailboxTx<T>(Sender<T>);

impl<T> Clone for MailboxTx<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Send + 'static> MailboxTx<T> {
    pub async fn send(&self, msg: T) -> crate::Result<()> {
        self.0
            .send(msg)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send from a blocking context (the udev monitor thread).
    pub fn send_blocking(&self, msg: T) -> crate::Result<()> {
        self.0
            .send_blocking(msg)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Receiving half of a mailbox.
#[derive(Debug)]
pub struct MailboxRx<T>(Receiver<T>);

impl<T: Send + 'static> MailboxRx<T> {
    pub async fn recv(&self) -> crate::Result<T> {
        self.0
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    pub fn recv_blocking(&self) -> crate::Result<T> {
        self.0
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

impl<T> Clone for MailboxRx<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Create a bounded mailbox with the given capacity.
pub fn mailbox<T: Send + 'static>(capacity: usize) -> (MailboxTx<T>, MailboxRx<T>) {
    let (tx, rx) = bounded(capacity);
    (MailboxTx(tx), MailboxRx(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn async_round_trip() {
        let (tx, rx) = mailbox::<u32>(4);
        tx.send(7).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), 7);
    }

    #[test]
    fn blocking_round_trip_from_thread() {
        let (tx, rx) = mailbox::<&'static str>(4);
        let handle = std::thread::spawn(move || rx.recv_blocking().unwrap());
        tx.send_blocking("hello").unwrap();
        assert_eq!(handle.join().unwrap(), "hello");
    }
}
