//! Broadcast-based shutdown signaling for pipeline workers.
//!
//! A single [`ShutdownTx`] fans out to any number of [`ShutdownRx`] receivers through a
//! watch channel. Receivers either await the signal or poll for it at batch boundaries,
//! so workers stop at well-defined points instead of mid-operation.

use tokio::sync::watch;

/// Result of an operation that can be interrupted by a shutdown signal.
///
/// Operations that observe shutdown mid-flight return [`ShutdownResult::Shutdown`]
/// carrying whatever partial state the caller still needs, for example the rows that
/// were buffered but never dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult<T, E> {
    Ok(T),
    Shutdown(E),
}

/// Transmitter side of the shutdown channel.
///
/// Cloning is cheap and all clones signal the same set of receivers.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<()>);

impl ShutdownTx {
    /// Sends the shutdown signal to all subscribed receivers.
    ///
    /// Fails when every receiver has already been dropped, in which case there is
    /// nobody left to stop.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    /// Creates a new receiver subscribed to this transmitter.
    ///
    /// Receivers must be subscribed before the signal is sent. A receiver created
    /// afterwards starts with the signal already marked as seen.
    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Receiver side of the shutdown channel.
pub type ShutdownRx = watch::Receiver<()>;

/// Creates a new shutdown channel.
///
/// The channel starts unsignaled. Receivers see a change only once
/// [`ShutdownTx::shutdown`] is called.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());

    (ShutdownTx(tx), rx)
}
