//! Firmware bring-up seam
//!
//! Installing the coprocessor image and starting it is platform work outside
//! the host control plane. The host only needs the firmware running with its
//! end of the IPC link up before `init` performs the queue handshake.

use crate::error::Result;
use crate::ipc::IpcChannel;
use crate::protocol::PacketCodec;
use std::fmt::Debug;
use std::sync::Arc;

/// Installs and starts (or stops) the coprocessor firmware
pub trait FirmwareLoader: Debug + Send {
    /// Install the image and start the coprocessor
    ///
    /// On success the firmware owns the command side of `ipc` and has
    /// brought the link up.
    ///
    /// # Errors
    ///
    /// Returns error if the image cannot be installed or the core fails to boot.
    fn boot(&mut self, ipc: &Arc<IpcChannel>, codec: &Arc<dyn PacketCodec>) -> Result<()>;

    /// Stop the coprocessor; the link goes down
    fn shutdown(&mut self, ipc: &IpcChannel);

    /// Whether the coprocessor is running
    fn is_running(&self) -> bool;
}
