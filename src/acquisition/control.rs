//! Synchronous command/acknowledge channel between the control thread and
//! the acquisition worker
//!
//! Both directions are single-slot crossbeam channels. The control side
//! sends one [`ControlRequest`] and blocks for exactly one [`Acknowledge`];
//! the worker polls for requests between device reads and blocks on them
//! while paused or while the device is lent out.
//!
//! The device handle travels inside the messages: the acknowledge of
//! `Acquire` carries it to the control thread and `Release` carries it back,
//! so only one side can touch the device at a time.

use crate::device::ReadoutDevice;
use crate::error::{ReadoutError, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

/// Request from the control thread to the acquisition worker
pub enum ControlRequest {
    /// Stop acquisition and lend the device to the control thread
    Acquire,
    /// Return the lent device; acquisition restarts
    Release(Box<dyn ReadoutDevice>),
    /// Stop acquisition and emit a Pause marker
    Pause,
    /// Restart a paused acquisition
    Resume,
    /// Stop, drain, emit an End marker and exit
    End,
}

impl ControlRequest {
    /// Short name for logs and protocol errors
    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::Acquire => "Acquire",
            ControlRequest::Release(_) => "Release",
            ControlRequest::Pause => "Pause",
            ControlRequest::Resume => "Resume",
            ControlRequest::End => "End",
        }
    }
}

impl std::fmt::Debug for ControlRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reply from the worker; exactly one per request
pub enum Acknowledge {
    /// Request carried out
    Done,
    /// Acquire carried out; the device is now owned by the receiver
    Device(Box<dyn ReadoutDevice>),
}

impl std::fmt::Debug for Acknowledge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acknowledge::Done => f.write_str("Done"),
            Acknowledge::Device(device) => write!(f, "Device({})", device.name()),
        }
    }
}

/// Create a connected client/server pair over single-slot queues
pub fn channel() -> (ControlClient, ControlServer) {
    let (request_tx, request_rx) = bounded(1);
    let (ack_tx, ack_rx) = bounded(1);
    (
        ControlClient { request_tx, ack_rx },
        ControlServer { request_rx, ack_tx },
    )
}

/// Control-thread end of the channel
#[derive(Debug)]
pub struct ControlClient {
    request_tx: Sender<ControlRequest>,
    ack_rx: Receiver<Acknowledge>,
}

impl ControlClient {
    /// Post a request
    pub fn send(&self, request: ControlRequest) -> Result<()> {
        let name = request.name();
        self.request_tx.send(request).map_err(|_| {
            ReadoutError::Channel(format!("worker gone before {} could be sent", name))
        })
    }

    /// Block for the acknowledge of the last request
    ///
    /// Waits as long as the worker is alive; every reply must be consumed
    /// by the request that caused it. A worker that exits drops its end and
    /// the wait ends with a channel error.
    pub fn await_acknowledge(&self) -> Result<Acknowledge> {
        self.ack_rx.recv().map_err(|_| {
            ReadoutError::Channel("worker exited without acknowledging".to_string())
        })
    }

    /// Send a request and wait for its acknowledge
    pub fn request(&self, request: ControlRequest) -> Result<Acknowledge> {
        self.send(request)?;
        self.await_acknowledge()
    }
}

/// Worker end of the channel
#[derive(Debug)]
pub struct ControlServer {
    request_rx: Receiver<ControlRequest>,
    ack_tx: Sender<Acknowledge>,
}

impl ControlServer {
    /// Poll for a pending request without blocking
    ///
    /// A disconnected client is reported as an error: the control side is
    /// gone and the run has no owner.
    pub fn try_receive(&self) -> Result<Option<ControlRequest>> {
        match self.request_rx.try_recv() {
            Ok(request) => Ok(Some(request)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ReadoutError::Channel(
                "control client disconnected".to_string(),
            )),
        }
    }

    /// Block until a request arrives
    pub fn receive(&self) -> Result<ControlRequest> {
        self.request_rx
            .recv()
            .map_err(|_| ReadoutError::Channel("control client disconnected".to_string()))
    }

    /// Reply to the request being handled
    pub fn acknowledge(&self, ack: Acknowledge) -> Result<()> {
        self.ack_tx
            .send(ack)
            .map_err(|_| ReadoutError::Channel("control client disconnected".to_string()))
    }
}
