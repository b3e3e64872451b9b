//! Protocol definition for the camera data socket.
//!
use serde::{Deserialize, Serialize};

/// Definition of protocol messages.
///
/// A camera connection starts with exactly one `Hello` and continues with
/// any number of `Frame` messages.
#[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ProtoMsg {
    Hello(CameraInfo),
    Frame(FrameMsg),
}

/// Announcement of a camera when it connects.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CameraInfo {
    pub name: String,
    /// Human readable description of the capture source, e.g. device and format.
    pub description: String,
}

/// One JPEG encoded camera frame.
#[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FrameMsg {
    pub seq: u64,
    pub jpeg: Vec<u8>,
}

impl FrameMsg {
    pub fn new(seq: u64, jpeg: Vec<u8>) -> Self {
        Self { seq, jpeg }
    }
}

impl ProtoMsg {
    pub fn serialize(&self) -> Result<Vec<u8>, Box<bincode::ErrorKind>> {
        bincode::serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, Box<bincode::ErrorKind>> {
        bincode::deserialize(bytes)
    }
}
