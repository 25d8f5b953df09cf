//! Frame and audio acquisition
//!
//! Camera and microphone backends sit behind capability traits and run in
//! their own contexts. Hand-off to the encoders goes through non-blocking
//! buffers so capture never stalls on a slow consumer.

pub mod buffer;
pub mod camera;
pub mod frame;
pub mod microphone;
pub mod source;
pub mod sync;

pub use buffer::{create_shared_buffer, latest_slot, RingBuffer, SharedRingBuffer, SlotReader, SlotWriter};
pub use camera::{CameraBackend, SyntheticCamera};
pub use frame::{AudioChunk, RawFrame};
pub use microphone::{AudioBackend, ToneGenerator};
#[cfg(feature = "microphone")]
pub use microphone::{list_input_devices, CpalMicrophone};
pub use source::{CaptureStats, FrameSource};
pub use sync::{FrameSynchronizer, SyncStats, SyncedFrame};
