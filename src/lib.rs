//! Reorder and gap-fill packetised frames from several channels, and combine
//! LWA TBF capture files with it.

pub mod buffer;
pub mod mux;
pub mod read;
pub mod tbf;
pub mod write;

pub use buffer::{
    BufferError, BufferStats, BufferedFrame, ChannelId, FrameSet, ReorderFillBuffer,
};
pub use mux::{run_mux, GapPolicy, MuxConfig, MuxError, MuxSummary};
pub use tbf::{FrameError, RawTbfFrame};
