pub mod tbf;

use thiserror::Error;

use crate::tbf::{FrameError, RawTbfFrame};

#[derive(Error, Debug)]
pub enum ReadError {
    /// The frame read from the input isn't valid. Subsequent frames may still
    /// be fine.
    #[error("{name}: malformed frame: {source}")]
    Malformed {
        name: String,
        #[source]
        source: FrameError,
    },

    #[error("{name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

pub trait FrameRead: Send {
    /// Read the next frame. `Ok(None)` means there is nothing left to read.
    fn read_frame(&mut self) -> Result<Option<RawTbfFrame>, ReadError>;

    /// A human-readable name for this input (e.g. a file name).
    fn name(&self) -> &str;
}
