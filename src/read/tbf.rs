use std::{
    collections::BTreeSet,
    fs::File,
    io::{BufReader, ErrorKind, Read, Seek, SeekFrom},
    path::Path,
};

use log::{debug, warn};

use super::{FrameRead, ReadError};
use crate::tbf::{RawTbfFrame, FRAME_SIZE};

/// Reads raw TBF frames back to back from something.
pub struct TbfReader<R> {
    inner: R,
    name: String,
}

impl TbfReader<BufReader<File>> {
    /// Open a TBF file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<TbfReader<BufReader<File>>, ReadError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        debug!("Opening {name}");
        let file = File::open(path).map_err(|source| ReadError::Io {
            name: name.clone(),
            source,
        })?;
        Ok(TbfReader::new(BufReader::new(file), name))
    }
}

impl<R: Read> TbfReader<R> {
    pub fn new(inner: R, name: String) -> TbfReader<R> {
        TbfReader { inner, name }
    }

    fn io_error(&self, source: std::io::Error) -> ReadError {
        ReadError::Io {
            name: self.name.clone(),
            source,
        }
    }

    /// Read the next frame. A trailing partial frame is treated as the end of
    /// the input.
    pub fn next_frame(&mut self) -> Result<Option<RawTbfFrame>, ReadError> {
        let mut contents = vec![0; FRAME_SIZE];
        let num_read = self.read_full(&mut contents)?;
        if num_read == 0 {
            return Ok(None);
        }
        if num_read < FRAME_SIZE {
            warn!(
                "{}: ignoring {num_read} trailing bytes (a partial frame)",
                self.name
            );
            return Ok(None);
        }

        RawTbfFrame::from_bytes(contents)
            .map(Some)
            .map_err(|source| ReadError::Malformed {
                name: self.name.clone(),
                source,
            })
    }

    /// Fill `buf` as far as possible, returning the number of bytes read.
    /// Anything less than `buf.len()` means the input has ended.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        let mut num_read = 0;
        while num_read < buf.len() {
            match self.inner.read(&mut buf[num_read..]) {
                Ok(0) => break,
                Ok(n) => num_read += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(e)),
            }
        }
        Ok(num_read)
    }
}

impl<R: Read + Seek> TbfReader<R> {
    /// Work out which channels this input carries by looking at its first
    /// `max_frames` frames. Malformed frames are skipped. The reader is
    /// rewound afterwards.
    pub fn discover_channels(&mut self, max_frames: usize) -> Result<Vec<u16>, ReadError> {
        let mut chans = BTreeSet::new();
        for _ in 0..max_frames {
            match self.next_frame() {
                Ok(Some(frame)) => {
                    chans.insert(frame.first_chan());
                }
                Ok(None) => break,
                Err(ReadError::Malformed { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        self.inner
            .seek(SeekFrom::Start(0))
            .map_err(|e| self.io_error(e))?;

        debug!("{}: found channels {chans:?}", self.name);
        Ok(chans.into_iter().collect())
    }
}

impl<R: Read + Send> FrameRead for TbfReader<R> {
    fn read_frame(&mut self) -> Result<Option<RawTbfFrame>, ReadError> {
        self.next_frame()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
