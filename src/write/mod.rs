use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crossbeam_channel::Receiver;
use crossbeam_utils::atomic::AtomicCell;
use indicatif::ProgressBar;
use log::{debug, trace};
use thiserror::Error;

use crate::{buffer::FrameSet, tbf::RawTbfFrame};

#[derive(Error, Debug)]
#[error("Couldn't write to {path}: {source}")]
pub struct WriteError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// What [`write_frames`] wrote.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub sets: u64,
    pub frames: u64,
    pub fill_frames: u64,
    pub bytes: u64,
}

/// Create `output` and write every frame of every set received on `rx` to it,
/// in the order received. Fill frames are written exactly like real frames.
///
/// This function is intended to be run concurrently with the thread reading
/// frames. If `error` becomes `true`, another thread has failed and writing
/// stops early. If writing fails here, `error` is set before returning.
pub fn write_frames(
    output: &Path,
    rx: Receiver<FrameSet<RawTbfFrame>>,
    error: &AtomicCell<bool>,
    progress_bar: Option<ProgressBar>,
) -> Result<WriteSummary, WriteError> {
    let result = write_frames_inner(output, rx, error, progress_bar.as_ref());
    if result.is_err() {
        error.store(true);
    }
    if let Some(progress_bar) = progress_bar.as_ref() {
        progress_bar.abandon_with_message("Finished writing frames");
    }
    result.map_err(|source| WriteError {
        path: output.to_path_buf(),
        source,
    })
}

fn write_frames_inner(
    output: &Path,
    rx: Receiver<FrameSet<RawTbfFrame>>,
    error: &AtomicCell<bool>,
    progress_bar: Option<&ProgressBar>,
) -> Result<WriteSummary, std::io::Error> {
    debug!("Setting up {}", output.display());
    let mut writer = BufWriter::new(File::create(output)?);
    let mut summary = WriteSummary::default();

    for set in rx.iter() {
        // Should we continue?
        if error.load() {
            return Ok(summary);
        }

        trace!(
            "Writing key {} ({} frames, {} filled)",
            set.key,
            set.frames.len(),
            set.filled.len()
        );
        for frame in &set.frames {
            writer.write_all(frame.as_bytes())?;
            summary.bytes += frame.as_bytes().len() as u64;
        }
        summary.sets += 1;
        summary.frames += set.frames.len() as u64;
        summary.fill_frames += set.filled.len() as u64;

        if let Some(progress_bar) = progress_bar {
            progress_bar.inc(1);
        }
    }

    writer.flush()?;
    debug!("Finished writing");
    Ok(summary)
}
