//! Combine TBF files written by the on-line triggering system into a single
//! file that can be used like a standard DR-recorded TBF file.
//!
//! Each input file carries a subset of the frequency channels. Frames are read
//! from all of the files in turn, gathered into complete sets (one frame per
//! channel block per time tag) by a [`ReorderFillBuffer`] and written out in
//! time order.

use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    thread,
};

use crossbeam_channel::{bounded, Sender};
use crossbeam_utils::atomic::AtomicCell;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use log::{debug, info, warn};
use thiserror::Error;
use vec1::Vec1;

use crate::{
    buffer::{
        BufferError, BufferStats, ChannelId, FrameSet, ReorderFillBuffer, DEFAULT_WINDOW_DEPTH,
    },
    read::{tbf::TbfReader, FrameRead, ReadError},
    tbf::{RawTbfFrame, CHANNELS_PER_FRAME, FRAME_SIZE},
    write::{write_frames, WriteError, WriteSummary},
};

/// The default number of frames to read from the start of each file when
/// working out which channels it carries.
pub const DEFAULT_SCAN_FRAMES: usize = 256;

/// The number of sets that can be in flight between the reading and writing
/// threads.
const CHANNEL_CAPACITY: usize = 64;

/// What to do when a set of frames can't be filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum)]
pub enum GapPolicy {
    /// Stop with an error.
    Abort,
    /// Leave the set out of the output and carry on.
    Skip,
    /// Stop reading and keep everything written before the gap.
    Truncate,
}

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("Unexpected channel increment: {got} != {expected}")]
    ChannelIncrement { expected: u32, got: u32 },

    #[error("No valid frames were found in {0}")]
    NoChannels(String),

    #[error("Couldn't work out an output file name from the inputs; please specify one with --output")]
    NoOutputName,

    #[error("Refusing to overwrite the input file {0}")]
    OutputIsInput(PathBuf),

    #[error("{0}\nUse '--on-gap skip' or '--on-gap truncate' to carry on past gaps")]
    Gap(#[source] BufferError),

    #[error("The {0} thread panicked")]
    Panicked(&'static str),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Write(#[from] WriteError),
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// The TBF files to combine.
    pub inputs: Vec1<PathBuf>,

    /// Where to write the combined file. If not given, a name is derived from
    /// the inputs with [`common_output_name`].
    pub output: Option<PathBuf>,

    /// The number of time tags held while waiting for frames.
    pub window_depth: usize,

    /// Sort each set of frames by channel before writing.
    pub reorder: bool,

    pub gap_policy: GapPolicy,

    /// The number of frames to scan at the start of each file for channels.
    pub scan_frames: usize,

    /// If set, don't fill from a frame more than this many time tag ticks
    /// older than the gap.
    pub max_template_age: Option<u64>,

    pub progress_bars: bool,
}

impl MuxConfig {
    pub fn new(inputs: Vec1<PathBuf>) -> MuxConfig {
        MuxConfig {
            inputs,
            output: None,
            window_depth: DEFAULT_WINDOW_DEPTH,
            reorder: false,
            gap_policy: GapPolicy::Abort,
            scan_frames: DEFAULT_SCAN_FRAMES,
            max_template_age: None,
            progress_bars: false,
        }
    }
}

/// Everything that happened during [`run_mux`].
#[derive(Debug, Clone)]
pub struct MuxSummary {
    pub output: PathBuf,
    pub channels: Vec<u16>,
    pub frames_read: u64,
    pub malformed_frames: u64,
    pub skipped_gaps: u64,
    pub truncated: bool,
    pub buffer: BufferStats,
    pub written: WriteSummary,
}

#[derive(Debug, Default)]
struct ReadSummary {
    frames_read: u64,
    malformed_frames: u64,
    skipped_gaps: u64,
    truncated: bool,
    buffer: BufferStats,
}

/// Check that sorted first channels are all spaced by exactly one frame's
/// worth of channels.
pub fn check_channel_spacing(chans: &[u16]) -> Result<(), MuxError> {
    for (&a, &b) in chans.iter().tuple_windows() {
        let got = u32::from(b).saturating_sub(u32::from(a));
        if got != CHANNELS_PER_FRAME {
            return Err(MuxError::ChannelIncrement {
                expected: CHANNELS_PER_FRAME,
                got,
            });
        }
    }
    Ok(())
}

/// Derive an output file name from the longest common suffix of the input
/// file names, without a leading underscore. e.g. "a_055123_000.tbf" and
/// "b_055123_000.tbf" give "055123_000.tbf". A single input has nothing to
/// compare against, so no name is derived for it.
pub fn common_output_name(inputs: &[PathBuf]) -> Option<PathBuf> {
    let names = inputs
        .iter()
        .map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect::<Option<Vec<_>>>()?;
    let (first, rest) = names.split_first()?;

    let common_len = rest
        .iter()
        .map(|name| {
            first
                .chars()
                .rev()
                .zip(name.chars().rev())
                .take_while(|(a, b)| a == b)
                .count()
        })
        .min()?;
    let suffix: String = first
        .chars()
        .skip(first.chars().count() - common_len)
        .collect();
    let suffix = suffix.strip_prefix('_').unwrap_or(&suffix);

    if suffix.is_empty() {
        None
    } else {
        Some(PathBuf::from(suffix))
    }
}

/// Is `output` the same file as any of `inputs`?
fn is_an_input(output: &Path, inputs: &[PathBuf]) -> bool {
    let output = match output.canonicalize() {
        Ok(o) => o,
        // If it doesn't exist, it can't be an input.
        Err(_) => return false,
    };
    inputs
        .iter()
        .filter_map(|i| i.canonicalize().ok())
        .any(|i| i == output)
}

fn progress_bar(
    multi_progress: &MultiProgress,
    len: u64,
    template: &str,
    msg: &'static str,
) -> ProgressBar {
    let style = ProgressStyle::default_bar()
        .template(template)
        .map(|s| s.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let bar = multi_progress.add(
        ProgressBar::new(len)
            .with_style(style)
            .with_position(0)
            .with_message(msg),
    );
    bar.tick();
    bar
}

/// Combine the TBF files described by `config` into one.
pub fn run_mux(config: &MuxConfig) -> Result<MuxSummary, MuxError> {
    let mut inputs = config.inputs.to_vec();
    inputs.sort_unstable();

    // Open them up and make sure we have a continuous range of frequencies.
    let mut readers = Vec::with_capacity(inputs.len());
    let mut chans = vec![];
    let mut total_bytes = 0;
    for input in &inputs {
        let mut reader = TbfReader::open(input)?;
        let file_chans = reader.discover_channels(config.scan_frames)?;
        if file_chans.is_empty() {
            return Err(MuxError::NoChannels(input.display().to_string()));
        }
        info!(
            "{}: channels {}",
            input.display(),
            file_chans.iter().join(", ")
        );
        chans.extend(file_chans);
        total_bytes += std::fs::metadata(input).map(|m| m.len()).unwrap_or(0);
        readers.push(reader);
    }
    chans.sort_unstable();
    check_channel_spacing(&chans)?;
    let channels = chans.iter().map(|&c| ChannelId::from(c)).collect();
    let channels = match Vec1::try_from_vec(channels) {
        Ok(c) => c,
        Err(_) => return Err(MuxError::NoChannels("any input".to_string())),
    };

    let output = match config.output.as_ref() {
        Some(o) => o.clone(),
        None => common_output_name(&inputs).ok_or(MuxError::NoOutputName)?,
    };
    if is_an_input(&output, &inputs) {
        return Err(MuxError::OutputIsInput(output));
    }
    info!("Writing combined file to '{}'", output.display());

    // Setup the buffer.
    let mut buffer = ReorderFillBuffer::new(channels, config.window_depth, config.reorder)?;
    if let Some(max_age) = config.max_template_age {
        buffer = buffer.with_max_template_age(max_age);
    }
    debug!(
        "Buffering {} channel blocks over {} time tags",
        buffer.channels().len(),
        buffer.window_depth()
    );

    let multi_progress = MultiProgress::with_draw_target(if config.progress_bars {
        ProgressDrawTarget::stdout()
    } else {
        ProgressDrawTarget::hidden()
    });
    let read_progress = progress_bar(
        &multi_progress,
        total_bytes,
        "{msg:17}: [{wide_bar:.blue}] {bytes}/{total_bytes} ({elapsed_precise}<{eta_precise})",
        "Reading",
    );
    let write_progress = progress_bar(
        &multi_progress,
        total_bytes / FRAME_SIZE as u64 / chans.len().max(1) as u64,
        "{msg:17}: [{wide_bar:.blue}] {pos}/{len} sets ({elapsed_precise}<{eta_precise})",
        "Writing",
    );

    let (tx, rx) = bounded(CHANNEL_CAPACITY);
    let error = AtomicCell::new(false);
    let error = &error;
    let gap_policy = config.gap_policy;
    let output_ref = &output;

    let (read_result, write_result) = thread::scope(|s| {
        let reader = s.spawn(move || {
            read_into_buffer(readers, buffer, tx, error, gap_policy, read_progress)
        });
        let writer = s.spawn(move || write_frames(output_ref, rx, error, Some(write_progress)));
        (reader.join(), writer.join())
    });

    let read_summary = read_result.map_err(|_| MuxError::Panicked("reading"))??;
    let written = write_result.map_err(|_| MuxError::Panicked("writing"))??;

    Ok(MuxSummary {
        output,
        channels: chans,
        frames_read: read_summary.frames_read,
        malformed_frames: read_summary.malformed_frames,
        skipped_gaps: read_summary.skipped_gaps,
        truncated: read_summary.truncated,
        buffer: read_summary.buffer,
        written,
    })
}

fn read_into_buffer(
    readers: Vec<TbfReader<BufReader<File>>>,
    buffer: ReorderFillBuffer<RawTbfFrame>,
    tx: Sender<FrameSet<RawTbfFrame>>,
    error: &AtomicCell<bool>,
    gap_policy: GapPolicy,
    progress_bar: ProgressBar,
) -> Result<ReadSummary, MuxError> {
    let result = read_into_buffer_inner(readers, buffer, tx, error, gap_policy, &progress_bar);
    if result.is_err() {
        error.store(true);
    }
    progress_bar.abandon_with_message("Finished reading");
    result
}

/// Decide what to do about a set that couldn't be filled. Returns the key to
/// truncate the output at, if any.
fn handle_gap(
    e: BufferError,
    gap_policy: GapPolicy,
    summary: &mut ReadSummary,
) -> Result<Option<u64>, MuxError> {
    let key = match e {
        BufferError::NoTemplateAvailable { key, .. } | BufferError::StaleTemplate { key, .. } => key,
        e => return Err(e.into()),
    };
    match gap_policy {
        GapPolicy::Abort => Err(MuxError::Gap(e)),
        GapPolicy::Skip => {
            warn!("Skipping time tag {key}: {e}");
            summary.skipped_gaps += 1;
            Ok(None)
        }
        GapPolicy::Truncate => {
            warn!("Truncating the output at time tag {key}: {e}");
            Ok(Some(key))
        }
    }
}

/// [`handle_gap`] for each of `errors` in turn, stopping at the first one
/// that truncates the output.
fn handle_gaps(
    errors: Vec1<BufferError>,
    gap_policy: GapPolicy,
    summary: &mut ReadSummary,
) -> Result<Option<u64>, MuxError> {
    for e in errors {
        if let Some(key) = handle_gap(e, gap_policy, summary)? {
            return Ok(Some(key));
        }
    }
    Ok(None)
}

fn read_into_buffer_inner(
    mut readers: Vec<TbfReader<BufReader<File>>>,
    mut buffer: ReorderFillBuffer<RawTbfFrame>,
    tx: Sender<FrameSet<RawTbfFrame>>,
    error: &AtomicCell<bool>,
    gap_policy: GapPolicy,
    progress_bar: &ProgressBar,
) -> Result<ReadSummary, MuxError> {
    let mut summary = ReadSummary::default();
    let mut eof_found = vec![false; readers.len()];
    let mut first_frame = true;

    while !eof_found.iter().all(|&eof| eof) {
        // Should we continue?
        if error.load() {
            return Ok(summary);
        }

        // Read in a frame from all input files.
        let mut frames = Vec::with_capacity(readers.len());
        for (reader, eof) in readers.iter_mut().zip(eof_found.iter_mut()) {
            if *eof {
                continue;
            }
            match reader.read_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => {
                    debug!("{}: end of file", reader.name());
                    *eof = true;
                    continue;
                }
                Err(ReadError::Malformed { name, source }) => {
                    debug!("{name}: skipping frame: {source}");
                    summary.malformed_frames += 1;
                }
                Err(e) => return Err(e.into()),
            }
            progress_bar.inc(FRAME_SIZE as u64);
        }
        summary.frames_read += frames.len() as u64;
        if first_frame {
            if let Some(frame) = frames.first() {
                info!(
                    "First time tag: {} ({})",
                    frame.timetag(),
                    frame.epoch()
                );
                first_frame = false;
            }
        }

        // Add the frames to the buffer and send on anything that's ready.
        let truncate_at = match buffer.insert(frames) {
            Ok(()) => None,
            Err(errors) => handle_gaps(errors, gap_policy, &mut summary)?,
        };
        while let Some(set) = buffer.pop_complete() {
            if matches!(truncate_at, Some(key) if set.key > key) {
                break;
            }
            if tx.send(set).is_err() {
                // The writer has gone away; it reports its own error.
                return Ok(summary);
            }
        }
        if truncate_at.is_some() {
            summary.truncated = true;
            break;
        }
    }

    // Empty the buffer.
    if !summary.truncated {
        let mut gaps = vec![];
        for set in buffer.drain() {
            match set {
                Ok(set) => {
                    if tx.send(set).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    gaps.push(e);
                    if gap_policy != GapPolicy::Skip {
                        break;
                    }
                }
            }
        }
        for e in gaps {
            if handle_gap(e, gap_policy, &mut summary)?.is_some() {
                summary.truncated = true;
            }
        }
    }

    summary.buffer = buffer.stats();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::{tempdir, TempDir};
    use vec1::vec1;

    use super::*;
    use crate::{buffer::BufferedFrame, tbf::tests::make_frame};

    fn write_file(dir: &TempDir, name: &str, frames: &[RawTbfFrame]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        for frame in frames {
            f.write_all(frame.as_bytes()).unwrap();
        }
        path
    }

    fn read_output(path: &Path) -> Vec<RawTbfFrame> {
        std::fs::read(path)
            .unwrap()
            .chunks(FRAME_SIZE)
            .map(|c| RawTbfFrame::from_bytes(c.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_channel_spacing() {
        assert!(check_channel_spacing(&[]).is_ok());
        assert!(check_channel_spacing(&[100]).is_ok());
        assert!(check_channel_spacing(&[100, 112, 124]).is_ok());
        assert!(matches!(
            check_channel_spacing(&[100, 112, 136]),
            Err(MuxError::ChannelIncrement {
                expected: 12,
                got: 24
            })
        ));
        assert!(matches!(
            check_channel_spacing(&[100, 100]),
            Err(MuxError::ChannelIncrement { got: 0, .. })
        ));
    }

    #[test]
    fn test_common_output_name() {
        let names = [
            PathBuf::from("/data/adp1_055123_000.tbf"),
            PathBuf::from("adp2_055123_000.tbf"),
        ];
        assert_eq!(
            common_output_name(&names),
            Some(PathBuf::from("055123_000.tbf"))
        );

        let names = [PathBuf::from("abc"), PathBuf::from("xyz")];
        assert_eq!(common_output_name(&names), None);

        let names = [PathBuf::from("a_b"), PathBuf::from("c_b")];
        assert_eq!(common_output_name(&names), Some(PathBuf::from("b")));

        assert_eq!(common_output_name(&[]), None);
        assert_eq!(
            common_output_name(&[PathBuf::from("/data/adp1_055123_000.tbf")]),
            None
        );
    }

    #[test]
    fn test_mux_single_input_needs_output() {
        let dir = tempdir().unwrap();
        let file = write_file(&dir, "adp1_obs.tbf", &[make_frame(1, 12)]);
        let config = MuxConfig::new(vec1![file]);
        assert!(matches!(run_mux(&config), Err(MuxError::NoOutputName)));
    }

    #[test]
    fn test_mux_skips_every_gap_in_a_round() {
        let dir = tempdir().unwrap();
        // Channel 36 only turns up in the third round, so with a depth-1
        // window the second and third rounds each force out two keys that
        // can't be filled.
        let file1 = write_file(
            &dir,
            "a.tbf",
            &[make_frame(1, 12), make_frame(3, 12), make_frame(5, 12)],
        );
        let file2 = write_file(
            &dir,
            "b.tbf",
            &[make_frame(2, 24), make_frame(4, 24), make_frame(6, 24)],
        );
        let mut junk = make_frame(0, 36).as_bytes().to_vec();
        junk[0] = 0;
        let file3 = dir.path().join("c.tbf");
        let mut f = File::create(&file3).unwrap();
        f.write_all(&junk).unwrap();
        f.write_all(&junk).unwrap();
        f.write_all(make_frame(7, 36).as_bytes()).unwrap();
        drop(f);

        let mut config = MuxConfig::new(vec1![file1, file2, file3]);
        config.output = Some(dir.path().join("out.tbf"));
        config.window_depth = 1;
        config.gap_policy = GapPolicy::Skip;
        let summary = run_mux(&config).unwrap();

        assert_eq!(summary.buffer.gaps, 5);
        assert_eq!(summary.skipped_gaps, 5);
        assert_eq!(summary.written.sets, 2);
        let keys: Vec<u64> = read_output(config.output.as_ref().unwrap())
            .iter()
            .map(|f| f.timetag())
            .dedup()
            .collect();
        assert_eq!(keys, vec![6, 7]);
    }

    #[test]
    fn test_mux_two_files() {
        let dir = tempdir().unwrap();
        // File 1 has channel blocks 100 and 112, file 2 has 124. Time tag 3000
        // is missing channel 112 and time tag 2000 is out of order.
        let file1 = write_file(
            &dir,
            "a_obs.tbf",
            &[
                make_frame(1000, 100),
                make_frame(1000, 112),
                make_frame(3000, 100),
                make_frame(2000, 100),
                make_frame(2000, 112),
            ],
        );
        let file2 = write_file(
            &dir,
            "b_obs.tbf",
            &[
                make_frame(1000, 124),
                make_frame(2000, 124),
                make_frame(3000, 124),
            ],
        );
        let output = dir.path().join("combined.tbf");

        let mut config = MuxConfig::new(vec1![file2, file1]);
        config.output = Some(output.clone());
        config.reorder = true;
        let summary = run_mux(&config).unwrap();

        assert_eq!(summary.channels, vec![100, 112, 124]);
        assert_eq!(summary.frames_read, 8);
        assert_eq!(summary.written.sets, 3);
        assert_eq!(summary.written.fill_frames, 1);
        assert!(!summary.truncated);

        let frames = read_output(&output);
        let ids: Vec<(u64, u16)> = frames
            .iter()
            .map(|f| (f.timetag(), f.first_chan()))
            .collect();
        assert_eq!(
            ids,
            vec![
                (1000, 100),
                (1000, 112),
                (1000, 124),
                (2000, 100),
                (2000, 112),
                (2000, 124),
                (3000, 100),
                (3000, 112),
                (3000, 124),
            ]
        );
        // The fill frame.
        assert!(frames[7].payload().iter().all(|&b| b == 0));
        assert_eq!(frames[7], make_frame(2000, 112).to_fill(3000, 112));
    }

    #[test]
    fn test_mux_skips_malformed_frames() {
        let dir = tempdir().unwrap();
        let mut bad = make_frame(1000, 12).as_bytes().to_vec();
        bad[0] = 0;
        let path = dir.path().join("x_obs.tbf");
        let mut f = File::create(&path).unwrap();
        f.write_all(make_frame(1000, 12).as_bytes()).unwrap();
        f.write_all(&bad).unwrap();
        f.write_all(make_frame(2000, 12).as_bytes()).unwrap();
        drop(f);

        let output = dir.path().join("out.tbf");
        let mut config = MuxConfig::new(vec1![path]);
        config.output = Some(output.clone());
        let summary = run_mux(&config).unwrap();
        assert_eq!(summary.malformed_frames, 1);
        assert_eq!(summary.frames_read, 2);
        assert_eq!(read_output(&output).len(), 2);
    }

    #[test]
    fn test_mux_gap_policies() {
        let dir = tempdir().unwrap();
        // Channel 24's file starts with two junk frames, so keys 1 and 2 are
        // forced out of a depth-1 window before anything is known about it.
        let file1 = write_file(
            &dir,
            "a.tbf",
            &[make_frame(1, 12), make_frame(2, 12), make_frame(5, 12)],
        );
        let mut junk = make_frame(0, 24).as_bytes().to_vec();
        junk[0] = 0;
        let file2 = dir.path().join("b.tbf");
        let mut f = File::create(&file2).unwrap();
        f.write_all(&junk).unwrap();
        f.write_all(&junk).unwrap();
        f.write_all(make_frame(5, 24).as_bytes()).unwrap();
        f.write_all(make_frame(6, 24).as_bytes()).unwrap();
        drop(f);

        let mut config = MuxConfig::new(vec1![file1, file2]);
        config.output = Some(dir.path().join("out.tbf"));
        config.window_depth = 1;
        match run_mux(&config) {
            Err(MuxError::Gap(BufferError::NoTemplateAvailable { channel, key })) => {
                assert_eq!(channel, 24);
                assert_eq!(key, 1);
            }
            other => panic!("expected a gap, got {other:?}"),
        }

        config.gap_policy = GapPolicy::Skip;
        let summary = run_mux(&config).unwrap();
        assert_eq!(summary.skipped_gaps, 2);
        assert_eq!(summary.malformed_frames, 2);
        // Time tag 5 is complete; 6 has channel 12 filled from time tag 5.
        let frames = read_output(config.output.as_ref().unwrap());
        let ids: Vec<(u64, u16)> = frames
            .iter()
            .map(|f| (f.timetag(), f.first_chan()))
            .collect();
        assert_eq!(ids, vec![(5, 12), (5, 24), (6, 24), (6, 12)]);
        assert_eq!(frames[3], make_frame(5, 12).to_fill(6, 12));

        config.gap_policy = GapPolicy::Truncate;
        let summary = run_mux(&config).unwrap();
        assert!(summary.truncated);
        assert_eq!(summary.written.sets, 0);
        assert!(read_output(config.output.as_ref().unwrap()).is_empty());
    }

    #[test]
    fn test_mux_refuses_to_overwrite_input() {
        let dir = tempdir().unwrap();
        let file = write_file(&dir, "a.tbf", &[make_frame(1, 12)]);
        let mut config = MuxConfig::new(vec1![file.clone()]);
        config.output = Some(file);
        assert!(matches!(
            run_mux(&config),
            Err(MuxError::OutputIsInput(_))
        ));
    }

    #[test]
    fn test_mux_bad_channel_spacing() {
        let dir = tempdir().unwrap();
        let file1 = write_file(&dir, "a.tbf", &[make_frame(1, 12)]);
        let file2 = write_file(&dir, "b.tbf", &[make_frame(1, 48)]);
        let mut config = MuxConfig::new(vec1![file1, file2]);
        config.output = Some(dir.path().join("out.tbf"));
        assert!(matches!(
            run_mux(&config),
            Err(MuxError::ChannelIncrement { got: 36, .. })
        ));
    }
}
