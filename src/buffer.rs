//! A reordering buffer that gathers frames from a fixed set of channels into
//! complete, time-ordered sets.
//!
//! Frames can arrive out of order and some may never arrive at all. The buffer
//! holds up to `window_depth` distinct sequence keys. Once a new key would
//! push it past that depth, the oldest key is forced out and any channels
//! missing from it are synthesised as zero-filled "fill" frames, using the
//! most recent real frame seen on that channel as a template.
//!
//! The number of segments in the window maps onto a buffered latency of
//! `window_depth` times one frame's time span. For TBF data:
//!
//! | Segments | Time \[s\] |
//! |----------|------------|
//! | 10       | 0.0004     |
//! | 25       | 0.001      |
//! | 50       | 0.002      |
//! | 100      | 0.004      |
//! | 200      | 0.008      |
//!
//! Sequence keys are compared as plain unsigned integers. Keys must not wrap
//! around within `window_depth` of each other.

use std::collections::{BTreeMap, HashMap, VecDeque};

use log::{debug, trace, warn};
use thiserror::Error;
use vec1::Vec1;

/// The identifier of one of the buffer's channels.
pub type ChannelId = u32;

/// The default number of distinct sequence keys held by a buffer.
pub const DEFAULT_WINDOW_DEPTH: usize = 25;

/// Something that can be held in a [`ReorderFillBuffer`].
pub trait BufferedFrame: Clone {
    /// The ordering value for this frame (e.g. a time tag).
    fn sequence_key(&self) -> u64;

    /// The channel this frame belongs to.
    fn channel_id(&self) -> ChannelId;

    /// Make a fill frame from this frame. The returned frame must report
    /// `key` and `channel` as its identifiers and carry an all-zero payload.
    fn to_fill(&self, key: u64, channel: ChannelId) -> Self;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("The window depth must be at least 1")]
    InvalidWindowDepth,

    #[error("Channel {0} was specified more than once")]
    DuplicateChannel(ChannelId),

    /// A fill frame was needed for a channel that has never received a real
    /// frame.
    #[error("Cannot fill channel {channel} for key {key}; no frame has been seen for that channel")]
    NoTemplateAvailable { channel: ChannelId, key: u64 },

    /// The only template available for a channel is older than the
    /// configured maximum age.
    #[error("Cannot fill channel {channel} for key {key}; its newest frame (key {template_key}) is too old")]
    StaleTemplate {
        channel: ChannelId,
        key: u64,
        template_key: u64,
    },
}

/// A group of frames sharing a sequence key, one per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSet<F> {
    /// The sequence key common to all frames in this set.
    pub key: u64,

    /// One frame per configured channel.
    pub frames: Vec<F>,

    /// The channels whose frames were synthesised rather than received.
    pub filled: Vec<ChannelId>,
}

impl<F> FrameSet<F> {
    /// Were all of the frames in this set actually received?
    pub fn is_complete(&self) -> bool {
        self.filled.is_empty()
    }
}

/// Counters for everything the buffer has done. Conditions that the buffer
/// absorbs (rather than reports) show up only here and in the trace log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    /// Real frames accepted into the buffer.
    pub received: u64,
    /// Sets emitted without any fill frames.
    pub complete_sets: u64,
    /// Sets emitted with at least one fill frame.
    pub filled_sets: u64,
    /// Fill frames synthesised.
    pub fill_frames: u64,
    /// Frames dropped because their channel isn't configured.
    pub unknown_channel: u64,
    /// Frames dropped because their (key, channel) slot was already taken.
    pub duplicates: u64,
    /// Frames dropped because their key was already emitted.
    pub late: u64,
    /// Keys that could not be emitted because a fill frame couldn't be made.
    pub gaps: u64,
}

/// Frames for one pending key, in arrival order.
struct PendingSet<F> {
    frames: Vec<F>,
    /// Indexed by channel position; true if that channel has a frame.
    present: Vec<bool>,
}

impl<F> PendingSet<F> {
    fn new(num_channels: usize) -> PendingSet<F> {
        PendingSet {
            frames: Vec::with_capacity(num_channels),
            present: vec![false; num_channels],
        }
    }

    fn is_full(&self) -> bool {
        self.frames.len() == self.present.len()
    }
}

/// See the module documentation.
pub struct ReorderFillBuffer<F: BufferedFrame> {
    channels: Vec1<ChannelId>,
    /// Channel ID -> position in `channels`.
    channel_index: HashMap<ChannelId, usize>,
    window_depth: usize,
    reorder: bool,
    max_template_age: Option<u64>,

    pending: BTreeMap<u64, PendingSet<F>>,
    /// The most recently inserted real frame on each channel.
    templates: HashMap<ChannelId, F>,
    /// Sets forced out of the window but not yet handed to the caller.
    evicted: VecDeque<FrameSet<F>>,
    last_emitted: Option<u64>,
    stats: BufferStats,
}

impl<F: BufferedFrame> ReorderFillBuffer<F> {
    /// Create a new buffer expecting a frame from each of `channels` for every
    /// sequence key. If `reorder` is true, emitted sets are sorted by channel;
    /// otherwise received frames keep their arrival order and fill frames
    /// follow them.
    pub fn new(
        channels: Vec1<ChannelId>,
        window_depth: usize,
        reorder: bool,
    ) -> Result<ReorderFillBuffer<F>, BufferError> {
        if window_depth == 0 {
            return Err(BufferError::InvalidWindowDepth);
        }
        let mut channel_index = HashMap::with_capacity(channels.len());
        for (i, &chan) in channels.iter().enumerate() {
            if channel_index.insert(chan, i).is_some() {
                return Err(BufferError::DuplicateChannel(chan));
            }
        }

        Ok(ReorderFillBuffer {
            channels,
            channel_index,
            window_depth,
            reorder,
            max_template_age: None,
            pending: BTreeMap::new(),
            templates: HashMap::new(),
            evicted: VecDeque::new(),
            last_emitted: None,
            stats: BufferStats::default(),
        })
    }

    /// Refuse to use a template whose key is more than `max_age` behind the
    /// key being filled.
    pub fn with_max_template_age(mut self, max_age: u64) -> ReorderFillBuffer<F> {
        self.max_template_age = Some(max_age);
        self
    }

    pub fn channels(&self) -> &Vec1<ChannelId> {
        &self.channels
    }

    pub fn window_depth(&self) -> usize {
        self.window_depth
    }

    /// The number of distinct sequence keys currently pending. Sets that have
    /// already been forced out of the window but not yet handed out by
    /// [`ReorderFillBuffer::pop_complete`] aren't counted; see
    /// [`ReorderFillBuffer::num_ready`].
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// The number of sets forced out of the window and waiting to be popped.
    pub fn num_ready(&self) -> usize {
        self.evicted.len()
    }

    /// True if nothing is pending and nothing is waiting to be popped.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.evicted.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// Add frames to the buffer.
    ///
    /// Frames on unknown channels, duplicate frames and frames for keys that
    /// have already been emitted are dropped. If adding a frame pushes the
    /// buffer past its window depth, the oldest key is evicted (and filled if
    /// necessary). All frames are inserted even if an eviction fails; every
    /// failure is returned, oldest key first.
    pub fn insert<I: IntoIterator<Item = F>>(
        &mut self,
        frames: I,
    ) -> Result<(), Vec1<BufferError>> {
        let mut errors = vec![];
        for frame in frames {
            if !self.insert_one(frame) || self.pending.len() <= self.window_depth {
                continue;
            }

            match self.evict_oldest() {
                Some(Ok(set)) => self.evicted.push_back(set),
                Some(Err(e)) => errors.push(e),
                None => (),
            }
        }
        match Vec1::try_from_vec(errors) {
            Ok(errors) => Err(errors),
            Err(_) => Ok(()),
        }
    }

    /// Returns true if the frame was recorded.
    fn insert_one(&mut self, frame: F) -> bool {
        let key = frame.sequence_key();
        let chan = frame.channel_id();

        let i_chan = match self.channel_index.get(&chan) {
            Some(&i) => i,
            None => {
                trace!("Dropping frame for unknown channel {chan} (key {key})");
                self.stats.unknown_channel += 1;
                return false;
            }
        };
        if matches!(self.last_emitted, Some(last) if key <= last) {
            trace!("Dropping late frame for channel {chan} (key {key})");
            self.stats.late += 1;
            return false;
        }

        let num_channels = self.channels.len();
        let set = self
            .pending
            .entry(key)
            .or_insert_with(|| PendingSet::new(num_channels));
        if set.present[i_chan] {
            trace!("Dropping duplicate frame for channel {chan} (key {key})");
            self.stats.duplicates += 1;
            return false;
        }

        set.present[i_chan] = true;
        set.frames.push(frame.clone());
        self.templates.insert(chan, frame);
        self.stats.received += 1;
        true
    }

    /// Get the next set of frames, if one is ready. Sets that were forced out
    /// of the window come first; otherwise the oldest pending key is returned
    /// only if every channel has arrived for it.
    pub fn pop_complete(&mut self) -> Option<FrameSet<F>> {
        if let Some(set) = self.evicted.pop_front() {
            return Some(set);
        }

        let (_, oldest) = self.pending.first_key_value()?;
        if !oldest.is_full() {
            return None;
        }
        let (key, pending) = self.pending.pop_first()?;
        self.last_emitted = Some(key);
        self.stats.complete_sets += 1;
        Some(self.finish(key, pending.frames, vec![]))
    }

    /// Empty the buffer, filling any incomplete sets. Keys come out oldest
    /// first, each exactly once.
    pub fn drain(&mut self) -> Drain<'_, F> {
        Drain { buffer: self }
    }

    /// Remove the oldest pending key and fill in whatever channels it is
    /// missing. Returns `None` if nothing is pending.
    fn evict_oldest(&mut self) -> Option<Result<FrameSet<F>, BufferError>> {
        let (key, pending) = self.pending.pop_first()?;
        self.last_emitted = Some(key);
        Some(self.fill(key, pending))
    }

    fn fill(&mut self, key: u64, mut pending: PendingSet<F>) -> Result<FrameSet<F>, BufferError> {
        let mut filled = vec![];
        for (i_chan, &chan) in self.channels.iter().enumerate() {
            if pending.present[i_chan] {
                continue;
            }

            let template = match self.templates.get(&chan) {
                Some(t) => t,
                None => {
                    warn!("No template for channel {chan}; can't fill key {key}");
                    self.stats.gaps += 1;
                    return Err(BufferError::NoTemplateAvailable { channel: chan, key });
                }
            };
            if let Some(max_age) = self.max_template_age {
                let template_key = template.sequence_key();
                if key.saturating_sub(template_key) > max_age {
                    warn!("Template for channel {chan} (key {template_key}) is too old to fill key {key}");
                    self.stats.gaps += 1;
                    return Err(BufferError::StaleTemplate {
                        channel: chan,
                        key,
                        template_key,
                    });
                }
            }

            pending.frames.push(template.to_fill(key, chan));
            filled.push(chan);
        }

        if filled.is_empty() {
            self.stats.complete_sets += 1;
        } else {
            debug!("Filled {} channel(s) for key {key}: {filled:?}", filled.len());
            self.stats.filled_sets += 1;
            self.stats.fill_frames += filled.len() as u64;
        }
        Ok(self.finish(key, pending.frames, filled))
    }

    fn finish(&self, key: u64, mut frames: Vec<F>, filled: Vec<ChannelId>) -> FrameSet<F> {
        if self.reorder {
            frames.sort_by_key(|f| f.channel_id());
        }
        FrameSet {
            key,
            frames,
            filled,
        }
    }
}

/// The iterator returned by [`ReorderFillBuffer::drain`].
pub struct Drain<'a, F: BufferedFrame> {
    buffer: &'a mut ReorderFillBuffer<F>,
}

impl<F: BufferedFrame> Iterator for Drain<'_, F> {
    type Item = Result<FrameSet<F>, BufferError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(set) = self.buffer.evicted.pop_front() {
            return Some(Ok(set));
        }
        self.buffer.evict_oldest()
    }
}
