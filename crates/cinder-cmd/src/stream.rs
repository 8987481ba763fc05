//! # Command Stream
//!
//! Builds command buffers and the tables a submission hands to the kernel.
//!
//! ## Layout
//!
//! ```text
//!   words   [ w0 w1 w2 .. w(offset-1) | free ........ | END_CLEARANCE ]
//!   bos     [ SubmitBo 0 | SubmitBo 1 | ... ]     one entry per distinct BO
//!   shadow  [ Bo 0       | Bo 1       | ... ]     owning refs, same indices
//!   relocs  [ SubmitReloc ... ]                   patch offsets into `words`
//!   pmrs    [ SubmitPmr ... ]                     perf samples
//! ```
//!
//! ## State machine
//!
//! ```text
//!   Building ──(reserve/emit does not fit)──► Flushing ──► Building
//!   Building ──(finish)──► Flushing ──► wait ──► Building
//! ```
//!
//! Every flush, successful or not, drops the shadow references, empties the
//! three tables, rewinds the write cursor and then runs the reset callback.
//!
//! A buffer referenced more than once in one submission gets a single entry
//! in the buffer table. The buffer remembers its index in the stream that
//! last used it, so repeated references are O(1); a buffer shared between
//! streams falls back to a linear scan.

use std::fmt;
use std::time::Duration;

use cinder_core::{
    Descriptor, Error, PerfFlags, RelocFlags, Result, StreamId, SubmitBo, SubmitBoFlags,
    SubmitFlags, SubmitPmr, SubmitReloc, SubmitRequest, Timestamp, Transport,
};
use cinder_mem::{Bo, StreamLink};

use crate::perfmon::PerfSignal;
use crate::pipe::Pipe;

/// Words kept free at the end of every stream for the kernel's epilogue
pub const END_CLEARANCE: u32 = 10;

/// Largest stream whose byte offsets still fit the 32-bit relocation field
pub const MAX_STREAM_WORDS: u32 = u32::MAX / 4;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Command stream configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Resolve repeated buffer references through the buffer's stream link
    pub dedup_fast_path: bool,
    /// How long [`CmdStream::finish`] waits for the GPU
    pub finish_timeout: Duration,
}

impl StreamConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            dedup_fast_path: true,
            finish_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream statistics
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    /// Successful submissions
    pub submits: u64,
    /// Rejected submissions
    pub failed_submits: u64,
    /// Flushes forced by a full stream
    pub forced_flushes: u64,
    /// Buffer references resolved through the stream link
    pub fast_path_hits: u64,
}

// =============================================================================
// RECORDS
// =============================================================================

/// Reference to `offset` bytes into `bo`, emitted as a GPU address
#[derive(Debug)]
pub struct Reloc<'a, T: Transport> {
    /// Target buffer
    pub bo: &'a Bo<T>,
    /// Byte offset inside the buffer
    pub offset: u64,
    /// GPU access
    pub flags: RelocFlags,
}

/// Sample of `signal` written into `bo` at `offset`
#[derive(Debug)]
pub struct PerfRecord<'a, T: Transport> {
    /// Buffer receiving the sample
    pub bo: &'a Bo<T>,
    /// Byte offset of the sample
    pub offset: u32,
    /// Caller-chosen sequence number
    pub sequence: u32,
    /// Sample before and/or after the submission
    pub flags: PerfFlags,
    /// Counter to sample
    pub signal: &'a PerfSignal,
}

/// Callback run after every reset, typically to re-emit context state
pub type ResetNotify<T> = Box<dyn FnMut(&mut CmdStream<T>) + Send>;

// =============================================================================
// COMMAND STREAM
// =============================================================================

/// A command buffer under construction
pub struct CmdStream<T: Transport> {
    id: StreamId,
    pipe: Pipe<T>,
    config: StreamConfig,
    buffer: Vec<u32>,
    offset: u32,
    bos: Vec<SubmitBo>,
    shadow: Vec<Bo<T>>,
    relocs: Vec<SubmitReloc>,
    pmrs: Vec<SubmitPmr>,
    timestamp: Timestamp,
    reset_notify: Option<ResetNotify<T>>,
    stats: StreamStats,
}

impl<T: Transport> CmdStream<T> {
    /// Create a stream of `size` words on `pipe`
    pub fn new(pipe: &Pipe<T>, size: u32, reset_notify: Option<ResetNotify<T>>) -> Result<Self> {
        Self::with_config(pipe, size, reset_notify, StreamConfig::default())
    }

    /// Create a stream with a custom configuration
    pub fn with_config(
        pipe: &Pipe<T>,
        size: u32,
        reset_notify: Option<ResetNotify<T>>,
        config: StreamConfig,
    ) -> Result<Self> {
        if size == 0 {
            log::error!("command stream size is zero");
            return Err(Error::InvalidArgument);
        }
        if size > MAX_STREAM_WORDS {
            log::error!("command stream of {} words exceeds {}", size, MAX_STREAM_WORDS);
            return Err(Error::InvalidArgument);
        }

        Ok(Self {
            id: StreamId::next(),
            pipe: pipe.clone(),
            config,
            buffer: vec![0; size as usize],
            offset: 0,
            bos: Vec::new(),
            shadow: Vec::new(),
            relocs: Vec::new(),
            pmrs: Vec::new(),
            timestamp: Timestamp::NONE,
            reset_notify,
            stats: StreamStats::default(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Process-unique stream id
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Pipe the stream executes on
    pub fn pipe(&self) -> &Pipe<T> {
        &self.pipe
    }

    /// Capacity in words
    pub fn size(&self) -> u32 {
        self.buffer.len() as u32
    }

    /// Write cursor in words
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Fence of the last successful submission
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Words written so far
    pub fn words(&self) -> &[u32] {
        &self.buffer[..self.offset as usize]
    }

    /// Buffer table
    pub fn bos(&self) -> &[SubmitBo] {
        &self.bos
    }

    /// Relocation table
    pub fn relocs(&self) -> &[SubmitReloc] {
        &self.relocs
    }

    /// Perf table
    pub fn pmrs(&self) -> &[SubmitPmr] {
        &self.pmrs
    }

    /// Active configuration
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Get statistics
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Words left before the end clearance
    pub fn available(&self) -> u32 {
        self.size()
            .saturating_sub(self.offset)
            .saturating_sub(END_CLEARANCE)
    }

    /// Make room for `n` words, flushing when they do not fit
    pub fn reserve(&mut self, n: u32) {
        if self.available() < n {
            log::debug!("stream {:?}: {} words do not fit, flushing", self.id, n);
            self.stats.forced_flushes += 1;
            self.flush();
        }
    }

    fn ensure_room(&mut self) {
        if self.offset >= self.size() {
            log::warn!("stream {:?}: write past capacity, flushing", self.id);
            self.stats.forced_flushes += 1;
            self.flush();
        }
    }

    /// Append one word
    pub fn emit(&mut self, word: u32) {
        self.ensure_room();
        match self.buffer.get_mut(self.offset as usize) {
            Some(slot) => {
                *slot = word;
                self.offset += 1;
            }
            None => log::error!("stream {:?}: dropping word, reset callback filled the stream", self.id),
        }
    }

    /// Word at `offset`, if inside the stream
    pub fn word(&self, offset: u32) -> Option<u32> {
        self.buffer.get(offset as usize).copied()
    }

    /// Overwrite the word at `offset`
    pub fn set_word(&mut self, offset: u32, value: u32) -> Result<()> {
        let slot = self
            .buffer
            .get_mut(offset as usize)
            .ok_or(Error::InvalidArgument)?;
        *slot = value;
        Ok(())
    }

    // =========================================================================
    // Buffer references
    // =========================================================================

    /// Index of `bo` in the buffer table, adding it if needed
    fn bo_index(&mut self, bo: &Bo<T>, access: SubmitBoFlags) -> u32 {
        let id = self.id;
        let fast_path = self.config.dedup_fast_path;
        let bos = &mut self.bos;
        let shadow = &mut self.shadow;
        let stats = &mut self.stats;

        let index = bo.with_stream_link(|link| {
            if fast_path {
                if let Some(l) = *link {
                    if l.stream == id {
                        stats.fast_path_hits += 1;
                        return l.index;
                    }
                }
            }

            let index = match shadow.iter().position(|b| b == bo) {
                Some(pos) => pos as u32,
                None => {
                    bos.push(SubmitBo::new(bo.handle(), bo.gpu_addr().unwrap_or_default()));
                    shadow.push(bo.clone());
                    (bos.len() - 1) as u32
                }
            };
            *link = Some(StreamLink { stream: id, index });
            index
        });

        self.bos[index as usize].add_access(access);
        index
    }

    /// Reference `bo` without emitting anything; returns its table index
    pub fn ref_bo(&mut self, bo: &Bo<T>, flags: RelocFlags) -> u32 {
        self.bo_index(bo, flags.into())
    }

    /// Emit the GPU address of `reloc.bo` + `reloc.offset`
    ///
    /// Without softpin a placeholder is emitted and the kernel patches it
    /// through the relocation table. With softpin the buffer's address is
    /// known and emitted directly.
    pub fn reloc(&mut self, reloc: &Reloc<'_, T>) {
        self.ensure_room();
        let index = self.bo_index(reloc.bo, reloc.flags.into());

        match reloc.bo.gpu_addr() {
            Some(addr) => self.emit((addr + reloc.offset).raw() as u32),
            None => {
                // offset < size <= MAX_STREAM_WORDS, so the byte offset fits.
                self.relocs
                    .push(SubmitReloc::new(self.offset * 4, index, reloc.offset));
                self.emit(0);
            }
        }
    }

    /// Request a perf counter sample
    pub fn perf(&mut self, record: &PerfRecord<'_, T>) {
        let index = self.bo_index(record.bo, SubmitBoFlags::READ | SubmitBoFlags::WRITE);
        self.pmrs.push(SubmitPmr::new(
            record.flags,
            record.signal.domain(),
            record.signal.id(),
            record.sequence,
            record.offset,
            index,
        ));
    }

    // =========================================================================
    // Submission
    // =========================================================================

    fn submit(
        &mut self,
        in_fence: Option<Descriptor>,
        want_out_fence: bool,
    ) -> Result<Option<Descriptor>> {
        let mut flags = SubmitFlags::empty();
        if in_fence.is_some() {
            flags |= SubmitFlags::FENCE_FD_IN | SubmitFlags::NO_IMPLICIT;
        }
        if want_out_fence {
            flags |= SubmitFlags::FENCE_FD_OUT;
        }
        if self.pipe.device().uses_softpin() {
            flags |= SubmitFlags::SOFTPIN;
        }

        let request = SubmitRequest {
            core: self.pipe.gpu().core(),
            pipe: self.pipe.id(),
            flags,
            bos: &self.bos,
            relocs: &self.relocs,
            pmrs: &self.pmrs,
            stream: &self.buffer[..self.offset as usize],
            in_fence,
        };

        match self.pipe.device().transport().submit(&request) {
            Ok(response) => {
                self.timestamp = response.fence;
                self.stats.submits += 1;
                Ok(response.out_fence)
            }
            Err(errno) => {
                self.stats.failed_submits += 1;
                log::error!("stream {:?}: submit failed: {}", self.id, errno);
                Err(Error::SubmissionFailed(errno))
            }
        }
    }

    /// Drop every reference and rewind, then run the reset callback
    fn reset(&mut self) {
        for bo in &self.shadow {
            bo.clear_stream_link(self.id);
        }
        self.shadow.clear();
        self.bos.clear();
        self.relocs.clear();
        self.pmrs.clear();
        self.offset = 0;

        if let Some(mut notify) = self.reset_notify.take() {
            notify(self);
            if self.reset_notify.is_none() {
                self.reset_notify = Some(notify);
            }
        }
    }

    /// Submit and reset; a failed submission is logged and dropped
    pub fn flush(&mut self) {
        // Already logged by `submit`.
        let _ = self.try_flush();
    }

    /// Submit and reset, reporting a failed submission
    pub fn try_flush(&mut self) -> Result<Timestamp> {
        self.flush_with_fences(None, false).map(|_| self.timestamp)
    }

    /// Submit after `in_fence` signalled and reset
    ///
    /// With `want_out_fence` the kernel returns a sync-file descriptor that
    /// signals when this submission completes.
    pub fn flush_with_fences(
        &mut self,
        in_fence: Option<Descriptor>,
        want_out_fence: bool,
    ) -> Result<Option<Descriptor>> {
        let result = self.submit(in_fence, want_out_fence);
        self.reset();
        result
    }

    /// Submit, wait for the GPU to finish, then reset
    ///
    /// References are held until the wait returned.
    pub fn finish(&mut self) -> Result<()> {
        let result = self
            .submit(None, false)
            .and_then(|_| self.pipe.wait(self.timestamp, self.config.finish_timeout));
        self.reset();
        result
    }
}

impl<T: Transport> Drop for CmdStream<T> {
    fn drop(&mut self) {
        for bo in &self.shadow {
            bo.clear_stream_link(self.id);
        }
    }
}

impl<T: Transport> fmt::Debug for CmdStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdStream")
            .field("id", &self.id)
            .field("size", &self.size())
            .field("offset", &self.offset)
            .field("bos", &self.bos.len())
            .field("relocs", &self.relocs.len())
            .field("pmrs", &self.pmrs.len())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
