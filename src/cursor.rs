//! Non-portable frame-walking cursor.
//!
//! The cursor drives successive frame reads by dispatching to an ordered
//! list of [`FrameReader`]s until one produces the caller frame or the walk
//! terminates. The seed frame is the register snapshot taken by the
//! trampoline; after *n* successful advances the cursor represents the
//! *n*-th caller of that snapshot.

use crate::error::{Error, Result};
use crate::image::ImageList;
use crate::mem::TaskMemory;
use crate::thread_state::ThreadState;
use crate::unwind::{compact::CompactUnwindReader, dwarf::DwarfCfiReader, frame_ptr::FramePointerReader};

/// Which reader produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// The seed frame, taken directly from the thread-state snapshot.
    Context,
    FramePointer,
    CompactUnwind,
    DwarfCfi,
}

impl Provenance {
    pub fn name(self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::FramePointer => "frame-pointer",
            Self::CompactUnwind => "compact-unwind",
            Self::DwarfCfi => "dwarf-cfi",
        }
    }
}

/// A thread state plus the provenance of the reader that produced it.
#[derive(Clone)]
pub struct Frame {
    pub state: ThreadState,
    pub provenance: Provenance,
}

/// Outcome of a successful frame read.
pub enum Step {
    /// The caller's frame.
    Caller(Frame),
    /// The walk terminated cleanly (e.g. a NULL frame pointer).
    End,
}

/// A decoder that recovers the caller's register state from the current
/// frame's.
///
/// Returning `Err(Unknown)` defers to the next reader in the cursor's list;
/// any other error is logged and treated the same way.
pub trait FrameReader {
    fn read_frame(&self, mem: &dyn TaskMemory, images: &ImageList, prev: &Frame) -> Result<Step>;

    fn name(&self) -> &'static str;
}

/// Walk ceiling; deeper stacks are reported truncated.
pub const MAX_FRAME_DEPTH: u32 = 512;

/// The standard reader order: compact unwind, DWARF CFI, then the
/// frame-pointer chain as the last resort.
pub const DEFAULT_READERS: &[&dyn FrameReader] =
    &[&CompactUnwindReader, &DwarfCfiReader, &FramePointerReader];

/// Frame-walking state machine over one thread's stack.
pub struct Cursor<'a> {
    mem: &'a dyn TaskMemory,
    images: &'a ImageList,
    readers: &'a [&'a dyn FrameReader],
    frame: Frame,
    depth: u32,
    done: bool,
}

impl<'a> Cursor<'a> {
    /// Seeds a cursor with a thread-state snapshot, using the default
    /// reader order.
    pub fn new(mem: &'a dyn TaskMemory, images: &'a ImageList, state: ThreadState) -> Self {
        Self::with_readers(mem, images, state, DEFAULT_READERS)
    }

    /// Seeds a cursor with an explicit reader list. Used by the regression
    /// scenarios to exercise one unwinding strategy at a time.
    pub fn with_readers(
        mem: &'a dyn TaskMemory,
        images: &'a ImageList,
        state: ThreadState,
        readers: &'a [&'a dyn FrameReader],
    ) -> Self {
        Self {
            mem,
            images,
            readers,
            frame: Frame {
                state,
                provenance: Provenance::Context,
            },
            depth: 0,
            done: false,
        }
    }

    /// The current frame. Before the first `next` this is the seed frame.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Number of successful advances so far.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Advances to the caller frame.
    ///
    /// Returns `Ok(None)` once the walk has terminated; a terminated cursor
    /// stays terminated. Returns `Err(Unknown)` when every reader fell
    /// through, which also terminates the walk.
    pub fn next(&mut self) -> Result<Option<&Frame>> {
        if self.done {
            return Ok(None);
        }
        if self.depth >= MAX_FRAME_DEPTH {
            self.done = true;
            return Ok(None);
        }

        let mut step = None;
        for reader in self.readers {
            match reader.read_frame(self.mem, self.images, &self.frame) {
                Ok(found) => {
                    step = Some(found);
                    break;
                }
                Err(Error::Unknown) => {}
                Err(err) => {
                    log::debug!("frame reader {} failed: {err}", reader.name());
                }
            }
        }

        let Some(step) = step else {
            self.done = true;
            return Err(Error::Unknown);
        };

        let frame = match step {
            Step::End => {
                self.done = true;
                return Ok(None);
            }
            Step::Caller(frame) => frame,
        };

        // A walked-to frame must make downward-stack progress and carry a
        // plausible instruction pointer, otherwise the chain is cyclic or
        // has run off the end of the recorded stack.
        match frame.state.ip() {
            Ok(0) | Err(_) => {
                self.done = true;
                return Ok(None);
            }
            Ok(_) => {}
        }
        if let (Ok(prev_sp), Ok(next_sp)) = (self.frame.state.sp(), frame.state.sp()) {
            if next_sp <= prev_sp {
                self.done = true;
                return Ok(None);
            }
        }

        self.depth += 1;
        self.frame = frame;
        Ok(Some(&self.frame))
    }
}
