//! Frame-pointer chain walking.

use crate::cursor::{Frame, FrameReader, Provenance, Step};
use crate::error::{Error, Result};
use crate::image::ImageList;
use crate::mem::{self, TaskMemory};

/// Walks the conventional `push fp; mov fp, sp` prologue chain.
///
/// This reader needs no unwind metadata at all, which makes it the fallback
/// of last resort; the cost is that it can restore no callee-saved register
/// other than the frame pointer itself.
pub struct FramePointerReader;

impl FrameReader for FramePointerReader {
    fn read_frame(&self, mem: &dyn TaskMemory, _images: &ImageList, prev: &Frame) -> Result<Step> {
        let state = &prev.state;
        let word = state.arch().word_size();

        let fp = match state.fp() {
            Ok(fp) => fp,
            // Without a frame pointer there is nothing to walk
            Err(_) => return Err(Error::Unknown),
        };

        // A NULL or misaligned frame pointer is the conventional chain
        // terminator rather than an error
        if fp == 0 || fp % word != 0 {
            return Ok(Step::End);
        }

        let is_64 = state.arch().is_64();
        let (saved_fp, ret_addr) = match (
            mem::read_ptr(mem, fp, is_64, scroll::LE),
            mem::read_ptr(mem, fp + word, is_64, scroll::LE),
        ) {
            (Ok(saved_fp), Ok(ret_addr)) => (saved_fp, ret_addr),
            // Running off the mapped stack ends the walk
            _ => return Ok(Step::End),
        };

        let mut next = state.clone();
        next.clear_volatiles();
        next.set_fp(saved_fp);
        next.set_ip(ret_addr);
        next.set_sp(fp + 2 * word);

        Ok(Step::Caller(Frame {
            state: next,
            provenance: Provenance::FramePointer,
        }))
    }

    fn name(&self) -> &'static str {
        "frame-pointer"
    }
}
