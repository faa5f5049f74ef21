//! Async-signal-safe crash-time stack unwinding and symbolication for
//! Apple platforms.
//!
//! At the moment a fatal signal or uncaught exception is delivered, this
//! crate takes a frozen thread state and the list of loaded images, walks
//! every frame of the call stack (frame-pointer chains, Apple compact
//! unwind, and DWARF CFI), resolves each return address to an image and a
//! symbol (Objective-C metadata first, the Mach-O symbol table second), and
//! appends a structured report to a pre-opened sink.
//!
//! The capture path holds itself to the async-signal-safety rules: no heap
//! allocation, no locks, and no re-entry into the language runtime. Every
//! pointer taken from the (possibly corrupted) target task is validated
//! against a mapped memory object before it is dereferenced.

pub mod cursor;
pub mod error;
pub mod image;
mod leb;
pub mod macho;
pub mod mem;
pub mod objc;
pub mod report;
pub mod symbols;
pub mod thread_state;
pub mod unwind;

#[cfg(target_os = "macos")]
pub mod mac;

pub use cursor::{Cursor, Frame, FrameReader, MAX_FRAME_DEPTH, Provenance, Step};
pub use error::Error;
pub use image::{Image, ImageList};
pub use macho::MachO;
pub use mem::{MemoryObject, TaskMemory};
pub use objc::ObjcCache;
#[cfg(unix)]
pub use report::FdSink;
pub use report::{ReportSink, Reporter, SignalInfo};
pub use symbols::{Symbol, symbolicate};
pub use thread_state::{Arch, Reg, ThreadState};
