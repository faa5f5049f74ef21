//! Capture entry point and report emission.
//!
//! `Reporter::capture` is the boundary the signal-handler shim calls into:
//! given a frozen thread state and the image list, it walks the stack,
//! symbolicates every frame, and appends a structured plain-text report to
//! a pre-opened sink. Formatting happens in a fixed stack buffer; nothing
//! on this path allocates or takes a lock.

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::image::ImageList;
use crate::mem::TaskMemory;
use crate::objc::ObjcCache;
use crate::symbols::{self, Symbol};
use crate::thread_state::ThreadState;

/// Fault details handed down from the signal handler, if any.
#[derive(Debug, Clone, Copy)]
pub struct SignalInfo {
    /// Signal number (e.g. `SIGSEGV`).
    pub number: u32,
    /// `si_code` as delivered.
    pub code: u32,
    /// Faulting address.
    pub address: u64,
}

/// An already-opened, pre-allocated output the report is appended to.
///
/// `append` must be async-signal-safe for the sink to be usable from a
/// crash handler.
pub trait ReportSink {
    fn append(&mut self, bytes: &[u8]) -> Result<()>;
}

impl ReportSink for Vec<u8> {
    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// A sink over a raw file descriptor, written with plain `write(2)`.
#[cfg(unix)]
pub struct FdSink {
    fd: std::os::fd::RawFd,
}

#[cfg(unix)]
impl FdSink {
    /// The caller keeps ownership of `fd`; it must stay open for the
    /// sink's lifetime.
    pub fn new(fd: std::os::fd::RawFd) -> Self {
        Self { fd }
    }
}

#[cfg(unix)]
impl ReportSink for FdSink {
    fn append(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            // SAFETY: plain syscall on a caller-owned descriptor
            let written = unsafe { libc::write(self.fd, bytes.as_ptr().cast(), bytes.len()) };
            if written < 0 {
                if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(Error::AccessDenied);
            }
            bytes = &bytes[written as usize..];
        }
        Ok(())
    }
}

/// One output line, formatted into fixed storage. Content past the buffer
/// is silently truncated; a truncated report line beats a heap allocation
/// in a signal handler.
struct LineBuf {
    buf: [u8; 512],
    len: usize,
}

impl LineBuf {
    fn new() -> Self {
        Self {
            buf: [0; 512],
            len: 0,
        }
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        let room = self.buf.len() - self.len;
        let take = bytes.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        self.len += take;
    }

    fn push_str(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    fn push_hex(&mut self, value: u64) {
        self.push_str("0x");
        let mut digits = [0u8; 16];
        let mut remaining = value;
        let mut count = 0;
        loop {
            let nibble = (remaining & 0xf) as usize;
            digits[count] = b"0123456789abcdef"[nibble];
            count += 1;
            remaining >>= 4;
            if remaining == 0 {
                break;
            }
        }
        for i in (0..count).rev() {
            self.push_bytes(&[digits[i]]);
        }
    }

    fn push_dec(&mut self, value: u64) {
        let mut digits = [0u8; 20];
        let mut remaining = value;
        let mut count = 0;
        loop {
            digits[count] = b'0' + (remaining % 10) as u8;
            count += 1;
            remaining /= 10;
            if remaining == 0 {
                break;
            }
        }
        for i in (0..count).rev() {
            self.push_bytes(&[digits[i]]);
        }
    }
}

/// The crash-reporting core.
///
/// Construct one per handler installation: `new` performs the bulk
/// allocations (the ObjC cache) up front so that `capture` can run from the
/// signal context without touching the allocator.
pub struct Reporter {
    cache: ObjcCache,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter {
    pub fn new() -> Self {
        Self {
            cache: ObjcCache::new(),
        }
    }

    /// Walks and symbolicates `state`, appending the report to `sink`.
    ///
    /// Single-frame failures degrade that frame's line; only a sink failure
    /// aborts the capture.
    pub fn capture(
        &mut self,
        mem: &dyn TaskMemory,
        state: &ThreadState,
        images: &ImageList,
        sink: &mut dyn ReportSink,
        siginfo: Option<&SignalInfo>,
    ) -> Result<()> {
        let mut line = LineBuf::new();

        line.push_str("crash report (");
        line.push_str(state.arch().name());
        line.push_str(")\n");
        sink.append(line.bytes())?;

        if let Some(info) = siginfo {
            line.clear();
            line.push_str("signal ");
            line.push_dec(u64::from(info.number));
            line.push_str(" code ");
            line.push_dec(u64::from(info.code));
            line.push_str(" fault-address ");
            line.push_hex(info.address);
            line.push_str("\n");
            sink.append(line.bytes())?;
        }

        self.write_registers(state, sink, &mut line)?;

        let mut cursor = Cursor::new(mem, images, state.clone());
        let mut index = 0u32;
        loop {
            self.write_frame(mem, images, &cursor, index, sink, &mut line)?;
            index += 1;

            match cursor.next() {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    // No reader could recover the caller; report the
                    // truncation rather than dropping the report
                    line.clear();
                    line.push_str("frame ");
                    line.push_dec(u64::from(index));
                    line.push_str(": unknown (unwind failed)\n");
                    sink.append(line.bytes())?;
                    break;
                }
            }
        }

        Ok(())
    }

    fn write_registers(
        &self,
        state: &ThreadState,
        sink: &mut dyn ReportSink,
        line: &mut LineBuf,
    ) -> Result<()> {
        let mut on_line = 0;
        line.clear();
        for (reg, value) in state.iter_valid() {
            if on_line == 4 {
                line.push_str("\n");
                sink.append(line.bytes())?;
                line.clear();
                on_line = 0;
            }
            line.push_str("  ");
            line.push_str(reg.name());
            line.push_str(" ");
            line.push_hex(value);
            on_line += 1;
        }
        if on_line > 0 {
            line.push_str("\n");
            sink.append(line.bytes())?;
        }
        Ok(())
    }

    fn write_frame(
        &mut self,
        mem: &dyn TaskMemory,
        images: &ImageList,
        cursor: &Cursor<'_>,
        index: u32,
        sink: &mut dyn ReportSink,
        line: &mut LineBuf,
    ) -> Result<()> {
        line.clear();
        line.push_str("frame ");
        line.push_dec(u64::from(index));
        line.push_str(": ");

        let ip = match cursor.frame().state.ip() {
            Ok(ip) => ip,
            Err(_) => {
                line.push_str("???\n");
                return sink.append(line.bytes());
            }
        };
        line.push_hex(ip);

        let resolved = symbols::symbolicate(mem, images, &mut self.cache, ip, |symbol| {
            match symbol {
                Symbol::Method {
                    is_meta,
                    class_name,
                    method_name,
                    imp,
                } => {
                    line.push_str(if *is_meta { " +[" } else { " -[" });
                    line.push_bytes(class_name);
                    line.push_str(" ");
                    line.push_bytes(method_name);
                    line.push_str("] + ");
                    line.push_dec(ip - imp);
                }
                Symbol::Function { name, address } => {
                    line.push_str(" ");
                    line.push_bytes(name);
                    line.push_str(" + ");
                    line.push_dec(ip - address);
                }
                Symbol::Image { name, offset } => {
                    line.push_str(" ??? (");
                    line.push_bytes(name);
                    line.push_str(" + ");
                    line.push_dec(*offset);
                    line.push_str(")");
                }
            }
        });
        if resolved.is_err() {
            // The address lies in no known image
            line.push_str(" ???");
        }

        line.push_str("\n");
        sink.append(line.bytes())
    }
}
