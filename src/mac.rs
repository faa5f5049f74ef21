//! macOS task backend.
//!
//! Implements [`TaskMemory`] over the Mach VM interfaces, enumerates the
//! target task's loaded images through dyld, and snapshots live thread
//! state. Everything here is kept to plain Mach traps so the capture path
//! stays async-signal-safe.

use mach2::kern_return::KERN_SUCCESS;
use mach2::port::mach_port_name_t;
use mach2::traps::mach_task_self;
use mach2::vm::{mach_vm_deallocate, mach_vm_read_overwrite, mach_vm_remap};
use mach2::vm_prot::VM_PROT_READ;
use mach2::vm_statistics::VM_FLAGS_ANYWHERE;

use crate::error::{Error, Result};
use crate::image::{Image, ImageList};
use crate::mem::{self, MAX_READ, MemoryObject, TaskMemory};
use crate::report::{Reporter, ReportSink, SignalInfo};
use crate::thread_state::ThreadState;

/// A region remapped from another task into this one, released on drop.
pub struct VmRegion {
    base: u64,
    total: usize,
    offset: usize,
    len: usize,
}

impl VmRegion {
    pub(crate) fn bytes(&self) -> &[u8] {
        // SAFETY: the remap succeeded with read protection and the region
        // stays mapped until drop
        unsafe { std::slice::from_raw_parts((self.base as *const u8).add(self.offset), self.len) }
    }
}

impl Drop for VmRegion {
    fn drop(&mut self) {
        // SAFETY: releasing the mapping established by mach_vm_remap
        unsafe {
            mach_vm_deallocate(mach_task_self(), self.base, self.total as u64);
        }
    }
}

/// Memory of a (possibly foreign) Mach task.
pub struct MachTask {
    task: mach_port_name_t,
}

impl MachTask {
    pub fn new(task: mach_port_name_t) -> Self {
        Self { task }
    }

    /// The calling task; used when the crashed process inspects itself.
    pub fn current() -> Self {
        // SAFETY: trap with no arguments
        Self {
            task: unsafe { mach_task_self() },
        }
    }

    pub fn port(&self) -> mach_port_name_t {
        self.task
    }
}

impl TaskMemory for MachTask {
    fn read_into(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() > MAX_READ {
            return Err(Error::Invalid);
        }
        if buf.is_empty() {
            return Ok(());
        }

        let mut read_len = 0u64;
        // SAFETY: the kernel writes at most buf.len() bytes into buf
        let kr = unsafe {
            mach_vm_read_overwrite(
                self.task,
                addr,
                buf.len() as u64,
                buf.as_mut_ptr() as u64,
                &mut read_len,
            )
        };
        if kr != KERN_SUCCESS || read_len != buf.len() as u64 {
            return Err(Error::AccessDenied);
        }
        Ok(())
    }

    fn map(&self, addr: u64, len: u64) -> Result<MemoryObject> {
        let len_usize = usize::try_from(len).map_err(|_| Error::Invalid)?;
        let page_size = unsafe { libc::vm_page_size } as u64;
        let page_addr = addr & !(page_size - 1);
        let delta = (addr - page_addr) as usize;
        let total = (delta + len_usize).div_ceil(page_size as usize) * page_size as usize;

        let mut target: u64 = 0;
        let mut cur_prot = 0;
        let mut max_prot = 0;
        // SAFETY: the kernel picks the target address; no local memory is
        // aliased
        let kr = unsafe {
            mach_vm_remap(
                mach_task_self(),
                &mut target,
                total as u64,
                0,
                VM_FLAGS_ANYWHERE,
                self.task,
                page_addr,
                0, // share rather than copy; the source task is suspended
                &mut cur_prot,
                &mut max_prot,
                mach2::vm_inherit::VM_INHERIT_NONE,
            )
        };
        if kr != KERN_SUCCESS {
            return Err(Error::AccessDenied);
        }

        let region = VmRegion {
            base: target,
            total,
            offset: delta,
            len: len_usize,
        };
        if cur_prot & VM_PROT_READ == 0 {
            return Err(Error::AccessDenied);
        }

        Ok(MemoryObject::from_remapped(addr, region))
    }
}

// dyld_all_image_infos / dyld_image_info field offsets, from
// usr/include/mach-o/dyld_images.h
const ALL_IMAGE_INFOS_HEADER: usize = 16; // version, count, info array addr
const IMAGE_INFO_SIZE: u64 = 24; // load address, file path, mod date

/// Enumerates the task's loaded images from dyld's all-image-infos table.
pub fn dyld_image_list(task: &MachTask) -> Result<ImageList> {
    let mut dyld_info = std::mem::MaybeUninit::<mach2::task_info::task_dyld_info>::uninit();
    let mut count = (size_of::<mach2::task_info::task_dyld_info>()
        / size_of::<mach2::vm_types::natural_t>()) as u32;

    // SAFETY: syscall
    let kr = unsafe {
        mach2::task::task_info(
            task.task,
            mach2::task_info::TASK_DYLD_INFO,
            dyld_info.as_mut_ptr().cast(),
            &mut count,
        )
    };
    if kr != KERN_SUCCESS {
        return Err(Error::AccessDenied);
    }
    // SAFETY: valid if the syscall succeeded
    let all_image_addr = unsafe { dyld_info.assume_init() }.all_image_info_addr;

    let mut header = [0u8; ALL_IMAGE_INFOS_HEADER];
    task.read_into(all_image_addr, &mut header)?;
    let image_count = u32::from_ne_bytes(header[4..8].try_into().unwrap());
    let array_addr = u64::from_ne_bytes(header[8..16].try_into().unwrap());

    let infos = task.map(array_addr, u64::from(image_count) * IMAGE_INFO_SIZE)?;
    let buf = infos.bytes();

    let mut images = ImageList::new();
    let mut name_buf = [0u8; 512];
    for i in 0..image_count as usize {
        let entry = &buf[i * IMAGE_INFO_SIZE as usize..];
        let load_address = u64::from_ne_bytes(entry[..8].try_into().unwrap());
        let path_addr = u64::from_ne_bytes(entry[8..16].try_into().unwrap());

        let name = if path_addr != 0 {
            mem::read_cstring(task as &dyn TaskMemory, path_addr, &mut name_buf).unwrap_or(&[])
        } else {
            &[]
        };
        images.append(Image::new(load_address, name));
    }

    Ok(images)
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// x86_THREAD_STATE64 in /usr/include/mach/i386/thread_status.h
        const THREAD_STATE_FLAVOR: u32 = 4;
        const THREAD_STATE_WORDS: u32 =
            (size_of::<mach2::structs::x86_thread_state64_t>() / 4) as u32;
    } else if #[cfg(target_arch = "aarch64")] {
        /// ARM_THREAD_STATE64 in /usr/include/mach/arm/thread_status.h
        const THREAD_STATE_FLAVOR: u32 = 6;

        // Missing from mach2 atm
        // _STRUCT_ARM_THREAD_STATE64 from /usr/include/mach/arm/_structs.h
        #[repr(C)]
        struct Arm64MachState {
            x: [u64; 29],
            fp: u64,
            lr: u64,
            sp: u64,
            pc: u64,
            cpsr: u32,
            __pad: u32,
        }

        const THREAD_STATE_WORDS: u32 = (size_of::<Arm64MachState>() / 4) as u32;
    } else {
        compile_error!("unsupported macOS target arch");
    }
}

/// Snapshots the register state of a (suspended) thread.
pub fn thread_state_snapshot(thread: mach_port_name_t) -> Result<ThreadState> {
    let mut raw = [0u32; 256];
    let mut count = THREAD_STATE_WORDS;

    // SAFETY: syscall; the kernel fills at most `count` words
    let kr = unsafe {
        mach2::thread_act::thread_get_state(
            thread,
            THREAD_STATE_FLAVOR as i32,
            raw.as_mut_ptr(),
            &mut count,
        )
    };
    if kr != KERN_SUCCESS || count < THREAD_STATE_WORDS {
        return Err(Error::AccessDenied);
    }

    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            use crate::thread_state::{Arch, amd64::Reg};

            // SAFETY: the kernel filled a complete x86_thread_state64_t
            let ts: &mach2::structs::x86_thread_state64_t =
                unsafe { &*(raw.as_ptr().cast()) };

            let mut state = ThreadState::new(Arch::Amd64);
            state.set(Reg::Rax, ts.__rax);
            state.set(Reg::Rbx, ts.__rbx);
            state.set(Reg::Rcx, ts.__rcx);
            state.set(Reg::Rdx, ts.__rdx);
            state.set(Reg::Rdi, ts.__rdi);
            state.set(Reg::Rsi, ts.__rsi);
            state.set(Reg::Rbp, ts.__rbp);
            state.set(Reg::Rsp, ts.__rsp);
            state.set(Reg::R8, ts.__r8);
            state.set(Reg::R9, ts.__r9);
            state.set(Reg::R10, ts.__r10);
            state.set(Reg::R11, ts.__r11);
            state.set(Reg::R12, ts.__r12);
            state.set(Reg::R13, ts.__r13);
            state.set(Reg::R14, ts.__r14);
            state.set(Reg::R15, ts.__r15);
            state.set(Reg::Rip, ts.__rip);
            state.set(Reg::Rflags, ts.__rflags);
            state.set(Reg::Cs, ts.__cs);
            state.set(Reg::Fs, ts.__fs);
            state.set(Reg::Gs, ts.__gs);
            Ok(state)
        } else if #[cfg(target_arch = "aarch64")] {
            use crate::thread_state::{Arch, arm64, arm64::Reg};

            // SAFETY: the kernel filled a complete ARM_THREAD_STATE64
            let ts: &Arm64MachState = unsafe { &*(raw.as_ptr().cast()) };

            let mut state = ThreadState::new(Arch::Arm64);
            for (i, value) in ts.x.iter().enumerate() {
                state.set(arm64::ALL[i], *value);
            }
            state.set(Reg::Fp, ts.fp);
            state.set(Reg::Lr, ts.lr);
            state.set(Reg::Sp, ts.sp);
            state.set(Reg::Pc, ts.pc);
            state.set(Reg::Cpsr, u64::from(ts.cpsr));
            Ok(state)
        }
    }
}

/// Maps a Mach exception from a crash context onto the report's signal
/// record.
pub fn signal_info(ctx: &crash_context::CrashContext) -> Option<SignalInfo> {
    ctx.exception.as_ref().map(|exc| SignalInfo {
        number: exc.kind as u32,
        code: exc.code as u32,
        address: exc.subcode.unwrap_or(0),
    })
}

/// Captures a full report for the crashed thread described by `ctx`.
pub fn capture_crash_context(
    reporter: &mut Reporter,
    ctx: &crash_context::CrashContext,
    sink: &mut dyn ReportSink,
) -> Result<()> {
    let task = MachTask::new(ctx.task);
    let images = dyld_image_list(&task)?;
    let state = thread_state_snapshot(ctx.thread)?;
    reporter.capture(&task, &state, &images, sink, signal_info(ctx).as_ref())
}
