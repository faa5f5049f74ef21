//! End-to-end unwinding scenarios over synthetic images and stacks,
//! mirroring the libunwind-derived regression corpus: frame-based and
//! frameless compact encodings, DWARF-only walks, and the cursor's
//! termination behavior.

mod common;

use common::*;
use crash_unwind::cursor::{Cursor, FrameReader, MAX_FRAME_DEPTH, Provenance};
use crash_unwind::error::Error;
use crash_unwind::thread_state::{Arch, ThreadState, amd64, arm64, x86};
use crash_unwind::unwind::compact::CompactUnwindReader;
use crash_unwind::unwind::dwarf::DwarfCfiReader;
use crash_unwind::{Image, ImageList};

const BASE: u64 = 0x1_0000_0000;

const RBX_V: u64 = 0x1234_5678_8765_4321;
const R12_V: u64 = 0x0246_8ACE_ECA8_6420;
const R13_V: u64 = 0x1357_9BDF_FDB9_7531;
const R14_V: u64 = 0x1122_3344_5566_7788;
const R15_V: u64 = 0x0022_4466_88AA_CCEE;

// RBP frame, save area 5 words below rbp: r15 r14 r13 r12 rbx ascending
const ENC_FRAME_SAVED: u32 = 0x0100_0000 | (5 << 16) | 0x14e5;
// RBP frame, nothing saved
const ENC_FRAME_PLAIN: u32 = 0x0100_0000;
// Frameless indirect: subq immediate at function offset 7, five registers
// saved, identity permutation
const ENC_FRAMELESS_IND: u32 = 0x0300_0000 | (7 << 16) | (5 << 10);

fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn amd64_image(task: &mut FakeTask, unwind_sect: Vec<u8>) -> ImageList {
    let mut def = ImageDef::new_64(BASE, 0x1000);
    def.sections.push(SectionDef {
        seg: "__TEXT",
        sect: "__unwind_info",
        addr: BASE + 0x800,
        data: unwind_sect,
    });
    build_image(task, &def);

    let mut images = ImageList::new();
    images.append(Image::new(BASE, &b"/usr/lib/test.dylib"[..]));
    images
}

/// The common two-caller stack: the test function's frame record at
/// 0x7fff0028, its caller's at 0x7fff0060.
fn amd64_frame_stack(task: &mut FakeTask) {
    let mut stack = vec![0u8; 0x80];
    put_u64(&mut stack, 0x00, R15_V);
    put_u64(&mut stack, 0x08, R14_V);
    put_u64(&mut stack, 0x10, R13_V);
    put_u64(&mut stack, 0x18, R12_V);
    put_u64(&mut stack, 0x20, RBX_V);
    put_u64(&mut stack, 0x28, 0x7fff_0060); // saved rbp -> caller frame
    put_u64(&mut stack, 0x30, BASE + 0x190); // return into the caller
    put_u64(&mut stack, 0x60, 0x7fff_00a0); // caller's saved rbp
    put_u64(&mut stack, 0x68, BASE + 0x208); // caller's return site
    task.add_region(0x7fff_0000, stack);
}

fn assert_saved_regs(state: &ThreadState) {
    assert_eq!(state.get(amd64::Reg::Rbx).unwrap(), RBX_V);
    assert_eq!(state.get(amd64::Reg::R12).unwrap(), R12_V);
    assert_eq!(state.get(amd64::Reg::R13).unwrap(), R13_V);
    assert_eq!(state.get(amd64::Reg::R14).unwrap(), R14_V);
    assert_eq!(state.get(amd64::Reg::R15).unwrap(), R15_V);
}

#[test]
fn amd64_frame_based_compact_unwind() {
    let mut task = FakeTask::new();
    let images = amd64_image(
        &mut task,
        unwind_info_regular(&[(0x100, ENC_FRAME_SAVED), (0x180, ENC_FRAME_PLAIN)], 0x1000),
    );
    amd64_frame_stack(&mut task);

    let mut state = ThreadState::new(Arch::Amd64);
    state.set(amd64::Reg::Rip, BASE + 0x110);
    state.set(amd64::Reg::Rbp, 0x7fff_0028);
    state.set(amd64::Reg::Rsp, 0x7ffe_ffe0);
    state.set(amd64::Reg::Rax, 0xbad); // volatile, must not survive

    let mut cursor = Cursor::new(&task, &images, state);

    let frame = cursor.next().unwrap().expect("first advance");
    assert_eq!(frame.provenance, Provenance::CompactUnwind);
    assert_eq!(frame.state.ip().unwrap(), BASE + 0x190);
    assert_eq!(frame.state.sp().unwrap(), 0x7fff_0038);
    assert_eq!(frame.state.fp().unwrap(), 0x7fff_0060);
    assert_saved_regs(&frame.state);
    assert!(!frame.state.has(amd64::Reg::Rax));

    let frame = cursor.next().unwrap().expect("second advance");
    assert_eq!(frame.state.ip().unwrap(), BASE + 0x208);
    assert_eq!(frame.state.sp().unwrap(), 0x7fff_0070);
    assert_eq!(frame.state.fp().unwrap(), 0x7fff_00a0);
    // Nothing volatile touched them on the way up
    assert_saved_regs(&frame.state);
    assert_eq!(cursor.depth(), 2);
}

#[test]
fn amd64_frameless_big_indirect_stack_size() {
    const S: u64 = 0x7ffe_fe00;

    let mut task = FakeTask::new();
    let images = amd64_image(
        &mut task,
        unwind_info_regular(
            &[
                (0x100, ENC_FRAME_SAVED),
                (0x180, ENC_FRAME_PLAIN),
                (0x300, ENC_FRAMELESS_IND),
            ],
            0x1000,
        ),
    );
    amd64_frame_stack(&mut task);

    // The `subq $0x200, %rsp` immediate the encoding points into the
    // function body for
    task.add_region(BASE + 0x300 + 7, 0x200u32.to_le_bytes().to_vec());

    // Frameless frame: 0x200 bytes of stack; five registers pushed above
    // the locals, return address on top
    let mut stack = vec![0u8; 0x200];
    put_u64(&mut stack, 0x1b8, RBX_V);
    put_u64(&mut stack, 0x1c0, R12_V);
    put_u64(&mut stack, 0x1c8, R13_V);
    put_u64(&mut stack, 0x1d0, R14_V);
    put_u64(&mut stack, 0x1d8, R15_V);
    put_u64(&mut stack, 0x1f8, BASE + 0x190);
    task.add_region(S, stack);

    let mut state = ThreadState::new(Arch::Amd64);
    state.set(amd64::Reg::Rip, BASE + 0x340);
    state.set(amd64::Reg::Rsp, S);
    // A frameless leaf leaves the caller's frame pointer untouched
    state.set(amd64::Reg::Rbp, 0x7fff_0060);

    let mut cursor = Cursor::new(&task, &images, state);

    let frame = cursor.next().unwrap().expect("first advance");
    assert_eq!(frame.state.ip().unwrap(), BASE + 0x190);
    assert_eq!(frame.state.sp().unwrap(), S + 0x200);
    assert_saved_regs(&frame.state);

    let frame = cursor.next().unwrap().expect("second advance");
    assert_eq!(frame.state.ip().unwrap(), BASE + 0x208);
    assert_eq!(frame.state.sp().unwrap(), 0x7fff_0070);
    assert_saved_regs(&frame.state);
}

#[test]
fn amd64_compressed_page_lookup() {
    let mut task = FakeTask::new();
    let images = amd64_image(
        &mut task,
        unwind_info_compressed(
            &[ENC_FRAME_PLAIN],
            &[ENC_FRAME_SAVED],
            0x100,
            // Encoding index 1 is the first page-local entry, index 0 the
            // common one
            &[(0x00, 1), (0x80, 0)],
            0x1000,
        ),
    );
    amd64_frame_stack(&mut task);

    let mut state = ThreadState::new(Arch::Amd64);
    state.set(amd64::Reg::Rip, BASE + 0x110);
    state.set(amd64::Reg::Rbp, 0x7fff_0028);
    state.set(amd64::Reg::Rsp, 0x7ffe_ffe0);

    let mut cursor = Cursor::new(&task, &images, state);

    let frame = cursor.next().unwrap().expect("first advance");
    assert_eq!(frame.state.ip().unwrap(), BASE + 0x190);
    assert_saved_regs(&frame.state);

    let frame = cursor.next().unwrap().expect("second advance");
    assert_eq!(frame.state.ip().unwrap(), BASE + 0x208);
}

/// An IP exactly at the next function's start must resolve to that
/// function, not its predecessor.
#[test]
fn compact_unwind_tie_break_at_function_start() {
    let mut task = FakeTask::new();
    let images = amd64_image(
        &mut task,
        unwind_info_regular(&[(0x100, ENC_FRAME_SAVED), (0x180, ENC_FRAME_PLAIN)], 0x1000),
    );
    amd64_frame_stack(&mut task);

    let sentinel = 0xaaaa_bbbb_cccc_dddd;
    let mut state = ThreadState::new(Arch::Amd64);
    state.set(amd64::Reg::Rip, BASE + 0x180);
    state.set(amd64::Reg::Rbp, 0x7fff_0060);
    state.set(amd64::Reg::Rsp, 0x7fff_0040);
    state.set(amd64::Reg::Rbx, sentinel);

    let mut cursor = Cursor::new(&task, &images, state);
    let frame = cursor.next().unwrap().expect("advance");

    assert_eq!(frame.state.ip().unwrap(), BASE + 0x208);
    assert_eq!(frame.state.sp().unwrap(), 0x7fff_0070);
    // The plain-frame encoding restores nothing; had the lookup picked the
    // previous function's encoding it would have clobbered rbx
    assert_eq!(frame.state.get(amd64::Reg::Rbx).unwrap(), sentinel);
}

#[test]
fn compact_unwind_out_of_range_ip_is_unknown() {
    let mut task = FakeTask::new();
    let images = amd64_image(
        &mut task,
        unwind_info_regular(&[(0x100, ENC_FRAME_SAVED)], 0x1000),
    );

    let mut state = ThreadState::new(Arch::Amd64);
    // Below the first covered function
    state.set(amd64::Reg::Rip, BASE + 0x50);
    state.set(amd64::Reg::Rsp, 0x7fff_0000);

    let readers: &[&dyn FrameReader] = &[&CompactUnwindReader];
    let mut cursor = Cursor::with_readers(&task, &images, state, readers);
    assert_eq!(cursor.next().err(), Some(Error::Unknown));
    // A failed walk is terminal
    assert!(cursor.next().unwrap().is_none());
}

fn amd64_eh_frame(base: u64) -> Vec<u8> {
    let mut out = Vec::new();

    // CIE: version 1, "zR", code align 1, data align -8, RA column 16
    let mut cie = Vec::new();
    push_u32(&mut cie, 0); // CIE id
    cie.push(1); // version
    cie.extend_from_slice(b"zR\0");
    cie.extend_from_slice(&uleb(1)); // code alignment
    cie.push(0x78); // data alignment: sleb(-8)
    cie.push(16); // return address register
    cie.extend_from_slice(&uleb(1)); // augmentation data length
    cie.push(0x00); // fde pointers: absptr
    // initial: cfa = rsp + 8, ra at cfa - 8
    cie.push(0x0c); // DW_CFA_def_cfa
    cie.extend_from_slice(&uleb(7));
    cie.extend_from_slice(&uleb(8));
    cie.push(0x80 | 16); // DW_CFA_offset r16
    cie.extend_from_slice(&uleb(1));
    push_u32(&mut out, cie.len() as u32);
    out.extend_from_slice(&cie);

    // FDE for the test function: a full frame with five saved registers,
    // r12 recovered through an expression
    let fde_off = out.len();
    let mut fde = Vec::new();
    push_u32(&mut fde, (fde_off + 4) as u32); // CIE back-pointer
    push_u64(&mut fde, base + 0x100);
    push_u64(&mut fde, 0x80);
    fde.extend_from_slice(&uleb(0)); // augmentation data length
    fde.push(0x0c); // DW_CFA_def_cfa rbp+16
    fde.extend_from_slice(&uleb(6));
    fde.extend_from_slice(&uleb(16));
    fde.push(0x80 | 6); // rbp at cfa-16
    fde.extend_from_slice(&uleb(2));
    fde.push(0x80 | 3); // rbx at cfa-24
    fde.extend_from_slice(&uleb(3));
    fde.push(0x80 | 13); // r13 at cfa-40
    fde.extend_from_slice(&uleb(5));
    fde.push(0x80 | 14); // r14 at cfa-48
    fde.extend_from_slice(&uleb(6));
    fde.push(0x80 | 15); // r15 at cfa-56
    fde.extend_from_slice(&uleb(7));
    // DW_CFA_expression r12: address = cfa - 32 (the CFA is pushed before
    // evaluation)
    fde.push(0x10);
    fde.extend_from_slice(&uleb(12));
    fde.extend_from_slice(&uleb(3));
    fde.extend_from_slice(&[0x08, 32, 0x1c]); // const1u 32; minus
    push_u32(&mut out, fde.len() as u32);
    out.extend_from_slice(&fde);

    // FDE for the caller: plain frame
    let fde_off = out.len();
    let mut fde = Vec::new();
    push_u32(&mut fde, (fde_off + 4) as u32);
    push_u64(&mut fde, base + 0x180);
    push_u64(&mut fde, 0x80);
    fde.extend_from_slice(&uleb(0));
    fde.push(0x0c);
    fde.extend_from_slice(&uleb(6));
    fde.extend_from_slice(&uleb(16));
    fde.push(0x80 | 6);
    fde.extend_from_slice(&uleb(2));
    push_u32(&mut out, fde.len() as u32);
    out.extend_from_slice(&fde);

    push_u32(&mut out, 0); // terminator
    out
}

#[test]
fn amd64_dwarf_only_unwind() {
    let mut task = FakeTask::new();
    let mut def = ImageDef::new_64(BASE, 0x1000);
    def.sections.push(SectionDef {
        seg: "__TEXT",
        sect: "__eh_frame",
        addr: BASE + 0xa00,
        data: amd64_eh_frame(BASE),
    });
    build_image(&mut task, &def);

    let mut images = ImageList::new();
    images.append(Image::new(BASE, &b"/usr/lib/test.dylib"[..]));

    amd64_frame_stack(&mut task);

    let mut state = ThreadState::new(Arch::Amd64);
    state.set(amd64::Reg::Rip, BASE + 0x110);
    state.set(amd64::Reg::Rbp, 0x7fff_0028);
    state.set(amd64::Reg::Rsp, 0x7ffe_ffe0);

    let readers: &[&dyn FrameReader] = &[&DwarfCfiReader];
    let mut cursor = Cursor::with_readers(&task, &images, state, readers);

    let frame = cursor.next().unwrap().expect("first advance");
    assert_eq!(frame.provenance, Provenance::DwarfCfi);
    assert_eq!(frame.state.ip().unwrap(), BASE + 0x190);
    assert_eq!(frame.state.sp().unwrap(), 0x7fff_0038);
    assert_eq!(frame.state.fp().unwrap(), 0x7fff_0060);
    assert_saved_regs(&frame.state);

    let frame = cursor.next().unwrap().expect("second advance");
    assert_eq!(frame.state.ip().unwrap(), BASE + 0x208);
    assert_eq!(frame.state.sp().unwrap(), 0x7fff_0070);
    assert_saved_regs(&frame.state);
}

const BASE32: u64 = 0x4000_0000;

#[test]
fn x86_frame_based_compact_unwind() {
    const EBX_V: u64 = 0x1234_4321;
    const ESI_V: u64 = 0x5678_8765;
    const EDI_V: u64 = 0xabcd_dcba;

    // Save area three words below ebp: edi esi ebx ascending
    let enc_a = 0x0100_0000 | (3 << 16) | (4 | (5 << 3) | (1 << 6));

    let mut task = FakeTask::new();
    let mut def = ImageDef::new_32(BASE32, 0x1000);
    def.sections.push(SectionDef {
        seg: "__TEXT",
        sect: "__unwind_info",
        addr: BASE32 + 0x800,
        data: unwind_info_regular(&[(0x100, enc_a), (0x180, ENC_FRAME_PLAIN)], 0x1000),
    });
    build_image(&mut task, &def);

    let mut images = ImageList::new();
    images.append(Image::new(BASE32, &b"/usr/lib/test32.dylib"[..]));

    const S: u64 = 0x7ff0_0000;
    let mut stack = vec![0u8; 0x60];
    put_u32(&mut stack, 0x00, EDI_V as u32);
    put_u32(&mut stack, 0x04, ESI_V as u32);
    put_u32(&mut stack, 0x08, EBX_V as u32);
    put_u32(&mut stack, 0x0c, 0x7ff0_0040); // saved ebp -> caller frame
    put_u32(&mut stack, 0x10, (BASE32 + 0x190) as u32);
    put_u32(&mut stack, 0x40, 0x7ff0_0080); // caller's saved ebp
    put_u32(&mut stack, 0x44, (BASE32 + 0x208) as u32);
    task.add_region(S, stack);

    let mut state = ThreadState::new(Arch::X86);
    state.set(x86::Reg::Eip, BASE32 + 0x110);
    state.set(x86::Reg::Ebp, S + 0x0c);
    state.set(x86::Reg::Esp, S - 0x20);

    let mut cursor = Cursor::new(&task, &images, state);

    let frame = cursor.next().unwrap().expect("first advance");
    assert_eq!(frame.state.ip().unwrap(), BASE32 + 0x190);
    assert_eq!(frame.state.sp().unwrap(), S + 0x14);
    assert_eq!(frame.state.fp().unwrap(), 0x7ff0_0040);
    assert_eq!(frame.state.get(x86::Reg::Ebx).unwrap(), EBX_V);
    assert_eq!(frame.state.get(x86::Reg::Esi).unwrap(), ESI_V);
    assert_eq!(frame.state.get(x86::Reg::Edi).unwrap(), EDI_V);

    let frame = cursor.next().unwrap().expect("second advance");
    assert_eq!(frame.state.ip().unwrap(), BASE32 + 0x208);
    assert_eq!(frame.state.sp().unwrap(), 0x7ff0_0048);
    assert_eq!(frame.state.get(x86::Reg::Ebx).unwrap(), EBX_V);
    assert_eq!(frame.state.get(x86::Reg::Esi).unwrap(), ESI_V);
    assert_eq!(frame.state.get(x86::Reg::Edi).unwrap(), EDI_V);
}

#[test]
fn frame_pointer_chain_walks_and_terminates() {
    const R: u64 = 0x5000_0000;

    let mut task = FakeTask::new();
    let mut region = vec![0u8; 0x60];
    put_u64(&mut region, 0x00, R + 0x20); // frame 0: next fp
    put_u64(&mut region, 0x08, 0x11_1000);
    put_u64(&mut region, 0x20, R + 0x40);
    put_u64(&mut region, 0x28, 0x11_2000);
    put_u64(&mut region, 0x40, 0); // chain terminator
    put_u64(&mut region, 0x48, 0x11_3000);
    task.add_region(R, region);

    let images = ImageList::new();

    let mut state = ThreadState::new(Arch::Arm64);
    state.set(arm64::Reg::Pc, 0x11_0000);
    state.set(arm64::Reg::Fp, R);
    state.set(arm64::Reg::Sp, R - 0x10);

    // No images are loaded, so the metadata-based readers fall through and
    // the frame-pointer reader does the walking
    let mut cursor = Cursor::new(&task, &images, state);

    let frame = cursor.next().unwrap().expect("first advance");
    assert_eq!(frame.provenance, Provenance::FramePointer);
    assert_eq!(frame.state.ip().unwrap(), 0x11_1000);
    assert_eq!(frame.state.sp().unwrap(), R + 0x10);

    let frame = cursor.next().unwrap().expect("second advance");
    assert_eq!(frame.state.ip().unwrap(), 0x11_2000);

    let frame = cursor.next().unwrap().expect("third advance");
    assert_eq!(frame.state.ip().unwrap(), 0x11_3000);
    assert_eq!(frame.state.fp().unwrap(), 0);

    // A NULL frame pointer ends the walk
    assert!(cursor.next().unwrap().is_none());
    assert_eq!(cursor.depth(), 3);
}

#[test]
fn misaligned_frame_pointer_ends_walk() {
    let task = FakeTask::new();
    let images = ImageList::new();

    let mut state = ThreadState::new(Arch::Amd64);
    state.set(amd64::Reg::Rip, 0x11_0000);
    state.set(amd64::Reg::Rbp, 0x5000_0001);
    state.set(amd64::Reg::Rsp, 0x5000_0000);

    let mut cursor = Cursor::new(&task, &images, state);
    assert!(cursor.next().unwrap().is_none());
}

#[test]
fn cyclic_frame_chain_is_cut_by_sp_monotonicity() {
    const R: u64 = 0x5000_0000;

    let mut task = FakeTask::new();
    let mut region = vec![0u8; 0x40];
    put_u64(&mut region, 0x00, R + 0x20);
    put_u64(&mut region, 0x08, 0x11_1000);
    put_u64(&mut region, 0x20, R); // cycles back to the first frame
    put_u64(&mut region, 0x28, 0x11_2000);
    task.add_region(R, region);

    let images = ImageList::new();

    let mut state = ThreadState::new(Arch::Amd64);
    state.set(amd64::Reg::Rip, 0x11_0000);
    state.set(amd64::Reg::Rbp, R);
    state.set(amd64::Reg::Rsp, R - 0x10);

    let mut cursor = Cursor::new(&task, &images, state);
    assert!(cursor.next().unwrap().is_some());
    assert!(cursor.next().unwrap().is_some());
    // The third frame's SP would move back down the stack
    assert!(cursor.next().unwrap().is_none());
    assert_eq!(cursor.depth(), 2);
}

#[test]
fn walk_depth_is_capped() {
    const R: u64 = 0x5000_0000;
    const FRAMES: u64 = 600;

    let mut task = FakeTask::new();
    let mut region = vec![0u8; (FRAMES as usize + 2) * 16];
    for i in 0..=FRAMES {
        put_u64(&mut region, (i * 16) as usize, R + (i + 1) * 16);
        put_u64(&mut region, (i * 16 + 8) as usize, 0xf0_0000 + i);
    }
    task.add_region(R, region);

    let images = ImageList::new();

    let mut state = ThreadState::new(Arch::Amd64);
    state.set(amd64::Reg::Rip, 0xe0_0000);
    state.set(amd64::Reg::Rbp, R);
    state.set(amd64::Reg::Rsp, R - 0x10);

    let mut cursor = Cursor::new(&task, &images, state);
    let mut advances = 0;
    while cursor.next().unwrap().is_some() {
        advances += 1;
    }
    assert_eq!(advances, MAX_FRAME_DEPTH);
}
