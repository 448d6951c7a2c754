//! SYSCALL/SYSRET fast path
//!
//! MSR programming and the assembly trampoline between user mode and the
//! dispatcher. `syscall` arrives here with IF already cleared (FMASK), on the
//! caller's stack; the trampoline switches to the kernel stack recorded at
//! boot, captures the full register file, and hands the dispatcher a frame.

use core::sync::atomic::AtomicU64;

use x86_64::registers::model_specific::{Efer, EferFlags, LStar, Msr, SFMask};
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

use crate::bootinfo;
use crate::logger::{self, LogLevel, KERNEL_DEBUG_LOGGER};
use crate::syscall::{syscall_handler, SystemCallArgs};

/// STAR layout: kernel CS base 0x08 for SYSCALL, selector base 0x10 for
/// SYSRET's user segments (0x1B/0x23).
const STAR_VALUE: u64 = 0x0013_0008_0000_0000;

const MSR_STAR: u32 = 0xC000_0081;

/// Caller's RSP, parked here while the trampoline pivots onto the kernel
/// stack. A single slot suffices: one CPU, and FMASK keeps IF clear for the
/// whole window.
static USER_RSP_SCRATCH: AtomicU64 = AtomicU64::new(0);

/// Register file captured by the trampoline, in stack order.
#[repr(C)]
pub struct SyscallFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub user_rsp: u64,
    pub user_rip: u64,
    pub user_rflags: u64,
}

/// Trampoline installed in LSTAR.
///
/// In: RAX = number, RDI/RSI/RDX/R10/R8/R9 = arguments, RCX = user RIP,
/// R11 = user RFLAGS. Out: RAX = value, RDX = error. RBX, RBP, R12-R15 are
/// preserved through the saved frame.
#[unsafe(naked)]
unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        // Pivot to the kernel stack, keeping the caller's RSP reachable.
        "mov qword ptr [rip + {user_rsp}], rsp",
        "mov rsp, qword ptr [rip + {kernel_stack}]",
        // User return state first, then the full register file.
        "push r11",
        "push rcx",
        "push qword ptr [rip + {user_rsp}]",
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // Stack now holds user RSP, RIP, RFLAGS; reload return state and
        // leave. RCX/R11 are the sysret carriers, so clobbering them is fine.
        "mov rcx, [rsp + 8]",
        "mov r11, [rsp + 16]",
        "mov rsp, [rsp]",
        "sysretq",
        user_rsp = sym USER_RSP_SCRATCH,
        kernel_stack = sym bootinfo::KERNEL_STACK_TOP,
        dispatch = sym syscall_dispatch,
    );
}

/// C-level half of the fast path: unpack the frame, dispatch, pack the
/// result back into the slots the trampoline pops into RAX/RDX.
extern "C" fn syscall_dispatch(frame: &mut SyscallFrame) {
    let args = SystemCallArgs {
        args: [
            frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8, frame.r9,
        ],
    };
    let result = syscall_handler(frame.rax, &args);
    frame.rax = result.value as u64;
    frame.rdx = result.error as i64 as u64;
}

/// Program the syscall MSRs: STAR segment bases, LSTAR entry point, FMASK
/// (clear IF on entry), and EFER.SCE.
///
/// # Safety
///
/// Requires the GDT of `gdt::init` to be live, and the kernel stack top to
/// be recorded in `bootinfo`.
pub unsafe fn init() {
    logger::log_message(
        &KERNEL_DEBUG_LOGGER,
        LogLevel::Info,
        "syscall",
        format_args!("enabling syscall MSRs"),
    );

    Msr::new(MSR_STAR).write(STAR_VALUE);
    LStar::write(VirtAddr::new(syscall_entry as *const () as u64));
    SFMask::write(RFlags::INTERRUPT_FLAG);

    let efer = Efer::read();
    Efer::write(efer | EferFlags::SYSTEM_CALL_EXTENSIONS);

    logger::log_message(
        &KERNEL_DEBUG_LOGGER,
        LogLevel::Info,
        "syscall",
        format_args!(
            "syscall MSRs programmed: {{star={:#018x}, fmask={:#x}}}",
            STAR_VALUE, 0x200u64
        ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn frame_layout_matches_trampoline_pushes() {
        // 15 GPRs + user rsp/rip/rflags, packed in push order.
        assert_eq!(size_of::<SyscallFrame>(), 18 * 8);
        assert_eq!(offset_of!(SyscallFrame, r15), 0);
        assert_eq!(offset_of!(SyscallFrame, rbp), 8 * 8);
        assert_eq!(offset_of!(SyscallFrame, rax), 14 * 8);
        assert_eq!(offset_of!(SyscallFrame, user_rsp), 15 * 8);
        assert_eq!(offset_of!(SyscallFrame, user_rip), 16 * 8);
        assert_eq!(offset_of!(SyscallFrame, user_rflags), 17 * 8);
    }

    #[test]
    fn dispatch_writes_value_and_error_into_frame() {
        let mut frame = SyscallFrame {
            r15: 0, r14: 0, r13: 0, r12: 0, r11: 0, r10: 0, r9: 0, r8: 0,
            rbp: 0, rdi: 1, rsi: 0x1000, rdx: 13, rcx: 0, rbx: 0,
            rax: crate::syscall::SystemCallNumber::Write as u64,
            user_rsp: 0, user_rip: 0, user_rflags: 0,
        };
        syscall_dispatch(&mut frame);
        assert_eq!(frame.rax, 13);
        assert_eq!(frame.rdx, 0); // Success
    }

    #[test]
    fn dispatch_reports_errors_in_rdx() {
        let mut frame = SyscallFrame {
            r15: 0, r14: 0, r13: 0, r12: 0, r11: 0, r10: 0, r9: 0, r8: 0,
            rbp: 0, rdi: 0, rsi: 0, rdx: 0, rcx: 0, rbx: 0,
            rax: 99,
            user_rsp: 0, user_rip: 0, user_rflags: 0,
        };
        syscall_dispatch(&mut frame);
        assert_eq!(frame.rax, 0);
        assert_eq!(frame.rdx as i64, -1); // InvalidSyscall
    }

    #[test]
    fn star_value_encodes_selector_bases() {
        // SYSCALL CS base in bits 47:32, SYSRET base in bits 63:48.
        assert_eq!((STAR_VALUE >> 32) & 0xFFFF, 0x0008);
        assert_eq!(STAR_VALUE >> 48, 0x0013);
        assert_eq!(STAR_VALUE & 0xFFFF_FFFF, 0);
    }
}
