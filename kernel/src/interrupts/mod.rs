//! Interrupt handling
//!
//! Ties together the IDT, the per-vector entry stubs, and the dispatcher,
//! and finishes the CPU-table bring-up sequence: gates installed, ISRs
//! registered, interrupts enabled.

pub mod handlers;
pub mod idt;
pub mod stubs;

use crate::logger::{self, LogLevel, HAL_LOGGER};

/// Register file captured by the common stub, plus the CPU-pushed interrupt
/// frame. Field order mirrors the stack layout, lowest address first.
#[repr(C)]
pub struct InterruptFrame {
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
    pub interrupt_number: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Install the IDT, point every vector at its stub, and enable interrupts.
///
/// # Safety
///
/// Requires the GDT/TSS from `gdt::init` to be live. Must be called exactly
/// once.
pub unsafe fn init() {
    idt::init();

    for (vector, stub) in stubs::ISR_STUBS.iter().enumerate() {
        idt::set_entry(vector, *stub as usize as u64);
    }
    for vector in stubs::ISR_STUBS.len()..idt::IDT_ENTRIES {
        idt::set_entry(vector, stubs::isr_stub_reserved as usize as u64);
    }
    logger::log_message(
        &HAL_LOGGER,
        LogLevel::Info,
        "idt",
        format_args!("registered {} exception stubs", stubs::ISR_STUBS.len()),
    );
    logger::log_message(
        &HAL_LOGGER,
        LogLevel::Info,
        "idt",
        format_args!("state transition {{from=IdtLoaded, to=IsrRegistered}}"),
    );

    x86_64::instructions::interrupts::enable();
    logger::log_message(
        &HAL_LOGGER,
        LogLevel::Info,
        "idt",
        format_args!("state transition {{from=IsrRegistered, to=InterruptsEnabled}}"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn frame_layout_matches_stub_pushes() {
        // 15 GPRs + vector + error code + 5 CPU-pushed words.
        assert_eq!(size_of::<InterruptFrame>(), 22 * 8);
        assert_eq!(offset_of!(InterruptFrame, r15), 0);
        assert_eq!(offset_of!(InterruptFrame, rax), 14 * 8);
        assert_eq!(offset_of!(InterruptFrame, interrupt_number), 15 * 8);
        assert_eq!(offset_of!(InterruptFrame, error_code), 16 * 8);
        assert_eq!(offset_of!(InterruptFrame, rip), 17 * 8);
        assert_eq!(offset_of!(InterruptFrame, ss), 21 * 8);
    }
}
