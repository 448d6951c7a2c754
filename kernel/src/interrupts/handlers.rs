//! Exception fan-out
//!
//! The common stub hands every vector to `interrupt_dispatch`, which maps it
//! to a policy. Every path is terminal in this release: the kernel renders
//! the captured frame and halts. Vector 14 additionally reads CR2 and
//! decodes the page-fault error code before panicking.

use core::fmt::Write;
use heapless::String;
use x86_64::structures::idt::PageFaultErrorCode;

use super::InterruptFrame;
use crate::panic::{kernel_panic, kernel_panic_detailed};

/// Render the decoded error-code breakdown, e.g. `present-page write
/// user-mode` for code 0x7. Bits beyond the five the panic message reports
/// are dropped.
pub fn describe_page_fault(error_code: u64) -> String<96> {
    let code = PageFaultErrorCode::from_bits_truncate(error_code);
    let mut out = String::new();

    out.push_str(if code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
        "present-page"
    } else {
        "non-present-page"
    })
    .ok();
    out.push_str(if code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
        " write"
    } else {
        " read"
    })
    .ok();
    out.push_str(if code.contains(PageFaultErrorCode::USER_MODE) {
        " user-mode"
    } else {
        " supervisor-mode"
    })
    .ok();
    if code.contains(PageFaultErrorCode::MALFORMED_TABLE) {
        out.push_str(" reserved-bit").ok();
    }
    if code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
        out.push_str(" instruction-fetch").ok();
    }

    out
}

fn page_fault(frame: &InterruptFrame) -> ! {
    let fault_address = read_cr2();
    let mut detail: String<160> = String::new();
    write!(
        detail,
        "page fault at {:#018X}: {}",
        fault_address,
        describe_page_fault(frame.error_code)
    )
    .ok();
    kernel_panic_detailed("Page fault exception", frame, format_args!("{}", detail));
}

#[cfg(target_arch = "x86_64")]
fn read_cr2() -> u64 {
    x86_64::registers::control::Cr2::read().as_u64()
}

/// Per-vector policy. Called by the common stub with the captured frame;
/// every current policy ends in a panic render.
pub extern "C" fn interrupt_dispatch(frame: &mut InterruptFrame) -> ! {
    match frame.interrupt_number {
        0 => kernel_panic("Division by zero error", frame),
        1 => kernel_panic("Debug exception", frame),
        2 => kernel_panic("Non-maskable interrupt exception", frame),
        3 => kernel_panic("Breakpoint exception", frame),
        4 => kernel_panic("INTO detected overflow exception", frame),
        5 => kernel_panic("Out of bounds exception", frame),
        6 => kernel_panic("Invalid opcode exception", frame),
        7 => kernel_panic("Device not available exception", frame),
        8 => kernel_panic("Double fault exception", frame),
        9 => kernel_panic("Coprocessor segment overrun", frame),
        10 => kernel_panic("Bad TSS exception", frame),
        11 => kernel_panic("Segment not present exception", frame),
        12 => kernel_panic("Stack fault exception", frame),
        13 => kernel_panic_detailed(
            "General protection fault exception",
            frame,
            format_args!("error code {:#x}", frame.error_code),
        ),
        14 => page_fault(frame),
        16 => kernel_panic("Floating point exception", frame),
        17 => kernel_panic("Alignment check exception", frame),
        18 => kernel_panic("Machine check exception", frame),
        19 => kernel_panic("SIMD floating point exception", frame),
        _ => kernel_panic("Reserved exception", frame),
    }
}
