//! Kernel panic rendering
//!
//! Stop-the-world reporting: a FATAL record on the structured log, a full
//! `InterruptFrame` dump on the framebuffer console, then `hcf`. Every
//! exception handler tail-calls into here; nothing returns.

use core::fmt;

use crate::interrupts::InterruptFrame;
use crate::logger::{self, LogLevel, KERNEL_DEBUG_LOGGER};
use crate::terminal;
use crate::{print, println};

/// Halt and catch fire: interrupts off, then `hlt` forever.
pub fn hcf() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

fn render(message: &str, frame: &InterruptFrame, detail: Option<fmt::Arguments>) -> ! {
    logger::log_message(
        &KERNEL_DEBUG_LOGGER,
        LogLevel::Fatal,
        "panic",
        format_args!("kernel panic encountered: {}", message),
    );

    terminal::clear();
    terminal::set_fg_color(terminal::COLOR_RED);
    println!("Kernel panic!");
    terminal::set_fg_color(terminal::COLOR_WHITE);
    println!("{}\n", message);

    println!("R15:     {:#018X}", frame.r15);
    println!("R14:     {:#018X}", frame.r14);
    println!("R13:     {:#018X}", frame.r13);
    println!("R12:     {:#018X}", frame.r12);
    println!("R11:     {:#018X}", frame.r11);
    println!("R10:     {:#018X}", frame.r10);
    println!("R9:      {:#018X}", frame.r9);
    println!("R8:      {:#018X}", frame.r8);
    println!("RBP:     {:#018X}", frame.rbp);
    println!("RDI:     {:#018X}", frame.rdi);
    println!("RSI:     {:#018X}", frame.rsi);
    println!("RDX:     {:#018X}", frame.rdx);
    println!("RCX:     {:#018X}", frame.rcx);
    println!("RBX:     {:#018X}", frame.rbx);
    println!("RAX:     {:#018X}", frame.rax);
    println!("Vector:  {:#018X}", frame.interrupt_number);
    println!("Error:   {:#018X}", frame.error_code);
    println!("RIP:     {:#018X}", frame.rip);
    println!("CS:      {:#018X}", frame.cs);
    println!("RFLAGS:  {:#018X}", frame.rflags);
    println!("RSP:     {:#018X}", frame.rsp);
    println!("SS:      {:#018X}", frame.ss);

    if let Some(detail) = detail {
        println!();
        println!("{}", detail);
        logger::log_message(
            &KERNEL_DEBUG_LOGGER,
            LogLevel::Fatal,
            "panic",
            format_args!("{}", detail),
        );
    }

    print!("\nHalting and catching fire\n");

    hcf();
}

/// Render `frame` with a one-line cause and halt.
pub fn kernel_panic(message: &str, frame: &InterruptFrame) -> ! {
    render(message, frame, None)
}

/// Like `kernel_panic`, with an extra formatted detail line (used by the
/// page-fault path for the decoded fault cause).
pub fn kernel_panic_detailed(message: &str, frame: &InterruptFrame, detail: fmt::Arguments) -> ! {
    render(message, frame, Some(detail))
}
