//! Serial port driver for debug output
//!
//! Brings up a 16550-compatible UART on COM1 and exposes the byte sink the
//! structured logger fans out to.

use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::port::Port;

/// I/O base of the first serial port.
const COM1_BASE: u16 = 0x3F8;

lazy_static! {
    /// COM1, shared by every log sink behind one lock. Brought up on first
    /// touch; `init` forces that during early boot.
    static ref COM1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base and nothing else in the
        // kernel drives these ports.
        let mut port = unsafe { SerialPort::new(COM1_BASE) };
        port.init();
        Mutex::new(port)
    };
}

/// Initialize the serial port.
///
/// The port is lazily initialized on first use; this forces it so the very
/// first log line already has a working sink. If no UART is present the
/// writes land nowhere and nothing is reported.
pub fn init() {
    let _ = COM1.lock();
}

/// Write a single byte, spinning until the transmitter holding register is
/// empty. No newline translation.
pub fn write_byte(byte: u8) {
    COM1.lock().send_raw(byte);
}

/// Write a string byte-by-byte, in order.
pub fn write_string(s: &str) {
    let mut port = COM1.lock();
    for byte in s.bytes() {
        port.send_raw(byte);
    }
}

/// Try to read a byte from the receive buffer (non-blocking).
pub fn read_byte() -> Option<u8> {
    let mut lsr = Port::<u8>::new(COM1_BASE + 5);
    let status: u8 = unsafe { lsr.read() };
    if status & 0x01 == 0 {
        return None;
    }

    let mut data = Port::<u8>::new(COM1_BASE);
    Some(unsafe { data.read() })
}

/// Backing function for the `serial_print!` macros.
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    COM1.lock().write_fmt(args).ok();
}

/// Write formatted text straight to COM1, bypassing the structured logger.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Like `serial_print!`, with a trailing newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
