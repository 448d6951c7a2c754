//! System call interface
//!
//! Fixed dispatch table indexed by syscall number, reached through the
//! `syscall` fast path in `entry`. Handlers take the six-register argument
//! block and return a value/error pair; the error travels back to user mode
//! in RDX alongside the value in RAX.

pub mod entry;

use core::fmt::Write;

use heapless::String;

use crate::logger::{self, LogLevel, KERNEL_DEBUG_LOGGER};

/// Number of defined system calls. Grows as entries are added to the table.
pub const SYSCALL_COUNT: usize = 2;

/// Well-known system call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SystemCallNumber {
    Read = 0,
    Write = 1,
}

/// Error half of a system call result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum SystemCallError {
    Success = 0,
    InvalidSyscall = -1,
    InvalidArgs = -2,
    PermissionDenied = -3,
    NotImplemented = -4,
}

/// Register-file view of the caller's arguments (rdi, rsi, rdx, r10, r8, r9).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCallArgs {
    pub args: [u64; 6],
}

/// Value/error pair every handler produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemCallReturn {
    pub value: i64,
    pub error: SystemCallError,
}

/// Declared type of each argument slot. Only `Size` carries a runtime check
/// today (must be non-zero); the rest document the ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Int,
    Uint,
    Ptr,
    Size,
}

pub type SystemCallHandler = fn(&SystemCallArgs) -> SystemCallReturn;

/// One dispatch table slot.
pub struct SystemCallEntry {
    handler: Option<SystemCallHandler>,
    name: &'static str,
    arg_kinds: &'static [ArgKind],
}

static SYSCALL_TABLE: [SystemCallEntry; SYSCALL_COUNT] = [
    SystemCallEntry {
        handler: Some(syscall_read),
        name: "read",
        arg_kinds: &[ArgKind::Int, ArgKind::Ptr, ArgKind::Size],
    },
    SystemCallEntry {
        handler: Some(syscall_write),
        name: "write",
        arg_kinds: &[ArgKind::Int, ArgKind::Ptr, ArgKind::Size],
    },
];

/// read(fd, buf, count): stub until there is something to read from; reports
/// the full count as transferred.
fn syscall_read(args: &SystemCallArgs) -> SystemCallReturn {
    let count = args.args[2] as i64;
    SystemCallReturn {
        value: count,
        error: SystemCallError::Success,
    }
}

/// write(fd, buf, count): stub until file descriptors exist; reports the
/// full count as transferred.
fn syscall_write(args: &SystemCallArgs) -> SystemCallReturn {
    let count = args.args[2] as i64;
    SystemCallReturn {
        value: count,
        error: SystemCallError::Success,
    }
}

/// Check declared argument kinds against the actual values.
fn validate_args(args: &SystemCallArgs, kinds: &[ArgKind]) -> bool {
    kinds.iter().enumerate().all(|(i, kind)| match kind {
        ArgKind::Int | ArgKind::Uint | ArgKind::Ptr => true,
        ArgKind::Size => args.args[i] != 0,
    })
}

/// Render the populated argument slots for the dispatch log.
fn format_arg_list(args: &SystemCallArgs, count: usize) -> String<192> {
    let mut out = String::new();
    for (i, value) in args.args.iter().take(count).enumerate() {
        if i > 0 {
            out.push_str(", ").ok();
        }
        write!(out, "arg{}={:#x}", i + 1, value).ok();
    }
    out
}

/// Dispatch a system call to its handler.
///
/// Unknown numbers and empty slots produce `InvalidSyscall`; argument
/// validation failures produce `InvalidArgs`; otherwise the handler's own
/// `{value, error}` is returned unchanged.
pub fn syscall_handler(number: u64, args: &SystemCallArgs) -> SystemCallReturn {
    logger::log_message(
        &KERNEL_DEBUG_LOGGER,
        LogLevel::Debug,
        "syscall",
        format_args!("system call entered: {{number={}}}", number),
    );

    let entry = match SYSCALL_TABLE.get(number as usize) {
        Some(entry) if entry.handler.is_some() => entry,
        _ => {
            logger::log_message(
                &KERNEL_DEBUG_LOGGER,
                LogLevel::Error,
                "syscall",
                format_args!("invalid system call: {{number={}}}", number),
            );
            return SystemCallReturn {
                value: 0,
                error: SystemCallError::InvalidSyscall,
            };
        }
    };

    if entry.arg_kinds.len() > 6 {
        return SystemCallReturn {
            value: 0,
            error: SystemCallError::InvalidArgs,
        };
    }

    if !validate_args(args, entry.arg_kinds) {
        logger::log_message(
            &KERNEL_DEBUG_LOGGER,
            LogLevel::Error,
            "syscall",
            format_args!(
                "invalid arguments: {{name={}, {}}}",
                entry.name,
                format_arg_list(args, entry.arg_kinds.len())
            ),
        );
        return SystemCallReturn {
            value: 0,
            error: SystemCallError::InvalidArgs,
        };
    }

    logger::log_message(
        &KERNEL_DEBUG_LOGGER,
        LogLevel::Debug,
        "syscall",
        format_args!(
            "dispatching system call: {{name={}, number={}, args={{{}}}}}",
            entry.name,
            number,
            format_arg_list(args, entry.arg_kinds.len())
        ),
    );

    let handler = match entry.handler {
        Some(handler) => handler,
        None => {
            return SystemCallReturn {
                value: 0,
                error: SystemCallError::InvalidSyscall,
            }
        }
    };
    let result = handler(args);

    logger::log_message(
        &KERNEL_DEBUG_LOGGER,
        LogLevel::Debug,
        "syscall",
        format_args!(
            "system call completed: {{name={}, value={}, error={:?}}}",
            entry.name, result.value, result.error
        ),
    );

    result
}

/// Exercise the dispatcher from the boot thread. Returns (passed, failed).
pub fn self_test() -> (usize, usize) {
    let mut passed = 0;
    let mut failed = 0;
    let mut check = |name: &str, ok: bool| {
        if ok {
            passed += 1;
        } else {
            failed += 1;
            logger::log_message(
                &KERNEL_DEBUG_LOGGER,
                LogLevel::Error,
                "syscall",
                format_args!("self test {}: FAIL", name),
            );
        }
    };

    let message = "Hello, Mirus!";
    let args = SystemCallArgs {
        args: [1, message.as_ptr() as u64, message.len() as u64, 0, 0, 0],
    };
    let result = syscall_handler(SystemCallNumber::Write as u64, &args);
    check(
        "write returns its count",
        result
            == SystemCallReturn {
                value: message.len() as i64,
                error: SystemCallError::Success,
            },
    );

    let result = syscall_handler(99, &args);
    check(
        "unknown number rejected",
        result.error == SystemCallError::InvalidSyscall && result.value == 0,
    );

    let zero_count = SystemCallArgs {
        args: [1, message.as_ptr() as u64, 0, 0, 0, 0],
    };
    let result = syscall_handler(SystemCallNumber::Write as u64, &zero_count);
    check(
        "zero size rejected",
        result.error == SystemCallError::InvalidArgs && result.value == 0,
    );

    (passed, failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: [u64; 6]) -> SystemCallArgs {
        SystemCallArgs { args: values }
    }

    #[test]
    fn write_returns_count_and_success() {
        let result = syscall_handler(
            SystemCallNumber::Write as u64,
            &args([1, 0x1000, 13, 0, 0, 0]),
        );
        assert_eq!(result.value, 13);
        assert_eq!(result.error, SystemCallError::Success);
    }

    #[test]
    fn read_returns_count_and_success() {
        let result = syscall_handler(
            SystemCallNumber::Read as u64,
            &args([0, 0x2000, 64, 0, 0, 0]),
        );
        assert_eq!(result.value, 64);
        assert_eq!(result.error, SystemCallError::Success);
    }

    #[test]
    fn out_of_range_number_is_invalid_syscall() {
        let result = syscall_handler(99, &args([0; 6]));
        assert_eq!(result.value, 0);
        assert_eq!(result.error, SystemCallError::InvalidSyscall);

        let result = syscall_handler(SYSCALL_COUNT as u64, &args([0; 6]));
        assert_eq!(result.error, SystemCallError::InvalidSyscall);
    }

    #[test]
    fn zero_size_argument_is_rejected() {
        let result = syscall_handler(
            SystemCallNumber::Write as u64,
            &args([1, 0x1000, 0, 0, 0, 0]),
        );
        assert_eq!(result.value, 0);
        assert_eq!(result.error, SystemCallError::InvalidArgs);
    }

    #[test]
    fn dispatch_round_trips_handler_results() {
        // Every registered handler's own result must come back unchanged.
        for (number, entry) in SYSCALL_TABLE.iter().enumerate() {
            let call_args = args([1, 0x1000, 42, 4, 5, 6]);
            let direct = (entry.handler.unwrap())(&call_args);
            let dispatched = syscall_handler(number as u64, &call_args);
            assert_eq!(direct, dispatched, "syscall {}", entry.name);
        }
    }

    #[test]
    fn validate_args_only_checks_size() {
        let kinds = [ArgKind::Int, ArgKind::Uint, ArgKind::Ptr];
        assert!(validate_args(&args([0, 0, 0, 0, 0, 0]), &kinds));

        let kinds = [ArgKind::Int, ArgKind::Ptr, ArgKind::Size];
        assert!(validate_args(&args([0, 0, 1, 0, 0, 0]), &kinds));
        assert!(!validate_args(&args([0, 0, 0, 0, 0, 0]), &kinds));
    }

    #[test]
    fn table_matches_declared_numbers() {
        assert_eq!(SYSCALL_TABLE.len(), SYSCALL_COUNT);
        assert_eq!(SYSCALL_TABLE[SystemCallNumber::Read as usize].name, "read");
        assert_eq!(SYSCALL_TABLE[SystemCallNumber::Write as usize].name, "write");
        for entry in &SYSCALL_TABLE {
            assert!(entry.arg_kinds.len() <= 6);
        }
    }

    #[test]
    fn arg_list_formatting() {
        let list = format_arg_list(&args([1, 0xbeef, 13, 0, 0, 0]), 3);
        assert_eq!(list.as_str(), "arg1=0x1, arg2=0xbeef, arg3=0xd");
    }
}
