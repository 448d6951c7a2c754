//! Bootloader hand-off facts
//!
//! Typed views over what the Limine loader provides. The raw protocol
//! requests live in `main.rs` next to the entry point; this module owns the
//! shapes the rest of the kernel consumes: memory regions, the bundled-module
//! lookup, and the boot stack top that the TSS and the syscall entry reuse.

use core::sync::atomic::{AtomicU64, Ordering};
use limine::file::File;
use limine::memory_map::{Entry, EntryType};

/// Classified memory-map entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    Bad,
    BootloaderReclaimable,
    KernelAndModules,
    Framebuffer,
    Unknown,
}

impl RegionKind {
    /// Human-readable name, used by the memory-map log at boot.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionKind::Usable => "Usable",
            RegionKind::Reserved => "Reserved",
            RegionKind::AcpiReclaimable => "ACPI Reclaimable",
            RegionKind::AcpiNvs => "ACPI NVS",
            RegionKind::Bad => "Bad Memory",
            RegionKind::BootloaderReclaimable => "Bootloader Reclaimable",
            RegionKind::KernelAndModules => "Kernel and Modules",
            RegionKind::Framebuffer => "Framebuffer",
            RegionKind::Unknown => "Unknown",
        }
    }
}

/// One physical memory region from the loader's map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub fn from_entry(entry: &Entry) -> Self {
        let kind = match entry.entry_type {
            EntryType::USABLE => RegionKind::Usable,
            EntryType::RESERVED => RegionKind::Reserved,
            EntryType::ACPI_RECLAIMABLE => RegionKind::AcpiReclaimable,
            EntryType::ACPI_NVS => RegionKind::AcpiNvs,
            EntryType::BAD_MEMORY => RegionKind::Bad,
            EntryType::BOOTLOADER_RECLAIMABLE => RegionKind::BootloaderReclaimable,
            EntryType::EXECUTABLE_AND_MODULES => RegionKind::KernelAndModules,
            EntryType::FRAMEBUFFER => RegionKind::Framebuffer,
            _ => RegionKind::Unknown,
        };
        MemoryRegion {
            base: entry.base,
            length: entry.length,
            kind,
        }
    }
}

/// Top of the kernel stack the loader handed us (16 KiB, per the stack-size
/// request). Captured once in `kmain`; read by the GDT (TSS RSP0) and by the
/// syscall entry trampoline.
pub static KERNEL_STACK_TOP: AtomicU64 = AtomicU64::new(0);

pub fn set_kernel_stack_top(top: u64) {
    KERNEL_STACK_TOP.store(top, Ordering::SeqCst);
}

pub fn kernel_stack_top() -> u64 {
    KERNEL_STACK_TOP.load(Ordering::SeqCst)
}

/// Read the current stack pointer. Called first thing in `kmain` so the
/// recorded top sits at the loader-provided stack's high end.
#[inline(always)]
pub fn current_stack_pointer() -> u64 {
    let stack_ptr: u64;
    unsafe {
        core::arch::asm!("mov {}, rsp", out(reg) stack_ptr, options(nomem, nostack));
    }
    stack_ptr
}

/// Whether the module path `path` refers to the bundle entry `name`,
/// matching on the path suffix (loaders report full boot paths).
pub fn path_matches(path: &str, name: &str) -> bool {
    path.len() >= name.len() && path.ends_with(name)
}

/// Find a bundled module file by name (suffix match over module paths).
pub fn get_file<'a>(modules: &[&'a File], name: &str) -> Option<&'a File> {
    modules
        .iter()
        .find(|file| {
            file.path()
                .to_str()
                .map(|path| path_matches(path, name))
                .unwrap_or(false)
        })
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_suffix_matching() {
        assert!(path_matches("/boot/u_vga16.sfn", "u_vga16.sfn"));
        assert!(path_matches("u_vga16.sfn", "u_vga16.sfn"));
        assert!(!path_matches("/boot/u_vga16.sfn", "other.sfn"));
        assert!(!path_matches("vga16.sfn", "u_vga16.sfn"));
        assert!(!path_matches("", "u_vga16.sfn"));
    }

    #[test]
    fn region_kind_names() {
        assert_eq!(RegionKind::Usable.as_str(), "Usable");
        assert_eq!(RegionKind::KernelAndModules.as_str(), "Kernel and Modules");
        assert_eq!(RegionKind::BootloaderReclaimable.as_str(), "Bootloader Reclaimable");
    }
}
