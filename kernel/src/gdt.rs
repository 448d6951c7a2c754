//! GDT and TSS for x86_64 long mode
//!
//! Flat 4 GiB segmentation with Ring 0/3 separation and a 64-bit TSS.
//!
//! Layout:
//! - 0x00: Null descriptor
//! - 0x08: Kernel Code (Ring 0)
//! - 0x10: Kernel Data (Ring 0)
//! - 0x18: User Code (Ring 3, selector 0x1B)
//! - 0x20: User Data (Ring 3, selector 0x23)
//! - 0x28: TSS (16-byte system descriptor, slots 5 and 6)
//!
//! The TSS carries RSP0 = the boot stack top, which is the stack the CPU
//! switches to on a privilege transition and the stack the syscall entry
//! trampoline loads by hand.

use core::cell::UnsafeCell;
use core::mem::size_of;

use crate::logger::{self, LogLevel, HAL_LOGGER};

/// Segment selector for kernel code (Ring 0)
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
/// Segment selector for kernel data (Ring 0)
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
/// Segment selector for user code (Ring 3)
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;
/// Segment selector for user data (Ring 3)
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;
/// TSS selector
pub const TSS_SELECTOR: u16 = 0x28;

/// Number of 8-byte GDT slots (the TSS descriptor spans two).
const GDT_ENTRIES: usize = 7;

const SEGMENT_BASE: u32 = 0;
const SEGMENT_LIMIT: u32 = 0xFFFFF;

/// Access bytes
const ACCESS_KERNEL_CODE: u8 = 0x9A; // Present, ring 0, code, readable
const ACCESS_KERNEL_DATA: u8 = 0x92; // Present, ring 0, data, writable
const ACCESS_USER_CODE: u8 = 0xFA; // Present, ring 3, code, readable
const ACCESS_USER_DATA: u8 = 0xF2; // Present, ring 3, data, writable
const ACCESS_TSS: u8 = 0x89; // Present, 64-bit TSS (available)

/// Flag nibbles
const FLAG_GRANULARITY_BYTE: u8 = 0xA; // long mode code, byte granularity
const FLAG_GRANULARITY_4KB: u8 = 0xC; // 4 KiB granularity

/// One 8-byte segment descriptor.
#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct SegmentDescriptor {
    limit_low: u16,
    base_low: u16,
    base_middle: u8,
    access: u8,
    limit_high_flags: u8,
    base_high: u8,
}

impl SegmentDescriptor {
    pub const fn null() -> Self {
        SegmentDescriptor {
            limit_low: 0,
            base_low: 0,
            base_middle: 0,
            access: 0,
            limit_high_flags: 0,
            base_high: 0,
        }
    }

    /// The raw encoding, little-endian field order.
    pub fn as_bytes(&self) -> [u8; 8] {
        // SAFETY: repr(C, packed) with no padding, exactly 8 bytes.
        unsafe { core::mem::transmute(*self) }
    }
}

/// Pack semantic segment parameters into descriptor bytes.
pub fn create_segment_descriptor(
    base: u32,
    limit: u32,
    access: u8,
    flags: u8,
) -> SegmentDescriptor {
    SegmentDescriptor {
        limit_low: (limit & 0xFFFF) as u16,
        base_low: (base & 0xFFFF) as u16,
        base_middle: ((base >> 16) & 0xFF) as u8,
        access,
        limit_high_flags: (((limit >> 16) & 0x0F) as u8) | (flags << 4),
        base_high: ((base >> 24) & 0xFF) as u8,
    }
}

/// 64-bit Task State Segment.
#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct TaskStateSegment {
    reserved1: u32,
    /// Stack pointers for privilege levels 0-2
    pub rsp: [u64; 3],
    reserved2: u64,
    /// Interrupt Stack Table pointers
    pub ist: [u64; 7],
    reserved3: u64,
    reserved4: u16,
    /// I/O map base address
    pub iomap_base: u16,
}

impl TaskStateSegment {
    pub const fn new() -> Self {
        TaskStateSegment {
            reserved1: 0,
            rsp: [0; 3],
            reserved2: 0,
            ist: [0; 7],
            reserved3: 0,
            reserved4: 0,
            iomap_base: size_of::<TaskStateSegment>() as u16,
        }
    }
}

/// GDTR operand for `lgdt`.
#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u64,
}

/// `UnsafeCell` wrapper that is `Sync`.
///
/// The descriptor tables are written once during bring-up (interrupts still
/// disabled, single CPU) and only read afterwards, by us and by the
/// processor.
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

unsafe impl<T> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) const fn new(value: T) -> Self {
        SyncUnsafeCell(UnsafeCell::new(value))
    }

    pub(crate) fn get(&self) -> *mut T {
        self.0.get()
    }
}

static GDT: SyncUnsafeCell<[SegmentDescriptor; GDT_ENTRIES]> =
    SyncUnsafeCell::new([SegmentDescriptor::null(); GDT_ENTRIES]);

static TSS: SyncUnsafeCell<TaskStateSegment> = SyncUnsafeCell::new(TaskStateSegment::new());

/// Build and load the GDT and TSS.
///
/// `kernel_stack_top` becomes TSS RSP0: the stack used for Ring 3 → Ring 0
/// transitions (and reused by the syscall trampoline).
///
/// # Safety
///
/// Must be called exactly once, before interrupts are enabled.
pub unsafe fn init(kernel_stack_top: u64) {
    logger::log_message(
        &HAL_LOGGER,
        LogLevel::Info,
        "gdt",
        format_args!("building GDT entries"),
    );

    let gdt = &mut *GDT.get();
    let tss = &mut *TSS.get();

    gdt[0] = SegmentDescriptor::null();
    gdt[1] = create_segment_descriptor(
        SEGMENT_BASE,
        SEGMENT_LIMIT,
        ACCESS_KERNEL_CODE,
        FLAG_GRANULARITY_BYTE,
    );
    gdt[2] = create_segment_descriptor(
        SEGMENT_BASE,
        SEGMENT_LIMIT,
        ACCESS_KERNEL_DATA,
        FLAG_GRANULARITY_4KB,
    );
    gdt[3] = create_segment_descriptor(
        SEGMENT_BASE,
        SEGMENT_LIMIT,
        ACCESS_USER_CODE,
        FLAG_GRANULARITY_BYTE,
    );
    gdt[4] = create_segment_descriptor(
        SEGMENT_BASE,
        SEGMENT_LIMIT,
        ACCESS_USER_DATA,
        FLAG_GRANULARITY_4KB,
    );

    // TSS: RSP0 takes privilege transitions onto the boot stack; the I/O
    // permission map sits past the segment limit (no port access from Ring 3).
    tss.rsp[0] = kernel_stack_top;
    tss.iomap_base = size_of::<TaskStateSegment>() as u16;

    let tss_base = tss as *const TaskStateSegment as u64;
    let tss_limit = (size_of::<TaskStateSegment>() - 1) as u32;

    // 16-byte system descriptor across slots 5 and 6: the low slot is a
    // normal descriptor encoding, the high slot carries base bits 63:32.
    gdt[5] = create_segment_descriptor(tss_base as u32, tss_limit, ACCESS_TSS, 0x0);
    gdt[6] = SegmentDescriptor {
        limit_low: ((tss_base >> 32) & 0xFFFF) as u16,
        base_low: ((tss_base >> 48) & 0xFFFF) as u16,
        base_middle: 0,
        access: 0,
        limit_high_flags: 0,
        base_high: 0,
    };

    let gdt_pointer = GdtPointer {
        limit: (size_of::<[SegmentDescriptor; GDT_ENTRIES]>() - 1) as u16,
        base: gdt.as_ptr() as u64,
    };

    core::arch::asm!(
        "lgdt [{}]",
        in(reg) &gdt_pointer,
        options(readonly, nostack, preserves_flags)
    );
    logger::log_message(
        &HAL_LOGGER,
        LogLevel::Info,
        "gdt",
        format_args!("state transition {{from=Uninitialized, to=GdtLoaded}}"),
    );

    // Reload CS through a far return, then the data segment registers.
    core::arch::asm!(
        "push {sel}",
        "lea {tmp}, [rip + 2f]",
        "push {tmp}",
        "retfq",
        "2:",
        sel = in(reg) KERNEL_CODE_SELECTOR as u64,
        tmp = lateout(reg) _,
        options(preserves_flags)
    );
    core::arch::asm!(
        "mov ds, {0:x}",
        "mov es, {0:x}",
        "mov fs, {0:x}",
        "mov gs, {0:x}",
        "mov ss, {0:x}",
        in(reg) KERNEL_DATA_SELECTOR,
        options(nostack, preserves_flags)
    );
    logger::log_message(
        &HAL_LOGGER,
        LogLevel::Info,
        "gdt",
        format_args!("state transition {{from=GdtLoaded, to=SegmentsReloaded}}"),
    );

    core::arch::asm!(
        "ltr {0:x}",
        in(reg) TSS_SELECTOR,
        options(nostack, preserves_flags)
    );
    logger::log_message(
        &HAL_LOGGER,
        LogLevel::Info,
        "gdt",
        format_args!("state transition {{from=SegmentsReloaded, to=TssLoaded}}"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unpack an encoded descriptor back into (base, limit, access, flags).
    fn decode(bytes: [u8; 8]) -> (u32, u32, u8, u8) {
        let limit_low = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
        let base_low = u16::from_le_bytes([bytes[2], bytes[3]]) as u32;
        let base_middle = bytes[4] as u32;
        let access = bytes[5];
        let limit_high = (bytes[6] & 0x0F) as u32;
        let flags = bytes[6] >> 4;
        let base_high = bytes[7] as u32;

        let base = base_low | (base_middle << 16) | (base_high << 24);
        let limit = limit_low | (limit_high << 16);
        (base, limit, access, flags)
    }

    #[test]
    fn kernel_code_descriptor_bytes() {
        let descriptor = create_segment_descriptor(0, 0xFFFFF, 0x9A, 0xC);
        assert_eq!(
            descriptor.as_bytes(),
            [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9A, 0xCF, 0x00]
        );
    }

    #[test]
    fn encoding_round_trips() {
        let cases: &[(u32, u32, u8, u8)] = &[
            (0, 0xFFFFF, ACCESS_KERNEL_CODE, FLAG_GRANULARITY_BYTE),
            (0, 0xFFFFF, ACCESS_KERNEL_DATA, FLAG_GRANULARITY_4KB),
            (0, 0xFFFFF, ACCESS_USER_CODE, FLAG_GRANULARITY_BYTE),
            (0, 0xFFFFF, ACCESS_USER_DATA, FLAG_GRANULARITY_4KB),
            (0xDEAD_BEEF, 0x1234, ACCESS_TSS, 0x0),
            (0xFFFF_FFFF, 0xF_FFFF, 0xFF, 0xF),
        ];
        for &(base, limit, access, flags) in cases {
            let descriptor = create_segment_descriptor(base, limit, access, flags);
            assert_eq!(decode(descriptor.as_bytes()), (base, limit, access, flags));
        }
    }

    #[test]
    fn null_descriptor_is_all_zero() {
        assert_eq!(SegmentDescriptor::null().as_bytes(), [0u8; 8]);
    }

    #[test]
    fn tss_defaults() {
        let tss = TaskStateSegment::new();
        assert_eq!(size_of::<TaskStateSegment>(), 104);
        let iomap_base = tss.iomap_base;
        assert_eq!(iomap_base, 104);
    }

    #[test]
    fn selectors_match_layout() {
        assert_eq!(KERNEL_CODE_SELECTOR, 0x08);
        assert_eq!(KERNEL_DATA_SELECTOR, 0x10);
        assert_eq!(USER_CODE_SELECTOR, 0x1B);
        assert_eq!(USER_DATA_SELECTOR, 0x23);
        assert_eq!(TSS_SELECTOR, 0x28);
    }
}
