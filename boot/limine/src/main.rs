//! Mirus kernel entry point
//!
//! Boots via a Limine-compatible loader. Validates the hand-off, then brings
//! the CPU up in order: serial, loggers, terminal, GDT/TSS, IDT and
//! exception stubs, physical memory manager, syscall MSRs. Any missing
//! loader contract is fatal: log and halt.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use heapless::Vec;
use limine::request::{
    ExecutableAddressRequest, ExecutableFileRequest, FramebufferRequest, HhdmRequest,
    MemoryMapRequest, ModuleRequest, RequestsEndMarker, RequestsStartMarker, StackSizeRequest,
};
use limine::BaseRevision;

use mirus_kernel::bootinfo::{self, MemoryRegion};
use mirus_kernel::logger::{self, LogLevel, HAL_LOGGER, KERNEL_DEBUG_LOGGER};
use mirus_kernel::panic::hcf;
use mirus_kernel::{gdt, interrupts, memory, serial, syscall, terminal};
use mirus_kernel::{log_fatal, log_info, println, serial_println};

/// Kernel stack size requested from the loader (16 KiB).
const KERNEL_STACK_SIZE: u64 = 16 * 1024;

/// Most memory-map entries the boot path will forward to the PMM.
const MAX_MEMORY_REGIONS: usize = 128;

// ============================================================================
// Limine protocol requests
// ============================================================================

#[used]
#[unsafe(link_section = ".requests_start_marker")]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

/// Limine base revision - ensures protocol compatibility
#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

/// Framebuffer for the virtual terminal
#[used]
#[unsafe(link_section = ".requests")]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

/// Memory map for the physical memory manager
#[used]
#[unsafe(link_section = ".requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

/// Higher-half direct map offset
#[used]
#[unsafe(link_section = ".requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

/// Bundled boot modules
#[used]
#[unsafe(link_section = ".requests")]
static MODULE_REQUEST: ModuleRequest = ModuleRequest::new();

/// Kernel load addresses
#[used]
#[unsafe(link_section = ".requests")]
static EXECUTABLE_ADDRESS_REQUEST: ExecutableAddressRequest = ExecutableAddressRequest::new();

/// Kernel file (for the footprint report)
#[used]
#[unsafe(link_section = ".requests")]
static EXECUTABLE_FILE_REQUEST: ExecutableFileRequest = ExecutableFileRequest::new();

/// Boot stack size
#[used]
#[unsafe(link_section = ".requests")]
static STACK_SIZE_REQUEST: StackSizeRequest = StackSizeRequest::new().with_size(KERNEL_STACK_SIZE);

#[used]
#[unsafe(link_section = ".requests_end_marker")]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

// ============================================================================
// Entry point
// ============================================================================

#[no_mangle]
unsafe extern "C" fn _start() -> ! {
    serial::init();
    logger::init(
        &KERNEL_DEBUG_LOGGER,
        &[serial::write_string],
        LogLevel::Debug,
    );
    logger::init(&HAL_LOGGER, &[serial::write_string], LogLevel::Debug);

    log_info!("boot", "Mirus kernel initialization");
    log_info!("boot", "serial driver loaded");

    // The loader must understand the base revision we were built against.
    if !BASE_REVISION.is_supported() {
        log_fatal!("boot", "bootloader version not compatible");
        hcf();
    }
    log_info!("boot", "bootloader version compatible");

    // The boot stack the loader set up is also the stack the TSS and the
    // syscall path will pivot to.
    // Align down to 16 so the syscall pivot lands on an ABI-aligned stack.
    let kernel_stack_top = bootinfo::current_stack_pointer() & !0xF;
    bootinfo::set_kernel_stack_top(kernel_stack_top);
    log_info!(
        "boot",
        "kernel stack found: {{top={:#018x}, requested_size={}, honored={}}}",
        kernel_stack_top,
        KERNEL_STACK_SIZE,
        STACK_SIZE_REQUEST.get_response().is_some()
    );

    // Framebuffer: needed for the virtual terminal and the panic screen.
    let framebuffer_response = match FRAMEBUFFER_REQUEST.get_response() {
        Some(response) if response.framebuffers().next().is_some() => response,
        _ => {
            log_fatal!("boot", "couldn't get framebuffer");
            hcf();
        }
    };
    let framebuffer = match framebuffer_response.framebuffers().next() {
        Some(framebuffer) => framebuffer,
        None => {
            log_fatal!("boot", "couldn't get framebuffer");
            hcf();
        }
    };
    log_info!("boot", "framebuffer loaded: {{width={}, height={}}}", framebuffer.width(), framebuffer.height());

    // Memory map: without it there is nothing to manage.
    let memory_map_response = match MEMORY_MAP_REQUEST.get_response() {
        Some(response) if !response.entries().is_empty() => response,
        _ => {
            log_fatal!("boot", "couldn't get memory map");
            hcf();
        }
    };
    log_info!("boot", "memory map loaded: {{entries={}}}", memory_map_response.entries().len());

    // Kernel address: reported for the footprint log.
    let executable_address_response = match EXECUTABLE_ADDRESS_REQUEST.get_response() {
        Some(response) if response.virtual_base() != 0 => response,
        _ => {
            log_fatal!("boot", "couldn't get kernel location");
            hcf();
        }
    };
    log_info!(
        "boot",
        "kernel location found: {{physical={:#018x}, virtual={:#018x}}}",
        executable_address_response.physical_base(),
        executable_address_response.virtual_base()
    );

    // Kernel file: its size bounds the kernel image in memory.
    let executable_file_response = match EXECUTABLE_FILE_REQUEST.get_response() {
        Some(response) => response,
        None => {
            log_fatal!("boot", "couldn't get kernel file");
            hcf();
        }
    };
    log_info!(
        "boot",
        "kernel file found: {{size={}}}",
        memory::format_memory_size(executable_file_response.file().size())
    );

    // HHDM: every PMM structure lives behind this offset.
    let hhdm_response = match HHDM_REQUEST.get_response() {
        Some(response) => response,
        None => {
            log_fatal!("boot", "couldn't get HHDM offset");
            hcf();
        }
    };
    log_info!("boot", "HHDM offset found: {{offset={:#018x}}}", hhdm_response.offset());

    // Bundled modules are optional; report what the loader brought.
    if let Some(module_response) = MODULE_REQUEST.get_response() {
        for module in module_response.modules() {
            log_info!(
                "boot",
                "bundled module: {{path={}, size={}}}",
                module.path().to_str().unwrap_or("<non-utf8>"),
                module.size()
            );
        }
    }

    // Virtual terminal on the framebuffer.
    terminal::init(
        framebuffer.addr(),
        framebuffer.width(),
        framebuffer.height(),
        framebuffer.pitch(),
        framebuffer.bpp(),
    );
    log_info!("boot", "virtual terminal initialized");

    // CPU tables: GDT and TSS first, then the IDT with its exception stubs.
    log_info!("boot", "starting GDT initialization");
    gdt::init(kernel_stack_top);
    log_info!("boot", "GDT initialized");

    log_info!("boot", "starting IDT initialization");
    interrupts::init();
    log_info!("boot", "IDT initialized, interrupts enabled");

    // Physical memory manager over the loader's map.
    log_info!("boot", "starting physical memory manager initialization");
    let mut regions: Vec<MemoryRegion, MAX_MEMORY_REGIONS> = Vec::new();
    for &entry in memory_map_response.entries() {
        if regions.push(MemoryRegion::from_entry(entry)).is_err() {
            log_fatal!("boot", "too many memory map entries");
            hcf();
        }
    }
    memory::pmm_initialize(&regions, hhdm_response.offset());
    log_info!("boot", "physical memory manager initialized");

    // Syscall fast path.
    log_info!("boot", "starting system call initialization");
    syscall::entry::init();
    log_info!("boot", "system calls initialized");

    log_info!("boot", "kernel initialization complete");

    // Smoke-test the allocator and the dispatcher from the boot thread,
    // then dump the allocator state as one streamed record.
    let (passed, failed) = memory::self_test();
    log_info!("boot", "pmm self test: {{passed={}, failed={}}}", passed, failed);
    let (passed, failed) = syscall::self_test();
    log_info!("boot", "syscall self test: {{passed={}, failed={}}}", passed, failed);
    memory::pmm_debug_print_state();

    println!("Mirus, ahoy!\n");
    serial_println!("Mirus, ahoy!");

    hcf();
}

/// Rust-level panics (assertion failures and the like, as opposed to CPU
/// exceptions) end the same way: log, render, halt.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    logger::log_message(
        &KERNEL_DEBUG_LOGGER,
        LogLevel::Fatal,
        "panic",
        format_args!("{}", info),
    );

    if terminal::is_initialized() {
        terminal::set_fg_color(terminal::COLOR_RED);
        println!("\nKernel panic!");
        terminal::set_fg_color(terminal::COLOR_WHITE);
        println!("{}", info);
    }

    hcf();
}
