//! Boot sequence
//!
//! Runs once on the boot hart: seed the frame allocator from the boot
//! memory map, build and install the kernel page table, migrate the
//! allocator to the kernel alias, bring up the heap and the subsystems,
//! spawn the init task, and start taking timer interrupts.
//!
//! The FDT and ELF-loader collaborators are reached only through their
//! interfaces here; absent a device tree the QEMU virt defaults apply.

#![allow(dead_code)]

use crate::mm::{self, Rwx, VirtAddr, FRAME_SIZE};
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use crate::mm::{MemRegion, PhysAddr, RegionStatus};

/// QEMU virt machine RAM.
const RAM_BASE: usize = 0x8000_0000;
const RAM_SIZE: usize = 128 * 1024 * 1024;

/// Kernel heap: one order-10 buddy block (4 MiB).
const HEAP_ORDER: usize = 10;

/// Where the init task starts; the loader collaborator normally fills the
/// code VMA from the boot filesystem.
const INIT_ENTRY: usize = 0x1_0000;
const INIT_CODE_SIZE: usize = 16 * FRAME_SIZE;

/// Fallback init image: park in a yield loop, preserving the PCB
/// capability handed over in a0.
///
/// ```text
/// mv   s0, a0
/// loop: mv a0, s0; li a7, 2; ecall; j loop
/// ```
const INIT_STUB: [u32; 5] = [
    0x0005_0413, // mv s0, a0
    0x0004_0513, // mv a0, s0
    0x0020_0893, // li a7, SYS_YIELD
    0x0000_0073, // ecall
    0xFF5F_F06F, // j -12
];

/// Boot memory map. With a device tree present the FDT collaborator
/// produces this; the fallback describes QEMU virt with the kernel image
/// carved out.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn boot_memory_map(_dtb: usize) -> [MemRegion; 2] {
    extern "C" {
        static __kernel_start: u8;
        static __kernel_end: u8;
    }
    // SAFETY: linker-script symbols delimiting the loaded kernel image.
    let (kernel_start, kernel_end) = unsafe {
        (
            core::ptr::addr_of!(__kernel_start) as usize,
            core::ptr::addr_of!(__kernel_end) as usize,
        )
    };

    [
        MemRegion {
            start: PhysAddr(kernel_start),
            size: kernel_end - kernel_start,
            status: RegionStatus::Reserved,
        },
        MemRegion {
            start: PhysAddr(kernel_end),
            size: RAM_BASE + RAM_SIZE - kernel_end,
            status: RegionStatus::Free,
        },
    ]
}

/// Full bring-up; never returns.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn run(hart_id: usize, dtb: usize) -> ! {
    crate::log_service::init(log::LevelFilter::Info);
    println!("FerriteOS kernel booting on hart {hart_id}");

    // Physical memory first: everything else allocates frames.
    let regions = boot_memory_map(dtb);
    mm::init(&regions);

    // Kernel heap, carved from the buddy while addresses are still
    // identity-mapped.
    let heap = mm::FRAME_ALLOCATOR
        .lock()
        .alloc_order(HEAP_ORDER)
        .expect("boot: no room for the kernel heap");
    crate::heap_init(heap.as_usize() as *mut u8, (1 << HEAP_ORDER) * FRAME_SIZE);

    // Kernel page table: identity map for the running image, plus the
    // linear alias of all physical memory.
    let kernel_table = build_kernel_space();
    kernel_table.switch_root();
    mm::set_kernel_root(kernel_table.root());
    mm::post_init();
    log::info!(
        "boot: paging online, {} frames free",
        mm::FRAME_ALLOCATOR.lock().free_frames_total()
    );

    crate::cap::init();
    crate::task::init();
    crate::sched::init();
    crate::trap::init();

    spawn_init();

    crate::arch::riscv64::timer::init(None);
    crate::arch::riscv64::enable_timer_interrupt();
    crate::arch::riscv64::enable_interrupts();
    log::info!("boot: timer armed, entering idle loop");

    loop {
        crate::arch::riscv64::idle();
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn build_kernel_space() -> mm::PageTable {
    let mut guard = mm::FRAME_ALLOCATOR.lock();
    let alloc = &mut *guard;
    let mut table = mm::PageTable::new(alloc).expect("boot: no frame for the kernel root");
    table
        .map_range(
            alloc,
            VirtAddr(RAM_BASE),
            PhysAddr(RAM_BASE),
            RAM_SIZE,
            Rwx::RWX,
            false,
            true,
            true,
        )
        .expect("boot: kernel identity mapping");
    table
        .map_range(
            alloc,
            VirtAddr(mm::PHYS_MAP_BASE + RAM_BASE),
            PhysAddr(RAM_BASE),
            RAM_SIZE,
            Rwx::RW,
            false,
            true,
            true,
        )
        .expect("boot: kernel linear alias");
    table
}

/// Create the init task and queue it. The code VMA is demand-paged; the
/// stub image is copied in through the kernel alias where the ELF loader
/// collaborator would place the real init binary.
fn spawn_init() {
    let mut table = crate::task::PROCESS_TABLE.lock();
    let mut sched = crate::sched::SCHEDULER.lock();
    let mut alloc = mm::FRAME_ALLOCATOR.lock();
    let mut caps = crate::cap::CAP_SYSTEM.lock();

    let pid = table
        .new_task(&mut alloc, &mut caps, VirtAddr(INIT_ENTRY), 1, 1, None)
        .expect("boot: init task");

    let proc = table.get_mut(pid).expect("just created");
    proc.memory
        .add_vma(mm::VmaKind::Code, VirtAddr(INIT_ENTRY), INIT_CODE_SIZE)
        .expect("boot: init code VMA");
    proc.memory
        .alloc_pages_for(&mut alloc, VirtAddr(INIT_ENTRY), 1, Rwx::RX, true)
        .expect("boot: init code page");

    let mut image = [0u8; INIT_STUB.len() * 4];
    for (i, word) in INIT_STUB.iter().enumerate() {
        image[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    mm::user_copy::memcpy_k2u(&proc.memory, VirtAddr(INIT_ENTRY), &image)
        .expect("boot: init image copy");

    sched.enqueue(&mut table, pid);
    log::info!("boot: init task is pid {pid}");
}
