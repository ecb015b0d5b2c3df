//! Hart-local primitives: interrupt flag control and MMIO ordering.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        use core::arch::asm;

        const SSTATUS_SIE: usize = 1 << 1;

        #[inline(always)]
        pub fn irqs_enabled() -> bool {
            let sstatus: usize;
            unsafe { asm!("csrr {}, sstatus", out(reg) sstatus) };
            sstatus & SSTATUS_SIE != 0
        }

        #[inline(always)]
        pub fn irq_disable() {
            unsafe { asm!("csrc sstatus, {}", in(reg) SSTATUS_SIE) };
        }

        #[inline(always)]
        pub fn irq_enable() {
            unsafe { asm!("csrs sstatus, {}", in(reg) SSTATUS_SIE) };
        }

        /// Order a device register access against subsequent observation.
        #[inline(always)]
        pub fn io_barrier() {
            unsafe { asm!("fence ow, ow") };
        }
    } else {
        use core::sync::atomic::{fence, AtomicBool, Ordering};

        // Stand-in for sstatus.SIE so the flag save/restore protocol keeps
        // working on non-RISC-V builds.
        static IRQ_FLAG: AtomicBool = AtomicBool::new(true);

        #[inline]
        pub fn irqs_enabled() -> bool {
            IRQ_FLAG.load(Ordering::Relaxed)
        }

        #[inline]
        pub fn irq_disable() {
            IRQ_FLAG.store(false, Ordering::Relaxed);
        }

        #[inline]
        pub fn irq_enable() {
            IRQ_FLAG.store(true, Ordering::Relaxed);
        }

        #[inline]
        pub fn io_barrier() {
            fence(Ordering::SeqCst);
        }
    }
}
