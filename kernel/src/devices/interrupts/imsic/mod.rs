//! RISC-V Incoming MSI Controller (IMSIC).
//!
//! Every hart owns a 4 KiB interrupt file; devices raise interrupts by
//! writing an id into the file's SETEIPNUM doorbell. The controller owns the
//! linear IRQ domain that MSI allocation draws hardware ids from, and
//! dispatches pending ids up to the generic handler from the external
//! interrupt trap.

mod regs;

use core::any::Any;

use alloc::boxed::Box;
use alloc::sync::Arc;
use log::{info, trace, warn};
use spin::Once;
use tock_registers::interfaces::{Readable, Writeable};

use crate::{
    cpu,
    devices::{Device, Driver, DriverClass, DriverFlags, ProbeScore, ResourceKind},
    error::{DriverError, IrqError, Result},
    interrupts::{
        domain::{IrqDomain, IrqDomainOps},
        generic_handle_irq, irq_to_desc, IrqChip, IrqData,
    },
    utils::bits::ffs,
};

use regs::ImsicFileRegs;

/// Interrupt ids per file on the platforms we run on (QEMU virt).
pub const IMSIC_MAX_IDS: u32 = 256;
/// Byte distance between consecutive per-hart files.
pub const IMSIC_MMIO_STRIDE: u64 = 0x1000;

const COMPATIBLES: &[&str] = &["riscv,imsics", "qemu,imsics"];

/// One per-hart interrupt file.
pub struct ImsicFile {
    base: usize,
    hart_id: u32,
    num_ids: u32,
}

impl ImsicFile {
    fn new(base: usize, hart_id: u32, num_ids: u32) -> Self {
        debug_assert!(num_ids > 0 && num_ids <= IMSIC_MAX_IDS);
        Self {
            base,
            hart_id,
            num_ids,
        }
    }

    #[inline(always)]
    fn regs(&self) -> &ImsicFileRegs {
        unsafe { &*(self.base as *const ImsicFileRegs) }
    }

    #[inline]
    pub fn hart_id(&self) -> u32 {
        self.hart_id
    }

    #[inline]
    pub fn num_ids(&self) -> u32 {
        self.num_ids
    }

    pub fn set_pending(&self, id: u32) {
        self.regs().seteipnum.set(id);
        cpu::io_barrier();
    }

    pub fn clear_pending(&self, id: u32) {
        self.regs().clreipnum.set(id);
        cpu::io_barrier();
    }

    /// Read-modify-write of one EIE word. Not atomic against other writers;
    /// callers serialize through the owning IRQ descriptor's lock.
    pub fn set_enabled(&self, id: u32, enabled: bool) {
        let reg = &self.regs().eie[(id / 32) as usize];
        let mask = 1u32 << (id % 32);
        let word = reg.get();
        reg.set(if enabled { word | mask } else { word & !mask });
        cpu::io_barrier();
    }

    /// Only ids with priority below the threshold are delivered; 0 delivers
    /// everything.
    pub fn set_threshold(&self, value: u32) {
        self.regs().eithreshold.set(value);
        cpu::io_barrier();
    }

    pub fn set_delivery(&self, enabled: bool) {
        if enabled {
            self.regs().seteidelivery.set(1);
        } else {
            self.regs().clreidelivery.set(1);
        }
        cpu::io_barrier();
    }

    #[inline]
    fn pending_word(&self, index: usize) -> u32 {
        self.regs().eip[index].get()
    }
}

pub struct Imsic {
    files: Box<[Arc<ImsicFile>]>,
    num_harts: u32,
    num_ids: u32,
    base_ppn: u64,
    domain: Arc<IrqDomain>,
}

static PRIMARY: Once<Arc<Imsic>> = Once::new();

impl Imsic {
    /// The system's controller, once a device has attached.
    pub fn primary() -> Option<&'static Arc<Imsic>> {
        PRIMARY.get()
    }

    #[inline]
    fn file(&self) -> &ImsicFile {
        &self.files[0]
    }

    #[inline]
    pub fn domain(&self) -> &Arc<IrqDomain> {
        &self.domain
    }

    #[inline]
    pub fn num_harts(&self) -> u32 {
        self.num_harts
    }

    #[inline]
    pub fn num_ids(&self) -> u32 {
        self.num_ids
    }

    /// Physical address MSI producers (devices, the APLIC in MSI mode)
    /// write to in order to signal the given hart.
    pub fn msi_target_addr(&self, hart: u32) -> u64 {
        (self.base_ppn << 12) + hart as u64 * IMSIC_MMIO_STRIDE
    }
}

struct ImsicChip;
static CHIP: ImsicChip = ImsicChip;

fn chip_file(irq: &IrqData) -> Option<&ImsicFile> {
    irq.chip_data.as_ref()?.downcast_ref::<ImsicFile>()
}

impl IrqChip for ImsicChip {
    fn name(&self) -> &'static str {
        "riscv-imsic"
    }

    fn mask(&self, irq: &IrqData) {
        if let Some(file) = chip_file(irq) {
            file.set_enabled(irq.hwirq, false);
        }
    }

    fn unmask(&self, irq: &IrqData) {
        if let Some(file) = chip_file(irq) {
            file.set_enabled(irq.hwirq, true);
        }
    }

    fn ack(&self, irq: &IrqData) {
        if let Some(file) = chip_file(irq) {
            file.clear_pending(irq.hwirq);
        }
    }
}

struct ImsicDomainOps;
static DOMAIN_OPS: ImsicDomainOps = ImsicDomainOps;

impl IrqDomainOps for ImsicDomainOps {
    fn map(&self, domain: &Arc<IrqDomain>, virq: u32, hwirq: u32) -> core::result::Result<(), IrqError> {
        let desc = irq_to_desc(virq).ok_or(IrqError::NoDescriptor(virq))?;
        desc.set_chip(&CHIP, domain.host_data());
        trace!(target: "imsic", "bound id {} to virq {}", hwirq, virq);
        Ok(())
    }
}

fn attach(dev: &Arc<Device>) -> Result<()> {
    if PRIMARY.is_completed() {
        warn!(target: "imsic", "Already initialized, rejecting duplicate attach of {}", dev.name());
        return Err(DriverError::AlreadyInitialized.into());
    }

    let res = dev
        .get_resource(ResourceKind::Mem, 0)
        .ok_or(DriverError::MissingResource("MMIO"))?;
    let base_phys = res.start;
    let base = res.mapped.unwrap_or(base_phys as usize);

    let num_ids = dev.get_property_u32("riscv,num-ids", IMSIC_MAX_IDS);
    if num_ids == 0 || num_ids > IMSIC_MAX_IDS {
        return Err(DriverError::BadProperty("riscv,num-ids").into());
    }

    let file = Arc::new(ImsicFile::new(base, 0, num_ids));
    let domain = IrqDomain::create_linear(
        "imsic",
        num_ids,
        &DOMAIN_OPS,
        Some(file.clone() as Arc<dyn Any + Send + Sync>),
    )?;

    // Id 0 never signals; claim it so allocation starts at 1.
    let reserved = domain.alloc_hwirq_range(1)?;
    debug_assert_eq!(reserved, 0);

    let imsic = Arc::new(Imsic {
        files: Box::new([file]),
        num_harts: 1,
        num_ids,
        base_ppn: base_phys >> 12,
        domain,
    });

    info!(
        target: "imsic",
        "num_harts={}, num_ids={}, base_ppn={:#x}",
        imsic.num_harts,
        imsic.num_ids,
        imsic.base_ppn
    );

    dev.set_driver_data(imsic.clone());
    PRIMARY.call_once(|| imsic);
    Ok(())
}

/// External-interrupt entry: claim the lowest pending id on the boot hart's
/// file and dispatch it.
pub fn handle_irq() {
    let Some(imsic) = Imsic::primary() else {
        return;
    };
    let file = imsic.file();

    let words = imsic.num_ids.div_ceil(32);
    for k in 0..words {
        let word = file.pending_word(k as usize);
        if word == 0 {
            continue;
        }

        let hwirq = 32 * k + ffs(word) - 1;
        // Id 0 is reserved; computing it means nothing real is pending.
        if hwirq == 0 {
            return;
        }

        match imsic.domain.find_mapping(hwirq) {
            0 => warn!(target: "imsic", "Spurious MSI id {}", hwirq),
            virq => generic_handle_irq(virq),
        }
        file.clear_pending(hwirq);
        return;
    }
}

pub(super) struct ImsicDriver;
pub(super) static DRIVER: ImsicDriver = ImsicDriver;

impl Driver for ImsicDriver {
    fn name(&self) -> &'static str {
        "riscv-imsic"
    }

    fn class(&self) -> DriverClass {
        DriverClass::Intc
    }

    fn flags(&self) -> DriverFlags {
        DriverFlags::BUILTIN | DriverFlags::EARLY
    }

    fn probe(&self, dev: &Device) -> ProbeScore {
        if COMPATIBLES.iter().any(|c| dev.compatible().contains(c)) {
            ProbeScore::Exact
        } else {
            ProbeScore::None
        }
    }

    fn attach(&self, dev: &Arc<Device>) -> Result<()> {
        attach(dev)
    }

    fn detach(&self, _dev: &Arc<Device>) -> Result<()> {
        Err(DriverError::NotSupported.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{probe_device, Resource};
    use crate::interrupts::msi::{msi_alloc_vectors, msi_device_init};
    use crate::interrupts::request_irq;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::vec::Vec;

    // A fake interrupt file backed by plain memory. Doorbell writes land in
    // the backing store instead of latching bits, so tests assert on the
    // written values and poke EIP words directly to simulate the hardware.
    #[repr(C, align(4096))]
    struct FileWindow([u8; 0x1000]);

    fn new_window() -> &'static mut FileWindow {
        Box::leak(Box::new(FileWindow([0; 0x1000])))
    }

    fn read_u32(base: usize, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile((base + offset) as *const u32) }
    }

    fn write_u32(base: usize, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile((base + offset) as *mut u32, value) }
    }

    #[test]
    fn file_primitives_hit_the_right_offsets() {
        let window = new_window();
        let base = window.0.as_ptr() as usize;
        let file = ImsicFile::new(base, 0, 256);

        file.set_pending(17);
        assert_eq!(read_u32(base, 0x000), 17);

        file.clear_pending(17);
        assert_eq!(read_u32(base, 0x004), 17);

        file.set_threshold(3);
        assert_eq!(read_u32(base, 0x070), 3);

        file.set_delivery(true);
        assert_eq!(read_u32(base, 0x040), 1);
        file.set_delivery(false);
        assert_eq!(read_u32(base, 0x044), 1);
    }

    #[test]
    fn enable_bits_read_modify_write() {
        let window = new_window();
        let base = window.0.as_ptr() as usize;
        let file = ImsicFile::new(base, 0, 256);

        file.set_enabled(5, true);
        file.set_enabled(37, true);
        assert_eq!(read_u32(base, 0x0C0), 1 << 5);
        assert_eq!(read_u32(base, 0x0C4), 1 << (37 - 32));

        // Clearing one id leaves the other word alone.
        file.set_enabled(5, false);
        assert_eq!(read_u32(base, 0x0C0), 0);
        assert_eq!(read_u32(base, 0x0C4), 1 << (37 - 32));
    }

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn count_handler(_virq: u32, _token: usize) {
        FIRED.fetch_add(1, Ordering::Relaxed);
    }

    fn imsic_device(base: usize) -> Arc<Device> {
        let mut dev = Device::new("imsics@24000000", "riscv,imsics");
        dev.add_resource(Resource {
            kind: ResourceKind::Mem,
            start: 0x2400_0000,
            size: 0x1000,
            mapped: Some(base),
        });
        dev.set_property("riscv,num-ids", 64);
        Arc::new(dev)
    }

    // Attach, MSI allocation against the controller's domain, dispatch and
    // the singleton guard all share the process-wide PRIMARY slot, so they
    // run as one sequential scenario.
    #[test]
    fn attach_dispatch_and_singleton() {
        let window = new_window();
        let base = window.0.as_ptr() as usize;

        // Before any controller exists, the entry point is a no-op.
        if Imsic::primary().is_none() {
            handle_irq();
        }

        crate::devices::interrupts::register_builtin_drivers();
        let dev = imsic_device(base);
        probe_device(&dev).unwrap();

        let imsic = Imsic::primary().expect("controller attached");
        assert_eq!(imsic.num_harts(), 1);
        assert_eq!(imsic.num_ids(), 64);
        assert_eq!(imsic.msi_target_addr(0), 0x2400_0000);
        assert_eq!(imsic.msi_target_addr(1), 0x2400_1000);
        assert!(dev.driver_data().is_some());

        // A consumer draws vectors from the controller's domain. Id 0 is
        // reserved, so the first block starts at 1.
        let consumer = Arc::new(Device::new("nic0", "test,nic"));
        msi_device_init(&consumer).unwrap();
        consumer.set_msi_domain(imsic.domain().clone());
        assert_eq!(msi_alloc_vectors(&consumer, 8, 8, 0).unwrap(), 8);

        let descs = consumer.msi_data().unwrap().descriptors();
        assert_eq!(descs[0].hwirq(), 1);

        // Installing the handler unmasks at the chip: EIE bit appears.
        let target = &descs[4];
        assert_eq!(target.hwirq(), 5);
        request_irq(target.virq(), count_handler, 0, "nic0").unwrap();
        assert_eq!(read_u32(base, 0x0C0) & (1 << 5), 1 << 5);

        // Simulate the hardware latching id 5, then take the interrupt.
        write_u32(base, 0x080, 1 << 5);
        handle_irq();
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);
        // The level was cleared through the CLREIPNUM doorbell.
        assert_eq!(read_u32(base, 0x004), 5);

        // Masking through the descriptor clears the enable bit again.
        target.mask();
        assert_eq!(read_u32(base, 0x0C0) & (1 << 5), 0);
        target.unmask();
        assert_eq!(read_u32(base, 0x0C0) & (1 << 5), 1 << 5);

        // A second controller must be refused, leaving the first in place.
        let window2 = new_window();
        let dev2 = imsic_device(window2.0.as_ptr() as usize);
        assert!(probe_device(&dev2).is_err());
        assert!(Imsic::primary().is_some());
        assert!(core::ptr::eq(
            Arc::as_ptr(Imsic::primary().unwrap()),
            Arc::as_ptr(imsic)
        ));

        // Detach is not supported.
        assert!(DRIVER.detach(&dev).is_err());
    }

    #[test]
    fn probe_matches_only_imsic_compatibles() {
        assert_eq!(
            DRIVER.probe(&Device::new("a", "riscv,imsics")),
            ProbeScore::Exact
        );
        assert_eq!(
            DRIVER.probe(&Device::new("b", "qemu,imsics")),
            ProbeScore::Exact
        );
        assert_eq!(
            DRIVER.probe(&Device::new("c", "riscv,aplic")),
            ProbeScore::None
        );
    }

    #[test]
    fn pending_scan_finds_ids_in_higher_words() {
        // Pure bit math: word k with ffs gives 32k + n - 1.
        let word = 1u32 << 9;
        assert_eq!(32 * 2 + ffs(word) - 1, 73);
        let mixed = Vec::from([0u32, 0, 1 << 9]);
        let k = mixed.iter().position(|w| *w != 0).unwrap() as u32;
        assert_eq!(32 * k + ffs(mixed[k as usize]) - 1, 73);
    }
}
