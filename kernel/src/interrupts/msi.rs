//! Message-signaled interrupt vectors: per-device descriptor registry and
//! the block allocator on top of an MSI-capable IRQ domain.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use log::trace;

use crate::{
    devices::Device,
    error::{Error, IrqError, MsiError, Result},
    sync::NoIrqMutex,
};

use super::domain::{irq_dispose_mapping, IrqDomain};
use super::{disable_irq_nosync, enable_irq};

/// Cap on a single MSI block. The message data field only carries five
/// low-order vector bits, so nothing larger can be addressed.
pub const MSI_MAX_VECTORS: u32 = 32;

/// The message a device writes to signal one vector. Opaque at this layer;
/// the controller driving the device fills it in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsiMsg {
    pub address_lo: u32,
    pub address_hi: u32,
    pub data: u32,
}

/// One allocated MSI vector.
pub struct MsiDesc {
    dev: Weak<Device>,
    hwirq: u32,
    virq: u32,
    msi_attrib: u16,
    /// log2 of the block size this descriptor heads; only meaningful for
    /// descriptors from [`msi_desc_alloc`].
    multiple: u8,
    msg: NoIrqMutex<MsiMsg>,
}

impl MsiDesc {
    fn new(dev: &Arc<Device>, hwirq: u32, virq: u32, msi_attrib: u16, multiple: u8) -> Arc<Self> {
        Arc::new(Self {
            dev: Arc::downgrade(dev),
            hwirq,
            virq,
            msi_attrib,
            multiple,
            msg: NoIrqMutex::new(MsiMsg::default()),
        })
    }

    #[inline]
    pub fn hwirq(&self) -> u32 {
        self.hwirq
    }

    /// Virtual IRQ backing this vector; 0 means unmapped.
    #[inline]
    pub fn virq(&self) -> u32 {
        self.virq
    }

    #[inline]
    pub fn msi_attrib(&self) -> u16 {
        self.msi_attrib
    }

    #[inline]
    pub fn multiple(&self) -> u8 {
        self.multiple
    }

    /// The owning device, while it is still alive. Descriptors never extend
    /// a device's lifetime.
    pub fn device(&self) -> Option<Arc<Device>> {
        self.dev.upgrade()
    }

    /// Copy of the last message written for this vector.
    pub fn msg(&self) -> MsiMsg {
        *self.msg.lock()
    }

    pub fn write_msg(&self, msg: MsiMsg) {
        *self.msg.lock() = msg;
    }

    /// Mask the vector. No-op while the vector is unmapped.
    pub fn mask(&self) {
        if self.virq != 0 {
            disable_irq_nosync(self.virq);
        }
    }

    /// Unmask the vector. No-op while the vector is unmapped.
    pub fn unmask(&self) {
        if self.virq != 0 {
            enable_irq(self.virq);
        }
    }

    /// Steer the vector to the harts in `cpu_mask`. Accepted but inert until
    /// SMP delivery exists.
    pub fn set_affinity(&self, _cpu_mask: u32) -> Result<()> {
        Ok(())
    }
}

/// Standalone descriptor allocation for callers composing their own blocks:
/// validates the count and records its log2 in `multiple`. The block
/// allocator below builds per-vector descriptors itself and leaves this
/// path alone.
pub fn msi_desc_alloc(dev: &Arc<Device>, nvec: u32) -> Result<Arc<MsiDesc>> {
    if nvec == 0 || nvec > MSI_MAX_VECTORS {
        return Err(MsiError::InvalidVectorCount.into());
    }
    let multiple = nvec.next_power_of_two().trailing_zeros() as u8;
    Ok(MsiDesc::new(dev, 0, 0, 0, multiple))
}

/// Per-device registry of live MSI descriptors. Insertion order is kept;
/// within one allocated block it equals ascending hwirq order.
pub struct MsiDeviceData {
    vectors: NoIrqMutex<VecDeque<Arc<MsiDesc>>>,
}

impl MsiDeviceData {
    fn new() -> Self {
        Self {
            vectors: NoIrqMutex::new(VecDeque::new()),
        }
    }

    pub fn num_vectors(&self) -> usize {
        self.vectors.lock().len()
    }

    /// Append a descriptor to the registry tail.
    pub fn add(&self, desc: Arc<MsiDesc>) {
        self.vectors.lock().push_back(desc);
    }

    /// Registry contents in traversal order.
    pub fn descriptors(&self) -> Vec<Arc<MsiDesc>> {
        self.vectors.lock().iter().cloned().collect()
    }
}

/// Opt a device into MSI: create its (empty) descriptor registry.
pub fn msi_device_init(dev: &Arc<Device>) -> Result<()> {
    dev.install_msi_data(MsiDeviceData::new())
}

/// Tear down a device's MSI state, dropping every descriptor still in the
/// registry. Safe on a device that never opted in.
pub fn msi_device_cleanup(dev: &Arc<Device>) {
    let Some(msi_data) = dev.take_msi_data() else {
        return;
    };
    let mut vectors = msi_data.vectors.lock();
    let drained = vectors.len();
    vectors.clear();
    if drained > 0 {
        trace!(target: "msi", "{}: dropped {} descriptors at cleanup", dev.name(), drained);
    }
}

/// Allocate a power-of-two block of MSI vectors for `dev`.
///
/// Picks the largest power of two not exceeding `max_vecs`; fails when that
/// undershoots `min_vecs` (a `min == max` request for a non-power-of-two
/// count can never succeed). On success every vector has a live mapping and
/// a registry entry, and the hardware ids are consecutive from a single
/// domain reservation. Any mid-flight failure unwinds completely: the
/// registry and the domain end up exactly as they were.
pub fn msi_alloc_vectors(dev: &Arc<Device>, min_vecs: u32, max_vecs: u32, flags: u32) -> Result<u32> {
    let msi_data = dev.msi_data().ok_or(MsiError::NotInitialized)?;
    let domain = dev.msi_domain().ok_or(MsiError::NoMsiDomain)?;

    if min_vecs == 0 || min_vecs > max_vecs || max_vecs > MSI_MAX_VECTORS {
        return Err(MsiError::InvalidVectorCount.into());
    }

    let mut nvec = 1;
    while nvec <= max_vecs {
        nvec <<= 1;
    }
    nvec >>= 1;

    if nvec < min_vecs {
        return Err(MsiError::InvalidVectorCount.into());
    }

    let mut vectors = msi_data.vectors.lock();

    let hwirq_base = domain.alloc_hwirq_range(nvec).map_err(Error::Irq)?;

    for i in 0..nvec {
        let hwirq = hwirq_base + i;
        let virq = domain.create_mapping(hwirq);
        if virq == 0 {
            // Unwind this call's tail of the registry, then drop the whole
            // reservation in one go.
            for _ in 0..i {
                if let Some(desc) = vectors.pop_back() {
                    irq_dispose_mapping(desc.virq);
                }
            }
            domain.free_hwirq_range(hwirq_base, nvec);
            return Err(IrqError::MappingFailed(hwirq).into());
        }
        vectors.push_back(MsiDesc::new(dev, hwirq, virq, (flags & 0xFFFF) as u16, 0));
    }

    trace!(
        target: "msi",
        "{}: allocated {} vectors at hwirq {}",
        dev.name(),
        nvec,
        hwirq_base
    );
    Ok(nvec)
}

/// Release every MSI vector of `dev`: mappings, hardware ids and registry
/// entries. The registry survives, empty.
pub fn msi_free_vectors(dev: &Arc<Device>) {
    let Some(msi_data) = dev.msi_data() else {
        return;
    };
    let Some(domain) = dev.msi_domain() else {
        return;
    };

    let mut vectors = msi_data.vectors.lock();
    while let Some(desc) = vectors.pop_front() {
        if desc.virq != 0 {
            irq_dispose_mapping(desc.virq);
        }
        domain.free_hwirq_range(desc.hwirq, 1);
    }
}

/// Hierarchical MSI domains (a child domain stacked on a parent interrupt
/// domain) are not supported.
pub fn msi_create_domain(_parent: &Arc<IrqDomain>) -> Result<Arc<IrqDomain>> {
    Err(MsiError::Unsupported.into())
}
