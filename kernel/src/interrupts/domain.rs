//! Linear IRQ domains: a dense `hwirq -> virq` namespace plus the allocator
//! that hands out contiguous hardware-id ranges for MSI blocks.

use core::any::Any;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use log::trace;

use crate::{error::IrqError, sync::NoIrqMutex};

use super::{irq_desc_alloc, irq_desc_free, irq_to_desc};

/// Per-interrupt callouts a controller hooks into its domain.
pub trait IrqDomainOps: Sync + Send {
    /// Bind controller state to a freshly created mapping. Failure unwinds
    /// the mapping.
    fn map(&self, _domain: &Arc<IrqDomain>, _virq: u32, _hwirq: u32) -> Result<(), IrqError> {
        Ok(())
    }

    /// Mapping is going away; the default masks the interrupt at its chip.
    fn unmap(&self, _domain: &Arc<IrqDomain>, virq: u32) {
        if let Some(desc) = irq_to_desc(virq) {
            desc.force_mask();
        }
    }
}

struct DomainInner {
    /// hwirq -> virq, 0 meaning unmapped.
    revmap: Box<[u32]>,
    /// Range-reservation bitmap, one bit per hwirq.
    reserved: Box<[u32]>,
}

pub struct IrqDomain {
    name: &'static str,
    size: u32,
    ops: &'static dyn IrqDomainOps,
    host_data: Option<Arc<dyn Any + Send + Sync>>,
    inner: NoIrqMutex<DomainInner>,
}

#[inline]
fn bit_test(bitmap: &[u32], bit: u32) -> bool {
    bitmap[(bit / 32) as usize] & (1 << (bit % 32)) != 0
}

#[inline]
fn bit_set(bitmap: &mut [u32], bit: u32) {
    bitmap[(bit / 32) as usize] |= 1 << (bit % 32);
}

#[inline]
fn bit_clear(bitmap: &mut [u32], bit: u32) {
    bitmap[(bit / 32) as usize] &= !(1 << (bit % 32));
}

impl IrqDomain {
    /// Create a domain whose hardware ids are `[0, size)`.
    pub fn create_linear(
        name: &'static str,
        size: u32,
        ops: &'static dyn IrqDomainOps,
        host_data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Arc<Self>, IrqError> {
        if size == 0 || size > 10_000 {
            return Err(IrqError::InvalidDomainSize);
        }

        Ok(Arc::new(Self {
            name,
            size,
            ops,
            host_data,
            inner: NoIrqMutex::new(DomainInner {
                revmap: vec![0; size as usize].into_boxed_slice(),
                reserved: vec![0; size.div_ceil(32) as usize].into_boxed_slice(),
            }),
        }))
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn host_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.host_data.clone()
    }

    /// Reserve `count` consecutive hardware ids, first fit. The range stays
    /// unavailable to other callers until [`free_hwirq_range`].
    ///
    /// [`free_hwirq_range`]: IrqDomain::free_hwirq_range
    pub fn alloc_hwirq_range(&self, count: u32) -> Result<u32, IrqError> {
        if count == 0 || count > self.size {
            return Err(IrqError::NoFreeHwirqRange(count));
        }

        let mut inner = self.inner.lock();
        let mut run = 0;
        let mut start = 0;
        for hwirq in 0..self.size {
            if bit_test(&inner.reserved, hwirq) {
                run = 0;
                continue;
            }
            if run == 0 {
                start = hwirq;
            }
            run += 1;
            if run == count {
                for id in start..start + count {
                    bit_set(&mut inner.reserved, id);
                }
                trace!(target: "interrupts", "{}: reserved hwirqs {}..{}", self.name, start, start + count);
                return Ok(start);
            }
        }
        Err(IrqError::NoFreeHwirqRange(count))
    }

    /// Release a range previously handed out by [`alloc_hwirq_range`].
    ///
    /// [`alloc_hwirq_range`]: IrqDomain::alloc_hwirq_range
    pub fn free_hwirq_range(&self, base: u32, count: u32) {
        let mut inner = self.inner.lock();
        for hwirq in base..(base + count).min(self.size) {
            bit_clear(&mut inner.reserved, hwirq);
        }
    }

    /// Map a hardware id to a virtual IRQ, creating the descriptor and
    /// running the domain's map op. Returns the virq, or 0 on failure.
    /// Mapping the same hwirq twice returns the existing virq.
    pub fn create_mapping(self: &Arc<Self>, hwirq: u32) -> u32 {
        if hwirq >= self.size {
            return 0;
        }

        let existing = self.find_mapping(hwirq);
        if existing != 0 {
            return existing;
        }

        let Ok(desc) = irq_desc_alloc() else {
            return 0;
        };
        let virq = desc.virq();

        {
            let mut inner = self.inner.lock();
            if inner.revmap[hwirq as usize] != 0 {
                // Lost a race against another mapper; theirs wins.
                let theirs = inner.revmap[hwirq as usize];
                drop(inner);
                irq_desc_free(virq);
                return theirs;
            }
            inner.revmap[hwirq as usize] = virq;
        }

        desc.bind_domain(self, hwirq);

        if self.ops.map(self, virq, hwirq).is_err() {
            self.inner.lock().revmap[hwirq as usize] = 0;
            desc.unbind_domain();
            irq_desc_free(virq);
            return 0;
        }

        trace!(target: "interrupts", "{}: mapped hwirq {} -> virq {}", self.name, hwirq, virq);
        virq
    }

    /// Existing `hwirq -> virq` translation, 0 when unmapped.
    pub fn find_mapping(&self, hwirq: u32) -> u32 {
        if hwirq >= self.size {
            return 0;
        }
        self.inner.lock().revmap[hwirq as usize]
    }
}

/// Tear down a mapping created by [`IrqDomain::create_mapping`]. Safe on an
/// unmapped or invalid virq.
pub fn irq_dispose_mapping(virq: u32) {
    if virq == 0 {
        return;
    }
    let Some(desc) = irq_to_desc(virq) else {
        return;
    };
    let (domain, hwirq) = desc.domain_and_hwirq();
    let Some(domain) = domain.upgrade() else {
        return;
    };

    domain.ops.unmap(&domain, virq);

    {
        let mut inner = domain.inner.lock();
        if hwirq < domain.size && inner.revmap[hwirq as usize] == virq {
            inner.revmap[hwirq as usize] = 0;
        }
    }

    desc.unbind_domain();
    irq_desc_free(virq);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NopOps;
    static NOP_OPS: NopOps = NopOps;
    impl IrqDomainOps for NopOps {}

    struct FailingOps {
        fail_hwirq: u32,
    }
    static FAIL_AT_2: FailingOps = FailingOps { fail_hwirq: 2 };

    impl IrqDomainOps for FailingOps {
        fn map(&self, _domain: &Arc<IrqDomain>, _virq: u32, hwirq: u32) -> Result<(), IrqError> {
            if hwirq == self.fail_hwirq {
                Err(IrqError::MappingFailed(hwirq))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn rejects_degenerate_sizes() {
        assert!(IrqDomain::create_linear("t", 0, &NOP_OPS, None).is_err());
        assert!(IrqDomain::create_linear("t", 100_000, &NOP_OPS, None).is_err());
    }

    #[test]
    fn range_allocation_is_first_fit_and_exclusive() {
        let d = IrqDomain::create_linear("t", 16, &NOP_OPS, None).unwrap();

        assert_eq!(d.alloc_hwirq_range(4).unwrap(), 0);
        assert_eq!(d.alloc_hwirq_range(4).unwrap(), 4);
        assert_eq!(d.alloc_hwirq_range(8).unwrap(), 8);
        assert!(d.alloc_hwirq_range(1).is_err());

        // Freeing the middle block opens exactly that hole.
        d.free_hwirq_range(4, 4);
        assert!(d.alloc_hwirq_range(5).is_err());
        assert_eq!(d.alloc_hwirq_range(4).unwrap(), 4);
    }

    #[test]
    fn range_allocation_skips_holes_too_small() {
        let d = IrqDomain::create_linear("t", 16, &NOP_OPS, None).unwrap();
        assert_eq!(d.alloc_hwirq_range(3).unwrap(), 0);
        assert_eq!(d.alloc_hwirq_range(2).unwrap(), 3);
        d.free_hwirq_range(0, 3);
        // A 4-wide request must land after the still-reserved pair.
        assert_eq!(d.alloc_hwirq_range(4).unwrap(), 5);
    }

    #[test]
    fn mapping_roundtrip() {
        let d = IrqDomain::create_linear("t", 8, &NOP_OPS, None).unwrap();

        assert_eq!(d.find_mapping(3), 0);
        let virq = d.create_mapping(3);
        assert_ne!(virq, 0);
        assert_eq!(d.find_mapping(3), virq);
        // Idempotent on the same hwirq.
        assert_eq!(d.create_mapping(3), virq);

        let desc = irq_to_desc(virq).unwrap();
        assert_eq!(desc.hwirq(), 3);

        irq_dispose_mapping(virq);
        assert_eq!(d.find_mapping(3), 0);
        assert!(irq_to_desc(virq).is_none());
    }

    #[test]
    fn out_of_range_hwirq_fails() {
        let d = IrqDomain::create_linear("t", 4, &NOP_OPS, None).unwrap();
        assert_eq!(d.create_mapping(4), 0);
        assert_eq!(d.find_mapping(4), 0);
    }

    #[test]
    fn failing_map_op_unwinds() {
        let d = IrqDomain::create_linear("t", 8, &FAIL_AT_2, None).unwrap();
        assert_ne!(d.create_mapping(1), 0);
        assert_eq!(d.create_mapping(2), 0);
        // No stale state left behind for the failed hwirq.
        assert_eq!(d.find_mapping(2), 0);
        assert_ne!(d.create_mapping(3), 0);
    }

    #[test]
    fn dispose_tolerates_invalid_virqs() {
        irq_dispose_mapping(0);
        irq_dispose_mapping(u32::MAX - 1);
    }
}
