//! Virtual IRQ layer: descriptors, chip operations and handler dispatch.
//!
//! Virtual IRQ numbers are the stable handles the rest of the kernel deals
//! in; hardware ids only exist inside a [`domain::IrqDomain`]. Number 0 is
//! reserved as invalid.

use core::any::Any;

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use log::{trace, warn};
use spin::Lazy;

use crate::{
    error::IrqError,
    sync::{NoIrqMutex, NoIrqRwLock},
};

pub mod domain;
pub mod msi;

use domain::IrqDomain;

/// Size cap for the descriptor table; virq 0 is never handed out.
const MAX_VIRQS: usize = 1024;

const HWIRQ_INVALID: u32 = u32::MAX;

pub type IrqHandler = fn(virq: u32, token: usize);

/// Chip-facing view of an interrupt: the hardware id plus whatever private
/// state the chip attached at map time.
pub struct IrqData {
    pub hwirq: u32,
    pub chip_data: Option<Arc<dyn Any + Send + Sync>>,
}

/// Operations an interrupt controller exposes per interrupt. All of them run
/// under the owning descriptor's lock; that lock is the serialization the
/// chip may rely on for read-modify-write register access.
pub trait IrqChip: Sync + Send {
    fn name(&self) -> &'static str;

    fn mask(&self, irq: &IrqData);
    fn unmask(&self, irq: &IrqData);

    fn enable(&self, irq: &IrqData) {
        self.unmask(irq);
    }

    fn disable(&self, irq: &IrqData) {
        self.mask(irq);
    }

    fn ack(&self, _irq: &IrqData) {}
}

#[derive(Clone, Copy)]
struct HandlerEntry {
    handler: IrqHandler,
    token: usize,
    name: &'static str,
}

struct IrqDescInner {
    data: IrqData,
    chip: Option<&'static dyn IrqChip>,
    domain: Weak<IrqDomain>,
    handler: Option<HandlerEntry>,
    /// Disable nesting count; 0 means enabled. Fresh descriptors start at 1.
    depth: u32,
}

pub struct IrqDesc {
    virq: u32,
    inner: NoIrqMutex<IrqDescInner>,
}

impl IrqDesc {
    fn new(virq: u32) -> Arc<Self> {
        Arc::new(Self {
            virq,
            inner: NoIrqMutex::new(IrqDescInner {
                data: IrqData {
                    hwirq: HWIRQ_INVALID,
                    chip_data: None,
                },
                chip: None,
                domain: Weak::new(),
                handler: None,
                depth: 1,
            }),
        })
    }

    #[inline]
    pub fn virq(&self) -> u32 {
        self.virq
    }

    pub fn hwirq(&self) -> u32 {
        self.inner.lock().data.hwirq
    }

    /// Attach a chip and its private data. Called from a domain's map op.
    pub fn set_chip(&self, chip: &'static dyn IrqChip, chip_data: Option<Arc<dyn Any + Send + Sync>>) {
        let mut inner = self.inner.lock();
        inner.chip = Some(chip);
        inner.data.chip_data = chip_data;
    }

    /// Mask at the chip regardless of the depth count. Used when a mapping
    /// is torn down underneath a still-referenced interrupt.
    pub(crate) fn force_mask(&self) {
        let inner = self.inner.lock();
        if let Some(chip) = inner.chip {
            chip.mask(&inner.data);
        }
    }

    pub(crate) fn bind_domain(&self, domain: &Arc<IrqDomain>, hwirq: u32) {
        let mut inner = self.inner.lock();
        inner.domain = Arc::downgrade(domain);
        inner.data.hwirq = hwirq;
    }

    pub(crate) fn unbind_domain(&self) {
        let mut inner = self.inner.lock();
        inner.domain = Weak::new();
        inner.data.hwirq = HWIRQ_INVALID;
        inner.chip = None;
        inner.data.chip_data = None;
    }

    pub(crate) fn domain_and_hwirq(&self) -> (Weak<IrqDomain>, u32) {
        let inner = self.inner.lock();
        (inner.domain.clone(), inner.data.hwirq)
    }
}

static IRQ_TABLE: Lazy<NoIrqRwLock<Vec<Option<Arc<IrqDesc>>>>> =
    Lazy::new(|| NoIrqRwLock::new(alloc::vec![None]));

/// Look up the descriptor behind a virtual IRQ number.
pub fn irq_to_desc(virq: u32) -> Option<Arc<IrqDesc>> {
    let table = IRQ_TABLE.read();
    table.get(virq as usize)?.clone()
}

/// Allocate the lowest free virq and install a fresh descriptor for it.
pub(crate) fn irq_desc_alloc() -> Result<Arc<IrqDesc>, IrqError> {
    let mut table = IRQ_TABLE.write();

    let slot = table.iter().skip(1).position(|d| d.is_none());
    let virq = match slot {
        Some(i) => i + 1,
        None if table.len() < MAX_VIRQS => {
            table.push(None);
            table.len() - 1
        }
        None => return Err(IrqError::NoFreeVirq),
    };

    let desc = IrqDesc::new(virq as u32);
    table[virq] = Some(desc.clone());
    Ok(desc)
}

pub(crate) fn irq_desc_free(virq: u32) {
    let mut table = IRQ_TABLE.write();
    let Some(slot) = table.get_mut(virq as usize) else {
        return;
    };
    if let Some(desc) = slot.take() {
        if desc.inner.lock().handler.is_some() {
            warn!(target: "interrupts", "Freeing IRQ {virq} with a handler still attached");
        }
    }
}

/// Install a handler and enable the interrupt. One handler per interrupt;
/// sharing is not supported.
pub fn request_irq(virq: u32, handler: IrqHandler, token: usize, name: &'static str) -> Result<(), IrqError> {
    let desc = irq_to_desc(virq).ok_or(IrqError::NoDescriptor(virq))?;
    let mut inner = desc.inner.lock();

    if inner.handler.is_some() {
        return Err(IrqError::HandlerInstalled);
    }
    inner.handler = Some(HandlerEntry { handler, token, name });

    if inner.depth > 0 {
        inner.depth -= 1;
        if inner.depth == 0 {
            if let Some(chip) = inner.chip {
                chip.enable(&inner.data);
            }
        }
    }
    trace!(target: "interrupts", "IRQ {virq} requested by {name}");
    Ok(())
}

/// Remove the handler installed by [`request_irq`] and disable the interrupt.
pub fn free_irq(virq: u32) {
    let Some(desc) = irq_to_desc(virq) else {
        return;
    };
    let mut inner = desc.inner.lock();
    let Some(entry) = inner.handler.take() else {
        return;
    };
    if inner.depth == 0 {
        inner.depth = 1;
        if let Some(chip) = inner.chip {
            chip.disable(&inner.data);
        }
    }
    trace!(target: "interrupts", "IRQ {virq} released by {}", entry.name);
}

/// Drop one level of disable; unmask at the chip when the count reaches zero.
pub fn enable_irq(virq: u32) {
    let Some(desc) = irq_to_desc(virq) else {
        return;
    };
    let mut inner = desc.inner.lock();
    if inner.depth > 0 {
        inner.depth -= 1;
        if inner.depth == 0 {
            if let Some(chip) = inner.chip {
                chip.unmask(&inner.data);
            }
        }
    }
}

/// Disable without waiting for a running handler to finish.
pub fn disable_irq_nosync(virq: u32) {
    let Some(desc) = irq_to_desc(virq) else {
        return;
    };
    let mut inner = desc.inner.lock();
    if inner.depth == 0 {
        if let Some(chip) = inner.chip {
            chip.mask(&inner.data);
        }
    }
    inner.depth += 1;
}

/// Dispatch a mapped interrupt: acknowledge it at the chip, then run the
/// installed handler. Disabled interrupts are dropped here.
pub fn generic_handle_irq(virq: u32) {
    let Some(desc) = irq_to_desc(virq) else {
        return;
    };

    let handler = {
        let inner = desc.inner.lock();
        if inner.depth > 0 {
            trace!(target: "interrupts", "Dropping IRQ {virq} while disabled");
            return;
        }
        if let Some(chip) = inner.chip {
            chip.ack(&inner.data);
        }
        inner.handler
    };

    // The handler runs without the descriptor lock so it may mask/unmask
    // its own interrupt.
    match handler {
        Some(entry) => (entry.handler)(virq, entry.token),
        None => warn!(target: "interrupts", "No handler for IRQ {virq}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn count_handler(_virq: u32, _token: usize) {
        FIRED.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn desc_alloc_skips_virq_zero() {
        let desc = irq_desc_alloc().unwrap();
        assert_ne!(desc.virq(), 0);
        irq_desc_free(desc.virq());
    }

    #[test]
    fn handler_lifecycle_and_depth() {
        let desc = irq_desc_alloc().unwrap();
        let virq = desc.virq();

        // Nothing runs while the descriptor is still disabled.
        generic_handle_irq(virq);
        assert_eq!(FIRED.load(Ordering::Relaxed), 0);

        request_irq(virq, count_handler, 0, "test").unwrap();
        assert_eq!(request_irq(virq, count_handler, 0, "dup"), Err(IrqError::HandlerInstalled));

        generic_handle_irq(virq);
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);

        // disable/enable nest.
        disable_irq_nosync(virq);
        disable_irq_nosync(virq);
        generic_handle_irq(virq);
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);
        enable_irq(virq);
        generic_handle_irq(virq);
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);
        enable_irq(virq);
        generic_handle_irq(virq);
        assert_eq!(FIRED.load(Ordering::Relaxed), 2);

        free_irq(virq);
        generic_handle_irq(virq);
        assert_eq!(FIRED.load(Ordering::Relaxed), 2);

        irq_desc_free(virq);
        assert!(irq_to_desc(virq).is_none());
    }
}
