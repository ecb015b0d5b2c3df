//! Device model and driver binding: devices carry the resources and
//! properties discovered from the device tree, drivers claim them through
//! compatible-string probing.

use core::any::Any;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use hashbrown::HashMap;
use log::{debug, trace, warn};
use spin::{lock_api::RwLock, Lazy};

use crate::{
    error::{DriverError, MsiError, Result},
    interrupts::{domain::IrqDomain, msi::MsiDeviceData},
};

pub mod interrupts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Mem,
    Irq,
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub kind: ResourceKind,
    pub start: u64,
    pub size: u64,
    /// Where the platform mapped the region, when it already did.
    pub mapped: Option<usize>,
}

pub struct Device {
    name: String,
    compatible: String,
    resources: Vec<Resource>,
    properties: HashMap<String, u32>,
    msi_data: RwLock<Option<Arc<MsiDeviceData>>>,
    msi_domain: RwLock<Option<Arc<IrqDomain>>>,
    driver_data: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Device {
    pub fn new(name: &str, compatible: &str) -> Self {
        Self {
            name: String::from(name),
            compatible: String::from(compatible),
            resources: Vec::new(),
            properties: HashMap::new(),
            msi_data: RwLock::new(None),
            msi_domain: RwLock::new(None),
            driver_data: RwLock::new(None),
        }
    }

    pub fn add_resource(&mut self, resource: Resource) {
        self.resources.push(resource);
    }

    pub fn set_property(&mut self, name: &str, value: u32) {
        self.properties.insert(String::from(name), value);
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device-tree compatible string list, entries separated as in the
    /// source blob.
    #[inline]
    pub fn compatible(&self) -> &str {
        &self.compatible
    }

    /// The `index`-th resource of the given kind.
    pub fn get_resource(&self, kind: ResourceKind, index: usize) -> Option<&Resource> {
        self.resources.iter().filter(|r| r.kind == kind).nth(index)
    }

    pub fn get_property_u32(&self, name: &str, default: u32) -> u32 {
        self.properties.get(name).copied().unwrap_or(default)
    }

    pub fn set_driver_data(&self, data: Arc<dyn Any + Send + Sync>) {
        *self.driver_data.write() = Some(data);
    }

    pub fn driver_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.driver_data.read().clone()
    }

    /// The domain this device allocates MSI vectors from.
    pub fn msi_domain(&self) -> Option<Arc<IrqDomain>> {
        self.msi_domain.read().clone()
    }

    pub fn set_msi_domain(&self, domain: Arc<IrqDomain>) {
        *self.msi_domain.write() = Some(domain);
    }

    pub fn msi_data(&self) -> Option<Arc<MsiDeviceData>> {
        self.msi_data.read().clone()
    }

    pub(crate) fn install_msi_data(&self, data: MsiDeviceData) -> Result<()> {
        let mut slot = self.msi_data.write();
        if slot.is_some() {
            return Err(MsiError::AlreadyInitialized.into());
        }
        *slot = Some(Arc::new(data));
        Ok(())
    }

    pub(crate) fn take_msi_data(&self) -> Option<Arc<MsiDeviceData>> {
        self.msi_data.write().take()
    }
}

/// How well a driver matched a device, best match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProbeScore {
    None,
    Generic,
    Vendor,
    Exact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverClass {
    Uart,
    Block,
    Timer,
    Intc,
    Misc,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverFlags: u32 {
        /// Compiled into the kernel rather than loaded.
        const BUILTIN = 1 << 0;
        /// Must bind before ordinary platform devices probe.
        const EARLY = 1 << 1;
    }
}

pub trait Driver: Sync + Send {
    fn name(&self) -> &'static str;
    fn class(&self) -> DriverClass;

    fn flags(&self) -> DriverFlags {
        DriverFlags::empty()
    }

    /// Lower value binds first among equal probe scores.
    fn priority(&self) -> u8 {
        0
    }

    fn probe(&self, dev: &Device) -> ProbeScore;
    fn attach(&self, dev: &Arc<Device>) -> Result<()>;
    fn detach(&self, dev: &Arc<Device>) -> Result<()>;
}

static DRIVERS: Lazy<RwLock<Vec<&'static dyn Driver>>> = Lazy::new(|| RwLock::new(Vec::new()));

pub fn driver_register(driver: &'static dyn Driver) -> Result<()> {
    let mut drivers = DRIVERS.write();
    if drivers.iter().any(|d| d.name() == driver.name()) {
        return Err(DriverError::AlreadyRegistered.into());
    }
    trace!(target: "devices", "Registered driver {}", driver.name());
    drivers.push(driver);
    Ok(())
}

/// Probe all registered drivers against `dev` and attach the best match.
pub fn probe_device(dev: &Arc<Device>) -> Result<()> {
    let mut best: Option<(&'static dyn Driver, ProbeScore)> = None;

    {
        let drivers = DRIVERS.read();
        for driver in drivers.iter() {
            let score = driver.probe(dev);
            if score == ProbeScore::None {
                continue;
            }
            let better = match best {
                None => true,
                Some((current, best_score)) => {
                    score > best_score
                        || (score == best_score && driver.priority() < current.priority())
                }
            };
            if better {
                best = Some((*driver, score));
            }
        }
    }

    let Some((driver, score)) = best else {
        warn!(target: "devices", "No driver for {} ({})", dev.name(), dev.compatible());
        return Err(DriverError::NoMatch.into());
    };

    debug!(
        target: "devices",
        "Attaching {} to {} (score {:?})",
        dev.name(),
        driver.name(),
        score
    );
    driver.attach(dev)
}
