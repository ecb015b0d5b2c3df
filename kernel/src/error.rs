use core::fmt::Debug;

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Irq error: {0}")]
    Irq(#[from] IrqError),

    #[error("Msi error: {0}")]
    Msi(#[from] MsiError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

impl Debug for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IrqError {
    #[error("Virtual IRQ space exhausted")]
    NoFreeVirq,

    #[error("No contiguous range of {0} hardware IRQs")]
    NoFreeHwirqRange(u32),

    #[error("Failed to map hardware IRQ {0}")]
    MappingFailed(u32),

    #[error("Invalid domain size")]
    InvalidDomainSize,

    #[error("IRQ already has a handler")]
    HandlerInstalled,

    #[error("No descriptor for IRQ {0}")]
    NoDescriptor(u32),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MsiError {
    #[error("Invalid vector count request")]
    InvalidVectorCount,

    #[error("Device has no MSI state")]
    NotInitialized,

    #[error("Device MSI state already initialized")]
    AlreadyInitialized,

    #[error("Device has no MSI domain")]
    NoMsiDomain,

    #[error("Hierarchical MSI domains are not supported")]
    Unsupported,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Controller already initialized")]
    AlreadyInitialized,

    #[error("Missing {0} resource")]
    MissingResource(&'static str),

    #[error("Invalid value for property {0}")]
    BadProperty(&'static str),

    #[error("Driver already registered")]
    AlreadyRegistered,

    #[error("No matching driver")]
    NoMatch,

    #[error("Operation not supported")]
    NotSupported,
}
