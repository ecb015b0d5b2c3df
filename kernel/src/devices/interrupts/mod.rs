use log::warn;

pub mod imsic;

/// Register the built-in interrupt-controller drivers with the driver core.
/// Runs once during early bring-up, before platform devices are probed.
pub fn register_builtin_drivers() {
    if let Err(e) = super::driver_register(&imsic::DRIVER) {
        warn!(target: "devices", "imsic driver registration failed: {}", e);
    }
}
