use core::fmt::Write;

use log::Level;

use crate::sync::{no_irq_mutex, NoIrqMutex};

pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;
static OUTPUT: NoIrqMutex<Option<&'static mut (dyn Write + Send)>> = no_irq_mutex(None);

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::STATIC_MAX_LEVEL
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut output = OUTPUT.lock();
        let Some(output) = output.as_deref_mut() else {
            return;
        };

        let level = record.level();
        let color = match level {
            Level::Error => "\x1B[91m",
            Level::Warn => "\x1B[93m",
            Level::Info => "\x1B[97m",
            Level::Debug | Level::Trace => "\x1B[37m",
        };
        let _ = output.write_str(color);

        if level != Level::Info {
            let _ = write!(output, "[{}] ", level);
        }

        // don't show automatic (module path) targets
        let target = record.target();
        if !target.contains("::") && level != Level::Info {
            let _ = write!(output, "{}: ", target);
        }

        let _ = writeln!(output, "{}", record.args());
        let _ = output.write_str("\x1B[0m");
    }

    fn flush(&self) {}
}

pub fn init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::STATIC_MAX_LEVEL);
}

pub fn set_output(output: &'static mut (dyn Write + Send)) {
    *OUTPUT.lock() = Some(output);
}
