mod no_irq_locks;

pub use no_irq_locks::*;
