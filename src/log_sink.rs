//! # Log Sink
//!
//! A [`log::Log`] implementation for firmware: records are formatted into an
//! application-supplied output function (a UART writer, semihosting, RTT),
//! filtered by a per-module severity mask.
//!
//! Records are routed to a module by their `target`:
//!
//! | target                                   | module     |
//! |------------------------------------------|------------|
//! | `tickos::task`                           | `Task`     |
//! | `tickos::interrupt`, `tickos::scheduler` | `Dispatch` |
//! | other `tickos::*`                        | `Kernel`   |
//! | anything containing `driver`             | `Driver`   |
//! | everything else                          | `Boot`     |

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Module a log record is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogModule {
    Kernel,
    Boot,
    Driver,
    Dispatch,
    Task,
}

impl LogModule {
    const COUNT: usize = 5;

    pub fn of_target(target: &str) -> Self {
        if target.starts_with("tickos::task") {
            LogModule::Task
        } else if target.starts_with("tickos::interrupt") || target.starts_with("tickos::scheduler") {
            LogModule::Dispatch
        } else if target == "tickos" || target.starts_with("tickos::") {
            LogModule::Kernel
        } else if target.contains("driver") {
            LogModule::Driver
        } else {
            LogModule::Boot
        }
    }

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

#[inline]
const fn level_bit(level: Level) -> u8 {
    1 << level as usize
}

/// Mask enabling every level up to `filter`.
const fn mask_upto(filter: LevelFilter) -> u8 {
    let mut mask = 0;
    let mut level = 1;
    while level <= filter as usize {
        mask |= 1 << level;
        level += 1;
    }
    mask
}

/// Error, Warn and Info.
pub const DEFAULT_MASK: u8 = mask_upto(LevelFilter::Info);

/// Output function receiving one formatted record, newline included.
/// Failures are the sink's to swallow.
pub type LogOutput = fn(fmt::Arguments<'_>);

pub struct KernelLogger {
    output: LogOutput,
    masks: [AtomicU8; LogModule::COUNT],
}

impl KernelLogger {
    pub const fn new(output: LogOutput) -> Self {
        Self {
            output,
            masks: [
                AtomicU8::new(DEFAULT_MASK),
                AtomicU8::new(DEFAULT_MASK),
                AtomicU8::new(DEFAULT_MASK),
                AtomicU8::new(DEFAULT_MASK),
                AtomicU8::new(DEFAULT_MASK),
            ],
        }
    }

    /// Enable every level of `module` up to `filter` and disable the rest.
    pub fn set_level(&self, module: LogModule, filter: LevelFilter) {
        self.masks[module.index()].store(mask_upto(filter), Ordering::Relaxed);
    }

    pub fn enable(&self, module: LogModule, level: Level) {
        self.masks[module.index()].fetch_or(level_bit(level), Ordering::Relaxed);
    }

    pub fn disable(&self, module: LogModule, level: Level) {
        self.masks[module.index()].fetch_and(!level_bit(level), Ordering::Relaxed);
    }

    pub fn is_enabled(&self, module: LogModule, level: Level) -> bool {
        self.masks[module.index()].load(Ordering::Relaxed) & level_bit(level) != 0
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.is_enabled(LogModule::of_target(metadata.target()), metadata.level())
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        (self.output)(format_args!(
            "[{:<5} {}] {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Install `logger` as the global logger. The global maximum is the most
/// verbose level any module may ever need; per-module masks do the rest.
pub fn init(logger: &'static KernelLogger, max: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(logger)?;
    log::set_max_level(max);
    Ok(())
}
