//! Kernel console
//!
//! Subsystem logging macros. They mirror the `log` crate's levels and keep
//! the calling module as target; a host build decides where records go by
//! installing a `log` backend (the simulator uses `env_logger`).

use core::fmt;

pub use log::Level;

/// Forward one record to the `log` facade
pub fn log(level: Level, module: &'static str, args: fmt::Arguments) {
    if level <= log::max_level() {
        log::logger().log(
            &log::Record::builder()
                .level(level)
                .target(module)
                .module_path_static(Some(module))
                .args(args)
                .build(),
        );
    }
}

pub mod loglvl {
    use log::LevelFilter;

    pub fn set_log_level(level: LevelFilter) {
        log::set_max_level(level)
    }

    pub fn enabled(level: super::Level) -> bool {
        level <= log::max_level()
    }
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {{
        if $crate::console::loglvl::enabled($crate::console::Level::Trace) {
            $crate::console::log($crate::console::Level::Trace, module_path!(), format_args!($($arg)*));
        }
    }}
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {{
        if $crate::console::loglvl::enabled($crate::console::Level::Debug) {
            $crate::console::log($crate::console::Level::Debug, module_path!(), format_args!($($arg)*));
        }
    }}
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {{
        if $crate::console::loglvl::enabled($crate::console::Level::Info) {
            $crate::console::log($crate::console::Level::Info, module_path!(), format_args!($($arg)*));
        }
    }}
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {{
        if $crate::console::loglvl::enabled($crate::console::Level::Warn) {
            $crate::console::log($crate::console::Level::Warn, module_path!(), format_args!($($arg)*));
        }
    }}
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {{
        if $crate::console::loglvl::enabled($crate::console::Level::Error) {
            $crate::console::log($crate::console::Level::Error, module_path!(), format_args!($($arg)*));
        }
    }}
}
