// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Logging for the warehouse workspace
//!
//! A thin layer over `emit` so every crate logs the same way:
//! - `WAREHOUSE_LOG=off` (default) - no logs
//! - `WAREHOUSE_LOG=info` - store/migrate outcomes
//! - `WAREHOUSE_LOG=debug` - chunk transfers, registry paging, retries
//! - `WAREHOUSE_LOG=warn` / `error` - problems only

use std::sync::Once;

// Re-export emit so the macros resolve from any crate
pub use emit;

/// Environment variable consulted by [`init_diagnostics`]
pub const LOG_ENV_VAR: &str = "WAREHOUSE_LOG";

static INIT: Once = Once::new();

/// Maps a `WAREHOUSE_LOG` value to a minimum level. `None` means logging is off.
fn level_for(value: &str) -> Option<emit::Level> {
    match value.trim().to_ascii_lowercase().as_str() {
        "off" | "" => None,
        "debug" => Some(emit::Level::Debug),
        "warn" => Some(emit::Level::Warn),
        "error" => Some(emit::Level::Error),
        _ => Some(emit::Level::Info),
    }
}

/// Initialize diagnostics from the `WAREHOUSE_LOG` environment variable
///
/// Safe to call more than once; only the first call installs the emitter.
pub fn init_diagnostics() {
    INIT.call_once(|| {
        let value = std::env::var(LOG_ENV_VAR).unwrap_or_else(|_| "off".to_string());
        let Some(level) = level_for(&value) else {
            return;
        };

        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(level))
            .init();

        let known = matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "debug" | "info" | "warn" | "error"
        );
        if !known {
            emit::warn!("unknown {var} value {value}, logging at info", var: LOG_ENV_VAR, value: value.as_str());
        }

        // The runtime lives for the whole process.
        std::mem::forget(rt);
    });
}

/// Log operation outcomes (stores, lookups, migrations)
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Log internal detail (chunk transfers, paging, cache decisions)
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Log recoverable conditions (retries, dropped fields, fallbacks)
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Log failures (aborted transfers, failed migration entries)
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

pub use init_diagnostics as init;
