// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::sync::Mutex;

use log::{LevelFilter, Log, Metadata, Record};

/// Errors associated with logger initialization.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum LoggerError {
    /// A logger was already installed: {0}
    AlreadyInstalled(log::SetLoggerError),
}

/// Writes `[pid:level:module:line] message` lines to stderr.
#[derive(Debug)]
pub struct Logger {
    level: LevelFilter,
    // Serializes whole lines between threads.
    out: Mutex<std::io::Stderr>,
}

impl Logger {
    fn format(record: &Record) -> String {
        format!(
            "[{}:{}:{}:{}] {}",
            std::process::id(),
            record.level(),
            record.module_path().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        )
    }

    /// Installs a logger at `level` as the global `log` backend.
    pub fn init(level: LevelFilter) -> Result<(), LoggerError> {
        let logger = Box::new(Logger {
            level,
            out: Mutex::new(std::io::stderr()),
        });
        log::set_boxed_logger(logger).map_err(LoggerError::AlreadyInstalled)?;
        log::set_max_level(level);
        Ok(())
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = Logger::format(record);
        let mut out = self.out.lock().expect("Poisoned lock");
        // Nowhere to report a failing stderr.
        let _ = writeln!(out, "{}", line);
    }

    fn flush(&self) {
        let _ = self.out.lock().expect("Poisoned lock").flush();
    }
}

#[cfg(test)]
mod tests {
    use log::Level;

    use super::*;

    #[test]
    fn test_format() {
        let record = Record::builder()
            .args(format_args!("page {} served", 7))
            .level(Level::Info)
            .module_path(Some("page_server::server"))
            .line(Some(42))
            .build();
        let line = Logger::format(&record);
        assert!(line.ends_with(":INFO:page_server::server:42] page 7 served"));
    }

    #[test]
    fn test_enabled() {
        let logger = Logger {
            level: LevelFilter::Warn,
            out: Mutex::new(std::io::stderr()),
        };
        let warn = Metadata::builder().level(Level::Warn).build();
        let debug = Metadata::builder().level(Level::Debug).build();
        assert!(logger.enabled(&warn));
        assert!(!logger.enabled(&debug));
    }
}
