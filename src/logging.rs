//! Installs a `tracing` subscriber for applications that do not bring their own. The crate itself
//!  only emits events through the `tracing` macros and works with any subscriber.

use anyhow::anyhow;
use bitflags::bitflags;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{Level, Metadata};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    pub struct LogChannels: u8 {
        /// errors and warnings
        const ERROR   = 0b0001;
        /// lifecycle events
        const INFO    = 0b0010;
        /// per-packet diagnostics, e.g. discarded packets and retransmissions
        const DATA    = 0b0100;
        /// everything else
        const VERBOSE = 0b1000;
    }
}

impl LogChannels {
    pub fn for_level(level: &Level) -> LogChannels {
        match *level {
            Level::ERROR | Level::WARN => LogChannels::ERROR,
            Level::INFO => LogChannels::INFO,
            Level::DEBUG => LogChannels::DATA,
            Level::TRACE => LogChannels::VERBOSE,
        }
    }

    /// Parses channel names separated by `|`, e.g. `"ERROR | INFO"`
    pub fn parse(s: &str) -> anyhow::Result<LogChannels> {
        bitflags::parser::from_str::<LogChannels>(s)
            .map_err(|e| anyhow!("invalid log channels '{}': {}", s, e))
    }

    pub fn is_enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.intersects(LogChannels::for_level(metadata.level()))
    }
}

pub struct LogConfig {
    pub channels: LogChannels,
    /// log to this file (appending), or to stdout if `None`
    pub log_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            channels: LogChannels::ERROR | LogChannels::INFO,
            log_file: None,
        }
    }
}

impl LogConfig {
    /// Installs the global subscriber. This fails if a global subscriber is installed already.
    pub fn init(&self) -> anyhow::Result<()> {
        let writer = match &self.log_file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                BoxMakeWriter::new(Mutex::new(file))
            }
            None => BoxMakeWriter::new(std::io::stdout),
        };

        let channels = self.channels;
        let layer = tracing_subscriber::fmt::layer()
            .with_timer(uptime())
            .with_thread_names(true)
            .with_ansi(self.log_file.is_none())
            .with_writer(writer)
            .with_filter(filter_fn(move |metadata| channels.is_enabled(metadata)));

        tracing_subscriber::registry()
            .with(layer)
            .try_init()?;
        Ok(())
    }
}
