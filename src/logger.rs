//! Global `tracing` subscriber setup.
//!
//! `LoggerManager` validates a [`LoggerConfig`] and installs one registry with
//! a console layer (compact, pretty or JSON) and, optionally, a journald
//! layer. `RUST_LOG` overrides the configured level for both.

use std::{fmt as std_fmt, io};

use thiserror::Error;
use time::{
    format_description::{well_known::Rfc3339, OwnedFormatItem},
    OffsetDateTime,
};
use tracing_subscriber::{
    fmt::{self, format::Writer, time::FormatTime},
    prelude::*,
    EnvFilter, Layer, Registry,
};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, LogFormat, LoggerConfig, TimestampFormat},
    core::event::local_offset,
    print_info, print_warn,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Logger initialization error: {0}")]
    InitializationError(String),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,
}

pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// # Errors
    ///
    /// `LoggerError::ValidationError` if the configuration is invalid.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;
        Ok(LoggerManager { config })
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    /// Installs the global subscriber. Call once, before any task is spawned.
    ///
    /// A journald failure is tolerated when console output is enabled.
    pub fn init(&self) -> Result<(), LoggerError> {
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if let Some(console) = self.config.console.as_ref().filter(|c| c.enabled) {
            let timer = EventTimer::new(&self.config.timestamp_format)?;
            layers.push(console_layer(console, timer, self.filter()));
        }

        if let Some(journald) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match tracing_journald::layer() {
                Ok(layer) => {
                    let layer = layer.with_syslog_identifier(journald.identifier.clone());
                    layers.push(layer.with_filter(self.filter()).boxed());
                    print_info!(
                        "Systemd journald logger initialized with identifier: {}",
                        journald.identifier
                    );
                }
                Err(e) if !layers.is_empty() => {
                    print_warn!("Failed to initialize systemd journald logger: {}", e);
                }
                Err(e) => return Err(LoggerError::IoError(e)),
            }
        }

        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InitializationError(e.to_string()))
    }
}

/// Console timestamps in the configured format, local time.
enum EventTimer {
    Rfc3339,
    Unix,
    Custom(OwnedFormatItem),
}

impl EventTimer {
    fn new(format: &TimestampFormat) -> Result<Self, LoggerError> {
        Ok(match format {
            TimestampFormat::Rfc3339 => EventTimer::Rfc3339,
            TimestampFormat::Unix => EventTimer::Unix,
            TimestampFormat::Custom(description) => EventTimer::Custom(
                time::format_description::parse_owned::<2>(description)
                    .map_err(|e| LoggerError::InitializationError(e.to_string()))?,
            ),
        })
    }

    fn write_at(&self, w: &mut Writer<'_>, now: OffsetDateTime) -> std_fmt::Result {
        match self {
            EventTimer::Rfc3339 => {
                w.write_str(&now.format(&Rfc3339).map_err(|_| std_fmt::Error)?)
            }
            EventTimer::Unix => write!(w, "{}.{:03}", now.unix_timestamp(), now.millisecond()),
            EventTimer::Custom(items) => {
                w.write_str(&now.format(items).map_err(|_| std_fmt::Error)?)
            }
        }
    }
}

impl FormatTime for EventTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std_fmt::Result {
        self.write_at(w, OffsetDateTime::now_utc().to_offset(local_offset()))
    }
}

fn console_layer(config: &ConsoleConfig, timer: EventTimer, filter: EnvFilter) -> BoxedLayer {
    let base = fmt::layer()
        .with_timer(timer)
        .with_target(config.show_target)
        .with_thread_ids(config.show_thread_ids)
        .with_ansi(config.ansi_colors)
        .with_writer(io::stdout);

    match config.format {
        LogFormat::Json => base.json().with_filter(filter).boxed(),
        LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
        LogFormat::Compact => base.compact().with_filter(filter).boxed(),
    }
}
