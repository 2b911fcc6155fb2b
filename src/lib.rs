//! stacklight: stack-light state monitor with MQTT reporting.
//!
//! Watches a machine's signal tower through a color sensor or a camera
//! pipeline, debounces what it sees into one of four states (RED, GREEN,
//! WAITING, OFF) and publishes every change to an MQTT broker. Changes made
//! while the broker is unreachable are kept in a durable queue and replayed
//! in order on reconnection.
//!
//! ## Modules
//!
//! * `config`: TOML application configuration, validated with `validator`,
//!   plus the pre-logger `print_*!` macros.
//!
//! * `core`: the pipeline: calibration profile, classifier, state buffer,
//!   persistence gate, sampling executor, delivery with offline queue and the
//!   network reachability monitor.
//!
//! * `logger`: `tracing` subscriber setup: console output in compact,
//!   pretty or JSON format and optional systemd journald.
//!
//! * `display`: single-line live readout for `--debug`.
//!
//! The broker session itself lives in the `stacklight-mqtt` workspace crate.

pub mod config;
pub mod core;
pub mod display;
pub mod logger;
