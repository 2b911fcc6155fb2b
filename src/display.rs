//! Single-line live readout for `--debug`.
//!
//! Redraws one terminal line whenever the sampling loop publishes a new
//! snapshot or the broker session changes state. Read-only: it never touches
//! the pipeline.

use std::io;

use console::{style, StyledObject, Term};
use stacklight_mqtt::ConnectionState;
use time::{format_description::BorrowedFormatItem, macros::format_description, OffsetDateTime};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::{
    classifier::InstantLabel,
    executor::Snapshot,
    gate::GatePhase,
    stability::CompositeState,
};

const CLOCK: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]:[second]");

/// Formats the readout line, without styling.
pub fn render(snapshot: &Snapshot, connection: &ConnectionState) -> String {
    let clock = OffsetDateTime::now_utc()
        .to_offset(crate::core::event::local_offset())
        .format(CLOCK)
        .unwrap_or_default();
    render_at(&clock, snapshot, connection)
}

fn render_at(clock: &str, snapshot: &Snapshot, connection: &ConnectionState) -> String {
    let sample = snapshot
        .sample
        .as_ref()
        .map_or_else(|| "-".to_string(), ToString::to_string);
    let label = snapshot.label.map_or("-", InstantLabel::as_str);
    let composite = snapshot.composite.map_or("-", CompositeState::wire_name);
    let published = snapshot.published.map_or("-", CompositeState::wire_name);
    let held = snapshot
        .held_for
        .map(|held| format!(" {}s", held.as_secs()))
        .unwrap_or_default();
    let grace = if snapshot.phase == GatePhase::Grace {
        " (grace)"
    } else {
        ""
    };

    format!(
        "[{clock}] {sample} | {label} | G={} R={} O={} ({}) | {composite} -> {published}{held}{grace} | mqtt: {}",
        snapshot.counts.green,
        snapshot.counts.red,
        snapshot.counts.off,
        snapshot.buffer_len,
        connection.as_str(),
    )
}

fn published_style(state: Option<CompositeState>, text: String) -> StyledObject<String> {
    match state {
        Some(CompositeState::Green) => style(text).green(),
        Some(CompositeState::Waiting) => style(text).yellow(),
        Some(CompositeState::Red) => style(text).red(),
        Some(CompositeState::Off) | None => style(text).dim(),
    }
}

fn draw(term: &Term, snapshot: &Snapshot, connection: &ConnectionState) -> io::Result<()> {
    let line = published_style(snapshot.published, render(snapshot, connection));
    term.clear_line()?;
    term.write_str(&line.to_string())
}

pub async fn run_display(
    mut snapshots: watch::Receiver<Snapshot>,
    mut connection: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
) {
    let term = Term::stdout();
    let mut connection_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = connection.changed(), if connection_open => {
                connection_open = changed.is_ok();
            }
        }

        let snapshot = snapshots.borrow_and_update().clone();
        let state = connection.borrow_and_update().clone();
        if let Err(e) = draw(&term, &snapshot, &state) {
            debug!("Live readout stopped: {}", e);
            break;
        }
    }

    let _ = term.write_line("");
}
