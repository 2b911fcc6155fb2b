//! Published-state events and their JSON payload.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{format_description::BorrowedFormatItem, macros::format_description, OffsetDateTime, UtcOffset};

use super::stability::CompositeState;

const DATETIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

static LOCAL_OFFSET: OnceLock<UtcOffset> = OnceLock::new();

/// Captures the local UTC offset for `datetime_str`.
///
/// Must run before any other thread is started: the offset cannot be read
/// soundly from a multi-threaded process. Falls back to UTC.
pub fn init_local_offset() -> UtcOffset {
    *LOCAL_OFFSET.get_or_init(|| UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC))
}

pub(crate) fn local_offset() -> UtcOffset {
    LOCAL_OFFSET.get().copied().unwrap_or(UtcOffset::UTC)
}

/// One change of the published state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishEvent {
    pub stato: CompositeState,
    pub machine_id: String,
    /// Unix time in seconds.
    pub timestamp: f64,
    /// Local wall-clock time, `YYYY-MM-DD HH:MM:SS`.
    pub datetime_str: String,
}

#[derive(Serialize)]
struct Envelope<'a> {
    message: &'a PublishEvent,
}

impl PublishEvent {
    pub fn new(stato: CompositeState, machine_id: impl Into<String>) -> Self {
        Self::at(stato, machine_id, OffsetDateTime::now_utc())
    }

    pub fn at(stato: CompositeState, machine_id: impl Into<String>, when: OffsetDateTime) -> Self {
        let timestamp = when.unix_timestamp() as f64 + f64::from(when.nanosecond()) / 1e9;
        let datetime_str = when
            .to_offset(local_offset())
            .format(DATETIME_FORMAT)
            .unwrap_or_default();
        Self {
            stato,
            machine_id: machine_id.into(),
            timestamp,
            datetime_str,
        }
    }

    /// Serialized payload, optionally nested under `"message"`.
    pub fn to_payload(&self, wrap: bool) -> serde_json::Result<Vec<u8>> {
        if wrap {
            serde_json::to_vec(&Envelope { message: self })
        } else {
            serde_json::to_vec(self)
        }
    }
}

/// Extracts the machine id of a serialized payload, wrapped or not.
pub fn machine_id_of(payload: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let body = value.get("message").unwrap_or(&value);
    body.get("machine_id")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn event() -> PublishEvent {
        PublishEvent::at(
            CompositeState::Waiting,
            "press-07",
            datetime!(2024-03-01 08:30:15.5 UTC),
        )
    }

    #[test]
    fn test_wrapped_payload_layout() {
        let payload = event().to_payload(true).unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();

        let message = &value["message"];
        assert_eq!(message["stato"], "ATTESA");
        assert_eq!(message["machine_id"], "press-07");
        assert_eq!(message["timestamp"], 1709281815.5);
        assert!(message["datetime_str"].as_str().unwrap().starts_with("2024-03-01 "));
    }

    #[test]
    fn test_plain_payload_field_order() {
        let payload = String::from_utf8(event().to_payload(false).unwrap()).unwrap();
        assert!(payload.starts_with(r#"{"stato":"ATTESA","machine_id":"press-07","timestamp":"#));
    }

    #[test]
    fn test_machine_id_of() {
        let event = event();
        assert_eq!(
            machine_id_of(&event.to_payload(true).unwrap()).as_deref(),
            Some("press-07")
        );
        assert_eq!(
            machine_id_of(&event.to_payload(false).unwrap()).as_deref(),
            Some("press-07")
        );
        assert_eq!(machine_id_of(b"not json"), None);
        assert_eq!(machine_id_of(br#"{"stato":"VERDE"}"#), None);
    }
}
