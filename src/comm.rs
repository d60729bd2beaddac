/// Companion-app messages carried over the BLE link.
///
/// Inbound: reassembled write payloads whose first byte is a command
/// tag and whose remainder is a JSON body. Outbound: internally-tagged
/// JSON messages (live events during a run, the result transcript at
/// its end) pushed through the notify characteristic.

use serde::Serialize;
use thiserror::Error;

use crate::executor::{CustomConfig, Event, RandomConfig};

/// GATT service UUID of the terminal.
pub const SERVICE_UUID: u16 = 0xAAAA;
/// Characteristic the central writes command chunks to.
pub const WRITE_UUID: u16 = 0xBBBB;
/// Characteristic event/result chunks are notified on.
pub const NOTIFY_UUID: u16 = 0xCCCC;

/// BLE advertising name.
pub const ADV_NAME: &str = "terminal";

/// Command tags, the first byte of a reassembled write payload.
pub const CUSTOM_EXECUTOR_TAG: u8 = 0x14;
pub const RANDOM_EXECUTOR_TAG: u8 = 0x15;
pub const STOP_EXECUTOR_TAG: u8 = 0xFF;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("empty command payload")]
    Empty,
    #[error("unsupported command tag {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("malformed command body: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A decoded terminal command.
#[derive(Debug)]
pub enum TerminalCommand {
    LoadCustom(CustomConfig),
    LoadRandom(RandomConfig),
    Stop,
}

/// Split the tag byte off a reassembled payload and parse the body.
pub fn parse_command(payload: &[u8]) -> Result<TerminalCommand, CommandError> {
    let (&tag, body) = payload.split_first().ok_or(CommandError::Empty)?;
    match tag {
        CUSTOM_EXECUTOR_TAG => Ok(TerminalCommand::LoadCustom(serde_json::from_slice(body)?)),
        RANDOM_EXECUTOR_TAG => Ok(TerminalCommand::LoadRandom(serde_json::from_slice(body)?)),
        STOP_EXECUTOR_TAG => Ok(TerminalCommand::Stop),
        _ => Err(CommandError::UnsupportedCommand(tag)),
    }
}

/// Full transcript of a finished run.
#[derive(Debug, Serialize)]
pub struct RoutineResult {
    pub events: Vec<Event>,
    pub steps: u32,
    pub duration_ms: u32,
}

/// Messages notified to the companion app.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage<'a> {
    Event(&'a Event),
    Result(&'a RoutineResult),
}

/// Serialize a notification. A message that fails to serialize is
/// dropped with a log line; the stream continues.
pub fn serialize_message(msg: &DeviceMessage<'_>) -> Option<Vec<u8>> {
    match serde_json::to_vec(msg) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            log::warn!("failed to serialize notification: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::EventKind;
    use crate::protocol::Color;

    // ── parse_command tests ─────────────────────────────────────────

    #[test]
    fn parse_custom_executor_command() {
        let body = br#"{"duration_ms":60000,"steps":[{"node_configs":[{"id":1,"color":"blue","delay_ms":500}],"expression":"1","timeout_ms":2000,"stop_on_timeout":true}]}"#;
        let mut payload = vec![CUSTOM_EXECUTOR_TAG];
        payload.extend_from_slice(body);
        match parse_command(&payload).unwrap() {
            TerminalCommand::LoadCustom(cfg) => {
                assert_eq!(cfg.duration_ms, 60_000);
                assert_eq!(cfg.steps.len(), 1);
                assert_eq!(cfg.steps[0].expression, "1");
                assert_eq!(cfg.steps[0].node_configs[0].color, Color::Blue);
                assert!(cfg.steps[0].stop_on_timeout);
            }
            other => panic!("expected custom load, got {other:?}"),
        }
    }

    #[test]
    fn parse_random_executor_command() {
        let body = br#"{"colors":["blue","red"],"delay_ms":250,"timeout_ms":1500,"duration_ms":0,"steps":10,"nodes":4,"stop_on_timeout":false,"wait_for_all_players":true}"#;
        let mut payload = vec![RANDOM_EXECUTOR_TAG];
        payload.extend_from_slice(body);
        match parse_command(&payload).unwrap() {
            TerminalCommand::LoadRandom(cfg) => {
                assert_eq!(cfg.colors, vec![Color::Blue, Color::Red]);
                assert_eq!(cfg.steps, 10);
                assert_eq!(cfg.nodes, 4);
                assert!(cfg.wait_for_all_players);
            }
            other => panic!("expected random load, got {other:?}"),
        }
    }

    #[test]
    fn parse_stop_command() {
        assert!(matches!(
            parse_command(&[STOP_EXECUTOR_TAG]).unwrap(),
            TerminalCommand::Stop
        ));
    }

    #[test]
    fn parse_rejects_unknown_tag() {
        assert!(matches!(
            parse_command(&[0x42, b'{']),
            Err(CommandError::UnsupportedCommand(0x42))
        ));
    }

    #[test]
    fn parse_rejects_empty_payload() {
        assert!(matches!(parse_command(&[]), Err(CommandError::Empty)));
    }

    #[test]
    fn parse_rejects_malformed_body() {
        let payload = [CUSTOM_EXECUTOR_TAG, b'n', b'o', b'p', b'e'];
        assert!(matches!(
            parse_command(&payload),
            Err(CommandError::Payload(_))
        ));
    }

    // ── serialize_message tests ─────────────────────────────────────

    #[test]
    fn serialize_event_is_tagged_json() {
        let event = Event {
            kind: EventKind::Touche,
            color: Color::Red,
            delay_ms: 120,
            step: 2,
            node: 5,
        };
        let bytes = serialize_message(&DeviceMessage::Event(&event)).unwrap();
        let json = String::from_utf8(bytes).unwrap();
        assert!(json.contains(r#""type":"event""#));
        assert!(json.contains(r#""event":"touche""#));
        assert!(json.contains(r#""color":"red""#));
        assert!(json.contains(r#""step":2"#));
    }

    #[test]
    fn serialize_result_carries_transcript() {
        let result = RoutineResult {
            events: vec![Event {
                kind: EventKind::End,
                color: Color::None,
                delay_ms: 0,
                step: 3,
                node: 0,
            }],
            steps: 3,
            duration_ms: 4500,
        };
        let bytes = serialize_message(&DeviceMessage::Result(&result)).unwrap();
        let json = String::from_utf8(bytes).unwrap();
        assert!(json.contains(r#""type":"result""#));
        assert!(json.contains(r#""steps":3"#));
        assert!(json.contains(r#""duration_ms":4500"#));
        assert!(json.contains(r#""event":"end""#));
    }
}
