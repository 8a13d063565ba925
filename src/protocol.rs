//! Wire codec for the command-messenger-style framing spoken by the
//! firmware on each slave board. Field separator is
//! `,`, message terminator is `;\n`; `/`, `,` and `;` are escaped with a
//! leading `/` inside a field, matching PyCmdMessenger/CmdMessenger's
//! default `field_separator=','`, `command_separator=';'`,
//! `escape_character='/'` convention, which is what the firmware's own
//! `CmdMessenger` instance uses.

use std::fmt;

/// Command IDs, in the exact order the firmware's own command table lists
/// them. This ordering is load-bearing: the firmware dispatches on the
/// integer, not the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandId {
    Error = 0,
    Uuid = 1,
    UuidResponse = 2,
    Sensor = 3,
    SensorResponse = 4,
    Relay = 5,
    RelayResponse = 6,
}

impl CommandId {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(CommandId::Error),
            1 => Some(CommandId::Uuid),
            2 => Some(CommandId::UuidResponse),
            3 => Some(CommandId::Sensor),
            4 => Some(CommandId::SensorResponse),
            5 => Some(CommandId::Relay),
            6 => Some(CommandId::RelayResponse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Error { message: String },
    Uuid,
    UuidResponse { uuid: String },
    Sensor {
        pin_type: String,
        pin: i32,
        driver: String,
        measurement_type: String,
    },
    SensorResponse { status: i32, value: f64 },
    Relay { pin: i32, state: i32 },
    RelayResponse { pin: i32, state: i32 },
}

#[derive(Debug, Clone)]
pub struct ProtocolError(pub String);

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol error: {}", self.0)
    }
}

impl std::error::Error for ProtocolError {}

fn escape_field(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '/' || c == ',' || c == ';' {
            out.push('/');
        }
        out.push(c);
    }
    out
}

fn unescape_field(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '/' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split a raw frame body (without the trailing `;`) into comma-separated
/// fields, honoring `/`-escapes.
fn split_fields(body: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '/' {
            if let Some(next) = chars.next() {
                current.push('/');
                current.push(next);
            }
        } else if c == ',' {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);
    fields.into_iter().map(|f| unescape_field(&f)).collect()
}

impl Message {
    pub fn encode(&self) -> String {
        let (id, fields): (CommandId, Vec<String>) = match self {
            Message::Error { message } => (CommandId::Error, vec![message.clone()]),
            Message::Uuid => (CommandId::Uuid, vec![]),
            Message::UuidResponse { uuid } => (CommandId::UuidResponse, vec![uuid.clone()]),
            Message::Sensor {
                pin_type,
                pin,
                driver,
                measurement_type,
            } => (
                CommandId::Sensor,
                vec![
                    pin_type.clone(),
                    pin.to_string(),
                    driver.clone(),
                    measurement_type.clone(),
                ],
            ),
            Message::SensorResponse { status, value } => (
                CommandId::SensorResponse,
                vec![status.to_string(), value.to_string()],
            ),
            Message::Relay { pin, state } => {
                (CommandId::Relay, vec![pin.to_string(), state.to_string()])
            }
            Message::RelayResponse { pin, state } => (
                CommandId::RelayResponse,
                vec![pin.to_string(), state.to_string()],
            ),
        };

        let mut line = (id as u32).to_string();
        for field in &fields {
            line.push(',');
            line.push_str(&escape_field(field));
        }
        line.push_str(";\n");
        line
    }

    /// Parse one line (terminator already stripped) into a `Message`.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let trimmed = trimmed.strip_suffix(';').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(ProtocolError("empty frame".into()));
        }

        let mut fields = split_fields(trimmed);
        let id_str = fields.remove(0);
        let id_num: u32 = id_str
            .parse()
            .map_err(|_| ProtocolError(format!("non-numeric command id {id_str:?}")))?;
        let id = CommandId::from_u32(id_num)
            .ok_or_else(|| ProtocolError(format!("unknown command id {id_num}")))?;

        match id {
            CommandId::Error => Ok(Message::Error {
                message: fields.into_iter().next().unwrap_or_default(),
            }),
            CommandId::Uuid => Ok(Message::Uuid),
            CommandId::UuidResponse => Ok(Message::UuidResponse {
                uuid: fields.into_iter().next().unwrap_or_default(),
            }),
            CommandId::Sensor => {
                if fields.len() < 4 {
                    return Err(ProtocolError("sensor frame missing fields".into()));
                }
                Ok(Message::Sensor {
                    pin_type: fields[0].clone(),
                    pin: fields[1]
                        .parse()
                        .map_err(|_| ProtocolError("bad pin".into()))?,
                    driver: fields[2].clone(),
                    measurement_type: fields[3].clone(),
                })
            }
            CommandId::SensorResponse => {
                if fields.len() < 2 {
                    return Err(ProtocolError("sensor_response frame missing fields".into()));
                }
                Ok(Message::SensorResponse {
                    status: fields[0]
                        .parse()
                        .map_err(|_| ProtocolError("bad status".into()))?,
                    value: fields[1]
                        .parse()
                        .map_err(|_| ProtocolError("bad value".into()))?,
                })
            }
            CommandId::Relay => {
                if fields.len() < 2 {
                    return Err(ProtocolError("relay frame missing fields".into()));
                }
                Ok(Message::Relay {
                    pin: fields[0]
                        .parse()
                        .map_err(|_| ProtocolError("bad pin".into()))?,
                    state: fields[1]
                        .parse()
                        .map_err(|_| ProtocolError("bad state".into()))?,
                })
            }
            CommandId::RelayResponse => {
                if fields.len() < 2 {
                    return Err(ProtocolError("relay_response frame missing fields".into()));
                }
                Ok(Message::RelayResponse {
                    pin: fields[0]
                        .parse()
                        .map_err(|_| ProtocolError("bad pin".into()))?,
                    state: fields[1]
                        .parse()
                        .map_err(|_| ProtocolError("bad state".into()))?,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_uuid_request() {
        let msg = Message::Uuid;
        let wire = msg.encode();
        assert_eq!(wire, "1;\n");
        assert_eq!(Message::parse(&wire).unwrap(), msg);
    }

    #[test]
    fn round_trips_uuid_response() {
        let msg = Message::UuidResponse {
            uuid: "a".repeat(36),
        };
        let wire = msg.encode();
        assert_eq!(Message::parse(&wire).unwrap(), msg);
    }

    #[test]
    fn round_trips_sensor_request() {
        let msg = Message::Sensor {
            pin_type: "analog".into(),
            pin: 4,
            driver: "dht22".into(),
            measurement_type: "humidity".into(),
        };
        let wire = msg.encode();
        assert_eq!(Message::parse(&wire).unwrap(), msg);
    }

    #[test]
    fn round_trips_sensor_response() {
        let msg = Message::SensorResponse {
            status: 1,
            value: 42.5,
        };
        let wire = msg.encode();
        assert_eq!(Message::parse(&wire).unwrap(), msg);
    }

    #[test]
    fn round_trips_relay_and_response() {
        let msg = Message::Relay { pin: 7, state: 1 };
        assert_eq!(Message::parse(&msg.encode()).unwrap(), msg);

        let msg = Message::RelayResponse { pin: 7, state: 0 };
        assert_eq!(Message::parse(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn escapes_commas_and_semicolons_in_error_message() {
        let msg = Message::Error {
            message: "bad, pin; state".into(),
        };
        let wire = msg.encode();
        assert_eq!(Message::parse(&wire).unwrap(), msg);
    }

    #[test]
    fn rejects_unknown_command_id() {
        assert!(Message::parse("99;\n").is_err());
    }

    #[test]
    fn rejects_empty_frame() {
        assert!(Message::parse(";\n").is_err());
    }

    #[test]
    fn command_ids_match_firmware_table_order() {
        assert_eq!(CommandId::Error as u32, 0);
        assert_eq!(CommandId::Uuid as u32, 1);
        assert_eq!(CommandId::UuidResponse as u32, 2);
        assert_eq!(CommandId::Sensor as u32, 3);
        assert_eq!(CommandId::SensorResponse as u32, 4);
        assert_eq!(CommandId::Relay as u32, 5);
        assert_eq!(CommandId::RelayResponse as u32, 6);
    }
}
