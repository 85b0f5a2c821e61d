//! The line-oriented command protocol shared between clients, nodes, and
//! the replication/recovery pipelines.
//!
//! One command per line, tokens separated by single spaces, values may
//! contain spaces (they are everything after the second token). Lines are
//! capped at 64 KiB, matching the original Go server's `bufio.Scanner`
//! buffer limit.

use thiserror::Error;

/// Maximum accepted line length, mirroring the Go reference's scanner buffer.
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("line exceeds maximum length of {MAX_LINE_LEN} bytes")]
    LineTooLong,

    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("command '{0}' requires a key")]
    MissingKey(String),

    #[error("command '{0}' requires a value")]
    MissingValue(String),
}

/// A parsed client/peer command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    Flush,
    Keys,
    Ping,
    Exit,
    Recover { server_id: String },
}

impl Command {
    /// Parse a single line (without the trailing newline) into a `Command`.
    pub fn parse(line: &str) -> Result<Self, CodecError> {
        if line.len() > MAX_LINE_LEN {
            return Err(CodecError::LineTooLong);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(CodecError::Empty);
        }

        let mut parts = line.splitn(3, ' ');
        let cmd = parts.next().unwrap_or_default();
        let upper = cmd.to_ascii_uppercase();

        match upper.as_str() {
            "SET" => {
                let key = parts
                    .next()
                    .ok_or_else(|| CodecError::MissingKey("SET".into()))?;
                let value = parts
                    .next()
                    .ok_or_else(|| CodecError::MissingValue("SET".into()))?;
                Ok(Command::Set {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
            "GET" => {
                let key = parts
                    .next()
                    .ok_or_else(|| CodecError::MissingKey("GET".into()))?;
                Ok(Command::Get {
                    key: key.to_string(),
                })
            }
            "DELETE" => {
                let key = parts
                    .next()
                    .ok_or_else(|| CodecError::MissingKey("DELETE".into()))?;
                Ok(Command::Delete {
                    key: key.to_string(),
                })
            }
            "FLUSH" => Ok(Command::Flush),
            "KEYS" => Ok(Command::Keys),
            "PING" => Ok(Command::Ping),
            "EXIT" => Ok(Command::Exit),
            "RECOVER" => {
                let server_id = parts
                    .next()
                    .ok_or_else(|| CodecError::MissingKey("RECOVER".into()))?;
                Ok(Command::Recover {
                    server_id: server_id.to_string(),
                })
            }
            _ => Err(CodecError::Unknown(cmd.to_string())),
        }
    }

    /// Render this command back to wire form, used by the replicator and
    /// the client to build outgoing lines.
    pub fn to_line(&self) -> String {
        match self {
            Command::Set { key, value } => format!("SET {key} {value}"),
            Command::Get { key } => format!("GET {key}"),
            Command::Delete { key } => format!("DELETE {key}"),
            Command::Flush => "FLUSH".to_string(),
            Command::Keys => "KEYS".to_string(),
            Command::Ping => "PING".to_string(),
            Command::Exit => "EXIT".to_string(),
            Command::Recover { server_id } => format!("RECOVER {server_id}"),
        }
    }
}

/// A response line sent back to a client or peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Value(String),
    /// GET on a missing key. Wire form `ERROR: Key not found`, matching the
    /// Go original (`server.go:60`) exactly so a conformant client can tell
    /// this apart from every other `ERROR:` line.
    KeyNotFound,
    /// DELETE on a missing key. Wire form `ERROR: No such key`, matching
    /// the Go original (`server.go:79`).
    NoSuchKey,
    Pong,
    Goodbye,
    RecoverEnd,
    Error(String),
}

impl Response {
    pub fn to_line(&self) -> String {
        match self {
            Response::Ok => "OK".to_string(),
            Response::Value(v) => v.clone(),
            Response::KeyNotFound => "ERROR: Key not found".to_string(),
            Response::NoSuchKey => "ERROR: No such key".to_string(),
            Response::Pong => "PONG".to_string(),
            Response::Goodbye => "Goodbye!".to_string(),
            Response::RecoverEnd => "RECOVEREND".to_string(),
            Response::Error(msg) => format!("ERROR: {msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_set_with_spaces_in_value() {
        let cmd = Command::parse("SET foo bar baz qux").unwrap();
        assert_eq!(
            cmd,
            Command::Set {
                key: "foo".into(),
                value: "bar baz qux".into()
            }
        );
    }

    #[test]
    fn parses_case_insensitive_command() {
        assert_eq!(Command::parse("get foo").unwrap(), Command::Get { key: "foo".into() });
    }

    #[test]
    fn rejects_missing_key() {
        assert_eq!(Command::parse("SET").unwrap_err(), CodecError::MissingKey("SET".into()));
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(matches!(Command::parse("BOGUS x"), Err(CodecError::Unknown(_))));
    }

    #[test]
    fn rejects_oversized_line() {
        let huge = "SET k ".to_string() + &"a".repeat(MAX_LINE_LEN);
        assert_eq!(Command::parse(&huge).unwrap_err(), CodecError::LineTooLong);
    }

    #[test]
    fn round_trips_ping() {
        let line = Command::Ping.to_line();
        assert_eq!(Command::parse(&line).unwrap(), Command::Ping);
    }
}
