//! Command lines and reply markers
//!
//! Every connection starts with one newline-terminated command line. Fields
//! are separated by `:`, which is why overseer names may not contain one.

use crate::error::LeaseError;

// ============================================================================
// Wire Constants
// ============================================================================

pub const COM_PING: &str = "DWARF";
pub const COM_STATUS: &str = "status";
pub const COM_CHECKOUT: &str = "checkout";
pub const COM_CHECKIN: &str = "checkin";
pub const COM_RELEASE: &str = "release";

pub const RESP_PING: &str = "FORTRESS";
pub const RESP_DOWNLOAD: &str = "download";
pub const RESP_UPLOAD: &str = "upload";
pub const RESP_ERROR: &str = "error";
pub const RESP_SUCCESS: &str = "success";

// ============================================================================
// Command
// ============================================================================

/// A parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Status,
    Checkout {
        overseer: String,
        world: String,
    },
    Checkin {
        overseer: String,
        world: String,
        auth_token: String,
    },
    Release {
        overseer: String,
        world: String,
        auth_token: String,
    },
}

impl Command {
    /// Parse one command line (trailing whitespace is ignored)
    pub fn parse(line: &str) -> Result<Self, LeaseError> {
        let line = line.trim();
        if line == COM_PING {
            return Ok(Command::Ping);
        }
        if line == COM_STATUS {
            return Ok(Command::Status);
        }

        let fields: Vec<&str> = line.split(':').collect();
        match fields.as_slice() {
            [COM_CHECKOUT, overseer, world] => Ok(Command::Checkout {
                overseer: required("overseer", overseer, line)?,
                world: required("world", world, line)?,
            }),
            [COM_CHECKIN, overseer, world, auth_token] => Ok(Command::Checkin {
                overseer: required("overseer", overseer, line)?,
                world: required("world", world, line)?,
                auth_token: required("auth token", auth_token, line)?,
            }),
            [COM_RELEASE, overseer, world, auth_token] => Ok(Command::Release {
                overseer: required("overseer", overseer, line)?,
                world: required("world", world, line)?,
                auth_token: required("auth token", auth_token, line)?,
            }),
            [COM_CHECKOUT, ..] | [COM_CHECKIN, ..] | [COM_RELEASE, ..] => Err(
                LeaseError::Protocol(format!("Invalid {} command '{}'", fields[0], line)),
            ),
            _ => Err(LeaseError::Protocol(format!("Command '{}' not recognized", line))),
        }
    }

    /// Command keyword, safe to log
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Ping => COM_PING,
            Command::Status => COM_STATUS,
            Command::Checkout { .. } => COM_CHECKOUT,
            Command::Checkin { .. } => COM_CHECKIN,
            Command::Release { .. } => COM_RELEASE,
        }
    }

    /// Render as a command line, without the newline
    pub fn to_line(&self) -> String {
        match self {
            Command::Ping => COM_PING.to_string(),
            Command::Status => COM_STATUS.to_string(),
            Command::Checkout { overseer, world } => {
                format!("{}:{}:{}", COM_CHECKOUT, overseer, world)
            }
            Command::Checkin {
                overseer,
                world,
                auth_token,
            } => format!("{}:{}:{}:{}", COM_CHECKIN, overseer, world, auth_token),
            Command::Release {
                overseer,
                world,
                auth_token,
            } => format!("{}:{}:{}:{}", COM_RELEASE, overseer, world, auth_token),
        }
    }
}

fn required(name: &str, value: &str, line: &str) -> Result<String, LeaseError> {
    if value.is_empty() {
        return Err(LeaseError::Protocol(format!(
            "Missing {} in command '{}'",
            name, line
        )));
    }
    Ok(value.to_string())
}

/// Format an error reply line, newline included
pub fn error_line(err: &LeaseError) -> String {
    format!("{}: {}\n", RESP_ERROR, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(Command::parse("DWARF\n").unwrap(), Command::Ping);
        assert_eq!(Command::parse("status\r\n").unwrap(), Command::Status);
    }

    #[test]
    fn test_parse_checkout() {
        assert_eq!(
            Command::parse("checkout:Urist:embark1\n").unwrap(),
            Command::Checkout {
                overseer: "Urist".to_string(),
                world: "embark1".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_checkin_and_release() {
        let checkin = Command::parse("checkin:Urist:embark1:c2VjcmV0+/w==").unwrap();
        assert_eq!(
            checkin,
            Command::Checkin {
                overseer: "Urist".to_string(),
                world: "embark1".to_string(),
                auth_token: "c2VjcmV0+/w==".to_string(),
            }
        );
        assert!(matches!(
            Command::parse("release:Urist:embark1:abc").unwrap(),
            Command::Release { .. }
        ));
    }

    #[test]
    fn test_to_line_round_trips() {
        let cmd = Command::Release {
            overseer: "Urist".to_string(),
            world: "embark1".to_string(),
            auth_token: "abc".to_string(),
        };
        assert_eq!(Command::parse(&cmd.to_line()).unwrap(), cmd);
    }

    #[test]
    fn test_malformed_commands() {
        for line in [
            "checkout:Urist",
            "checkout:Urist:embark1:extra",
            "checkin:Urist:embark1",
            "release::embark1:abc",
            "checkout:Urist:",
            "hello",
            "",
        ] {
            let err = Command::parse(line).unwrap_err();
            assert!(
                matches!(err, LeaseError::Protocol(_)),
                "expected protocol error for {line:?}"
            );
        }
    }

    #[test]
    fn test_error_line_format() {
        let line = error_line(&LeaseError::NotFound("embark9".to_string()));
        assert_eq!(line, "error: No world named 'embark9'\n");
    }
}
