//! Operator commands
//!
//! Command text arrives on `cmd:`/`bcmd:` lines and is decoded once into a
//! [`Command`]. The [`Display`](std::fmt::Display) form is the canonical text
//! and is what gets forwarded to neighbors.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// A command for a participant process
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `sum:<session>`: run the sum protocol under the named session
    Sum { session: String },
    /// `peers`: report connected neighbors
    Peers,
    /// `quit`: stop the participant
    Quit,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let text = text.trim();
        let (name, arg) = match text.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (text, None),
        };

        match (name, arg) {
            ("sum", Some(session)) if !session.is_empty() && !session.contains(':') => {
                Ok(Self::Sum {
                    session: session.to_string(),
                })
            }
            ("sum", _) => Err(Error::InvalidCommand {
                command: name.to_string(),
                reason: "expected sum:<session>".into(),
            }),
            ("peers", None) => Ok(Self::Peers),
            ("quit", None) => Ok(Self::Quit),
            ("peers" | "quit", Some(_)) => Err(Error::InvalidCommand {
                command: name.to_string(),
                reason: "takes no argument".into(),
            }),
            _ => Err(Error::UnknownCommand(text.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum { session } => write!(f, "sum:{session}"),
            Self::Peers => f.write_str("peers"),
            Self::Quit => f.write_str("quit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_commands() {
        assert_eq!(
            "sum:run1".parse::<Command>().unwrap(),
            Command::Sum {
                session: "run1".into()
            }
        );
        assert_eq!("peers".parse::<Command>().unwrap(), Command::Peers);
        assert_eq!(" quit\r".parse::<Command>().unwrap(), Command::Quit);
    }

    #[test]
    fn test_display_is_canonical_text() {
        for text in ["sum:abc", "peers", "quit"] {
            assert_eq!(text.parse::<Command>().unwrap().to_string(), text);
        }
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(
            "sum".parse::<Command>(),
            Err(Error::InvalidCommand { .. })
        ));
        assert!(matches!(
            "sum:".parse::<Command>(),
            Err(Error::InvalidCommand { .. })
        ));
        assert!(matches!(
            "peers:x".parse::<Command>(),
            Err(Error::InvalidCommand { .. })
        ));
        assert!(matches!(
            "sign:m/44".parse::<Command>(),
            Err(Error::UnknownCommand(_))
        ));
    }
}
