//! REPL command parsing for the interactive shell.
//!
//! This is separate from [`crate::command::CommandPayload`] because:
//! - `ConsoleCommand` represents the REPL interface (including meta-commands like STATUS, EXIT)
//! - `CommandPayload` represents only what goes through Raft replication
//!
//! Not all console commands trigger Raft operations (e.g., STATUS is a local read).

use anyhow::{Result, anyhow};

/// Commands that can be entered at the REPL prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Put { key: String, value: String },
    Append { key: String, value: String },
    Get { key: String },
    Status,
    Campaign,
    Exit,
    Help,
}

pub const HELP_TEXT: &str = "\
Commands:
  PUT/p <key> <value>     set key to value
  APPEND/a <key> <value>  append value to key
  GET/g <key>             read key (leader only)
  STATUS/s                role, leader, term and store contents
  CAMPAIGN/c              force this node to stand for election
  HELP/h                  this text
  EXIT/e                  shut down this node";

impl ConsoleCommand {
    /// Parses a line of user input into a command.
    ///
    /// Commands are case-insensitive and accept one-letter aliases. The value
    /// of PUT and APPEND is the rest of the line, so it may contain spaces.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let mut parts = trimmed.splitn(3, char::is_whitespace);
        let Some(first) = parts.next().filter(|s| !s.is_empty()) else {
            return Err(anyhow!("empty command"));
        };
        let key = parts.next().map(str::to_string);
        let value = parts.next().map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        // Normalize first word: uppercase and expand aliases
        let cmd = first.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "P" => "PUT",
            "A" => "APPEND",
            "G" => "GET",
            "S" => "STATUS",
            "C" => "CAMPAIGN",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };

        match (normalized_cmd, key, value) {
            ("EXIT", None, None) => Ok(ConsoleCommand::Exit),
            ("HELP", None, None) => Ok(ConsoleCommand::Help),
            ("STATUS", None, None) => Ok(ConsoleCommand::Status),
            ("CAMPAIGN", None, None) => Ok(ConsoleCommand::Campaign),
            ("GET", Some(key), None) => Ok(ConsoleCommand::Get { key }),
            ("PUT", Some(key), Some(value)) => Ok(ConsoleCommand::Put { key, value }),
            ("APPEND", Some(key), Some(value)) => Ok(ConsoleCommand::Append { key, value }),
            ("GET", _, _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("PUT", _, _) => Err(anyhow!("PUT requires a key and a value: PUT <key> <value>")),
            ("APPEND", _, _) => Err(anyhow!(
                "APPEND requires a key and a value: APPEND <key> <value>"
            )),
            ("EXIT" | "HELP" | "STATUS" | "CAMPAIGN", _, _) => {
                Err(anyhow!("{normalized_cmd} takes no arguments"))
            }
            _ => Err(anyhow!(
                "invalid command. Try: PUT/p, APPEND/a, GET/g, STATUS/s, CAMPAIGN/c, HELP/h, EXIT/e"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_commands() {
        assert!(matches!(ConsoleCommand::parse("exit"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("EXIT"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("ExIt"), Ok(ConsoleCommand::Exit)));

        assert!(matches!(ConsoleCommand::parse("help"), Ok(ConsoleCommand::Help)));
        assert!(matches!(ConsoleCommand::parse("status"), Ok(ConsoleCommand::Status)));
        assert!(matches!(ConsoleCommand::parse("  STATUS  "), Ok(ConsoleCommand::Status)));
    }

    #[test]
    fn test_aliases() {
        assert!(matches!(ConsoleCommand::parse("e"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("H"), Ok(ConsoleCommand::Help)));
        assert!(matches!(ConsoleCommand::parse("s"), Ok(ConsoleCommand::Status)));
        assert!(matches!(ConsoleCommand::parse("c"), Ok(ConsoleCommand::Campaign)));

        assert!(matches!(
            ConsoleCommand::parse("g foo"),
            Ok(ConsoleCommand::Get { key }) if key == "foo"
        ));
        assert!(matches!(
            ConsoleCommand::parse("P KEY VAL"),
            Ok(ConsoleCommand::Put { key, value }) if key == "KEY" && value == "VAL"
        ));
        assert!(matches!(
            ConsoleCommand::parse("a log x"),
            Ok(ConsoleCommand::Append { key, value }) if key == "log" && value == "x"
        ));
    }

    #[test]
    fn test_values_keep_inner_spaces() {
        assert_eq!(
            ConsoleCommand::parse("append greeting hello there  world").ok(),
            Some(ConsoleCommand::Append {
                key: "greeting".into(),
                value: "hello there  world".into(),
            })
        );
    }

    #[test]
    fn test_invalid_commands() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("   ").is_err());
        assert!(ConsoleCommand::parse("INVALID").is_err());
        assert!(ConsoleCommand::parse("GET").is_err()); // Missing key
        assert!(ConsoleCommand::parse("GET a b").is_err());
        assert!(ConsoleCommand::parse("PUT key").is_err()); // Missing value
        assert!(ConsoleCommand::parse("APPEND").is_err());
        assert!(ConsoleCommand::parse("status now").is_err());
    }
}
