//! Terminal I/O for the CLI.
//!
//! Provides status lines and the password prompt used to unlock keystores.

use std::io::{self, BufRead, IsTerminal};

use dialoguer::Password;
use droidship::keystore::{Secret, SecretPrompt};

pub fn is_stdin_tty() -> bool {
    io::stdin().is_terminal()
}

/// Ask for a secret on the terminal without echoing it.
pub fn password(message: &str) -> droidship::Result<String> {
    Password::new()
        .with_prompt(message)
        .allow_empty_password(true)
        .interact()
        .map_err(|e| droidship::Error::internal_io(e.to_string(), Some("read password".to_string())))
}

/// Read one line for `message` from a non-interactive source.
///
/// End of input is a setup failure, not a usage error.
pub fn read_answer(reader: &mut dyn BufRead, message: &str) -> droidship::Result<String> {
    let mut line = String::new();
    let read = reader.read_line(&mut line).map_err(|e| {
        droidship::Error::internal_io(e.to_string(), Some("read password".to_string()))
    })?;
    if read == 0 {
        return Err(droidship::Error::internal_io(
            format!("stdin closed before '{}' was given", message),
            Some("read password".to_string()),
        )
        .with_hint("Put the passwords in droidship.toml or run from a terminal"));
    }

    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Asks for keystore passwords on the terminal, or reads them line by line
/// from piped stdin.
pub struct TtyPrompt;

impl SecretPrompt for TtyPrompt {
    fn secret(&mut self, label: &str) -> droidship::Result<Secret> {
        if is_stdin_tty() {
            return password(label).map(Secret::new);
        }
        status(&format!("Reading '{}' from stdin", label));
        read_answer(&mut io::stdin().lock(), label).map(Secret::new)
    }
}

/// Print status message to stderr if running in a terminal.
pub fn status(message: &str) {
    if io::stderr().is_terminal() {
        eprintln!("{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output;

    #[test]
    fn piped_answers_are_read_line_by_line() {
        let mut input = io::Cursor::new("store-pw\r\n\nlast");
        assert_eq!(read_answer(&mut input, "store").unwrap(), "store-pw");
        assert_eq!(read_answer(&mut input, "key").unwrap(), "");
        assert_eq!(read_answer(&mut input, "other").unwrap(), "last");
    }

    #[test]
    fn closed_stdin_exits_one() {
        let mut input = io::Cursor::new("");
        let err = read_answer(&mut input, "release.jks").unwrap_err();
        assert_eq!(err.code.as_str(), "internal.io_error");
        assert!(!err.hints.is_empty());

        let (_, code) = output::map_cmd_result_to_json::<()>(Err(err));
        assert_eq!(code, 1);
    }
}
