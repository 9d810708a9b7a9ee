//! Splitting of user-supplied command lines.

use crate::error::{TunnelError, TunnelResult};

/// Split a command line into words.
///
/// Words are separated by whitespace; single or double quotes group a word
/// that contains whitespace. No escapes or expansions.
pub fn split_command_line(line: &str) -> TunnelResult<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(TunnelError::connection_failed(format!(
            "Unterminated quote in command '{}'",
            line
        )));
    }
    if in_word {
        words.push(current);
    }
    if words.is_empty() {
        return Err(TunnelError::connection_failed("Empty command"));
    }
    Ok(words)
}
