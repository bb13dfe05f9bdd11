use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

pub const MAX_NAME_LEN: usize = 32;

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Quit,
    Ping,
    Time,
    Date,
    Echo(String),
    EchoUsage,
    Who,
    Say(String),
}

/// Classifies one inbound line. Anything that is not a recognised token is
/// chat. Returns `None` for blank lines.
pub fn parse_line(line: &str) -> Option<Command> {
    let token = line.trim();
    if token.is_empty() {
        return None;
    }

    let cmd = match token {
        "/quit" => Command::Quit,
        "/who" => Command::Who,
        "ping" => Command::Ping,
        "time" => Command::Time,
        "date" => Command::Date,
        "echo" => Command::EchoUsage,
        _ => match token.strip_prefix("echo:") {
            Some(text) => Command::Echo(text.to_string()),
            None => Command::Say(line.to_string()),
        },
    };

    Some(cmd)
}

pub fn validate_name(line: &str) -> Result<String, String> {
    let name = line.trim();

    if name.is_empty() {
        return Err("name cannot be empty".into());
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(format!("name longer than {MAX_NAME_LEN} characters"));
    }
    if name.chars().any(char::is_control) {
        return Err("name contains control characters".into());
    }

    Ok(name.to_string())
}

/// Newline-delimited reader with a length cap. Over-long lines come back in
/// `max_len` sized pieces cut on character boundaries, and invalid UTF-8 is replaced, so a misbehaving
/// client never causes a read error.
pub struct LineReader<R> {
    inner: BufReader<R>,
    max_len: usize,
    buf: Vec<u8>,
    // leading bytes of a character cut off by the length cap
    carry: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            max_len,
            buf: Vec::new(),
            carry: Vec::new(),
        }
    }

    /// `Ok(None)` on EOF.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.buf.clear();
        self.buf.append(&mut self.carry);

        let limit = self.max_len.saturating_sub(self.buf.len()).max(1);
        let n = (&mut self.inner)
            .take(limit as u64)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if self.buf.is_empty() {
            return Ok(None);
        }

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        } else if n == limit {
            self.hold_partial_char();
        }

        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }

    /// Moves an incomplete trailing UTF-8 sequence into `carry` so a split
    /// line never breaks a character in two.
    fn hold_partial_char(&mut self) {
        if let Err(err) = std::str::from_utf8(&self.buf) {
            // `error_len() == None` means the input simply ended mid-character
            if err.error_len().is_none() && err.valid_up_to() > 0 {
                self.carry = self.buf.split_off(err.valid_up_to());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_tokens() {
        assert_eq!(parse_line("/quit"), Some(Command::Quit));
        assert_eq!(parse_line("  ping \r"), Some(Command::Ping));
        assert_eq!(parse_line("time"), Some(Command::Time));
        assert_eq!(parse_line("date"), Some(Command::Date));
        assert_eq!(parse_line("/who"), Some(Command::Who));
        assert_eq!(parse_line("echo"), Some(Command::EchoUsage));
        assert_eq!(parse_line("echo:Hello World"), Some(Command::Echo("Hello World".into())));
        assert_eq!(parse_line("echo:"), Some(Command::Echo(String::new())));
    }

    #[test]
    fn everything_else_is_chat() {
        assert_eq!(parse_line("hi there"), Some(Command::Say("hi there".into())));
        assert_eq!(parse_line("PING"), Some(Command::Say("PING".into())));
        assert_eq!(parse_line("/nope"), Some(Command::Say("/nope".into())));
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn names_are_trimmed_and_checked() {
        assert_eq!(validate_name("  alice \r"), Ok("alice".into()));
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(validate_name("bad\u{7}name").is_err());
        assert!(validate_name(&"é".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[tokio::test]
    async fn reads_crlf_and_lf_lines() {
        let mut reader = LineReader::new(&b"alice\r\nhi\nlast"[..], 64);

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("alice"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("hi"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("last"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn long_lines_are_split() {
        let mut reader = LineReader::new(&b"abcdefghij\nok\n"[..], 4);

        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await.unwrap() {
            lines.push(line);
        }

        assert_eq!(lines, ["abcd", "efgh", "ij", "ok"]);
    }

    #[tokio::test]
    async fn split_never_cuts_a_character() {
        let mut reader = LineReader::new("abcé\n".as_bytes(), 4);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("abc"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("é"));
        assert_eq!(reader.next_line().await.unwrap(), None);

        let mut reader = LineReader::new("ab🦀cd".as_bytes(), 4);
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await.unwrap() {
            lines.push(line);
        }
        assert_eq!(lines, ["ab", "🦀", "cd"]);
        assert!(lines.iter().all(|l| !l.contains('\u{fffd}')));
    }

    #[tokio::test]
    async fn invalid_utf8_is_not_an_error() {
        let mut reader = LineReader::new(&b"\xff\xfehi\n"[..], 64);

        let line = reader.next_line().await.unwrap().unwrap();
        assert!(line.ends_with("hi"));
    }
}
