//! Ping protocol parser.

use crate::protocols::find_crlf;

/// Longest accepted request line, terminator excluded.
pub const MAX_LINE_LENGTH: usize = 1024;

/// A parsed request, borrowing from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Ping,
    /// `PING <message>`
    PingMsg(&'a [u8]),
    Quit,
}

/// Outcome of parsing the front of the input buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// A request and the bytes it occupied.
    Complete(Command<'a>, usize),
    /// No full line yet.
    Incomplete,
    /// A full line that is not a known command.
    Unknown(usize),
    /// No terminator within `MAX_LINE_LENGTH` bytes.
    TooLong,
}

pub fn parse(input: &[u8]) -> Frame<'_> {
    let Some(line_end) = find_crlf(input) else {
        return if input.len() > MAX_LINE_LENGTH + 1 {
            Frame::TooLong
        } else {
            Frame::Incomplete
        };
    };
    if line_end > MAX_LINE_LENGTH {
        return Frame::TooLong;
    }

    let line = &input[..line_end];
    let consumed = line_end + 2;

    if line.eq_ignore_ascii_case(b"PING") {
        Frame::Complete(Command::Ping, consumed)
    } else if line.eq_ignore_ascii_case(b"QUIT") {
        Frame::Complete(Command::Quit, consumed)
    } else if line.len() > 5 && line[..5].eq_ignore_ascii_case(b"PING ") {
        Frame::Complete(Command::PingMsg(&line[5..]), consumed)
    } else {
        Frame::Unknown(consumed)
    }
}

/// Append the reply for `command` to `out`.
pub fn encode_reply(command: Command<'_>, out: &mut Vec<u8>) {
    match command {
        Command::Ping => out.extend_from_slice(b"PONG\r\n"),
        Command::PingMsg(msg) => {
            out.reserve(msg.len() + 7);
            out.extend_from_slice(b"PONG ");
            out.extend_from_slice(msg);
            out.extend_from_slice(b"\r\n");
        }
        Command::Quit => out.extend_from_slice(b"OK\r\n"),
    }
}

pub const UNKNOWN_COMMAND: &[u8] = b"ERROR unknown command\r\n";
pub const LINE_TOO_LONG: &[u8] = b"ERROR line too long\r\n";
