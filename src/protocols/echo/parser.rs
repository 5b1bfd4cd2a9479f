//! Echo protocol parser.

use crate::protocols::find_crlf;

/// Largest payload a client may ask to have echoed.
pub const MAX_ECHO_SIZE: usize = 16 * 1024 * 1024;

/// Longest header line (a decimal length or `QUIT`).
const MAX_HEADER_LENGTH: usize = 32;

/// Outcome of parsing the front of the input buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// A full request: the payload and total bytes occupied.
    Echo(&'a [u8], usize),
    /// `QUIT` and the bytes it occupied.
    Quit(usize),
    /// Header or payload not fully buffered yet.
    Incomplete,
    /// Header is not a decimal length. Skip the header line.
    InvalidLength(usize),
    /// Length above `MAX_ECHO_SIZE`. Skip the header line.
    TooLarge(usize),
}

pub fn parse(input: &[u8]) -> Frame<'_> {
    let Some(line_end) = find_crlf(input) else {
        return if input.len() > MAX_HEADER_LENGTH {
            Frame::InvalidLength(input.len())
        } else {
            Frame::Incomplete
        };
    };

    let line = &input[..line_end];
    let header_len = line_end + 2;

    if line.eq_ignore_ascii_case(b"QUIT") {
        return Frame::Quit(header_len);
    }

    let length = match std::str::from_utf8(line).ok().and_then(|s| s.trim().parse::<usize>().ok()) {
        Some(length) => length,
        None => return Frame::InvalidLength(header_len),
    };
    if length > MAX_ECHO_SIZE {
        return Frame::TooLarge(header_len);
    }

    let total = header_len + length;
    if input.len() < total {
        return Frame::Incomplete;
    }
    Frame::Echo(&input[header_len..total], total)
}

/// Append `<length>\r\n<payload>` to `out`.
pub fn encode_echo(payload: &[u8], out: &mut Vec<u8>) {
    out.reserve(payload.len() + 12);
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(payload);
}

pub fn encode_error(msg: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(format!("ERROR {msg}\r\n").as_bytes());
}
