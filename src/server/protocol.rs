//! Line framing for the miner-facing protocol.
//!
//! One command per line. Tokens are separated by spaces, except that a
//! single trailing argument may be prefixed with `:` to consume the rest
//! of the line verbatim.

use std::fmt;

/// Split a protocol line into its command and arguments.
///
/// Returns `None` for blank lines.
pub fn parse_line(line: &str) -> Option<(String, Vec<String>)> {
    let mut rest = line.trim_end_matches(['\r', '\n']).trim_start();
    if rest.is_empty() {
        return None;
    }

    let mut tokens = Vec::new();
    while !rest.is_empty() {
        if let Some(trailing) = rest.strip_prefix(':') {
            tokens.push(trailing.to_string());
            break;
        }
        match rest.split_once(' ') {
            Some((token, tail)) => {
                if !token.is_empty() {
                    tokens.push(token.to_string());
                }
                rest = tail.trim_start();
            }
            None => {
                tokens.push(rest.to_string());
                break;
            }
        }
    }

    let command = tokens.remove(0);
    Some((command, tokens))
}

/// A frame sent to a miner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Informational or error text, shown on the miner's console
    Msg(String),
    /// Current block height on the upstream network
    Block(u64),
    /// New solution target, hex-encoded
    Target(String),
    /// A work assignment: header hex and mask size
    Work(String, u8),
    /// The submitted result was valid and passed upstream
    Accepted(String),
    /// The submitted result did not check out
    Rejected(String),
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Msg(text) => write!(f, "MSG :{}", text),
            Frame::Block(height) => write!(f, "BLOCK {}", height),
            Frame::Target(hex) => write!(f, "TARGET {}", hex),
            Frame::Work(hex, mask) => write!(f, "WORK {} {}", hex, mask),
            Frame::Accepted(hex) => write!(f, "ACCEPTED :{}", hex),
            Frame::Rejected(hex) => write!(f, "REJECTED :{}", hex),
        }
    }
}
