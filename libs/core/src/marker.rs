//! Textual contract that links an operator reply to the visitor it answers.
//!
//! Every forwarded visitor message ends with a line `Session-Token: <token>`. When the
//! operator replies to that message, the channel hands back the quoted text and the
//! token is read from the last marker occurrence: the marker, optional spaces or
//! tabs, then the token up to the next whitespace.

use crate::CorrelationToken;

pub const TOKEN_MARKER: &str = "Session-Token:";

/// Renders the marker line for `token`.
pub fn token_line(token: &CorrelationToken) -> String {
    format!("{TOKEN_MARKER} {token}")
}

/// Extracts the token from quoted message text.
///
/// Only the last marker counts. The formatter always writes the real marker last,
/// so a marker typed into the message body cannot take over the reply.
pub fn extract_token(quoted: &str) -> Option<CorrelationToken> {
    let start = quoted.rfind(TOKEN_MARKER)? + TOKEN_MARKER.len();
    let rest = quoted[start..].trim_start_matches([' ', '\t']);
    let run = rest.split(char::is_whitespace).next()?;
    CorrelationToken::parse(run)
}
