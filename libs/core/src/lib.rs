//! Storefront feedback relay core contracts.
//!
//! Visitors hold one websocket each and are keyed by a [`CorrelationToken`]. The
//! operator answers from a single bot-style channel. This crate holds the pieces that
//! are independent of any transport: the [`ConnectionRegistry`], the token marker that
//! ties operator replies back to visitors, the outbound formatter and the
//! [`ReplyRouter`].
pub mod format;
pub mod frames;
pub mod marker;
pub mod operator;
pub mod registry;
pub mod router;
pub mod token;

pub use format::*;
pub use frames::*;
pub use marker::*;
pub use operator::*;
pub use registry::*;
pub use router::*;
pub use token::*;

/// Current UTC time rendered as RFC 3339, the timestamp format used on every frame.
pub fn now_rfc3339() -> String {
    rfc3339(time::OffsetDateTime::now_utc())
}

pub(crate) fn rfc3339(at: time::OffsetDateTime) -> String {
    at.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into())
}
