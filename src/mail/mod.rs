//! Inbound email normalization — body extraction, quoted-reply
//! stripping, and threading-header normalization.

pub mod body;
pub mod headers;
pub mod quotes;

pub use body::extract_text;
pub use headers::{normalize_msg_id, ThreadingIds};
pub use quotes::strip_quoted_reply;
