//! Subject naming conventions.
//!
//! ```text
//! <prefix>.peer.<peer_id>   one inbound subject per peer (A2A envelopes)
//! <prefix>.presence         presence announcements
//! <prefix>.directory        directory queries ("who is out there?")
//! <prefix>.handshake        signed session handshakes
//! ```

use crate::identity::PeerId;

pub fn inbound(prefix: &str, peer: &PeerId) -> String {
    format!("{prefix}.peer.{peer}")
}

pub fn presence(prefix: &str) -> String {
    format!("{prefix}.presence")
}

pub fn directory(prefix: &str) -> String {
    format!("{prefix}.directory")
}

pub fn handshake(prefix: &str) -> String {
    format!("{prefix}.handshake")
}

/// A single subject token: non-empty, no whitespace, no separators or
/// wildcards.
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// A full dotted subject made of valid tokens.
pub fn is_valid_subject(subject: &str) -> bool {
    !subject.is_empty() && subject.split('.').all(is_valid_token)
}
