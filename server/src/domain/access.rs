//! Access mode algebra.
//!
//! Permissions are a fixed-width bitmask with named bits
//! `{J,R,W,P,A,S,D,O}`. The *effective* mode of a subscriber is
//! `want & given`. Changes travel on the wire as a delta string such as
//! `"+RW-P"` derived from the old and new values.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

bitflags! {
    /// Topic permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct AccessMode: u16 {
        /// Join the topic.
        const JOIN = 0x01;
        /// Read `{data}`.
        const READ = 0x02;
        /// Publish `{data}`.
        const WRITE = 0x04;
        /// Receive presence updates.
        const PRES = 0x08;
        /// Approve requests, manage other subscribers.
        const APPROVE = 0x10;
        /// Invite others.
        const SHARE = 0x20;
        /// Hard-delete messages.
        const DELETE = 0x40;
        /// Topic ownership.
        const OWNER = 0x80;
        /// Sentinel for subscriptions whose counterpart user is deleted.
        /// Never granted, never parsed from text.
        const INVALID = 0x100;
    }
}

const MODE_CHARS: [(AccessMode, char); 8] = [
    (AccessMode::JOIN, 'J'),
    (AccessMode::READ, 'R'),
    (AccessMode::WRITE, 'W'),
    (AccessMode::PRES, 'P'),
    (AccessMode::APPROVE, 'A'),
    (AccessMode::SHARE, 'S'),
    (AccessMode::DELETE, 'D'),
    (AccessMode::OWNER, 'O'),
];

impl AccessMode {
    /// No permissions, prints as `"N"`.
    pub const NONE: AccessMode = AccessMode::empty();

    /// Default mode for authenticated users on group topics.
    pub const AUTH: AccessMode = AccessMode::JOIN
        .union(AccessMode::READ)
        .union(AccessMode::WRITE)
        .union(AccessMode::PRES)
        .union(AccessMode::SHARE);

    /// Everything except ownership and invalidity.
    pub const FULL: AccessMode = AccessMode::AUTH
        .union(AccessMode::APPROVE)
        .union(AccessMode::DELETE);

    /// Canonical mode for p2p topics.
    pub const P2P: AccessMode = AccessMode::JOIN
        .union(AccessMode::READ)
        .union(AccessMode::WRITE)
        .union(AccessMode::PRES)
        .union(AccessMode::APPROVE);

    /// Canonical mode for non-root subscribers of the `sys` topic: they may
    /// attach and write reports but never read the channel.
    pub const SYS: AccessMode = AccessMode::JOIN.union(AccessMode::WRITE);

    /// Frozen `given` mode of channel readers.
    pub const CHN_READER: AccessMode = AccessMode::JOIN
        .union(AccessMode::READ)
        .union(AccessMode::PRES);

    pub fn is_joiner(&self) -> bool {
        self.contains(AccessMode::JOIN)
    }

    pub fn is_reader(&self) -> bool {
        self.contains(AccessMode::READ)
    }

    pub fn is_writer(&self) -> bool {
        self.contains(AccessMode::WRITE)
    }

    pub fn is_presencer(&self) -> bool {
        self.contains(AccessMode::PRES)
    }

    pub fn is_approver(&self) -> bool {
        self.contains(AccessMode::APPROVE)
    }

    pub fn is_sharer(&self) -> bool {
        self.contains(AccessMode::SHARE)
    }

    pub fn is_deleter(&self) -> bool {
        self.contains(AccessMode::DELETE)
    }

    pub fn is_owner(&self) -> bool {
        self.contains(AccessMode::OWNER)
    }

    pub fn is_invalid(&self) -> bool {
        self.contains(AccessMode::INVALID)
    }

    /// True when every bit of `other` is also set in `self`.
    pub fn better_equal(&self, other: AccessMode) -> bool {
        self.contains(other)
    }

    /// Text delta that turns `old` into `new`, e.g. `"+RW-P"`. Empty when
    /// the modes are equal.
    pub fn delta(old: AccessMode, new: AccessMode) -> String {
        let added = new & !old;
        let removed = old & !new;
        let mut out = String::new();
        if !added.is_empty() {
            out.push('+');
            push_chars(&mut out, added);
        }
        if !removed.is_empty() {
            out.push('-');
            push_chars(&mut out, removed);
        }
        out
    }

    /// Apply a delta string produced by [`AccessMode::delta`].
    pub fn apply_delta(&self, delta: &str) -> Result<AccessMode, AccessModeError> {
        let mut mode = *self;
        let mut grant = true;
        for c in delta.chars() {
            match c {
                '+' => grant = true,
                '-' => grant = false,
                _ => {
                    let bit = bit_for_char(c).ok_or(AccessModeError::BadChar(c))?;
                    if grant {
                        mode |= bit;
                    } else {
                        mode &= !bit;
                    }
                }
            }
        }
        Ok(mode)
    }
}

fn push_chars(out: &mut String, mode: AccessMode) {
    for (bit, c) in MODE_CHARS {
        if mode.contains(bit) {
            out.push(c);
        }
    }
}

fn bit_for_char(c: char) -> Option<AccessMode> {
    MODE_CHARS
        .iter()
        .find(|(_, m)| *m == c.to_ascii_uppercase())
        .map(|(bit, _)| *bit)
}

/// Error parsing an access mode or delta string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessModeError {
    #[error("unrecognized permission '{0}'")]
    BadChar(char),
    #[error("empty access mode")]
    Empty,
}

impl FromStr for AccessMode {
    type Err = AccessModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AccessModeError::Empty);
        }
        if s == "N" || s == "n" {
            return Ok(AccessMode::NONE);
        }
        let mut mode = AccessMode::NONE;
        for c in s.chars() {
            mode |= bit_for_char(c).ok_or(AccessModeError::BadChar(c))?;
        }
        Ok(mode)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() || (*self & !AccessMode::INVALID).is_empty() {
            return f.write_str("N");
        }
        let mut out = String::with_capacity(8);
        push_chars(&mut out, *self);
        f.write_str(&out)
    }
}

impl Serialize for AccessMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AccessMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_display_roundtrip() {
        for text in ["N", "J", "JRWP", "JRWPASDO", "RP", "O"] {
            let mode: AccessMode = text.parse().unwrap();
            assert_eq!(mode.to_string(), text);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(
            "JRX".parse::<AccessMode>(),
            Err(AccessModeError::BadChar('X'))
        );
        assert_eq!("".parse::<AccessMode>(), Err(AccessModeError::Empty));
    }

    #[test]
    fn test_parse_lowercase() {
        assert_eq!("jrwp".parse::<AccessMode>().unwrap(), AccessMode::P2P & !AccessMode::APPROVE);
    }

    #[test]
    fn test_delta_identity_is_empty() {
        let m: AccessMode = "JRWP".parse().unwrap();
        assert_eq!(AccessMode::delta(m, m), "");
    }

    #[test]
    fn test_delta_apply_roundtrip() {
        let cases = [
            ("JRWP", "JRWPA"),
            ("JRWPA", "JR"),
            ("N", "JRWPASDO"),
            ("JRWPASDO", "N"),
            ("JP", "RW"),
        ];
        for (from, to) in cases {
            let a: AccessMode = from.parse().unwrap();
            let b: AccessMode = to.parse().unwrap();
            let d = AccessMode::delta(a, b);
            assert_eq!(a.apply_delta(&d).unwrap(), b, "delta {:?}", d);
        }
    }

    #[test]
    fn test_delta_format() {
        let a: AccessMode = "JP".parse().unwrap();
        let b: AccessMode = "JRW".parse().unwrap();
        assert_eq!(AccessMode::delta(a, b), "+RW-P");
    }

    #[test]
    fn test_better_equal() {
        let big: AccessMode = "JRWPA".parse().unwrap();
        let small: AccessMode = "JR".parse().unwrap();
        assert!(big.better_equal(small));
        assert!(!small.better_equal(big));
        assert!(big.better_equal(big));
    }

    #[test]
    fn test_invalid_displays_as_none() {
        assert_eq!(AccessMode::INVALID.to_string(), "N");
        assert!(AccessMode::INVALID.is_invalid());
    }

    #[test]
    fn test_effective_mode() {
        let want: AccessMode = "JRWPASDO".parse().unwrap();
        let given: AccessMode = "JRWP".parse().unwrap();
        assert_eq!(want & given, given);
    }
}
