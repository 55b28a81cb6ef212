//! Identifier types for audio entries and opened containers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::num::NonZeroU32;
use std::path::Path;

/// Number of hex characters kept from the path digest.
const LABEL_LEN: usize = 8;

/// Identifier of one playable audio unit.
///
/// The container formats use `0` as the "absent" sentinel, so an `AudioId`
/// can only be built from a non-zero raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudioId(NonZeroU32);

impl AudioId {
    /// Create an id from a raw reference field. Returns `None` for zero.
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Get the raw value.
    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// File name this id is stored under inside an extraction or staging dir.
    pub fn file_name(self, extension: &str) -> String {
        format!("{}.{}", self.0, extension)
    }
}

impl fmt::Display for AudioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for AudioId {
    type Error = ZeroAudioId;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or(ZeroAudioId)
    }
}

/// Returned when converting the zero sentinel into an [`AudioId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("audio id 0 is the absent sentinel, not a reference")]
pub struct ZeroAudioId;

/// Stable short fingerprint of a container's file path.
///
/// Used to namespace temp directories and derived node keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerLabel(String);

impl ContainerLabel {
    /// Derive the label for a container path: the first 8 hex characters of
    /// the SHA-256 of the path string.
    pub fn from_path(path: &Path) -> Self {
        let digest = Sha256::digest(path.to_string_lossy().as_bytes());
        let mut hex = hex::encode(digest);
        hex.truncate(LABEL_LEN);
        Self(hex)
    }

    /// Wrap an existing label string.
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Get the label as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<Path> for ContainerLabel {
    fn as_ref(&self) -> &Path {
        Path::new(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_not_an_id() {
        assert!(AudioId::new(0).is_none());
        assert_eq!(AudioId::try_from(0), Err(ZeroAudioId));
        assert_eq!(AudioId::new(42).map(AudioId::get), Some(42));
    }

    #[test]
    fn test_file_name() {
        let id = AudioId::new(123456).unwrap();
        assert_eq!(id.file_name("wem"), "123456.wem");
    }

    #[test]
    fn test_label_is_deterministic() {
        let a = ContainerLabel::from_path(Path::new("/game/sound/bgm.bnk"));
        let b = ContainerLabel::from_path(Path::new("/game/sound/bgm.bnk"));
        let c = ContainerLabel::from_path(Path::new("/game/sound/bgm_m.bnk"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), LABEL_LEN);
        assert!(a.as_str().chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}
