//! Playback source descriptors.
//!
//! A source is exactly one of an in-memory byte buffer or a remote URL,
//! with an optional display name. Supplying both or neither is a validation
//! error, caught before any network or engine call is made.

use thiserror::Error;

/// Errors produced by source validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Both a byte buffer and a URL were supplied.
    #[error("ambiguous source: both a byte buffer and a URL were supplied")]
    Ambiguous,
    /// Neither a byte buffer nor a URL was supplied.
    #[error("unknown source: neither a byte buffer nor a URL was supplied")]
    Unknown,
}

/// Describes where MIDI file bytes come from.
#[derive(Debug, Clone, Default)]
pub struct SourceDescriptor {
    /// MIDI file bytes already in memory.
    pub bytes: Option<Vec<u8>>,
    /// Remote location to fetch MIDI file bytes from.
    pub url: Option<String>,
    /// Optional display name used in event messages.
    pub name: Option<String>,
}

/// A validated view of a descriptor: exactly one origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedSource<'a> {
    Bytes(&'a [u8]),
    Url(&'a str),
}

impl SourceDescriptor {
    /// Creates a descriptor over an in-memory byte buffer.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Some(bytes),
            url: None,
            name: None,
        }
    }

    /// Creates a descriptor over a remote URL.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            bytes: None,
            url: Some(url.into()),
            name: None,
        }
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Enforces the one-origin invariant.
    pub fn resolve(&self) -> Result<ResolvedSource<'_>, SourceError> {
        match (self.bytes.as_deref(), self.url.as_deref()) {
            (Some(_), Some(_)) => Err(SourceError::Ambiguous),
            (Some(bytes), None) => Ok(ResolvedSource::Bytes(bytes)),
            (None, Some(url)) => Ok(ResolvedSource::Url(url)),
            (None, None) => Err(SourceError::Unknown),
        }
    }

    /// Name used in event messages: explicit name, else the URL, else a
    /// generic buffer label.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.url.as_deref())
            .unwrap_or("in-memory buffer")
    }
}
