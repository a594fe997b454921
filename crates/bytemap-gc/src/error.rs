//! Error type of the collector.

use std::error::Error;
use std::fmt;
use std::io;

/// Errors surfaced by [`GcHeap`](crate::GcHeap).
///
/// Allocation pressure is handled internally by collecting and growing; only
/// what survives that ladder reaches the caller.
#[derive(Debug)]
#[non_exhaustive]
pub enum GcError {
    /// A [`GcConfig`](crate::GcConfig) knob is out of range.
    InvalidConfig(&'static str),
    /// The OS refused to map a region.
    RegionMap {
        /// Requested length in bytes.
        len: usize,
        /// The underlying OS error.
        source: io::Error,
    },
    /// Allocation failed after collecting and growing the heap.
    OutOfMemory {
        /// Requested object length in slots.
        length: usize,
        /// Size class of the request.
        class: usize,
    },
    /// The mark stack outgrew its scratch space.
    ScratchSpaceExhausted {
        /// Scratch space size in bytes.
        capacity: usize,
    },
    /// The background marker thread could not be started.
    MarkerSpawn(io::Error),
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(reason) => write!(f, "invalid GC configuration: {reason}"),
            Self::RegionMap { len, source } => {
                write!(f, "failed to map a {len} byte region: {source}")
            }
            Self::OutOfMemory { length, class } => write!(
                f,
                "out of memory allocating an object of length {length} (size class {class})"
            ),
            Self::ScratchSpaceExhausted { capacity } => write!(
                f,
                "GC panic: mark stack exhausted its {capacity} byte scratch space"
            ),
            Self::MarkerSpawn(source) => write!(f, "failed to start the marker thread: {source}"),
        }
    }
}

impl Error for GcError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::RegionMap { source, .. } | Self::MarkerSpawn(source) => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_map_exposes_source() {
        let err = GcError::RegionMap {
            len: 4096,
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        };
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("failed to map a 4096 byte region"));
    }

    #[test]
    fn messages() {
        assert_eq!(
            GcError::OutOfMemory { length: 3, class: 1 }.to_string(),
            "out of memory allocating an object of length 3 (size class 1)"
        );
        assert!(GcError::InvalidConfig("x").source().is_none());
    }
}
