//! Value Triplets
//!
//! A triplet is the unit of data flowing through the propagation graph: a
//! payload stamped with the time it was produced and a quality code
//! describing how much the reading can be trusted.
//!
//! # Equality
//!
//! Triplet equality is the change-detection relation used by the graph:
//! two triplets are equal iff their stamps are equal, their qualities are
//! equal and their values are equal under the payload's own `PartialEq`.
//! Payloads are often numeric vectors, so equality is element-wise, never
//! identity. A triplet can also be compared against a plain
//! `(value, stamp, quality)` tuple.
//!
//! # Construction
//!
//! The stamp is floating-point seconds. A non-finite stamp (NaN or
//! infinite) would poison the equality relation, so construction rejects
//! it. Quality codes arriving as raw integers go through
//! [`Quality::from_code`], which rejects codes outside the known set.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when assembling a triplet from untyped parts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TripletError {
    /// The timestamp is NaN or infinite.
    #[error("the timestamp is not a finite number: {0}")]
    NonFiniteStamp(f64),

    /// The integer code does not name a known quality.
    #[error("unknown quality code: {0}")]
    UnknownQuality(u8),
}

/// Quality code attached to a reading.
///
/// The codes mirror the facility convention: `Valid` readings are normal,
/// `Invalid` readings carry no usable value, the remaining codes flag a
/// value that is usable but suspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Quality {
    Valid = 0,
    Invalid = 1,
    Alarm = 2,
    Changing = 3,
    Warning = 4,
}

impl Quality {
    /// Get the integer wire code for this quality.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Decode an integer wire code.
    pub fn from_code(code: u8) -> Result<Self, TripletError> {
        match code {
            0 => Ok(Quality::Valid),
            1 => Ok(Quality::Invalid),
            2 => Ok(Quality::Alarm),
            3 => Ok(Quality::Changing),
            4 => Ok(Quality::Warning),
            other => Err(TripletError::UnknownQuality(other)),
        }
    }

    /// Combine qualities: the most severe one wins.
    ///
    /// Severity precedence is `Invalid > Alarm > Changing > Warning >
    /// Valid`, so a derived reading is only as trustworthy as its worst
    /// input. An empty set aggregates to `Valid`.
    pub fn aggregate<I>(qualities: I) -> Quality
    where
        I: IntoIterator<Item = Quality>,
    {
        qualities
            .into_iter()
            .max_by_key(|quality| quality.severity())
            .unwrap_or(Quality::Valid)
    }

    fn severity(self) -> u8 {
        match self {
            Quality::Valid => 0,
            Quality::Warning => 1,
            Quality::Changing => 2,
            Quality::Alarm => 3,
            Quality::Invalid => 4,
        }
    }
}

/// An immutable (value, stamp, quality) reading.
///
/// # Type Parameters
///
/// - `V`: The payload type. Equality over `V` must be structural (e.g.
///   `Vec<f64>` compares element-wise), since it drives the graph's
///   change detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Triplet<V> {
    value: V,
    stamp: f64,
    quality: Quality,
}

impl<V> Triplet<V> {
    /// Create a triplet with the default `Valid` quality.
    pub fn new(value: V, stamp: f64) -> Result<Self, TripletError> {
        Self::with_quality(value, stamp, Quality::Valid)
    }

    /// Create a triplet with an explicit quality.
    pub fn with_quality(value: V, stamp: f64, quality: Quality) -> Result<Self, TripletError> {
        if !stamp.is_finite() {
            return Err(TripletError::NonFiniteStamp(stamp));
        }
        Ok(Self {
            value,
            stamp,
            quality,
        })
    }

    /// Stamp a value with the current wall-clock time.
    pub fn now(value: V) -> Self {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            value,
            stamp,
            quality: Quality::Valid,
        }
    }

    /// Get the payload.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Get the timestamp in floating-point seconds.
    pub fn stamp(&self) -> f64 {
        self.stamp
    }

    /// Get the quality code.
    pub fn quality(&self) -> Quality {
        self.quality
    }

    /// Consume the triplet, keeping only the payload.
    pub fn into_value(self) -> V {
        self.value
    }
}

impl<V: PartialEq> PartialEq for Triplet<V> {
    fn eq(&self, other: &Self) -> bool {
        self.stamp == other.stamp && self.quality == other.quality && self.value == other.value
    }
}

impl<V: PartialEq> PartialEq<(V, f64, Quality)> for Triplet<V> {
    fn eq(&self, other: &(V, f64, Quality)) -> bool {
        self.stamp == other.1 && self.quality == other.2 && self.value == other.0
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
