//! Vector kernels and two-phase MRL search.
//!
//! This module provides the numeric primitives for semantic search:
//! distance kernels, unit normalization, and Matryoshka (MRL) prefix
//! truncation. MRL embeddings keep most of their semantic similarity
//! when truncated to a supported prefix length and re-normalized, which
//! is what makes the cheap Phase-1 scan in [`TwoPhaseSearch`] viable.
//!
//! # Precision
//!
//! Kernels accept both `f32` and `f64` inputs (anything implementing
//! [`Scalar`]) and accumulate in `f64` so `cosine_similarity` stays in
//! `[-1, 1]` even for large dimensions.

mod two_phase;

pub use two_phase::{
    FullEmbeddingProvider, HotMeta, SearchHit, SearchOptions, SearchStats, TwoPhaseSearch,
};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ValidationError};

/// Numeric component type accepted by the vector kernels.
///
/// Implemented for `f32` and `f64`. Accumulation always happens in
/// `f64` regardless of the input width.
pub trait Scalar: Copy {
    /// Widens the component to `f64`.
    fn to_f64(self) -> f64;
}

impl Scalar for f32 {
    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Scalar for f64 {
    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}

/// Supported MRL truncation dimensions.
///
/// The hot index fixes one of these per instance; truncation to any
/// other length is rejected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HotDimension {
    /// 64-component prefix.
    D64,
    /// 128-component prefix (default).
    #[default]
    D128,
    /// 256-component prefix.
    D256,
    /// 512-component prefix.
    D512,
    /// 768-component prefix.
    D768,
}

impl HotDimension {
    /// Returns the numeric size of this dimension.
    #[inline]
    pub const fn size(&self) -> usize {
        match self {
            Self::D64 => 64,
            Self::D128 => 128,
            Self::D256 => 256,
            Self::D512 => 512,
            Self::D768 => 768,
        }
    }

    /// Maps a numeric size onto the supported set.
    ///
    /// # Errors
    /// Returns `ValidationError::UnsupportedDimension` for any size
    /// outside `{64, 128, 256, 512, 768}`.
    pub fn from_size(size: usize) -> Result<Self> {
        match size {
            64 => Ok(Self::D64),
            128 => Ok(Self::D128),
            256 => Ok(Self::D256),
            512 => Ok(Self::D512),
            768 => Ok(Self::D768),
            got => Err(ValidationError::UnsupportedDimension { got }.into()),
        }
    }
}

fn check_pair<A: Scalar, B: Scalar>(a: &[A], b: &[B]) -> Result<()> {
    if a.is_empty() || b.is_empty() {
        return Err(ValidationError::EmptyVector.into());
    }
    if a.len() != b.len() {
        return Err(ValidationError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        }
        .into());
    }
    Ok(())
}

/// Dot product of two equal-length vectors.
///
/// # Errors
/// Rejects empty inputs and length mismatches.
pub fn dot_product<A: Scalar, B: Scalar>(a: &[A], b: &[B]) -> Result<f64> {
    check_pair(a, b)?;
    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| x.to_f64() * y.to_f64())
        .sum())
}

/// Cosine similarity of two equal-length vectors, clamped to `[-1, 1]`.
///
/// # Errors
/// Rejects empty inputs, length mismatches, and zero vectors (the
/// similarity is undefined there).
pub fn cosine_similarity<A: Scalar, B: Scalar>(a: &[A], b: &[B]) -> Result<f64> {
    check_pair(a, b)?;
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (x.to_f64(), y.to_f64());
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Err(ValidationError::ZeroVector.into());
    }
    Ok((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0))
}

/// Euclidean (L2) distance between two equal-length vectors.
///
/// # Errors
/// Rejects empty inputs and length mismatches.
pub fn euclidean_distance<A: Scalar, B: Scalar>(a: &[A], b: &[B]) -> Result<f64> {
    check_pair(a, b)?;
    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x.to_f64() - y.to_f64();
            d * d
        })
        .sum();
    Ok(sum.sqrt())
}

/// Scales a vector to unit length.
///
/// # Errors
/// Rejects empty and zero vectors.
pub fn normalize<S: Scalar>(v: &[S]) -> Result<Vec<f32>> {
    if v.is_empty() {
        return Err(ValidationError::EmptyVector.into());
    }
    let norm: f64 = v.iter().map(|x| x.to_f64() * x.to_f64()).sum::<f64>().sqrt();
    if norm == 0.0 {
        return Err(ValidationError::ZeroVector.into());
    }
    Ok(v.iter().map(|x| (x.to_f64() / norm) as f32).collect())
}

/// Truncates an embedding to an MRL prefix of length `dim`.
///
/// # Errors
/// Rejects vectors shorter than `dim`.
pub fn truncate_embedding<S: Scalar>(v: &[S], dim: HotDimension) -> Result<Vec<f32>> {
    let size = dim.size();
    if v.len() < size {
        return Err(ValidationError::VectorTooShort {
            len: v.len(),
            dim: size,
        }
        .into());
    }
    Ok(v[..size].iter().map(|x| x.to_f64() as f32).collect())
}

/// Truncates to `dim` and re-normalizes to unit length.
///
/// MRL prefixes are not unit vectors even when the full embedding is,
/// so a rescale after truncation is mandatory before cosine scoring.
pub fn truncate_and_normalize<S: Scalar>(v: &[S], dim: HotDimension) -> Result<Vec<f32>> {
    let truncated = truncate_embedding(v, dim)?;
    normalize(&truncated)
}
