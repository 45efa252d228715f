//! Tolerance-based equivalence checks between kernel outputs.
//!
//! Both tensors are promoted to F32 on the host and compared elementwise with
//! `|actual - expected| <= atol + rtol * |expected|`. The tolerance comes from
//! the precision of the `actual` tensor.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mismatches listed individually in a [`MismatchReport`].
const MAX_SAMPLES: usize = 8;

/// Floating-point precisions the kernels run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "f16")]
    Half,
    #[serde(rename = "bf16")]
    BFloat16,
    #[serde(rename = "f32")]
    Single,
}

/// Relative and absolute tolerance pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub rtol: f32,
    pub atol: f32,
}

impl Tolerance {
    pub fn allows(&self, actual: f32, expected: f32) -> bool {
        if actual.is_nan() || expected.is_nan() {
            return actual.is_nan() && expected.is_nan();
        }
        if actual == expected {
            // Covers matching infinities.
            return true;
        }
        if actual.is_infinite() || expected.is_infinite() {
            return false;
        }
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

impl Precision {
    pub const ALL: [Precision; 3] = [Precision::Half, Precision::BFloat16, Precision::Single];

    pub fn from_dtype(dtype: DType) -> Option<Self> {
        match dtype {
            DType::F16 => Some(Precision::Half),
            DType::BF16 => Some(Precision::BFloat16),
            DType::F32 => Some(Precision::Single),
            _ => None,
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Precision::Half => DType::F16,
            Precision::BFloat16 => DType::BF16,
            Precision::Single => DType::F32,
        }
    }

    pub fn tolerance(&self) -> Tolerance {
        match self {
            Precision::Half | Precision::Single => Tolerance {
                rtol: 1e-2,
                atol: 1e-2,
            },
            Precision::BFloat16 => Tolerance {
                rtol: 12e-2,
                atol: 1e-2,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Half => "f16",
            Precision::BFloat16 => "bf16",
            Precision::Single => "f32",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f16" | "float16" | "half" => Ok(Precision::Half),
            "bf16" | "bfloat16" => Ok(Precision::BFloat16),
            "f32" | "float32" | "float" => Ok(Precision::Single),
            other => Err(format!("unknown dtype '{other}' (expected f16, bf16 or f32)")),
        }
    }
}

/// Errors from an equivalence check.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("shape mismatch: actual {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        actual: Vec<usize>,
        expected: Vec<usize>,
    },
    #[error("no tolerance defined for dtype {0:?}")]
    UnsupportedDtype(DType),
    #[error("{0}")]
    Mismatch(Box<MismatchReport>),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// One element that failed the tolerance test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MismatchSample {
    pub index: usize,
    pub actual: f32,
    pub expected: f32,
}

/// Elementwise diagnostics of a failed check.
#[derive(Debug, Clone, PartialEq)]
pub struct MismatchReport {
    pub precision: Precision,
    pub tolerance: Tolerance,
    pub mismatched: usize,
    pub total: usize,
    pub max_abs_diff: f32,
    pub max_abs_index: usize,
    pub max_rel_diff: f32,
    pub max_rel_index: usize,
    pub samples: Vec<MismatchSample>,
}

impl fmt::Display for MismatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = 100.0 * self.mismatched as f64 / self.total.max(1) as f64;
        writeln!(
            f,
            "tensors not close ({}, rtol={}, atol={}): {} / {} elements mismatched ({pct:.1}%)",
            self.precision, self.tolerance.rtol, self.tolerance.atol, self.mismatched, self.total,
        )?;
        writeln!(
            f,
            "greatest absolute difference: {} at index {}",
            self.max_abs_diff, self.max_abs_index
        )?;
        write!(
            f,
            "greatest relative difference: {} at index {}",
            self.max_rel_diff, self.max_rel_index
        )?;
        for s in &self.samples {
            write!(
                f,
                "\n  [{}] actual={} expected={}",
                s.index, s.actual, s.expected
            )?;
        }
        Ok(())
    }
}

fn host_f32(tensor: &Tensor) -> Result<Vec<f32>, CheckError> {
    Ok(tensor
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1()?)
}

/// Compare flat F32 slices, returning the report of any violation.
pub fn compare_slices(
    actual: &[f32],
    expected: &[f32],
    precision: Precision,
) -> Option<MismatchReport> {
    let tolerance = precision.tolerance();
    let mut report = MismatchReport {
        precision,
        tolerance,
        mismatched: 0,
        total: actual.len(),
        max_abs_diff: 0.0,
        max_abs_index: 0,
        max_rel_diff: 0.0,
        max_rel_index: 0,
        samples: Vec::new(),
    };

    for (index, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        if tolerance.allows(a, e) {
            continue;
        }
        report.mismatched += 1;
        if report.samples.len() < MAX_SAMPLES {
            report.samples.push(MismatchSample {
                index,
                actual: a,
                expected: e,
            });
        }

        let abs = (a - e).abs();
        let rel = if e != 0.0 { abs / e.abs() } else { f32::INFINITY };
        // NaN never compares greater, so the first NaN mismatch wins via `is_nan`.
        if abs > report.max_abs_diff || (abs.is_nan() && !report.max_abs_diff.is_nan()) {
            report.max_abs_diff = abs;
            report.max_abs_index = index;
        }
        if rel > report.max_rel_diff || (rel.is_nan() && !report.max_rel_diff.is_nan()) {
            report.max_rel_diff = rel;
            report.max_rel_index = index;
        }
    }

    (report.mismatched > 0).then_some(report)
}

/// Check `actual` against `expected` with the tolerance of `actual`'s dtype.
pub fn assert_close(actual: &Tensor, expected: &Tensor) -> Result<(), CheckError> {
    if actual.dims() != expected.dims() {
        return Err(CheckError::ShapeMismatch {
            actual: actual.dims().to_vec(),
            expected: expected.dims().to_vec(),
        });
    }
    let precision =
        Precision::from_dtype(actual.dtype()).ok_or(CheckError::UnsupportedDtype(actual.dtype()))?;

    let a = host_f32(actual)?;
    let e = host_f32(expected)?;
    match compare_slices(&a, &e, precision) {
        Some(report) => Err(CheckError::Mismatch(Box::new(report))),
        None => Ok(()),
    }
}
