//! Result delivery and cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use num_complex::Complex64;

use crate::error::{Error, Result};

/// What a delivered point belongs to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointLabel {
    /// A single operating point.
    Op,
    /// One step of a DC sweep, tagged with the swept value.
    Sweep(f64),
    /// One accepted transient timepoint (s).
    Time(f64),
    /// One AC or noise frequency point (Hz).
    Frequency(f64),
}

/// Receives computed quantities at each accepted point.
///
/// All methods default to no-ops so sinks implement only what they care
/// about. AC analyses deliver complex values; noise analyses deliver PSD
/// contributions in V^2/Hz through [`ResultSink::device_value`].
pub trait ResultSink {
    fn begin_point(&mut self, label: PointLabel) {
        let _ = label;
    }

    fn node_value(&mut self, node: usize, value: f64) {
        let _ = (node, value);
    }

    fn node_complex(&mut self, node: usize, value: Complex64) {
        let _ = (node, value);
    }

    fn device_value(&mut self, device: &str, property: &str, value: f64) {
        let _ = (device, property, value);
    }
}

/// A sink that drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl ResultSink for NullSink {}

/// A sink that records every delivered value (used by the test suites).
#[derive(Debug, Default)]
pub struct VecSink {
    pub points: Vec<(PointLabel, Vec<(usize, f64)>)>,
    pub complex_points: Vec<(PointLabel, Vec<(usize, Complex64)>)>,
    pub device_values: Vec<(String, String, f64)>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The real value recorded for `node` at the last point.
    pub fn last_value(&self, node: usize) -> Option<f64> {
        let (_, values) = self.points.last()?;
        values.iter().find(|(n, _)| *n == node).map(|&(_, v)| v)
    }
}

impl ResultSink for VecSink {
    fn begin_point(&mut self, label: PointLabel) {
        self.points.push((label, Vec::new()));
        self.complex_points.push((label, Vec::new()));
    }

    fn node_value(&mut self, node: usize, value: f64) {
        if let Some((_, values)) = self.points.last_mut() {
            values.push((node, value));
        }
    }

    fn node_complex(&mut self, node: usize, value: Complex64) {
        if let Some((_, values)) = self.complex_points.last_mut() {
            values.push((node, value));
        }
    }

    fn device_value(&mut self, device: &str, property: &str, value: f64) {
        self.device_values
            .push((device.to_string(), property.to_string(), value));
    }
}

/// Opaque cancellation token polled between Newton iterations and between
/// timesteps. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the analysis driver returns `Cancelled` at
    /// its next poll, with partial state preserved.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Error if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
