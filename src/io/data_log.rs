//! Per-subsystem CSV output.
//!
//! Each logger owns one file; the first column is always `time`. A disabled
//! logger swallows writes so call sites stay unconditional.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use csv::Writer;
use nalgebra::{DVector, UnitQuaternion, Vector3};

pub struct DataLogger {
    writer: Option<Writer<File>>,
}

impl DataLogger {
    /// Creates (or truncates) `file_name` under `out_dir`. When disabled no
    /// file is touched.
    pub fn new(out_dir: &Path, file_name: &str, enabled: bool) -> Result<Self> {
        if !enabled {
            return Ok(Self { writer: None });
        }
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        let path = out_dir.join(file_name);
        let writer = Writer::from_path(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self {
            writer: Some(writer),
        })
    }

    pub fn define_header(&mut self, columns: &[String]) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.write_record(columns)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Writes one row of raw fields.
    pub fn log(&mut self, fields: &[String]) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.write_record(fields)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Writes `time` followed by numeric values.
    pub fn log_values(&mut self, time: f64, values: &[f64]) -> Result<()> {
        if self.writer.is_none() {
            return Ok(());
        }
        let mut fields = Vec::with_capacity(values.len() + 1);
        fields.push(format!("{time}"));
        fields.extend(values.iter().map(|v| format!("{v}")));
        self.log(&fields)
    }
}

/// `prefix_0, prefix_1, ...` column names, matching the layout of flattened
/// state vectors.
pub fn enumerate_header(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{prefix}_{i}")).collect()
}

/// Flattens common value types into the row buffer.
pub fn push_vector3(fields: &mut Vec<f64>, v: &Vector3<f64>) {
    fields.extend([v.x, v.y, v.z]);
}

pub fn push_quaternion(fields: &mut Vec<f64>, q: &UnitQuaternion<f64>) {
    fields.extend([q.w, q.i, q.j, q.k]);
}

pub fn push_dvector(fields: &mut Vec<f64>, v: &DVector<f64>) {
    fields.extend(v.iter().copied());
}
