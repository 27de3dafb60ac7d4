//! Tabular series loading and tensor preparation.
//!
//! Input tables follow a fixed convention: column 0 is a row label (date or
//! index) that never enters the computation, columns `1..=m` hold the `m`
//! observed series. The same layout is used for the externally filtered
//! trend table, which is `2w` rows shorter than the training table.

use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::error::{DeepVarError, Result};
use crate::time_basis::time_function_values;

/// A labelled `T × m` table of observations.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesTable {
    labels: Vec<String>,
    columns: Vec<String>,
    values: Vec<Vec<f64>>,
}

impl SeriesTable {
    /// Build a table from row labels and row-major values.
    ///
    /// # Errors
    ///
    /// Returns [`DeepVarError::ShapeMismatch`] when there are no rows, no
    /// series, ragged rows, or fewer labels than rows.
    pub fn new(labels: Vec<String>, values: Vec<Vec<f64>>) -> Result<Self> {
        let series = values.first().map_or(0, Vec::len);
        let columns = (0..series).map(|i| i.to_string()).collect();
        Self::with_columns(labels, columns, values)
    }

    /// Build a table with explicit series names.
    ///
    /// # Errors
    ///
    /// Same rules as [`SeriesTable::new`], plus the column names must match
    /// the row width.
    pub fn with_columns(
        labels: Vec<String>,
        columns: Vec<String>,
        values: Vec<Vec<f64>>,
    ) -> Result<Self> {
        if values.is_empty() {
            return Err(DeepVarError::shape_mismatch(
                "at least one row",
                "0 rows",
            ));
        }
        let series = values[0].len();
        if series == 0 {
            return Err(DeepVarError::shape_mismatch(
                "a label column and at least one series column",
                "1 column",
            ));
        }
        if let Some((row, bad)) = values.iter().enumerate().find(|(_, r)| r.len() != series) {
            return Err(DeepVarError::shape_mismatch(
                format!("{series} series values in every row"),
                format!("{} values in row {row}", bad.len()),
            ));
        }
        if labels.len() != values.len() {
            return Err(DeepVarError::shape_mismatch(
                format!("{} row labels", values.len()),
                format!("{} row labels", labels.len()),
            ));
        }
        if columns.len() != series {
            return Err(DeepVarError::shape_mismatch(
                format!("{series} column names"),
                format!("{} column names", columns.len()),
            ));
        }

        Ok(Self {
            labels,
            columns,
            values,
        })
    }

    /// Load a header-bearing CSV file.
    ///
    /// # Errors
    ///
    /// - [`DeepVarError::Csv`] / [`DeepVarError::Io`] when the file cannot be read
    /// - [`DeepVarError::InvalidInput`] when a series cell is not a number
    /// - [`DeepVarError::ShapeMismatch`] for fewer than 2 columns or no rows
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)?;

        let headers = reader.headers()?.clone();
        if headers.len() < 2 {
            return Err(DeepVarError::shape_mismatch(
                "at least 2 columns",
                format!("{} columns in {}", headers.len(), path.display()),
            ));
        }
        let columns: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();

        let mut labels = Vec::new();
        let mut values = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            labels.push(record.get(0).unwrap_or_default().to_string());
            let parsed = record
                .iter()
                .skip(1)
                .enumerate()
                .map(|(col, cell)| {
                    cell.trim().parse::<f64>().map_err(|_| {
                        DeepVarError::invalid_input(format!(
                            "{}: row {row}, column {}: '{cell}' is not a number",
                            path.display(),
                            col + 1
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            values.push(parsed);
        }

        let table = Self::with_columns(labels, columns, values)?;
        tracing::debug!(
            "Loaded {} rows x {} series from {}",
            table.rows(),
            table.series(),
            path.display()
        );
        Ok(table)
    }

    /// Number of rows `T`.
    pub fn rows(&self) -> usize {
        self.values.len()
    }

    /// Number of series `m`.
    pub fn series(&self) -> usize {
        self.columns.len()
    }

    /// Row labels (column 0 of the source table).
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Series names.
    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// Row-major values.
    pub fn values(&self) -> &[Vec<f64>] {
        &self.values
    }

    /// Values of series `j` over time, or `None` past the last series.
    pub fn column(&self, j: usize) -> Option<Vec<f64>> {
        if j >= self.series() {
            return None;
        }
        Some(self.values.iter().map(|row| row[j]).collect())
    }

    /// Values as a `(T, m)` `f32` tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<f32> = self
            .values
            .iter()
            .flat_map(|row| row.iter().map(|&v| v as f32))
            .collect();
        Ok(Tensor::from_vec(flat, (self.rows(), self.series()), device)?)
    }
}

/// Tensors ready for the recurrent model.
#[derive(Debug, Clone)]
pub struct PreparedData {
    /// Time functions, batch-major `(1, T, 3)`.
    pub t_functions: Tensor,
    /// Observations `(T, m)`.
    pub targets: Tensor,
}

impl PreparedData {
    /// Sequence length `T`.
    pub fn seq_len(&self) -> usize {
        self.targets.dims()[0]
    }

    /// Number of series `m`.
    pub fn series(&self) -> usize {
        self.targets.dims()[1]
    }
}

/// Build the time-basis input and the observation tensor for a table.
pub fn prepare(table: &SeriesTable, device: &Device) -> Result<PreparedData> {
    let basis = time_function_values(table.rows())?;
    Ok(PreparedData {
        t_functions: basis.to_tensor(device)?,
        targets: table.to_tensor(device)?,
    })
}

/// Reorder `(batch, T, F)` into sequence-major `(T, batch, F)`.
///
/// Only the batch axis moves; each `(T, feature)` pair keeps its value.
pub fn to_sequence_major(x: &Tensor) -> Result<Tensor> {
    swap_leading_axes(x, "(batch, seq, features)")
}

/// Reorder `(T, batch, F)` back into batch-major `(batch, T, F)`.
pub fn to_batch_major(x: &Tensor) -> Result<Tensor> {
    swap_leading_axes(x, "(seq, batch, features)")
}

fn swap_leading_axes(x: &Tensor, expected: &str) -> Result<Tensor> {
    if x.rank() != 3 {
        return Err(DeepVarError::shape_mismatch(
            format!("rank-3 tensor {expected}"),
            format!("{:?}", x.dims()),
        ));
    }
    Ok(x.transpose(0, 1)?.contiguous()?)
}

/// Flatten a `(T, batch=1, m)` tensor into `T` rows of `m` values.
pub fn sequence_rows(x: &Tensor) -> Result<Vec<Vec<f64>>> {
    let (seq, batch, width) = x.dims3()?;
    if batch != 1 {
        return Err(DeepVarError::shape_mismatch(
            "batch dimension of 1",
            format!("batch dimension of {batch}"),
        ));
    }
    let rows = x
        .reshape((seq, width))?
        .to_dtype(DType::F64)?
        .to_vec2::<f64>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample_table(rows: usize, series: usize) -> SeriesTable {
        let labels = (0..rows).map(|i| format!("t{i}")).collect();
        let values = (0..rows)
            .map(|i| (0..series).map(|j| (i * 10 + j) as f64).collect())
            .collect();
        SeriesTable::new(labels, values).unwrap()
    }

    #[test]
    fn test_prepare_shapes() {
        let table = sample_table(12, 3);
        let data = prepare(&table, &Device::Cpu).unwrap();
        assert_eq!(data.t_functions.dims(), &[1, 12, 3]);
        assert_eq!(data.targets.dims(), &[12, 3]);
        assert_eq!(data.seq_len(), 12);
        assert_eq!(data.series(), 3);
    }

    #[test]
    fn test_targets_preserve_values() {
        let table = sample_table(4, 2);
        let data = prepare(&table, &Device::Cpu).unwrap();
        let rows = data.targets.to_vec2::<f32>().unwrap();
        assert_eq!(rows[2], vec![20.0, 21.0]);
    }

    #[test]
    fn test_empty_and_narrow_tables_rejected() {
        let err = SeriesTable::new(vec![], vec![]).unwrap_err();
        assert!(matches!(err, DeepVarError::ShapeMismatch { .. }));

        let err = SeriesTable::new(vec!["a".into()], vec![vec![]]).unwrap_err();
        assert!(matches!(err, DeepVarError::ShapeMismatch { .. }));

        let err = SeriesTable::new(
            vec!["a".into(), "b".into()],
            vec![vec![1.0, 2.0], vec![3.0]],
        )
        .unwrap_err();
        assert!(matches!(err, DeepVarError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_sequence_major_round_trip() {
        let device = Device::Cpu;
        let data: Vec<f32> = (0..2 * 5 * 3).map(|v| v as f32).collect();
        let x = Tensor::from_vec(data, (2, 5, 3), &device).unwrap();

        let seq_major = to_sequence_major(&x).unwrap();
        assert_eq!(seq_major.dims(), &[5, 2, 3]);

        // (batch=1, t=4, f=2) lands at (t=4, batch=1, f=2)
        let original = x.to_vec3::<f32>().unwrap();
        let moved = seq_major.to_vec3::<f32>().unwrap();
        assert_eq!(original[1][4][2], moved[4][1][2]);

        let restored = to_batch_major(&seq_major).unwrap();
        assert_eq!(restored.to_vec3::<f32>().unwrap(), original);
    }

    #[test]
    fn test_reshape_rejects_wrong_rank() {
        let x = Tensor::zeros((4, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            to_sequence_major(&x),
            Err(DeepVarError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_from_csv() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "date,gdp,inflation").unwrap();
        writeln!(file, "1990Q1,1.5,2.0").unwrap();
        writeln!(file, "1990Q2,1.7,2.1").unwrap();
        writeln!(file, "1990Q3,1.6,2.3").unwrap();

        let table = SeriesTable::from_csv(file.path()).unwrap();
        assert_eq!(table.rows(), 3);
        assert_eq!(table.series(), 2);
        assert_eq!(table.labels()[1], "1990Q2");
        assert_eq!(table.column_names(), &["gdp".to_string(), "inflation".to_string()]);
        assert_eq!(table.column(1), Some(vec![2.0, 2.1, 2.3]));
        assert_eq!(table.column(2), None);
    }

    #[test]
    fn test_from_csv_rejects_label_only_table() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "date").unwrap();
        writeln!(file, "1990Q1").unwrap();

        let err = SeriesTable::from_csv(file.path()).unwrap_err();
        assert!(matches!(err, DeepVarError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_from_csv_rejects_non_numeric() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "date,x").unwrap();
        writeln!(file, "1990Q1,abc").unwrap();

        let err = SeriesTable::from_csv(file.path()).unwrap_err();
        assert!(matches!(err, DeepVarError::InvalidInput(_)));
    }

    #[test]
    fn test_sequence_rows() {
        let x = Tensor::from_vec(vec![1f32, 2., 3., 4., 5., 6.], (3, 1, 2), &Device::Cpu).unwrap();
        let rows = sequence_rows(&x).unwrap();
        assert_eq!(rows, vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]);
    }
}
