//! # Data Access
//!
//! A thin wrapper around a `polars` `DataFrame`. Estimation code never touches
//! polars directly; it asks a [`Dataset`] for numeric or categorical columns
//! and receives plain vectors with missing values encoded as `None`.
//!
//! - Numeric columns are anything castable to `Float64`. Nulls, NaN and
//!   infinities count as missing, so they are dropped from the estimation
//!   sample rather than poisoning it.
//! - Categorical columns (fixed effects, clusters) may have any dtype that
//!   casts to `String`; their values are only compared for equality.

use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// A comprehensive error type for dataset access failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("The column '{0}' was not found in the data. Please check spelling and case.")]
    MissingColumn(String),

    #[error(
        "The column '{column}' could not be converted to the expected type '{expected}'. (Found type: {found})"
    )]
    TypeMismatch {
        column: String,
        expected: &'static str,
        found: String,
    },

    #[error("Missing values were found in the column '{0}', which must be complete here.")]
    MissingValues(String),
}

/// Named, column-oriented observations.
#[derive(Debug, Clone)]
pub struct Dataset {
    frame: DataFrame,
}

impl From<DataFrame> for Dataset {
    fn from(frame: DataFrame) -> Self {
        Self::new(frame)
    }
}

impl Dataset {
    pub fn new(frame: DataFrame) -> Self {
        Self { frame }
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn nrows(&self) -> usize {
        self.frame.height()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.frame.get_column_index(name).is_some()
    }

    /// Fails with [`DataError::MissingColumn`] on the first name not present.
    pub fn require_columns<'a, I>(&self, names: I) -> Result<(), DataError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in names {
            if !self.has_column(name) {
                return Err(DataError::MissingColumn(name.to_string()));
            }
        }
        Ok(())
    }

    fn column(&self, name: &str) -> Result<&Column, DataError> {
        self.frame
            .column(name)
            .map_err(|_| DataError::MissingColumn(name.to_string()))
    }

    /// Reads a column as floating point. Non-finite values become `None`.
    pub fn numeric_column(&self, name: &str) -> Result<Vec<Option<f64>>, DataError> {
        let column = self.column(name)?;
        let mismatch = || DataError::TypeMismatch {
            column: name.to_string(),
            expected: "f64 (numeric)",
            found: format!("{:?}", column.dtype()),
        };

        let casted = column.cast(&DataType::Float64).map_err(|_| mismatch())?;
        // A lossy cast (e.g. text that is not a number) shows up as extra nulls.
        if casted.null_count() > column.null_count() {
            return Err(mismatch());
        }

        let values = casted
            .f64()?
            .into_iter()
            .map(|value| value.filter(|v| v.is_finite()))
            .collect();
        Ok(values)
    }

    /// Reads a column as group labels.
    pub fn categorical_column(&self, name: &str) -> Result<Vec<Option<String>>, DataError> {
        let column = self.column(name)?;
        let casted = column
            .cast(&DataType::String)
            .map_err(|_| DataError::TypeMismatch {
                column: name.to_string(),
                expected: "string-like categorical",
                found: format!("{:?}", column.dtype()),
            })?;

        let values = casted
            .str()?
            .into_iter()
            .map(|value| value.map(str::to_string))
            .collect();
        Ok(values)
    }

    /// Group labels for the given rows, failing on any missing label.
    pub fn categorical_rows(&self, name: &str, rows: &[usize]) -> Result<Vec<String>, DataError> {
        let labels = self.categorical_column(name)?;
        rows.iter()
            .map(|&row| {
                labels[row]
                    .clone()
                    .ok_or_else(|| DataError::MissingValues(name.to_string()))
            })
            .collect()
    }
}

/// Loads a delimited text file with a header row. Files ending in `.csv` are
/// comma separated, everything else is read as tab separated.
pub fn load_dataset(path: &Path) -> Result<Dataset, DataError> {
    let separator = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
        _ => b'\t',
    };

    log::info!("Loading data from '{}'", path.display());
    let frame = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(separator)),
        )
        .finish()?;
    log::info!(
        "Loaded {} rows and {} columns.",
        frame.height(),
        frame.width()
    );

    Ok(Dataset::new(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample() -> Dataset {
        let frame = df! {
            "y" => [Some(1.0), None, Some(f64::NAN), Some(4.0)],
            "label" => ["a", "b", "a", "c"],
            "id" => [10i64, 20, 10, 30],
        }
        .unwrap();
        Dataset::new(frame)
    }

    #[test]
    fn numeric_column_marks_nulls_and_nan_missing() {
        let data = sample();
        let y = data.numeric_column("y").unwrap();
        assert_eq!(y, vec![Some(1.0), None, None, Some(4.0)]);
    }

    #[test]
    fn integer_columns_cast_to_numeric_and_categorical() {
        let data = sample();
        assert_eq!(
            data.numeric_column("id").unwrap(),
            vec![Some(10.0), Some(20.0), Some(10.0), Some(30.0)]
        );
        let labels = data.categorical_column("id").unwrap();
        assert_eq!(labels[0], labels[2]);
        assert_ne!(labels[0], labels[1]);
    }

    #[test]
    fn text_column_is_a_type_mismatch_for_numeric_access() {
        let data = sample();
        match data.numeric_column("label") {
            Err(DataError::TypeMismatch { column, .. }) => assert_eq!(column, "label"),
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn unknown_column_is_reported_by_name() {
        let data = sample();
        match data.require_columns(["y", "nope"]) {
            Err(DataError::MissingColumn(name)) => assert_eq!(name, "nope"),
            other => panic!("expected MissingColumn, got {other:?}"),
        }
    }

    #[test]
    fn loads_tab_separated_files() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "y\tx\tg").unwrap();
        writeln!(file, "1.5\t2\ta").unwrap();
        writeln!(file, "2.5\t3\tb").unwrap();
        file.flush().unwrap();

        let data = load_dataset(file.path()).unwrap();
        assert_eq!(data.nrows(), 2);
        assert_eq!(
            data.numeric_column("x").unwrap(),
            vec![Some(2.0), Some(3.0)]
        );
        assert_eq!(
            data.categorical_rows("g", &[1]).unwrap(),
            vec!["b".to_string()]
        );
    }
}
