use crate::work_unit::WorkKey;
use bincode::{Decode, Encode};
use std::fmt;

/// Why a unit could not be fit. Failures are values, never errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum FailureReason {
    InsufficientData,
    NonConvergence,
    NumericalError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::InsufficientData => "insufficient_data",
            FailureReason::NonConvergence => "non_convergence",
            FailureReason::NumericalError => "numerical_error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One output row: the key plus the phase's value columns.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ResultRow {
    pub key: WorkKey,
    pub values: Vec<f64>,
}

impl ResultRow {
    pub fn new(key: WorkKey, values: Vec<f64>) -> Self {
        Self { key, values }
    }

    /// A row is valid when it has exactly the phase's columns and every value is finite.
    pub fn validate(&self) -> Result<(), FailureReason> {
        let expected = self.key.phase().value_columns().len();
        if self.values.len() != expected || self.values.iter().any(|v| !v.is_finite()) {
            return Err(FailureReason::NumericalError);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(ResultRow),
    Failure(FailureReason),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Turn a success with a malformed row (or a row for another key) into a failure.
    pub fn validated(self, key: &WorkKey) -> Outcome {
        match self {
            Outcome::Success(row) if row.key != *key => {
                Outcome::Failure(FailureReason::NumericalError)
            }
            Outcome::Success(row) => match row.validate() {
                Ok(()) => Outcome::Success(row),
                Err(reason) => Outcome::Failure(reason),
            },
            failure => failure,
        }
    }
}
