use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::PERIOD_INVALID_MONTH;
use crate::AppError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeriodError {
    #[error("month {0} is outside 1..=12")]
    InvalidMonth(u32),
}

impl From<PeriodError> for AppError {
    fn from(error: PeriodError) -> Self {
        AppError::new(PERIOD_INVALID_MONTH, error.to_string())
    }
}

/// A (month, year) pair, the scoping unit for both rosters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    pub month: u32,
    pub year: i32,
}

impl Period {
    pub fn new(month: u32, year: i32) -> Result<Self, PeriodError> {
        if (1..=12).contains(&month) {
            Ok(Period { month, year })
        } else {
            Err(PeriodError::InvalidMonth(month))
        }
    }

    /// The period immediately before this one; January wraps to December of
    /// the prior year.
    pub fn previous(self) -> Period {
        if self.month == 1 {
            Period {
                month: 12,
                year: self.year - 1,
            }
        } else {
            Period {
                month: self.month - 1,
                year: self.year,
            }
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}/{}", self.month, self.year)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_months() {
        assert!(Period::new(0, 2025).is_err());
        assert!(Period::new(13, 2025).is_err());
        assert!(Period::new(1, 2025).is_ok());
        assert!(Period::new(12, 2025).is_ok());
    }

    #[test]
    fn previous_steps_back_one_month() {
        let july = Period::new(7, 2025).unwrap();
        assert_eq!(july.previous(), Period::new(6, 2025).unwrap());
    }

    #[test]
    fn previous_wraps_january_to_prior_december() {
        let january = Period::new(1, 2025).unwrap();
        assert_eq!(january.previous(), Period::new(12, 2024).unwrap());
    }

    #[test]
    fn displays_zero_padded() {
        let p = Period::new(3, 2026).unwrap();
        assert_eq!(p.to_string(), "03/2026");
    }

    #[test]
    fn invalid_month_maps_to_period_code() {
        let err = AppError::from(Period::new(0, 2025).unwrap_err());
        assert_eq!(err.code(), PERIOD_INVALID_MONTH);
    }
}
