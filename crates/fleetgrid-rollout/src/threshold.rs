//! Threshold evaluation for group success and error conditions.

use fleetgrid_core::PercentRounding;
use fleetgrid_state::Threshold;

/// Decides whether a count satisfies a percentage or absolute threshold.
///
/// Percentages are computed over the group's total target count, so targets
/// that have not reported yet count towards the denominator only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdEvaluator {
    rounding: PercentRounding,
}

impl ThresholdEvaluator {
    pub fn new(rounding: PercentRounding) -> Self {
        Self { rounding }
    }

    pub fn evaluate(&self, threshold: &Threshold, numerator: u64, total: u64) -> bool {
        match *threshold {
            Threshold::Count(n) => numerator >= n,
            Threshold::Percentage(p) => {
                if total == 0 {
                    return true;
                }
                let scaled = numerator.saturating_mul(100);
                let percent = match self.rounding {
                    PercentRounding::Truncate => scaled / total,
                    PercentRounding::RoundHalfUp => scaled.saturating_add(total / 2) / total,
                };
                percent >= u64::from(p)
            }
        }
    }
}

/// Whether a threshold value is meaningful.
pub fn validate_threshold(threshold: &Threshold) -> Result<(), String> {
    match threshold {
        Threshold::Percentage(p) if *p > 100 => Err(format!("percentage {p} is above 100")),
        _ => Ok(()),
    }
}
