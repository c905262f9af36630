//! Two-sample tests and confidence intervals.
//!
//! Critical values and p-values come from `statrs` distributions. Every
//! function returns `None` on degenerate input (too few samples, zero
//! variance on both sides) rather than a misleading number.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};

/// Sample mean and unbiased variance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub n: usize,
    pub mean: f64,
    pub variance: f64,
}

impl Summary {
    pub fn of(values: &[f64]) -> Self {
        let n = values.len();
        if n == 0 {
            return Self {
                n,
                mean: 0.0,
                variance: 0.0,
            };
        }
        let mean = values.iter().sum::<f64>() / n as f64;
        let variance = if n > 1 {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0)
        } else {
            0.0
        };
        Self { n, mean, variance }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    pub fn std_error(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        (self.variance / self.n as f64).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
}

impl ConfidenceInterval {
    pub fn contains(&self, x: f64) -> bool {
        self.lower <= x && x <= self.upper
    }
}

/// Which two-sample test produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    WelchT,
    TwoProportionZ,
}

impl TestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::WelchT => "welch_t",
            TestKind::TwoProportionZ => "two_proportion_z",
        }
    }
}

/// Result of a two-sided test. The statistic is signed
/// treatment-minus-control.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub test: TestKind,
    pub statistic: f64,
    pub degrees_of_freedom: Option<f64>,
    pub p_value: f64,
}

impl TestOutcome {
    pub fn significant(&self, alpha: f64) -> bool {
        self.p_value < alpha
    }
}

/// Student-t interval for the mean at `level` (e.g. `0.95`).
pub fn mean_confidence_interval(values: &[f64], level: f64) -> Option<ConfidenceInterval> {
    let s = Summary::of(values);
    if s.n < 2 || !(0.0..1.0).contains(&level) {
        return None;
    }
    let t = StudentsT::new(0.0, 1.0, s.n as f64 - 1.0).ok()?;
    let crit = t.inverse_cdf(1.0 - (1.0 - level) / 2.0);
    let half = crit * s.std_error();
    Some(ConfidenceInterval {
        lower: s.mean - half,
        upper: s.mean + half,
        level,
    })
}

/// Wald interval for a proportion, clamped to `[0, 1]`.
pub fn proportion_confidence_interval(
    successes: usize,
    n: usize,
    level: f64,
) -> Option<ConfidenceInterval> {
    if n == 0 || successes > n || !(0.0..1.0).contains(&level) {
        return None;
    }
    let p = successes as f64 / n as f64;
    let z = Normal::new(0.0, 1.0).ok()?.inverse_cdf(1.0 - (1.0 - level) / 2.0);
    let half = z * (p * (1.0 - p) / n as f64).sqrt();
    Some(ConfidenceInterval {
        lower: (p - half).max(0.0),
        upper: (p + half).min(1.0),
        level,
    })
}

/// Welch's unequal-variance t-test.
pub fn welch_t_test(control: &[f64], treatment: &[f64]) -> Option<TestOutcome> {
    let c = Summary::of(control);
    let t = Summary::of(treatment);
    if c.n < 2 || t.n < 2 {
        return None;
    }
    let vc = c.variance / c.n as f64;
    let vt = t.variance / t.n as f64;
    let se2 = vc + vt;
    if se2 <= 0.0 || !se2.is_finite() {
        return None;
    }
    let statistic = (t.mean - c.mean) / se2.sqrt();
    let df = se2.powi(2)
        / (vc.powi(2) / (c.n as f64 - 1.0) + vt.powi(2) / (t.n as f64 - 1.0));
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    let p_value = (2.0 * dist.sf(statistic.abs())).min(1.0);
    Some(TestOutcome {
        test: TestKind::WelchT,
        statistic,
        degrees_of_freedom: Some(df),
        p_value,
    })
}

/// Pooled two-proportion z-test.
pub fn two_proportion_z_test(
    control_successes: usize,
    control_n: usize,
    treatment_successes: usize,
    treatment_n: usize,
) -> Option<TestOutcome> {
    if control_n == 0
        || treatment_n == 0
        || control_successes > control_n
        || treatment_successes > treatment_n
    {
        return None;
    }
    let (n1, n2) = (control_n as f64, treatment_n as f64);
    let p1 = control_successes as f64 / n1;
    let p2 = treatment_successes as f64 / n2;
    let pooled = (control_successes + treatment_successes) as f64 / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if se <= 0.0 || !se.is_finite() {
        return None;
    }
    let statistic = (p2 - p1) / se;
    let normal = Normal::new(0.0, 1.0).ok()?;
    let p_value = (2.0 * normal.sf(statistic.abs())).min(1.0);
    Some(TestOutcome {
        test: TestKind::TwoProportionZ,
        statistic,
        degrees_of_freedom: None,
        p_value,
    })
}
