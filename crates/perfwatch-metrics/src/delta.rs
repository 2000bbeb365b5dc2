use crate::stats;
use perfwatch_core::metrics_api::{ChangeKind, Comparator, Comparison, ComparisonInput};
use serde::{Deserialize, Serialize};

/// Threshold comparator: a delta counts when it clears both a relative and an
/// absolute floor and exceeds the noise seen across repeated samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeltaComparator {
    /// Relative change below which values are unchanged (0.01 = 1%).
    pub min_pct_change: f64,
    pub min_abs_change: f64,
    /// Deltas within `mad_multiplier * MAD` of either side are noise.
    pub mad_multiplier: f64,
}

impl Default for DeltaComparator {
    fn default() -> Self {
        Self {
            min_pct_change: 0.01,
            min_abs_change: 0.01,
            mad_multiplier: 3.0,
        }
    }
}

impl DeltaComparator {
    /// Best value of a side: smallest when lower is better, else largest.
    fn aggregate(&self, values: &[f64], higher_is_better: bool) -> Option<f64> {
        if higher_is_better {
            stats::max(values)
        } else {
            stats::min(values)
        }
    }

    fn noise(&self, values: &[f64]) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }
        stats::mad(values).unwrap_or(0.0) * self.mad_multiplier
    }
}

impl Comparator for DeltaComparator {
    fn name(&self) -> &'static str {
        "delta"
    }

    fn compare(&self, input: &ComparisonInput<'_>) -> anyhow::Result<Comparison> {
        let hib = input.field.higher_is_better;
        let previous = self.aggregate(input.previous, hib);
        let current = self.aggregate(input.current, hib);
        let base = Comparison::unchanged(previous, current);

        match (input.previous_failed, input.current_failed) {
            (true, true) => return Ok(base.with_kind(ChangeKind::UnchangedFail)),
            (false, true) => return Ok(base.with_kind(ChangeKind::Regressed)),
            (true, false) => return Ok(base.with_kind(ChangeKind::Improved)),
            (false, false) => {}
        }

        let (Some(p), Some(c)) = (previous, current) else {
            return Ok(base);
        };
        if !p.is_finite() || !c.is_finite() {
            return Ok(base);
        }
        let delta = c - p;
        let pct = (p != 0.0).then(|| delta / p.abs());
        let mut out = Comparison { pct_delta: pct, ..base };

        if delta.abs() < self.min_abs_change {
            return Ok(out);
        }
        if pct.is_some_and(|pct| pct.abs() < self.min_pct_change) {
            return Ok(out);
        }
        let noise = self.noise(input.previous).max(self.noise(input.current));
        if delta.abs() <= noise {
            return Ok(out);
        }

        let got_better = if hib { delta > 0.0 } else { delta < 0.0 };
        out.kind = if got_better {
            ChangeKind::Improved
        } else {
            ChangeKind::Regressed
        };
        tracing::trace!(
            field = %input.field.name,
            previous = p,
            current = c,
            kind = ?out.kind,
            "delta cleared thresholds"
        );
        Ok(out)
    }
}
