use crate::model::{Decision, TargetVerdict, VerdictSource};
use crate::targets::TargetId;
use serde::Serialize;
use std::collections::BTreeMap;

/// Decision tallies for a set of verdicts.
///
/// `other` counts error verdicts; their recorded decision is not meaningful.
/// `general` counts template verdicts and is a subset of the decision counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Counts {
    pub total: usize,
    pub sufficient: usize,
    pub insufficient: usize,
    pub other: usize,
    pub general: usize,
    pub sufficient_pct: f64,
    pub insufficient_pct: f64,
    pub other_pct: f64,
}

fn pct(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 * 10_000.0 / total as f64).round() / 100.0
}

impl Counts {
    fn add(&mut self, v: &TargetVerdict) {
        self.total += 1;
        match (v.source, v.decision) {
            (VerdictSource::Error, _) => self.other += 1,
            (_, Decision::Sufficient) => self.sufficient += 1,
            (_, Decision::Insufficient) => self.insufficient += 1,
        }
        if v.source == VerdictSource::General {
            self.general += 1;
        }
    }

    fn finish(&mut self) {
        self.sufficient_pct = pct(self.sufficient, self.total);
        self.insufficient_pct = pct(self.insufficient, self.total);
        self.other_pct = pct(self.other, self.total);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub overall: Counts,
    pub by_target: BTreeMap<TargetId, Counts>,
}

impl RunSummary {
    pub fn from_verdicts(verdicts: &BTreeMap<TargetId, Vec<TargetVerdict>>) -> Self {
        Self::combine(std::iter::once(verdicts))
    }

    /// Tallies the verdicts of several documents as one run.
    pub fn combine<'a>(
        runs: impl IntoIterator<Item = &'a BTreeMap<TargetId, Vec<TargetVerdict>>>,
    ) -> Self {
        let mut s = RunSummary::default();
        for verdicts in runs {
            for (id, list) in verdicts {
                let c = s.by_target.entry(id.clone()).or_default();
                for v in list {
                    c.add(v);
                    s.overall.add(v);
                }
            }
        }
        for c in s.by_target.values_mut() {
            c.finish();
        }
        s.overall.finish();
        s
    }
}
