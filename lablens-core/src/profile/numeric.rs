use serde::{Deserialize, Serialize};
use tdigest::TDigest;

/// mean / sample std / quartiles of one numeric series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericSummary {
    pub mean: f64,
    /// sample standard deviation; absent for a single value
    pub std: Option<f64>,
    pub min: f64,
    pub max: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub count: u64,
}

// values held back before they are folded into the digest
const FLUSH_AT: usize = 10_000;

/// Streaming accumulator. Quantiles are exact while everything fits in the
/// buffer and come from a t-digest once it has spilled.
pub struct NumericAccumulator {
    digest: Option<TDigest>,
    buf: Vec<f64>,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
    count: u64,
}

impl NumericAccumulator {
    pub fn new() -> Self {
        Self {
            digest: None,
            buf: Vec::new(),
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::MAX,
            max: f64::MIN,
            count: 0,
        }
    }

    pub fn add(&mut self, v: f64) {
        if !v.is_finite() {
            return;
        }
        self.buf.push(v);
        self.sum += v;
        self.sum_sq += v * v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.count += 1;
        if self.buf.len() >= FLUSH_AT {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let base = self.digest.take().unwrap_or_else(|| TDigest::new_with_size(100));
        self.digest = Some(base.merge_unsorted(std::mem::take(&mut self.buf)));
    }

    /// `None` when nothing was added.
    pub fn finish(mut self) -> Option<NumericSummary> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        let std = (self.count > 1).then(|| {
            let var = (self.sum_sq - n * mean * mean) / (n - 1.0);
            var.max(0.0).sqrt()
        });
        let (p25, p50, p75) = if self.digest.is_none() {
            self.buf.sort_by(|a, b| a.total_cmp(b));
            (exact_quantile(&self.buf, 0.25), exact_quantile(&self.buf, 0.50), exact_quantile(&self.buf, 0.75))
        } else {
            self.flush();
            match &self.digest {
                Some(d) => (d.estimate_quantile(0.25), d.estimate_quantile(0.50), d.estimate_quantile(0.75)),
                None => (mean, mean, mean),
            }
        };
        Some(NumericSummary { mean, std, min: self.min, max: self.max, p25, p50, p75, count: self.count })
    }
}

impl Default for NumericAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

// linear interpolation between closest ranks; `sorted` must be non-empty
fn exact_quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}
