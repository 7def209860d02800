//! P² Approximate Percentile
//!
//! Online quantile estimator with five markers, O(1) per update. Markers move
//! by the parabolic prediction and fall back to linear interpolation when the
//! parabolic step would leave the neighbor interval. Below five samples the
//! estimate interpolates the sorted sample set exactly.

const MARKERS: usize = 5;

#[derive(Debug, Clone)]
pub struct P2Quantile {
    markers: [f64; MARKERS],
    positions: [f64; MARKERS],
    desired: [f64; MARKERS],
    increments: [f64; MARKERS],
    count: usize,
    percentile: f64,
}

impl P2Quantile {
    /// `percentile` in (0, 100).
    pub fn new(percentile: f64) -> Self {
        let p = percentile / 100.0;
        Self {
            markers: [0.0; MARKERS],
            positions: [0.0, 1.0, 2.0, 3.0, 4.0],
            desired: [0.0, p / 2.0, p, (1.0 + p) / 2.0, 1.0],
            increments: [0.0, p / 2.0, p, (1.0 + p) / 2.0, 1.0],
            count: 0,
            percentile,
        }
    }

    /// O(1) update with a new observation.
    pub fn update(&mut self, value: f64) {
        if self.count < MARKERS {
            // Bootstrap: collect the first five samples, then sort them.
            self.markers[self.count] = value;
            self.count += 1;
            if self.count == MARKERS {
                self.markers
                    .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            }
            return;
        }

        // Find the marker cell containing the observation.
        let k = if value < self.markers[0] {
            self.markers[0] = value;
            0
        } else if value >= self.markers[MARKERS - 1] {
            self.markers[MARKERS - 1] = value;
            MARKERS - 2
        } else {
            let mut cell = MARKERS - 2;
            for i in 1..MARKERS {
                if value < self.markers[i] {
                    cell = i - 1;
                    break;
                }
            }
            cell
        };

        for pos in self.positions.iter_mut().skip(k + 1) {
            *pos += 1.0;
        }
        for (des, inc) in self.desired.iter_mut().zip(self.increments.iter()) {
            *des += inc;
        }

        // Adjust the middle markers toward their desired positions.
        for i in 1..MARKERS - 1 {
            let d = self.desired[i] - self.positions[i];
            if (d >= 1.0 && self.positions[i + 1] - self.positions[i] > 1.0)
                || (d <= -1.0 && self.positions[i - 1] - self.positions[i] < -1.0)
            {
                let sign: f64 = if d >= 0.0 { 1.0 } else { -1.0 };
                let candidate = self.parabolic(i, sign);
                if self.markers[i - 1] < candidate && candidate < self.markers[i + 1] {
                    self.markers[i] = candidate;
                } else {
                    self.markers[i] = self.linear(i, sign);
                }
                self.positions[i] += sign;
            }
        }

        self.count += 1;
    }

    /// O(1) percentile estimate. Exact below five samples.
    pub fn estimate(&self) -> f64 {
        if self.count < MARKERS {
            if self.count == 0 {
                return 0.0;
            }
            let mut sorted = self.markers[..self.count].to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            let index = (self.percentile / 100.0) * (self.count - 1) as f64;
            let lower = index as usize;
            if lower >= self.count - 1 {
                return *sorted.last().expect("non-empty");
            }
            let weight = index - lower as f64;
            return sorted[lower] * (1.0 - weight) + sorted[lower + 1] * weight;
        }

        // The middle marker tracks the target percentile.
        self.markers[2]
    }

    #[inline]
    pub fn sample_count(&self) -> usize {
        self.count
    }

    fn parabolic(&self, i: usize, d: f64) -> f64 {
        let q_prev = self.markers[i - 1];
        let q = self.markers[i];
        let q_next = self.markers[i + 1];
        let n_prev = self.positions[i - 1];
        let n = self.positions[i];
        let n_next = self.positions[i + 1];

        q + d * ((n - n_prev + d) * (q_next - q) / (n_next - n)
            + (n_next - n - d) * (q - q_prev) / (n - n_prev))
            / (n_next - n_prev)
    }

    fn linear(&self, i: usize, d: f64) -> f64 {
        if d > 0.0 {
            self.markers[i]
                + (self.markers[i + 1] - self.markers[i]) / (self.positions[i + 1] - self.positions[i])
        } else {
            self.markers[i]
                - (self.markers[i - 1] - self.markers[i]) / (self.positions[i] - self.positions[i - 1])
        }
    }
}
