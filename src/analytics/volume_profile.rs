//! Volume profile: equal-width price bins, POC and value area

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::scoring::{clamp_score, safe_div};
use crate::types::{PriceRange, Side, Trade};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeProfileConfig {
    /// Number of equal-width bins across the observed range (default: 50)
    pub bins: usize,
    /// Share of total volume the value area must hold (default: 0.70)
    pub value_area_pct: f64,
    /// Strength weight for POC concentration
    pub concentration_weight: f64,
    /// Strength weight for the share of empty bins
    pub sparsity_weight: f64,
}

impl Default for VolumeProfileConfig {
    fn default() -> Self {
        Self {
            bins: 50,
            value_area_pct: 0.70,
            concentration_weight: 0.6,
            sparsity_weight: 0.4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeBin {
    pub lower: f64,
    pub upper: f64,
    pub volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

impl VolumeBin {
    pub fn midpoint(&self) -> f64 {
        (self.lower + self.upper) / 2.0
    }

    pub fn range(&self) -> PriceRange {
        PriceRange::new(self.lower, self.upper)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeProfile {
    /// Bins in ascending price order
    pub bins: Vec<VolumeBin>,
    pub poc_index: Option<usize>,
    /// Midpoint of the POC bin
    pub poc_price: Option<f64>,
    /// VAL is the lower bound of the lowest bin, VAH the upper bound of the highest
    pub value_area: Option<PriceRange>,
    pub value_area_volume: f64,
    pub total_volume: f64,
    pub non_empty_bins: usize,
    pub strength: f64,
}

impl VolumeProfile {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.poc_index.is_none()
    }

    pub fn value_area_high(&self) -> Option<f64> {
        self.value_area.map(|va| va.upper())
    }

    pub fn value_area_low(&self) -> Option<f64> {
        self.value_area.map(|va| va.lower())
    }
}

/// Index of the first strictly-largest volume, so ties favor the lower price
pub fn point_of_control(volumes: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &v) in volumes.iter().enumerate() {
        match best {
            Some(b) if v <= volumes[b] => {}
            _ => best = Some(i),
        }
    }
    best
}

/// Smallest contiguous run of bins containing the POC whose volume reaches
/// `pct` of the total. Returns inclusive bin indices.
///
/// Among runs of equal length the one holding more volume wins, then the
/// lower one.
pub fn value_area_from_volumes(volumes: &[f64], pct: f64) -> Option<(usize, usize)> {
    let poc = point_of_control(volumes)?;
    let total: f64 = volumes.iter().sum();
    let target = total * pct.clamp(0.0, 1.0);

    let mut prefix = Vec::with_capacity(volumes.len() + 1);
    prefix.push(0.0);
    for v in volumes {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + v);
    }
    let run_sum = |lo: usize, hi: usize| prefix[hi + 1] - prefix[lo];

    for len in 1..=volumes.len() {
        let first_start = (poc + 1).saturating_sub(len);
        let last_start = poc.min(volumes.len() - len);
        let mut chosen: Option<(usize, usize, f64)> = None;

        for start in first_start..=last_start {
            let end = start + len - 1;
            let sum = run_sum(start, end);
            // Tolerate float summation noise on the boundary
            if sum + 1e-9 * total.max(1.0) < target {
                continue;
            }
            match chosen {
                Some((_, _, best)) if sum <= best => {}
                _ => chosen = Some((start, end, sum)),
            }
        }

        if let Some((start, end, _)) = chosen {
            return Some((start, end));
        }
    }

    Some((0, volumes.len() - 1))
}

#[derive(Debug, Clone, Default)]
pub struct VolumeProfileCalculator {
    config: VolumeProfileConfig,
}

impl VolumeProfileCalculator {
    pub fn new(config: VolumeProfileConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VolumeProfileConfig {
        &self.config
    }

    /// Bin the trades' volume across their price range
    ///
    /// Buy/sell split uses each trade's reported side.
    pub fn calculate(&self, trades: &[Trade]) -> VolumeProfile {
        let valid: Vec<&Trade> = trades.iter().filter(|t| t.is_valid()).collect();
        let bins = self.build_bins(
            valid
                .iter()
                .map(|t| (t.price, t.quantity, t.side)),
        );
        match bins {
            Some(bins) => self.profile_from_bins(bins),
            None => {
                debug!("Volume profile skipped: no traded volume");
                VolumeProfile::empty()
            }
        }
    }

    /// Equal-width bins over [min, max] of the given (price, quantity, side)
    /// points; `None` when there is no volume to bin
    pub fn build_bins(
        &self,
        points: impl Iterator<Item = (f64, f64, Side)> + Clone,
    ) -> Option<Vec<VolumeBin>> {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut total = 0.0;
        for (price, qty, _) in points.clone() {
            min = min.min(price);
            max = max.max(price);
            total += qty;
        }
        if !min.is_finite() || !max.is_finite() || total <= 0.0 {
            return None;
        }

        let count = if max > min { self.config.bins.max(1) } else { 1 };
        let width = (max - min) / count as f64;

        let mut bins: Vec<VolumeBin> = (0..count)
            .map(|i| VolumeBin {
                lower: min + width * i as f64,
                upper: if i + 1 == count { max } else { min + width * (i + 1) as f64 },
                volume: 0.0,
                buy_volume: 0.0,
                sell_volume: 0.0,
            })
            .collect();

        for (price, qty, side) in points {
            let idx = if width > 0.0 {
                (((price - min) / width) as usize).min(count - 1)
            } else {
                0
            };
            let bin = &mut bins[idx];
            bin.volume += qty;
            match side {
                Side::Buy => bin.buy_volume += qty,
                Side::Sell => bin.sell_volume += qty,
                Side::Unknown => {}
            }
        }

        Some(bins)
    }

    fn profile_from_bins(&self, bins: Vec<VolumeBin>) -> VolumeProfile {
        let volumes: Vec<f64> = bins.iter().map(|b| b.volume).collect();
        let total_volume: f64 = volumes.iter().sum();
        let (poc, (va_lo, va_hi)) = match (
            point_of_control(&volumes),
            value_area_from_volumes(&volumes, self.config.value_area_pct),
        ) {
            (Some(poc), Some(va)) => (poc, va),
            _ => return VolumeProfile::empty(),
        };

        let non_empty_bins = volumes.iter().filter(|v| **v > 0.0).count();
        let concentration = safe_div(volumes[poc], total_volume, 0.0);
        let sparsity = 1.0 - safe_div(non_empty_bins as f64, bins.len() as f64, 1.0);
        let strength = clamp_score(
            (self.config.concentration_weight * concentration + self.config.sparsity_weight * sparsity)
                * 100.0,
        );

        VolumeProfile {
            poc_index: Some(poc),
            poc_price: Some(bins[poc].midpoint()),
            value_area: Some(PriceRange::new(bins[va_lo].lower, bins[va_hi].upper)),
            value_area_volume: volumes[va_lo..=va_hi].iter().sum(),
            total_volume,
            non_empty_bins,
            strength,
            bins,
        }
    }
}
