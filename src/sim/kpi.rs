//! Post-hoc KPI computation from closed-market summaries.

use std::fmt;

use serde::Serialize;

use crate::area::SlotSummary;
use crate::market::FLOATING_POINT_TOLERANCE;

/// Aggregate market indicators derived from a complete simulation run.
///
/// Computed post-hoc from the [`SlotSummary`] records every branch area
/// writes when a market closes, so the report agrees with the per-slot data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KpiReport {
    /// Number of closed markets summarised.
    pub markets: usize,
    pub trade_count: usize,
    /// Total traded energy across all markets (kWh).
    pub traded_energy_kwh: f64,
    /// Energy-weighted average trade rate.
    pub avg_price: Option<f64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    /// Grid fees retained across all markets.
    pub fees: f64,
    /// Offer energy left open when markets closed (kWh).
    pub unmatched_offer_energy_kwh: f64,
    /// Bid energy left open when markets closed (kWh).
    pub unmatched_bid_energy_kwh: f64,
    /// Largest energy any area bought from its parent in one slot (kWh).
    pub peak_import_kwh: f64,
    /// Largest energy any area sold to its parent in one slot (kWh).
    pub peak_export_kwh: f64,
    /// Slots in which an area exceeded its import or export capacity.
    pub capacity_violation_count: usize,
}

impl KpiReport {
    /// Computes all KPIs from slot summaries.
    ///
    /// # Arguments
    ///
    /// * `summaries` - Summaries of every closed market
    ///
    /// # Returns
    ///
    /// A `KpiReport` with all fields populated.
    pub fn from_summaries(summaries: &[SlotSummary]) -> Self {
        let mut report = Self {
            markets: summaries.len(),
            trade_count: 0,
            traded_energy_kwh: 0.0,
            avg_price: None,
            min_price: None,
            max_price: None,
            fees: 0.0,
            unmatched_offer_energy_kwh: 0.0,
            unmatched_bid_energy_kwh: 0.0,
            peak_import_kwh: 0.0,
            peak_export_kwh: 0.0,
            capacity_violation_count: 0,
        };
        let mut value = 0.0;

        for s in summaries {
            let m = &s.market;
            report.trade_count += m.trade_count;
            report.traded_energy_kwh += m.traded_energy;
            value += m.avg_price.unwrap_or(0.0) * m.traded_energy;
            report.min_price = min_opt(report.min_price, m.min_price);
            report.max_price = max_opt(report.max_price, m.max_price);
            report.fees += m.fees;
            report.unmatched_offer_energy_kwh += m.unmatched_offer_energy;
            report.unmatched_bid_energy_kwh += m.unmatched_bid_energy;
            report.peak_import_kwh = report.peak_import_kwh.max(s.import_kwh);
            report.peak_export_kwh = report.peak_export_kwh.max(s.export_kwh);
            if !s.within_capacity {
                report.capacity_violation_count += 1;
            }
        }

        if report.traded_energy_kwh > FLOATING_POINT_TOLERANCE {
            report.avg_price = Some(value / report.traded_energy_kwh);
        }
        report
    }
}

fn min_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    }
}

fn price(p: Option<f64>) -> String {
    p.map_or_else(|| "-".to_string(), |p| format!("{p:.2}"))
}

impl fmt::Display for KpiReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- KPI Report ---")?;
        writeln!(f, "Markets closed:        {}", self.markets)?;
        writeln!(f, "Trades:                {}", self.trade_count)?;
        writeln!(f, "Traded energy:         {:.3} kWh", self.traded_energy_kwh)?;
        writeln!(
            f,
            "Price avg/min/max:     {} / {} / {}",
            price(self.avg_price),
            price(self.min_price),
            price(self.max_price)
        )?;
        writeln!(f, "Grid fees:             {:.2}", self.fees)?;
        writeln!(
            f,
            "Unmatched energy:      {:.3} kWh offered, {:.3} kWh bid",
            self.unmatched_offer_energy_kwh, self.unmatched_bid_energy_kwh
        )?;
        writeln!(f, "Peak import:           {:.3} kWh", self.peak_import_kwh)?;
        writeln!(f, "Peak export:           {:.3} kWh", self.peak_export_kwh)?;
        write!(f, "Capacity violations:   {}", self.capacity_violation_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MarketSummary;

    fn make_summary(energy: f64, avg: Option<f64>, import_kwh: f64, within_capacity: bool) -> SlotSummary {
        SlotSummary {
            area: "House".into(),
            market: MarketSummary {
                time_slot: 0,
                trade_count: usize::from(energy > 0.0),
                traded_energy: energy,
                avg_price: avg,
                min_price: avg,
                max_price: avg,
                unmatched_offer_energy: 1.0,
                unmatched_bid_energy: 0.5,
                fees: 0.1,
            },
            import_kwh,
            export_kwh: 0.0,
            within_capacity,
            peak_import_above_baseline_kwh: None,
            peak_export_above_baseline_kwh: None,
        }
    }

    #[test]
    fn energy_weighted_average_price() {
        // 1 kWh at 10 and 3 kWh at 20: (10 + 60) / 4 = 17.5
        let summaries = vec![
            make_summary(1.0, Some(10.0), 0.0, true),
            make_summary(3.0, Some(20.0), 0.0, true),
        ];
        let kpi = KpiReport::from_summaries(&summaries);
        assert_eq!(kpi.trade_count, 2);
        assert!((kpi.avg_price.unwrap() - 17.5).abs() < 1e-9);
        assert_eq!(kpi.min_price, Some(10.0));
        assert_eq!(kpi.max_price, Some(20.0));
        assert!((kpi.unmatched_offer_energy_kwh - 2.0).abs() < 1e-9);
    }

    #[test]
    fn capacity_violations_and_peaks() {
        let summaries = vec![
            make_summary(0.0, None, 2.0, true),
            make_summary(0.0, None, 5.0, false),
            make_summary(0.0, None, 3.0, false),
        ];
        let kpi = KpiReport::from_summaries(&summaries);
        assert_eq!(kpi.capacity_violation_count, 2);
        assert_eq!(kpi.peak_import_kwh, 5.0);
        assert_eq!(kpi.avg_price, None);
    }

    #[test]
    fn empty_summaries() {
        let kpi = KpiReport::from_summaries(&[]);
        assert_eq!(kpi.markets, 0);
        assert_eq!(kpi.traded_energy_kwh, 0.0);
        assert!(kpi.to_string().starts_with("--- KPI Report ---"));
    }
}
