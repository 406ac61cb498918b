//! Kelly criterion position sizing for binary (probability) markets

use crate::types::{ConsensusResult, Decision};
use serde::{Deserialize, Serialize};

/// Quarter Kelly
pub const DEFAULT_KELLY_FRACTION: f64 = 0.25;
/// At most 10% of capital on a single market
pub const DEFAULT_MAX_STAKE_PER_MARKET: f64 = 0.10;

/// Outcome of a Kelly sizing computation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KellySizing {
    /// Net odds `b` received on a win; `None` when the price leaves them undefined
    pub odds: Option<f64>,
    /// Full-Kelly fraction, may be negative (no edge)
    pub raw_kelly: f64,
    /// Fraction of capital to stake, in `[0, max_stake_per_market]`
    pub applied_stake: f64,
}

impl KellySizing {
    pub const NO_STAKE: KellySizing = KellySizing {
        odds: None,
        raw_kelly: 0.0,
        applied_stake: 0.0,
    };

    pub fn has_edge(&self) -> bool {
        self.applied_stake > 0.0
    }
}

/// `f* = (b·p − q) / b` with `b = (1 − price) / price`, scaled by
/// `kelly_fraction` and capped at `max_stake_per_market`.
///
/// Prices outside the open interval (0, 1) have no defined odds and size to
/// zero instead of failing.
pub fn kelly_stake(
    market_price: f64,
    win_probability: f64,
    kelly_fraction: f64,
    max_stake_per_market: f64,
) -> KellySizing {
    if !market_price.is_finite() || market_price <= 0.0 || market_price >= 1.0 {
        return KellySizing::NO_STAKE;
    }
    if !win_probability.is_finite() || !kelly_fraction.is_finite() || !max_stake_per_market.is_finite() {
        return KellySizing::NO_STAKE;
    }

    let p = win_probability.clamp(0.0, 1.0);
    let q = 1.0 - p;
    let odds = (1.0 - market_price) / market_price;
    let raw_kelly = (odds * p - q) / odds;

    let applied_stake = (raw_kelly.max(0.0) * kelly_fraction.max(0.0)).min(max_stake_per_market.max(0.0));

    KellySizing {
        odds: Some(odds),
        raw_kelly,
        applied_stake,
    }
}

impl ConsensusResult {
    /// Size a prediction-market position from this consensus.
    ///
    /// BUY backs YES at `yes_price`, SELL backs NO at `1 − yes_price`; the
    /// consensus confidence is the win probability. HOLD never stakes.
    pub fn kelly_stake(&self, yes_price: f64, kelly_fraction: f64, max_stake_per_market: f64) -> KellySizing {
        let price = match self.decision {
            Decision::Buy => yes_price,
            Decision::Sell => 1.0 - yes_price,
            Decision::Hold => return KellySizing::NO_STAKE,
        };
        kelly_stake(price, self.confidence, kelly_fraction, max_stake_per_market)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregators::aggregate;
    use crate::types::{RiskLevel, Signal};
    use std::collections::HashMap;

    #[test]
    fn test_worked_example() {
        let sizing = kelly_stake(0.45, 0.82, 0.25, 1.0);
        assert!((sizing.odds.unwrap() - 1.2222).abs() < 1e-3);
        assert!((sizing.raw_kelly - 0.672).abs() < 1e-3);
        assert!((sizing.applied_stake - 0.168).abs() < 1e-3);
        assert!(sizing.has_edge());
    }

    #[test]
    fn test_boundary_prices_size_to_zero() {
        for price in [0.0, 1.0, -0.3, 1.2, f64::NAN] {
            let sizing = kelly_stake(price, 0.9, 0.5, 1.0);
            assert_eq!(sizing, KellySizing::NO_STAKE);
        }
    }

    #[test]
    fn test_no_edge_means_no_stake() {
        let sizing = kelly_stake(0.7, 0.6, 1.0, 1.0);
        assert!(sizing.raw_kelly < 0.0);
        assert_eq!(sizing.applied_stake, 0.0);
        assert!(!sizing.has_edge());
    }

    #[test]
    fn test_stake_is_capped() {
        let sizing = kelly_stake(0.2, 0.95, 1.0, 0.1);
        assert_eq!(sizing.applied_stake, 0.1);
    }

    fn consensus(decision: Decision, confidence: f64) -> ConsensusResult {
        let signal = Signal {
            provider_id: "p".to_string(),
            decision,
            confidence,
            reasoning: String::new(),
            risk_level: RiskLevel::Medium,
            suggested_stop_loss: None,
            suggested_take_profit: None,
            latency_ms: None,
            cost_usd: None,
            tokens_used: None,
        };
        aggregate(&[signal], &HashMap::new(), 1).unwrap()
    }

    #[test]
    fn test_consensus_sizing_follows_decision() {
        let buy = consensus(Decision::Buy, 0.82).kelly_stake(0.45, 0.25, 1.0);
        assert!((buy.applied_stake - 0.168).abs() < 1e-3);

        // SELL backs NO at 0.55 with the same conviction
        let sell = consensus(Decision::Sell, 0.82).kelly_stake(0.55, 0.25, 1.0);
        assert!((sell.applied_stake - buy.applied_stake).abs() < 1e-9);

        let hold = consensus(Decision::Hold, 0.99).kelly_stake(0.45, 0.25, 1.0);
        assert_eq!(hold, KellySizing::NO_STAKE);
    }
}
