use core_types::{ContractDirection, ContractSymbol};
use serde::{Deserialize, Serialize};

/// Tuning knobs for the strike-distance estimator. The defaults reproduce
/// the production heuristic exactly; they are not calibrated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValuationConfig {
    /// Half-width of the price band around 0.50 that tanh can reach.
    pub band: f64,
    /// Hard floor/ceiling for estimates; only real settlement may leave
    /// this range.
    pub floor: f64,
    pub ceiling: f64,
    /// Below this |tanh| magnitude the estimate is considered unreliable
    /// and a cached observed quote should be preferred.
    pub weak_signal_threshold: f64,
}

impl Default for ValuationConfig {
    fn default() -> Self {
        Self {
            band: 0.49,
            floor: 0.01,
            ceiling: 0.99,
            weak_signal_threshold: 0.10,
        }
    }
}

/// Output of one valuation: a YES price plus the raw signal magnitude the
/// weak-signal policy keys on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub yes_price: f64,
    /// `|tanh(diff / scale)|` in [0, 1). Near zero means the observable sits
    /// on the strike and the formula carries little information.
    pub signal: f64,
}

impl Estimate {
    pub fn is_weak(&self, cfg: &ValuationConfig) -> bool {
        self.signal < cfg.weak_signal_threshold
    }
}

/// Stateless closed-form fair-value model for binary strike contracts.
#[derive(Debug, Clone, Default)]
pub struct ValuationModel {
    cfg: ValuationConfig,
}

impl ValuationModel {
    pub fn new(cfg: ValuationConfig) -> Self {
        Self { cfg }
    }

    pub fn cfg(&self) -> &ValuationConfig {
        &self.cfg
    }

    /// Maps the signed strike distance through tanh onto a price around
    /// 0.50. Saturates smoothly: at the strike the price is 0.50, far from
    /// it the price approaches the floor/ceiling but never reaches the hard
    /// 0/1 boundary.
    pub fn estimate(&self, contract: &ContractSymbol, observable: f64) -> Estimate {
        let diff = match contract.direction {
            ContractDirection::Above => observable - contract.strike,
            ContractDirection::Below => contract.strike - observable,
        };
        let normalized = diff / contract.family.scale();
        let shift = normalized.tanh();
        let yes_price = (0.50 + shift * self.cfg.band).clamp(self.cfg.floor, self.cfg.ceiling);
        Estimate {
            yes_price,
            signal: shift.abs(),
        }
    }

    /// Binary settlement outcome at/after expiration. Ties resolve YES in
    /// both directions (observable exactly at the strike counts as hit).
    pub fn settlement_outcome(&self, contract: &ContractSymbol, observable: f64) -> bool {
        match contract.direction {
            ContractDirection::Above => observable >= contract.strike,
            ContractDirection::Below => observable <= contract.strike,
        }
    }
}
