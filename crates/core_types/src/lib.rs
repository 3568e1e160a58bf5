use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

/// One update from an external data provider. The core only reads `price`
/// (the underlying observable); the rest is carried for observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,
    #[serde(default)]
    pub volume: f64,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MarketFamily {
    Temperature,
    AssetPrice,
}

impl MarketFamily {
    /// Normalization scale for the strike-distance estimator: degrees move
    /// the contract at 10x the sensitivity of dollars.
    pub fn scale(&self) -> f64 {
        match self {
            Self::Temperature => 10.0,
            Self::AssetPrice => 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContractDirection {
    /// YES pays off if the observable ends at or above the strike.
    Above,
    /// YES pays off if the observable ends at or below the strike.
    Below,
}

/// Exposure bucket used by the risk gate's category caps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MarketCategory {
    Weather,
    Crypto,
    General,
}

impl fmt::Display for MarketCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Weather => "weather",
            Self::Crypto => "crypto",
            Self::General => "general",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SymbolError {
    #[error("empty symbol")]
    Empty,
    #[error("unparseable strike token `{0}`")]
    BadStrike(String),
}

/// A contract ticker parsed into its structured parts, validated once at
/// position open instead of re-parsed on every tick.
///
/// Ticker convention: `SERIES-DATE-STRIKE` where the trailing token carries
/// the strike digits, optionally led by a `B` marker selecting a "below"
/// contract (e.g. `KXHIGHNY-25AUG25-B75`, `KXBTCD-25AUG2517-T69750`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContractSymbol {
    pub raw: String,
    pub series: SmolStr,
    pub family: MarketFamily,
    pub direction: ContractDirection,
    pub strike: f64,
}

impl ContractSymbol {
    pub fn parse(raw: &str) -> Result<Self, SymbolError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SymbolError::Empty);
        }

        let token = trimmed.rsplit('-').next().unwrap_or(trimmed);
        let direction = if token.starts_with('B') {
            ContractDirection::Below
        } else {
            ContractDirection::Above
        };
        let digits: String = token
            .chars()
            .filter(|c| !c.is_ascii_alphabetic())
            .collect();
        let strike: f64 = digits
            .parse()
            .map_err(|_| SymbolError::BadStrike(token.to_string()))?;

        let upper = trimmed.to_ascii_uppercase();
        let family = if upper.contains("HIGH") || upper.contains("TEMP") {
            MarketFamily::Temperature
        } else {
            MarketFamily::AssetPrice
        };
        let series = trimmed.split('-').next().unwrap_or(trimmed);

        Ok(Self {
            raw: trimmed.to_string(),
            series: SmolStr::new(series.to_ascii_uppercase()),
            family,
            direction,
            strike,
        })
    }

    pub fn category(&self) -> MarketCategory {
        if self.family == MarketFamily::Temperature {
            return MarketCategory::Weather;
        }
        let upper = self.raw.to_ascii_uppercase();
        if upper.contains("BTC") || upper.contains("ETH") {
            MarketCategory::Crypto
        } else {
            MarketCategory::General
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        };
        f.write_str(value)
    }
}

/// Which instrument the position's prices are denominated in. A NO position
/// is priced at `1 - yes_price`; both representations are accepted because
/// strategies differ in which they produce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContractSide {
    #[default]
    Yes,
    No,
}

/// One-shot stop relocation: once the position's price crosses
/// `trigger_price` favorably, `stop_loss` is replaced by `new_stop_loss`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TrailingRule {
    pub trigger_price: f64,
    pub new_stop_loss: f64,
}

/// A partial-exit level: when price has moved `price_delta` from entry in
/// the favorable direction, close `close_fraction` of the remaining
/// quantity. Fires at most once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ProfitTarget {
    pub price_delta: f64,
    pub close_fraction: f64,
}

/// A strategy's request to open a position. The risk gate is the sole
/// authority on whether this becomes a `Position`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeIntent {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u32,
    pub limit_price: f64,
    pub confidence: f64,
    #[serde(default)]
    pub contract_side: ContractSide,
    #[serde(default)]
    pub stop_loss: f64,
    #[serde(default)]
    pub trailing_rule: Option<TrailingRule>,
    #[serde(default)]
    pub profit_targets: Vec<ProfitTarget>,
    #[serde(default)]
    pub expiration_time: Option<DateTime<Utc>>,
    pub strategy_name: SmolStr,
}

/// An open paper trade. Prices are in the position's own denomination
/// (YES or NO per `contract_side`) and always within [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub id: u64,
    pub contract: ContractSymbol,
    pub side: OrderSide,
    pub contract_side: ContractSide,
    pub entry_price: f64,
    pub current_price: f64,
    pub quantity: u32,
    pub original_quantity: u32,
    pub open_time: DateTime<Utc>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub stop_loss: f64,
    pub trailing_rule: Option<TrailingRule>,
    pub trailing_activated: bool,
    pub profit_targets: Vec<ProfitTarget>,
    pub last_observed_market_price: Option<f64>,
    pub last_observed_at: Option<DateTime<Utc>>,
    pub strategy_name: SmolStr,
    pub pnl: f64,
}

impl Position {
    /// Cash tied up in this position.
    pub fn cost(&self) -> f64 {
        self.entry_price * self.quantity as f64
    }

    /// Converts a YES-denominated estimate into this position's own
    /// denomination.
    pub fn own_price(&self, yes_price: f64) -> f64 {
        match self.contract_side {
            ContractSide::Yes => yes_price,
            ContractSide::No => 1.0 - yes_price,
        }
    }

    /// PnL of `quantity` contracts marked at `price`.
    pub fn pnl_at(&self, price: f64, quantity: u32) -> f64 {
        let per_contract = match self.side {
            OrderSide::Buy => price - self.entry_price,
            OrderSide::Sell => self.entry_price - price,
        };
        per_contract * quantity as f64
    }
}

/// Terminal cause of a close; `PartialExit` additionally labels the final
/// close of a position that was fully unwound through profit targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Expired,
    EarlySettlement,
    StopLoss,
    TakeProfit,
    TimeLimit,
    PartialExit,
}

impl CloseReason {
    /// Binary settlement resolves to exactly 0.00 or 1.00; everything else
    /// closes at a valuation estimate.
    pub fn is_binary_settlement(&self) -> bool {
        matches!(self, Self::Expired | Self::EarlySettlement)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Expired => "expired",
            Self::EarlySettlement => "early_settlement",
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::TimeLimit => "time_limit",
            Self::PartialExit => "partial_exit",
        };
        f.write_str(value)
    }
}

/// Append-only snapshot of a position at close time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClosedTrade {
    pub id: u64,
    pub contract: ContractSymbol,
    pub side: OrderSide,
    pub contract_side: ContractSide,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: u32,
    pub original_quantity: u32,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub reason: CloseReason,
    pub strategy_name: SmolStr,
    /// Realized PnL of the final closing chunk.
    pub pnl: f64,
}

/// Events returned by `PositionLedger::update`; the ledger holds no
/// observer reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LedgerEvent {
    PartialExit {
        position_id: u64,
        symbol: String,
        strategy_name: SmolStr,
        quantity_closed: u32,
        exit_price: f64,
        pnl: f64,
    },
    Closed(ClosedTrade),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct LedgerStats {
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub open_count: usize,
}

/// Fire-and-forget close notification, injected at construction.
pub trait CloseSink: Send + Sync {
    fn on_close(&self, trade: &ClosedTrade);
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Symbol(#[from] SymbolError),
    #[error("quantity must be positive")]
    ZeroQuantity,
    #[error("entry price {0} outside [0.00, 1.00]")]
    PriceOutOfRange(f64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_above_contract() {
        let c = ContractSymbol::parse("KXBTCD-25AUG2517-T69750").expect("parse");
        assert_eq!(c.direction, ContractDirection::Above);
        assert_eq!(c.family, MarketFamily::AssetPrice);
        assert!((c.strike - 69_750.0).abs() < 1e-9);
        assert_eq!(c.series.as_str(), "KXBTCD");
        assert_eq!(c.category(), MarketCategory::Crypto);
    }

    #[test]
    fn parses_below_marker() {
        let c = ContractSymbol::parse("KXHIGHNY-25AUG25-B75").expect("parse");
        assert_eq!(c.direction, ContractDirection::Below);
        assert_eq!(c.family, MarketFamily::Temperature);
        assert!((c.strike - 75.0).abs() < 1e-9);
        assert_eq!(c.category(), MarketCategory::Weather);
    }

    #[test]
    fn rejects_strikeless_symbol() {
        let err = ContractSymbol::parse("KXHIGHNY-25AUG25-NONE").unwrap_err();
        assert_eq!(err, SymbolError::BadStrike("NONE".to_string()));
        assert_eq!(ContractSymbol::parse("  ").unwrap_err(), SymbolError::Empty);
    }

    #[test]
    fn no_side_prices_mirror_yes() {
        let pos = Position {
            id: 1,
            contract: ContractSymbol::parse("KXBTCD-X-T69750").expect("parse"),
            side: OrderSide::Buy,
            contract_side: ContractSide::No,
            entry_price: 0.40,
            current_price: 0.40,
            quantity: 10,
            original_quantity: 10,
            open_time: Utc::now(),
            expiration_time: None,
            stop_loss: 0.0,
            trailing_rule: None,
            trailing_activated: false,
            profit_targets: Vec::new(),
            last_observed_market_price: None,
            last_observed_at: None,
            strategy_name: "test".into(),
            pnl: 0.0,
        };
        assert!((pos.own_price(0.75) - 0.25).abs() < 1e-9);
        assert!((pos.pnl_at(0.25, 10) - -1.5).abs() < 1e-9);
    }

    #[test]
    fn trade_intent_json_roundtrip() {
        let intent = TradeIntent {
            symbol: "KXHIGHNY-25AUG25-T75".to_string(),
            side: OrderSide::Buy,
            quantity: 5,
            limit_price: 0.50,
            confidence: 0.8,
            contract_side: ContractSide::Yes,
            stop_loss: 0.30,
            trailing_rule: Some(TrailingRule {
                trigger_price: 0.70,
                new_stop_loss: 0.60,
            }),
            profit_targets: vec![ProfitTarget {
                price_delta: 0.10,
                close_fraction: 0.5,
            }],
            expiration_time: None,
            strategy_name: "weather_arb".into(),
        };
        let raw = serde_json::to_string(&intent).expect("serialize");
        let parsed: TradeIntent = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(parsed, intent);
    }
}
