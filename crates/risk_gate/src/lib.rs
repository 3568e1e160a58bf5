use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use core_types::{
    CloseSink, ClosedTrade, ContractSymbol, LedgerError, LedgerEvent, MarketCategory, Position,
    Tick, TradeIntent,
};
use fair_value::ValuationModel;
use position_ledger::{LedgerConfig, PositionLedger};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Capital-preservation rules. Every limit is a fraction of the current
/// balance unless stated otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskConfig {
    /// Per-trade ceiling as a fraction of balance.
    pub max_risk_per_trade_pct: f64,
    /// Rounding slack on the per-trade ceiling, in dollars.
    pub size_rounding_allowance: f64,
    /// Daily kill switch: no new orders once realized PnL falls below
    /// -(daily starting balance * this).
    pub max_daily_drawdown_pct: f64,
    /// Portfolio-wide cap on cash tied up in open positions.
    pub max_portfolio_exposure_pct: f64,
    /// Weather-class instruments are low-velocity; capped tighter.
    pub weather_exposure_pct: f64,
    /// A strategy whose cumulative PnL falls below -this (dollars) is cut
    /// off, independent of the global kill switch.
    pub strategy_drawdown_limit: f64,
    /// No entries this close to contract expiration.
    pub expiry_freeze_sec: i64,
    pub min_trade_interval_sec: i64,
    /// Re-entry lockout on a symbol series after a losing close there.
    pub loss_cooldown_sec: i64,
    /// Fractional Kelly multiplier. Upstream history carries both 0.25 and
    /// 0.75; 0.25 is the canonical default here.
    pub kelly_fraction: f64,
    /// Hard ceiling on a single order regardless of the sizing formula.
    pub max_contracts_per_trade: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_risk_per_trade_pct: 0.05,
            size_rounding_allowance: 1.0,
            max_daily_drawdown_pct: 0.10,
            max_portfolio_exposure_pct: 0.50,
            weather_exposure_pct: 0.30,
            strategy_drawdown_limit: 20.0,
            expiry_freeze_sec: 60,
            min_trade_interval_sec: 5,
            loss_cooldown_sec: 300,
            kelly_fraction: 0.25,
            max_contracts_per_trade: 500,
        }
    }
}

/// Admission verdict; never an error. Rejections carry a stable reason tag
/// that also keys the harvest counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskDecision {
    pub allow: bool,
    pub reason: String,
}

impl RiskDecision {
    fn allow() -> Self {
        Self {
            allow: true,
            reason: "ok".to_string(),
        }
    }

    fn reject(reason: &'static str) -> Self {
        Self {
            allow: false,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct RiskStats {
    pub balance: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub exposure: f64,
    pub open_count: usize,
}

/// Wraps the position ledger as the single authority on opening positions.
/// Computes exposure, applies the admission rules, sizes orders, reconciles
/// the balance, and fans closed trades out to the injected sink.
pub struct RiskGate {
    cfg: RiskConfig,
    ledger: PositionLedger,
    balance: f64,
    starting_balance_period: f64,
    realized_pnl: f64,
    unrealized_pnl: f64,
    last_trade_time: Option<DateTime<Utc>>,
    current_day: Option<NaiveDate>,
    cooldown_until: HashMap<SmolStr, DateTime<Utc>>,
    strategy_pnl: HashMap<SmolStr, f64>,
    rejections: HashMap<String, u64>,
    sink: Option<Box<dyn CloseSink>>,
}

impl RiskGate {
    pub fn new(
        cfg: RiskConfig,
        ledger_cfg: LedgerConfig,
        starting_balance: f64,
        sink: Option<Box<dyn CloseSink>>,
    ) -> Self {
        Self {
            cfg,
            ledger: PositionLedger::new(ledger_cfg, ValuationModel::default()),
            balance: starting_balance,
            starting_balance_period: starting_balance,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            last_trade_time: None,
            current_day: None,
            cooldown_until: HashMap::new(),
            strategy_pnl: HashMap::new(),
            rejections: HashMap::new(),
            sink,
        }
    }

    pub fn cfg(&self) -> &RiskConfig {
        &self.cfg
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    /// Runs the admission rules in priority order. Rejections are counted
    /// per reason so a harvest-only caller can keep recording rejected
    /// signals for offline analysis without touching the books.
    pub fn check_order(
        &mut self,
        cost: f64,
        symbol: &str,
        category: MarketCategory,
        strategy: &str,
        expiration: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> RiskDecision {
        self.roll_day_if_needed(now);

        if cost > self.balance {
            return self.rejected("insufficient_funds", symbol, cost);
        }

        let max_trade = self.balance * self.cfg.max_risk_per_trade_pct;
        if cost > max_trade + self.cfg.size_rounding_allowance {
            return self.rejected("order_too_large", symbol, cost);
        }

        let drawdown_floor = -(self.starting_balance_period * self.cfg.max_daily_drawdown_pct);
        if self.realized_pnl < drawdown_floor {
            return self.rejected("daily_drawdown", symbol, cost);
        }

        let exposure = self.ledger.exposure(None);
        if exposure + cost > self.balance * self.cfg.max_portfolio_exposure_pct {
            return self.rejected("portfolio_exposure", symbol, cost);
        }

        if category == MarketCategory::Weather {
            let weather = self.ledger.exposure(Some(MarketCategory::Weather));
            if weather + cost > self.balance * self.cfg.weather_exposure_pct {
                return self.rejected("category_exposure", symbol, cost);
            }
        }

        let strategy_pnl = self.strategy_pnl.get(strategy).copied().unwrap_or(0.0);
        if strategy_pnl < -self.cfg.strategy_drawdown_limit {
            return self.rejected("strategy_drawdown", symbol, cost);
        }

        if let Some(exp) = expiration {
            if (exp - now).num_seconds() < self.cfg.expiry_freeze_sec {
                return self.rejected("expiry_freeze", symbol, cost);
            }
        }

        if let Some(last) = self.last_trade_time {
            if (now - last).num_seconds() < self.cfg.min_trade_interval_sec {
                return self.rejected("rate_limit", symbol, cost);
            }
        }

        let series = series_prefix(symbol);
        if let Some(until) = self.cooldown_until.get(&series) {
            if now < *until {
                return self.rejected("loss_cooldown", symbol, cost);
            }
        }

        RiskDecision::allow()
    }

    fn rejected(&mut self, reason: &'static str, symbol: &str, cost: f64) -> RiskDecision {
        *self.rejections.entry(reason.to_string()).or_insert(0) += 1;
        tracing::warn!(reason, symbol, cost, balance = self.balance, "order rejected");
        RiskDecision::reject(reason)
    }

    /// Fractional Kelly sizing: stake proportional to edge, inverse to
    /// payoff odds, dampened and hard-capped.
    pub fn calculate_kelly_size(&self, confidence: f64, price: f64) -> u32 {
        if price <= 0.0 || price >= 1.0 || !price.is_finite() {
            return 0;
        }
        let b = (1.0 - price) / price;
        let p = confidence;
        let q = 1.0 - p;
        let fractional = (p - q / b) * self.cfg.kelly_fraction;
        if fractional <= 0.0 {
            return 0;
        }
        let capped = fractional.min(self.cfg.max_risk_per_trade_pct);
        let allocation = self.balance * capped;
        let quantity = (allocation / price).floor() as u32;
        quantity.clamp(1, self.cfg.max_contracts_per_trade)
    }

    /// Opens the position on the ledger. Call only after `check_order`
    /// passed; this method re-validates nothing but the intent itself.
    pub fn record_execution(
        &mut self,
        intent: &TradeIntent,
        now: DateTime<Utc>,
    ) -> Result<u64, LedgerError> {
        let id = self.ledger.open(intent, now)?;
        self.last_trade_time = Some(now);
        self.sync_balance();
        tracing::info!(
            id,
            symbol = %intent.symbol,
            balance = self.balance,
            "trade recorded"
        );
        Ok(id)
    }

    /// Convenience path: admit then execute. Returns `Ok(None)` on a risk
    /// rejection (already counted), `Err` only on a malformed intent.
    pub fn submit(
        &mut self,
        intent: &TradeIntent,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, LedgerError> {
        let contract = ContractSymbol::parse(&intent.symbol)?;
        let cost = intent.limit_price * intent.quantity as f64;
        let decision = self.check_order(
            cost,
            &intent.symbol,
            contract.category(),
            intent.strategy_name.as_str(),
            intent.expiration_time,
            now,
        );
        if !decision.allow {
            return Ok(None);
        }
        self.record_execution(intent, now).map(Some)
    }

    /// Feeds one underlying tick through the ledger, then applies the
    /// resulting events: PnL accounting, loss cooldowns, per-strategy
    /// totals, and close notifications.
    pub fn update_market(
        &mut self,
        fragment: &str,
        observable: f64,
        now: DateTime<Utc>,
    ) -> Vec<LedgerEvent> {
        let events = self.ledger.update(fragment, observable, now);
        for event in &events {
            match event {
                LedgerEvent::PartialExit {
                    strategy_name, pnl, ..
                } => {
                    *self.strategy_pnl.entry(strategy_name.clone()).or_insert(0.0) += pnl;
                }
                LedgerEvent::Closed(trade) => self.apply_close(trade, now),
            }
        }
        let stats = self.ledger.stats();
        self.realized_pnl = stats.realized_pnl;
        self.unrealized_pnl = stats.unrealized_pnl;
        self.sync_balance();
        events
    }

    fn apply_close(&mut self, trade: &ClosedTrade, now: DateTime<Utc>) {
        *self
            .strategy_pnl
            .entry(trade.strategy_name.clone())
            .or_insert(0.0) += trade.pnl;
        if trade.pnl < 0.0 {
            let until = now + chrono::Duration::seconds(self.cfg.loss_cooldown_sec);
            self.cooldown_until.insert(trade.contract.series.clone(), until);
            tracing::info!(
                series = %trade.contract.series,
                until = %until,
                "loss cooldown set"
            );
        }
        if let Some(sink) = &self.sink {
            sink.on_close(trade);
        }
    }

    /// Provider-tick entry point. Only the symbol (as the matching
    /// fragment) and the price (as the observable) matter here; the rest of
    /// the record is carried for observers.
    pub fn on_tick(&mut self, tick: &Tick) -> Vec<LedgerEvent> {
        self.update_market(&tick.symbol, tick.price, tick.ts)
    }

    /// Caches an observed contract quote on the ledger.
    pub fn record_observed_price(&mut self, symbol: &str, price: f64, now: DateTime<Utc>) {
        self.ledger.record_observed_price(symbol, price, now);
    }

    /// Syncs to an externally reported balance. The external figure already
    /// embeds all historical PnL, so the internal realized counter must be
    /// zeroed or every past win would be counted twice.
    pub fn update_balance(&mut self, external_balance: f64) {
        tracing::info!(external_balance, "balance sync");
        self.starting_balance_period = external_balance;
        self.realized_pnl = 0.0;
        self.ledger.reset_realized();
        self.sync_balance();
    }

    /// Available cash: period baseline plus realized PnL minus cash tied up
    /// in open positions.
    fn sync_balance(&mut self) {
        self.balance =
            self.starting_balance_period + self.realized_pnl - self.ledger.exposure(None);
    }

    /// New-day rebase: the baseline becomes current equity and the daily
    /// PnL counters restart.
    fn roll_day_if_needed(&mut self, now: DateTime<Utc>) {
        let day = now.date_naive();
        match self.current_day {
            None => self.current_day = Some(day),
            Some(current) if day > current => {
                self.current_day = Some(day);
                self.starting_balance_period = self.balance + self.ledger.exposure(None);
                self.realized_pnl = 0.0;
                self.ledger.reset_realized();
                tracing::info!(baseline = self.starting_balance_period, "daily baseline rebased");
            }
            Some(_) => {}
        }
    }

    pub fn stats(&self) -> RiskStats {
        RiskStats {
            balance: self.balance,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: self.unrealized_pnl,
            exposure: self.ledger.exposure(None),
            open_count: self.ledger.stats().open_count,
        }
    }

    /// Rejection counts per reason tag, for harvest-style offline analysis.
    pub fn rejection_counts(&self) -> &HashMap<String, u64> {
        &self.rejections
    }

    /// Point-in-time copy of open positions for read-only observers.
    pub fn positions(&self) -> Vec<Position> {
        self.ledger.snapshot()
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        self.ledger.closed_trades()
    }
}

fn series_prefix(symbol: &str) -> SmolStr {
    let prefix = symbol.trim().split('-').next().unwrap_or(symbol);
    SmolStr::new(prefix.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use core_types::{CloseReason, ContractSide, OrderSide};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 25, 12, 0, 0).single().expect("ts")
    }

    fn gate(balance: f64) -> RiskGate {
        RiskGate::new(
            RiskConfig::default(),
            LedgerConfig::default(),
            balance,
            None,
        )
    }

    fn intent(symbol: &str, price: f64, qty: u32) -> TradeIntent {
        TradeIntent {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            quantity: qty,
            limit_price: price,
            confidence: 0.7,
            contract_side: ContractSide::Yes,
            stop_loss: 0.0,
            trailing_rule: None,
            profit_targets: Vec::new(),
            expiration_time: None,
            strategy_name: "test".into(),
        }
    }

    #[test]
    fn rejects_insufficient_funds_and_oversize() {
        let mut gate = gate(100.0);
        let d = gate.check_order(
            150.0,
            "KXBTCD-X-T50000",
            MarketCategory::Crypto,
            "s",
            None,
            t0(),
        );
        assert!(!d.allow);
        assert_eq!(d.reason, "insufficient_funds");

        // 5% of 100 plus the $1 allowance is 6; 20 is far past it.
        let d = gate.check_order(
            20.0,
            "KXBTCD-X-T50000",
            MarketCategory::Crypto,
            "s",
            None,
            t0(),
        );
        assert_eq!(d.reason, "order_too_large");
        assert_eq!(gate.rejection_counts().get("order_too_large"), Some(&1));
    }

    #[test]
    fn portfolio_and_category_exposure_caps() {
        let mut gate = RiskGate::new(
            RiskConfig {
                max_risk_per_trade_pct: 1.0,
                min_trade_interval_sec: 0,
                ..RiskConfig::default()
            },
            LedgerConfig::default(),
            100.0,
            None,
        );
        let now = t0();
        // 40 of exposure on the books.
        gate.record_execution(&intent("KXBTCD-X-T50000", 0.40, 100), now)
            .expect("open");

        // 40 + 15 would breach the 50% portfolio cap (balance is now 60).
        let d = gate.check_order(
            15.0,
            "KXETHD-X-T3000",
            MarketCategory::Crypto,
            "s",
            None,
            now + Duration::seconds(10),
        );
        assert_eq!(d.reason, "portfolio_exposure");

        // Weather bucket is tighter than the portfolio cap.
        let mut gate = RiskGate::new(
            RiskConfig {
                max_risk_per_trade_pct: 1.0,
                min_trade_interval_sec: 0,
                ..RiskConfig::default()
            },
            LedgerConfig::default(),
            100.0,
            None,
        );
        gate.record_execution(&intent("KXHIGHNY-X-T75", 0.25, 100), now)
            .expect("open");
        let d = gate.check_order(
            10.0,
            "KXHIGHCHI-X-T90",
            MarketCategory::Weather,
            "s",
            None,
            now + Duration::seconds(10),
        );
        assert_eq!(d.reason, "category_exposure");
    }

    #[test]
    fn kill_switch_blocks_after_daily_drawdown() {
        let mut gate = gate(100.0);
        let now = t0();
        gate.record_execution(&intent("KXBTCD-X-T50000", 0.60, 5), now)
            .expect("open");
        // Contract expires worthless: realized -3.
        let mut i = intent("KXBTCD-X-T50001", 0.80, 20);
        i.expiration_time = Some(now + Duration::seconds(30));
        gate.record_execution(&i, now).expect("open");
        gate.update_market("BTC", 40_000.0, now + Duration::seconds(31));

        // Realized is now -19, past -(100 * 10%).
        assert!(gate.stats().realized_pnl < -10.0);
        let d = gate.check_order(
            2.0,
            "KXBTCD-X-T50002",
            MarketCategory::Crypto,
            "s",
            None,
            now + Duration::seconds(40),
        );
        assert_eq!(d.reason, "daily_drawdown");
    }

    #[test]
    fn expiry_freeze_and_rate_limit() {
        let mut gate = gate(100.0);
        let now = t0();
        let d = gate.check_order(
            2.0,
            "KXBTCD-X-T50000",
            MarketCategory::Crypto,
            "s",
            Some(now + Duration::seconds(45)),
            now,
        );
        assert_eq!(d.reason, "expiry_freeze");

        gate.record_execution(&intent("KXBTCD-X-T50000", 0.50, 4), now)
            .expect("open");
        let d = gate.check_order(
            2.0,
            "KXBTCD-X-T50001",
            MarketCategory::Crypto,
            "s",
            None,
            now + Duration::seconds(3),
        );
        assert_eq!(d.reason, "rate_limit");

        let d = gate.check_order(
            2.0,
            "KXBTCD-X-T50001",
            MarketCategory::Crypto,
            "s",
            None,
            now + Duration::seconds(6),
        );
        assert!(d.allow);
    }

    #[test]
    fn losing_close_sets_series_cooldown() {
        let mut gate = gate(1000.0);
        let now = t0();
        let mut i = intent("KXHIGHNY-X-T75", 0.50, 10);
        i.expiration_time = Some(now + Duration::seconds(30));
        gate.record_execution(&i, now).expect("open");

        // Cold day: above-75 expires worthless, -5 realized.
        gate.update_market("TEMP_KNYC", 60.0, now + Duration::seconds(31));

        let d = gate.check_order(
            5.0,
            "KXHIGHNY-X-T80",
            MarketCategory::Weather,
            "s",
            None,
            now + Duration::seconds(60),
        );
        assert_eq!(d.reason, "loss_cooldown");

        // A different series is unaffected.
        let d = gate.check_order(
            5.0,
            "KXBTCD-X-T50000",
            MarketCategory::Crypto,
            "s",
            None,
            now + Duration::seconds(60),
        );
        assert!(d.allow);

        // Cooldown lapses after the configured window.
        let d = gate.check_order(
            5.0,
            "KXHIGHNY-X-T80",
            MarketCategory::Weather,
            "s",
            None,
            now + Duration::seconds(400),
        );
        assert!(d.allow);
    }

    #[test]
    fn strategy_drawdown_cuts_off_one_strategy() {
        let mut gate = RiskGate::new(
            RiskConfig {
                strategy_drawdown_limit: 4.0,
                loss_cooldown_sec: 0,
                ..RiskConfig::default()
            },
            LedgerConfig::default(),
            1000.0,
            None,
        );
        let now = t0();
        let mut i = intent("KXHIGHNY-X-T75", 0.50, 10);
        i.expiration_time = Some(now + Duration::seconds(30));
        i.strategy_name = "weather_arb".into();
        gate.record_execution(&i, now).expect("open");
        gate.update_market("TEMP_KNYC", 60.0, now + Duration::seconds(31));

        let d = gate.check_order(
            5.0,
            "KXHIGHCHI-X-T80",
            MarketCategory::Weather,
            "weather_arb",
            None,
            now + Duration::seconds(60),
        );
        assert_eq!(d.reason, "strategy_drawdown");

        let d = gate.check_order(
            5.0,
            "KXHIGHCHI-X-T80",
            MarketCategory::Weather,
            "crypto_trend",
            None,
            now + Duration::seconds(60),
        );
        assert!(d.allow);
    }

    #[test]
    fn kelly_size_respects_hard_cap() {
        let mut gate = gate(1_000_000.0);
        gate.balance = 1_000_000.0;
        let qty = gate.calculate_kelly_size(0.90, 0.10);
        assert!(qty <= 500);
        assert!(qty >= 1);

        // No edge: Kelly goes to zero.
        assert_eq!(gate.calculate_kelly_size(0.50, 0.50), 0);
        assert_eq!(gate.calculate_kelly_size(0.90, 0.0), 0);
        assert_eq!(gate.calculate_kelly_size(0.90, 1.0), 0);
    }

    #[test]
    fn kelly_size_scales_with_balance() {
        let gate = gate(100.0);
        // p=0.7 at price 0.5: f = 0.4, fractional 0.1, capped at 5% -> $5.
        let qty = gate.calculate_kelly_size(0.70, 0.50);
        assert_eq!(qty, 10);
    }

    #[test]
    fn balance_sync_does_not_double_count() {
        let mut gate = gate(100.0);
        let now = t0();
        let mut i = intent("KXBTCD-X-T50000", 0.20, 100);
        i.expiration_time = Some(now + Duration::seconds(120));
        gate.record_execution(&i, now).expect("open");
        assert!((gate.balance() - 80.0).abs() < 1e-9);

        // Winning settlement: +0.8 per contract on 100 contracts.
        gate.update_market("BTC", 60_000.0, now + Duration::seconds(121));
        assert!((gate.stats().realized_pnl - 80.0).abs() < 1e-9);
        assert!((gate.balance() - 180.0).abs() < 1e-9);

        // The exchange reports 180; syncing must not re-add the 80.
        gate.update_balance(180.0);
        assert!((gate.balance() - 180.0).abs() < 1e-9);
        assert!(gate.stats().realized_pnl.abs() < 1e-9);

        gate.update_market("BTC", 60_000.0, now + Duration::seconds(130));
        assert!((gate.balance() - 180.0).abs() < 1e-9);
    }

    #[test]
    fn close_events_reach_the_sink() {
        #[derive(Default)]
        struct Recorder(Mutex<Vec<(String, CloseReason, f64)>>);
        impl CloseSink for Recorder {
            fn on_close(&self, trade: &ClosedTrade) {
                self.0.lock().push((
                    trade.strategy_name.to_string(),
                    trade.reason,
                    trade.pnl,
                ));
            }
        }

        let recorder = Arc::new(Recorder::default());
        struct Fwd(Arc<Recorder>);
        impl CloseSink for Fwd {
            fn on_close(&self, trade: &ClosedTrade) {
                self.0.on_close(trade);
            }
        }

        let mut gate = RiskGate::new(
            RiskConfig::default(),
            LedgerConfig::default(),
            100.0,
            Some(Box::new(Fwd(Arc::clone(&recorder)))),
        );
        let now = t0();
        let mut i = intent("KXHIGHNY-X-T75", 0.50, 10);
        i.expiration_time = Some(now + Duration::seconds(90));
        i.strategy_name = "weather_arb".into();
        gate.record_execution(&i, now).expect("open");
        gate.update_market("TEMP_KNYC", 80.0, now + Duration::seconds(91));

        let seen = recorder.0.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "weather_arb");
        assert_eq!(seen[0].1, CloseReason::Expired);
        assert!((seen[0].2 - 5.0).abs() < 1e-9);
    }

    #[test]
    fn provider_tick_drives_settlement() {
        let mut gate = gate(100.0);
        let now = t0();
        let mut i = intent("KXBTCD-X-T50000", 0.50, 4);
        i.expiration_time = Some(now + Duration::seconds(60));
        gate.record_execution(&i, now).expect("open");

        let tick = Tick {
            symbol: "BTC".to_string(),
            price: 55_000.0,
            bid: 0.0,
            ask: 0.0,
            volume: 0.0,
            ts: now + Duration::seconds(61),
            extra: std::collections::HashMap::new(),
        };
        let events = gate.on_tick(&tick);
        assert_eq!(events.len(), 1);
        assert_eq!(gate.stats().open_count, 0);
        assert!((gate.stats().realized_pnl - 2.0).abs() < 1e-9);
    }

    #[test]
    fn submit_rejects_malformed_symbol() {
        let mut gate = gate(100.0);
        let i = intent("KXHIGHNY-X-NONE", 0.50, 4);
        assert!(gate.submit(&i, t0()).is_err());
        assert_eq!(gate.stats().open_count, 0);
    }

    #[test]
    fn fifty_cycle_simulation_stays_bounded() {
        let mut gate = RiskGate::new(
            RiskConfig {
                // Losses trigger series cooldowns; cycles are spaced wider
                // than the window so every entry is admitted on merit.
                loss_cooldown_sec: 300,
                ..RiskConfig::default()
            },
            LedgerConfig::default(),
            100.0,
            None,
        );
        let start = t0();

        for cycle in 0..50u32 {
            let now = start + Duration::seconds(cycle as i64 * 600);
            let price = 0.50;
            let qty = gate.calculate_kelly_size(0.65, price).max(1);
            let cost = price * qty as f64;
            let symbol = format!("KXBTCD-SIM{cycle}-T50000");
            let d = gate.check_order(
                cost,
                &symbol,
                MarketCategory::Crypto,
                "sim",
                Some(now + Duration::seconds(120)),
                now,
            );
            if !d.allow {
                continue;
            }
            let mut i = intent(&symbol, price, qty);
            i.expiration_time = Some(now + Duration::seconds(120));
            gate.record_execution(&i, now).expect("open");

            // Alternate wins and losses at settlement.
            let observable = if cycle % 2 == 0 { 51_000.0 } else { 49_000.0 };
            gate.update_market("BTC", observable, now + Duration::seconds(121));
        }

        let stats = gate.stats();
        assert_eq!(stats.open_count, 0);
        assert!(stats.balance > 0.0);
        assert!(stats.balance < 500.0, "balance grew to {}", stats.balance);
    }
}
