use chrono::{DateTime, Utc};
use core_types::{
    CloseReason, ClosedTrade, ContractSymbol, LedgerError, LedgerEvent, LedgerStats,
    MarketCategory, MarketFamily, OrderSide, Position, TradeIntent,
};
use fair_value::ValuationModel;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerConfig {
    /// Percentage take-profit against entry cost, applied to every open
    /// position.
    pub take_profit_pct: f64,
    /// Percentage stop against entry cost, applied only when no explicit
    /// stop price is set. Upstream history carries both 0.30 and 0.15; 0.15
    /// is the canonical default here.
    pub stop_loss_pct: f64,
    /// Force-close ceiling on position age, minutes.
    pub time_limit_min: f64,
    /// Minimum age before the pinned-price early-settlement heuristic may
    /// fire, minutes.
    pub early_settlement_min: f64,
    pub pin_high: f64,
    pub pin_low: f64,
    /// A cached observed contract price older than this is ignored.
    pub observed_price_max_age_sec: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            take_profit_pct: 0.15,
            stop_loss_pct: 0.15,
            time_limit_min: 60.0,
            early_settlement_min: 10.0,
            pin_high: 0.99,
            pin_low: 0.01,
            observed_price_max_age_sec: 300,
        }
    }
}

/// Owns open positions and the closed-trade history; consumes underlying
/// ticks, marks positions through the valuation model, and runs every close
/// path. Single-writer: callers needing a concurrent read take `snapshot`.
#[derive(Debug)]
pub struct PositionLedger {
    cfg: LedgerConfig,
    model: ValuationModel,
    positions: Vec<Position>,
    closed: Vec<ClosedTrade>,
    realized_pnl: f64,
    unrealized_pnl: f64,
    next_id: u64,
}

impl PositionLedger {
    pub fn new(cfg: LedgerConfig, model: ValuationModel) -> Self {
        Self {
            cfg,
            model,
            positions: Vec::new(),
            closed: Vec::new(),
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            next_id: 1,
        }
    }

    pub fn cfg(&self) -> &LedgerConfig {
        &self.cfg
    }

    /// Opens a position from an admitted intent. The symbol is parsed and
    /// validated here, once; malformed symbols are a typed rejection.
    pub fn open(&mut self, intent: &TradeIntent, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        if intent.quantity == 0 {
            return Err(LedgerError::ZeroQuantity);
        }
        if !(0.0..=1.0).contains(&intent.limit_price) || !intent.limit_price.is_finite() {
            return Err(LedgerError::PriceOutOfRange(intent.limit_price));
        }
        let contract = ContractSymbol::parse(&intent.symbol)?;

        let id = self.next_id;
        self.next_id += 1;
        self.positions.push(Position {
            id,
            contract,
            side: intent.side,
            contract_side: intent.contract_side,
            entry_price: intent.limit_price,
            current_price: intent.limit_price,
            quantity: intent.quantity,
            original_quantity: intent.quantity,
            open_time: now,
            expiration_time: intent.expiration_time,
            stop_loss: intent.stop_loss,
            trailing_rule: intent.trailing_rule,
            trailing_activated: false,
            profit_targets: intent.profit_targets.clone(),
            last_observed_market_price: None,
            last_observed_at: None,
            strategy_name: intent.strategy_name.clone(),
            pnl: 0.0,
        });
        tracing::info!(
            id,
            symbol = %intent.symbol,
            side = %intent.side,
            qty = intent.quantity,
            price = intent.limit_price,
            strategy = %intent.strategy_name,
            "position opened"
        );
        Ok(id)
    }

    /// Caches a directly observed contract quote on matching open
    /// positions. Preferred over the formula when the valuation signal is
    /// too weak to trust.
    pub fn record_observed_price(&mut self, symbol: &str, price: f64, now: DateTime<Utc>) {
        if !(0.0..=1.0).contains(&price) || !price.is_finite() {
            tracing::warn!(symbol, price, "ignoring out-of-range observed quote");
            return;
        }
        for pos in &mut self.positions {
            if pos.contract.raw.eq_ignore_ascii_case(symbol) {
                pos.last_observed_market_price = Some(price);
                pos.last_observed_at = Some(now);
            }
        }
    }

    /// Per-tick update for every open position matching `fragment`.
    /// Runs the close pipeline in strict priority order; returns the
    /// resulting events instead of invoking observers directly.
    pub fn update(
        &mut self,
        fragment: &str,
        observable: f64,
        now: DateTime<Utc>,
    ) -> Vec<LedgerEvent> {
        let mut events = Vec::new();
        if !observable.is_finite() {
            tracing::warn!(fragment, observable, "skipping non-finite observable");
            return events;
        }
        let (family_filter, frag) = normalize_fragment(fragment);

        let mut i = 0;
        while i < self.positions.len() {
            if !matches_fragment(&self.positions[i].contract, family_filter, &frag) {
                i += 1;
                continue;
            }

            // 1. Contract expiration: real binary settlement.
            if let Some(exp) = self.positions[i].expiration_time {
                if now >= exp {
                    let trade = self.close_at(i, CloseReason::Expired, 0.0, observable, now);
                    events.push(LedgerEvent::Closed(trade));
                    continue;
                }
            }

            let age_min =
                (now - self.positions[i].open_time).num_seconds() as f64 / 60.0;

            // 2. Age ceiling: force-close on the last estimated option
            // price, never the raw observable.
            if age_min >= self.cfg.time_limit_min {
                let last_estimate = self.positions[i].current_price;
                let trade = self.close_at(i, CloseReason::TimeLimit, last_estimate, observable, now);
                events.push(LedgerEvent::Closed(trade));
                continue;
            }

            // 3. Mark to the valuation model, falling back to a fresh
            // observed quote when the signal is weak.
            let estimate = self
                .model
                .estimate(&self.positions[i].contract, observable);
            let pos = &mut self.positions[i];
            let mut price = pos.own_price(estimate.yes_price);
            if estimate.is_weak(self.model.cfg()) {
                if let Some(observed) = fresh_observed(pos, self.cfg.observed_price_max_age_sec, now)
                {
                    price = observed;
                }
            }
            pos.current_price = price;
            pos.pnl = pos.pnl_at(price, pos.quantity);

            // 4. Pinned at an extreme for long enough: the market has
            // effectively decided. Settle as binary.
            if age_min >= self.cfg.early_settlement_min
                && (price >= self.cfg.pin_high || price <= self.cfg.pin_low)
            {
                let trade = self.close_at(i, CloseReason::EarlySettlement, 0.0, observable, now);
                events.push(LedgerEvent::Closed(trade));
                continue;
            }

            // 5. Trailing-stop activation (one-shot).
            let pos = &mut self.positions[i];
            if let Some(rule) = pos.trailing_rule {
                if !pos.trailing_activated {
                    let crossed = match pos.side {
                        OrderSide::Buy => price >= rule.trigger_price,
                        OrderSide::Sell => price <= rule.trigger_price,
                    };
                    if crossed {
                        pos.stop_loss = rule.new_stop_loss;
                        pos.trailing_activated = true;
                        tracing::info!(
                            id = pos.id,
                            symbol = %pos.contract.raw,
                            new_stop = rule.new_stop_loss,
                            "trailing stop activated"
                        );
                    }
                }
            }

            // 6. Explicit stop price. Closes on the last safe price, never
            // the raw observable.
            let pos = &self.positions[i];
            if pos.stop_loss > 0.0 {
                let hit = match pos.side {
                    OrderSide::Buy => price <= pos.stop_loss,
                    OrderSide::Sell => price >= pos.stop_loss,
                };
                if hit {
                    let safe = fresh_observed(pos, self.cfg.observed_price_max_age_sec, now)
                        .unwrap_or(price);
                    let trade = self.close_at(i, CloseReason::StopLoss, safe, observable, now);
                    events.push(LedgerEvent::Closed(trade));
                    continue;
                }
            }

            // 7. Percentage fallbacks against entry cost. The stop side only
            // applies when no explicit stop price is set.
            let pos = &self.positions[i];
            let cost = pos.cost();
            let pnl_pct = if cost > 0.0 { pos.pnl / cost } else { 0.0 };
            if pnl_pct >= self.cfg.take_profit_pct {
                let trade = self.close_at(i, CloseReason::TakeProfit, price, observable, now);
                events.push(LedgerEvent::Closed(trade));
                continue;
            }
            if pos.stop_loss == 0.0 && pnl_pct <= -self.cfg.stop_loss_pct {
                let trade = self.close_at(i, CloseReason::StopLoss, price, observable, now);
                events.push(LedgerEvent::Closed(trade));
                continue;
            }

            // 8. Ordered profit-target partial exits.
            if self.fire_profit_targets(i, price, observable, now, &mut events) {
                continue;
            }

            i += 1;
        }

        self.unrealized_pnl = self.positions.iter().map(|p| p.pnl).sum();
        events
    }

    /// Consumes matched profit targets in order; returns true if the
    /// position was fully unwound (and thus removed).
    fn fire_profit_targets(
        &mut self,
        idx: usize,
        price: f64,
        observable: f64,
        now: DateTime<Utc>,
        events: &mut Vec<LedgerEvent>,
    ) -> bool {
        loop {
            let pos = &self.positions[idx];
            let Some(target) = pos.profit_targets.first().copied() else {
                return false;
            };
            let matched = match pos.side {
                OrderSide::Buy => price >= pos.entry_price + target.price_delta,
                OrderSide::Sell => price <= pos.entry_price - target.price_delta,
            };
            if !matched {
                return false;
            }

            let pos = &mut self.positions[idx];
            pos.profit_targets.remove(0);
            let fraction = target.close_fraction.clamp(0.0, 1.0);
            let qty_closed =
                ((pos.quantity as f64 * fraction).round() as u32).clamp(1, pos.quantity);

            if qty_closed == pos.quantity {
                let trade = self.close_at(idx, CloseReason::PartialExit, price, observable, now);
                events.push(LedgerEvent::Closed(trade));
                return true;
            }

            let pnl = pos.pnl_at(price, qty_closed);
            pos.quantity -= qty_closed;
            pos.pnl = pos.pnl_at(price, pos.quantity);
            self.realized_pnl += pnl;
            tracing::info!(
                id = pos.id,
                symbol = %pos.contract.raw,
                qty_closed,
                remaining = pos.quantity,
                price,
                pnl,
                "partial exit"
            );
            events.push(LedgerEvent::PartialExit {
                position_id: pos.id,
                symbol: pos.contract.raw.clone(),
                strategy_name: pos.strategy_name.clone(),
                quantity_closed: qty_closed,
                exit_price: price,
                pnl,
            });
        }
    }

    /// Shared terminal close. Binary settlements resolve the exit price
    /// from the outcome; every other reason passes the already-safe
    /// estimate in `raw_exit`. The sanity clamp is the last line of defense
    /// against a raw underlying leaking into realized PnL.
    fn close_at(
        &mut self,
        idx: usize,
        reason: CloseReason,
        raw_exit: f64,
        observable: f64,
        now: DateTime<Utc>,
    ) -> ClosedTrade {
        let pos = self.positions.remove(idx);

        let exit_price = if reason.is_binary_settlement() {
            let outcome = self.model.settlement_outcome(&pos.contract, observable);
            pos.own_price(if outcome { 1.0 } else { 0.0 })
        } else {
            sanitize_exit_price(raw_exit, pos.entry_price, &pos.contract.raw, reason)
        };

        let pnl = pos.pnl_at(exit_price, pos.quantity);
        self.realized_pnl += pnl;

        let trade = ClosedTrade {
            id: pos.id,
            contract: pos.contract,
            side: pos.side,
            contract_side: pos.contract_side,
            entry_price: pos.entry_price,
            exit_price,
            quantity: pos.quantity,
            original_quantity: pos.original_quantity,
            open_time: pos.open_time,
            close_time: now,
            reason,
            strategy_name: pos.strategy_name,
            pnl,
        };
        tracing::info!(
            id = trade.id,
            symbol = %trade.contract.raw,
            reason = %reason,
            entry = trade.entry_price,
            exit = trade.exit_price,
            qty = trade.quantity,
            pnl,
            outcome = if pnl > 0.0 { "win" } else { "loss" },
            "position closed"
        );
        self.closed.push(trade.clone());
        trade
    }

    /// Point-in-time copy of the open set for read-only observers.
    pub fn snapshot(&self) -> Vec<Position> {
        self.positions.clone()
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            realized_pnl: self.realized_pnl,
            unrealized_pnl: self.unrealized_pnl,
            open_count: self.positions.len(),
        }
    }

    /// Cash tied up in open positions, optionally filtered by category.
    pub fn exposure(&self, category: Option<MarketCategory>) -> f64 {
        self.positions
            .iter()
            .filter(|p| category.map_or(true, |c| p.contract.category() == c))
            .map(|p| p.cost())
            .sum()
    }

    /// Zeroes the realized counter after an external balance sync; the
    /// synced balance already embeds all historical PnL.
    pub fn reset_realized(&mut self) {
        self.realized_pnl = 0.0;
    }
}

fn fresh_observed(pos: &Position, max_age_sec: i64, now: DateTime<Utc>) -> Option<f64> {
    let price = pos.last_observed_market_price?;
    let at = pos.last_observed_at?;
    if (now - at).num_seconds() <= max_age_sec {
        Some(price)
    } else {
        None
    }
}

/// Rejects an exit price outside [0, 1] before it can pollute realized
/// PnL; substitutes the entry price for a neutral, zero-PnL close.
fn sanitize_exit_price(exit: f64, entry: f64, symbol: &str, reason: CloseReason) -> f64 {
    if !(0.0..=1.0).contains(&exit) || !exit.is_finite() {
        tracing::error!(
            symbol,
            reason = %reason,
            exit,
            "exit price outside [0,1]; raw underlying leaked, closing at entry"
        );
        return entry;
    }
    exit
}

/// Station-id and update-type normalization carried over from the data
/// providers' naming: `TEMP_KNYC` addresses the NY temperature contracts.
fn normalize_fragment(raw: &str) -> (Option<MarketFamily>, String) {
    const STATION_MAP: [(&str, &str); 6] = [
        ("KNYC", "NY"),
        ("KJFK", "NY"),
        ("KLAX", "LAX"),
        ("KORD", "CHI"),
        ("KMIA", "MIA"),
        ("BTC", "BTC"),
    ];

    let mut frag = raw.trim().to_ascii_uppercase();
    let mut family = None;
    if let Some(rest) = frag.strip_prefix("TEMP_") {
        family = Some(MarketFamily::Temperature);
        frag = rest.to_string();
    }
    if let Some((_, mapped)) = STATION_MAP.iter().find(|(station, _)| *station == frag) {
        frag = (*mapped).to_string();
    }
    if matches!(frag.as_str(), "NY" | "LAX" | "CHI" | "MIA") {
        family = Some(MarketFamily::Temperature);
    }
    (family, frag)
}

fn matches_fragment(
    contract: &ContractSymbol,
    family_filter: Option<MarketFamily>,
    frag: &str,
) -> bool {
    if let Some(family) = family_filter {
        if contract.family != family {
            return false;
        }
    }
    contract.raw.to_ascii_uppercase().contains(frag)
}
