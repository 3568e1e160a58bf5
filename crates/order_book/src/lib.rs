use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use core_types::OrderSide;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Expired,
}

/// A limit order waiting to be filled, with a patience timeout after which
/// it lapses unfilled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitOrder {
    pub order_id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub limit_price: f64,
    pub quantity: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: OrderStatus,
    pub filled_price: Option<f64>,
    pub filled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub quantity: u32,
}

/// Purely descriptive spread/depth view of one symbol's ladder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SpreadInfo {
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub spread_pct: f64,
    pub mid: f64,
    /// Sum of the top three bid levels.
    pub bid_depth: u32,
    /// Sum of the top three ask levels.
    pub ask_depth: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct BookStats {
    pub pending: usize,
    pub filled: usize,
    pub cancelled: usize,
    pub expired: usize,
}

#[derive(Debug, Default)]
struct Ladder {
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
}

#[derive(Debug, Default)]
struct BookState {
    pending: HashMap<u64, LimitOrder>,
    done: Vec<LimitOrder>,
    ladders: HashMap<String, Ladder>,
    next_order_id: u64,
}

/// Standalone limit-order fill simulator. Not wired into the ledger: a
/// consumer wanting real fills connects the two explicitly. Shared-readable
/// so a live routing layer can poll it from another thread.
pub struct LimitOrderBook {
    state: RwLock<BookState>,
    default_patience: Duration,
}

impl Default for LimitOrderBook {
    fn default() -> Self {
        Self::new(Duration::seconds(30))
    }
}

impl LimitOrderBook {
    pub fn new(default_patience: Duration) -> Self {
        Self {
            state: RwLock::new(BookState {
                next_order_id: 1,
                ..BookState::default()
            }),
            default_patience,
        }
    }

    pub fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        limit_price: f64,
        quantity: u32,
        patience: Option<Duration>,
        now: DateTime<Utc>,
    ) -> LimitOrder {
        let patience = patience.unwrap_or(self.default_patience);
        let mut state = self.state.write();
        let order = LimitOrder {
            order_id: state.next_order_id,
            symbol: symbol.to_string(),
            side,
            limit_price,
            quantity,
            created_at: now,
            expires_at: now + patience,
            status: OrderStatus::Pending,
            filled_price: None,
            filled_at: None,
        };
        state.next_order_id += 1;
        state.pending.insert(order.order_id, order.clone());
        tracing::info!(
            order_id = order.order_id,
            symbol,
            side = %side,
            limit_price,
            quantity,
            patience_sec = patience.num_seconds(),
            "limit order placed"
        );
        order
    }

    /// Replaces the simulated ladder for a symbol. Bids are expected sorted
    /// descending, asks ascending.
    pub fn update_book(&self, symbol: &str, bids: Vec<BookLevel>, asks: Vec<BookLevel>) {
        self.state
            .write()
            .ladders
            .insert(symbol.to_string(), Ladder { bids, asks });
    }

    pub fn spread_info(&self, symbol: &str) -> Option<SpreadInfo> {
        let state = self.state.read();
        let ladder = state.ladders.get(symbol)?;
        let best_bid = ladder.bids.first()?.price;
        let best_ask = ladder.asks.first()?.price;
        let spread = best_ask - best_bid;
        let mid = (best_bid + best_ask) / 2.0;
        let spread_pct = if mid > 0.0 { spread / mid * 100.0 } else { 0.0 };
        Some(SpreadInfo {
            bid: best_bid,
            ask: best_ask,
            spread,
            spread_pct,
            mid,
            bid_depth: ladder.bids.iter().take(3).map(|l| l.quantity).sum(),
            ask_depth: ladder.asks.iter().take(3).map(|l| l.quantity).sum(),
        })
    }

    /// Sweeps pending orders for this symbol: lapses the ones past their
    /// patience window, fills the ones the market has crossed (a buy fills
    /// when the ask drops to its limit, at the ask). Returns the fills.
    pub fn check_fills(
        &self,
        symbol: &str,
        bid: f64,
        ask: f64,
        now: DateTime<Utc>,
    ) -> Vec<LimitOrder> {
        let mut state = self.state.write();
        let mut newly_filled = Vec::new();
        let mut finished = Vec::new();

        for (id, order) in state.pending.iter_mut() {
            if order.symbol != symbol {
                continue;
            }

            if now >= order.expires_at {
                order.status = OrderStatus::Expired;
                tracing::info!(order_id = *id, symbol, "limit order expired unfilled");
                finished.push(*id);
                continue;
            }

            let fill_price = match order.side {
                OrderSide::Buy if ask <= order.limit_price => Some(ask),
                OrderSide::Sell if bid >= order.limit_price => Some(bid),
                _ => None,
            };
            if let Some(px) = fill_price {
                order.status = OrderStatus::Filled;
                order.filled_price = Some(px);
                order.filled_at = Some(now);
                tracing::info!(
                    order_id = *id,
                    symbol,
                    fill_price = px,
                    limit_price = order.limit_price,
                    "limit order filled"
                );
                newly_filled.push(order.clone());
                finished.push(*id);
            }
        }

        for id in finished {
            if let Some(order) = state.pending.remove(&id) {
                state.done.push(order);
            }
        }
        newly_filled
    }

    pub fn cancel_order(&self, order_id: u64) -> bool {
        let mut state = self.state.write();
        match state.pending.remove(&order_id) {
            Some(mut order) => {
                order.status = OrderStatus::Cancelled;
                tracing::info!(order_id, symbol = %order.symbol, "limit order cancelled");
                state.done.push(order);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all_for_symbol(&self, symbol: &str) -> usize {
        let ids: Vec<u64> = {
            let state = self.state.read();
            state
                .pending
                .values()
                .filter(|o| o.symbol == symbol)
                .map(|o| o.order_id)
                .collect()
        };
        let count = ids.len();
        for id in ids {
            self.cancel_order(id);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.state.read().pending.len()
    }

    pub fn stats(&self) -> BookStats {
        let state = self.state.read();
        let mut stats = BookStats {
            pending: state.pending.len(),
            ..BookStats::default()
        };
        for order in &state.done {
            match order.status {
                OrderStatus::Filled => stats.filled += 1,
                OrderStatus::Cancelled => stats.cancelled += 1,
                OrderStatus::Expired => stats.expired += 1,
                OrderStatus::Pending => {}
            }
        }
        stats
    }
}
