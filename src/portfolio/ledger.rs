//! Authoritative position and cash ledger.
//!
//! The ledger is the only place positions change. Fills are applied exactly
//! once (deduplicated by fill id), capacity for in-flight orders is held as
//! reservations, and the daily loss counter rolls at the UTC day boundary
//! based on event timestamps.

use crate::error::TradingError;
use crate::exchange::{FillId, MarketId, OrderId, Side};
use crate::utils::{blend_price, safe_div};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// An execution against one of our orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: FillId,
    pub order_id: OrderId,
    pub market_id: MarketId,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub at: DateTime<Utc>,
}

impl Fill {
    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }
}

/// Net holding of YES shares in one market. Negative quantity is short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub market_id: MarketId,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub mark_price: Option<Decimal>,
}

impl Position {
    fn flat(market_id: MarketId) -> Self {
        Self {
            market_id,
            quantity: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            mark_price: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    /// Capital committed at entry prices.
    pub fn notional(&self) -> Decimal {
        self.quantity.abs() * self.avg_entry_price
    }

    fn mark_or_entry(&self) -> Decimal {
        self.mark_price.unwrap_or(self.avg_entry_price)
    }

    /// Signed value at the last mark.
    pub fn market_value(&self) -> Decimal {
        self.quantity * self.mark_or_entry()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.quantity * (self.mark_or_entry() - self.avg_entry_price)
    }

    /// Apply a trade, returning the P&L it realized.
    fn apply(&mut self, side: Side, quantity: Decimal, price: Decimal) -> Decimal {
        let delta = side.sign() * quantity;
        let current = self.quantity;
        let mut realized = Decimal::ZERO;

        if current.is_zero() || current.is_sign_positive() == delta.is_sign_positive() {
            self.avg_entry_price = blend_price(current.abs(), self.avg_entry_price, quantity, price);
        } else {
            let closing = quantity.min(current.abs());
            let direction = if current.is_sign_positive() {
                Decimal::ONE
            } else {
                Decimal::NEGATIVE_ONE
            };
            realized = closing * (price - self.avg_entry_price) * direction;

            let remaining = current + delta;
            if remaining.is_zero() {
                self.avg_entry_price = Decimal::ZERO;
            } else if remaining.is_sign_positive() != current.is_sign_positive() {
                // Flipped through flat: the excess opens at the fill price.
                self.avg_entry_price = price;
            }
        }

        self.quantity = current + delta;
        self.realized_pnl += realized;
        self.mark_price = Some(price);
        realized
    }
}

/// Capacity held for an in-flight order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub order_id: OrderId,
    pub market_id: MarketId,
    pub side: Side,
    pub price: Decimal,
    /// Unfilled quantity still covered
    pub quantity: Decimal,
}

impl Reservation {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }

    /// Maximum loss if the remaining quantity fills and resolves against us.
    pub fn worst_case_loss(&self) -> Decimal {
        worst_case_loss(self.side, self.price, self.quantity)
    }
}

/// Buys lose the premium paid; sells lose the distance to 1.
pub fn worst_case_loss(side: Side, price: Decimal, quantity: Decimal) -> Decimal {
    match side {
        Side::Buy => quantity * price,
        Side::Sell => quantity * (Decimal::ONE - price),
    }
}

/// Point-in-time view of the portfolio.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioSnapshot {
    pub taken_at: DateTime<Utc>,
    pub day: NaiveDate,
    pub cash: Decimal,
    pub equity: Decimal,
    pub positions: Vec<Position>,
    pub reserved_notional: Decimal,
    pub reserved_loss: Decimal,
    pub reserved_by_market: BTreeMap<MarketId, Decimal>,
    /// Losses since the start of `day`, net of gains, never negative
    pub daily_loss: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
}

impl PortfolioSnapshot {
    /// Equity not already committed to in-flight orders.
    pub fn available_capital(&self) -> Decimal {
        (self.equity - self.reserved_notional).max(Decimal::ZERO)
    }

    /// Open position notional plus reserved notional in a market.
    pub fn market_exposure(&self, market_id: &MarketId) -> Decimal {
        let open = self
            .positions
            .iter()
            .find(|p| &p.market_id == market_id)
            .map(Position::notional)
            .unwrap_or(Decimal::ZERO);
        let reserved = self
            .reserved_by_market
            .get(market_id)
            .copied()
            .unwrap_or(Decimal::ZERO);
        open + reserved
    }

    pub fn has_reservation(&self, market_id: &MarketId) -> bool {
        self.reserved_by_market.contains_key(market_id)
    }

    /// Daily loss plus the worst case of everything in flight.
    pub fn committed_loss(&self) -> Decimal {
        self.daily_loss + self.reserved_loss
    }

    pub fn position(&self, market_id: &MarketId) -> Option<&Position> {
        self.positions.iter().find(|p| &p.market_id == market_id)
    }
}

/// Single-writer ledger of cash, positions and reservations.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionLedger {
    starting_cash: Decimal,
    cash: Decimal,
    positions: BTreeMap<MarketId, Position>,
    reservations: BTreeMap<OrderId, Reservation>,
    applied_fills: BTreeSet<FillId>,
    day: NaiveDate,
    day_start_equity: Decimal,
}

impl PositionLedger {
    pub fn new(starting_cash: Decimal, opened_at: DateTime<Utc>) -> Self {
        Self {
            starting_cash,
            cash: starting_cash,
            positions: BTreeMap::new(),
            reservations: BTreeMap::new(),
            applied_fills: BTreeSet::new(),
            day: opened_at.date_naive(),
            day_start_equity: starting_cash,
        }
    }

    pub fn starting_cash(&self) -> Decimal {
        self.starting_cash
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn equity(&self) -> Decimal {
        self.cash + self.positions.values().map(Position::market_value).sum::<Decimal>()
    }

    pub fn position(&self, market_id: &MarketId) -> Option<&Position> {
        self.positions.get(market_id)
    }

    pub fn reservation(&self, order_id: &OrderId) -> Option<&Reservation> {
        self.reservations.get(order_id)
    }

    pub fn has_applied(&self, fill_id: &FillId) -> bool {
        self.applied_fills.contains(fill_id)
    }

    /// Start a new day if `at` falls after the current one.
    fn roll_day(&mut self, at: DateTime<Utc>) {
        let date = at.date_naive();
        if date > self.day {
            let equity = self.equity();
            info!(
                previous = %self.day,
                day = %date,
                %equity,
                daily_loss = %self.daily_loss(),
                "Daily loss counter reset"
            );
            self.day = date;
            self.day_start_equity = equity;
        }
    }

    fn daily_loss(&self) -> Decimal {
        (self.day_start_equity - self.equity()).max(Decimal::ZERO)
    }

    /// Hold capacity for an order about to be submitted.
    pub fn reserve(&mut self, reservation: Reservation, at: DateTime<Utc>) -> Result<(), TradingError> {
        self.roll_day(at);
        if self.reservations.contains_key(&reservation.order_id) {
            return Err(TradingError::LedgerInconsistency(format!(
                "order {} already holds a reservation",
                reservation.order_id
            )));
        }
        debug!(
            order_id = %reservation.order_id,
            market = %reservation.market_id,
            notional = %reservation.notional(),
            "Capacity reserved"
        );
        self.reservations
            .insert(reservation.order_id.clone(), reservation);
        Ok(())
    }

    /// Return an order's remaining capacity. Releasing twice is a no-op.
    pub fn release(&mut self, order_id: &OrderId) -> Option<Reservation> {
        let released = self.reservations.remove(order_id);
        if let Some(r) = &released {
            debug!(%order_id, market = %r.market_id, notional = %r.notional(), "Reservation released");
        }
        released
    }

    /// Apply a fill. Idempotent by fill id; the only position mutator.
    pub fn apply_fill(&mut self, fill: &Fill) -> Result<Position, TradingError> {
        if self.applied_fills.contains(&fill.fill_id) {
            debug!(fill_id = %fill.fill_id, "Duplicate fill ignored");
            return Ok(self
                .positions
                .get(&fill.market_id)
                .cloned()
                .unwrap_or_else(|| Position::flat(fill.market_id.clone())));
        }

        if fill.quantity <= Decimal::ZERO || fill.price <= Decimal::ZERO || fill.price >= Decimal::ONE {
            return Err(TradingError::LedgerInconsistency(format!(
                "fill {} has invalid price {} or quantity {}",
                fill.fill_id, fill.price, fill.quantity
            )));
        }

        let reservation = self.reservations.get(&fill.order_id).ok_or_else(|| {
            TradingError::LedgerInconsistency(format!(
                "fill {} references order {} without a reservation",
                fill.fill_id, fill.order_id
            ))
        })?;
        if reservation.market_id != fill.market_id || reservation.side != fill.side {
            return Err(TradingError::LedgerInconsistency(format!(
                "fill {} does not match reservation for order {}",
                fill.fill_id, fill.order_id
            )));
        }

        let cash_delta = -fill.side.sign() * fill.notional();
        if self.cash + cash_delta < Decimal::ZERO {
            return Err(TradingError::LedgerInconsistency(format!(
                "fill {} would take cash to {}",
                fill.fill_id,
                self.cash + cash_delta
            )));
        }

        self.roll_day(fill.at);

        if let Some(r) = self.reservations.get_mut(&fill.order_id) {
            r.quantity = (r.quantity - fill.quantity).max(Decimal::ZERO);
        }

        self.cash += cash_delta;
        let position = self
            .positions
            .entry(fill.market_id.clone())
            .or_insert_with(|| Position::flat(fill.market_id.clone()));
        let realized = position.apply(fill.side, fill.quantity, fill.price);
        self.applied_fills.insert(fill.fill_id.clone());

        info!(
            fill_id = %fill.fill_id,
            order_id = %fill.order_id,
            market = %fill.market_id,
            side = %fill.side,
            price = %fill.price,
            quantity = %fill.quantity,
            %realized,
            "Fill applied"
        );
        Ok(position.clone())
    }

    /// Update the mark price of an open position.
    pub fn mark(&mut self, market_id: &MarketId, price: Decimal, at: DateTime<Utc>) {
        self.roll_day(at);
        if let Some(position) = self.positions.get_mut(market_id) {
            position.mark_price = Some(price);
        }
    }

    /// Read-only snapshot. A day boundary crossed since the last event is
    /// reflected without mutating the ledger.
    pub fn snapshot(&self, now: DateTime<Utc>) -> PortfolioSnapshot {
        let equity = self.equity();
        let (day, daily_loss) = if now.date_naive() > self.day {
            (now.date_naive(), Decimal::ZERO)
        } else {
            (self.day, self.daily_loss())
        };

        let mut reserved_by_market: BTreeMap<MarketId, Decimal> = BTreeMap::new();
        for r in self.reservations.values() {
            *reserved_by_market.entry(r.market_id.clone()).or_default() += r.notional();
        }

        let positions: Vec<Position> = self.positions.values().cloned().collect();
        PortfolioSnapshot {
            taken_at: now,
            day,
            cash: self.cash,
            equity,
            reserved_notional: self.reservations.values().map(Reservation::notional).sum(),
            reserved_loss: self.reservations.values().map(Reservation::worst_case_loss).sum(),
            reserved_by_market,
            daily_loss,
            realized_pnl: positions.iter().map(|p| p.realized_pnl).sum(),
            unrealized_pnl: positions.iter().map(Position::unrealized_pnl).sum(),
            positions,
        }
    }

    /// Return on starting capital.
    pub fn total_return(&self) -> Decimal {
        safe_div(self.equity() - self.starting_cash, self.starting_cash)
    }
}
