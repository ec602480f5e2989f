//! Opportunity scanner: quotes in, ranked trade candidates out.

use super::signals::SignalStrategy;
use crate::config::ScannerConfig;
use crate::exchange::{MarketId, OpportunityId, QuoteBoard, Side};
use crate::portfolio::{worst_case_loss, PortfolioSnapshot};
use crate::utils::{round_down_to_lot, safe_div};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, instrument, trace};

/// Share quantity precision.
pub const LOT_SIZE: Decimal = dec!(0.01);

/// A candidate trade. Immutable and consumed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: OpportunityId,
    pub market_id: MarketId,
    pub question: String,
    pub direction: Side,
    pub entry_price: Decimal,
    pub fair_probability: Decimal,
    /// Expected gain per share in probability points
    pub edge: Decimal,
    pub suggested_notional: Decimal,
    pub confidence: Decimal,
    pub strategy: String,
    pub resolution_date: Option<DateTime<Utc>>,
    pub quote_sequence: u64,
    pub generated_at: DateTime<Utc>,
}

impl Opportunity {
    /// Shares bought or sold at the entry price, rounded down to the lot size.
    pub fn quantity(&self) -> Decimal {
        round_down_to_lot(safe_div(self.suggested_notional, self.entry_price), LOT_SIZE)
    }

    pub fn worst_case_loss(&self) -> Decimal {
        worst_case_loss(self.direction, self.entry_price, self.quantity())
    }
}

/// Scans the quote board for mispriced markets.
pub struct OpportunityScanner {
    config: ScannerConfig,
    strategy: Box<dyn SignalStrategy>,
}

impl OpportunityScanner {
    pub fn new(config: ScannerConfig, strategy: Box<dyn SignalStrategy>) -> Self {
        Self { config, strategy }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Produce opportunities ranked by edge, then by earliest resolution.
    #[instrument(skip_all, fields(strategy = self.strategy.name(), markets = board.len()))]
    pub fn scan(
        &self,
        board: &QuoteBoard,
        portfolio: &PortfolioSnapshot,
        now: DateTime<Utc>,
    ) -> Vec<Opportunity> {
        let max_age = Duration::seconds(self.config.max_quote_age_secs as i64);
        let mut opportunities = Vec::new();

        for entry in board.iter() {
            let market = &entry.market;
            let quote = &entry.quote;

            if portfolio.has_reservation(&market.id) {
                trace!(market = %market.id, "Skipping market with order in flight");
                continue;
            }
            if market.volume_24h < self.config.min_volume {
                trace!(market = %market.id, volume = %market.volume_24h, "Skipping low volume market");
                continue;
            }
            if market.is_resolved_at(now) {
                trace!(market = %market.id, "Skipping resolved market");
                continue;
            }
            if now - quote.received_at > max_age {
                trace!(market = %market.id, "Skipping stale quote");
                continue;
            }

            let Some(signal) = self.strategy.signal(market, quote) else {
                continue;
            };

            let entry_price = quote.entry_price(signal.direction);
            let edge = (signal.fair_probability - entry_price) * signal.direction.sign();
            if edge < self.config.min_edge {
                trace!(market = %market.id, %edge, "Edge below threshold");
                continue;
            }

            let notional = (self.config.base_notional * signal.confidence)
                .min(self.config.max_notional)
                .round_dp(2);
            if notional <= Decimal::ZERO {
                continue;
            }

            opportunities.push(Opportunity {
                id: OpportunityId::new(format!(
                    "opp-{}-{}-{}",
                    market.id, quote.sequence, signal.direction
                )),
                market_id: market.id.clone(),
                question: market.question.clone(),
                direction: signal.direction,
                entry_price,
                fair_probability: signal.fair_probability,
                edge,
                suggested_notional: notional,
                confidence: signal.confidence,
                strategy: self.strategy.name().to_string(),
                resolution_date: market.resolution_date,
                quote_sequence: quote.sequence,
                generated_at: now,
            });
        }

        opportunities.sort_by(rank);
        debug!(count = opportunities.len(), "Scan complete");
        opportunities
    }
}

/// Larger edge first, then earlier resolution (undated last), then market id.
fn rank(a: &Opportunity, b: &Opportunity) -> Ordering {
    b.edge
        .cmp(&a.edge)
        .then_with(|| match (a.resolution_date, b.resolution_date) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.market_id.cmp(&b.market_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelProbability;
    use crate::exchange::{Market, OrderId, Quote};
    use crate::portfolio::{PositionLedger, Reservation};
    use crate::strategy::signals::ModelEdgeStrategy;
    use chrono::TimeZone;

    fn entry(board: &mut QuoteBoard, id: &str, bid: Decimal, ask: Decimal, resolves: Option<DateTime<Utc>>, received: DateTime<Utc>) {
        let market = Market {
            id: MarketId::from(id),
            question: format!("Question {id}"),
            resolution_date: resolves,
            probability: (bid + ask) / dec!(2),
            volume_24h: dec!(1000000),
            categories: Vec::new(),
        };
        let quote = Quote {
            market_id: MarketId::from(id),
            bid,
            ask,
            sequence: 7,
            remote_timestamp: None,
            received_at: received,
        };
        board.insert(market, quote);
    }

    fn model(id: &str, p: Decimal) -> ModelProbability {
        ModelProbability {
            market_id: id.to_string(),
            probability: p,
            confidence: dec!(0.5),
        }
    }

    fn scanner(models: &[ModelProbability]) -> OpportunityScanner {
        let config = ScannerConfig {
            min_edge: dec!(0.05),
            base_notional: dec!(80),
            max_notional: dec!(250),
            ..ScannerConfig::default()
        };
        OpportunityScanner::new(config, Box::new(ModelEdgeStrategy::new(models)))
    }

    #[test]
    fn test_ranking_and_filtering() {
        let now = Utc::now();
        let soon = Some(now + Duration::days(10));
        let later = Some(now + Duration::days(90));
        let mut board = QuoteBoard::new();
        entry(&mut board, "a", dec!(0.40), dec!(0.42), later, now);
        entry(&mut board, "b", dec!(0.40), dec!(0.42), soon, now);
        entry(&mut board, "c", dec!(0.30), dec!(0.32), None, now);
        entry(&mut board, "d", dec!(0.50), dec!(0.52), None, now);

        let scanner = scanner(&[
            model("a", dec!(0.52)),
            model("b", dec!(0.52)),
            model("c", dec!(0.50)),
            model("d", dec!(0.55)), // edge 0.03, below threshold
        ]);
        let portfolio = PositionLedger::new(dec!(1000), now).snapshot(now);

        let opps = scanner.scan(&board, &portfolio, now);
        let ids: Vec<&str> = opps.iter().map(|o| o.market_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        let top = &opps[0];
        assert_eq!(top.direction, Side::Buy);
        assert_eq!(top.entry_price, dec!(0.32));
        assert_eq!(top.edge, dec!(0.18));
        assert_eq!(top.suggested_notional, dec!(40));
        assert_eq!(top.id.as_str(), "opp-c-7-buy");
        assert_eq!(top.quantity(), dec!(125));
    }

    #[test]
    fn test_sell_signal_uses_bid() {
        let now = Utc::now();
        let mut board = QuoteBoard::new();
        entry(&mut board, "a", dec!(0.70), dec!(0.72), None, now);
        let opps = scanner(&[model("a", dec!(0.60))]).scan(
            &board,
            &PositionLedger::new(dec!(1000), now).snapshot(now),
            now,
        );

        assert_eq!(opps[0].direction, Side::Sell);
        assert_eq!(opps[0].entry_price, dec!(0.70));
        assert_eq!(opps[0].edge, dec!(0.10));
    }

    #[test]
    fn test_skips_reserved_resolved_and_stale() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let mut board = QuoteBoard::new();
        entry(&mut board, "reserved", dec!(0.40), dec!(0.42), None, now);
        entry(&mut board, "resolved", dec!(0.40), dec!(0.42), Some(now - Duration::hours(1)), now);
        entry(&mut board, "stale", dec!(0.40), dec!(0.42), None, now - Duration::hours(2));
        entry(&mut board, "fresh", dec!(0.40), dec!(0.42), None, now);

        let mut ledger = PositionLedger::new(dec!(1000), now);
        ledger
            .reserve(
                Reservation {
                    order_id: OrderId::from("o1"),
                    market_id: MarketId::from("reserved"),
                    side: Side::Buy,
                    price: dec!(0.42),
                    quantity: dec!(10),
                },
                now,
            )
            .unwrap();

        let models: Vec<_> = ["reserved", "resolved", "stale", "fresh"]
            .iter()
            .map(|id| model(id, dec!(0.60)))
            .collect();
        let opps = scanner(&models).scan(&board, &ledger.snapshot(now), now);

        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].market_id.as_str(), "fresh");
    }

    #[test]
    fn test_scan_is_deterministic() {
        let now = Utc::now();
        let mut board = QuoteBoard::new();
        entry(&mut board, "a", dec!(0.40), dec!(0.42), None, now);
        let scanner = scanner(&[model("a", dec!(0.60))]);
        let portfolio = PositionLedger::new(dec!(1000), now).snapshot(now);

        assert_eq!(
            scanner.scan(&board, &portfolio, now),
            scanner.scan(&board, &portfolio, now)
        );
    }
}
