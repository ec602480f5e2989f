//! Pluggable signal strategies.
//!
//! A strategy looks at one market and its latest quote and may propose a
//! direction with a fair probability estimate. Edge, sizing and filtering
//! are the scanner's job.

use crate::config::{ModelProbability, ScannerConfig, StrategyKind};
use crate::exchange::{Market, MarketId, Quote, Side};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

/// A directional view on one market.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub direction: Side,
    /// Estimated probability of YES
    pub fair_probability: Decimal,
    /// 0-1, scales position size
    pub confidence: Decimal,
}

pub trait SignalStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn signal(&self, market: &Market, quote: &Quote) -> Option<Signal>;
}

/// Trades toward externally supplied model probabilities.
///
/// Buys when the model is above the ask, sells when it is below the bid.
pub struct ModelEdgeStrategy {
    models: HashMap<MarketId, ModelProbability>,
}

impl ModelEdgeStrategy {
    pub fn new(models: &[ModelProbability]) -> Self {
        Self {
            models: models
                .iter()
                .map(|m| (MarketId::new(m.market_id.clone()), m.clone()))
                .collect(),
        }
    }
}

impl SignalStrategy for ModelEdgeStrategy {
    fn name(&self) -> &'static str {
        "model_edge"
    }

    fn signal(&self, market: &Market, quote: &Quote) -> Option<Signal> {
        let model = self.models.get(&market.id)?;

        let direction = if model.probability > quote.ask {
            Side::Buy
        } else if model.probability < quote.bid {
            Side::Sell
        } else {
            return None;
        };

        Some(Signal {
            direction,
            fair_probability: model.probability,
            confidence: model.confidence,
        })
    }
}

/// Follows strong crowd conviction on liquid markets.
///
/// A market priced above 0.75 is expected to firm up toward 0.90 (and
/// symmetrically below 0.25 toward 0.10). Markets already past the target
/// produce no signal.
pub struct ConvictionStrategy {
    min_volume: Decimal,
    upper_band: Decimal,
    upper_target: Decimal,
    lower_band: Decimal,
    lower_target: Decimal,
    confidence: Decimal,
}

impl ConvictionStrategy {
    pub fn new(min_volume: Decimal) -> Self {
        Self {
            min_volume,
            upper_band: dec!(0.75),
            upper_target: dec!(0.90),
            lower_band: dec!(0.25),
            lower_target: dec!(0.10),
            confidence: dec!(0.7),
        }
    }
}

impl SignalStrategy for ConvictionStrategy {
    fn name(&self) -> &'static str {
        "conviction"
    }

    fn signal(&self, market: &Market, quote: &Quote) -> Option<Signal> {
        if market.volume_24h <= self.min_volume {
            return None;
        }

        let mid = quote.mid();
        let (direction, fair_probability) = if mid > self.upper_band && mid < self.upper_target {
            (Side::Buy, self.upper_target)
        } else if mid < self.lower_band && mid > self.lower_target {
            (Side::Sell, self.lower_target)
        } else {
            return None;
        };

        Some(Signal {
            direction,
            fair_probability,
            confidence: self.confidence,
        })
    }
}

/// Build the configured strategy.
pub fn strategy_from_config(config: &ScannerConfig) -> Box<dyn SignalStrategy> {
    match config.strategy {
        StrategyKind::Model => Box::new(ModelEdgeStrategy::new(&config.models)),
        StrategyKind::Conviction => Box::new(ConvictionStrategy::new(config.min_volume)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn market(id: &str, volume: Decimal) -> Market {
        Market {
            id: MarketId::from(id),
            question: "q".to_string(),
            resolution_date: None,
            probability: dec!(0.5),
            volume_24h: volume,
            categories: Vec::new(),
        }
    }

    fn quote(id: &str, bid: Decimal, ask: Decimal) -> Quote {
        Quote {
            market_id: MarketId::from(id),
            bid,
            ask,
            sequence: 1,
            remote_timestamp: None,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_model_edge_direction() {
        let strategy = ModelEdgeStrategy::new(&[ModelProbability {
            market_id: "m1".to_string(),
            probability: dec!(0.60),
            confidence: dec!(0.8),
        }]);
        let m = market("m1", dec!(1000000));

        let buy = strategy.signal(&m, &quote("m1", dec!(0.50), dec!(0.52))).unwrap();
        assert_eq!(buy.direction, Side::Buy);
        assert_eq!(buy.confidence, dec!(0.8));

        let sell = strategy.signal(&m, &quote("m1", dec!(0.66), dec!(0.68))).unwrap();
        assert_eq!(sell.direction, Side::Sell);

        assert!(strategy.signal(&m, &quote("m1", dec!(0.58), dec!(0.62))).is_none());
        assert!(strategy
            .signal(&market("m2", dec!(1000000)), &quote("m2", dec!(0.1), dec!(0.2)))
            .is_none());
    }

    #[test]
    fn test_conviction_bands() {
        let strategy = ConvictionStrategy::new(dec!(100000));
        let liquid = market("m1", dec!(2500000));

        let up = strategy.signal(&liquid, &quote("m1", dec!(0.76), dec!(0.78))).unwrap();
        assert_eq!(up.direction, Side::Buy);
        assert_eq!(up.fair_probability, dec!(0.90));
        assert_eq!(up.confidence, dec!(0.7));

        let down = strategy.signal(&liquid, &quote("m1", dec!(0.21), dec!(0.23))).unwrap();
        assert_eq!(down.direction, Side::Sell);

        assert!(strategy.signal(&liquid, &quote("m1", dec!(0.50), dec!(0.52))).is_none());
        assert!(strategy.signal(&liquid, &quote("m1", dec!(0.94), dec!(0.96))).is_none());
        assert!(strategy
            .signal(&market("m1", dec!(50000)), &quote("m1", dec!(0.76), dec!(0.78)))
            .is_none());
    }
}
