use std::{collections::HashMap, sync::Arc};

use shared::domain::{BillingPeriod, PlanIntent, PlanTier, Pricing};
use thiserror::Error;

pub const DEFAULT_ANNUAL_DISCOUNT_RATE: f64 = 0.16;
pub const DEFAULT_MINIMUM_SEATS: u32 = 1;

pub trait PriceSource: Send + Sync {
    fn unit_price(&self, tier: PlanTier) -> Option<f64>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceBook {
    unit_prices: HashMap<PlanTier, f64>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self {
            unit_prices: HashMap::new(),
        }
    }

    pub fn with_price(mut self, tier: PlanTier, unit_price: f64) -> Self {
        self.unit_prices.insert(tier, unit_price);
        self
    }
}

impl Default for PriceBook {
    fn default() -> Self {
        Self::new()
            .with_price(PlanTier::Standard, 40.0)
            .with_price(PlanTier::Premium, 90.0)
    }
}

impl PriceSource for PriceBook {
    fn unit_price(&self, tier: PlanTier) -> Option<f64> {
        self.unit_prices.get(&tier).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PricingError {
    #[error("no unit price configured for tier '{0}'")]
    UnknownTier(PlanTier),
    #[error("seat count {seat_count} is below the minimum of {minimum}")]
    SeatCountBelowMinimum { seat_count: u32, minimum: u32 },
}

#[derive(Clone)]
pub struct Pricer {
    source: Arc<dyn PriceSource>,
    annual_discount_rate: f64,
    minimum_seats: u32,
}

impl Pricer {
    pub fn new(source: Arc<dyn PriceSource>) -> Self {
        Self {
            source,
            annual_discount_rate: DEFAULT_ANNUAL_DISCOUNT_RATE,
            minimum_seats: DEFAULT_MINIMUM_SEATS,
        }
    }

    pub fn with_annual_discount_rate(mut self, rate: f64) -> Self {
        self.annual_discount_rate = rate;
        self
    }

    pub fn with_minimum_seats(mut self, minimum_seats: u32) -> Self {
        self.minimum_seats = minimum_seats;
        self
    }

    pub fn quote(&self, intent: &PlanIntent) -> Result<Pricing, PricingError> {
        if intent.seat_count < self.minimum_seats {
            return Err(PricingError::SeatCountBelowMinimum {
                seat_count: intent.seat_count,
                minimum: self.minimum_seats,
            });
        }
        let unit_price = self
            .source
            .unit_price(intent.tier)
            .ok_or(PricingError::UnknownTier(intent.tier))?;

        let subtotal = unit_price * f64::from(intent.seat_count);
        let discount = match intent.billing_period {
            BillingPeriod::Annual => subtotal * self.annual_discount_rate,
            BillingPeriod::Monthly => 0.0,
        };
        Ok(Pricing {
            subtotal,
            discount,
            total: round2(subtotal - discount),
        })
    }
}

impl Default for Pricer {
    fn default() -> Self {
        Self::new(Arc::new(PriceBook::default()))
    }
}

/// Rounds to cents, halves away from zero.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
