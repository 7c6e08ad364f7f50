//! Spend tracking for paid requests.
//!
//! Payments are settled in USDC, counted in atomic units (6 decimals).

use std::fmt;

/// Token amount in atomic units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Amount {
    atomic: u128,
    decimals: u8,
}

impl Amount {
    pub const USDC_DECIMALS: u8 = 6;

    pub const fn new(atomic: u128, decimals: u8) -> Self {
        Self { atomic, decimals }
    }

    /// USDC amount from atomic units.
    pub const fn usdc(atomic: u128) -> Self {
        Self::new(atomic, Self::USDC_DECIMALS)
    }

    /// Amount in atomic units.
    pub fn atomic(&self) -> u128 {
        self.atomic
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }
}

impl fmt::Display for Amount {
    /// Decimal form with at least two fraction digits, e.g. `0.01`, `1.50`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.decimals == 0 {
            return write!(f, "{}", self.atomic);
        }
        let Some(scale) = 10u128.checked_pow(u32::from(self.decimals)) else {
            return write!(f, "{}e-{}", self.atomic, self.decimals);
        };

        let whole = self.atomic / scale;
        let frac = format!(
            "{:0width$}",
            self.atomic % scale,
            width = usize::from(self.decimals)
        );
        let min_digits = usize::from(self.decimals).min(2);
        let trimmed = frac.trim_end_matches('0');
        let frac = if trimmed.len() < min_digits {
            &frac[..min_digits]
        } else {
            trimmed
        };
        write!(f, "{whole}.{frac}")
    }
}

/// Cumulative payments made by a client.
#[derive(Debug, Clone, Default)]
pub struct SpendTracker {
    total_atomic: u128,
    payment_count: u32,
    last: Option<Amount>,
}

impl SpendTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one settled payment.
    pub fn record(&mut self, amount: Amount) {
        self.total_atomic += amount.atomic();
        self.payment_count += 1;
        self.last = Some(amount);
    }

    /// Total paid, in USDC.
    pub fn total(&self) -> Amount {
        Amount::usdc(self.total_atomic)
    }

    /// Number of payments recorded.
    pub fn payment_count(&self) -> u32 {
        self.payment_count
    }

    /// Most recent payment.
    pub fn last(&self) -> Option<Amount> {
        self.last
    }

    /// Reset the tracker.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
