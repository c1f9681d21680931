//! Fixed-point money. USDC uses 6-decimal fixed-point on-chain (§6); every
//! amount in this crate is carried as whole "micros" (1 USDC = 1_000_000
//! micros) rather than a float, so settlement math never drifts.

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MICROS_PER_UNIT: u64 = 1_000_000;
pub const PLATFORM_FEE_BPS: u32 = 1_500;
pub const BPS_DENOMINATOR: u32 = 10_000;

#[derive(Debug, Error)]
pub enum AmountError {
    #[error("amount overflow")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(pub u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub fn micros(self) -> u64 {
        self.0
    }

    /// Build an amount from a unit value and an hourly rate (both already
    /// in micros) times elapsed hours, rounding to the nearest micro — the
    /// 6-decimal rounding the design's billing ticker requires.
    pub fn from_rate_and_hours(hourly_rate_micros: u64, hours: f64) -> Self {
        let value = (hourly_rate_micros as f64) * hours;
        Self(value.round() as u64)
    }

    pub fn checked_add(self, other: Amount) -> Result<Amount, AmountError> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or(AmountError::Overflow)
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Split a gross amount into (node_share, platform_fee) using the
    /// configured basis-points platform fee (§4.B): `node_share = amount *
    /// (1 - fee_bps / 10_000)`, `platform_fee = amount - node_share`.
    pub fn split_fee(self, fee_bps: u32) -> (Amount, Amount) {
        let fee_bps = fee_bps.min(BPS_DENOMINATOR);
        let platform_fee = (self.0 as u128 * fee_bps as u128 / BPS_DENOMINATOR as u128) as u64;
        let node_share = self.0.saturating_sub(platform_fee);
        (Amount(node_share), Amount(platform_fee))
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.0 / MICROS_PER_UNIT,
            self.0 % MICROS_PER_UNIT
        )
    }
}
