//! High-precision arithmetic for monetary calculations.
//!
//! Every admission decision and on-chain amount derivation goes through the
//! fixed-point types in this module. Floating point is allowed only for
//! ranking and confidence scoring, never for deciding whether capital moves.

use ethers::types::{I256, U256};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Display};
use thiserror::Error;

/// Fractional digits used for reference-currency notional values.
pub const NOTIONAL_PRECISION: u32 = 18;
/// Fractional digits for basis-point factors.
pub const BPS_PRECISION: u32 = 4;

pub const BPS_DENOMINATOR: u64 = 10_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrecisionError {
    #[error("Arithmetic overflow in {0}")]
    Overflow(&'static str),
    #[error("Division by zero in {0}")]
    DivisionByZero(&'static str),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Unsigned fixed-point decimal: a `U256` scaled by `10^precision`.
///
/// Token quantities are 256-bit, so the raw value is never narrowed; scaling
/// between precisions is exact when scaling up and truncating when scaling
/// down, which is the conservative direction for profit accounting.
/// Equality and ordering compare numeric value across precisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PreciseDecimal {
    value: U256,
    precision: u32,
}

impl PartialEq for PreciseDecimal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PreciseDecimal {}

impl PreciseDecimal {
    pub fn new(value: U256, precision: u32) -> Self {
        Self { value, precision }
    }

    pub fn zero(precision: u32) -> Self {
        Self::new(U256::zero(), precision)
    }

    pub fn from_integer(integer: u64, precision: u32) -> Self {
        let scale = U256::from(10).pow(U256::from(precision));
        Self::new(U256::from(integer) * scale, precision)
    }

    /// Build from a token amount in its native decimals, rescaled to the
    /// target precision.
    pub fn from_token_amount(amount: U256, token_decimals: u8, target_precision: u32) -> Self {
        let decimals = token_decimals as u32;
        if decimals == target_precision {
            Self::new(amount, target_precision)
        } else if decimals > target_precision {
            let down = U256::from(10).pow(U256::from(decimals - target_precision));
            Self::new(amount / down, target_precision)
        } else {
            let up = U256::from(10).pow(U256::from(target_precision - decimals));
            Self::new(amount.saturating_mul(up), target_precision)
        }
    }

    /// Parse a decimal string such as `"1.0030"` at the given precision.
    pub fn from_str_exact(s: &str, precision: u32) -> Result<Self, PrecisionError> {
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        if frac_part.len() as u32 > precision {
            return Err(PrecisionError::InvalidInput(format!(
                "`{}` has more than {} fractional digits",
                s, precision
            )));
        }
        let int = U256::from_dec_str(int_part)
            .map_err(|e| PrecisionError::InvalidInput(format!("`{}`: {}", s, e)))?;
        let frac = if frac_part.is_empty() {
            U256::zero()
        } else {
            U256::from_dec_str(frac_part)
                .map_err(|e| PrecisionError::InvalidInput(format!("`{}`: {}", s, e)))?
        };
        let scale = U256::from(10).pow(U256::from(precision));
        let frac_scale = U256::from(10).pow(U256::from(precision - frac_part.len() as u32));
        let value = int
            .checked_mul(scale)
            .and_then(|v| v.checked_add(frac * frac_scale))
            .ok_or(PrecisionError::Overflow("from_str_exact"))?;
        Ok(Self::new(value, precision))
    }

    pub fn raw(&self) -> U256 {
        self.value
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    /// Rescale to a token amount in the token's native decimals.
    pub fn to_token_amount(&self, token_decimals: u8) -> U256 {
        let decimals = token_decimals as u32;
        if self.precision == decimals {
            self.value
        } else if self.precision > decimals {
            let down = U256::from(10).pow(U256::from(self.precision - decimals));
            self.value / down
        } else {
            let up = U256::from(10).pow(U256::from(decimals - self.precision));
            self.value.saturating_mul(up)
        }
    }

    pub fn with_precision(&self, new_precision: u32) -> Self {
        if self.precision == new_precision {
            *self
        } else if self.precision < new_precision {
            let up = U256::from(10).pow(U256::from(new_precision - self.precision));
            Self::new(self.value.saturating_mul(up), new_precision)
        } else {
            let down = U256::from(10).pow(U256::from(self.precision - new_precision));
            Self::new(self.value / down, new_precision)
        }
    }

    fn normalized(a: &Self, b: &Self) -> (Self, Self) {
        let p = a.precision.max(b.precision);
        (a.with_precision(p), b.with_precision(p))
    }

    pub fn checked_add(&self, other: &Self) -> Result<Self, PrecisionError> {
        let (a, b) = Self::normalized(self, other);
        a.value
            .checked_add(b.value)
            .map(|v| Self::new(v, a.precision))
            .ok_or(PrecisionError::Overflow("add"))
    }

    pub fn checked_sub(&self, other: &Self) -> Result<Self, PrecisionError> {
        let (a, b) = Self::normalized(self, other);
        a.value
            .checked_sub(b.value)
            .map(|v| Self::new(v, a.precision))
            .ok_or(PrecisionError::Overflow("sub"))
    }

    pub fn checked_mul(&self, other: &Self) -> Result<Self, PrecisionError> {
        let (a, b) = Self::normalized(self, other);
        let scale = U256::from(10).pow(U256::from(a.precision));
        a.value
            .checked_mul(b.value)
            .map(|v| Self::new(v / scale, a.precision))
            .ok_or(PrecisionError::Overflow("mul"))
    }

    pub fn checked_div(&self, other: &Self) -> Result<Self, PrecisionError> {
        let (a, b) = Self::normalized(self, other);
        if b.value.is_zero() {
            return Err(PrecisionError::DivisionByZero("div"));
        }
        let scale = U256::from(10).pow(U256::from(a.precision));
        a.value
            .checked_mul(scale)
            .map(|v| Self::new(v / b.value, a.precision))
            .ok_or(PrecisionError::Overflow("div"))
    }

    /// Multiply by a basis-point factor: `self * bps / 10_000`. Exact.
    pub fn mul_bps(&self, bps: u32) -> Result<Self, PrecisionError> {
        self.value
            .checked_mul(U256::from(bps))
            .map(|v| Self::new(v / U256::from(BPS_DENOMINATOR), self.precision))
            .ok_or(PrecisionError::Overflow("mul_bps"))
    }

    /// `self / other` expressed in basis points, truncating.
    pub fn ratio_bps(&self, other: &Self) -> Result<u64, PrecisionError> {
        let (a, b) = Self::normalized(self, other);
        if b.value.is_zero() {
            return Err(PrecisionError::DivisionByZero("ratio_bps"));
        }
        let scaled = a
            .value
            .checked_mul(U256::from(BPS_DENOMINATOR))
            .ok_or(PrecisionError::Overflow("ratio_bps"))?;
        let ratio = scaled / b.value;
        if ratio > U256::from(u64::MAX) {
            return Err(PrecisionError::Overflow("ratio_bps"));
        }
        Ok(ratio.as_u64())
    }

    /// Lossy conversion for ranking and display only.
    pub fn to_f64_lossy(&self) -> f64 {
        let scale = 10_f64.powi(self.precision as i32);
        self.value.to_string().parse::<f64>().unwrap_or(0.0) / scale
    }
}

impl PartialOrd for PreciseDecimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PreciseDecimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = Self::normalized(self, other);
        a.value.cmp(&b.value)
    }
}

impl Display for PreciseDecimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scale = U256::from(10).pow(U256::from(self.precision));
        let int = self.value / scale;
        let frac = self.value % scale;
        write!(
            f,
            "{}.{:0>width$}",
            int,
            frac,
            width = self.precision as usize
        )
    }
}

/// Signed fixed-point decimal over `I256`, used where a quantity can go
/// negative (net profit, realized margin). Shares the scaling convention of
/// [`PreciseDecimal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDecimal {
    value: I256,
    precision: u32,
}

impl SignedDecimal {
    pub fn new(value: I256, precision: u32) -> Self {
        Self { value, precision }
    }

    pub fn zero(precision: u32) -> Self {
        Self::new(I256::zero(), precision)
    }

    pub fn from_unsigned(d: PreciseDecimal) -> Result<Self, PrecisionError> {
        let value = I256::checked_from_sign_and_abs(ethers::types::Sign::Positive, d.raw())
            .ok_or(PrecisionError::Overflow("from_unsigned"))?;
        Ok(Self::new(value, d.precision()))
    }

    /// `a - b` where both sides are unsigned; the result may be negative.
    pub fn sub_unsigned(a: PreciseDecimal, b: PreciseDecimal) -> Result<Self, PrecisionError> {
        let sa = Self::from_unsigned(a)?;
        let sb = Self::from_unsigned(b)?;
        if sa.precision != sb.precision {
            return Err(PrecisionError::InvalidInput(
                "precision mismatch in sub_unsigned".to_string(),
            ));
        }
        sa.value
            .checked_sub(sb.value)
            .map(|v| Self::new(v, sa.precision))
            .ok_or(PrecisionError::Overflow("sub_unsigned"))
    }

    pub fn raw(&self) -> I256 {
        self.value
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    pub fn is_negative(&self) -> bool {
        self.value.is_negative()
    }

    /// Exact predicate: `self / base >= threshold_bps / 10_000`, evaluated by
    /// cross-multiplication so it is reproducible bit-for-bit.
    pub fn meets_margin_bps(
        &self,
        base: &PreciseDecimal,
        threshold_bps: u32,
    ) -> Result<bool, PrecisionError> {
        let base = base.with_precision(self.precision);
        let base_signed = Self::from_unsigned(base)?;
        let lhs = self
            .value
            .checked_mul(I256::from(BPS_DENOMINATOR))
            .ok_or(PrecisionError::Overflow("meets_margin_bps"))?;
        let rhs = base_signed
            .value
            .checked_mul(I256::from(threshold_bps as u64))
            .ok_or(PrecisionError::Overflow("meets_margin_bps"))?;
        Ok(lhs >= rhs)
    }

    /// Margin over `base` in basis points, truncating toward zero.
    pub fn margin_bps(&self, base: &PreciseDecimal) -> Result<i64, PrecisionError> {
        let base = base.with_precision(self.precision);
        if base.is_zero() {
            return Err(PrecisionError::DivisionByZero("margin_bps"));
        }
        let base_signed = Self::from_unsigned(base)?;
        let scaled = self
            .value
            .checked_mul(I256::from(BPS_DENOMINATOR))
            .ok_or(PrecisionError::Overflow("margin_bps"))?;
        let ratio = scaled / base_signed.value;
        ratio
            .try_into()
            .map_err(|_| PrecisionError::Overflow("margin_bps"))
    }

    pub fn to_f64_lossy(&self) -> f64 {
        let scale = 10_f64.powi(self.precision as i32);
        self.value.to_string().parse::<f64>().unwrap_or(0.0) / scale
    }
}

impl Display for SignedDecimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (sign, abs) = self.value.into_sign_and_abs();
        let unsigned = PreciseDecimal::new(abs, self.precision);
        if sign == ethers::types::Sign::Negative {
            write!(f, "-{}", unsigned)
        } else {
            write!(f, "{}", unsigned)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let d = PreciseDecimal::from_str_exact("1.0030", 18).unwrap();
        assert_eq!(d.to_string(), "1.003000000000000000");
        let whole = PreciseDecimal::from_str_exact("42", 6).unwrap();
        assert_eq!(whole.raw(), U256::from(42_000_000u64));
    }

    #[test]
    fn mul_bps_is_exact() {
        let notional = PreciseDecimal::from_integer(10_000, 18);
        let fee = notional.mul_bps(25).unwrap();
        assert_eq!(fee, PreciseDecimal::from_str_exact("25", 18).unwrap());
    }

    #[test]
    fn token_amount_rescaling() {
        let raw = U256::from(1_500_000u64); // 1.5 at 6 decimals
        let d = PreciseDecimal::from_token_amount(raw, 6, 18);
        assert_eq!(d, PreciseDecimal::from_str_exact("1.5", 18).unwrap());
        assert_eq!(d.to_token_amount(6), raw);
    }

    #[test]
    fn signed_subtraction_goes_negative() {
        let gross = PreciseDecimal::from_integer(30, 18);
        let costs = PreciseDecimal::from_integer(60, 18);
        let net = SignedDecimal::sub_unsigned(gross, costs).unwrap();
        assert!(net.is_negative());
        assert_eq!(net.to_string(), "-30.000000000000000000");
    }

    #[test]
    fn margin_predicate_boundary() {
        let size = PreciseDecimal::from_integer(10_000, 18);
        // Exactly 25 bps of 10_000 = 25.
        let at = SignedDecimal::from_unsigned(PreciseDecimal::from_integer(25, 18)).unwrap();
        assert!(at.meets_margin_bps(&size, 25).unwrap());
        // 24.99 misses the threshold.
        let below = SignedDecimal::from_unsigned(
            PreciseDecimal::from_str_exact("24.99", 18).unwrap(),
        )
        .unwrap();
        assert!(!below.meets_margin_bps(&size, 25).unwrap());
    }

    #[test]
    fn margin_bps_truncates() {
        let size = PreciseDecimal::from_integer(10_000, 18);
        let net = SignedDecimal::from_unsigned(
            PreciseDecimal::from_str_exact("24.99", 18).unwrap(),
        )
        .unwrap();
        assert_eq!(net.margin_bps(&size).unwrap(), 24);
    }
}
