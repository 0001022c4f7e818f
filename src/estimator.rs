//! # Profit Estimator
//!
//! Pure, deterministic viability model for a candidate arbitrage. Every
//! monetary term is computed in reference-currency notional with fixed-point
//! arithmetic; equal inputs yield bit-for-bit equal outputs. Floating point
//! appears only in the confidence score, which ranks but never admits.

use ethers::types::U256;
use serde::{Deserialize, Serialize};

use crate::precision::{
    PreciseDecimal, PrecisionError, SignedDecimal, BPS_DENOMINATOR, NOTIONAL_PRECISION,
};

/// Slippage model coefficient: each leg contributes half of its
/// size-over-depth ratio.
const SLIPPAGE_K_BPS: u32 = 5_000;

const CONFIDENCE_FLOOR: f64 = 0.1;
const GAS_CEILING_FACTOR: f64 = 0.8;
const THIN_DEPTH_FACTOR: f64 = 0.6;
const THIN_MARGIN_FACTOR: f64 = 0.7;
/// Margin below which confidence is discounted, in bps.
const THIN_MARGIN_BPS: i64 = 50;
/// Depth multiple below which a venue is considered shallow for the size.
const DEPTH_MULTIPLE: u64 = 10;

const STRONG_BUY_BPS: u32 = 100;
const BUY_BPS: u32 = 50;

/// Tunables shared by every estimate in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimatorParams {
    /// Minimum net margin for a trade to be viable.
    pub min_margin_bps: u32,
    /// Cap on the modeled slippage fraction.
    pub max_slippage_bps: u32,
    /// Fraction of notional held back as a safety buffer.
    pub reserve_fraction_bps: u32,
}

impl Default for EstimatorParams {
    fn default() -> Self {
        Self {
            min_margin_bps: 25,
            max_slippage_bps: 10,
            reserve_fraction_bps: 0,
        }
    }
}

/// One candidate, fully priced. Amount-like fields are reference-currency
/// notional at [`NOTIONAL_PRECISION`]; `price_delta` is the relative spread
/// between the sell and buy venue prices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstimatorInput {
    pub price_delta: PreciseDecimal,
    pub trade_size: PreciseDecimal,
    pub gas_units: u64,
    pub gas_price_wei: U256,
    pub gas_ceiling_wei: U256,
    pub native_price: PreciseDecimal,
    pub provider_fee_bps: u32,
    pub buy_venue_fee_bps: u32,
    pub sell_venue_fee_bps: u32,
    pub depth_buy: PreciseDecimal,
    pub depth_sell: PreciseDecimal,
    pub params: EstimatorParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    StrongBuy,
    Buy,
    WeakBuy,
    Pass,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::StrongBuy => "strong_buy",
            Recommendation::Buy => "buy",
            Recommendation::WeakBuy => "weak_buy",
            Recommendation::Pass => "pass",
        }
    }
}

/// Full cost breakdown for one candidate. Embedded read-only into the
/// emitted `Opportunity`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfitEstimate {
    pub trade_size: PreciseDecimal,
    pub gross_profit: PreciseDecimal,
    pub gas_cost: PreciseDecimal,
    pub loan_fee: PreciseDecimal,
    pub venue_fees: PreciseDecimal,
    pub slippage: PreciseDecimal,
    pub reserve_buffer: PreciseDecimal,
    pub net_profit: SignedDecimal,
    pub net_margin_bps: i64,
    pub profitable: bool,
    pub confidence: f64,
    pub recommendation: Recommendation,
    /// Gas spend in native wei, used for budget admission checks.
    pub gas_cost_native_wei: U256,
    pub gas_units: u64,
}

/// A bps value expressed as a fixed-point fraction (`25` → `0.0025`).
fn bps_fraction(bps: u32) -> PreciseDecimal {
    let scale = U256::from(10).pow(U256::from(NOTIONAL_PRECISION));
    PreciseDecimal::new(
        U256::from(bps) * scale / U256::from(BPS_DENOMINATOR),
        NOTIONAL_PRECISION,
    )
}

/// Price a candidate. Pure: no I/O, no clocks, no global state.
pub fn estimate(input: &EstimatorInput) -> Result<ProfitEstimate, PrecisionError> {
    let size = input.trade_size.with_precision(NOTIONAL_PRECISION);

    let gross_profit = input
        .price_delta
        .with_precision(NOTIONAL_PRECISION)
        .checked_mul(&size)?;

    // Gas: units * price gives wei; rescale to native, then into reference.
    let gas_wei = U256::from(input.gas_units)
        .checked_mul(input.gas_price_wei)
        .ok_or(PrecisionError::Overflow("gas_cost"))?;
    let gas_native = PreciseDecimal::from_token_amount(gas_wei, 18, NOTIONAL_PRECISION);
    let gas_cost = gas_native.checked_mul(&input.native_price.with_precision(NOTIONAL_PRECISION))?;

    let loan_fee = size.mul_bps(input.provider_fee_bps)?;
    let venue_fees = size
        .mul_bps(input.buy_venue_fee_bps)?
        .checked_add(&size.mul_bps(input.sell_venue_fee_bps)?)?;

    // Two-leg impact model, capped at the configured maximum.
    let slip_buy = size
        .checked_div(&input.depth_buy.with_precision(NOTIONAL_PRECISION))?
        .mul_bps(SLIPPAGE_K_BPS)?;
    let slip_sell = size
        .checked_div(&input.depth_sell.with_precision(NOTIONAL_PRECISION))?
        .mul_bps(SLIPPAGE_K_BPS)?;
    let slip_fraction = slip_buy
        .checked_add(&slip_sell)?
        .min(bps_fraction(input.params.max_slippage_bps));
    let slippage = slip_fraction.checked_mul(&size)?;

    let reserve_buffer = size.mul_bps(input.params.reserve_fraction_bps)?;

    let total_costs = gas_cost
        .checked_add(&loan_fee)?
        .checked_add(&venue_fees)?
        .checked_add(&slippage)?
        .checked_add(&reserve_buffer)?;

    let net_profit = SignedDecimal::sub_unsigned(gross_profit, total_costs)?;
    let net_margin_bps = net_profit.margin_bps(&size)?;
    let profitable = net_profit.meets_margin_bps(&size, input.params.min_margin_bps)?;

    let recommendation = if net_profit.meets_margin_bps(&size, STRONG_BUY_BPS)? {
        Recommendation::StrongBuy
    } else if net_profit.meets_margin_bps(&size, BUY_BPS)? {
        Recommendation::Buy
    } else if profitable {
        Recommendation::WeakBuy
    } else {
        Recommendation::Pass
    };

    let mut confidence = 1.0_f64;
    if input.gas_price_wei > input.gas_ceiling_wei {
        confidence *= GAS_CEILING_FACTOR;
    }
    let min_depth = input.depth_buy.min(input.depth_sell);
    let depth_threshold = size
        .checked_mul(&PreciseDecimal::from_integer(DEPTH_MULTIPLE, NOTIONAL_PRECISION))?;
    if min_depth.with_precision(NOTIONAL_PRECISION) < depth_threshold {
        confidence *= THIN_DEPTH_FACTOR;
    }
    if net_margin_bps < THIN_MARGIN_BPS {
        confidence *= THIN_MARGIN_FACTOR;
    }
    confidence = confidence.max(CONFIDENCE_FLOOR);

    Ok(ProfitEstimate {
        trade_size: size,
        gross_profit,
        gas_cost,
        loan_fee,
        venue_fees,
        slippage,
        reserve_buffer,
        net_profit,
        net_margin_bps,
        profitable,
        confidence,
        recommendation,
        gas_cost_native_wei: gas_wei,
        gas_units: input.gas_units,
    })
}
