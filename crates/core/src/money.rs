//! Decimal money helpers.
//!
//! Amounts are `rust_decimal::Decimal` in the organization's currency. Values
//! that get stored (tax, totals, cost basis) are rounded to two places with
//! midpoint-away-from-zero, the way a till rounds.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{DomainError, DomainResult};

pub const MONEY_SCALE: u32 = 2;

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

fn overflow(what: &str) -> DomainError {
    DomainError::validation(format!("{what} is out of range"))
}

/// `amount * percent / 100`, rounded.
pub fn percent_of(amount: Decimal, percent: Decimal) -> DomainResult<Decimal> {
    amount
        .checked_mul(percent)
        .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
        .map(round_money)
        .ok_or_else(|| overflow("percentage amount"))
}

/// `unit_price * quantity`, rounded.
pub fn line_amount(unit_price: Decimal, quantity: i64) -> DomainResult<Decimal> {
    unit_price
        .checked_mul(Decimal::from(quantity))
        .map(round_money)
        .ok_or_else(|| overflow("line amount"))
}

/// Sum of amounts, failing instead of overflowing.
pub fn sum_money(amounts: impl IntoIterator<Item = Decimal>) -> DomainResult<Decimal> {
    amounts
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v))
        .ok_or_else(|| overflow("total"))
}
