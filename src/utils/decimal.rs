//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;

/// Round down to a size increment (lot size or contract value).
///
/// Order sizes must never round up: an upsized order can exceed available
/// balance or book liquidity.
pub fn round_down_to(value: Decimal, increment: Decimal) -> Decimal {
    if increment == Decimal::ZERO {
        return value;
    }
    (value / increment).floor() * increment
}

/// Round to the nearest tick (price granularity).
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).round() * tick_size
}

/// Number of whole contracts covering `size` units of underlying.
pub fn whole_contracts(size: Decimal, contract_value: Decimal) -> Decimal {
    if contract_value == Decimal::ZERO {
        return Decimal::ZERO;
    }
    (size / contract_value).round()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_down_to() {
        assert_eq!(round_down_to(dec!(1.567), dec!(0.001)), dec!(1.567));
        assert_eq!(round_down_to(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(round_down_to(dec!(1.567), dec!(0.1)), dec!(1.5));
        // Contract-value granularity
        assert_eq!(round_down_to(dec!(0.37), dec!(0.1)), dec!(0.3));
    }

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(dec!(50123.456), dec!(0.01)), dec!(50123.46));
        assert_eq!(round_to_tick(dec!(50123.456), dec!(0.10)), dec!(50123.50));
    }

    #[test]
    fn test_whole_contracts() {
        assert_eq!(whole_contracts(dec!(0.31), dec!(0.1)), dec!(3));
        assert_eq!(whole_contracts(dec!(0.35), dec!(0.1)), dec!(4));
        assert_eq!(whole_contracts(dec!(1), Decimal::ZERO), Decimal::ZERO);
    }
}
