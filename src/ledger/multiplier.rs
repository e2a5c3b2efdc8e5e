use bigdecimal::{BigDecimal, RoundingMode};

/// 10000 basis points = 1.0x.
pub const BASIS_POINTS: u32 = 10_000;

/// Decimal exponent of [`BASIS_POINTS`].
const BASIS_POINTS_EXPONENT: i64 = 4;

/// Integer division by [`BASIS_POINTS`], truncating toward zero like Solidity does.
///
/// Dividing by a power of ten is a rescale, so this stays exact for any magnitude.
pub fn div_basis_points(value: &BigDecimal) -> BigDecimal {
    let (digits, scale) = value.as_bigint_and_exponent();
    BigDecimal::new(digits, scale + BASIS_POINTS_EXPONENT).with_scale_round(0, RoundingMode::Down)
}

/// Cumulative split multiplier in basis points.
///
/// Each split compounds as `m = m * ratio / BASIS_POINTS` with truncation, matching
/// the contract's own bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitMultiplier {
    basis_points: BigDecimal,
}

impl Default for SplitMultiplier {
    fn default() -> Self {
        Self::identity()
    }
}

impl SplitMultiplier {
    pub fn identity() -> Self {
        Self {
            basis_points: BigDecimal::from(BASIS_POINTS),
        }
    }

    /// Fold split ratios (basis points, block order) into the cumulative multiplier.
    pub fn from_splits<'a, I>(ratios: I) -> Self
    where
        I: IntoIterator<Item = &'a BigDecimal>,
    {
        ratios
            .into_iter()
            .fold(Self::identity(), |acc, ratio| acc.compound(ratio))
    }

    /// The multiplier after one more split with the given ratio.
    pub fn compound(&self, ratio: &BigDecimal) -> Self {
        Self {
            basis_points: div_basis_points(&(&self.basis_points * ratio)),
        }
    }

    pub fn basis_points(&self) -> &BigDecimal {
        &self.basis_points
    }

    /// Scale a raw balance into the balance holders see.
    pub fn to_display(&self, raw: &BigDecimal) -> BigDecimal {
        div_basis_points(&(raw * &self.basis_points))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_identity_leaves_balances_unchanged() {
        let m = SplitMultiplier::identity();
        assert_eq!(m.to_display(&dec("1500")), dec("1500"));
        assert_eq!(m.basis_points(), &dec("10000"));
    }

    #[test]
    fn test_two_for_one_doubles() {
        let m = SplitMultiplier::from_splits([&dec("20000")]);
        assert_eq!(m.basis_points(), &dec("20000"));
        assert_eq!(m.to_display(&dec("600")), dec("1200"));
        assert_eq!(m.to_display(&dec("900")), dec("1800"));
    }

    #[test]
    fn test_splits_compound_as_product() {
        // 2x then 1.5x = 3x
        let m = SplitMultiplier::from_splits([&dec("20000"), &dec("15000")]);
        assert_eq!(m.basis_points(), &dec("30000"));
        assert_eq!(m.to_display(&dec("7")), dec("21"));
    }

    #[test]
    fn test_compounding_truncates_each_step() {
        // 10000 * 3333 / 10000 = 3333, then 3333 * 30000 / 10000 = 9999
        let m = SplitMultiplier::from_splits([&dec("3333"), &dec("30000")]);
        assert_eq!(m.basis_points(), &dec("9999"));
    }

    #[test]
    fn test_display_truncates_like_solidity() {
        let m = SplitMultiplier::from_splits([&dec("15000")]);
        // 7 * 1.5 = 10.5 -> 10
        assert_eq!(m.to_display(&dec("7")), dec("10"));
        assert_eq!(m.to_display(&dec("1")), dec("1"));
        assert_eq!(m.to_display(&dec("0")), dec("0"));
    }

    #[test]
    fn test_large_supply_has_no_precision_loss() {
        // uint256 max
        let raw = dec("115792089237316195423570985008687907853269984665640564039457584007913129639935");
        let m = SplitMultiplier::from_splits([&dec("20000")]);
        assert_eq!(
            m.to_display(&raw),
            dec("231584178474632390847141970017375815706539969331281128078915168015826259279870")
        );
    }

    #[test]
    fn test_proportionality_survives_split() {
        let m = SplitMultiplier::from_splits([&dec("20000")]);
        let a_before = dec("600");
        let total_before = dec("1500");
        let a_after = m.to_display(&a_before);
        let total_after = m.to_display(&total_before);
        assert_eq!(&a_after * &total_before, &a_before * &total_after);
    }
}
