use thiserror::Error;

const BPS_DENOMINATOR: i128 = 10_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PriceValidationError {
    /// Allocation quantities are debits and must be strictly negative.
    #[error("content price must be a strictly negative debit, got {0}")]
    NotADebit(i64),

    #[error("content price must be non-negative, got {0}")]
    NegativePrice(i64),

    #[error(
        "requested price {requested} for content is outside of acceptable interval \
         [{lower}, {upper}] around canonical price {canonical}"
    )]
    OutOfRange {
        requested: i64,
        canonical: i64,
        lower: i64,
        upper: i64,
    },

    #[error("canonical price for {0} is unknown")]
    CanonicalPriceMissing(String),
}

/// Accepts an asserted price within a basis-point band around the catalog's
/// canonical price.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriceValidator {
    lower_bound_bps: u32,
    upper_bound_bps: u32,
}

impl Default for PriceValidator {
    fn default() -> Self {
        Self {
            lower_bound_bps: 9_500,
            upper_bound_bps: 10_500,
        }
    }
}

impl PriceValidator {
    pub fn new(lower_bound_bps: u32, upper_bound_bps: u32) -> Self {
        let (lower, upper) = if lower_bound_bps <= upper_bound_bps {
            (lower_bound_bps, upper_bound_bps)
        } else {
            (upper_bound_bps, lower_bound_bps)
        };
        Self {
            lower_bound_bps: lower,
            upper_bound_bps: upper,
        }
    }

    /// Converts an API-boundary debit (`< 0`) into a positive price.
    pub fn debit_to_price(quantity: i64) -> Result<i64, PriceValidationError> {
        if quantity >= 0 {
            return Err(PriceValidationError::NotADebit(quantity));
        }
        quantity
            .checked_neg()
            .ok_or(PriceValidationError::NotADebit(quantity))
    }

    /// Inclusive `[lower, upper]` cents: floor of the lower edge, ceiling of
    /// the upper one.
    pub fn interval(&self, canonical: i64) -> (i64, i64) {
        let c = i128::from(canonical);
        let lower = c * i128::from(self.lower_bound_bps) / BPS_DENOMINATOR;
        let upper_num = c * i128::from(self.upper_bound_bps);
        let upper = (upper_num + BPS_DENOMINATOR - 1) / BPS_DENOMINATOR;
        (clamp_i64(lower), clamp_i64(upper))
    }

    pub fn validate(&self, requested: i64, canonical: i64) -> Result<(), PriceValidationError> {
        if requested < 0 {
            return Err(PriceValidationError::NegativePrice(requested));
        }
        if canonical < 0 {
            return Err(PriceValidationError::NegativePrice(canonical));
        }

        let (lower, upper) = self.interval(canonical);
        if requested < lower || requested > upper {
            return Err(PriceValidationError::OutOfRange {
                requested,
                canonical,
                lower,
                upper,
            });
        }
        Ok(())
    }
}

fn clamp_i64(v: i128) -> i64 {
    v.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn band_edges_are_inclusive() {
        let v = PriceValidator::default();
        assert_eq!(v.interval(100), (95, 105));
        assert!(v.validate(95, 100).is_ok());
        assert!(v.validate(105, 100).is_ok());
        assert!(v.validate(94, 100).is_err());
        assert!(v.validate(106, 100).is_err());
    }

    #[test]
    fn five_x_overstatement_is_rejected() {
        let v = PriceValidator::default();
        let err = v.validate(1000, 200).unwrap_err();
        assert!(matches!(err, PriceValidationError::OutOfRange { lower: 190, upper: 210, .. }));
        assert!(err.to_string().contains("outside of acceptable interval"));
    }

    #[test]
    fn zero_and_positive_quantities_are_not_debits() {
        assert_eq!(
            PriceValidator::debit_to_price(0),
            Err(PriceValidationError::NotADebit(0))
        );
        assert!(PriceValidator::debit_to_price(250).is_err());
        assert_eq!(PriceValidator::debit_to_price(-250), Ok(250));
        assert!(PriceValidator::debit_to_price(i64::MIN).is_err());
    }

    #[test]
    fn inverted_bounds_are_normalised() {
        let v = PriceValidator::new(10_500, 9_500);
        assert_eq!(v, PriceValidator::default());
    }

    proptest! {
        #[test]
        fn canonical_price_always_validates(canonical in 0i64..10_000_000_00) {
            prop_assert!(PriceValidator::default().validate(canonical, canonical).is_ok());
        }

        #[test]
        fn accepted_prices_stay_within_five_percent_plus_rounding(
            canonical in 1i64..1_000_000,
            requested in 0i64..2_000_000,
        ) {
            let ok = PriceValidator::default().validate(requested, canonical).is_ok();
            let diff = (requested - canonical).abs() as i128 * 10_000;
            if ok {
                // ceil/floor may admit at most one extra cent beyond the exact band
                prop_assert!(diff <= canonical as i128 * 500 + 10_000);
            }
            if diff <= canonical as i128 * 500 {
                prop_assert!(ok);
            }
        }
    }
}
