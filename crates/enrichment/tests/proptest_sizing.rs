use enrichment::sizing::{percent_of_balance_lots, BalanceRisk, MAX_LOTS};
use proptest::prelude::*;

proptest! {
    /// Any computable size stays within the venue minimum and the hard cap.
    #[test]
    fn percent_of_balance_is_bounded(
        balance in 1.0f64..10_000_000.0,
        leverage in 1.0f64..1_000.0,
        risk_percent in 0.01f64..100.0,
        price in 0.0001f64..100_000.0,
        min_lot in prop_oneof![Just(0.01f64), Just(0.1f64), Just(1.0f64)],
    ) {
        let lots = percent_of_balance_lots(&BalanceRisk {
            balance,
            leverage,
            risk_percent,
            reference_price: price,
            contract_multiplier: 100.0,
            instrument_min_lot: min_lot,
        })
        .unwrap();
        prop_assert!(lots >= min_lot - 1e-9);
        prop_assert!(lots <= MAX_LOTS);
    }

    /// More balance never buys a smaller position.
    #[test]
    fn size_is_monotonic_in_balance(
        balance in 100.0f64..1_000_000.0,
        extra in 0.0f64..1_000_000.0,
        price in 1.0f64..5_000.0,
    ) {
        let size = |b: f64| {
            percent_of_balance_lots(&BalanceRisk {
                balance: b,
                leverage: 100.0,
                risk_percent: 1.0,
                reference_price: price,
                contract_multiplier: 100.0,
                instrument_min_lot: 0.01,
            })
            .unwrap()
        };
        prop_assert!(size(balance + extra) >= size(balance));
    }

    #[test]
    fn non_positive_balance_is_an_error(balance in -1_000.0f64..=0.0) {
        let result = percent_of_balance_lots(&BalanceRisk {
            balance,
            leverage: 100.0,
            risk_percent: 1.0,
            reference_price: 2000.0,
            contract_multiplier: 100.0,
            instrument_min_lot: 0.01,
        });
        prop_assert!(result.is_err());
    }
}
