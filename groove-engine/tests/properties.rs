//! Property-based checks for the attribution and strategy math.

use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

use groove_engine::attribution::{
    AblationConfig, AblationStrategy, AggregationConfig, ConservativeAblation,
    ExponentialDecayCorrelator, SessionEvidence, TemporalConfig, TemporalCorrelator,
    ValueAggregator, combine_estimates,
};
use groove_engine::strategy::{StrategyVariant, StrategyWeights, thompson_select};
use groove_engine::{AdaptiveParam, LightweightEvent, LightweightSignal};

fn correlator(decay_rate: f64, max_distance: u32) -> ExponentialDecayCorrelator {
    ExponentialDecayCorrelator::new(TemporalConfig {
        decay_rate,
        max_distance,
    })
}

proptest! {
    #[test]
    fn decay_never_increases_with_distance(
        decay_rate in 0.01f64..3.0,
        max_distance in 0u32..50,
        d1 in 0u32..100,
        gap in 0u32..100,
    ) {
        let c = correlator(decay_rate, max_distance);
        let d2 = d1 + gap;
        prop_assert!(c.weight(d1) >= c.weight(d2));
        prop_assert!(c.weight(d1) <= 1.0);
    }

    #[test]
    fn decay_is_zero_past_cutoff(
        decay_rate in 0.01f64..3.0,
        max_distance in 0u32..50,
        beyond in 1u32..1000,
    ) {
        let c = correlator(decay_rate, max_distance);
        prop_assert_eq!(c.weight(max_distance + beyond), 0.0);
        prop_assert!(c.weight(max_distance) > 0.0);
    }

    #[test]
    fn closer_signal_never_scores_lower(
        activation in 0u32..20,
        near in 0u32..10,
        extra in 1u32..10,
        confidence in 0.0f64..=1.0,
    ) {
        let c = ExponentialDecayCorrelator::default();
        let signal = LightweightSignal::Positive { pattern: "thanks".into(), confidence };
        let at = |distance: u32| {
            c.correlate(
                &[activation],
                &[LightweightEvent::new("s", activation + distance).with_signal(signal.clone())],
            )
            .positive_score
        };
        prop_assert!(at(near) >= at(near + extra));
    }

    #[test]
    fn combined_value_stays_within_components(
        temporal_value in -1.0f64..=1.0,
        temporal_conf in 0.0f64..=1.0,
        ablation in proptest::option::of((-1.0f64..=1.0, 0.0f64..=1.0)),
        temporal_weight in 0.0f64..=1.0,
        ablation_weight in 0.0f64..=1.0,
    ) {
        let (value, confidence) = combine_estimates(
            (temporal_value, temporal_conf),
            ablation,
            temporal_weight,
            ablation_weight,
        );

        let (lo, hi) = match ablation {
            Some((a, _)) => (temporal_value.min(a), temporal_value.max(a)),
            None => (temporal_value, temporal_value),
        };
        prop_assert!(value >= lo - 1e-9 && value <= hi + 1e-9);
        prop_assert!((0.0..=1.0 + 1e-9).contains(&confidence));
    }

    #[test]
    fn attributed_value_is_bounded(
        activated in any::<bool>(),
        activation_confidence in 0.0f64..=1.0,
        net_temporal in -20.0f64..20.0,
        session_outcome in -1.0f64..=1.0,
        temporal_share in 0.0f64..=1.0,
    ) {
        let aggregator = ValueAggregator::new(AggregationConfig {
            temporal_share,
            ..Default::default()
        });
        let value = aggregator.attributed_value(&SessionEvidence {
            was_activated: activated,
            activation_confidence,
            net_temporal,
            session_outcome,
        });
        prop_assert!((-1.0..=1.0).contains(&value));
        if !activated {
            prop_assert_eq!(value, 0.0);
        }
    }

    #[test]
    fn thompson_always_returns_a_known_variant(
        means in proptest::collection::vec(0.01f64..0.99, 0..=4),
        seed in any::<u64>(),
    ) {
        let weights: StrategyWeights = StrategyVariant::ALL
            .into_iter()
            .zip(means)
            .map(|(variant, mean)| (variant, AdaptiveParam::from_mean(mean, 10.0)))
            .collect();
        let mut rng = StdRng::seed_from_u64(seed);
        let chosen = thompson_select(&weights, &mut rng);
        prop_assert!(StrategyVariant::ALL.contains(&chosen));
        if weights.is_empty() {
            prop_assert_eq!(chosen, StrategyVariant::Deferred);
        } else {
            prop_assert!(weights.contains_key(&chosen));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn withheld_fraction_converges_to_rate(
        rate in 0.05f64..0.95,
        seed in any::<u64>(),
    ) {
        let ablation = ConservativeAblation::new(AblationConfig {
            ablation_rate: rate,
            ..Default::default()
        });
        let mut rng = StdRng::seed_from_u64(seed);
        let sessions = 20_000;
        let withheld = (0..sessions)
            .filter(|_| ablation.should_withhold(&mut rng))
            .count();

        let fraction = withheld as f64 / f64::from(sessions);
        // Binomial std dev is at most 0.0036 here; 0.02 is over five of them.
        prop_assert!(
            (fraction - rate).abs() < 0.02,
            "rate {rate}, observed {fraction}"
        );
    }
}
