use crate::{
    sharder::get_percentage,
    template::{Stickiness, Variant},
    EvaluationContext,
};

/// Deterministically pick a variant by weight.
///
/// The stickiness value is hashed with `group_id` into the same percentage space used for rollout,
/// scaled into the cumulative weight space, and the first variant whose cumulative boundary lies
/// above it wins. Returns `None` when the total weight is not positive. Negative weights count as
/// zero.
pub fn select_variant<'a>(
    variants: &'a [Variant],
    context: &EvaluationContext,
    stickiness: &Stickiness,
    group_id: &str,
) -> Option<&'a Variant> {
    let total_weight: f64 = variants.iter().map(effective_weight).sum();
    if !(total_weight > 0.0) {
        return None;
    }

    let key = stickiness.resolve(context);
    let target = get_percentage(group_id, &key) / 100.0 * total_weight;

    let mut cumulative = 0.0;
    let mut last = None;
    for variant in variants {
        let weight = effective_weight(variant);
        if weight <= 0.0 {
            continue;
        }
        cumulative += weight;
        if target < cumulative {
            return Some(variant);
        }
        last = Some(variant);
    }

    // Only reachable through floating point rounding.
    last
}

/// Default hash salt for variant selection, kept separate from the rollout salt so that variant
/// shares are independent from rollout membership.
pub(crate) fn variant_group_id(flag_name: &str) -> String {
    format!("{flag_name}-variant")
}

fn effective_weight(variant: &Variant) -> f64 {
    if variant.weight.is_finite() && variant.weight > 0.0 {
        variant.weight
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        template::{Stickiness, Variant},
        EvaluationContext,
    };

    use super::select_variant;

    fn user(id: impl ToString) -> EvaluationContext {
        EvaluationContext::default().with_user_id(id.to_string())
    }

    #[test]
    fn zero_total_weight_selects_nothing() {
        let variants = vec![Variant::new("a", 0.0, "a"), Variant::new("b", -5.0, "b")];
        assert!(select_variant(&variants, &user(1), &Stickiness::Default, "g").is_none());
        assert!(select_variant(&[], &user(1), &Stickiness::Default, "g").is_none());
    }

    #[test]
    fn single_variant_always_wins() {
        let variants = vec![Variant::new("variant-a", 100.0, "a")];
        for i in 0..100 {
            let selected = select_variant(&variants, &user(i), &Stickiness::Default, "g").unwrap();
            assert_eq!(selected.name, "variant-a");
        }
    }

    #[test]
    fn zero_weight_variant_is_never_selected() {
        let variants = vec![
            Variant::new("off", 0.0, "off"),
            Variant::new("on", 1.0, "on"),
            Variant::new("also-off", 0.0, "off"),
        ];
        for i in 0..500 {
            let selected = select_variant(&variants, &user(i), &Stickiness::Default, "g").unwrap();
            assert_eq!(selected.name, "on");
        }
    }

    #[test]
    fn selection_is_deterministic() {
        let variants = vec![
            Variant::new("a", 1.0, "a"),
            Variant::new("b", 1.0, "b"),
            Variant::new("c", 1.0, "c"),
        ];
        for i in 0..200 {
            let first = select_variant(&variants, &user(i), &Stickiness::Default, "g");
            let second = select_variant(&variants, &user(i), &Stickiness::Default, "g");
            assert_eq!(first, second);
        }
    }

    #[test]
    fn shares_follow_weights() {
        let variants = vec![Variant::new("a", 25.0, "a"), Variant::new("b", 75.0, "b")];
        let a = (0..10_000)
            .filter(|i| {
                select_variant(&variants, &user(i), &Stickiness::Default, "g")
                    .is_some_and(|v| v.name == "a")
            })
            .count();
        assert!((2_200..2_800).contains(&a), "{a}");
    }
}
