use std::collections::HashMap;

use rand::{thread_rng, Rng};

use crate::{
    sharder::get_percentage,
    template::{Segment, Stickiness, Strategy},
    EvaluationContext,
};

impl Strategy {
    /// Return `true` if the strategy matches `context`.
    ///
    /// Phases are evaluated in order and short-circuit on the first failure: referenced segments,
    /// the strategy's own constraints, then percentage rollout.
    pub fn matches(
        &self,
        context: &EvaluationContext,
        flag_name: &str,
        segments: &HashMap<String, Segment>,
    ) -> bool {
        self.matches_segments(context, segments)
            && self.matches_constraints(context)
            && self.matches_rollout(context, flag_name)
    }

    fn matches_segments(
        &self,
        context: &EvaluationContext,
        segments: &HashMap<String, Segment>,
    ) -> bool {
        self.segments.iter().all(|name| {
            let Some(segment) = segments.get(name) else {
                log::debug!(target: "togglr",
                            strategy:display = self.name,
                            segment:display = name;
                            "skipping unresolved segment reference");
                return true;
            };
            // `is_active` is deliberately not consulted here.
            segment
                .constraints
                .iter()
                .all(|constraint| constraint.eval(context))
        })
    }

    fn matches_constraints(&self, context: &EvaluationContext) -> bool {
        self.constraints
            .iter()
            .all(|constraint| constraint.eval(context))
    }

    fn matches_rollout(&self, context: &EvaluationContext, flag_name: &str) -> bool {
        let rollout = self.parameters.rollout;
        if rollout >= 100.0 {
            return true;
        }
        // Also rejects NaN and negative rollouts.
        if !(rollout > 0.0) {
            return false;
        }

        let group_id = self
            .parameters
            .group_id
            .as_deref()
            .filter(|group_id| !group_id.is_empty())
            .unwrap_or(flag_name);
        let key = self.parameters.stickiness.resolve(context);

        get_percentage(group_id, &key) <= rollout
    }
}

impl Stickiness {
    /// Resolve the value that is hashed into a bucket.
    ///
    /// Falls back to a random value only when the context carries no stable identifier for the
    /// configured stickiness.
    pub fn resolve(&self, context: &EvaluationContext) -> String {
        let stable = match self {
            Stickiness::Default | Stickiness::UserId => context
                .user_id
                .clone()
                .or_else(|| context.session_id.clone()),
            Stickiness::SessionId => context.session_id.clone(),
            Stickiness::Random => None,
            Stickiness::Custom(field) => context.get_string(field),
        };
        stable.unwrap_or_else(random_key)
    }
}

fn random_key() -> String {
    thread_rng().gen::<u64>().to_string()
}
