use std::{borrow::Cow, cmp::Ordering};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::RegexBuilder;

use crate::{
    template::{Constraint, Operator},
    ContextValue, EvaluationContext,
};

impl Constraint {
    /// Evaluate the constraint against `context`. Never fails: misconfiguration evaluates to
    /// `false` before inversion.
    pub fn eval(&self, context: &EvaluationContext) -> bool {
        let value = context.get_field(&self.context_name);
        let result = self.eval_operator(value.as_deref());
        // Inversion is the single negation point for every operator.
        result != self.inverted
    }

    fn eval_operator(&self, value: Option<&ContextValue>) -> bool {
        match self.operator {
            Operator::Exists => return value.is_some(),
            Operator::NotExists => return value.is_none(),
            Operator::ArrEmpty => {
                return value
                    .and_then(ContextValue::as_list)
                    .map_or(true, |items| items.is_empty())
            }
            _ => {}
        }

        match value {
            Some(value) => self.try_eval(value).unwrap_or(false),
            None => false,
        }
    }

    /// Try applying the operator to a present context value, returning `None` if the operator
    /// cannot be applied (unparseable target, malformed regex, ...).
    fn try_eval(&self, value: &ContextValue) -> Option<bool> {
        match self.operator {
            Operator::StrEq
            | Operator::StrContains
            | Operator::StrStartsWith
            | Operator::StrEndsWith => {
                let s = self.fold(value.to_string_lossy());
                let target = self.fold(self.value.as_ref()?.to_string_lossy());
                Some(match self.operator {
                    Operator::StrEq => s == target,
                    Operator::StrContains => s.contains(target.as_ref()),
                    Operator::StrStartsWith => s.starts_with(target.as_ref()),
                    Operator::StrEndsWith => s.ends_with(target.as_ref()),
                    _ => return None,
                })
            }

            Operator::StrIn => {
                let s = self.fold(value.to_string_lossy());
                Some(self.targets().any(|t| self.fold(t.to_string_lossy()) == s))
            }

            Operator::StrRegex => {
                let pattern = self.value.as_ref()?.to_string_lossy();
                let regex = RegexBuilder::new(&pattern)
                    .case_insensitive(self.case_insensitive)
                    .build()
                    .map_err(|err| {
                        log::debug!(target: "togglr",
                                    context_name:display = self.context_name;
                                    "invalid regex in constraint: {err}");
                    })
                    .ok()?;
                Some(regex.is_match(&value.to_string_lossy()))
            }

            Operator::NumEq
            | Operator::NumGt
            | Operator::NumGte
            | Operator::NumLt
            | Operator::NumLte => {
                let n = value.to_number();
                let target = self.value.as_ref()?.to_number();
                // NaN on either side fails every comparison.
                Some(match self.operator {
                    Operator::NumEq => n == target,
                    Operator::NumGt => n > target,
                    Operator::NumGte => n >= target,
                    Operator::NumLt => n < target,
                    Operator::NumLte => n <= target,
                    _ => return None,
                })
            }

            Operator::NumIn => {
                let n = value.to_number();
                Some(self.targets().any(|t| t.to_number() == n))
            }

            Operator::BoolIs => {
                let actual = self.fold(value.to_string_lossy()) == "true";
                let expected = self
                    .value
                    .as_ref()
                    .map_or(true, |t| self.fold(t.to_string_lossy()) == "true");
                Some(actual == expected)
            }

            Operator::DateEq
            | Operator::DateGt
            | Operator::DateGte
            | Operator::DateLt
            | Operator::DateLte => {
                let date = parse_date(value)?;
                let target = parse_date(self.value.as_ref()?)?;
                Some(match self.operator {
                    Operator::DateEq => date == target,
                    Operator::DateGt => date > target,
                    Operator::DateGte => date >= target,
                    Operator::DateLt => date < target,
                    Operator::DateLte => date <= target,
                    _ => return None,
                })
            }

            Operator::SemverEq
            | Operator::SemverGt
            | Operator::SemverGte
            | Operator::SemverLt
            | Operator::SemverLte => {
                let version = DottedVersion::parse(&value.to_string_lossy())?;
                let target = DottedVersion::parse(&self.value.as_ref()?.to_string_lossy())?;
                let ordering = version.cmp(&target);
                Some(match self.operator {
                    Operator::SemverEq => ordering == Ordering::Equal,
                    Operator::SemverGt => ordering == Ordering::Greater,
                    Operator::SemverGte => ordering != Ordering::Less,
                    Operator::SemverLt => ordering == Ordering::Less,
                    Operator::SemverLte => ordering != Ordering::Greater,
                    _ => return None,
                })
            }

            Operator::SemverIn => {
                let version = DottedVersion::parse(&value.to_string_lossy())?;
                Some(self.targets().any(|t| {
                    DottedVersion::parse(&t.to_string_lossy()).is_some_and(|t| t == version)
                }))
            }

            Operator::ArrAny | Operator::ArrAll => {
                let items: Vec<Cow<'_, str>> = value
                    .as_list()
                    .unwrap_or_default()
                    .iter()
                    .map(|item| self.fold(item.to_string_lossy()))
                    .collect();
                let mut targets = self.targets().map(|t| self.fold(t.to_string_lossy()));
                Some(if self.operator == Operator::ArrAny {
                    targets.any(|t| items.contains(&t))
                } else {
                    targets.all(|t| items.contains(&t))
                })
            }

            // Handled before the presence check.
            Operator::Exists | Operator::NotExists | Operator::ArrEmpty => None,
        }
    }

    /// Target list for membership operators. Falls back to the single `value` when `values` is
    /// empty.
    fn targets(&self) -> impl Iterator<Item = &ContextValue> {
        let single = if self.values.is_empty() {
            self.value.as_ref()
        } else {
            None
        };
        self.values.iter().chain(single)
    }

    fn fold<'a>(&self, s: Cow<'a, str>) -> Cow<'a, str> {
        if self.case_insensitive {
            Cow::Owned(s.to_lowercase())
        } else {
            s
        }
    }
}

/// Parse a date from an RFC 3339 timestamp, a naive date-time or date (interpreted as UTC), or a
/// number of milliseconds since the Unix epoch.
fn parse_date(value: &ContextValue) -> Option<DateTime<Utc>> {
    match value {
        ContextValue::Number(millis) if millis.is_finite() => {
            Utc.timestamp_millis_opt(*millis as i64).single()
        }
        ContextValue::String(s) => {
            let s = s.trim();
            if let Ok(date) = DateTime::parse_from_rfc3339(s) {
                return Some(date.with_timezone(&Utc));
            }
            if let Ok(date) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(date.and_utc());
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
            }
            s.parse::<i64>()
                .ok()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        }
        _ => None,
    }
}

/// Dotted numeric version (`1.2.3`, `v2`, `10.0.1.4`). Leading `v` is ignored, missing
/// components compare as `0`, and each component contributes its leading digits only
/// (`3-beta` is `3`).
#[derive(Debug, Clone)]
struct DottedVersion(Vec<u64>);

impl DottedVersion {
    fn parse(s: &str) -> Option<DottedVersion> {
        let s = s.trim();
        let s = s
            .strip_prefix('v')
            .or_else(|| s.strip_prefix('V'))
            .unwrap_or(s);
        if s.is_empty() {
            return None;
        }
        s.split('.')
            .map(|component| {
                let digits: &str = component
                    .find(|c: char| !c.is_ascii_digit())
                    .map_or(component, |end| &component[..end]);
                digits.parse().ok()
            })
            .collect::<Option<Vec<u64>>>()
            .map(DottedVersion)
    }

    fn component(&self, i: usize) -> u64 {
        self.0.get(i).copied().unwrap_or(0)
    }
}

impl Ord for DottedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for DottedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DottedVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DottedVersion {}

#[cfg(test)]
mod tests {
    use crate::{
        template::{Constraint, Operator},
        ContextValue, EvaluationContext,
    };

    fn ctx(name: &str, value: impl Into<ContextValue>) -> EvaluationContext {
        EvaluationContext::default().with_property(name, value)
    }

    fn check(constraint: &Constraint, context: &EvaluationContext) -> bool {
        let result = constraint.eval(context);
        assert_eq!(
            constraint.clone().inverted().eval(context),
            !result,
            "inversion must negate {constraint:?}"
        );
        result
    }

    #[test]
    fn str_eq() {
        let c = Constraint::new("userId", Operator::StrEq, "user-1");
        assert!(check(&c, &EvaluationContext::default().with_user_id("user-1")));
        assert!(!check(&c, &EvaluationContext::default().with_user_id("USER-1")));
        assert!(check(
            &c.case_insensitive(),
            &EvaluationContext::default().with_user_id("USER-1")
        ));
    }

    #[test]
    fn str_contains_starts_ends() {
        let context = ctx("email", "alice@example.com");
        assert!(check(&Constraint::new("email", Operator::StrContains, "@example"), &context));
        assert!(check(&Constraint::new("email", Operator::StrStartsWith, "alice"), &context));
        assert!(check(&Constraint::new("email", Operator::StrEndsWith, ".com"), &context));
        assert!(!check(&Constraint::new("email", Operator::StrEndsWith, ".org"), &context));
        assert!(check(
            &Constraint::new("email", Operator::StrStartsWith, "ALICE").case_insensitive(),
            &context
        ));
    }

    #[test]
    fn str_in() {
        let c = Constraint::with_values("country", Operator::StrIn, ["NO", "SE"]);
        assert!(check(&c, &ctx("country", "SE")));
        assert!(!check(&c, &ctx("country", "se")));
        assert!(check(&c.clone().case_insensitive(), &ctx("country", "se")));
        assert!(!check(&c, &ctx("country", "DK")));
    }

    #[test]
    fn str_regex() {
        let c = Constraint::new("email", Operator::StrRegex, "^test.*@example\\.com$");
        assert!(check(&c, &ctx("email", "test1@example.com")));
        assert!(!check(&c, &ctx("email", "TEST1@example.com")));
        assert!(check(&c.case_insensitive(), &ctx("email", "TEST1@example.com")));
    }

    #[test]
    fn malformed_regex_is_false() {
        let c = Constraint::new("email", Operator::StrRegex, "(unclosed");
        assert!(!c.eval(&ctx("email", "(unclosed")));
        assert!(c.inverted().eval(&ctx("email", "(unclosed")));
    }

    #[test]
    fn numbers() {
        let context = ctx("age", 18.0);
        assert!(check(&Constraint::new("age", Operator::NumEq, 18.0), &context));
        assert!(check(&Constraint::new("age", Operator::NumEq, "18"), &context));
        assert!(check(&Constraint::new("age", Operator::NumGte, 18.0), &context));
        assert!(!check(&Constraint::new("age", Operator::NumGt, 18.0), &context));
        assert!(check(&Constraint::new("age", Operator::NumLte, 18.0), &context));
        assert!(!check(&Constraint::new("age", Operator::NumLt, 18.0), &context));
        assert!(check(&Constraint::new("age", Operator::NumGt, 17.5), &ctx("age", "18")));
        assert!(check(
            &Constraint::with_values("age", Operator::NumIn, [16.0, 18.0]),
            &context
        ));
    }

    #[test]
    fn non_numeric_fails_comparisons() {
        let context = ctx("age", "eighteen");
        for op in [
            Operator::NumEq,
            Operator::NumGt,
            Operator::NumGte,
            Operator::NumLt,
            Operator::NumLte,
        ] {
            assert!(!check(&Constraint::new("age", op, 18.0), &context));
        }
    }

    #[test]
    fn bool_is() {
        let c = Constraint::new("beta", Operator::BoolIs, "true");
        assert!(check(&c, &ctx("beta", true)));
        assert!(check(&c, &ctx("beta", "true")));
        assert!(!check(&c, &ctx("beta", false)));
        let c = Constraint::new("beta", Operator::BoolIs, "false");
        assert!(check(&c, &ctx("beta", false)));
        assert!(!check(&c, &ctx("beta", true)));
    }

    #[test]
    fn bool_is_accepts_only_true_literal() {
        let c = Constraint::new("beta", Operator::BoolIs, "true");
        assert!(!check(&c, &ctx("beta", "yes")));
        assert!(!check(&c, &ctx("beta", 1.0)));
        assert!(!check(&c, &ctx("beta", "1")));
        assert!(!check(&c, &ctx("beta", "TRUE")));
        assert!(check(&c.case_insensitive(), &ctx("beta", "TRUE")));

        let c = Constraint::new("beta", Operator::BoolIs, "false");
        assert!(check(&c, &ctx("beta", "yes")));
        assert!(check(&c, &ctx("beta", 0.0)));
    }

    #[test]
    fn dates() {
        let context = ctx("signup", "2024-03-01T12:00:00Z");
        assert!(check(
            &Constraint::new("signup", Operator::DateGt, "2024-01-01"),
            &context
        ));
        assert!(check(
            &Constraint::new("signup", Operator::DateLt, "2024-03-01T13:00:00+00:00"),
            &context
        ));
        assert!(check(
            &Constraint::new("signup", Operator::DateEq, "2024-03-01T14:00:00+02:00"),
            &context
        ));
        assert!(check(
            &Constraint::new("signup", Operator::DateGte, 1_709_294_400_000.0),
            &context
        ));
        assert!(check(
            &Constraint::new("signup", Operator::DateLte, "2024-03-01T12:00:00"),
            &context
        ));
        assert!(!check(
            &Constraint::new("signup", Operator::DateGt, "not a date"),
            &context
        ));
    }

    #[test]
    fn semver_compares_component_wise() {
        let c = |op, target: &str| Constraint::new("appVersion", op, target);
        let v = |version: &str| EvaluationContext::default().with_app_version(version);

        assert!(check(&c(Operator::SemverGt, "1.2.0"), &v("1.10.0")));
        assert!(check(&c(Operator::SemverLt, "1.10.0"), &v("1.9.9")));
        assert!(check(&c(Operator::SemverEq, "1.2"), &v("v1.2.0")));
        assert!(check(&c(Operator::SemverGte, "2.0.0"), &v("2")));
        assert!(check(&c(Operator::SemverLte, "1.0.0.1"), &v("1.0.0")));
        assert!(!check(&c(Operator::SemverGt, "1.0.0"), &v("1.0.0")));
        assert!(check(&c(Operator::SemverEq, "3.1.0"), &v("3.1.0-beta")));
        assert!(!check(&c(Operator::SemverEq, "1.0.0"), &v("not.a.version")));
        assert!(check(
            &Constraint::with_values("appVersion", Operator::SemverIn, ["1.0", "2.0.0"]),
            &v("v2")
        ));
    }

    #[test]
    fn arrays() {
        let context = ctx(
            "roles",
            vec![ContextValue::from("Admin"), ContextValue::from("editor")],
        );
        assert!(check(
            &Constraint::with_values("roles", Operator::ArrAny, ["viewer", "editor"]),
            &context
        ));
        assert!(!check(
            &Constraint::with_values("roles", Operator::ArrAll, ["admin", "editor"]),
            &context
        ));
        assert!(check(
            &Constraint::with_values("roles", Operator::ArrAll, ["admin", "editor"])
                .case_insensitive(),
            &context
        ));
        assert!(!check(
            &Constraint::with_values("roles", Operator::ArrAny, ["viewer"]),
            &context
        ));
    }

    #[test]
    fn existence_operators_handle_absent_fields() {
        let empty = EvaluationContext::default();
        let present = ctx("plan", "pro");

        let exists = Constraint::with_values("plan", Operator::Exists, Vec::<String>::new());
        assert!(!check(&exists, &empty));
        assert!(check(&exists, &present));

        let not_exists = Constraint::with_values("plan", Operator::NotExists, Vec::<String>::new());
        assert!(check(&not_exists, &empty));
        assert!(!check(&not_exists, &present));
        assert!(check(&not_exists, &ctx("plan", ContextValue::Null)));
    }

    #[test]
    fn arr_empty_treats_missing_and_scalars_as_empty() {
        let c = Constraint::with_values("tags", Operator::ArrEmpty, Vec::<String>::new());
        assert!(check(&c, &EvaluationContext::default()));
        assert!(check(&c, &ctx("tags", "not-a-list")));
        assert!(check(&c, &ctx("tags", Vec::<ContextValue>::new())));
        assert!(!check(&c, &ctx("tags", vec![ContextValue::from("a")])));
    }

    #[test]
    fn absent_field_is_false_unless_inverted() {
        let empty = EvaluationContext::default();
        for op in [
            Operator::StrEq,
            Operator::StrIn,
            Operator::StrRegex,
            Operator::NumGt,
            Operator::BoolIs,
            Operator::DateLt,
            Operator::SemverEq,
            Operator::ArrAny,
            Operator::ArrAll,
        ] {
            let c = Constraint::new("missing", op, "x");
            assert!(!c.eval(&empty), "{op:?}");
            assert!(c.inverted().eval(&empty), "{op:?}");
        }
    }
}
