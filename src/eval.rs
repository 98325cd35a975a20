use std::collections::HashMap;

use serde::Serialize;

use crate::{
    template::{Flag, Segment, Strategy, Template, TryParse, ValueSource, ValueType},
    variant::{select_variant, variant_group_id},
    EvaluationContext, EvaluationError,
};

/// Reserved variant name for the flag-wide enabled value.
pub const FLAG_DEFAULT_ENABLED: &str = "$flag-default-enabled";
/// Reserved variant name for the flag-wide disabled value.
pub const FLAG_DEFAULT_DISABLED: &str = "$flag-default-disabled";
/// Reserved variant name for an environment-level enabled override.
pub const ENV_DEFAULT_ENABLED: &str = "$env-default-enabled";
/// Reserved variant name for an environment-level disabled override.
pub const ENV_DEFAULT_DISABLED: &str = "$env-default-disabled";

/// Why an evaluation produced its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationReason {
    /// The flag is switched off.
    Disabled,
    /// The flag is on but no strategy decided the outcome: either there are no active strategies
    /// (enabled) or none of them matched (not enabled).
    Default,
    /// A strategy matched.
    StrategyMatch,
    /// The flag could not be evaluated; a fallback value is served.
    Error,
}

/// The variant served by an evaluation. Always populated, including for disabled flags.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedVariant {
    /// Variant name, or one of the reserved default names.
    pub name: String,
    #[allow(missing_docs)]
    pub value: serde_json::Value,
    #[allow(missing_docs)]
    pub value_type: ValueType,
}

/// Outcome of evaluating one flag for one context.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    #[allow(missing_docs)]
    pub flag_name: String,
    #[allow(missing_docs)]
    pub enabled: bool,
    #[allow(missing_docs)]
    pub reason: EvaluationReason,
    #[allow(missing_docs)]
    pub variant: ResolvedVariant,
}

impl EvaluationResult {
    /// Served value.
    pub fn value(&self) -> &serde_json::Value {
        &self.variant.value
    }

    /// Result for a flag that could not be evaluated.
    pub(crate) fn error(flag_name: &str, value_type: ValueType) -> EvaluationResult {
        EvaluationResult {
            flag_name: flag_name.to_owned(),
            enabled: false,
            reason: EvaluationReason::Error,
            variant: ResolvedVariant {
                name: FLAG_DEFAULT_DISABLED.to_owned(),
                value: get_fallback_value(None, value_type),
                value_type,
            },
        }
    }
}

/// Return `value` unchanged when it is defined and not null, otherwise the type-appropriate
/// fallback: `false`, `0`, `""` or `{}`.
pub fn get_fallback_value(value: Option<&serde_json::Value>, value_type: ValueType) -> serde_json::Value {
    match value {
        Some(value) if !value.is_null() => value.clone(),
        _ => match value_type {
            ValueType::Boolean => serde_json::Value::Bool(false),
            ValueType::Number => serde_json::Value::from(0),
            ValueType::String => serde_json::Value::String(String::new()),
            ValueType::Json => serde_json::Value::Object(serde_json::Map::new()),
        },
    }
}

/// Evaluate `flag_name` against the given template snapshot.
///
/// Never fails: a missing template, an unknown flag or a flag that failed to parse produce an
/// [`EvaluationReason::Error`] result with a fallback value.
pub fn evaluate(
    template: Option<&Template>,
    flag_name: &str,
    context: &EvaluationContext,
) -> EvaluationResult {
    match try_evaluate(template, flag_name, context) {
        Ok(result) => {
            log::trace!(target: "togglr",
                        flag_name,
                        enabled = result.enabled,
                        reason:serde = result.reason,
                        variant:display = result.variant.name;
                        "evaluated a flag");
            result
        }
        Err((err, value_type)) => {
            match err {
                EvaluationError::FlagParseError => {
                    log::warn!(target: "togglr", flag_name; "error occurred while evaluating a flag: {err}");
                }
                EvaluationError::TemplateMissing => {
                    log::warn!(target: "togglr", flag_name; "evaluating a flag before a template has been loaded");
                }
                EvaluationError::FlagNotFound => {
                    log::debug!(target: "togglr", flag_name; "returning fallback value because of: {err}");
                }
            }
            EvaluationResult::error(flag_name, value_type)
        }
    }
}

/// Like [`evaluate`], but reports why a flag could not be evaluated. The error carries the best
/// known value type for building a fallback.
pub(crate) fn try_evaluate(
    template: Option<&Template>,
    flag_name: &str,
    context: &EvaluationContext,
) -> Result<EvaluationResult, (EvaluationError, ValueType)> {
    let template = template.ok_or((EvaluationError::TemplateMissing, ValueType::default()))?;
    match template.get_flag(flag_name) {
        Some(TryParse::Parsed(flag)) => Ok(flag.evaluate(context, template.segments())),
        Some(TryParse::ParseFailed(raw)) => {
            let value_type = raw
                .get("valueType")
                .and_then(|ty| serde_json::from_value(ty.clone()).ok())
                .unwrap_or_default();
            Err((EvaluationError::FlagParseError, value_type))
        }
        None => Err((EvaluationError::FlagNotFound, ValueType::default())),
    }
}

impl Flag {
    /// Evaluate the flag for `context`, resolving segment references through `segments`.
    pub fn evaluate(
        &self,
        context: &EvaluationContext,
        segments: &HashMap<String, Segment>,
    ) -> EvaluationResult {
        if !self.is_enabled {
            return self.result(false, EvaluationReason::Disabled, self.default_variant(false));
        }

        let mut strategies: Vec<&Strategy> =
            self.strategies.iter().filter(|s| s.is_enabled).collect();
        if strategies.is_empty() {
            return self.result(true, EvaluationReason::Default, self.default_variant(true));
        }
        // Stable sort keeps document order for equal `sort_order`.
        strategies.sort_by_key(|s| s.sort_order);

        let Some(strategy) = strategies
            .into_iter()
            .find(|strategy| strategy.matches(context, &self.name, segments))
        else {
            return self.result(false, EvaluationReason::Default, self.default_variant(false));
        };

        let variant = select_variant(
            &self.variants,
            context,
            &strategy.parameters.stickiness,
            &variant_group_id(&self.name),
        )
        .map(|variant| ResolvedVariant {
            name: variant.name.clone(),
            value: variant.value.clone(),
            value_type: variant.value_type(),
        })
        .unwrap_or_else(|| self.default_variant(true));

        self.result(true, EvaluationReason::StrategyMatch, variant)
    }

    fn result(
        &self,
        enabled: bool,
        reason: EvaluationReason,
        variant: ResolvedVariant,
    ) -> EvaluationResult {
        EvaluationResult {
            flag_name: self.name.clone(),
            enabled,
            reason,
            variant,
        }
    }

    fn default_variant(&self, enabled: bool) -> ResolvedVariant {
        let (name, value) = match (enabled, self.value_source) {
            (true, ValueSource::Flag) => (FLAG_DEFAULT_ENABLED, &self.enabled_value),
            (true, ValueSource::Environment) => (ENV_DEFAULT_ENABLED, &self.enabled_value),
            (false, ValueSource::Flag) => (FLAG_DEFAULT_DISABLED, &self.disabled_value),
            (false, ValueSource::Environment) => (ENV_DEFAULT_DISABLED, &self.disabled_value),
        };
        ResolvedVariant {
            name: name.to_owned(),
            value: get_fallback_value(Some(value), self.value_type),
            value_type: self.value_type,
        }
    }
}
