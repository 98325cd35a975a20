//! Template data model: the versioned snapshot of flags and segments for one environment.
use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{ContextValue, Result};

#[allow(missing_docs)]
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Immutable snapshot of every flag and segment for one environment.
///
/// A template is only ever replaced as a whole. Evaluators hold an `Arc<Template>` for the
/// duration of a call, so a concurrent refresh never affects an evaluation in progress.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "TemplateDocument")]
pub struct Template {
    /// Opaque version assigned by the server.
    pub version: Option<String>,
    /// Environment this template belongs to.
    pub environment: String,
    /// When the template was last published.
    pub updated_at: Option<Timestamp>,
    /// Flags keyed by name.
    ///
    /// Value is wrapped in `TryParse` so that if we fail to parse one flag (e.g., an operator this
    /// version does not know), we can still serve the other flags.
    flags: HashMap<String, TryParse<Flag>>,
    segments: HashMap<String, Segment>,
}

/// Wire representation of [`Template`].
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateDocument {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    environment: String,
    #[serde(default)]
    updated_at: Option<Timestamp>,
    #[serde(default)]
    flags: Vec<TryParse<Flag>>,
    #[serde(default)]
    segments: Vec<TryParse<Segment>>,
}

impl From<TemplateDocument> for Template {
    fn from(document: TemplateDocument) -> Template {
        let mut flags = HashMap::with_capacity(document.flags.len());
        for entry in document.flags {
            let name = match &entry {
                TryParse::Parsed(flag) => flag.name.clone(),
                TryParse::ParseFailed(raw) => match raw.get("name").and_then(|n| n.as_str()) {
                    Some(name) => {
                        log::warn!(target: "togglr", flag_name = name; "failed to parse flag definition");
                        name.to_owned()
                    }
                    None => {
                        log::warn!(target: "togglr", "skipping flag definition without a name");
                        continue;
                    }
                },
            };
            flags.insert(name, entry);
        }

        let segments = document
            .segments
            .into_iter()
            .filter_map(|entry| match entry {
                TryParse::Parsed(segment) => Some((segment.name.clone(), segment)),
                TryParse::ParseFailed(raw) => {
                    // Strategies skip unresolved segment references, so a broken segment is
                    // simply left out.
                    log::warn!(target: "togglr",
                               segment:serde = raw;
                               "failed to parse segment definition");
                    None
                }
            })
            .collect();

        Template {
            version: document.version,
            environment: document.environment,
            updated_at: document.updated_at,
            flags,
            segments,
        }
    }
}

impl Template {
    /// Build a template from already-parsed flags and segments.
    pub fn new(
        version: Option<String>,
        environment: impl Into<String>,
        flags: Vec<Flag>,
        segments: Vec<Segment>,
    ) -> Template {
        Template {
            version,
            environment: environment.into(),
            updated_at: None,
            flags: flags
                .into_iter()
                .map(|flag| (flag.name.clone(), TryParse::Parsed(flag)))
                .collect(),
            segments: segments
                .into_iter()
                .map(|segment| (segment.name.clone(), segment))
                .collect(),
        }
    }

    /// Parse a template document.
    pub fn from_json(json: &str) -> Result<Template> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse a template document from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Template> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Look up a flag definition by name.
    pub fn get_flag(&self, name: &str) -> Option<&TryParse<Flag>> {
        self.flags.get(name)
    }

    /// Names of all flags, including ones that failed to parse.
    pub fn flag_names(&self) -> impl Iterator<Item = &str> {
        self.flags.keys().map(String::as_str)
    }

    /// Segments keyed by name.
    pub fn segments(&self) -> &HashMap<String, Segment> {
        &self.segments
    }
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// A named feature toggle.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Flag {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub is_enabled: bool,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub enabled_value: serde_json::Value,
    #[serde(default)]
    pub disabled_value: serde_json::Value,
    #[serde(default)]
    pub value_source: ValueSource,
    /// Evaluated in `sort_order`, first match wins.
    #[serde(default)]
    pub strategies: Vec<Strategy>,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

impl Flag {
    /// Create an enabled boolean flag without rules, serving `true`.
    pub fn new(name: impl Into<String>) -> Flag {
        Flag {
            id: None,
            name: name.into(),
            is_enabled: true,
            value_type: ValueType::Boolean,
            enabled_value: serde_json::Value::Bool(true),
            disabled_value: serde_json::Value::Bool(false),
            value_source: ValueSource::Flag,
            strategies: Vec::new(),
            variants: Vec::new(),
        }
    }
}

/// Declared type of a flag value.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum ValueType {
    String,
    Number,
    #[default]
    Boolean,
    Json,
}

impl ValueType {
    /// Infer the value type of a JSON value. `null` is reported as [`ValueType::Json`].
    pub fn of(value: &serde_json::Value) -> ValueType {
        match value {
            serde_json::Value::Bool(_) => ValueType::Boolean,
            serde_json::Value::Number(_) => ValueType::Number,
            serde_json::Value::String(_) => ValueType::String,
            serde_json::Value::Null
            | serde_json::Value::Array(_)
            | serde_json::Value::Object(_) => ValueType::Json,
        }
    }
}

/// Where the flag's default values come from. Affects the reserved variant name reported for
/// default values.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    /// Flag-wide default values.
    #[default]
    Flag,
    /// Values overridden for the environment.
    Environment,
}

/// One targeting rule set attached to a flag.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Strategy {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Names of referenced segments.
    #[serde(default)]
    pub segments: Vec<String>,
    #[serde(default)]
    pub parameters: StrategyParameters,
}

impl Strategy {
    /// An enabled strategy that matches everyone.
    pub fn new(name: impl Into<String>) -> Strategy {
        Strategy {
            name: name.into(),
            is_enabled: true,
            sort_order: 0,
            constraints: Vec::new(),
            segments: Vec::new(),
            parameters: StrategyParameters::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct StrategyParameters {
    /// Percentage of buckets (0-100) that match.
    #[serde(default = "default_rollout", deserialize_with = "deserialize_rollout")]
    pub rollout: f64,
    #[serde(default)]
    pub stickiness: Stickiness,
    /// Hash salt for rollout bucketing. Defaults to the flag name.
    #[serde(default)]
    pub group_id: Option<String>,
}

impl Default for StrategyParameters {
    fn default() -> Self {
        StrategyParameters {
            rollout: default_rollout(),
            stickiness: Stickiness::Default,
            group_id: None,
        }
    }
}

fn default_rollout() -> f64 {
    100.0
}

/// Rollout is accepted both as a number and as a numeric string.
fn deserialize_rollout<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Rollout {
        Number(f64),
        String(String),
        Null,
    }

    match Rollout::deserialize(deserializer)? {
        Rollout::Number(n) => Ok(n),
        Rollout::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Rollout::Null => Ok(default_rollout()),
    }
}

/// Context field used to derive a stable bucket.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Stickiness {
    /// `userId`, then `sessionId`, then random.
    #[default]
    Default,
    /// Same as [`Stickiness::Default`].
    UserId,
    /// `sessionId`, then random.
    SessionId,
    /// Always random.
    Random,
    /// A custom context field, then random.
    Custom(String),
}

impl From<String> for Stickiness {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" | "default" => Stickiness::Default,
            "userId" => Stickiness::UserId,
            "sessionId" => Stickiness::SessionId,
            "random" => Stickiness::Random,
            _ => Stickiness::Custom(value),
        }
    }
}

impl From<Stickiness> for String {
    fn from(value: Stickiness) -> Self {
        match value {
            Stickiness::Default => "default".to_owned(),
            Stickiness::UserId => "userId".to_owned(),
            Stickiness::SessionId => "sessionId".to_owned(),
            Stickiness::Random => "random".to_owned(),
            Stickiness::Custom(field) => field,
        }
    }
}

/// A named, reusable bundle of constraints.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    #[allow(missing_docs)]
    pub name: String,
    /// Presentation-only. Does not gate evaluation.
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[allow(missing_docs)]
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

/// A single comparison between a context field and configured target values.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Constraint {
    pub context_name: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Option<ContextValue>,
    #[serde(default)]
    pub values: Vec<ContextValue>,
    /// Negates the operator result.
    #[serde(default)]
    pub inverted: bool,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl Constraint {
    /// Constraint with a single target value.
    pub fn new(
        context_name: impl Into<String>,
        operator: Operator,
        value: impl Into<ContextValue>,
    ) -> Constraint {
        Constraint {
            context_name: context_name.into(),
            operator,
            value: Some(value.into()),
            values: Vec::new(),
            inverted: false,
            case_insensitive: false,
        }
    }

    /// Constraint with a list of target values.
    pub fn with_values<V: Into<ContextValue>>(
        context_name: impl Into<String>,
        operator: Operator,
        values: impl IntoIterator<Item = V>,
    ) -> Constraint {
        Constraint {
            context_name: context_name.into(),
            operator,
            value: None,
            values: values.into_iter().map(Into::into).collect(),
            inverted: false,
            case_insensitive: false,
        }
    }

    #[allow(missing_docs)]
    pub fn inverted(mut self) -> Constraint {
        self.inverted = !self.inverted;
        self
    }

    #[allow(missing_docs)]
    pub fn case_insensitive(mut self) -> Constraint {
        self.case_insensitive = true;
        self
    }
}

/// Closed set of constraint operators.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Operator {
    StrEq,
    StrContains,
    StrStartsWith,
    StrEndsWith,
    StrIn,
    StrRegex,
    NumEq,
    NumGt,
    NumGte,
    NumLt,
    NumLte,
    NumIn,
    /// A value is true only when its string form is `true` (case-folded when the constraint is
    /// case-insensitive). `"yes"`, `1` and `"1"` are false. A missing target means `true`.
    BoolIs,
    DateEq,
    DateGt,
    DateGte,
    DateLt,
    DateLte,
    SemverEq,
    SemverGt,
    SemverGte,
    SemverLt,
    SemverLte,
    SemverIn,
    ArrAny,
    ArrAll,
    ArrEmpty,
    Exists,
    NotExists,
}

/// A named, weighted alternative value.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Variant {
    pub name: String,
    /// Relative weight, summed with sibling variants.
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    value_type: Option<ValueType>,
}

impl Variant {
    #[allow(missing_docs)]
    pub fn new(name: impl Into<String>, weight: f64, value: impl Into<serde_json::Value>) -> Variant {
        Variant {
            name: name.into(),
            weight,
            value: value.into(),
            value_type: None,
        }
    }

    /// Declared value type, or the type inferred from `value`.
    pub fn value_type(&self) -> ValueType {
        self.value_type.unwrap_or_else(|| ValueType::of(&self.value))
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Read};

    use super::{Operator, Stickiness, Template, TryParse, ValueSource, ValueType};

    #[test]
    fn parse_template_fixture() {
        let mut json = String::new();
        File::open("tests/data/template-v1.json")
            .expect("Failed to open tests/data/template-v1.json")
            .read_to_string(&mut json)
            .unwrap();
        let template = Template::from_json(&json).unwrap();

        assert_eq!(template.environment, "production");
        assert!(template.segments().contains_key("beta-testers"));
        assert!(matches!(
            template.get_flag("new-checkout"),
            Some(TryParse::Parsed(_))
        ));
    }

    #[test]
    fn parse_partially_if_unexpected() {
        let template = Template::from_json(
            r#"
              {
                "version": "7",
                "environment": "staging",
                "flags": [
                  { "name": "success", "isEnabled": true },
                  {
                    "name": "fail_parsing",
                    "isEnabled": true,
                    "strategies": [
                      { "constraints": [{ "contextName": "userId", "operator": "NEW_OPERATOR" }] }
                    ]
                  },
                  { "isEnabled": "nameless and broken" }
                ],
                "segments": [
                  { "name": "ok", "constraints": [] },
                  { "constraints": 42 }
                ]
              }
            "#,
        )
        .unwrap();

        assert_eq!(template.version.as_deref(), Some("7"));
        assert!(matches!(
            template.get_flag("success"),
            Some(TryParse::Parsed(_))
        ));
        assert!(matches!(
            template.get_flag("fail_parsing"),
            Some(TryParse::ParseFailed(_))
        ));
        assert_eq!(template.flag_names().count(), 2);
        assert_eq!(template.segments().len(), 1);
    }

    #[test]
    fn applies_defaults() {
        let template = Template::from_json(
            r#"{
                "flags": [{
                    "name": "f",
                    "isEnabled": true,
                    "strategies": [{ "parameters": { "rollout": "25", "stickiness": "tenantId" } }]
                }]
            }"#,
        )
        .unwrap();

        let Some(TryParse::Parsed(flag)) = template.get_flag("f") else {
            panic!("flag should parse");
        };
        assert_eq!(flag.value_type, ValueType::Boolean);
        assert_eq!(flag.value_source, ValueSource::Flag);
        let strategy = &flag.strategies[0];
        assert!(strategy.is_enabled);
        assert_eq!(strategy.parameters.rollout, 25.0);
        assert_eq!(
            strategy.parameters.stickiness,
            Stickiness::Custom("tenantId".to_owned())
        );
        assert_eq!(strategy.parameters.group_id, None);
    }

    #[test]
    fn operator_names_are_snake_case() {
        let op: Operator = serde_json::from_str(r#""str_starts_with""#).unwrap();
        assert_eq!(op, Operator::StrStartsWith);
        let op: Operator = serde_json::from_str(r#""not_exists""#).unwrap();
        assert_eq!(op, Operator::NotExists);
        assert!(serde_json::from_str::<Operator>(r#""STR_EQ""#).is_err());
    }
}
