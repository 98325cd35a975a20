use std::{borrow::Cow, collections::HashMap};

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Runtime request context that flags are evaluated against.
///
/// Well-known fields are addressed in constraints by their camelCase names (`userId`,
/// `sessionId`, `appName`, `appVersion`, `remoteAddress`). Any other name is looked up in
/// `properties`.
///
/// # Examples
/// ```
/// # use togglr::EvaluationContext;
/// let context = EvaluationContext::default()
///     .with_user_id("user-1")
///     .with_property("plan", "enterprise")
///     .with_property("seats", 25.0);
/// ```
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    /// Free-form custom fields.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, ContextValue>,
}

impl EvaluationContext {
    #[allow(missing_docs)]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_app_version(mut self, app_version: impl Into<String>) -> Self {
        self.app_version = Some(app_version.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_remote_address(mut self, remote_address: impl Into<String>) -> Self {
        self.remote_address = Some(remote_address.into());
        self
    }

    /// Set a custom property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Resolve a context field by name. Returns `None` when the field is absent or null.
    pub fn get_field(&self, name: &str) -> Option<Cow<'_, ContextValue>> {
        let standard = match name {
            "userId" => &self.user_id,
            "sessionId" => &self.session_id,
            "appName" => &self.app_name,
            "appVersion" => &self.app_version,
            "remoteAddress" => &self.remote_address,
            _ => {
                return self
                    .properties
                    .get(name)
                    .filter(|value| value.is_present())
                    .map(Cow::Borrowed);
            }
        };
        standard
            .as_ref()
            .map(|s| Cow::Owned(ContextValue::String(s.clone())))
    }

    /// Resolve a context field as a string, used for stickiness.
    pub(crate) fn get_string(&self, name: &str) -> Option<String> {
        self.get_field(name).map(|value| value.to_string_lossy().into_owned())
    }
}

/// Value of a context field or of a constraint target.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`, `bool` and lists.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum ContextValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A list of values, used by array operators.
    List(Vec<ContextValue>),
    /// A null value or absence of value.
    Null,
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl ContextValue {
    /// `false` for [`ContextValue::Null`].
    pub fn is_present(&self) -> bool {
        !matches!(self, ContextValue::Null)
    }

    /// Returns the list items, or `None` for non-list values.
    pub fn as_list(&self) -> Option<&[ContextValue]> {
        match self {
            ContextValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// String form used by string and array operators. Integral numbers print without a fraction
    /// (`42`, not `42.0`); lists join their items with commas.
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        match self {
            ContextValue::String(s) => Cow::Borrowed(s),
            ContextValue::Number(n) => Cow::Owned(format_number(*n)),
            ContextValue::Boolean(b) => Cow::Borrowed(if *b { "true" } else { "false" }),
            ContextValue::List(items) => Cow::Owned(
                items
                    .iter()
                    .map(|item| item.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            ContextValue::Null => Cow::Borrowed(""),
        }
    }

    /// Numeric form used by number operators. Values that are not numbers yield `NaN`, so every
    /// comparison against them fails.
    pub fn to_number(&self) -> f64 {
        match self {
            ContextValue::Number(n) => *n,
            ContextValue::String(s) => s.trim().parse().unwrap_or(f64::NAN),
            ContextValue::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            ContextValue::List(_) | ContextValue::Null => f64::NAN,
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextValue, EvaluationContext};

    #[test]
    fn resolves_standard_fields_and_properties() {
        let context = EvaluationContext::default()
            .with_user_id("user-1")
            .with_property("plan", "pro")
            .with_property("deleted", ContextValue::Null);

        assert_eq!(
            context.get_field("userId").as_deref(),
            Some(&ContextValue::from("user-1"))
        );
        assert_eq!(
            context.get_field("plan").as_deref(),
            Some(&ContextValue::from("pro"))
        );
        assert!(context.get_field("sessionId").is_none());
        assert!(context.get_field("deleted").is_none());
        assert!(context.get_field("unknown").is_none());
    }

    #[test]
    fn stringifies_like_template_authors_expect() {
        assert_eq!(ContextValue::from(42.0).to_string_lossy(), "42");
        assert_eq!(ContextValue::from(1.5).to_string_lossy(), "1.5");
        assert_eq!(ContextValue::from(true).to_string_lossy(), "true");
        assert_eq!(
            ContextValue::from(vec![ContextValue::from("a"), ContextValue::from(2.0)])
                .to_string_lossy(),
            "a,2"
        );
    }

    #[test]
    fn coerces_to_number() {
        assert_eq!(ContextValue::from(" 12.5 ").to_number(), 12.5);
        assert_eq!(ContextValue::from(true).to_number(), 1.0);
        assert!(ContextValue::from("abc").to_number().is_nan());
        assert!(ContextValue::Null.to_number().is_nan());
    }

    #[test]
    fn deserializes_untagged_values() {
        let value: ContextValue = serde_json::from_str(r#"["a", 1, true, null]"#).unwrap();
        assert_eq!(
            value,
            ContextValue::List(vec![
                "a".into(),
                1.0.into(),
                true.into(),
                ContextValue::Null
            ])
        );
    }
}
