//! Rules evaluated against converted resources.
//!
//! Only a small rule vocabulary is provided: regular expressions over the
//! text of a resource and a rule that matches everything. Rules are carried
//! in scan specifications as [`RuleSpec`] values and compiled into
//! [`Matcher`]s by the worker that evaluates them.

use crate::conversions::{ConversionError, ConversionRegistry, OutputType};
use crate::model::Resource;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Characters of surrounding text kept on each side of a match.
pub const CONTEXT_CHARS: usize = 50;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("Invalid regular expression: {0}")]
    InvalidExpression(#[from] regex::Error),

    #[error("Conversion failed: {0}")]
    Conversion(#[from] ConversionError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RuleSpec {
    Regex {
        expression: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    Always,
}

impl RuleSpec {
    pub fn regex(expression: impl Into<String>) -> Self {
        RuleSpec::Regex {
            expression: expression.into(),
            case_sensitive: false,
        }
    }

    pub fn compile(&self) -> Result<Box<dyn Matcher>, MatchError> {
        match self {
            RuleSpec::Regex {
                expression,
                case_sensitive,
            } => {
                let regex = RegexBuilder::new(expression)
                    .case_insensitive(!case_sensitive)
                    .build()?;
                Ok(Box::new(RegexMatcher { regex }))
            }
            RuleSpec::Always => Ok(Box::new(AlwaysMatcher)),
        }
    }
}

/// One occurrence of a rule in a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
    pub offset: usize,
    pub context: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub matched: bool,
    /// The resource had no value of the required kind.
    pub no_data: bool,
    pub matches: Vec<Fragment>,
}

impl MatchOutcome {
    fn no_data() -> Self {
        MatchOutcome {
            no_data: true,
            ..Default::default()
        }
    }
}

pub trait Matcher: Send + Sync {
    /// The kind of converted value this matcher inspects.
    fn required(&self) -> OutputType;

    fn match_resource(
        &self,
        resource: &Resource<'_>,
        registry: &ConversionRegistry,
    ) -> Result<MatchOutcome, MatchError>;
}

/// Converts `resource` for `matcher`, mapping "nothing to convert with" and
/// "converted to nothing" to `None`.
fn required_value(
    matcher: &dyn Matcher,
    resource: &Resource<'_>,
    registry: &ConversionRegistry,
) -> Result<Option<Value>, MatchError> {
    match registry.convert(resource, matcher.required(), None) {
        Ok(result) => Ok(result.value),
        Err(ConversionError::NoConverter { .. }) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub struct RegexMatcher {
    regex: Regex,
}

impl RegexMatcher {
    pub fn find(&self, text: &str) -> Vec<Fragment> {
        self.regex
            .find_iter(text)
            .map(|m| Fragment {
                text: m.as_str().to_string(),
                offset: m.start(),
                context: context(text, m.start(), m.end()),
            })
            .collect()
    }
}

impl Matcher for RegexMatcher {
    fn required(&self) -> OutputType {
        OutputType::Text
    }

    fn match_resource(
        &self,
        resource: &Resource<'_>,
        registry: &ConversionRegistry,
    ) -> Result<MatchOutcome, MatchError> {
        let Some(value) = required_value(self, resource, registry)? else {
            return Ok(MatchOutcome::no_data());
        };
        let Some(text) = value.as_str() else {
            return Ok(MatchOutcome::no_data());
        };

        let matches = self.find(text);
        Ok(MatchOutcome {
            matched: !matches.is_empty(),
            no_data: false,
            matches,
        })
    }
}

pub struct AlwaysMatcher;

impl Matcher for AlwaysMatcher {
    fn required(&self) -> OutputType {
        OutputType::AlwaysTrue
    }

    fn match_resource(
        &self,
        resource: &Resource<'_>,
        registry: &ConversionRegistry,
    ) -> Result<MatchOutcome, MatchError> {
        match required_value(self, resource, registry)? {
            Some(value) => Ok(MatchOutcome {
                matched: value.as_bool().unwrap_or(false),
                no_data: false,
                matches: Vec::new(),
            }),
            None => Ok(MatchOutcome::no_data()),
        }
    }
}

/// Up to [`CONTEXT_CHARS`] characters on each side of `text[start..end]`.
fn context(text: &str, start: usize, end: usize) -> String {
    let before = text[..start]
        .char_indices()
        .rev()
        .nth(CONTEXT_CHARS - 1)
        .map_or(0, |(i, _)| i);
    let after = text[end..]
        .char_indices()
        .nth(CONTEXT_CHARS)
        .map_or(text.len(), |(i, _)| end + i);
    text[before..after].to_string()
}
