//! Rule registry: tag patterns mapped to transformation handlers.
//!
//! A [`Model`] is the explicit, statically assembled rule table for one
//! record type. It is built once with [`ModelBuilder`], which checks the
//! registrations for conflicts, and is never mutated during a run.
//!
//! # Examples
//!
//! ```ignore
//! use cds_migrator::rules::{HandlerOutcome, Model, Rule};
//! use cds_migrator::cleaners::clean_str;
//!
//! let model = Model::builder("documents")
//!     .rule(
//!         Rule::new("title", "245__", |_acc, _key, occ| {
//!             let map = occ.subfields().unwrap();
//!             let title = clean_str('a', map, true)?;
//!             Ok(title.map_or(HandlerOutcome::Dropped, HandlerOutcome::written))
//!         })
//!         .requires(&['a']),
//!     )
//!     .ignore(["005", "595__"])
//!     .build()?;
//! # Ok::<(), cds_migrator::MigrationError>(())
//! ```

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use crate::dispatcher::Accumulator;
use crate::error::{MigrationError, Result};
use crate::record::{Occurrence, SubfieldMap};

/// What a handler produced for one call.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Merge this value into the accumulator under the rule's output key
    Written(Value),
    /// Nothing to write for this occurrence
    Dropped,
}

impl HandlerOutcome {
    /// Wrap anything convertible to JSON.
    pub fn written(value: impl Into<Value>) -> Self {
        HandlerOutcome::Written(value.into())
    }
}

/// Result of a handler call.
pub type HandlerResult = Result<HandlerOutcome>;

/// Handler called once per tag occurrence.
pub type OccurrenceFn = dyn Fn(&mut Accumulator, &str, &Occurrence) -> HandlerResult + Send + Sync;

/// Handler called once with every occurrence of the tag.
pub type CollectFn = dyn Fn(&mut Accumulator, &str, &[Occurrence]) -> HandlerResult + Send + Sync;

/// Iteration mode plus the handler itself.
#[derive(Clone)]
pub enum Handler {
    /// Called once per physical occurrence
    PerOccurrence(Arc<OccurrenceFn>),
    /// Called once with all occurrences
    CollectAll(Arc<CollectFn>),
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::PerOccurrence(_) => write!(f, "Handler::PerOccurrence"),
            Handler::CollectAll(_) => write!(f, "Handler::CollectAll"),
        }
    }
}

/// How a written value is merged into the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Merge {
    /// Overwrite the output key
    #[default]
    Replace,
    /// Push the value onto the output list (`for_each_value`)
    Append,
    /// Push every element of a returned array onto the output list
    Extend,
}

/// One registered mapping from a tag pattern to a handler.
#[derive(Debug, Clone)]
pub struct Rule {
    output_key: String,
    pattern: String,
    handler: Handler,
    merge: Merge,
    requires: Vec<char>,
    override_existing: bool,
}

impl Rule {
    /// Rule whose handler is called once per tag occurrence.
    ///
    /// `pattern` is a regex over tag keys; it must match the whole key.
    pub fn new<F>(output_key: impl Into<String>, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut Accumulator, &str, &Occurrence) -> HandlerResult + Send + Sync + 'static,
    {
        Rule {
            output_key: output_key.into(),
            pattern: pattern.into(),
            handler: Handler::PerOccurrence(Arc::new(handler)),
            merge: Merge::Replace,
            requires: Vec::new(),
            override_existing: false,
        }
    }

    /// Rule whose handler receives every occurrence of the tag at once.
    pub fn collect<F>(output_key: impl Into<String>, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut Accumulator, &str, &[Occurrence]) -> HandlerResult + Send + Sync + 'static,
    {
        Rule {
            output_key: output_key.into(),
            pattern: pattern.into(),
            handler: Handler::CollectAll(Arc::new(handler)),
            merge: Merge::Replace,
            requires: Vec::new(),
            override_existing: false,
        }
    }

    /// Append each written value to a list under the output key.
    #[must_use]
    pub fn append(mut self) -> Self {
        self.merge = Merge::Append;
        self
    }

    /// Append every element of written arrays to a list under the output key.
    #[must_use]
    pub fn extend(mut self) -> Self {
        self.merge = Merge::Extend;
        self
    }

    /// Skip occurrences lacking any of these subfield codes.
    #[must_use]
    pub fn requires(mut self, codes: &[char]) -> Self {
        for code in codes {
            if !self.requires.contains(code) {
                self.requires.push(*code);
            }
        }
        self
    }

    /// Allow this rule to replace an earlier one with the same pattern and output key.
    #[must_use]
    pub fn overriding(mut self) -> Self {
        self.override_existing = true;
        self
    }

    /// Destination key in the output document.
    #[must_use]
    pub fn output_key(&self) -> &str {
        &self.output_key
    }

    /// Source pattern, as registered.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The handler and its iteration mode.
    #[must_use]
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Merge mode.
    #[must_use]
    pub fn merge(&self) -> Merge {
        self.merge
    }

    /// Required subfield codes.
    #[must_use]
    pub fn required_subfields(&self) -> &[char] {
        &self.requires
    }

    /// Whether an occurrence satisfies the `requires` precondition.
    #[must_use]
    pub fn accepts(&self, occurrence: &Occurrence) -> bool {
        occurrence.has_subfields(&self.requires)
    }
}

/// A rule with its compiled pattern.
#[derive(Debug, Clone)]
pub(crate) struct CompiledRule {
    pub(crate) rule: Rule,
    pub(crate) regex: Regex,
}

fn compile_anchored(pattern: &str, model: &str) -> Result<Regex> {
    let trimmed = pattern.trim_start_matches('^').trim_end_matches('$');
    Regex::new(&format!("^(?:{trimmed})$")).map_err(|e| {
        MigrationError::Configuration(format!(
            "model {model}: invalid tag pattern {pattern:?}: {e}"
        ))
    })
}

/// The rule table of one record type.
#[derive(Debug, Clone)]
pub struct Model {
    name: String,
    rules: Vec<CompiledRule>,
    ignore: Vec<(String, Regex)>,
}

impl Model {
    /// Start building a model.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ModelBuilder {
        ModelBuilder {
            name: name.into(),
            rules: Vec::new(),
            ignore: Vec::new(),
        }
    }

    /// Model name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered rules in registration order.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(|compiled| &compiled.rule)
    }

    /// Rules whose pattern matches `key`, in registration order.
    pub fn rules_for<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Rule> + 'a {
        self.rules
            .iter()
            .filter(move |compiled| compiled.regex.is_match(key))
            .map(|compiled| &compiled.rule)
    }

    /// Whether some rule matches `key`.
    #[must_use]
    pub fn has_rule_for(&self, key: &str) -> bool {
        self.rules.iter().any(|compiled| compiled.regex.is_match(key))
    }

    /// Whether `key` is in the ignore set.
    #[must_use]
    pub fn is_ignored(&self, key: &str) -> bool {
        self.ignore.iter().any(|(_, re)| re.is_match(key))
    }

    /// Whether every occurrence of `key` is knowingly dropped.
    ///
    /// Either the tag key itself is ignored, or each subfield code present
    /// is ignored as `key` followed by the code (`8564_8` ignores `$8` of
    /// `8564_`).
    #[must_use]
    pub fn ignores_occurrences(&self, key: &str, occurrences: &[Occurrence]) -> bool {
        if self.is_ignored(key) {
            return true;
        }
        let mut codes = occurrences
            .iter()
            .filter_map(Occurrence::subfields)
            .flat_map(SubfieldMap::codes)
            .peekable();
        codes.peek().is_some()
            && occurrences.iter().all(|o| o.subfields().is_some())
            && codes.all(|code| self.is_ignored(&format!("{key}{code}")))
    }

    /// Ignore patterns as registered.
    pub fn ignore_patterns(&self) -> impl Iterator<Item = &str> {
        self.ignore.iter().map(|(pattern, _)| pattern.as_str())
    }
}

/// Builder for [`Model`], validating registrations at build time.
#[derive(Debug)]
pub struct ModelBuilder {
    name: String,
    rules: Vec<Rule>,
    ignore: Vec<String>,
}

impl ModelBuilder {
    /// Inherit every rule and ignore pattern of `base`.
    ///
    /// Rules registered afterwards for the same pattern and output key must
    /// use [`Rule::overriding`].
    #[must_use]
    pub fn extend(mut self, base: &Model) -> Self {
        self.rules.extend(base.rules().cloned());
        self.ignore.extend(base.ignore_patterns().map(str::to_string));
        self
    }

    /// Register a rule.
    #[must_use]
    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Register tag or tag-plus-subfield patterns that are dropped knowingly,
    /// without a handler.
    #[must_use]
    pub fn ignore<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Compile patterns and check for conflicting registrations.
    ///
    /// An overriding rule replaces the earlier rule in place, so tag
    /// processing order stays the registration order of the replaced rule.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::Configuration`] for an invalid pattern or a
    /// second rule on the same pattern and output key without override.
    pub fn build(self) -> Result<Model> {
        let mut rules: Vec<CompiledRule> = Vec::with_capacity(self.rules.len());

        for rule in self.rules {
            let existing = rules.iter().position(|c| {
                c.rule.pattern == rule.pattern && c.rule.output_key == rule.output_key
            });
            match (existing, rule.override_existing) {
                (Some(index), true) => {
                    tracing::debug!(
                        model = %self.name,
                        pattern = %rule.pattern,
                        key = %rule.output_key,
                        "rule overridden"
                    );
                    let regex = compile_anchored(&rule.pattern, &self.name)?;
                    rules[index] = CompiledRule { rule, regex };
                },
                (Some(_), false) => {
                    return Err(MigrationError::Configuration(format!(
                        "model {}: duplicate rule for pattern {:?} and output key {:?} \
                         without override",
                        self.name, rule.pattern, rule.output_key
                    )));
                },
                (None, _) => {
                    let regex = compile_anchored(&rule.pattern, &self.name)?;
                    rules.push(CompiledRule { rule, regex });
                },
            }
        }

        let mut ignore = Vec::with_capacity(self.ignore.len());
        for pattern in self.ignore {
            if ignore.iter().any(|(existing, _): &(String, Regex)| *existing == pattern) {
                continue;
            }
            let regex = compile_anchored(&pattern, &self.name)?;
            ignore.push((pattern, regex));
        }

        Ok(Model {
            name: self.name,
            rules,
            ignore,
        })
    }
}
