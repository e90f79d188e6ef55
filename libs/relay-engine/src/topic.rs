use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use regex::Regex;

use relay_api::format::TypeBinding;

use crate::app::{App, StreamHandle, StreamHandler, StreamOptions};
use crate::consumer::TopicConsumer;
use crate::error::EngineError;

/// Default template for `derive`.
pub const DEFAULT_NAME_FORMAT: &str = "{prefix}{topic}{suffix}";

/// Produces fresh consumers bound to a subscription target.
pub trait Subscribable {
    fn subscribe(&self) -> Arc<TopicConsumer>;
}

/// What a descriptor subscribes to: named topics or every topic matching a pattern.
#[derive(Debug, Clone)]
pub enum Selector {
    Topics(Vec<String>),
    Pattern(Regex),
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Selector {}

impl PartialOrd for Selector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Topic lists sort before patterns; lists compare element-wise, patterns by source text.
impl Ord for Selector {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Selector::Topics(a), Selector::Topics(b)) => a.cmp(b),
            (Selector::Pattern(a), Selector::Pattern(b)) => a.as_str().cmp(b.as_str()),
            (Selector::Topics(_), Selector::Pattern(_)) => Ordering::Less,
            (Selector::Pattern(_), Selector::Topics(_)) => Ordering::Greater,
        }
    }
}

/// Arguments for `Topic::new`. Exactly one of `topics` / `pattern` must be set.
#[derive(Debug, Clone, Default)]
pub struct TopicOptions {
    pub topics: Option<Vec<String>>,
    pub pattern: Option<String>,
    pub key_type: Option<TypeBinding>,
    pub value_type: Option<TypeBinding>,
}

impl TopicOptions {
    pub fn topics<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: Some(names.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Self::default()
        }
    }

    pub fn key_type(mut self, ty: TypeBinding) -> Self {
        self.key_type = Some(ty);
        self
    }

    pub fn value_type(mut self, ty: TypeBinding) -> Self {
        self.value_type = Some(ty);
        self
    }
}

/// Arguments for `Topic::derive`.
#[derive(Debug, Clone)]
pub struct DeriveOptions {
    /// Source names to reformat; defaults to the parent's topics.
    pub topics: Option<Vec<String>>,
    pub key_type: Option<TypeBinding>,
    pub value_type: Option<TypeBinding>,
    pub prefix: String,
    pub suffix: String,
    /// Template with `{prefix}`, `{topic}` and `{suffix}` placeholders.
    pub format: String,
}

impl Default for DeriveOptions {
    fn default() -> Self {
        Self {
            topics: None,
            key_type: None,
            value_type: None,
            prefix: String::new(),
            suffix: String::new(),
            format: DEFAULT_NAME_FORMAT.to_string(),
        }
    }
}

impl DeriveOptions {
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    fn render(&self, topic: &str) -> String {
        self.format
            .replace("{prefix}", &self.prefix)
            .replace("{topic}", topic)
            .replace("{suffix}", &self.suffix)
    }
}

/// Subscription target: topic names or a pattern, plus key/value type bindings.
///
/// Immutable once built; `derive` creates a new descriptor. Equality and
/// ordering look at the selector and the type bindings, not the app.
#[derive(Clone)]
pub struct Topic {
    app: App,
    selector: Selector,
    key_type: Option<TypeBinding>,
    value_type: Option<TypeBinding>,
}

impl Topic {
    pub fn new(app: &App, options: TopicOptions) -> Result<Self, EngineError> {
        let topics = options.topics.filter(|t| !t.is_empty());
        let selector = match (topics, options.pattern) {
            (Some(_), Some(_)) => {
                return Err(EngineError::Config(
                    "cannot specify both topics and pattern".into(),
                ));
            }
            (Some(topics), None) => Selector::Topics(topics),
            (None, Some(pattern)) => Selector::Pattern(Regex::new(&pattern).map_err(|e| {
                EngineError::Config(format!("invalid topic pattern '{pattern}': {e}"))
            })?),
            (None, None) => {
                return Err(EngineError::Config(
                    "either topics or pattern must be specified".into(),
                ));
            }
        };
        Ok(Self {
            app: app.clone(),
            selector,
            key_type: options.key_type,
            value_type: options.value_type,
        })
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Explicit topic names, `None` for pattern-based descriptors.
    pub fn topics(&self) -> Option<&[String]> {
        match &self.selector {
            Selector::Topics(t) => Some(t),
            Selector::Pattern(_) => None,
        }
    }

    pub fn pattern(&self) -> Option<&Regex> {
        match &self.selector {
            Selector::Pattern(p) => Some(p),
            Selector::Topics(_) => None,
        }
    }

    pub fn key_type(&self) -> Option<TypeBinding> {
        self.key_type
    }

    pub fn value_type(&self) -> Option<TypeBinding> {
        self.value_type
    }

    /// New descriptor with every topic name run through `options.format`.
    ///
    /// Unset type overrides are inherited. Pattern-based descriptors cannot be derived.
    pub fn derive(&self, options: DeriveOptions) -> Result<Topic, EngineError> {
        let parent = match &self.selector {
            Selector::Topics(t) => t,
            Selector::Pattern(p) => {
                return Err(EngineError::Config(format!(
                    "cannot derive from topic with pattern '{}'",
                    p.as_str()
                )));
            }
        };
        let sources = options.topics.as_ref().unwrap_or(parent);
        let topics = sources.iter().map(|t| options.render(t)).collect();

        Ok(Topic {
            app: self.app.clone(),
            selector: Selector::Topics(topics),
            key_type: options.key_type.or(self.key_type),
            value_type: options.value_type.or(self.value_type),
        })
    }

    /// Build a stream processor over this descriptor. See `App::stream`.
    pub fn stream(
        &self,
        handler: StreamHandler,
        options: StreamOptions,
    ) -> Result<StreamHandle, EngineError> {
        self.app.stream(self, handler, options)
    }
}

impl Subscribable for Topic {
    fn subscribe(&self) -> Arc<TopicConsumer> {
        Arc::new(TopicConsumer::new(self.clone()))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            Selector::Pattern(p) => f.write_str(p.as_str()),
            Selector::Topics(t) => f.write_str(&t.join(",")),
        }
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Topic: {self}>")
    }
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Topic {}

impl PartialOrd for Topic {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Topic {
    fn cmp(&self, other: &Self) -> Ordering {
        self.selector
            .cmp(&other.selector)
            .then(self.key_type.cmp(&other.key_type))
            .then(self.value_type.cmp(&other.value_type))
    }
}
