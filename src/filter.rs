//!
//! This module defines the filter expressions a consumer subscribes with.
//!
//! Two variants exist: tag expressions (`"TagA || TagC"`, or `"*"` for all)
//! and SQL-92 predicates over user properties. SQL evaluation itself is not
//! implemented here; an [`SqlEvaluator`] is injected and compiles the opaque
//! expression once, at subscribe time.
//!

use crate::error::ClientError;
use crate::message::MessageExt;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Set of tags to accept, or everything when subscribed with `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagExpression {
    All,
    Tags(HashSet<String>),
}

impl TagExpression {
    /// Parse the demo subscription syntax: `*`, or tags joined by `||`.
    pub fn parse(expression: &str) -> Result<Self, ClientError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(ClientError::Filter {
                expression: expression.to_owned(),
                reason: "empty tag expression".to_owned(),
            });
        }
        if trimmed == "*" {
            return Ok(TagExpression::All);
        }

        let mut tags = HashSet::new();
        for part in trimmed.split("||") {
            let tag = part.trim();
            if tag.is_empty() || tag == "*" {
                return Err(ClientError::Filter {
                    expression: expression.to_owned(),
                    reason: format!("invalid tag `{}`", part),
                });
            }
            tags.insert(tag.to_owned());
        }
        Ok(TagExpression::Tags(tags))
    }

    pub fn matches(&self, tag: Option<&str>) -> bool {
        match self {
            TagExpression::All => true,
            TagExpression::Tags(tags) => tag.map(|t| tags.contains(t)).unwrap_or(false),
        }
    }
}

/// A compiled SQL predicate, ready to test a message's properties.
///
/// Contract: a message whose referenced property is absent fails the predicate
/// unless the expression explicitly tests for null/absence.
pub trait CompiledFilter: Send + Sync {
    fn matches(&self, properties: &HashMap<String, String>) -> bool;
}

/// The injected predicate service that turns an opaque SQL-92 expression into
/// a [`CompiledFilter`]. Compilation failures surface as [`ClientError::Filter`]
/// at subscribe time, before anything is registered.
pub trait SqlEvaluator: Send + Sync {
    fn compile(&self, expression: &str) -> Result<Arc<dyn CompiledFilter>, ClientError>;
}

/// An opaque SQL-92 predicate paired with its compiled form.
#[derive(Clone)]
pub struct SqlExpression {
    pub expression: String,
    compiled: Arc<dyn CompiledFilter>,
}

impl SqlExpression {
    pub fn compile(expression: &str, evaluator: &dyn SqlEvaluator) -> Result<Self, ClientError> {
        let compiled = evaluator.compile(expression)?;
        Ok(SqlExpression {
            expression: expression.to_owned(),
            compiled,
        })
    }

    pub fn matches(&self, properties: &HashMap<String, String>) -> bool {
        self.compiled.matches(properties)
    }
}

impl fmt::Debug for SqlExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlExpression")
            .field("expression", &self.expression)
            .finish()
    }
}

/// What a consumer subscribes with: tag set or SQL predicate.
#[derive(Debug, Clone)]
pub enum FilterExpression {
    Tag(TagExpression),
    Sql(SqlExpression),
}

impl FilterExpression {
    pub fn matches(&self, message: &MessageExt) -> bool {
        match self {
            FilterExpression::Tag(tags) => tags.matches(message.tag()),
            FilterExpression::Sql(sql) => sql.matches(&message.message.properties),
        }
    }
}

/// One topic's registered filter. A consumer owns at most one per topic;
/// re-subscribing replaces it.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic: String,
    pub expression: FilterExpression,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, expression: FilterExpression) -> Self {
        Subscription {
            topic: topic.into(),
            expression,
        }
    }
}
