//! Transformation steps.
//!
//! Steps are the per-record units of work a driver runs in registration
//! order. The extraction language itself is external; these built-ins wrap
//! closures so any extraction logic can be plugged in.

mod cache;

pub use cache::HelperCache;

use crate::context::ProcessingContext;
use serde_json::Value;
use std::fmt::Debug;

/// A per-record transformation unit.
///
/// Implementations populate output fields, write to the clipboard, or mark
/// the record skipped. Returning an error aborts the run: errors signal a
/// logic or configuration bug, not bad data. Bad data should `skip`.
pub trait TransformationStep<R>: Send + Sync + Debug {
    /// Human readable description, used to attribute errors.
    fn description(&self) -> &str;

    /// Executes the step against one record.
    fn execute(&self, context: &mut ProcessingContext<R>) -> anyhow::Result<()>;
}

type FieldExtractor<R> = dyn Fn(&ProcessingContext<R>) -> anyhow::Result<Vec<Value>> + Send + Sync;

/// A step that appends extracted values to one output field.
///
/// Several steps may target the same field; their values accumulate in
/// registration order.
pub struct ToFieldStep<R> {
    field: String,
    description: String,
    allow_empty: bool,
    extract: Box<FieldExtractor<R>>,
}

impl<R> ToFieldStep<R> {
    /// Creates a field step from an extractor closure.
    pub fn new<F>(field: impl Into<String>, extract: F) -> Self
    where
        F: Fn(&ProcessingContext<R>) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        let field = field.into();
        Self {
            description: format!("to_field '{field}'"),
            field,
            allow_empty: false,
            extract: Box::new(extract),
        }
    }

    /// Sets whether an empty result still creates the field.
    #[must_use]
    pub fn with_allow_empty(mut self, allow_empty: bool) -> Self {
        self.allow_empty = allow_empty;
        self
    }

    /// Returns the target field.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }
}

impl<R> Debug for ToFieldStep<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToFieldStep")
            .field("field", &self.field)
            .field("allow_empty", &self.allow_empty)
            .finish()
    }
}

impl<R> TransformationStep<R> for ToFieldStep<R> {
    fn description(&self) -> &str {
        &self.description
    }

    fn execute(&self, context: &mut ProcessingContext<R>) -> anyhow::Result<()> {
        let values = (self.extract)(context)?;
        if values.is_empty() {
            if self.allow_empty {
                context.output.ensure_field(&self.field);
            }
        } else {
            context.output.append(&self.field, values);
        }
        Ok(())
    }
}

type RecordCallback<R> = dyn Fn(&mut ProcessingContext<R>) -> anyhow::Result<()> + Send + Sync;

/// A step with full mutable access to the context.
pub struct EachRecordStep<R> {
    description: String,
    func: Box<RecordCallback<R>>,
}

impl<R> EachRecordStep<R> {
    /// Creates a step from a closure.
    pub fn new<F>(description: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut ProcessingContext<R>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            func: Box::new(func),
        }
    }
}

impl<R> Debug for EachRecordStep<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EachRecordStep")
            .field("description", &self.description)
            .finish()
    }
}

impl<R> TransformationStep<R> for EachRecordStep<R> {
    fn description(&self) -> &str {
        &self.description
    }

    fn execute(&self, context: &mut ProcessingContext<R>) -> anyhow::Result<()> {
        (self.func)(context)
    }
}

type TextSelector<R> = dyn Fn(&R) -> Vec<String> + Send + Sync;

/// A step that appends regex matches found in text taken from the record.
///
/// The first capture group is used when the pattern has one, otherwise the
/// whole match. The pattern is compiled once per run through the context's
/// helper cache.
pub struct RegexCaptureStep<R> {
    field: String,
    pattern: String,
    description: String,
    allow_empty: bool,
    select: Box<TextSelector<R>>,
}

impl<R> RegexCaptureStep<R> {
    /// Creates a regex step.
    pub fn new<F>(field: impl Into<String>, pattern: impl Into<String>, select: F) -> Self
    where
        F: Fn(&R) -> Vec<String> + Send + Sync + 'static,
    {
        let field = field.into();
        let pattern = pattern.into();
        Self {
            description: format!("to_field '{field}' matching /{pattern}/"),
            field,
            pattern,
            allow_empty: false,
            select: Box::new(select),
        }
    }

    /// Sets whether an empty result still creates the field.
    #[must_use]
    pub fn with_allow_empty(mut self, allow_empty: bool) -> Self {
        self.allow_empty = allow_empty;
        self
    }
}

impl<R> Debug for RegexCaptureStep<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegexCaptureStep")
            .field("field", &self.field)
            .field("pattern", &self.pattern)
            .finish()
    }
}

impl<R> TransformationStep<R> for RegexCaptureStep<R> {
    fn description(&self) -> &str {
        &self.description
    }

    fn execute(&self, context: &mut ProcessingContext<R>) -> anyhow::Result<()> {
        let regex = context.helpers().regex(&self.pattern)?;
        let mut values = Vec::new();
        for text in (self.select)(context.source_record()) {
            for captures in regex.captures_iter(&text) {
                if let Some(m) = captures.get(1).or_else(|| captures.get(0)) {
                    values.push(Value::String(m.as_str().to_string()));
                }
            }
        }

        if values.is_empty() {
            if self.allow_empty {
                context.output.ensure_field(&self.field);
            }
        } else {
            context.output.append(&self.field, values);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Debug)]
    struct Book {
        title: String,
        notes: Vec<String>,
    }

    fn book() -> Book {
        Book {
            title: "Moby Dick".to_string(),
            notes: vec!["Printed 1851, reprinted 1892".to_string(), "no year".to_string()],
        }
    }

    #[test]
    fn test_to_field_appends() {
        let step = ToFieldStep::new("title", |ctx: &ProcessingContext<Book>| {
            Ok(vec![json!(ctx.source_record().title)])
        });
        assert_eq!(step.description(), "to_field 'title'");
        assert_eq!(step.field(), "title");

        let mut ctx = ProcessingContext::new(1, book());
        step.execute(&mut ctx).unwrap();
        assert_eq!(ctx.output.get("title").unwrap(), &[json!("Moby Dick")]);
    }

    #[test]
    fn test_same_field_accumulates() {
        let first = ToFieldStep::new("subject", |_: &ProcessingContext<Book>| Ok(vec![json!("whales")]));
        let second = ToFieldStep::new("subject", |_: &ProcessingContext<Book>| Ok(vec![json!("sea")]));

        let mut ctx = ProcessingContext::new(1, book());
        first.execute(&mut ctx).unwrap();
        second.execute(&mut ctx).unwrap();
        assert_eq!(ctx.output.get("subject").unwrap(), &[json!("whales"), json!("sea")]);
    }

    #[test]
    fn test_empty_result_respects_allow_empty() {
        let strict = ToFieldStep::new("empty", |_: &ProcessingContext<Book>| Ok(Vec::new()));
        let lenient =
            ToFieldStep::new("lenient", |_: &ProcessingContext<Book>| Ok(Vec::new())).with_allow_empty(true);

        let mut ctx = ProcessingContext::new(1, book());
        strict.execute(&mut ctx).unwrap();
        lenient.execute(&mut ctx).unwrap();
        assert!(!ctx.output.contains("empty"));
        assert!(ctx.output.contains("lenient"));
    }

    #[test]
    fn test_extractor_error_propagates() {
        let step = ToFieldStep::new("bad", |_: &ProcessingContext<Book>| anyhow::bail!("no such subfield"));
        let mut ctx = ProcessingContext::new(1, book());
        let err = step.execute(&mut ctx).unwrap_err();
        assert_eq!(err.to_string(), "no such subfield");
    }

    #[test]
    fn test_each_record_can_skip() {
        let step = EachRecordStep::new("skip short titles", |ctx: &mut ProcessingContext<Book>| {
            if ctx.source_record().title.len() < 20 {
                ctx.skip("title too short");
            }
            Ok(())
        });
        let mut ctx = ProcessingContext::new(1, book());
        step.execute(&mut ctx).unwrap();
        assert_eq!(ctx.skip_reason(), Some("title too short"));
        assert_eq!(step.description(), "skip short titles");
    }

    #[test]
    fn test_regex_capture_step() {
        let step = RegexCaptureStep::new("year", r"\b(1[0-9]{3})\b", |b: &Book| b.notes.clone());
        let mut ctx = ProcessingContext::new(1, book());
        step.execute(&mut ctx).unwrap();
        assert_eq!(ctx.output.get("year").unwrap(), &[json!("1851"), json!("1892")]);
        assert_eq!(ctx.helpers().len(), 1);
    }

    #[test]
    fn test_regex_capture_invalid_pattern_errors() {
        let step = RegexCaptureStep::new("year", "(", |b: &Book| vec![b.title.clone()]);
        let mut ctx = ProcessingContext::new(1, book());
        assert!(step.execute(&mut ctx).is_err());
    }
}
