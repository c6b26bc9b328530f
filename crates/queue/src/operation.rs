//! Typed data operations that can be registered as a handler.
//!
//! An [`OperationHandler`] applies a fixed list of [`Operation`]s, in
//! order, to a JSON array payload. Predicates and transforms are plain
//! function values supplied by the caller.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::HandlerError;
use crate::handler::{ExecutionContext, RequestHandler};

pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type TransformFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    Sum,
    Mean,
    Min,
    Max,
    Count,
}

#[derive(Clone)]
pub enum Operation {
    /// Numbers numerically, strings lexically; mixed arrays order by kind.
    Sort { descending: bool },
    Filter(Predicate),
    /// Collapses the array into a single value.
    Aggregate(AggregateKind),
    /// Applied to each element of an array, or to a scalar.
    Transform(TransformFn),
}

impl Operation {
    pub fn filter<F>(f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Operation::Filter(Arc::new(f))
    }

    pub fn transform<F>(f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Operation::Transform(Arc::new(f))
    }

    pub fn apply(&self, input: Value) -> Result<Value, HandlerError> {
        match self {
            Operation::Sort { descending } => {
                let mut items = expect_array(input, "sort")?;
                items.sort_by(compare_values);
                if *descending {
                    items.reverse();
                }
                Ok(Value::Array(items))
            }
            Operation::Filter(pred) => {
                let items = expect_array(input, "filter")?;
                Ok(Value::Array(items.into_iter().filter(|v| pred(v)).collect()))
            }
            Operation::Aggregate(kind) => {
                let items = expect_array(input, "aggregate")?;
                aggregate(*kind, items)
            }
            Operation::Transform(f) => match input {
                Value::Array(items) => Ok(Value::Array(items.into_iter().map(|v| f(v)).collect())),
                scalar => Ok(f(scalar)),
            },
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Sort { descending } => f.debug_struct("Sort").field("descending", descending).finish(),
            Operation::Filter(_) => f.write_str("Filter(..)"),
            Operation::Aggregate(kind) => f.debug_tuple("Aggregate").field(kind).finish(),
            Operation::Transform(_) => f.write_str("Transform(..)"),
        }
    }
}

fn expect_array(input: Value, op: &str) -> Result<Vec<Value>, HandlerError> {
    match input {
        Value::Array(items) => Ok(items),
        other => Err(HandlerError::InvalidPayload(format!(
            "{op} expects an array, got {}",
            kind_name(&other)
        ))),
    }
}

fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn kind_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: by kind first, then by content.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => kind_rank(a)
            .cmp(&kind_rank(b))
            .then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

fn numbers(items: &[Value], kind: AggregateKind) -> Result<Vec<f64>, HandlerError> {
    items
        .iter()
        .map(|v| {
            v.as_f64().ok_or_else(|| {
                HandlerError::InvalidPayload(format!(
                    "{kind:?} needs numeric elements, found {}",
                    kind_name(v)
                ))
            })
        })
        .collect()
}

fn aggregate(kind: AggregateKind, items: Vec<Value>) -> Result<Value, HandlerError> {
    match kind {
        AggregateKind::Count => Ok(Value::from(items.len())),
        AggregateKind::Sum => {
            let ints: Option<Vec<i64>> = items.iter().map(Value::as_i64).collect();
            if let Some(ints) = ints {
                if let Some(total) = ints.iter().try_fold(0i64, |acc, n| acc.checked_add(*n)) {
                    return Ok(Value::from(total));
                }
            }
            let total: f64 = numbers(&items, kind)?.iter().sum();
            Ok(float(total))
        }
        AggregateKind::Mean => {
            let values = numbers(&items, kind)?;
            if values.is_empty() {
                return Ok(Value::Null);
            }
            Ok(float(values.iter().sum::<f64>() / values.len() as f64))
        }
        AggregateKind::Min | AggregateKind::Max => {
            numbers(&items, kind)?;
            let pick = items.into_iter().reduce(|best, v| {
                let ord = compare_values(&v, &best);
                let better = if kind == AggregateKind::Min {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                };
                if better { v } else { best }
            });
            Ok(pick.unwrap_or(Value::Null))
        }
    }
}

fn float(x: f64) -> Value {
    Number::from_f64(x).map(Value::Number).unwrap_or(Value::Null)
}

// ── Handler ───────────────────────────────────────────────────

/// Runs a pipeline of operations over the request payload.
#[derive(Debug, Clone, Default)]
pub struct OperationHandler {
    ops: Vec<Operation>,
}

impl OperationHandler {
    pub fn new(ops: Vec<Operation>) -> Self {
        Self { ops }
    }

    pub fn then(mut self, op: Operation) -> Self {
        self.ops.push(op);
        self
    }

    pub fn run(&self, payload: Value) -> Result<Value, HandlerError> {
        self.ops.iter().try_fold(payload, |acc, op| op.apply(acc))
    }
}

#[async_trait]
impl RequestHandler for OperationHandler {
    async fn handle(&self, payload: Value, ctx: ExecutionContext) -> Result<Value, HandlerError> {
        let total = self.ops.len().max(1) as f64;
        let mut acc = payload;
        for (i, op) in self.ops.iter().enumerate() {
            ctx.check_cancelled()?;
            acc = op.apply(acc)?;
            ctx.report_progress((i + 1) as f64 / total * 100.0);
        }
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sort_numbers_and_strings() {
        let asc = Operation::Sort { descending: false };
        assert_eq!(asc.apply(json!([3, 1.5, 2])).unwrap(), json!([1.5, 2, 3]));
        let desc = Operation::Sort { descending: true };
        assert_eq!(desc.apply(json!(["b", "c", "a"])).unwrap(), json!(["c", "b", "a"]));
    }

    #[test]
    fn sort_rejects_scalars() {
        let err = Operation::Sort { descending: false }.apply(json!(5)).unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
    }

    #[test]
    fn filter_then_sum() {
        let handler = OperationHandler::default()
            .then(Operation::filter(|v| v.as_i64().is_some_and(|n| n % 2 == 0)))
            .then(Operation::Aggregate(AggregateKind::Sum));
        assert_eq!(handler.run(json!([1, 2, 3, 4])).unwrap(), json!(6));
    }

    #[test]
    fn aggregates() {
        let data = json!([4, 1, 7]);
        let run = |k| Operation::Aggregate(k).apply(data.clone()).unwrap();
        assert_eq!(run(AggregateKind::Sum), json!(12));
        assert_eq!(run(AggregateKind::Count), json!(3));
        assert_eq!(run(AggregateKind::Min), json!(1));
        assert_eq!(run(AggregateKind::Max), json!(7));
        assert_eq!(run(AggregateKind::Mean), json!(4.0));
        assert_eq!(
            Operation::Aggregate(AggregateKind::Mean).apply(json!([])).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn aggregate_rejects_non_numeric() {
        let err = Operation::Aggregate(AggregateKind::Sum).apply(json!([1, "x"])).unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
    }

    #[test]
    fn transform_maps_elements() {
        let double = Operation::transform(|v| json!(v.as_i64().unwrap_or(0) * 2));
        assert_eq!(double.apply(json!([1, 2])).unwrap(), json!([2, 4]));
        assert_eq!(double.apply(json!(5)).unwrap(), json!(10));
    }

    #[tokio::test]
    async fn handler_runs_pipeline() {
        let handler = OperationHandler::new(vec![Operation::Sort { descending: false }]);
        let out = handler.handle(json!([2, 1]), ExecutionContext::detached("sort")).await;
        assert_eq!(out, Ok(json!([1, 2])));
    }
}
