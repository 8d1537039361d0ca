//! Conditional gating of workflow children
//!
//! A condition is a predicate over the mapping of parent node names to their
//! results. Field paths are dot-separated; `validate.result.valid` reads the
//! `valid` field of the `validate` node's result.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison and combinator operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Neq,
    Gt,
    Lt,
    Contains,
    Exists,
    And,
    Or,
}

/// Predicate evaluated against `{parent-name -> parent result}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Dot-separated field path; unused by `and`/`or`
    #[serde(default)]
    pub field: String,

    pub op: ConditionOp,

    #[serde(default)]
    pub value: Option<Value>,

    /// Sub-conditions for `and`/`or`
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Condition {
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            op: ConditionOp::Eq,
            value: Some(value),
            conditions: vec![],
        }
    }

    pub fn neq(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            op: ConditionOp::Neq,
            value: Some(value),
            conditions: vec![],
        }
    }

    pub fn gt(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            op: ConditionOp::Gt,
            value: Some(value),
            conditions: vec![],
        }
    }

    pub fn lt(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            op: ConditionOp::Lt,
            value: Some(value),
            conditions: vec![],
        }
    }

    pub fn contains(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            op: ConditionOp::Contains,
            value: Some(value),
            conditions: vec![],
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: ConditionOp::Exists,
            value: None,
            conditions: vec![],
        }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Self {
            field: String::new(),
            op: ConditionOp::And,
            value: None,
            conditions,
        }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self {
            field: String::new(),
            op: ConditionOp::Or,
            value: None,
            conditions,
        }
    }

    /// Evaluate against the context; missing fields make comparisons false
    pub fn evaluate(&self, context: &Value) -> bool {
        match self.op {
            ConditionOp::And => self.conditions.iter().all(|c| c.evaluate(context)),
            ConditionOp::Or => self.conditions.iter().any(|c| c.evaluate(context)),
            ConditionOp::Exists => lookup(context, &self.field).is_some(),
            ConditionOp::Eq => {
                lookup(context, &self.field) == self.value.as_ref()
            }
            ConditionOp::Neq => lookup(context, &self.field) != self.value.as_ref(),
            ConditionOp::Gt => compare(lookup(context, &self.field), self.value.as_ref())
                .is_some_and(|ord| ord == std::cmp::Ordering::Greater),
            ConditionOp::Lt => compare(lookup(context, &self.field), self.value.as_ref())
                .is_some_and(|ord| ord == std::cmp::Ordering::Less),
            ConditionOp::Contains => contains(lookup(context, &self.field), self.value.as_ref()),
        }
    }
}

/// Resolve a dot-separated path inside a JSON value
fn lookup<'a>(context: &'a Value, field: &str) -> Option<&'a Value> {
    let mut current = context;
    for part in field.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn compare(left: Option<&Value>, right: Option<&Value>) -> Option<std::cmp::Ordering> {
    let (left, right) = (left?, right?);
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(haystack: Option<&Value>, needle: Option<&Value>) -> bool {
    let (Some(haystack), Some(needle)) = (haystack, needle) else {
        return false;
    };
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.contains(needle),
        Value::Object(map) => needle.as_str().is_some_and(|n| map.contains_key(n)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "validate": {
                "result": { "valid": true, "score": 87, "tags": ["fast", "clean"] }
            },
            "fetch": { "result": null }
        })
    }

    #[test]
    fn test_eq_on_nested_field() {
        let cond = Condition::eq("validate.result.valid", json!(true));
        assert!(cond.evaluate(&context()));

        let cond = Condition::eq("validate.result.valid", json!(false));
        assert!(!cond.evaluate(&context()));
    }

    #[test]
    fn test_missing_field_is_false() {
        let cond = Condition::eq("validate.result.missing", json!(1));
        assert!(!cond.evaluate(&context()));
    }

    #[test]
    fn test_neq() {
        let cond = Condition::neq("validate.result.score", json!(90));
        assert!(cond.evaluate(&context()));
    }

    #[test]
    fn test_numeric_comparison() {
        assert!(Condition::gt("validate.result.score", json!(50)).evaluate(&context()));
        assert!(!Condition::gt("validate.result.score", json!(87)).evaluate(&context()));
        assert!(Condition::lt("validate.result.score", json!(100)).evaluate(&context()));
    }

    #[test]
    fn test_contains_array_and_string() {
        assert!(Condition::contains("validate.result.tags", json!("fast")).evaluate(&context()));
        assert!(!Condition::contains("validate.result.tags", json!("slow")).evaluate(&context()));

        let ctx = json!({"log": {"line": "connection refused"}});
        assert!(Condition::contains("log.line", json!("refused")).evaluate(&ctx));
    }

    #[test]
    fn test_exists() {
        assert!(Condition::exists("validate.result").evaluate(&context()));
        assert!(!Condition::exists("unknown.result").evaluate(&context()));
    }

    #[test]
    fn test_and_or_combinators() {
        let both = Condition::all(vec![
            Condition::eq("validate.result.valid", json!(true)),
            Condition::gt("validate.result.score", json!(50)),
        ]);
        assert!(both.evaluate(&context()));

        let either = Condition::any(vec![
            Condition::eq("validate.result.valid", json!(false)),
            Condition::gt("validate.result.score", json!(50)),
        ]);
        assert!(either.evaluate(&context()));

        let neither = Condition::any(vec![
            Condition::eq("validate.result.valid", json!(false)),
            Condition::gt("validate.result.score", json!(100)),
        ]);
        assert!(!neither.evaluate(&context()));
    }

    #[test]
    fn test_serde_round_trip() {
        let cond = Condition::all(vec![
            Condition::eq("a.b", json!(1)),
            Condition::exists("c"),
        ]);
        let raw = serde_json::to_string(&cond).unwrap();
        let parsed: Condition = serde_json::from_str(&raw).unwrap();
        assert!(matches!(parsed.op, ConditionOp::And));
        assert_eq!(parsed.conditions.len(), 2);
    }
}
