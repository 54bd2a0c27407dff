//! Condition lists for conditional and interaction steps.
//!
//! A clause whose field cannot be found is *unresolved*. It counts as a
//! failed clause, and the caller may route unresolved lists to a dedicated
//! step instead.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::smart_values::{resolve, Snapshot};
use crate::workflow::{Condition, MatchMode, Operator};

/// Result of evaluating a condition list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub passed: bool,
    /// The list did not pass and at least one clause referenced a missing field
    pub unresolved: bool,
}

/// Evaluate the clauses against one answer.
pub fn evaluate(
    conditions: &[Condition],
    mode: MatchMode,
    answer: &Map<String, Value>,
) -> Result<Evaluation> {
    let mut results = Vec::with_capacity(conditions.len());
    for condition in conditions {
        let operator: Operator = condition.operator.parse().map_err(Error::Step)?;
        let left = lookup_field(answer, &condition.field);
        results.push(compare(operator, left, &condition.value));
    }

    let passed = match mode {
        MatchMode::All => !results.is_empty() && results.iter().all(|r| *r == Some(true)),
        MatchMode::Any => results.iter().any(|r| *r == Some(true)),
    };
    let unresolved = !passed && results.iter().any(Option::is_none);
    Ok(Evaluation { passed, unresolved })
}

/// Evaluate against a set of answers: the list passes when some answer
/// satisfies it. No answers at all counts as unresolved.
pub fn evaluate_answers(
    conditions: &[Condition],
    mode: MatchMode,
    answers: &[Map<String, Value>],
) -> Result<Evaluation> {
    if answers.is_empty() {
        return Ok(Evaluation {
            passed: false,
            unresolved: true,
        });
    }

    let mut unresolved = false;
    for answer in answers {
        let evaluation = evaluate(conditions, mode, answer)?;
        if evaluation.passed {
            return Ok(evaluation);
        }
        unresolved |= evaluation.unresolved;
    }
    Ok(Evaluation {
        passed: false,
        unresolved,
    })
}

/// Render smart values used as right-hand operands.
pub fn render_operands(conditions: &[Condition], snapshot: &Snapshot) -> Vec<Condition> {
    conditions
        .iter()
        .map(|condition| {
            let value = match &condition.value {
                Value::String(s) if s.contains("{{") => Value::String(resolve(s, snapshot)),
                other => other.clone(),
            };
            Condition {
                value,
                ..condition.clone()
            }
        })
        .collect()
}

/// `None` when the left operand is missing and the operator needs one.
fn compare(operator: Operator, left: Option<&Value>, right: &Value) -> Option<bool> {
    let present = left.filter(|v| !v.is_null());
    match (operator, present) {
        (Operator::IsNull, _) => Some(is_blank(left)),
        (Operator::IsNotNull, _) => Some(!is_blank(left)),
        (_, None) => None,
        (Operator::Eq, Some(l)) => Some(loose_eq(l, right)),
        (Operator::Ne, Some(l)) => Some(!loose_eq(l, right)),
        (Operator::Gt, Some(l)) => Some(ordering(l, right) == Ordering::Greater),
        (Operator::Lt, Some(l)) => Some(ordering(l, right) == Ordering::Less),
        (Operator::Gte, Some(l)) => Some(ordering(l, right) != Ordering::Less),
        (Operator::Lte, Some(l)) => Some(ordering(l, right) != Ordering::Greater),
        (Operator::Contains, Some(l)) => Some(contains(l, right)),
        (Operator::In, Some(l)) => Some(member_of(l, right)),
        (Operator::NotIn, Some(l)) => Some(!member_of(l, right)),
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (as_f64(left), as_f64(right)) {
        (Some(l), Some(r)) => l == r,
        _ => stringify_value(left) == stringify_value(right),
    }
}

/// Numeric when both sides are numbers (or numeric strings), textual
/// otherwise. ISO dates order correctly as text.
fn ordering(left: &Value, right: &Value) -> Ordering {
    match (as_f64(left), as_f64(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
        _ => stringify_value(left).cmp(&stringify_value(right)),
    }
}

fn contains(left: &Value, right: &Value) -> bool {
    match left {
        Value::String(s) => s.contains(&stringify_value(right)),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, right)),
        Value::Object(map) => right.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
        _ => false,
    }
}

fn member_of(left: &Value, right: &Value) -> bool {
    let candidates: Vec<Value> = match right {
        Value::Array(items) => items.clone(),
        Value::String(s) => s
            .split(',')
            .map(|part| Value::String(part.trim().to_string()))
            .collect(),
        other => vec![other.clone()],
    };

    match left {
        Value::Array(values) => values
            .iter()
            .any(|v| candidates.iter().any(|c| loose_eq(v, c))),
        value => candidates.iter().any(|c| loose_eq(value, c)),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        _ => value.to_string(),
    }
}

/// Accepts `age`, `activity.age` and `{{activity.age}}` spellings.
fn lookup_field<'a>(answer: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    let expr = normalize_field(field);
    let (head, rest) = match expr.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (expr, None),
    };
    let root = answer.get(head)?;
    match rest {
        Some(path) => value_at_path(root, path),
        None => Some(root),
    }
}

fn normalize_field(field: &str) -> &str {
    let mut expr = field.trim();
    expr = expr.strip_prefix('$').unwrap_or(expr);
    if expr.starts_with("{{") && expr.ends_with("}}") {
        expr = expr[2..expr.len() - 2].trim();
    }
    expr.strip_prefix("activity.").unwrap_or(expr)
}

/// Walk a dotted path; numeric segments index arrays.
pub(crate) fn value_at_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => {
                let index = segment.parse::<usize>().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clause(field: &str, operator: &str, value: Value) -> Condition {
        Condition {
            field: field.to_string(),
            operator: operator.to_string(),
            value,
        }
    }

    fn answer(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_numeric_string_comparison() {
        let conditions = vec![clause("age", ">", json!("18"))];
        let adult = evaluate(&conditions, MatchMode::All, &answer(json!({"age": 20}))).unwrap();
        assert!(adult.passed);

        let minor = evaluate(&conditions, MatchMode::All, &answer(json!({"age": 10}))).unwrap();
        assert!(!minor.passed);
        assert!(!minor.unresolved);
    }

    #[test]
    fn test_clauses_combine_with_and_by_default() {
        let conditions = vec![
            clause("age", "gte", json!(18)),
            clause("country", "==", json!("BR")),
        ];
        let data = answer(json!({"age": 30, "country": "PT"}));
        assert!(!evaluate(&conditions, MatchMode::All, &data).unwrap().passed);
        assert!(evaluate(&conditions, MatchMode::Any, &data).unwrap().passed);
    }

    #[test]
    fn test_missing_field_is_unresolved() {
        let conditions = vec![clause("activity.score", "<", json!(5))];
        let evaluation = evaluate(&conditions, MatchMode::All, &answer(json!({"age": 1}))).unwrap();
        assert!(!evaluation.passed);
        assert!(evaluation.unresolved);
    }

    #[test]
    fn test_null_checks_never_unresolved() {
        let conditions = vec![clause("{{activity.notes}}", "isNull", Value::Null)];
        let evaluation = evaluate(&conditions, MatchMode::All, &Map::new()).unwrap();
        assert!(evaluation.passed);

        let conditions = vec![clause("notes", "isNotNull", Value::Null)];
        let evaluation =
            evaluate(&conditions, MatchMode::All, &answer(json!({"notes": ""}))).unwrap();
        assert!(!evaluation.passed);
        assert!(!evaluation.unresolved);
    }

    #[test]
    fn test_contains_and_membership() {
        let data = answer(json!({"tags": ["urgent", "vip"], "city": "Recife", "plan": "gold"}));
        let check = |c: Condition| evaluate(&[c], MatchMode::All, &data).unwrap().passed;

        assert!(check(clause("tags", "contains", json!("vip"))));
        assert!(check(clause("city", "contains", json!("cif"))));
        assert!(check(clause("plan", "in", json!(["gold", "platinum"]))));
        assert!(check(clause("plan", "in", json!("silver, gold"))));
        assert!(check(clause("plan", "notIn", json!(["basic"]))));
        assert!(!check(clause("plan", "not_in", json!(["gold"]))));
    }

    #[test]
    fn test_unknown_operator_is_error() {
        let conditions = vec![clause("age", "~=", json!(1))];
        let err = evaluate(&conditions, MatchMode::All, &Map::new()).unwrap_err();
        assert!(matches!(err, Error::Step(_)));
    }

    #[test]
    fn test_some_answer_must_satisfy_every_clause() {
        let conditions = vec![
            clause("approved", "==", json!(true)),
            clause("amount", "<=", json!(1000)),
        ];
        let answers = vec![
            answer(json!({"approved": true, "amount": 5000})),
            answer(json!({"approved": false, "amount": 100})),
        ];
        assert!(!evaluate_answers(&conditions, MatchMode::All, &answers).unwrap().passed);

        let answers = vec![answer(json!({"approved": "true", "amount": "900"}))];
        assert!(evaluate_answers(&conditions, MatchMode::All, &answers).unwrap().passed);

        let none = evaluate_answers(&conditions, MatchMode::All, &[]).unwrap();
        assert!(none.unresolved);
    }

    #[test]
    fn test_nested_paths() {
        let data = answer(json!({"address": {"zip": "50000"}, "items": [{"qty": 3}]}));
        let conditions = vec![
            clause("address.zip", "==", json!("50000")),
            clause("items.0.qty", ">", json!(2)),
        ];
        assert!(evaluate(&conditions, MatchMode::All, &data).unwrap().passed);
    }
}
