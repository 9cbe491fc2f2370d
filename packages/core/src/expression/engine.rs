//! Built-in formula evaluator

use super::parser::{parse, BinaryOp, Expr};
use super::{ExpressionError, ExpressionEvaluator, FormulaContext, RecordContext, TypedValue};

/// Default [`ExpressionEvaluator`]
///
/// Supports arithmetic, comparison, `&` concatenation and a small function
/// library (`SUM`, `AVERAGE`, `MIN`, `MAX`, `COUNT`, `CONCATENATE`, `IF`, `AND`,
/// `OR`, `NOT`, `ROUND`, `ABS`, `LEN`, `UPPER`, `LOWER`, `BLANK`, `RECORD_ID`).
/// Blank operands read as `0` in arithmetic and as `""` in text functions.
#[derive(Debug, Clone, Default)]
pub struct FormulaEngine;

impl FormulaEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEvaluator for FormulaEngine {
    fn evaluate(
        &self,
        expression: &str,
        context: &FormulaContext,
        record: &RecordContext,
        timezone: &str,
    ) -> Result<TypedValue, ExpressionError> {
        if timezone.trim().is_empty() {
            return Err(ExpressionError::InvalidTimezone(timezone.to_string()));
        }
        let expr = parse(expression)?;
        Evaluation { context, record }.eval(&expr)
    }

    fn referenced_fields(&self, expression: &str) -> Option<Result<Vec<String>, ExpressionError>> {
        Some(parse(expression).map(|expr| expr.field_references()))
    }
}

struct Evaluation<'a> {
    context: &'a FormulaContext,
    record: &'a RecordContext,
}

impl Evaluation<'_> {
    fn eval(&self, expr: &Expr) -> Result<TypedValue, ExpressionError> {
        match expr {
            Expr::Number(n) => Ok(TypedValue::Number(*n)),
            Expr::Text(s) => Ok(TypedValue::Text(s.clone())),
            Expr::Bool(b) => Ok(TypedValue::Bool(*b)),
            Expr::Field(name) => self
                .context
                .get(name)
                .cloned()
                .ok_or_else(|| ExpressionError::UnknownField(name.clone())),
            Expr::Negate(inner) => {
                let value = self.eval(inner)?;
                Ok(TypedValue::Number(-to_number(&value)?))
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, &left, &right)
            }
            Expr::Call { name, args } => self.call(name, args),
        }
    }

    fn call(&self, name: &str, args: &[Expr]) -> Result<TypedValue, ExpressionError> {
        // IF evaluates lazily so the untaken branch cannot fail the formula
        if name == "IF" {
            arity(name, args, 2, 3)?;
            let condition = self.eval(&args[0])?;
            return if condition.is_truthy() {
                self.eval(&args[1])
            } else if let Some(otherwise) = args.get(2) {
                self.eval(otherwise)
            } else {
                Ok(TypedValue::Null)
            };
        }

        let values = args
            .iter()
            .map(|a| self.eval(a))
            .collect::<Result<Vec<_>, _>>()?;

        match name {
            "SUM" => Ok(TypedValue::Number(numbers(&values)?.iter().sum())),
            "AVERAGE" | "AVG" => {
                let nums = numbers(&values)?;
                if nums.is_empty() {
                    return Ok(TypedValue::Null);
                }
                Ok(TypedValue::Number(nums.iter().sum::<f64>() / nums.len() as f64))
            }
            "MIN" => Ok(numbers(&values)?
                .into_iter()
                .reduce(f64::min)
                .map(TypedValue::Number)
                .unwrap_or(TypedValue::Null)),
            "MAX" => Ok(numbers(&values)?
                .into_iter()
                .reduce(f64::max)
                .map(TypedValue::Number)
                .unwrap_or(TypedValue::Null)),
            "COUNT" => Ok(TypedValue::Number(numbers(&values)?.len() as f64)),
            "CONCATENATE" => Ok(TypedValue::Text(
                values.iter().map(TypedValue::to_text).collect::<String>(),
            )),
            "AND" => Ok(TypedValue::Bool(flatten(&values).iter().all(|v| v.is_truthy()))),
            "OR" => Ok(TypedValue::Bool(flatten(&values).iter().any(|v| v.is_truthy()))),
            "NOT" => {
                arity(name, args, 1, 1)?;
                Ok(TypedValue::Bool(!values[0].is_truthy()))
            }
            "ROUND" => {
                arity(name, args, 1, 2)?;
                let n = to_number(&values[0])?;
                let places = match values.get(1) {
                    Some(p) => to_number(p)? as i32,
                    None => 0,
                };
                let factor = 10f64.powi(places);
                Ok(TypedValue::Number((n * factor).round() / factor))
            }
            "ABS" => {
                arity(name, args, 1, 1)?;
                Ok(TypedValue::Number(to_number(&values[0])?.abs()))
            }
            "LEN" => {
                arity(name, args, 1, 1)?;
                Ok(TypedValue::Number(values[0].to_text().chars().count() as f64))
            }
            "UPPER" => {
                arity(name, args, 1, 1)?;
                Ok(TypedValue::Text(values[0].to_text().to_uppercase()))
            }
            "LOWER" => {
                arity(name, args, 1, 1)?;
                Ok(TypedValue::Text(values[0].to_text().to_lowercase()))
            }
            "BLANK" => {
                arity(name, args, 0, 0)?;
                Ok(TypedValue::Null)
            }
            "RECORD_ID" => {
                arity(name, args, 0, 0)?;
                Ok(TypedValue::Text(self.record.record_id.clone()))
            }
            other => Err(ExpressionError::UnknownFunction(other.to_string())),
        }
    }
}

fn arity(name: &str, args: &[Expr], min: usize, max: usize) -> Result<(), ExpressionError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{}..={}", min, max)
        };
        return Err(ExpressionError::Arity {
            name: name.to_string(),
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

fn flatten(values: &[TypedValue]) -> Vec<TypedValue> {
    let mut out = Vec::new();
    for value in values {
        match value {
            TypedValue::List(items) => out.extend(flatten(items)),
            other => out.push(other.clone()),
        }
    }
    out
}

/// Numeric arguments of an aggregate function; blanks are skipped
fn numbers(values: &[TypedValue]) -> Result<Vec<f64>, ExpressionError> {
    flatten(values)
        .iter()
        .filter(|v| !v.is_null())
        .map(to_number)
        .collect()
}

fn to_number(value: &TypedValue) -> Result<f64, ExpressionError> {
    match value {
        TypedValue::Null => Ok(0.0),
        TypedValue::Number(n) => Ok(*n),
        TypedValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        TypedValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| ExpressionError::type_mismatch(format!("'{}' is not a number", s))),
        TypedValue::List(_) => Err(ExpressionError::type_mismatch(
            "a list cannot be used as a number",
        )),
    }
}

fn binary(op: BinaryOp, left: &TypedValue, right: &TypedValue) -> Result<TypedValue, ExpressionError> {
    match op {
        BinaryOp::Concat => Ok(TypedValue::Text(format!(
            "{}{}",
            left.to_text(),
            right.to_text()
        ))),
        BinaryOp::Add => {
            if matches!(left, TypedValue::Text(_)) || matches!(right, TypedValue::Text(_)) {
                if let (Ok(a), Ok(b)) = (to_number(left), to_number(right)) {
                    return Ok(TypedValue::Number(a + b));
                }
                return Ok(TypedValue::Text(format!(
                    "{}{}",
                    left.to_text(),
                    right.to_text()
                )));
            }
            Ok(TypedValue::Number(to_number(left)? + to_number(right)?))
        }
        BinaryOp::Sub => Ok(TypedValue::Number(to_number(left)? - to_number(right)?)),
        BinaryOp::Mul => Ok(TypedValue::Number(to_number(left)? * to_number(right)?)),
        BinaryOp::Div => {
            let divisor = to_number(right)?;
            if divisor == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            Ok(TypedValue::Number(to_number(left)? / divisor))
        }
        BinaryOp::Mod => {
            let divisor = to_number(right)?;
            if divisor == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            Ok(TypedValue::Number(to_number(left)? % divisor))
        }
        BinaryOp::Eq => Ok(TypedValue::Bool(compare(left, right) == Some(std::cmp::Ordering::Equal))),
        BinaryOp::Ne => Ok(TypedValue::Bool(compare(left, right) != Some(std::cmp::Ordering::Equal))),
        BinaryOp::Lt => Ok(TypedValue::Bool(compare(left, right) == Some(std::cmp::Ordering::Less))),
        BinaryOp::Le => Ok(TypedValue::Bool(matches!(
            compare(left, right),
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ))),
        BinaryOp::Gt => Ok(TypedValue::Bool(
            compare(left, right) == Some(std::cmp::Ordering::Greater),
        )),
        BinaryOp::Ge => Ok(TypedValue::Bool(matches!(
            compare(left, right),
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ))),
    }
}

fn compare(left: &TypedValue, right: &TypedValue) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (TypedValue::Text(a), TypedValue::Text(b)) => Some(a.cmp(b)),
        (TypedValue::Null, TypedValue::Null) => Some(std::cmp::Ordering::Equal),
        (TypedValue::List(_), _) | (_, TypedValue::List(_)) => None,
        _ => match (to_number(left), to_number(right)) {
            (Ok(a), Ok(b)) => a.partial_cmp(&b),
            _ => Some(left.to_text().cmp(&right.to_text())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expression: &str, pairs: &[(&str, TypedValue)]) -> Result<TypedValue, ExpressionError> {
        let context: FormulaContext = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        FormulaEngine::new().evaluate(expression, &context, &RecordContext::default(), "UTC")
    }

    #[test]
    fn test_arithmetic_over_fields() {
        let result = eval("{A} * 2", &[("A", TypedValue::Number(5.0))]).unwrap();
        assert_eq!(result, TypedValue::Number(10.0));

        let result = eval("({A} + 1) / 4", &[("A", TypedValue::Number(7.0))]).unwrap();
        assert_eq!(result, TypedValue::Number(2.0));
    }

    #[test]
    fn test_blank_reads_as_zero_in_arithmetic() {
        let result = eval("{A} + 1", &[("A", TypedValue::Null)]).unwrap();
        assert_eq!(result, TypedValue::Number(1.0));
    }

    #[test]
    fn test_unknown_field_is_an_error() {
        assert_eq!(
            eval("{Missing} + 1", &[]),
            Err(ExpressionError::UnknownField("Missing".to_string()))
        );
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(eval("1 / 0", &[]), Err(ExpressionError::DivisionByZero));
    }

    #[test]
    fn test_text_functions_and_concat() {
        let pairs = [("Name", TypedValue::Text("ada".to_string()))];
        assert_eq!(
            eval(r#"UPPER({Name}) & "!""#, &pairs).unwrap(),
            TypedValue::Text("ADA!".to_string())
        );
        assert_eq!(
            eval(r#""n=" + 3"#, &[]).unwrap(),
            TypedValue::Text("n=3".to_string())
        );
        assert_eq!(eval("LEN({Name})", &pairs).unwrap(), TypedValue::Number(3.0));
    }

    #[test]
    fn test_if_is_lazy() {
        let result = eval("IF({A} > 1, \"big\", 1 / 0)", &[("A", TypedValue::Number(2.0))]).unwrap();
        assert_eq!(result, TypedValue::Text("big".to_string()));
    }

    #[test]
    fn test_aggregates_flatten_lists() {
        let list = TypedValue::List(vec![
            TypedValue::Number(1.0),
            TypedValue::Null,
            TypedValue::Number(4.0),
        ]);
        let pairs = [("L", list)];
        assert_eq!(eval("SUM({L}, 5)", &pairs).unwrap(), TypedValue::Number(10.0));
        assert_eq!(eval("MAX({L})", &pairs).unwrap(), TypedValue::Number(4.0));
        assert_eq!(eval("AVERAGE({L})", &pairs).unwrap(), TypedValue::Number(2.5));
        assert_eq!(eval("COUNT({L})", &pairs).unwrap(), TypedValue::Number(2.0));
    }

    #[test]
    fn test_arity_and_unknown_function() {
        assert!(matches!(eval("NOT()", &[]), Err(ExpressionError::Arity { .. })));
        assert_eq!(
            eval("FOO(1)", &[]),
            Err(ExpressionError::UnknownFunction("FOO".to_string()))
        );
    }

    #[test]
    fn test_empty_timezone_rejected() {
        let result =
            FormulaEngine::new().evaluate("1", &FormulaContext::new(), &RecordContext::default(), "");
        assert!(matches!(result, Err(ExpressionError::InvalidTimezone(_))));
    }

    #[test]
    fn test_referenced_fields_uses_parser() {
        let refs = FormulaEngine::new()
            .referenced_fields(r#"{A} & "{not a ref}""#)
            .unwrap()
            .unwrap();
        assert_eq!(refs, vec!["A".to_string()]);
    }
}
