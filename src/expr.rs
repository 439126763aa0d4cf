//! Binding expression evaluation.
//!
//! The compiler only talks to the `Evaluator` trait. `OxcEvaluator` is the
//! stock implementation: it parses each expression with the Oxc parser and
//! walks the resulting AST against an `EvalContext`.

use oxc_allocator::Allocator;
use oxc_ast::ast::{AssignmentTarget, Expression, ObjectPropertyKind, PropertyKey};
use oxc_parser::Parser;
use oxc_span::SourceType;
use oxc_syntax::operator::{AssignmentOperator, BinaryOperator, LogicalOperator, UnaryOperator};

use crate::error::{CompileError, Result, ERR_EXPRESSION, ERR_NON_ASSIGNABLE};
use crate::value::{Value, ValueMap};

/// Name resolution and side effects available to an expression.
pub trait EvalContext {
    fn lookup(&self, name: &str) -> Value;
    /// Writes `value` to `root` (when `path` is empty) or below it.
    fn store(&mut self, root: &str, path: &[String], value: Value) -> Result<()>;
    fn call(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value>;
}

pub trait Evaluator {
    fn evaluate(&self, source: &str, ctx: &mut dyn EvalContext) -> Result<Value>;
    fn assign(&self, source: &str, ctx: &mut dyn EvalContext, value: Value) -> Result<()>;
    fn is_assignable(&self, source: &str) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OxcEvaluator;

impl OxcEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn with_parsed<R>(
        &self,
        source: &str,
        f: impl FnOnce(&Expression<'_>) -> Result<R>,
    ) -> Result<R> {
        let allocator = Allocator::default();
        let source_type = SourceType::default().with_module(true);
        let expr = Parser::new(&allocator, source, source_type)
            .parse_expression()
            .map_err(|errors| {
                CompileError::new(
                    ERR_EXPRESSION,
                    &format!("Invalid expression syntax in '{}': {:?}", source, errors),
                )
            })?;
        f(&expr)
    }

    fn eval(&self, expr: &Expression<'_>, ctx: &mut dyn EvalContext) -> Result<Value> {
        match expr {
            Expression::NullLiteral(_) => Ok(Value::Null),
            Expression::BooleanLiteral(b) => Ok(Value::Bool(b.value)),
            Expression::NumericLiteral(n) => Ok(Value::Number(n.value)),
            Expression::StringLiteral(s) => Ok(Value::String(s.value.to_string())),
            Expression::TemplateLiteral(tpl) => {
                let mut out = String::new();
                for (i, quasi) in tpl.quasis.iter().enumerate() {
                    let text = quasi.value.cooked.as_ref().unwrap_or(&quasi.value.raw);
                    out.push_str(&text.to_string());
                    if let Some(e) = tpl.expressions.get(i) {
                        out.push_str(&self.eval(e, ctx)?.to_display_string());
                    }
                }
                Ok(Value::String(out))
            }
            Expression::Identifier(id) => {
                let name = id.name.to_string();
                Ok(match name.as_str() {
                    "undefined" => Value::Undefined,
                    "NaN" => Value::Number(f64::NAN),
                    "Infinity" => Value::Number(f64::INFINITY),
                    _ => ctx.lookup(&name),
                })
            }
            Expression::StaticMemberExpression(st) => {
                let object = self.eval(&st.object, ctx)?;
                Ok(object.member(&st.property.name.to_string()))
            }
            Expression::ComputedMemberExpression(comp) => {
                let object = self.eval(&comp.object, ctx)?;
                let key = self.eval(&comp.expression, ctx)?.to_display_string();
                Ok(object.member(&key))
            }
            Expression::ParenthesizedExpression(paren) => self.eval(&paren.expression, ctx),
            Expression::UnaryExpression(unary) => {
                let value = self.eval(&unary.argument, ctx)?;
                match unary.operator {
                    UnaryOperator::LogicalNot => Ok(Value::Bool(!value.is_truthy())),
                    UnaryOperator::UnaryNegation => Ok(Value::Number(-value.to_number())),
                    UnaryOperator::UnaryPlus => Ok(Value::Number(value.to_number())),
                    UnaryOperator::Typeof => Ok(Value::str(value.type_name())),
                    UnaryOperator::Void => Ok(Value::Undefined),
                    _ => Err(unsupported("unary operator")),
                }
            }
            Expression::BinaryExpression(bin) => {
                let left = self.eval(&bin.left, ctx)?;
                let right = self.eval(&bin.right, ctx)?;
                binary(bin.operator, &left, &right)
            }
            Expression::LogicalExpression(logical) => {
                let left = self.eval(&logical.left, ctx)?;
                match logical.operator {
                    LogicalOperator::And if !left.is_truthy() => Ok(left),
                    LogicalOperator::Or if left.is_truthy() => Ok(left),
                    LogicalOperator::Coalesce
                        if !matches!(left, Value::Undefined | Value::Null) =>
                    {
                        Ok(left)
                    }
                    _ => self.eval(&logical.right, ctx),
                }
            }
            Expression::ConditionalExpression(cond) => {
                if self.eval(&cond.test, ctx)?.is_truthy() {
                    self.eval(&cond.consequent, ctx)
                } else {
                    self.eval(&cond.alternate, ctx)
                }
            }
            Expression::ArrayExpression(arr) => {
                let mut items = Vec::new();
                for elem in &arr.elements {
                    match elem.as_expression() {
                        Some(e) => items.push(self.eval(e, ctx)?),
                        None => return Err(unsupported("array spread or hole")),
                    }
                }
                Ok(Value::Array(items))
            }
            Expression::ObjectExpression(obj) => {
                let mut map = ValueMap::new();
                for prop in &obj.properties {
                    match prop {
                        ObjectPropertyKind::ObjectProperty(p) => {
                            let key = match &p.key {
                                PropertyKey::StaticIdentifier(id) => id.name.to_string(),
                                PropertyKey::StringLiteral(s) => s.value.to_string(),
                                other => match other.as_expression() {
                                    Some(e) => self.eval(e, ctx)?.to_display_string(),
                                    None => return Err(unsupported("object key")),
                                },
                            };
                            let value = self.eval(&p.value, ctx)?;
                            map.insert(key, value);
                        }
                        ObjectPropertyKind::SpreadProperty(_) => {
                            return Err(unsupported("object spread"))
                        }
                    }
                }
                Ok(Value::Object(map))
            }
            Expression::CallExpression(call) => {
                let callee = self.eval(&call.callee, ctx)?;
                let mut args = Vec::new();
                for arg in &call.arguments {
                    match arg.as_expression() {
                        Some(e) => args.push(self.eval(e, ctx)?),
                        None => return Err(unsupported("spread argument")),
                    }
                }
                ctx.call(&callee, args)
            }
            Expression::AssignmentExpression(assign) => {
                if assign.operator != AssignmentOperator::Assign {
                    return Err(unsupported("compound assignment"));
                }
                let value = self.eval(&assign.right, ctx)?;
                let target = match &assign.left {
                    AssignmentTarget::AssignmentTargetIdentifier(id) => {
                        Some((id.name.to_string(), Vec::new()))
                    }
                    AssignmentTarget::StaticMemberExpression(st) => {
                        self.member_path(&st.object, ctx)?.map(|(root, mut path)| {
                            path.push(st.property.name.to_string());
                            (root, path)
                        })
                    }
                    AssignmentTarget::ComputedMemberExpression(comp) => {
                        let key = self.eval(&comp.expression, ctx)?.to_display_string();
                        self.member_path(&comp.object, ctx)?.map(|(root, mut path)| {
                            path.push(key);
                            (root, path)
                        })
                    }
                    _ => None,
                };
                let (root, path) = target.ok_or_else(|| unsupported("assignment target"))?;
                ctx.store(&root, &path, value.clone())?;
                Ok(value)
            }
            Expression::SequenceExpression(seq) => {
                let mut last = Value::Undefined;
                for e in &seq.expressions {
                    last = self.eval(e, ctx)?;
                }
                Ok(last)
            }
            _ => Err(unsupported("expression")),
        }
    }

    /// Splits an assignable expression into its root identifier and the
    /// member keys below it.
    fn member_path(
        &self,
        expr: &Expression<'_>,
        ctx: &mut dyn EvalContext,
    ) -> Result<Option<(String, Vec<String>)>> {
        match expr {
            Expression::Identifier(id) => {
                let name = id.name.to_string();
                if matches!(name.as_str(), "undefined" | "NaN" | "Infinity") {
                    Ok(None)
                } else {
                    Ok(Some((name, Vec::new())))
                }
            }
            Expression::StaticMemberExpression(st) => {
                Ok(self.member_path(&st.object, ctx)?.map(|(root, mut path)| {
                    path.push(st.property.name.to_string());
                    (root, path)
                }))
            }
            Expression::ComputedMemberExpression(comp) => {
                let key = self.eval(&comp.expression, ctx)?.to_display_string();
                Ok(self.member_path(&comp.object, ctx)?.map(|(root, mut path)| {
                    path.push(key);
                    (root, path)
                }))
            }
            Expression::ParenthesizedExpression(paren) => self.member_path(&paren.expression, ctx),
            _ => Ok(None),
        }
    }
}

impl Evaluator for OxcEvaluator {
    fn evaluate(&self, source: &str, ctx: &mut dyn EvalContext) -> Result<Value> {
        if source.trim().is_empty() {
            return Ok(Value::Undefined);
        }
        self.with_parsed(source, |expr| self.eval(expr, ctx))
    }

    fn assign(&self, source: &str, ctx: &mut dyn EvalContext, value: Value) -> Result<()> {
        let non_assignable = || {
            CompileError::new(
                ERR_NON_ASSIGNABLE,
                &format!("Expression '{}' is non-assignable.", source),
            )
        };
        if source.trim().is_empty() {
            return Err(non_assignable());
        }
        self.with_parsed(source, |expr| match self.member_path(expr, ctx)? {
            Some((root, path)) => ctx.store(&root, &path, value),
            None => Err(non_assignable()),
        })
    }

    fn is_assignable(&self, source: &str) -> bool {
        if source.trim().is_empty() {
            return false;
        }
        let mut probe = NullContext;
        self.with_parsed(source, |expr| Ok(self.member_path(expr, &mut probe)?.is_some()))
            .unwrap_or(false)
    }
}

/// Context with nothing in it; used when only the shape of an expression matters.
struct NullContext;

impl EvalContext for NullContext {
    fn lookup(&self, _name: &str) -> Value {
        Value::Undefined
    }

    fn store(&mut self, _root: &str, _path: &[String], _value: Value) -> Result<()> {
        Ok(())
    }

    fn call(&mut self, _callee: &Value, _args: Vec<Value>) -> Result<Value> {
        Ok(Value::Undefined)
    }
}

fn unsupported(what: &str) -> CompileError {
    CompileError::new(ERR_EXPRESSION, &format!("Unsupported {} in binding expression.", what))
}

fn loose_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            left.to_number() == right.to_number()
        }
        (Value::Bool(_), _) | (_, Value::Bool(_)) => left.to_number() == right.to_number(),
        _ => strict_equals(left, right),
    }
}

fn strict_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a == b,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => left.to_number().partial_cmp(&right.to_number()),
    }
}

fn binary(op: BinaryOperator, left: &Value, right: &Value) -> Result<Value> {
    use std::cmp::Ordering;
    let value = match op {
        BinaryOperator::Addition => match (left, right) {
            (Value::String(_), _) | (_, Value::String(_)) => Value::String(format!(
                "{}{}",
                left.to_display_string(),
                right.to_display_string()
            )),
            _ => Value::Number(left.to_number() + right.to_number()),
        },
        BinaryOperator::Subtraction => Value::Number(left.to_number() - right.to_number()),
        BinaryOperator::Multiplication => Value::Number(left.to_number() * right.to_number()),
        BinaryOperator::Division => Value::Number(left.to_number() / right.to_number()),
        BinaryOperator::Remainder => Value::Number(left.to_number() % right.to_number()),
        BinaryOperator::Equality => Value::Bool(loose_equals(left, right)),
        BinaryOperator::Inequality => Value::Bool(!loose_equals(left, right)),
        BinaryOperator::StrictEquality => Value::Bool(strict_equals(left, right)),
        BinaryOperator::StrictInequality => Value::Bool(!strict_equals(left, right)),
        BinaryOperator::LessThan => Value::Bool(compare(left, right) == Some(Ordering::Less)),
        BinaryOperator::GreaterThan => {
            Value::Bool(compare(left, right) == Some(Ordering::Greater))
        }
        BinaryOperator::LessEqualThan => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOperator::GreaterEqualThan => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        )),
        _ => return Err(unsupported("binary operator")),
    };
    Ok(value)
}
