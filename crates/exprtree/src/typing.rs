//! Static typing rules for expression nodes.
//!
//! The builder runs these when a node is created and the server runs them
//! again over a received tree, so both sides agree on what a tree means.

use typereg::{ResolvedType, TypeDescriptor, TypeRegistry, Value};

use crate::errors::{ExprError, Result};
use crate::node::{BinaryOp, ExprId, ExprKind, ExprNode, Method, UnaryOp};

/// Compute the type of `kind`, given the nodes that precede it.
///
/// `given` is the type attached to the node. It's required for kinds whose
/// type can't be derived from their children (constants, parameters,
/// conversions, extensions) and ignored for everything else.
pub fn infer_type(
    registry: &TypeRegistry,
    preceding: &[ExprNode],
    kind: &ExprKind,
    given: Option<&TypeDescriptor>,
) -> Result<TypeDescriptor> {
    let child = |id: ExprId| child_node(preceding, id);
    let given_ty = || given_type(kind, given);

    let ty = match kind {
        ExprKind::Source { entity } => match registry.resolve(entity)? {
            ResolvedType::Entity(_) => TypeDescriptor::sequence(entity.clone()),
            _ => {
                return Err(ExprError::InvalidArgument(format!(
                    "source must reference an entity, got {entity}"
                )));
            }
        },
        ExprKind::Constant(value) => {
            let ty = given_ty()?;
            registry.resolve(ty)?;
            if !value_conforms(value, ty) {
                return Err(ExprError::InvalidArgument(format!(
                    "constant of kind {} does not conform to {ty}",
                    value.kind()
                )));
            }
            ty.clone()
        }
        ExprKind::Parameter { .. } => {
            let ty = given_ty()?;
            registry.resolve(ty)?;
            ty.clone()
        }
        ExprKind::Member { target, member } => {
            let owner = &child(*target)?.ty;
            registry
                .member_type(owner, member)?
                .ok_or_else(|| ExprError::UnknownMember {
                    owner: owner.clone(),
                    member: member.clone(),
                })?
        }
        ExprKind::Call { method, args } => {
            let args = args
                .iter()
                .map(|id| child(*id))
                .collect::<Result<Vec<_>>>()?;
            infer_call(*method, &args)?
        }
        ExprKind::Lambda { params, body } => {
            let body = child(*body)?;
            TypeDescriptor::function(params.iter().map(|(_, ty)| ty.clone()), body.ty.clone())
        }
        ExprKind::Binary { op, left, right } => {
            infer_binary(*op, &child(*left)?.ty, &child(*right)?.ty)?
        }
        ExprKind::Unary { op, operand } => {
            let operand = &child(*operand)?.ty;
            match op {
                UnaryOp::Not if *operand == TypeDescriptor::bool() => TypeDescriptor::bool(),
                UnaryOp::Negate if operand.is_numeric() => operand.clone(),
                _ => {
                    return Err(ExprError::InvalidArgument(format!(
                        "operator {} not defined for {operand}",
                        op.symbol()
                    )));
                }
            }
        }
        ExprKind::Conditional {
            test,
            if_true,
            if_false,
        } => {
            expect_bool("conditional test", &child(*test)?.ty)?;
            let a = &child(*if_true)?.ty;
            let b = &child(*if_false)?.ty;
            if a != b {
                return Err(ExprError::InvalidArgument(format!(
                    "conditional branches differ: {a} and {b}"
                )));
            }
            a.clone()
        }
        ExprKind::New { fields } => {
            let mut seen = Vec::with_capacity(fields.len());
            let mut shape = Vec::with_capacity(fields.len());
            for (name, id) in fields {
                if name.is_empty() || seen.contains(&name.as_str()) {
                    return Err(ExprError::InvalidArgument(format!(
                        "invalid or duplicate field name '{name}'"
                    )));
                }
                seen.push(name.as_str());
                shape.push((name.as_str(), child(*id)?.ty.clone()));
            }
            TypeDescriptor::anonymous(shape)
        }
        ExprKind::Convert { operand } => {
            let target = given_ty()?;
            let from = &child(*operand)?.ty;
            if from != target && !(from.is_numeric() && target.is_numeric()) {
                return Err(ExprError::InvalidArgument(format!(
                    "cannot convert {from} to {target}"
                )));
            }
            target.clone()
        }
        ExprKind::Quote { operand } => {
            let operand = child(*operand)?;
            if operand.ty.function_signature().is_none() {
                return Err(ExprError::InvalidArgument(format!(
                    "only lambdas can be quoted, got {}",
                    operand.ty
                )));
            }
            operand.ty.clone()
        }
        ExprKind::Extension { name, args } => {
            for id in args {
                child(*id)?;
            }
            if name.is_empty() {
                return Err(ExprError::InvalidArgument(
                    "extension name must not be empty".to_string(),
                ));
            }
            let ty = given_ty()?;
            registry.resolve(ty)?;
            ty.clone()
        }
    };

    Ok(ty)
}

fn child_node(preceding: &[ExprNode], id: ExprId) -> Result<&ExprNode> {
    preceding.get(id.index()).ok_or(ExprError::InvalidReference {
        node: preceding.len(),
        child: id.index(),
    })
}

fn given_type<'a>(kind: &ExprKind, given: Option<&'a TypeDescriptor>) -> Result<&'a TypeDescriptor> {
    given.ok_or_else(|| {
        ExprError::InvalidArgument(format!("{} node requires a type", kind.kind_name()))
    })
}

/// Whether a constant value can be typed as `ty`.
pub fn value_conforms(value: &Value, ty: &TypeDescriptor) -> bool {
    let element_conforms = |values: &[Value], element: Option<&TypeDescriptor>| match element {
        Some(element) => values.iter().all(|v| value_conforms(v, element)),
        None => false,
    };
    match value {
        Value::Null => true,
        Value::Bool(_) => *ty == TypeDescriptor::bool(),
        Value::Int32(_) => *ty == TypeDescriptor::int32(),
        Value::Int64(_) => *ty == TypeDescriptor::int64(),
        Value::Float64(_) => *ty == TypeDescriptor::float64(),
        Value::String(_) => *ty == TypeDescriptor::string(),
        Value::DateTime(_) => *ty == TypeDescriptor::datetime(),
        Value::Record(rec) => rec.shape == *ty,
        Value::List(values) => ty.grouping_key().is_none() && element_conforms(values, ty.enumerable_element()),
        Value::Grouping(group) => match (ty.grouping_key(), ty.enumerable_element()) {
            (Some(key), element) => {
                value_conforms(&group.key, key) && element_conforms(&group.elements, element)
            }
            _ => false,
        },
        Value::Dictionary(pairs) => match ty.args.as_slice() {
            [k, v] if ty.name == typereg::descriptor::names::DICTIONARY => pairs
                .iter()
                .all(|(pk, pv)| value_conforms(pk, k) && value_conforms(pv, v)),
            _ => false,
        },
    }
}

fn expect_bool(what: &str, ty: &TypeDescriptor) -> Result<()> {
    if *ty != TypeDescriptor::bool() {
        return Err(ExprError::InvalidArgument(format!(
            "{what} must be bool, got {ty}"
        )));
    }
    Ok(())
}

fn numeric_rank(ty: &TypeDescriptor) -> Option<u8> {
    if *ty == TypeDescriptor::int32() {
        Some(0)
    } else if *ty == TypeDescriptor::int64() {
        Some(1)
    } else if *ty == TypeDescriptor::float64() {
        Some(2)
    } else {
        None
    }
}

/// Wider of two numeric types.
pub fn promote(a: &TypeDescriptor, b: &TypeDescriptor) -> Option<TypeDescriptor> {
    let (ra, rb) = (numeric_rank(a)?, numeric_rank(b)?);
    Some(if ra >= rb { a.clone() } else { b.clone() })
}

/// Whether values of the two types can be tested for equality.
pub fn equatable(a: &TypeDescriptor, b: &TypeDescriptor) -> bool {
    a == b || (a.is_numeric() && b.is_numeric())
}

/// Whether values of the two types can be ordered against each other.
pub fn orderable(a: &TypeDescriptor, b: &TypeDescriptor) -> bool {
    (a == b && a.is_builtin_primitive()) || (a.is_numeric() && b.is_numeric())
}

fn infer_binary(op: BinaryOp, left: &TypeDescriptor, right: &TypeDescriptor) -> Result<TypeDescriptor> {
    let invalid = || {
        ExprError::InvalidArgument(format!(
            "operator {} not defined for {left} and {right}",
            op.symbol()
        ))
    };
    match op {
        BinaryOp::And | BinaryOp::Or => {
            expect_bool("logical operand", left)?;
            expect_bool("logical operand", right)?;
            Ok(TypeDescriptor::bool())
        }
        BinaryOp::Eq | BinaryOp::Ne => {
            if equatable(left, right) {
                Ok(TypeDescriptor::bool())
            } else {
                Err(invalid())
            }
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if orderable(left, right) {
                Ok(TypeDescriptor::bool())
            } else {
                Err(invalid())
            }
        }
        BinaryOp::Add => {
            let string = TypeDescriptor::string();
            if (*left == string && right.is_builtin_primitive())
                || (*right == string && left.is_builtin_primitive())
            {
                return Ok(string);
            }
            promote(left, right).ok_or_else(invalid)
        }
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            promote(left, right).ok_or_else(invalid)
        }
    }
}

fn arity(method: Method, args: &[&ExprNode], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        let expected = match (min, max) {
            (1, 1) => "1",
            (2, 2) => "2",
            (5, 5) => "5",
            (1, 2) => "1 or 2",
            (2, 3) => "2 or 3",
            _ => "a different number of",
        };
        return Err(ExprError::ArgumentCount {
            method: method.name(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn element(node: &ExprNode) -> Result<&TypeDescriptor> {
    node.ty
        .enumerable_element()
        .ok_or_else(|| ExprError::NotASequence(node.ty.clone()))
}

/// Check a lambda argument against the expected parameter types and return
/// its result type.
fn lambda_result<'a>(
    method: Method,
    node: &'a ExprNode,
    params: &[&TypeDescriptor],
) -> Result<&'a TypeDescriptor> {
    let (actual, ret) = node.ty.function_signature().ok_or_else(|| {
        ExprError::InvalidArgument(format!(
            "{} expects a lambda argument, got {}",
            method.name(),
            node.ty
        ))
    })?;
    let matches = actual.len() == params.len() && actual.iter().zip(params).all(|(a, b)| a == *b);
    if !matches {
        return Err(ExprError::InvalidArgument(format!(
            "{} lambda has parameters {}, expected ({})",
            method.name(),
            node.ty,
            params
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }
    Ok(ret)
}

fn predicate(method: Method, node: &ExprNode, element: &TypeDescriptor) -> Result<()> {
    let ret = lambda_result(method, node, &[element])?;
    expect_bool(method.name(), ret)
}

/// Type produced by an optional selector: the selector's result if
/// present, otherwise the element itself.
fn selected<'a>(method: Method, args: &[&'a ExprNode], element: &'a TypeDescriptor) -> Result<&'a TypeDescriptor> {
    match args.get(1) {
        Some(selector) => lambda_result(method, *selector, &[element]),
        None => Ok(element),
    }
}

fn expect_type(method: Method, node: &ExprNode, expected: &TypeDescriptor) -> Result<()> {
    if node.ty != *expected {
        return Err(ExprError::InvalidArgument(format!(
            "{} expects {expected}, got {}",
            method.name(),
            node.ty
        )));
    }
    Ok(())
}

fn infer_call(method: Method, args: &[&ExprNode]) -> Result<TypeDescriptor> {
    use TypeDescriptor as T;

    let ty = match method {
        Method::Where => {
            arity(method, args, 2, 2)?;
            let e = element(args[0])?;
            predicate(method, args[1], e)?;
            T::sequence(e.clone())
        }
        Method::Select => {
            arity(method, args, 2, 2)?;
            let e = element(args[0])?;
            T::sequence(lambda_result(method, args[1], &[e])?.clone())
        }
        Method::SelectMany => {
            arity(method, args, 2, 2)?;
            let e = element(args[0])?;
            let inner = lambda_result(method, args[1], &[e])?;
            let inner = inner
                .enumerable_element()
                .ok_or_else(|| ExprError::NotASequence(inner.clone()))?;
            T::sequence(inner.clone())
        }
        Method::OrderBy | Method::OrderByDescending | Method::ThenBy | Method::ThenByDescending => {
            arity(method, args, 2, 2)?;
            let e = element(args[0])?;
            if matches!(method, Method::ThenBy | Method::ThenByDescending) {
                let ordered = matches!(&args[0].kind, ExprKind::Call { method, .. } if method.is_ordering());
                if !ordered {
                    return Err(ExprError::NotOrdered(method.name()));
                }
            }
            let key = lambda_result(method, args[1], &[e])?;
            if !key.is_builtin_primitive() {
                return Err(ExprError::InvalidArgument(format!(
                    "{} key must be a primitive, got {key}",
                    method.name()
                )));
            }
            T::sequence(e.clone())
        }
        Method::GroupBy => {
            arity(method, args, 2, 3)?;
            let e = element(args[0])?;
            let key = lambda_result(method, args[1], &[e])?;
            match args.get(2) {
                Some(result) => {
                    let list = T::list(e.clone());
                    T::sequence(lambda_result(method, result, &[key, &list])?.clone())
                }
                None => T::sequence(T::grouping(key.clone(), e.clone())),
            }
        }
        Method::Join => {
            arity(method, args, 5, 5)?;
            let outer = element(args[0])?;
            let inner = element(args[1])?;
            let outer_key = lambda_result(method, args[2], &[outer])?;
            let inner_key = lambda_result(method, args[3], &[inner])?;
            if !equatable(outer_key, inner_key) {
                return Err(ExprError::InvalidArgument(format!(
                    "join keys are not comparable: {outer_key} and {inner_key}"
                )));
            }
            T::sequence(lambda_result(method, args[4], &[outer, inner])?.clone())
        }
        Method::Union | Method::Intersect | Method::Except | Method::Concat => {
            arity(method, args, 2, 2)?;
            let a = element(args[0])?;
            let b = element(args[1])?;
            if a != b {
                return Err(ExprError::InvalidArgument(format!(
                    "{} element types differ: {a} and {b}",
                    method.name()
                )));
            }
            T::sequence(a.clone())
        }
        Method::Distinct => {
            arity(method, args, 1, 1)?;
            T::sequence(element(args[0])?.clone())
        }
        Method::Count => {
            arity(method, args, 1, 2)?;
            let e = element(args[0])?;
            if let Some(pred) = args.get(1) {
                predicate(method, pred, e)?;
            }
            T::int32()
        }
        Method::Sum | Method::Average => {
            arity(method, args, 1, 2)?;
            let e = element(args[0])?;
            let value = selected(method, args, e)?;
            if !value.is_numeric() {
                return Err(ExprError::InvalidArgument(format!(
                    "{} requires numeric values, got {value}",
                    method.name()
                )));
            }
            if method == Method::Average {
                T::float64()
            } else {
                value.clone()
            }
        }
        Method::Min | Method::Max => {
            arity(method, args, 1, 2)?;
            let e = element(args[0])?;
            let value = selected(method, args, e)?;
            if !value.is_builtin_primitive() {
                return Err(ExprError::InvalidArgument(format!(
                    "{} requires primitive values, got {value}",
                    method.name()
                )));
            }
            value.clone()
        }
        Method::Any => {
            arity(method, args, 1, 2)?;
            let e = element(args[0])?;
            if let Some(pred) = args.get(1) {
                predicate(method, pred, e)?;
            }
            T::bool()
        }
        Method::All => {
            arity(method, args, 2, 2)?;
            let e = element(args[0])?;
            predicate(method, args[1], e)?;
            T::bool()
        }
        Method::Contains => {
            arity(method, args, 2, 2)?;
            let e = element(args[0])?;
            if !equatable(e, &args[1].ty) {
                return Err(ExprError::InvalidArgument(format!(
                    "Contains expects {e}, got {}",
                    args[1].ty
                )));
            }
            T::bool()
        }
        Method::Skip | Method::Take => {
            arity(method, args, 2, 2)?;
            let e = element(args[0])?;
            expect_type(method, args[1], &T::int32())?;
            T::sequence(e.clone())
        }
        Method::First | Method::FirstOrDefault | Method::Single | Method::SingleOrDefault => {
            arity(method, args, 1, 2)?;
            let e = element(args[0])?;
            if let Some(pred) = args.get(1) {
                predicate(method, pred, e)?;
            }
            e.clone()
        }
        Method::ToList => {
            arity(method, args, 1, 1)?;
            T::list(element(args[0])?.clone())
        }
        Method::ToDictionary => {
            arity(method, args, 2, 3)?;
            let e = element(args[0])?;
            let key = lambda_result(method, args[1], &[e])?;
            let value = match args.get(2) {
                Some(sel) => lambda_result(method, sel, &[e])?,
                None => e,
            };
            T::dictionary(key.clone(), value.clone())
        }
        Method::StringContains | Method::StartsWith | Method::EndsWith => {
            arity(method, args, 2, 2)?;
            expect_type(method, args[0], &T::string())?;
            expect_type(method, args[1], &T::string())?;
            T::bool()
        }
        Method::ToUpper | Method::ToLower | Method::Trim => {
            arity(method, args, 1, 1)?;
            expect_type(method, args[0], &T::string())?;
            T::string()
        }
        Method::Length => {
            arity(method, args, 1, 1)?;
            expect_type(method, args[0], &T::string())?;
            T::int32()
        }
        Method::Substring => {
            arity(method, args, 2, 3)?;
            expect_type(method, args[0], &T::string())?;
            for arg in &args[1..] {
                expect_type(method, arg, &T::int32())?;
            }
            T::string()
        }
        Method::ToString => {
            arity(method, args, 1, 1)?;
            if !args[0].ty.is_builtin_primitive() {
                return Err(ExprError::InvalidArgument(format!(
                    "ToString requires a primitive, got {}",
                    args[0].ty
                )));
            }
            T::string()
        }
        Method::Year | Method::Month | Method::Day => {
            arity(method, args, 1, 1)?;
            expect_type(method, args[0], &T::datetime())?;
            T::int32()
        }
        Method::AddDays => {
            arity(method, args, 2, 2)?;
            expect_type(method, args[0], &T::datetime())?;
            if !args[1].ty.is_numeric() {
                return Err(ExprError::InvalidArgument(format!(
                    "AddDays expects a number of days, got {}",
                    args[1].ty
                )));
            }
            T::datetime()
        }
    };

    Ok(ty)
}
