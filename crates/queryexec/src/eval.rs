use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use exprtree::{BinaryOp, ExprId, ExprKind, Method};
use typereg::{Grouping, Record, TypeDescriptor, Value};

use crate::bind::BoundQuery;
use crate::errors::{ExecError, Result, internal, source_err};
use crate::extension::ExtensionRegistry;
use crate::scalar;
use crate::source::{DataSource, RowIter};

/// Result of evaluating one node.
pub enum Evaluated<'a> {
    Value(Value),
    Sequence(RowIter<'a>),
}

impl<'a> Evaluated<'a> {
    /// Materialize, collecting sequences into a list.
    pub fn into_value(self) -> Result<Value> {
        match self {
            Evaluated::Value(v) => Ok(v),
            Evaluated::Sequence(iter) => Ok(Value::List(iter.collect::<Result<Vec<_>>>()?)),
        }
    }

    pub fn into_sequence(self) -> Result<RowIter<'a>> {
        match self {
            Evaluated::Sequence(iter) => Ok(iter),
            Evaluated::Value(Value::List(values)) => Ok(Box::new(values.into_iter().map(Ok))),
            Evaluated::Value(Value::Grouping(group)) => {
                Ok(Box::new(group.elements.into_iter().map(Ok)))
            }
            Evaluated::Value(Value::Null) => Err(source_err!("sequence is null")),
            Evaluated::Value(other) => Err(internal!("expected a sequence, got {}", other.kind())),
        }
    }
}

#[derive(Debug)]
struct Scope<'a> {
    name: &'a str,
    value: Value,
    parent: Env<'a>,
}

/// Lambda parameter bindings, innermost first.
type Env<'a> = Option<Arc<Scope<'a>>>;

fn lookup<'e>(env: &'e Env<'_>, name: &str) -> Option<&'e Value> {
    let mut current = env.as_deref();
    while let Some(scope) = current {
        if scope.name == name {
            return Some(&scope.value);
        }
        current = scope.parent.as_deref();
    }
    None
}

fn error_iter<'a>(err: ExecError) -> RowIter<'a> {
    Box::new(std::iter::once(Err(err)))
}

/// Interprets a bound query against a data source.
///
/// Sequence operators are lazy where they can be: `Where`, `Select`,
/// `SelectMany`, `Concat`, `Distinct`, `Union`, `Skip` and `Take` pull from
/// their input one element at a time. Ordering, grouping and the right-hand
/// sides of `Join`, `Intersect` and `Except` are buffered.
#[derive(Clone, Copy)]
pub struct Evaluator<'a> {
    query: &'a BoundQuery,
    source: &'a dyn DataSource,
    extensions: &'a ExtensionRegistry,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        query: &'a BoundQuery,
        source: &'a dyn DataSource,
        extensions: &'a ExtensionRegistry,
    ) -> Self {
        Evaluator {
            query,
            source,
            extensions,
        }
    }

    /// Evaluate a query whose result is a sequence.
    pub fn stream(self) -> Result<RowIter<'a>> {
        self.eval(self.query.tree().root(), &None)?.into_sequence()
    }

    /// Evaluate a query to a single value.
    pub fn scalar(self) -> Result<Value> {
        self.eval(self.query.tree().root(), &None)?.into_value()
    }

    fn eval(self, id: ExprId, env: &Env<'a>) -> Result<Evaluated<'a>> {
        let node = self.query.tree().node(id);
        let value = match &node.kind {
            ExprKind::Source { entity } => return Ok(Evaluated::Sequence(self.source.get_root(entity)?)),
            ExprKind::Constant(v) => v.clone(),
            ExprKind::Parameter { name } => lookup(env, name)
                .cloned()
                .ok_or_else(|| internal!("parameter {name} is not bound"))?,
            ExprKind::Member { target, member } => match self.value(*target, env)? {
                Value::Null => Value::Null,
                Value::Record(record) => record
                    .get(member)
                    .cloned()
                    .ok_or_else(|| source_err!("record of {} has no member {member}", record.shape))?,
                Value::Grouping(group) if member == "Key" => group.key,
                other => return Err(internal!("member {member} accessed on {}", other.kind())),
            },
            ExprKind::Call { method, args } => {
                if method.is_query_operator() {
                    return self.query_call(*method, args, &node.ty, env);
                }
                let args = args
                    .iter()
                    .map(|arg| self.value(*arg, env))
                    .collect::<Result<Vec<_>>>()?;
                scalar::function(*method, &args)?
            }
            ExprKind::Lambda { .. } | ExprKind::Quote { .. } => {
                return Err(ExecError::UnsupportedOperation(
                    "lambda evaluated outside of a query operator".to_string(),
                ));
            }
            ExprKind::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let l = self.value(*left, env)?.as_bool().unwrap_or(false);
                    Value::Bool(l && self.value(*right, env)?.as_bool().unwrap_or(false))
                }
                BinaryOp::Or => {
                    let l = self.value(*left, env)?.as_bool().unwrap_or(false);
                    Value::Bool(l || self.value(*right, env)?.as_bool().unwrap_or(false))
                }
                op => {
                    let l = self.value(*left, env)?;
                    let r = self.value(*right, env)?;
                    scalar::binary(*op, &l, &r, &node.ty)?
                }
            },
            ExprKind::Unary { op, operand } => scalar::unary(*op, self.value(*operand, env)?)?,
            ExprKind::Conditional {
                test,
                if_true,
                if_false,
            } => {
                let branch = match self.value(*test, env)?.as_bool() {
                    Some(true) => *if_true,
                    _ => *if_false,
                };
                return self.eval(branch, env);
            }
            ExprKind::New { fields } => {
                let fields = fields
                    .iter()
                    .map(|(name, id)| Ok((name.clone(), self.value(*id, env)?)))
                    .collect::<Result<Vec<_>>>()?;
                Value::Record(Record::new(node.ty.clone(), fields))
            }
            ExprKind::Convert { operand } => scalar::convert(self.value(*operand, env)?, &node.ty)?,
            ExprKind::Extension { name, args } => {
                let ext = self.extensions.get(name).ok_or_else(|| {
                    ExecError::UnsupportedOperation(format!("no extension registered for '{name}'"))
                })?;
                let args = args
                    .iter()
                    .map(|arg| self.value(*arg, env))
                    .collect::<Result<Vec<_>>>()?;
                ext.invoke(&args)?
            }
        };
        Ok(Evaluated::Value(value))
    }

    fn value(self, id: ExprId, env: &Env<'a>) -> Result<Value> {
        self.eval(id, env)?.into_value()
    }

    fn sequence(self, id: ExprId, env: &Env<'a>) -> Result<RowIter<'a>> {
        self.eval(id, env)?.into_sequence()
    }

    fn lambda_parts(self, mut id: ExprId) -> Result<(&'a [(String, TypeDescriptor)], ExprId)> {
        loop {
            match &self.query.tree().node(id).kind {
                ExprKind::Quote { operand } => id = *operand,
                ExprKind::Lambda { params, body } => return Ok((params.as_slice(), *body)),
                other => return Err(internal!("expected a lambda, got {}", other.kind_name())),
            }
        }
    }

    fn invoke_eval(self, lambda: ExprId, env: &Env<'a>, args: Vec<Value>) -> Result<Evaluated<'a>> {
        let (params, body) = self.lambda_parts(lambda)?;
        if params.len() != args.len() {
            return Err(internal!(
                "lambda takes {} arguments, got {}",
                params.len(),
                args.len()
            ));
        }
        let mut scope = env.clone();
        for ((name, _), value) in params.iter().zip(args) {
            scope = Some(Arc::new(Scope {
                name: name.as_str(),
                value,
                parent: scope,
            }));
        }
        self.eval(body, &scope)
    }

    fn invoke(self, lambda: ExprId, env: &Env<'a>, args: Vec<Value>) -> Result<Value> {
        self.invoke_eval(lambda, env, args)?.into_value()
    }

    fn test(self, predicate: ExprId, env: &Env<'a>, value: Value) -> Result<bool> {
        Ok(self.invoke(predicate, env, vec![value])?.as_bool().unwrap_or(false))
    }

    /// Input sequence of an aggregate, filtered by an optional predicate.
    fn filtered(self, args: &[ExprId], env: &Env<'a>) -> Result<RowIter<'a>> {
        let source = self.sequence(args[0], env)?;
        match args.get(1) {
            Some(pred) => Ok(self.filter(source, *pred, env)),
            None => Ok(source),
        }
    }

    /// Input sequence of an aggregate, mapped by an optional selector.
    fn selected(self, args: &[ExprId], env: &Env<'a>) -> Result<RowIter<'a>> {
        let source = self.sequence(args[0], env)?;
        match args.get(1) {
            Some(sel) => Ok(self.map(source, *sel, env)),
            None => Ok(source),
        }
    }

    fn filter(self, source: RowIter<'a>, predicate: ExprId, env: &Env<'a>) -> RowIter<'a> {
        let env = env.clone();
        Box::new(source.filter_map(move |item| match item {
            Ok(v) => match self.test(predicate, &env, v.clone()) {
                Ok(true) => Some(Ok(v)),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            },
            Err(e) => Some(Err(e)),
        }))
    }

    fn map(self, source: RowIter<'a>, selector: ExprId, env: &Env<'a>) -> RowIter<'a> {
        let env = env.clone();
        Box::new(source.map(move |item| self.invoke(selector, &env, vec![item?])))
    }

    fn query_call(
        self,
        method: Method,
        args: &'a [ExprId],
        ty: &TypeDescriptor,
        env: &Env<'a>,
    ) -> Result<Evaluated<'a>> {
        let arg = |idx: usize| {
            args.get(idx)
                .copied()
                .ok_or_else(|| internal!("missing argument {idx} for {}", method.name()))
        };

        let seq = match method {
            Method::Where => {
                let source = self.sequence(arg(0)?, env)?;
                self.filter(source, arg(1)?, env)
            }
            Method::Select => {
                let source = self.sequence(arg(0)?, env)?;
                self.map(source, arg(1)?, env)
            }
            Method::SelectMany => {
                let source = self.sequence(arg(0)?, env)?;
                let selector = arg(1)?;
                let env = env.clone();
                Box::new(source.flat_map(move |item| {
                    let inner = item.and_then(|v| {
                        self.invoke_eval(selector, &env, vec![v])?.into_sequence()
                    });
                    inner.unwrap_or_else(error_iter)
                }))
            }
            Method::OrderBy | Method::OrderByDescending | Method::ThenBy | Method::ThenByDescending => {
                self.order(method, args, env)?
            }
            Method::GroupBy => self.group_by(args, env)?,
            Method::Join => self.join(args, env)?,
            Method::Concat => {
                let left = self.sequence(arg(0)?, env)?;
                let right = self.sequence(arg(1)?, env)?;
                Box::new(left.chain(right))
            }
            Method::Union => {
                let left = self.sequence(arg(0)?, env)?;
                let right = self.sequence(arg(1)?, env)?;
                distinct(Box::new(left.chain(right)))
            }
            Method::Distinct => distinct(self.sequence(arg(0)?, env)?),
            Method::Intersect | Method::Except => {
                let left = self.sequence(arg(0)?, env)?;
                let right = self
                    .sequence(arg(1)?, env)?
                    .collect::<Result<HashSet<_>>>()?;
                let keep = method == Method::Intersect;
                let mut seen = HashSet::new();
                Box::new(left.filter(move |item| match item {
                    Ok(v) => right.contains(v) == keep && seen.insert(v.clone()),
                    Err(_) => true,
                }))
            }
            Method::Skip => {
                let source = self.sequence(arg(0)?, env)?;
                let mut remaining = self.count_arg(arg(1)?, env)?;
                Box::new(source.filter(move |item| {
                    if item.is_ok() && remaining > 0 {
                        remaining -= 1;
                        return false;
                    }
                    true
                }))
            }
            Method::Take => {
                let mut source = self.sequence(arg(0)?, env)?;
                let mut remaining = self.count_arg(arg(1)?, env)?;
                Box::new(std::iter::from_fn(move || {
                    if remaining == 0 {
                        return None;
                    }
                    let item = source.next()?;
                    if item.is_ok() {
                        remaining -= 1;
                    }
                    Some(item)
                }))
            }
            method => return self.aggregate(method, args, ty, env).map(Evaluated::Value),
        };
        Ok(Evaluated::Sequence(seq))
    }

    fn count_arg(self, id: ExprId, env: &Env<'a>) -> Result<usize> {
        let n = self
            .value(id, env)?
            .as_i64()
            .ok_or_else(|| internal!("count argument is not an integer"))?;
        Ok(n.max(0) as usize)
    }

    /// Sort by a chain of ordering operators, evaluated as one stable sort
    /// over all keys of the chain.
    fn order(self, method: Method, args: &'a [ExprId], env: &Env<'a>) -> Result<RowIter<'a>> {
        let tree = self.query.tree();
        let mut keys = Vec::new();
        let (mut method, mut args) = (method, args);
        let base = loop {
            let (input, key) = match args {
                [input, key] => (*input, *key),
                _ => return Err(internal!("{} takes an input and a key", method.name())),
            };
            keys.push((
                key,
                matches!(method, Method::OrderByDescending | Method::ThenByDescending),
            ));
            if matches!(method, Method::OrderBy | Method::OrderByDescending) {
                break input;
            }
            match &tree.node(input).kind {
                ExprKind::Call {
                    method: inner,
                    args: inner_args,
                } if inner.is_ordering() => {
                    method = *inner;
                    args = inner_args.as_slice();
                }
                _ => return Err(internal!("{} applied to an unordered sequence", method.name())),
            }
        };
        keys.reverse();

        let mut rows = Vec::new();
        for item in self.sequence(base, env)? {
            let item = item?;
            let row_keys = keys
                .iter()
                .map(|(key, _)| self.invoke(*key, env, vec![item.clone()]))
                .collect::<Result<Vec<_>>>()?;
            rows.push((row_keys, item));
        }

        rows.sort_by(|(a, _), (b, _)| {
            for ((ka, kb), (_, descending)) in a.iter().zip(b).zip(&keys) {
                let ord = ka.compare(kb).unwrap_or(Ordering::Equal);
                let ord = if *descending { ord.reverse() } else { ord };
                if ord.is_ne() {
                    return ord;
                }
            }
            Ordering::Equal
        });

        Ok(Box::new(rows.into_iter().map(|(_, item)| Ok(item))))
    }

    /// Groups come out in order of first appearance of their key. Null keys
    /// form a group of their own.
    fn group_by(self, args: &[ExprId], env: &Env<'a>) -> Result<RowIter<'a>> {
        let key = args[1];
        let mut index: HashMap<Value, usize> = HashMap::new();
        let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
        for item in self.sequence(args[0], env)? {
            let item = item?;
            let k = self.invoke(key, env, vec![item.clone()])?;
            match index.get(&k) {
                Some(idx) => groups[*idx].1.push(item),
                None => {
                    index.insert(k.clone(), groups.len());
                    groups.push((k, vec![item]));
                }
            }
        }

        match args.get(2).copied() {
            Some(result) => {
                let env = env.clone();
                Ok(Box::new(groups.into_iter().map(move |(key, elements)| {
                    self.invoke(result, &env, vec![key, Value::List(elements)])
                })))
            }
            None => Ok(Box::new(groups.into_iter().map(|(key, elements)| {
                Ok(Value::Grouping(Box::new(Grouping { key, elements })))
            }))),
        }
    }

    /// Hash join. The inner side is buffered, the outer side is streamed.
    /// Results follow outer order, then inner order. Null keys never match.
    fn join(self, args: &[ExprId], env: &Env<'a>) -> Result<RowIter<'a>> {
        let (outer, inner, outer_key, inner_key, result) = match args {
            [o, i, ok, ik, r] => (*o, *i, *ok, *ik, *r),
            _ => return Err(internal!("Join takes 5 arguments")),
        };

        let mut table: HashMap<Value, Vec<Value>> = HashMap::new();
        for item in self.sequence(inner, env)? {
            let item = item?;
            let k = self.invoke(inner_key, env, vec![item.clone()])?;
            if k.is_null() {
                continue;
            }
            table.entry(normalize_key(k)).or_default().push(item);
        }

        let outer = self.sequence(outer, env)?;
        let env = env.clone();
        Ok(Box::new(outer.flat_map(move |item| -> RowIter<'a> {
            let item = match item {
                Ok(item) => item,
                Err(e) => return error_iter(e),
            };
            let k = match self.invoke(outer_key, &env, vec![item.clone()]) {
                Ok(k) => k,
                Err(e) => return error_iter(e),
            };
            if k.is_null() {
                return Box::new(std::iter::empty());
            }
            let matches = table.get(&normalize_key(k)).cloned().unwrap_or_default();
            let env = env.clone();
            Box::new(
                matches
                    .into_iter()
                    .map(move |inner| self.invoke(result, &env, vec![item.clone(), inner])),
            )
        })))
    }

    fn aggregate(
        self,
        method: Method,
        args: &[ExprId],
        ty: &TypeDescriptor,
        env: &Env<'a>,
    ) -> Result<Value> {
        let value = match method {
            Method::Count => {
                let mut count: i32 = 0;
                for item in self.filtered(args, env)? {
                    item?;
                    count = count
                        .checked_add(1)
                        .ok_or_else(|| source_err!("count overflow"))?;
                }
                Value::Int32(count)
            }
            Method::Sum => sum(self.selected(args, env)?, ty)?,
            Method::Min | Method::Max => {
                let mut seen = false;
                let mut best: Option<Value> = None;
                for item in self.selected(args, env)? {
                    let item = item?;
                    seen = true;
                    if item.is_null() {
                        continue;
                    }
                    let replace = match &best {
                        None => true,
                        Some(current) => match item.compare(current) {
                            Some(Ordering::Less) => method == Method::Min,
                            Some(Ordering::Greater) => method == Method::Max,
                            _ => false,
                        },
                    };
                    if replace {
                        best = Some(item);
                    }
                }
                if !seen {
                    return Err(source_err!("sequence contains no elements"));
                }
                best.unwrap_or(Value::Null)
            }
            Method::Average => {
                let mut seen = false;
                let mut total = 0.0;
                let mut count = 0u64;
                for item in self.selected(args, env)? {
                    let item = item?;
                    seen = true;
                    if let Some(v) = item.as_f64() {
                        total += v;
                        count += 1;
                    }
                }
                if !seen {
                    return Err(source_err!("sequence contains no elements"));
                }
                if count == 0 {
                    Value::Null
                } else {
                    Value::Float64(total / count as f64)
                }
            }
            Method::Any => match self.filtered(args, env)?.next() {
                Some(item) => {
                    item?;
                    Value::Bool(true)
                }
                None => Value::Bool(false),
            },
            Method::All => {
                let source = self.sequence(args[0], env)?;
                let mut all = true;
                for item in source {
                    if !self.test(args[1], env, item?)? {
                        all = false;
                        break;
                    }
                }
                Value::Bool(all)
            }
            Method::Contains => {
                let needle = self.value(args[1], env)?;
                let mut found = false;
                for item in self.sequence(args[0], env)? {
                    if scalar::values_equal(&item?, &needle) {
                        found = true;
                        break;
                    }
                }
                Value::Bool(found)
            }
            Method::First | Method::FirstOrDefault => match self.filtered(args, env)?.next() {
                Some(item) => item?,
                None if method == Method::FirstOrDefault => scalar::default_for(ty),
                None => return Err(source_err!("sequence contains no matching element")),
            },
            Method::Single | Method::SingleOrDefault => {
                let mut source = self.filtered(args, env)?;
                match source.next() {
                    Some(item) => {
                        let item = item?;
                        if let Some(next) = source.next() {
                            next?;
                            return Err(source_err!("sequence contains more than one element"));
                        }
                        item
                    }
                    None if method == Method::SingleOrDefault => scalar::default_for(ty),
                    None => return Err(source_err!("sequence contains no matching element")),
                }
            }
            Method::ToList => Value::List(
                self.sequence(args[0], env)?
                    .collect::<Result<Vec<_>>>()?,
            ),
            Method::ToDictionary => {
                let key = args[1];
                let value = args.get(2).copied();
                let mut keys = HashSet::new();
                let mut pairs = Vec::new();
                for item in self.sequence(args[0], env)? {
                    let item = item?;
                    let k = self.invoke(key, env, vec![item.clone()])?;
                    if k.is_null() {
                        return Err(source_err!("dictionary key is null"));
                    }
                    if !keys.insert(k.clone()) {
                        return Err(source_err!("duplicate dictionary key {k}"));
                    }
                    let v = match value {
                        Some(sel) => self.invoke(sel, env, vec![item])?,
                        None => item,
                    };
                    pairs.push((k, v));
                }
                Value::Dictionary(pairs)
            }
            other => {
                return Err(ExecError::UnsupportedOperation(format!(
                    "{} is not a query operator",
                    other.name()
                )));
            }
        };
        Ok(value)
    }
}

/// Integer keys of either width compare equal, floats hash by bit pattern.
/// Whole floats are mapped onto integers so mixed numeric keys still join.
fn normalize_key(key: Value) -> Value {
    match key {
        Value::Int32(v) => Value::Int64(v as i64),
        Value::Float64(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Value::Int64(f as i64),
        other => other,
    }
}

fn distinct<'a>(source: RowIter<'a>) -> RowIter<'a> {
    let mut seen = HashSet::new();
    Box::new(source.filter(move |item| match item {
        Ok(v) => seen.insert(v.clone()),
        Err(_) => true,
    }))
}

fn sum(values: RowIter<'_>, ty: &TypeDescriptor) -> Result<Value> {
    if *ty == TypeDescriptor::float64() {
        let mut total = 0.0;
        for v in values {
            if let Some(f) = v?.as_f64() {
                total += f;
            }
        }
        return Ok(Value::Float64(total));
    }

    let mut total: i64 = 0;
    for v in values {
        if let Some(i) = v?.as_i64() {
            total = total
                .checked_add(i)
                .ok_or_else(|| source_err!("arithmetic overflow in Sum"))?;
        }
    }
    if *ty == TypeDescriptor::int32() {
        let total =
            i32::try_from(total).map_err(|_| source_err!("arithmetic overflow in Sum"))?;
        Ok(Value::Int32(total))
    } else {
        Ok(Value::Int64(total))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use exprtree::TreeBuilder;
    use typereg::{EntitySchema, MemberSchema, TypeRegistry, TypeRegistryBuilder};

    use super::*;
    use crate::extension::ScalarExtension;
    use crate::source::MemoryDataSource;

    fn item() -> TypeDescriptor {
        TypeDescriptor::entity("Item", 1)
    }

    fn registry() -> Arc<TypeRegistry> {
        TypeRegistryBuilder::new()
            .register(EntitySchema::new(
                item(),
                vec![
                    MemberSchema::new("Id", TypeDescriptor::int32()),
                    MemberSchema::new("Name", TypeDescriptor::string()),
                    MemberSchema::new("Price", TypeDescriptor::int64()),
                    MemberSchema::new("Category", TypeDescriptor::string()),
                ],
            ))
            .unwrap()
            .build()
            .unwrap()
    }

    fn row(id: i32, name: &str, price: i64, category: Option<&str>) -> Value {
        Value::Record(Record::new(
            item(),
            vec![
                ("Id".to_string(), Value::Int32(id)),
                ("Name".to_string(), Value::from(name)),
                ("Price".to_string(), Value::Int64(price)),
                ("Category".to_string(), Value::from(category)),
            ],
        ))
    }

    fn items() -> MemoryDataSource {
        MemoryDataSource::new().with_table(
            &item(),
            vec![
                row(1, "bolt", 5, Some("hardware")),
                row(2, "nut", 2, Some("hardware")),
                row(3, "glue", 7, None),
                row(4, "tape", 3, Some("office")),
                row(5, "pen", 2, Some("office")),
            ],
        )
    }

    fn run_with(
        mut source: MemoryDataSource,
        extensions: ExtensionRegistry,
        build: impl FnOnce(&mut TreeBuilder) -> exprtree::Result<ExprId>,
    ) -> Result<Value> {
        let registry = registry();
        let mut b = TreeBuilder::new(registry.clone());
        let root = build(&mut b).unwrap();
        let tree = b.finish(root).unwrap();
        let declared = tree.result_type().clone();
        let query = BoundQuery::bind(tree, declared, &registry)?;

        source.start_session()?;
        let eval = Evaluator::new(&query, &source, &extensions);
        if query.shape().is_stream() {
            Ok(Value::List(eval.stream()?.collect::<Result<Vec<_>>>()?))
        } else {
            eval.scalar()
        }
    }

    fn run(build: impl FnOnce(&mut TreeBuilder) -> exprtree::Result<ExprId>) -> Result<Value> {
        run_with(items(), ExtensionRegistry::new(), build)
    }

    fn ids(value: Value) -> Vec<i32> {
        match value {
            Value::List(rows) => rows
                .iter()
                .map(|r| r.field("Id").and_then(Value::as_i64).unwrap() as i32)
                .collect(),
            other => panic!("expected a list, got {other}"),
        }
    }

    fn list(value: Value) -> Vec<Value> {
        match value {
            Value::List(values) => values,
            other => panic!("expected a list, got {other}"),
        }
    }

    #[test]
    fn where_then_select() {
        let out = run(|b| {
            let src = b.source(item())?;
            let expensive = b.filter(src, |b, e| {
                let price = b.member(e, "Price")?;
                let limit = b.constant(2i64)?;
                b.gt(price, limit)
            })?;
            b.select(expensive, |b, e| b.member(e, "Id"))
        })
        .unwrap();
        assert_eq!(
            vec![Value::Int32(1), Value::Int32(3), Value::Int32(4)],
            list(out)
        );
    }

    #[test]
    fn order_then_by_descending() {
        let out = run(|b| {
            let src = b.source(item())?;
            let ordered = b.order_by(src, |b, e| b.member(e, "Price"))?;
            b.then_by_descending(ordered, |b, e| b.member(e, "Id"))
        })
        .unwrap();
        assert_eq!(vec![5, 2, 4, 1, 3], ids(out));
    }

    #[test]
    fn group_by_keeps_first_appearance_and_null_group() {
        let out = run(|b| {
            let src = b.source(item())?;
            b.group_by_with(
                src,
                |b, e| b.member(e, "Category"),
                |b, key, elements| {
                    let count = b.count(elements)?;
                    b.new_shape(&[("Key", key), ("Count", count)])
                },
            )
        })
        .unwrap();

        let groups: Vec<(Value, Value)> = list(out)
            .iter()
            .map(|g| (g.field("Key").cloned().unwrap(), g.field("Count").cloned().unwrap()))
            .collect();
        assert_eq!(
            vec![
                (Value::from("hardware"), Value::Int32(2)),
                (Value::Null, Value::Int32(1)),
                (Value::from("office"), Value::Int32(2)),
            ],
            groups
        );
    }

    #[test]
    fn join_skips_null_keys() {
        let out = run(|b| {
            let outer = b.source(item())?;
            let inner = b.source(item())?;
            let joined = b.join(
                outer,
                inner,
                |b, o| b.member(o, "Category"),
                |b, i| b.member(i, "Category"),
                |b, o, i| {
                    let left = b.member(o, "Id")?;
                    let right = b.member(i, "Id")?;
                    b.new_shape(&[("Left", left), ("Right", right)])
                },
            )?;
            b.count(joined)
        })
        .unwrap();
        assert_eq!(Value::Int32(8), out);
    }

    #[test]
    fn aggregates() {
        let sum = run(|b| {
            let src = b.source(item())?;
            b.sum_by(src, |b, e| b.member(e, "Price"))
        })
        .unwrap();
        assert_eq!(Value::Int64(19), sum);

        let avg = run(|b| {
            let src = b.source(item())?;
            b.average_by(src, |b, e| b.member(e, "Price"))
        })
        .unwrap();
        assert_eq!(Value::Float64(3.8), avg);

        let max_name = run(|b| {
            let src = b.source(item())?;
            b.max_by(src, |b, e| b.member(e, "Name"))
        })
        .unwrap();
        assert_eq!(Value::from("tape"), max_name);

        let all_positive = run(|b| {
            let src = b.source(item())?;
            b.all(src, |b, e| {
                let price = b.member(e, "Price")?;
                let zero = b.constant(0i64)?;
                b.gt(price, zero)
            })
        })
        .unwrap();
        assert_eq!(Value::Bool(true), all_positive);
    }

    #[test]
    fn min_of_empty_sequence_fails() {
        let err = run(|b| {
            let src = b.source(item())?;
            let none = b.filter(src, |b, _| b.constant(false))?;
            b.min_by(none, |b, e| b.member(e, "Price"))
        })
        .unwrap_err();
        assert!(matches!(err, ExecError::SourceExecution(msg) if msg.contains("no elements")));
    }

    #[test]
    fn single_and_defaults() {
        let single = run(|b| {
            let src = b.source(item())?;
            b.single_where(src, |b, e| {
                let id = b.member(e, "Id")?;
                let three = b.constant(3)?;
                b.eq(id, three)
            })
        })
        .unwrap();
        assert_eq!(Some(&Value::from("glue")), single.field("Name"));

        let missing = run(|b| {
            let src = b.source(item())?;
            b.first_or_default_where(src, |b, e| {
                let price = b.member(e, "Price")?;
                let limit = b.constant(100i64)?;
                b.gt(price, limit)
            })
        })
        .unwrap();
        assert_eq!(Value::Null, missing);

        let err = run(|b| {
            let src = b.source(item())?;
            b.single(src)
        })
        .unwrap_err();
        assert!(matches!(err, ExecError::SourceExecution(msg) if msg.contains("more than one")));
    }

    #[test]
    fn take_pulls_only_what_it_needs() {
        let mut source = items();
        let counters = source.counters();
        source.start_session().unwrap();

        let registry = registry();
        let mut b = TreeBuilder::new(registry.clone());
        let src = b.source(item()).unwrap();
        let taken = b.take(src, 2).unwrap();
        let tree = b.finish(taken).unwrap();
        let query = BoundQuery::bind(tree, TypeDescriptor::sequence(item()), &registry).unwrap();
        let extensions = ExtensionRegistry::new();

        let rows: Vec<_> = Evaluator::new(&query, &source, &extensions)
            .stream()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(2, rows.len());
        assert_eq!(2, counters.rows_produced());
    }

    #[test]
    fn skip_then_take() {
        let out = run(|b| {
            let src = b.source(item())?;
            let skipped = b.skip(src, 1)?;
            b.take(skipped, 2)
        })
        .unwrap();
        assert_eq!(vec![2, 3], ids(out));
    }

    #[test]
    fn distinct_categories() {
        let out = run(|b| {
            let src = b.source(item())?;
            let categories = b.select(src, |b, e| b.member(e, "Category"))?;
            b.distinct(categories)
        })
        .unwrap();
        assert_eq!(
            vec![Value::from("hardware"), Value::Null, Value::from("office")],
            list(out)
        );
    }

    #[test]
    fn except_and_intersect() {
        let cheap = |b: &mut TreeBuilder| {
            let src = b.source(item())?;
            b.filter(src, |b, e| {
                let price = b.member(e, "Price")?;
                let limit = b.constant(3i64)?;
                b.le(price, limit)
            })
        };
        let out = run(|b| {
            let all = b.source(item())?;
            let cheap = cheap(b)?;
            b.except(all, cheap)
        })
        .unwrap();
        assert_eq!(vec![1, 3], ids(out));

        let out = run(|b| {
            let all = b.source(item())?;
            let cheap = cheap(b)?;
            b.intersect(all, cheap)
        })
        .unwrap();
        assert_eq!(vec![2, 4, 5], ids(out));
    }

    #[test]
    fn duplicate_dictionary_key() {
        let err = run(|b| {
            let src = b.source(item())?;
            b.to_dictionary(src, |b, e| b.member(e, "Category"))
        })
        .unwrap_err();
        assert!(matches!(err, ExecError::SourceExecution(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn source_failure_surfaces_mid_stream() {
        let source = items().with_failure(&item(), 3, "read timed out");
        let err = run_with(source, ExtensionRegistry::new(), |b| b.source(item())).unwrap_err();
        assert!(matches!(err, ExecError::SourceExecution(msg) if msg == "read timed out"));
    }

    #[derive(Debug)]
    struct Shout;

    impl ScalarExtension for Shout {
        fn name(&self) -> &str {
            "shout"
        }

        fn invoke(&self, args: &[Value]) -> Result<Value> {
            match args {
                [Value::String(s)] => Ok(Value::String(format!("{}!", s.to_uppercase()))),
                _ => Err(internal!("shout takes one string")),
            }
        }
    }

    #[test]
    fn extension_nodes() {
        let build = |b: &mut TreeBuilder| {
            let src = b.source(item())?;
            let first = b.first(src)?;
            let name = b.member(first, "Name")?;
            b.extension("shout", &[name], TypeDescriptor::string())
        };

        let extensions = ExtensionRegistry::new().with_extension(Arc::new(Shout));
        let out = run_with(items(), extensions, build).unwrap();
        assert_eq!(Value::from("BOLT!"), out);

        let err = run(build).unwrap_err();
        assert!(matches!(err, ExecError::UnsupportedOperation(_)));
    }
}
