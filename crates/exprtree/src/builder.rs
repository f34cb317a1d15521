use std::sync::Arc;

use typereg::{TypeDescriptor, TypeRegistry, Value};

use crate::errors::{ExprError, Result};
use crate::node::{BinaryOp, ExprId, ExprKind, ExprNode, Method, UnaryOp};
use crate::tree::ExprTree;
use crate::typing;

/// Composes expression trees.
///
/// Building never executes anything. Every constructor records one node and
/// computes its static type, failing on ill-typed composition. Lambdas passed
/// to query operators are built through closures that receive the builder and
/// the lambda's parameter nodes:
///
/// ```ignore
/// let employees = b.source(employee)?;
/// let rich = b.filter(employees, |b, e| {
///     let salary = b.member(e, "Salary")?;
///     let limit = b.constant(5000i64)?;
///     b.gt(salary, limit)
/// })?;
/// let tree = b.finish(rich)?;
/// ```
#[derive(Debug)]
pub struct TreeBuilder {
    registry: Arc<TypeRegistry>,
    nodes: Vec<ExprNode>,
    next_param: usize,
}

impl TreeBuilder {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        TreeBuilder {
            registry,
            nodes: Vec::new(),
            next_param: 0,
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Static type of an already built node.
    pub fn type_of(&self, id: ExprId) -> Result<&TypeDescriptor> {
        self.nodes
            .get(id.index())
            .map(|n| &n.ty)
            .ok_or(ExprError::InvalidReference {
                node: self.nodes.len(),
                child: id.index(),
            })
    }

    /// Finish the tree with `root` as its result.
    pub fn finish(self, root: ExprId) -> Result<ExprTree> {
        let tree = ExprTree::from_parts(self.nodes, root)?;
        tree.validate()?;
        Ok(tree)
    }

    fn push(&mut self, kind: ExprKind, given: Option<TypeDescriptor>) -> Result<ExprId> {
        let ty = typing::infer_type(&self.registry, &self.nodes, &kind, given.as_ref())?;
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(ExprNode { kind, ty });
        Ok(id)
    }

    pub fn source(&mut self, entity: TypeDescriptor) -> Result<ExprId> {
        self.push(ExprKind::Source { entity }, None)
    }

    /// A constant whose type follows from the value.
    pub fn constant(&mut self, value: impl Into<Value>) -> Result<ExprId> {
        let value = value.into();
        let ty = match &value {
            Value::Bool(_) => TypeDescriptor::bool(),
            Value::Int32(_) => TypeDescriptor::int32(),
            Value::Int64(_) => TypeDescriptor::int64(),
            Value::Float64(_) => TypeDescriptor::float64(),
            Value::String(_) => TypeDescriptor::string(),
            Value::DateTime(_) => TypeDescriptor::datetime(),
            Value::Record(rec) => rec.shape.clone(),
            other => {
                return Err(ExprError::InvalidArgument(format!(
                    "type of a {} constant must be given explicitly",
                    other.kind()
                )));
            }
        };
        self.constant_typed(value, ty)
    }

    pub fn constant_typed(&mut self, value: Value, ty: TypeDescriptor) -> Result<ExprId> {
        self.push(ExprKind::Constant(value), Some(ty))
    }

    pub fn null(&mut self, ty: TypeDescriptor) -> Result<ExprId> {
        self.constant_typed(Value::Null, ty)
    }

    /// Build a lambda. `body` receives one parameter node per entry in
    /// `params`.
    pub fn lambda<F>(&mut self, params: &[TypeDescriptor], body: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, &[ExprId]) -> Result<ExprId>,
    {
        let mut declared = Vec::with_capacity(params.len());
        let mut ids = Vec::with_capacity(params.len());
        for ty in params {
            let name = format!("x{}", self.next_param);
            self.next_param += 1;
            ids.push(self.push(ExprKind::Parameter { name: name.clone() }, Some(ty.clone()))?);
            declared.push((name, ty.clone()));
        }
        let body = body(self, &ids)?;
        self.push(
            ExprKind::Lambda {
                params: declared,
                body,
            },
            None,
        )
    }

    pub fn quote(&mut self, lambda: ExprId) -> Result<ExprId> {
        self.push(ExprKind::Quote { operand: lambda }, None)
    }

    pub fn member(&mut self, target: ExprId, member: &str) -> Result<ExprId> {
        self.push(
            ExprKind::Member {
                target,
                member: member.to_string(),
            },
            None,
        )
    }

    pub fn binary(&mut self, op: BinaryOp, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.push(ExprKind::Binary { op, left, right }, None)
    }

    pub fn and(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.binary(BinaryOp::And, left, right)
    }

    pub fn or(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.binary(BinaryOp::Or, left, right)
    }

    pub fn eq(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.binary(BinaryOp::Eq, left, right)
    }

    pub fn ne(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.binary(BinaryOp::Ne, left, right)
    }

    pub fn lt(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.binary(BinaryOp::Lt, left, right)
    }

    pub fn le(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.binary(BinaryOp::Le, left, right)
    }

    pub fn gt(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.binary(BinaryOp::Gt, left, right)
    }

    pub fn ge(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.binary(BinaryOp::Ge, left, right)
    }

    /// Numeric addition, or concatenation when either side is a string.
    pub fn add(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.binary(BinaryOp::Add, left, right)
    }

    pub fn sub(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.binary(BinaryOp::Sub, left, right)
    }

    pub fn mul(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.binary(BinaryOp::Mul, left, right)
    }

    pub fn div(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.binary(BinaryOp::Div, left, right)
    }

    pub fn rem(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.binary(BinaryOp::Rem, left, right)
    }

    pub fn not(&mut self, operand: ExprId) -> Result<ExprId> {
        self.push(
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand,
            },
            None,
        )
    }

    pub fn neg(&mut self, operand: ExprId) -> Result<ExprId> {
        self.push(
            ExprKind::Unary {
                op: UnaryOp::Negate,
                operand,
            },
            None,
        )
    }

    pub fn conditional(&mut self, test: ExprId, if_true: ExprId, if_false: ExprId) -> Result<ExprId> {
        self.push(
            ExprKind::Conditional {
                test,
                if_true,
                if_false,
            },
            None,
        )
    }

    pub fn convert(&mut self, operand: ExprId, ty: TypeDescriptor) -> Result<ExprId> {
        self.push(ExprKind::Convert { operand }, Some(ty))
    }

    /// Anonymous shape with the given ordered fields.
    pub fn new_shape(&mut self, fields: &[(&str, ExprId)]) -> Result<ExprId> {
        let fields = fields
            .iter()
            .map(|(name, id)| (name.to_string(), *id))
            .collect();
        self.push(ExprKind::New { fields }, None)
    }

    /// Node of a user registered kind. Only encodable when a codec knows
    /// `name`, and only executable when the server has an extension for it.
    pub fn extension(&mut self, name: &str, args: &[ExprId], ty: TypeDescriptor) -> Result<ExprId> {
        self.push(
            ExprKind::Extension {
                name: name.to_string(),
                args: args.to_vec(),
            },
            Some(ty),
        )
    }

    /// Invoke a method directly with already built arguments.
    pub fn call(&mut self, method: Method, args: &[ExprId]) -> Result<ExprId> {
        self.push(
            ExprKind::Call {
                method,
                args: args.to_vec(),
            },
            None,
        )
    }

    fn element_of(&self, source: ExprId) -> Result<TypeDescriptor> {
        let ty = self.type_of(source)?;
        ty.enumerable_element()
            .cloned()
            .ok_or_else(|| ExprError::NotASequence(ty.clone()))
    }

    /// Quoted single parameter lambda over the elements of `source`.
    fn element_lambda<F>(&mut self, source: ExprId, body: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        let element = self.element_of(source)?;
        let lambda = self.lambda(&[element], |b, params| body(b, params[0]))?;
        self.quote(lambda)
    }

    fn with_element_lambda<F>(&mut self, method: Method, source: ExprId, body: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        let lambda = self.element_lambda(source, body)?;
        self.call(method, &[source, lambda])
    }

    pub fn filter<F>(&mut self, source: ExprId, predicate: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::Where, source, predicate)
    }

    pub fn select<F>(&mut self, source: ExprId, selector: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::Select, source, selector)
    }

    /// Project every element to a collection and flatten the results.
    pub fn select_many<F>(&mut self, source: ExprId, selector: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::SelectMany, source, selector)
    }

    pub fn order_by<F>(&mut self, source: ExprId, key: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::OrderBy, source, key)
    }

    pub fn order_by_descending<F>(&mut self, source: ExprId, key: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::OrderByDescending, source, key)
    }

    /// Secondary ordering. `source` must be the result of an ordering.
    pub fn then_by<F>(&mut self, source: ExprId, key: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::ThenBy, source, key)
    }

    pub fn then_by_descending<F>(&mut self, source: ExprId, key: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::ThenByDescending, source, key)
    }

    /// Group elements by key. Produces `sequence<grouping<K, E>>`.
    pub fn group_by<F>(&mut self, source: ExprId, key: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::GroupBy, source, key)
    }

    /// Group elements by key and map every group through `result`, which
    /// receives the key and the list of elements.
    pub fn group_by_with<K, R>(&mut self, source: ExprId, key: K, result: R) -> Result<ExprId>
    where
        K: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
        R: FnOnce(&mut Self, ExprId, ExprId) -> Result<ExprId>,
    {
        let element = self.element_of(source)?;
        let key = self.element_lambda(source, key)?;
        let key_ty = self
            .type_of(key)?
            .function_signature()
            .map(|(_, ret)| ret.clone())
            .ok_or_else(|| ExprError::InvalidArgument("group key is not a lambda".to_string()))?;
        let result = self.lambda(&[key_ty, TypeDescriptor::list(element)], |b, params| {
            result(b, params[0], params[1])
        })?;
        let result = self.quote(result)?;
        self.call(Method::GroupBy, &[source, key, result])
    }

    /// Equi-join. Elements whose keys are null never match.
    pub fn join<OK, IK, R>(
        &mut self,
        outer: ExprId,
        inner: ExprId,
        outer_key: OK,
        inner_key: IK,
        result: R,
    ) -> Result<ExprId>
    where
        OK: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
        IK: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
        R: FnOnce(&mut Self, ExprId, ExprId) -> Result<ExprId>,
    {
        let outer_elem = self.element_of(outer)?;
        let inner_elem = self.element_of(inner)?;
        let outer_key = self.element_lambda(outer, outer_key)?;
        let inner_key = self.element_lambda(inner, inner_key)?;
        let result = self.lambda(&[outer_elem, inner_elem], |b, params| {
            result(b, params[0], params[1])
        })?;
        let result = self.quote(result)?;
        self.call(Method::Join, &[outer, inner, outer_key, inner_key, result])
    }

    pub fn union(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.call(Method::Union, &[left, right])
    }

    pub fn intersect(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.call(Method::Intersect, &[left, right])
    }

    pub fn except(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.call(Method::Except, &[left, right])
    }

    /// Concatenation. Unlike the set operations, keeps duplicates.
    pub fn concat(&mut self, left: ExprId, right: ExprId) -> Result<ExprId> {
        self.call(Method::Concat, &[left, right])
    }

    pub fn distinct(&mut self, source: ExprId) -> Result<ExprId> {
        self.call(Method::Distinct, &[source])
    }

    pub fn count(&mut self, source: ExprId) -> Result<ExprId> {
        self.call(Method::Count, &[source])
    }

    pub fn count_where<F>(&mut self, source: ExprId, predicate: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::Count, source, predicate)
    }

    pub fn sum(&mut self, source: ExprId) -> Result<ExprId> {
        self.call(Method::Sum, &[source])
    }

    pub fn sum_by<F>(&mut self, source: ExprId, selector: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::Sum, source, selector)
    }

    pub fn min(&mut self, source: ExprId) -> Result<ExprId> {
        self.call(Method::Min, &[source])
    }

    pub fn min_by<F>(&mut self, source: ExprId, selector: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::Min, source, selector)
    }

    pub fn max(&mut self, source: ExprId) -> Result<ExprId> {
        self.call(Method::Max, &[source])
    }

    pub fn max_by<F>(&mut self, source: ExprId, selector: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::Max, source, selector)
    }

    pub fn average(&mut self, source: ExprId) -> Result<ExprId> {
        self.call(Method::Average, &[source])
    }

    pub fn average_by<F>(&mut self, source: ExprId, selector: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::Average, source, selector)
    }

    pub fn any(&mut self, source: ExprId) -> Result<ExprId> {
        self.call(Method::Any, &[source])
    }

    pub fn any_where<F>(&mut self, source: ExprId, predicate: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::Any, source, predicate)
    }

    pub fn all<F>(&mut self, source: ExprId, predicate: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::All, source, predicate)
    }

    pub fn contains(&mut self, source: ExprId, value: ExprId) -> Result<ExprId> {
        self.call(Method::Contains, &[source, value])
    }

    pub fn skip(&mut self, source: ExprId, count: i32) -> Result<ExprId> {
        let count = self.constant(count)?;
        self.call(Method::Skip, &[source, count])
    }

    pub fn take(&mut self, source: ExprId, count: i32) -> Result<ExprId> {
        let count = self.constant(count)?;
        self.call(Method::Take, &[source, count])
    }

    pub fn first(&mut self, source: ExprId) -> Result<ExprId> {
        self.call(Method::First, &[source])
    }

    pub fn first_where<F>(&mut self, source: ExprId, predicate: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::First, source, predicate)
    }

    pub fn first_or_default(&mut self, source: ExprId) -> Result<ExprId> {
        self.call(Method::FirstOrDefault, &[source])
    }

    pub fn first_or_default_where<F>(&mut self, source: ExprId, predicate: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::FirstOrDefault, source, predicate)
    }

    pub fn single(&mut self, source: ExprId) -> Result<ExprId> {
        self.call(Method::Single, &[source])
    }

    pub fn single_where<F>(&mut self, source: ExprId, predicate: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::Single, source, predicate)
    }

    pub fn single_or_default(&mut self, source: ExprId) -> Result<ExprId> {
        self.call(Method::SingleOrDefault, &[source])
    }

    pub fn single_or_default_where<F>(&mut self, source: ExprId, predicate: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::SingleOrDefault, source, predicate)
    }

    pub fn to_list(&mut self, source: ExprId) -> Result<ExprId> {
        self.call(Method::ToList, &[source])
    }

    /// Materialize into a dictionary keyed by `key`. Duplicate keys fail at
    /// execution time.
    pub fn to_dictionary<F>(&mut self, source: ExprId, key: F) -> Result<ExprId>
    where
        F: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        self.with_element_lambda(Method::ToDictionary, source, key)
    }

    pub fn to_dictionary_with<K, V>(&mut self, source: ExprId, key: K, value: V) -> Result<ExprId>
    where
        K: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
        V: FnOnce(&mut Self, ExprId) -> Result<ExprId>,
    {
        let key = self.element_lambda(source, key)?;
        let value = self.element_lambda(source, value)?;
        self.call(Method::ToDictionary, &[source, key, value])
    }

    pub fn str_contains(&mut self, s: ExprId, needle: ExprId) -> Result<ExprId> {
        self.call(Method::StringContains, &[s, needle])
    }

    pub fn starts_with(&mut self, s: ExprId, prefix: ExprId) -> Result<ExprId> {
        self.call(Method::StartsWith, &[s, prefix])
    }

    pub fn ends_with(&mut self, s: ExprId, suffix: ExprId) -> Result<ExprId> {
        self.call(Method::EndsWith, &[s, suffix])
    }

    pub fn to_upper(&mut self, s: ExprId) -> Result<ExprId> {
        self.call(Method::ToUpper, &[s])
    }

    pub fn to_lower(&mut self, s: ExprId) -> Result<ExprId> {
        self.call(Method::ToLower, &[s])
    }

    pub fn trim(&mut self, s: ExprId) -> Result<ExprId> {
        self.call(Method::Trim, &[s])
    }

    pub fn length(&mut self, s: ExprId) -> Result<ExprId> {
        self.call(Method::Length, &[s])
    }

    /// Characters of `s` starting at `start`, optionally limited to `len`.
    pub fn substring(&mut self, s: ExprId, start: ExprId, len: Option<ExprId>) -> Result<ExprId> {
        match len {
            Some(len) => self.call(Method::Substring, &[s, start, len]),
            None => self.call(Method::Substring, &[s, start]),
        }
    }

    pub fn to_string(&mut self, value: ExprId) -> Result<ExprId> {
        self.call(Method::ToString, &[value])
    }

    pub fn year(&mut self, dt: ExprId) -> Result<ExprId> {
        self.call(Method::Year, &[dt])
    }

    pub fn month(&mut self, dt: ExprId) -> Result<ExprId> {
        self.call(Method::Month, &[dt])
    }

    pub fn day(&mut self, dt: ExprId) -> Result<ExprId> {
        self.call(Method::Day, &[dt])
    }

    pub fn add_days(&mut self, dt: ExprId, days: ExprId) -> Result<ExprId> {
        self.call(Method::AddDays, &[dt, days])
    }
}

#[cfg(test)]
mod tests {
    use typereg::{EntitySchema, MemberSchema, TypeRegistryBuilder};

    use super::*;

    fn department() -> TypeDescriptor {
        TypeDescriptor::entity("Department", 1)
    }

    fn employee() -> TypeDescriptor {
        TypeDescriptor::entity("Employee", 1)
    }

    fn registry() -> Arc<TypeRegistry> {
        TypeRegistryBuilder::new()
            .register(EntitySchema::new(
                department(),
                vec![
                    MemberSchema::new("Id", TypeDescriptor::int32()),
                    MemberSchema::new("Name", TypeDescriptor::string()),
                ],
            ))
            .unwrap()
            .register(EntitySchema::new(
                employee(),
                vec![
                    MemberSchema::new("Id", TypeDescriptor::int32()),
                    MemberSchema::new("Name", TypeDescriptor::string()),
                    MemberSchema::new("Salary", TypeDescriptor::int64()),
                    MemberSchema::new("DepartmentId", TypeDescriptor::int32()),
                    MemberSchema::new("Department", department()),
                ],
            ))
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn filter_and_count() {
        let mut b = TreeBuilder::new(registry());
        let employees = b.source(employee()).unwrap();
        let rich = b
            .filter(employees, |b, e| {
                let salary = b.member(e, "Salary")?;
                let limit = b.constant(5000i64)?;
                b.gt(salary, limit)
            })
            .unwrap();
        let count = b.count(rich).unwrap();
        let tree = b.finish(count).unwrap();

        assert_eq!(&TypeDescriptor::int32(), tree.result_type());
        assert_eq!(
            "source(Employee).Where(x0 => (x0.Salary > 5000)).Count()",
            tree.to_string()
        );
    }

    #[test]
    fn group_projection_type() {
        let mut b = TreeBuilder::new(registry());
        let employees = b.source(employee()).unwrap();
        let groups = b
            .group_by_with(
                employees,
                |b, e| b.member(e, "DepartmentId"),
                |b, key, staff| {
                    let total = b.sum_by(staff, |b, e| b.member(e, "Salary"))?;
                    b.new_shape(&[("Department", key), ("Total", total)])
                },
            )
            .unwrap();
        let tree = b.finish(groups).unwrap();

        let expected = TypeDescriptor::sequence(TypeDescriptor::anonymous([
            ("Department", TypeDescriptor::int32()),
            ("Total", TypeDescriptor::int64()),
        ]));
        assert_eq!(&expected, tree.result_type());
    }

    #[test]
    fn navigation_member() {
        let mut b = TreeBuilder::new(registry());
        let employees = b.source(employee()).unwrap();
        let names = b
            .select(employees, |b, e| {
                let dept = b.member(e, "Department")?;
                b.member(dept, "Name")
            })
            .unwrap();
        let tree = b.finish(names).unwrap();
        assert_eq!(
            &TypeDescriptor::sequence(TypeDescriptor::string()),
            tree.result_type()
        );
    }

    #[test]
    fn unknown_member() {
        let mut b = TreeBuilder::new(registry());
        let employees = b.source(employee()).unwrap();
        let err = b
            .filter(employees, |b, e| {
                let bonus = b.member(e, "Bonus")?;
                let zero = b.constant(0i64)?;
                b.gt(bonus, zero)
            })
            .unwrap_err();
        assert!(matches!(err, ExprError::UnknownMember { .. }), "{err}");
    }

    #[test]
    fn predicate_must_be_bool() {
        let mut b = TreeBuilder::new(registry());
        let employees = b.source(employee()).unwrap();
        let err = b
            .filter(employees, |b, e| b.member(e, "Salary"))
            .unwrap_err();
        assert!(matches!(err, ExprError::InvalidArgument(_)), "{err}");
    }

    #[test]
    fn then_by_requires_ordering() {
        let mut b = TreeBuilder::new(registry());
        let employees = b.source(employee()).unwrap();
        let err = b
            .then_by(employees, |b, e| b.member(e, "Name"))
            .unwrap_err();
        assert!(matches!(err, ExprError::NotOrdered(_)), "{err}");

        let ordered = b.order_by(employees, |b, e| b.member(e, "Salary")).unwrap();
        b.then_by(ordered, |b, e| b.member(e, "Name")).unwrap();
    }

    #[test]
    fn aggregate_requires_sequence() {
        let mut b = TreeBuilder::new(registry());
        let one = b.constant(1i32).unwrap();
        let err = b.count(one).unwrap_err();
        assert!(matches!(err, ExprError::NotASequence(_)), "{err}");
    }

    #[test]
    fn unregistered_source() {
        let mut b = TreeBuilder::new(registry());
        let err = b
            .source(TypeDescriptor::entity("Contractor", 1))
            .unwrap_err();
        assert!(matches!(err, ExprError::Type(_)), "{err}");
    }

    #[test]
    fn join_result_type() {
        let mut b = TreeBuilder::new(registry());
        let employees = b.source(employee()).unwrap();
        let departments = b.source(department()).unwrap();
        let joined = b
            .join(
                employees,
                departments,
                |b, e| b.member(e, "DepartmentId"),
                |b, d| b.member(d, "Id"),
                |b, e, d| {
                    let name = b.member(e, "Name")?;
                    let dept = b.member(d, "Name")?;
                    b.new_shape(&[("Employee", name), ("Department", dept)])
                },
            )
            .unwrap();
        let tree = b.finish(joined).unwrap();
        tree.check_types(&registry()).unwrap();
    }

    #[test]
    fn string_concat_and_functions() {
        let mut b = TreeBuilder::new(registry());
        let employees = b.source(employee()).unwrap();
        let labels = b
            .select(employees, |b, e| {
                let name = b.member(e, "Name")?;
                let upper = b.to_upper(name)?;
                let sep = b.constant(": ")?;
                let labelled = b.add(upper, sep)?;
                let salary = b.member(e, "Salary")?;
                b.add(labelled, salary)
            })
            .unwrap();
        let tree = b.finish(labels).unwrap();
        assert_eq!(
            &TypeDescriptor::sequence(TypeDescriptor::string()),
            tree.result_type()
        );
    }
}
