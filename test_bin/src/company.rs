//! Small company data set shared by the integration tests.
//!
//! Three entities: companies, their departments and employees. Two employees
//! belong to no department.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use queryexec::MemoryDataSource;
use typereg::{
    EntitySchema, FromValue, MemberSchema, Record, Result, TypeDescriptor, TypeError, TypeRegistry,
    TypeRegistryBuilder, Value,
};

pub fn company() -> TypeDescriptor {
    TypeDescriptor::entity("Company", 1)
}

pub fn department() -> TypeDescriptor {
    TypeDescriptor::entity("Department", 1)
}

pub fn employee() -> TypeDescriptor {
    TypeDescriptor::entity("Employee", 1)
}

fn schemas() -> Vec<EntitySchema> {
    vec![
        EntitySchema::new(
            company(),
            vec![
                MemberSchema::new("Id", TypeDescriptor::int32()),
                MemberSchema::new("Name", TypeDescriptor::string()),
            ],
        ),
        EntitySchema::new(
            department(),
            vec![
                MemberSchema::new("Id", TypeDescriptor::int32()),
                MemberSchema::new("Name", TypeDescriptor::string()),
                MemberSchema::new("Foundation", TypeDescriptor::datetime()),
                MemberSchema::new("QualityLevel", TypeDescriptor::int32()),
                MemberSchema::new("CompanyId", TypeDescriptor::int32()),
            ],
        ),
        EntitySchema::new(
            employee(),
            vec![
                MemberSchema::new("Id", TypeDescriptor::int32()),
                MemberSchema::new("Name", TypeDescriptor::string()),
                MemberSchema::new("Salary", TypeDescriptor::int64()),
                MemberSchema::new("Grade", TypeDescriptor::int32()),
                MemberSchema::new("IsMale", TypeDescriptor::bool()),
                MemberSchema::new("DepartmentId", TypeDescriptor::int32()),
                MemberSchema::new("Department", department()),
            ],
        ),
    ]
}

/// Registry with the company schema.
pub fn registry() -> Result<Arc<TypeRegistry>> {
    registry_with(Vec::new())
}

/// Registry with the company schema plus `extra` entities.
pub fn registry_with(extra: Vec<EntitySchema>) -> Result<Arc<TypeRegistry>> {
    schemas()
        .into_iter()
        .chain(extra)
        .try_fold(TypeRegistryBuilder::new(), |builder, schema| builder.register(schema))?
        .build()
}

fn date(year: i32, month: u32, day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

fn record(shape: TypeDescriptor, fields: Vec<(&str, Value)>) -> Value {
    Value::Record(Record::new(
        shape,
        fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    ))
}

pub fn companies() -> Vec<Value> {
    [(1, "Northwind Foods"), (2, "Southwind Logistics")]
        .into_iter()
        .map(|(id, name)| {
            record(
                company(),
                vec![("Id", Value::Int32(id)), ("Name", Value::from(name))],
            )
        })
        .collect()
}

pub fn departments() -> Vec<Value> {
    [
        (1, "Research", date(1982, 3, 1), 8, 1),
        (2, "Production", date(1965, 6, 15), 6, 1),
        (3, "Import", date(1991, 9, 30), 5, 2),
    ]
    .into_iter()
    .map(|(id, name, foundation, quality, company_id)| {
        record(
            department(),
            vec![
                ("Id", Value::Int32(id)),
                ("Name", Value::from(name)),
                ("Foundation", Value::DateTime(foundation)),
                ("QualityLevel", Value::Int32(quality)),
                ("CompanyId", Value::Int32(company_id)),
            ],
        )
    })
    .collect()
}

pub fn employees() -> Vec<Value> {
    let departments = departments();
    let department_of = |id: Option<i32>| {
        id.and_then(|id| {
            departments
                .iter()
                .find(|d| d.field("Id") == Some(&Value::Int32(id)))
                .cloned()
        })
        .unwrap_or(Value::Null)
    };

    [
        (1, "Mara Olsen", None, 20000, 10, false),
        (2, "Tomas Brandt", None, 10000, 9, true),
        (3, "Ines Kowal", Some(1), 6000, 8, false),
        (4, "Piet Aalders", Some(1), 5000, 5, true),
        (5, "Yara Demir", Some(1), 4000, 3, false),
        (6, "Jonas Feld", Some(2), 6500, 7, true),
        (7, "Lena Moritz", Some(2), 6000, 6, false),
        (8, "Oskar Vidal", Some(2), 5500, 4, true),
        (9, "Nadia Rusu", Some(2), 3000, 2, false),
        (10, "Felix Hartung", Some(3), 12500, 9, true),
        (11, "Clara Weiss", Some(3), 9000, 6, false),
        (12, "Emil Sorensen", Some(3), 5000, 1, true),
        (13, "Rosa Lindgren", Some(3), 3500, 5, false),
    ]
    .into_iter()
    .map(|(id, name, department_id, salary, grade, is_male)| {
        record(
            employee(),
            vec![
                ("Id", Value::Int32(id)),
                ("Name", Value::from(name)),
                ("Salary", Value::Int64(salary)),
                ("Grade", Value::Int32(grade)),
                ("IsMale", Value::Bool(is_male)),
                ("DepartmentId", department_id.map(Value::Int32).unwrap_or(Value::Null)),
                ("Department", department_of(department_id)),
            ],
        )
    })
    .collect()
}

/// In memory source holding the whole data set.
pub fn data_source() -> MemoryDataSource {
    MemoryDataSource::new()
        .with_table(&company(), companies())
        .with_table(&department(), departments())
        .with_table(&employee(), employees())
}

/// Typed view of an employee record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Employee {
    pub id: i32,
    pub name: String,
    pub salary: i64,
    pub department_id: Option<i32>,
}

fn field<T: FromValue>(record: &Record, name: &str) -> Result<T> {
    let value = record
        .get(name)
        .cloned()
        .ok_or_else(|| TypeError::Decode(format!("employee record is missing {name}")))?;
    T::from_value(value)
}

impl FromValue for Employee {
    fn descriptor() -> TypeDescriptor {
        employee()
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Record(record) => Ok(Employee {
                id: field(&record, "Id")?,
                name: field(&record, "Name")?,
                salary: field(&record, "Salary")?,
                department_id: field(&record, "DepartmentId")?,
            }),
            other => Err(TypeError::Incompatible {
                kind: other.kind(),
                expected: Self::descriptor(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_builds() {
        let registry = registry().unwrap();
        assert!(registry.entity("Employee").is_some());
        assert_eq!(3, registry.entities().count());
    }

    #[test]
    fn employees_convert() {
        let employees: Vec<Employee> = employees()
            .into_iter()
            .map(Employee::from_value)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(13, employees.len());
        assert_eq!(None, employees[0].department_id);
        assert_eq!(Some(3), employees[12].department_id);
        assert_eq!(96000, employees.iter().map(|e| e.salary).sum::<i64>());
    }
}
