use std::collections::BTreeMap;

use futures::TryStreamExt;
use queryclient::{QueryResult, RemoteQueryProvider, TcpConnector};
use rstest::rstest;
use test_bin::company::{self, Employee};
use test_bin::{CompanyHarness, serve_tcp};
use typereg::{FromValue, TypeDescriptor, Value};

fn harness() -> CompanyHarness {
    logutil::init_test();
    CompanyHarness::new().unwrap()
}

#[tokio::test]
async fn salary_sums_per_department() {
    let h = harness();

    let mut b = h.tree();
    let employees = b.source(company::employee()).unwrap();
    let grouped = b
        .group_by_with(
            employees,
            |b, e| b.member(e, "DepartmentId"),
            |b, key, members| {
                let total = b.sum_by(members, |b, e| b.member(e, "Salary"))?;
                b.new_shape(&[("Department", key), ("Total", total)])
            },
        )
        .unwrap();
    let tree = b.finish(grouped).unwrap();

    let groups = h
        .provider
        .execute_sequence(&tree)
        .await
        .unwrap()
        .collect_values()
        .await
        .unwrap();
    assert_eq!(4, groups.len());

    let remote: BTreeMap<Option<i32>, i64> = groups
        .iter()
        .map(|g| {
            let key = Option::<i32>::from_value(g.field("Department").cloned().unwrap()).unwrap();
            let total = g.field("Total").and_then(Value::as_i64).unwrap();
            (key, total)
        })
        .collect();

    let mut local = BTreeMap::new();
    for employee in company::employees() {
        let employee = Employee::from_value(employee).unwrap();
        *local.entry(employee.department_id).or_insert(0) += employee.salary;
    }

    assert_eq!(local, remote);
    assert_eq!(Some(&30000), remote.get(&None));
    assert_eq!(Some(&15000), remote.get(&Some(1)));
    assert_eq!(Some(&21000), remote.get(&Some(2)));
    assert_eq!(Some(&30000), remote.get(&Some(3)));
    assert_eq!(96000, remote.values().sum::<i64>());
}

#[tokio::test]
async fn groups_arrive_in_first_appearance_order() {
    let h = harness();

    let mut b = h.tree();
    let employees = b.source(company::employee()).unwrap();
    let grouped = b.group_by(employees, |b, e| b.member(e, "DepartmentId")).unwrap();
    let keys = b.select(grouped, |b, g| b.member(g, "Key")).unwrap();
    let tree = b.finish(keys).unwrap();

    let keys: Vec<Option<i32>> = h
        .provider
        .execute_sequence(&tree)
        .await
        .unwrap()
        .collect_as()
        .await
        .unwrap();
    assert_eq!(vec![None, Some(1), Some(2), Some(3)], keys);
}

#[tokio::test]
async fn total_salary() {
    let h = harness();

    let mut b = h.tree();
    let employees = b.source(company::employee()).unwrap();
    let total = b.sum_by(employees, |b, e| b.member(e, "Salary")).unwrap();
    let tree = b.finish(total).unwrap();

    let total: i64 = h.provider.execute_scalar(&tree).await.unwrap();
    assert_eq!(96000, total);
}

#[rstest]
#[case::women(false, 7)]
#[case::men(true, 6)]
#[tokio::test]
async fn count_by_sex(#[case] is_male: bool, #[case] expected: i32) {
    let h = harness();

    let mut b = h.tree();
    let employees = b.source(company::employee()).unwrap();
    let count = b
        .count_where(employees, |b, e| {
            let sex = b.member(e, "IsMale")?;
            let wanted = b.constant(is_male)?;
            b.eq(sex, wanted)
        })
        .unwrap();
    let tree = b.finish(count).unwrap();

    let count: i32 = h.provider.execute_scalar(&tree).await.unwrap();
    assert_eq!(expected, count);
}

#[tokio::test]
async fn order_then_skip() {
    let h = harness();

    let mut b = h.tree();
    let employees = b.source(company::employee()).unwrap();
    let ordered = b.order_by(employees, |b, e| b.member(e, "Id")).unwrap();
    let rest = b.skip(ordered, 10).unwrap();
    let tree = b.finish(rest).unwrap();

    let rest: Vec<Employee> = h
        .provider
        .execute_sequence(&tree)
        .await
        .unwrap()
        .collect_as()
        .await
        .unwrap();
    let ids: Vec<i32> = rest.iter().map(|e| e.id).collect();
    assert_eq!(vec![11, 12, 13], ids);
    assert_eq!("Rosa Lindgren", rest[2].name);
}

#[tokio::test]
async fn top_earners() {
    let h = harness();

    let mut b = h.tree();
    let employees = b.source(company::employee()).unwrap();
    let ordered = b
        .order_by_descending(employees, |b, e| b.member(e, "Salary"))
        .unwrap();
    let top = b.take(ordered, 3).unwrap();
    let names = b.select(top, |b, e| b.member(e, "Name")).unwrap();
    let tree = b.finish(names).unwrap();

    let names: Vec<String> = h
        .provider
        .execute_sequence(&tree)
        .await
        .unwrap()
        .collect_as()
        .await
        .unwrap();
    assert_eq!(vec!["Mara Olsen", "Felix Hartung", "Tomas Brandt"], names);
}

#[tokio::test]
async fn order_then_by() {
    let h = harness();

    // Salaries 5000 and 6000 each appear twice, grade breaks the tie.
    let mut b = h.tree();
    let employees = b.source(company::employee()).unwrap();
    let ordered = b.order_by(employees, |b, e| b.member(e, "Salary")).unwrap();
    let ordered = b
        .then_by_descending(ordered, |b, e| b.member(e, "Grade"))
        .unwrap();
    let ids = b.select(ordered, |b, e| b.member(e, "Id")).unwrap();
    let tree = b.finish(ids).unwrap();

    let ids: Vec<i32> = h
        .provider
        .execute_sequence(&tree)
        .await
        .unwrap()
        .collect_as()
        .await
        .unwrap();
    assert_eq!(vec![9, 13, 5, 4, 12, 8, 3, 7, 6, 11, 2, 10, 1], ids);
}

#[tokio::test]
async fn nested_member_filter() {
    let h = harness();

    let mut b = h.tree();
    let employees = b.source(company::employee()).unwrap();
    let good = b
        .filter(employees, |b, e| {
            let department = b.member(e, "Department")?;
            let level = b.member(department, "QualityLevel")?;
            let min = b.constant(6i32)?;
            b.ge(level, min)
        })
        .unwrap();
    let ids = b.select(good, |b, e| b.member(e, "Id")).unwrap();
    let tree = b.finish(ids).unwrap();

    let ids: Vec<i32> = h
        .provider
        .execute_sequence(&tree)
        .await
        .unwrap()
        .collect_as()
        .await
        .unwrap();
    assert_eq!(vec![3, 4, 5, 6, 7, 8, 9], ids);
}

#[tokio::test]
async fn join_with_departments() {
    let h = harness();

    let mut b = h.tree();
    let employees = b.source(company::employee()).unwrap();
    let departments = b.source(company::department()).unwrap();
    let joined = b
        .join(
            employees,
            departments,
            |b, e| b.member(e, "DepartmentId"),
            |b, d| b.member(d, "Id"),
            |b, e, d| {
                let name = b.member(e, "Name")?;
                let department = b.member(d, "Name")?;
                b.new_shape(&[("Employee", name), ("Department", department)])
            },
        )
        .unwrap();
    let tree = b.finish(joined).unwrap();

    let rows = h
        .provider
        .execute_sequence(&tree)
        .await
        .unwrap()
        .collect_values()
        .await
        .unwrap();
    // Employees without a department never match.
    assert_eq!(11, rows.len());
    assert_eq!(Some(&Value::from("Ines Kowal")), rows[0].field("Employee"));
    assert_eq!(Some(&Value::from("Research")), rows[0].field("Department"));
    assert_eq!(Some(&Value::from("Import")), rows[10].field("Department"));
}

#[tokio::test]
async fn departments_founded_before() {
    let h = harness();

    let mut b = h.tree();
    let departments = b.source(company::department()).unwrap();
    let old = b
        .filter(departments, |b, d| {
            let founded = b.member(d, "Foundation")?;
            let year = b.year(founded)?;
            let cutoff = b.constant(1985i32)?;
            b.lt(year, cutoff)
        })
        .unwrap();
    let names = b.select(old, |b, d| b.member(d, "Name")).unwrap();
    let tree = b.finish(names).unwrap();

    let names: Vec<String> = h
        .provider
        .execute_sequence(&tree)
        .await
        .unwrap()
        .collect_as()
        .await
        .unwrap();
    assert_eq!(vec!["Research", "Production"], names);
}

#[tokio::test]
async fn declared_type_is_sent_as_is() {
    let h = harness();

    let mut b = h.tree();
    let companies = b.source(company::company()).unwrap();
    let tree = b.finish(companies).unwrap();

    let result = h
        .provider
        .execute_with_type(&tree, TypeDescriptor::sequence(company::company()))
        .await
        .unwrap();
    let names: Vec<Option<String>> = match result {
        QueryResult::Stream(stream) => stream
            .map_ok(|c| c.field("Name").and_then(Value::as_str).map(str::to_string))
            .try_collect()
            .await
            .unwrap(),
        QueryResult::Scalar(value) => panic!("expected a stream, got {value:?}"),
    };
    assert_eq!(
        vec![
            Some("Northwind Foods".to_string()),
            Some("Southwind Logistics".to_string())
        ],
        names
    );
}

#[tokio::test]
async fn over_tcp() {
    logutil::init_test();
    let registry = company::registry().unwrap();
    let handler = querysrv::RemoteQueryHandler::new(company::data_source(), registry.clone());
    let addr = serve_tcp(handler).await.unwrap();

    let provider = RemoteQueryProvider::new(
        std::sync::Arc::new(TcpConnector::new(addr.to_string())),
        registry.clone(),
    );

    let mut b = exprtree::TreeBuilder::new(registry);
    let employees = b.source(company::employee()).unwrap();
    let count = b.count(employees).unwrap();
    let tree = b.finish(count).unwrap();

    // One connection per query, so asking twice works.
    for _ in 0..2 {
        let count: i32 = provider.execute_scalar(&tree).await.unwrap();
        assert_eq!(13, count);
    }
}
