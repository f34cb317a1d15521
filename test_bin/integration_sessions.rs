//! Every request opens exactly one session on the data source and closes it
//! exactly once, however the request ends.

use exprproto::ErrorCode;
use exprtree::ExprTree;
use futures::StreamExt;
use queryclient::{ClientError, QueryOutput};
use test_bin::CompanyHarness;
use test_bin::company::{self, employee};
use typereg::{Record, Value};

fn all_employees(h: &CompanyHarness) -> ExprTree {
    let mut b = h.tree();
    let employees = b.source(employee()).unwrap();
    b.finish(employees).unwrap()
}

fn many_employees(n: i32) -> Vec<Value> {
    (1..=n)
        .map(|id| {
            Value::Record(Record::new(
                employee(),
                vec![
                    ("Id".to_string(), Value::Int32(id)),
                    ("Name".to_string(), Value::from(format!("Employee {id}"))),
                    ("Salary".to_string(), Value::Int64(1000)),
                    ("Grade".to_string(), Value::Int32(1)),
                    ("IsMale".to_string(), Value::Bool(id % 2 == 0)),
                    ("DepartmentId".to_string(), Value::Null),
                    ("Department".to_string(), Value::Null),
                ],
            ))
        })
        .collect()
}

#[tokio::test]
async fn successful_stream() {
    logutil::init_test();
    let h = CompanyHarness::new().unwrap();

    let rows = h
        .provider
        .execute_sequence(&all_employees(&h))
        .await
        .unwrap()
        .collect_values()
        .await
        .unwrap();
    assert_eq!(13, rows.len());

    let outcomes = h.outcomes().await;
    assert_eq!(1, outcomes.len());
    assert!(outcomes[0].is_success());
    assert_eq!(13, outcomes[0].elements);
    assert_eq!(1, h.counters.started());
    assert_eq!(1, h.counters.closed());
}

#[tokio::test]
async fn sequential_requests_reuse_source() {
    logutil::init_test();
    let h = CompanyHarness::new().unwrap();
    let tree = all_employees(&h);

    for _ in 0..3 {
        let stream = h.provider.execute_sequence(&tree).await.unwrap();
        assert_eq!(13, stream.collect_values().await.unwrap().len());
    }
    h.settle().await;

    assert_eq!(3, h.counters.started());
    assert_eq!(3, h.counters.closed());
    assert_eq!(0, h.counters.recovered());
}

#[tokio::test]
async fn failure_before_first_element() {
    logutil::init_test();
    let h = CompanyHarness::builder()
        .with_source(company::data_source().with_start_failure("pool exhausted"))
        .build()
        .unwrap();

    let err = h.provider.execute(&all_employees(&h)).await.unwrap_err();
    match err {
        ClientError::RemoteExecution { code, message } => {
            assert_eq!(ErrorCode::SourceExecution, code);
            assert!(message.contains("pool exhausted"), "{message}");
        }
        other => panic!("expected remote execution error, got {other:?}"),
    }

    h.settle().await;
    assert_eq!(1, h.counters.failed_starts());
    assert_eq!(1, h.counters.closed());
}

#[tokio::test]
async fn failure_mid_stream() {
    logutil::init_test();
    let h = CompanyHarness::builder()
        .with_source(company::data_source().with_failure(&employee(), 4, "disk gone"))
        .build()
        .unwrap();

    let mut stream = h.provider.execute_sequence(&all_employees(&h)).await.unwrap();
    let mut received = 0;
    let mut failure = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(_) => received += 1,
            Err(e) => failure = Some(e),
        }
    }

    // The prefix arrives, but the stream as a whole is a failure.
    assert_eq!(4, received);
    assert_eq!(Some(ErrorCode::SourceExecution), failure.and_then(|e| e.remote_code()));
    assert!(stream.is_released());

    let outcomes = h.outcomes().await;
    assert_eq!(4, outcomes[0].elements);
    assert_eq!(1, h.counters.started());
    assert_eq!(1, h.counters.closed());
}

#[tokio::test]
async fn scalar_failure() {
    logutil::init_test();
    let h = CompanyHarness::new().unwrap();

    let mut b = h.tree();
    let employees = b.source(employee()).unwrap();
    let single = b.single(employees).unwrap();
    let tree = b.finish(single).unwrap();

    let err = h.provider.execute(&tree).await.unwrap_err();
    assert_eq!(Some(ErrorCode::SourceExecution), err.remote_code());

    h.settle().await;
    assert_eq!(1, h.counters.started());
    assert_eq!(1, h.counters.closed());
}

#[tokio::test]
async fn client_abandons_stream() {
    logutil::init_test();
    let h = CompanyHarness::builder()
        .with_source(company::data_source().with_table(&employee(), many_employees(2000)))
        .with_pipe_size(64)
        .build()
        .unwrap();

    let mut stream = h.provider.execute_sequence(&all_employees(&h)).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(Some(&Value::Int32(1)), first.field("Id"));
    assert!(!stream.is_released());
    drop(stream);

    let outcomes = h.outcomes().await;
    assert_eq!(1, outcomes.len());
    assert!(!outcomes[0].is_success());
    assert!(outcomes[0].elements < 2000);
    assert_eq!(1, h.counters.closed());
    assert!(h.counters.rows_produced() < 2000);
}

#[tokio::test]
async fn next_query_after_dropped_stream() {
    logutil::init_test();
    let h = CompanyHarness::builder()
        .with_source(company::data_source().with_table(&employee(), many_employees(2000)))
        .with_pipe_size(64)
        .build()
        .unwrap();
    let tree = all_employees(&h);

    let mut stream = h.provider.execute_sequence(&tree).await.unwrap();
    assert!(stream.next().await.is_some());
    drop(stream);

    let next = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        h.provider.execute_sequence(&tree),
    )
    .await
    .expect("second query waited on the first");
    assert_eq!(2000, next.unwrap().collect_values().await.unwrap().len());

    h.settle().await;
    assert_eq!(2, h.counters.started());
    assert_eq!(2, h.counters.closed());
}

#[tokio::test]
async fn spawned_query() {
    logutil::init_test();
    let h = CompanyHarness::new().unwrap();

    let task = h.provider.spawn_execute(&all_employees(&h)).unwrap();
    match task.join().await.unwrap() {
        QueryOutput::Sequence(rows) => assert_eq!(13, rows.len()),
        other => panic!("expected a sequence, got {other:?}"),
    }

    h.settle().await;
    assert_eq!(1, h.counters.closed());
}

#[tokio::test]
async fn cancelled_query_closes_session() {
    logutil::init_test();
    let h = CompanyHarness::builder()
        .with_source(company::data_source().with_table(&employee(), many_employees(2000)))
        .with_pipe_size(64)
        .build()
        .unwrap();

    let task = h.provider.spawn_execute(&all_employees(&h)).unwrap();
    task.cancel();
    assert!(matches!(task.join().await, Err(ClientError::Cancelled)));

    h.settle().await;
    assert_eq!(h.counters.started(), h.counters.closed());
}
