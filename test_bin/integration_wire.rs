use exprproto::{ErrorCode, ProtoError};
use queryclient::{ClientError, ProviderConfig, RemoteQueryProvider};
use test_bin::company::{self, department, employee};
use test_bin::{CompanyHarness, Shout};
use typereg::{EntitySchema, MemberSchema, TypeDescriptor, Value};

fn contractor() -> TypeDescriptor {
    TypeDescriptor::entity("Contractor", 1)
}

#[tokio::test]
async fn entity_unknown_to_server() {
    logutil::init_test();
    let client_registry = company::registry_with(vec![EntitySchema::new(
        contractor(),
        vec![MemberSchema::new("Id", TypeDescriptor::int32())],
    )])
    .unwrap();
    let h = CompanyHarness::builder()
        .with_client_registry(client_registry)
        .build()
        .unwrap();

    let mut b = h.tree();
    let contractors = b.source(contractor()).unwrap();
    let tree = b.finish(contractors).unwrap();

    // Never an empty success.
    let err = h.provider.execute(&tree).await.unwrap_err();
    assert_eq!(Some(ErrorCode::UnresolvedType), err.remote_code());

    let outcomes = h.outcomes().await;
    assert_eq!(Some(ErrorCode::UnresolvedType), outcomes[0].fault.as_ref().map(|f| f.code));
    assert_eq!(0, h.counters.started());
}

#[tokio::test]
async fn unregistered_extension_never_leaves_client() {
    logutil::init_test();
    let h = CompanyHarness::new().unwrap();

    let mut b = h.tree();
    let employees = b.source(employee()).unwrap();
    let shouted = b
        .select(employees, |b, e| {
            let name = b.member(e, "Name")?;
            b.extension(Shout::NAME, &[name], TypeDescriptor::string())
        })
        .unwrap();
    let tree = b.finish(shouted).unwrap();

    let err = h.provider.execute(&tree).await.unwrap_err();
    assert!(
        matches!(err, ClientError::Proto(ProtoError::UnsupportedOperation(_))),
        "{err:?}"
    );
    assert!(h.outcomes().await.is_empty());
    assert_eq!(0, h.counters.started());
}

#[tokio::test]
async fn registered_extension() {
    logutil::init_test();
    let h = CompanyHarness::builder()
        .with_client_extensions()
        .build()
        .unwrap();

    let mut b = h.tree();
    let employees = b.source(employee()).unwrap();
    let first = b.take(employees, 2).unwrap();
    let shouted = b
        .select(first, |b, e| {
            let name = b.member(e, "Name")?;
            b.extension(Shout::NAME, &[name], TypeDescriptor::string())
        })
        .unwrap();
    let tree = b.finish(shouted).unwrap();

    let names: Vec<String> = h
        .provider
        .execute_sequence(&tree)
        .await
        .unwrap()
        .collect_as()
        .await
        .unwrap();
    assert_eq!(vec!["MARA OLSEN!", "TOMAS BRANDT!"], names);
}

#[tokio::test]
async fn declared_type_must_match_tree() {
    logutil::init_test();
    let h = CompanyHarness::new().unwrap();

    let mut b = h.tree();
    let employees = b.source(employee()).unwrap();
    let tree = b.finish(employees).unwrap();

    let err = h
        .provider
        .execute_with_type(&tree, TypeDescriptor::sequence(department()))
        .await
        .unwrap_err();
    assert_eq!(Some(ErrorCode::Protocol), err.remote_code());
    assert_eq!(0, h.counters.started());
}

#[tokio::test]
async fn projections_and_dates_round_trip() {
    logutil::init_test();
    let h = CompanyHarness::new().unwrap();

    let mut b = h.tree();
    let departments = b.source(department()).unwrap();
    let projected = b
        .select(departments, |b, d| {
            let name = b.member(d, "Name")?;
            let founded = b.member(d, "Foundation")?;
            let year = b.year(founded)?;
            b.new_shape(&[("Name", name), ("Founded", founded), ("Year", year)])
        })
        .unwrap();
    let tree = b.finish(projected).unwrap();

    let rows = h
        .provider
        .execute_sequence(&tree)
        .await
        .unwrap()
        .collect_values()
        .await
        .unwrap();
    assert_eq!(3, rows.len());
    assert_eq!(Some(&Value::from("Production")), rows[1].field("Name"));
    assert_eq!(rows[1].field("Founded"), company::departments()[1].field("Foundation"));
    assert_eq!(Some(&Value::Int32(1965)), rows[1].field("Year"));
}

#[tokio::test]
async fn frame_limit_enforced() {
    logutil::init_test();
    let h = CompanyHarness::new().unwrap();

    let provider = RemoteQueryProvider::new(h.connector.clone(), h.client_registry.clone())
        .with_config(ProviderConfig::builder().with_max_frame_size(16).build());

    let mut b = h.tree();
    let employees = b.source(employee()).unwrap();
    let tree = b.finish(employees).unwrap();

    let err = provider.execute(&tree).await.unwrap_err();
    assert!(
        matches!(err, ClientError::Proto(ProtoError::FrameTooLarge { .. })),
        "{err:?}"
    );
}
