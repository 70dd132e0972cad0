use std::path::PathBuf;
use std::sync::Arc;

use congreso_adapters::{
    CamaraClient, Coverage, FetchContext, FixtureTransport, SourceClient, SourceError,
};
use congreso_core::Chamber;
use tempfile::{tempdir, TempDir};
use uuid::Uuid;

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn client() -> CamaraClient {
    CamaraClient::new(Arc::new(FixtureTransport::new(fixtures_root())))
}

fn ctx() -> FetchContext {
    FetchContext::new(Uuid::new_v4())
}

#[tokio::test]
async fn deputies_come_back_raw_and_unprefixed() {
    let deputies = client().fetch_parliamentarians(&ctx()).await.unwrap();
    assert_eq!(deputies.len(), 6);

    let first = &deputies[0];
    assert_eq!(first.id.as_deref(), Some("1096"));
    assert_eq!(first.given_names.as_deref(), Some("Gonzalo"));
    assert_eq!(first.paternal_surname.as_deref(), Some("Ibáñez"));
    assert_eq!(first.party.as_deref(), Some("Independiente"));
    assert_eq!(first.region.as_deref(), Some("Valparaíso"));

    // The incomplete record is passed through; skipping is not the client's call.
    assert_eq!(deputies[5].id, None);
}

#[tokio::test]
async fn bills_merge_motions_and_messages() {
    let bills = client().fetch_bills(&ctx(), 2024).await.unwrap();
    let boletines: Vec<_> = bills.iter().map(|b| b.boletin.clone()).collect();
    assert_eq!(
        boletines,
        vec![
            Some("17203-15".to_string()),
            Some("16987-07".to_string()),
            None,
            Some("16950-05".to_string()),
            Some("16960-13".to_string()),
        ]
    );
    assert_eq!(bills[3].initiative.as_deref(), Some("Mensaje"));
    // Record without TipoIniciativa inherits it from the listing operation.
    assert_eq!(bills[4].initiative.as_deref(), Some("Mensaje"));
}

#[tokio::test]
async fn year_outside_coverage_is_empty_not_an_error() {
    let client = client().with_coverage(Coverage { from: 2010, to: Some(2024) });
    assert!(client.fetch_bills(&ctx(), 1999).await.unwrap().is_empty());
    assert!(client.fetch_vote_sessions(&ctx(), 2031).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_year_document_is_unavailable() {
    let err = client().fetch_bills(&ctx(), 2023).await.unwrap_err();
    assert!(matches!(
        err,
        SourceError::UpstreamUnavailable { upstream: Chamber::Camara, .. }
    ));
}

#[tokio::test]
async fn vote_sessions_and_roll_call() {
    let client = client();
    let sessions = client.fetch_vote_sessions(&ctx(), 2024).await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].session_id.as_deref(), Some("41234"));
    assert_eq!(sessions[0].boletin.as_deref(), Some("17203-15"));
    assert_eq!(sessions[1].boletin, None);

    let entries = client.fetch_roll_call(&ctx(), "41234").await.unwrap();
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[0].session_id, "41234");
    assert_eq!(entries[0].parliamentarian_ref.as_deref(), Some("1096"));
    assert_eq!(entries[0].parliamentarian_name.as_deref(), Some("Gonzalo Ibáñez"));
    assert_eq!(entries[2].option.as_deref(), Some("Abstención"));
}

#[tokio::test]
async fn non_xml_body_is_a_parse_error() {
    let dir = tempdir_with(
        "camara/retornarDiputadosPeriodoActual.xml",
        "<html><body>502 Bad Gateway</body>",
    );
    let client = CamaraClient::new(Arc::new(FixtureTransport::new(dir.path())));
    let err = client.fetch_parliamentarians(&ctx()).await.unwrap_err();
    match err {
        SourceError::UpstreamParseError { upstream, snippet, .. } => {
            assert_eq!(upstream, Chamber::Camara);
            assert!(snippet.contains("502 Bad Gateway"));
        }
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[tokio::test]
async fn soap_fault_is_unavailable() {
    let dir = tempdir_with(
        "camara/retornarDiputadosPeriodoActual.xml",
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>
           <soap:Fault><faultcode>soap:Server</faultcode><faultstring>Timeout de base de datos</faultstring></soap:Fault>
           </soap:Body></soap:Envelope>"#,
    );
    let client = CamaraClient::new(Arc::new(FixtureTransport::new(dir.path())));
    let err = client.fetch_parliamentarians(&ctx()).await.unwrap_err();
    assert!(matches!(err, SourceError::UpstreamUnavailable { .. }));
    assert!(err.to_string().contains("Timeout de base de datos"));
}

fn tempdir_with(relative: &str, contents: &str) -> TempDir {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
    dir
}
