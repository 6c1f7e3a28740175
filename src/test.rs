#![cfg(test)]

use crate::{AppState, SUBMIT_FAILED, SUBMIT_OK, StoreStatus, router};
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header::CONTENT_TYPE},
};
use http_body_util::BodyExt;
use sheet_store::{HEADER, Record, SheetStore};
use std::{fs, path::Path};
use tower::ServiceExt;

fn app_for(path: &Path) -> Router {
    router(AppState::new(SheetStore::new(path)), None)
}

fn form(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/submit")
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_owned()))
        .expect("request")
}

fn json(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/submit")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_owned()))
        .expect("request")
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, String) {
    let resp = app.clone().oneshot(req).await.expect("router is infallible");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (status, String::from_utf8(body.to_vec()).expect("utf-8 body"))
}

fn ana() -> Record {
    Record {
        name: "Ana".into(),
        surname: "Ivic".into(),
        title: "Dr".into(),
        organization: "ACME".into(),
        city: "Sarajevo".into(),
        country: "BiH".into(),
        phone: "+387 61 123 456".into(),
    }
}

#[tokio::test]
async fn form_submission_creates_the_workbook() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("boomExcel.xlsx");
    let app = app_for(&path);

    let (status, body) = send(
        &app,
        form("name=Ana&surname=Ivic&title=Dr&organization=ACME&city=Sarajevo&country=BiH&phone=%2B387+61+123+456"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, SUBMIT_OK);

    let rows = SheetStore::new(&path).rows().expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], HEADER);
    assert_eq!(SheetStore::new(&path).records().expect("records"), vec![ana()]);
}

#[tokio::test]
async fn json_submission_is_accepted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("boomExcel.xlsx");
    let app = app_for(&path);

    let (status, body) = send(
        &app,
        json(r#"{"name":"Ana","surname":"Ivic","title":"Dr","organization":"ACME","city":"Sarajevo","country":"BiH","phone":"+387 61 123 456","newsletter":true}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, SUBMIT_OK);
    assert_eq!(SheetStore::new(&path).records().expect("records"), vec![ana()]);
}

#[tokio::test]
async fn json_numbers_and_nulls_are_stored_as_text() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("boomExcel.xlsx");
    let app = app_for(&path);

    let (status, body) = send(
        &app,
        json(r#"{"name":"Ana","title":null,"city":false,"country":1.5,"phone":38761000111}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, SUBMIT_OK);

    let (status, _) = send(&app, json(r#"{"name":"Edin","phone":-7}"#)).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        SheetStore::new(&path).records().expect("records"),
        vec![
            Record {
                name: "Ana".into(),
                city: "false".into(),
                country: "1.5".into(),
                phone: "38761000111".into(),
                ..Record::default()
            },
            Record {
                name: "Edin".into(),
                phone: "-7".into(),
                ..Record::default()
            },
        ]
    );
}

#[tokio::test]
async fn json_objects_are_not_field_values() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("boomExcel.xlsx");
    let app = app_for(&path);

    let (status, body) = send(&app, json(r#"{"name":{"first":"Ana"}}"#)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, SUBMIT_FAILED);
    assert!(!path.exists());
}

#[tokio::test]
async fn missing_and_empty_fields_are_stored_blank() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("boomExcel.xlsx");
    let app = app_for(&path);

    let (status, _) = send(&app, form("name=Ana&title=&city=Mostar")).await;
    assert_eq!(status, StatusCode::OK);

    let records = SheetStore::new(&path).records().expect("records");
    assert_eq!(
        records,
        vec![Record {
            name: "Ana".into(),
            city: "Mostar".into(),
            ..Record::default()
        }]
    );
}

#[tokio::test]
async fn sequential_submissions_keep_their_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("boomExcel.xlsx");
    let app = app_for(&path);

    for name in ["Ana", "Edin", "Lejla", "Mirza"] {
        let (status, _) = send(&app, form(&format!("name={name}&country=BiH"))).await;
        assert_eq!(status, StatusCode::OK);
    }

    let names: Vec<String> = SheetStore::new(&path)
        .records()
        .expect("records")
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, ["Ana", "Edin", "Lejla", "Mirza"]);
}

#[tokio::test]
async fn concurrent_submissions_are_not_lost() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("boomExcel.xlsx");
    let app = app_for(&path);

    let requests = (0..10).map(|i| {
        let app = app.clone();
        async move { send(&app, form(&format!("name=p{i}"))).await }
    });
    for (status, _) in futures_join_all(requests).await {
        assert_eq!(status, StatusCode::OK);
    }

    assert_eq!(SheetStore::new(&path).records().expect("records").len(), 10);
}

// tokio::spawn per request, collected in order
async fn futures_join_all<F>(futs: impl IntoIterator<Item = F>) -> Vec<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    let handles: Vec<_> = futs.into_iter().map(tokio::spawn).collect();
    let mut out = Vec::with_capacity(handles.len());
    for h in handles {
        out.push(h.await.expect("request task"));
    }
    out
}

#[tokio::test]
async fn malformed_payload_gets_the_generic_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("boomExcel.xlsx");
    let app = app_for(&path);

    let (status, body) = send(&app, json("{\"name\": ")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, SUBMIT_FAILED);
    assert!(!path.exists());
}

#[tokio::test]
async fn unwritable_store_gets_the_generic_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("missing").join("boomExcel.xlsx");
    let app = app_for(&path);

    let (status, body) = send(&app, form("name=Ana")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, SUBMIT_FAILED);
    assert!(!path.exists());
}

#[tokio::test]
async fn corrupt_store_is_reported_not_replaced() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("boomExcel.xlsx");
    fs::write(&path, b"PK\x03\x04 garbage").expect("write");
    let app = app_for(&path);

    let (status, body) = send(&app, form("name=Ana")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, SUBMIT_FAILED);
    assert_eq!(fs::read(&path).expect("read"), b"PK\x03\x04 garbage");
}

#[tokio::test]
async fn healthz_answers_ok() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = app_for(&dir.path().join("boomExcel.xlsx"));

    let req = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .expect("request");
    assert_eq!(send(&app, req).await, (StatusCode::OK, "ok".to_owned()));
}

#[tokio::test]
async fn landing_page_is_served_from_static_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let site = dir.path().join("site");
    fs::create_dir(&site).expect("mkdir");
    fs::write(site.join("index.html"), "<h1>BOOM</h1>").expect("write");

    let app = router(
        AppState::new(SheetStore::new(dir.path().join("boomExcel.xlsx"))),
        Some(&site),
    );
    let req = Request::builder()
        .uri("/index.html")
        .body(Body::empty())
        .expect("request");
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "<h1>BOOM</h1>");

    let (status, _) = send(&app, form("name=Ana")).await;
    assert_eq!(status, StatusCode::OK);
}

#[test]
fn store_status_before_first_submission() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("boomExcel.xlsx");

    assert!(matches!(
        StoreStatus::check(&SheetStore::new(&path)),
        StoreStatus::Absent
    ));

    SheetStore::new(&path)
        .with_sheet_name("Speakers")
        .append(&ana())
        .expect("append");
    let store = SheetStore::new(&path);
    assert!(matches!(StoreStatus::check(&store), StoreStatus::SheetMissing));

    store.append(&ana()).expect("append");
    store.append(&ana()).expect("append");
    assert!(matches!(
        StoreStatus::check(&store),
        StoreStatus::Ready { records: 2 }
    ));

    fs::write(&path, b"not a workbook").expect("write");
    assert!(matches!(
        StoreStatus::check(&store),
        StoreStatus::Unusable(sheet_store::StoreError::Corrupt { .. })
    ));
}
