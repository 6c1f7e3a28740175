//! boom-register: backend of the conference registration form.
//!
//! One endpoint, `POST /submit`, takes the form fields (urlencoded or JSON)
//! and appends them as a row to the workbook managed by [`sheet_store`].
//! Whatever goes wrong, the caller only ever sees a generic error; the
//! details go to the log.

pub mod config;
mod test;

use std::{fmt, path::Path, sync::Arc};

use axum::{
    Form, Json, Router,
    extract::{FromRequest, Request, State},
    http::{StatusCode, header::CONTENT_TYPE},
    routing::{get, post},
};
use serde::{
    Deserialize, Deserializer,
    de::{self, Visitor},
};
use sheet_store::{Record, SheetStore, StoreError};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info};

pub use config::Config;

pub const SUBMIT_OK: &str = "✅ Data submitted successfully!";
pub const SUBMIT_FAILED: &str = "❌ Error saving data.";

#[derive(Clone)]
pub struct AppState {
    store: Arc<SheetStore>,
}

impl AppState {
    pub fn new(store: SheetStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn store(&self) -> &SheetStore {
        &self.store
    }
}

/// Form fields as posted by the page. Anything not sent stays empty,
/// anything unknown is ignored. JSON numbers and booleans are kept as their
/// text, `null` counts as not sent.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Submission {
    #[serde(deserialize_with = "loose_text")]
    pub name: String,
    #[serde(deserialize_with = "loose_text")]
    pub surname: String,
    #[serde(deserialize_with = "loose_text")]
    pub title: String,
    #[serde(deserialize_with = "loose_text")]
    pub organization: String,
    #[serde(deserialize_with = "loose_text")]
    pub city: String,
    #[serde(deserialize_with = "loose_text")]
    pub country: String,
    #[serde(deserialize_with = "loose_text")]
    pub phone: String,
}

fn loose_text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    struct TextVisitor;

    impl<'de> Visitor<'de> for TextVisitor {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a string, number, boolean or null")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
            Ok(v.to_owned())
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<String, E> {
            Ok(v)
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_unit<E: de::Error>(self) -> Result<String, E> {
            Ok(String::new())
        }

        fn visit_none<E: de::Error>(self) -> Result<String, E> {
            Ok(String::new())
        }

        fn visit_some<D2: Deserializer<'de>>(self, d: D2) -> Result<String, D2::Error> {
            d.deserialize_any(self)
        }
    }

    d.deserialize_any(TextVisitor)
}

impl From<Submission> for Record {
    fn from(s: Submission) -> Self {
        Record {
            name: s.name,
            surname: s.surname,
            title: s.title,
            organization: s.organization,
            city: s.city,
            country: s.country,
            phone: s.phone,
        }
    }
}

/// What the store file looks like before the first submission arrives.
#[derive(Debug)]
pub enum StoreStatus {
    /// Sheet present with this many records after the header.
    Ready { records: usize },
    /// No file yet; the first submission creates it.
    Absent,
    /// File present without the sheet; the first submission adds it.
    SheetMissing,
    /// Submissions will fail until the file is fixed or moved away.
    Unusable(StoreError),
}

impl StoreStatus {
    pub fn check(store: &SheetStore) -> Self {
        match store.rows() {
            Ok(rows) if rows.is_empty() && !store.path().exists() => StoreStatus::Absent,
            Ok(rows) => StoreStatus::Ready {
                records: rows.len().saturating_sub(1),
            },
            Err(StoreError::MissingSheet(_)) => StoreStatus::SheetMissing,
            Err(err) => StoreStatus::Unusable(err),
        }
    }
}

pub fn router(state: AppState, static_dir: Option<&Path>) -> Router {
    let mut app = Router::new()
        .route("/submit", post(submit))
        .route("/healthz", get(healthz))
        .with_state(state);
    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }
    app.layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn submit(State(state): State<AppState>, req: Request) -> (StatusCode, &'static str) {
    let submission = match decode_submission(req).await {
        Ok(submission) => submission,
        Err(reason) => {
            error!(%reason, "could not decode submission");
            return failure();
        }
    };

    let record = Record::from(submission);
    let store = Arc::clone(&state.store);
    match tokio::task::spawn_blocking(move || store.append(&record)).await {
        Ok(Ok(row)) => {
            info!(row, "registration saved");
            (StatusCode::OK, SUBMIT_OK)
        }
        Ok(Err(err)) => {
            error!(error = %err, "failed to save registration");
            failure()
        }
        Err(err) => {
            error!(error = %err, "store task did not finish");
            failure()
        }
    }
}

fn failure() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, SUBMIT_FAILED)
}

/// JSON when the request says so, urlencoded form otherwise.
async fn decode_submission(req: Request) -> Result<Submission, String> {
    let is_json = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| {
            ct.trim_start()
                .to_ascii_lowercase()
                .starts_with("application/json")
        });

    if is_json {
        Json::<Submission>::from_request(req, &())
            .await
            .map(|Json(s)| s)
            .map_err(|rejection| rejection.body_text())
    } else {
        Form::<Submission>::from_request(req, &())
            .await
            .map(|Form(s)| s)
            .map_err(|rejection| rejection.body_text())
    }
}
