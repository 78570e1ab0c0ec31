use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{Duration, NaiveDate, Utc};
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tower::ServiceExt;

use ledgerline::models::{
    Currency, IntervalPolicy, InvoiceStatus, LineItem, NewDocument, NewRecurringTemplate, QuoteStatus,
};
use ledgerline::services::{documents, lifecycle};
use ledgerline::{commands, AppState, Config, Database};

const SECRET: &str = "tick-tock";

struct TestApp {
    router: Router,
    state: AppState,
    company_id: String,
    client_id: String,
}

fn test_app() -> TestApp {
    let db = Database::open_in_memory().unwrap();
    let company = db.create_company("Acme", None, None, None).unwrap();
    let client = db.create_client(&company.id, "Globex", None).unwrap();
    let config = Config::from_lookup(|name| match name {
        "CRON_SECRET" => Some(SECRET.to_string()),
        "ENVIRONMENT" => Some("production".to_string()),
        _ => None,
    })
    .unwrap();

    let state = AppState::new(db, config);
    TestApp {
        router: commands::router(state.clone()),
        state,
        company_id: company.id,
        client_id: client.id,
    }
}

fn document(client_id: &str) -> NewDocument {
    NewDocument {
        client_id: client_id.to_string(),
        title: "Migration".into(),
        issue_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
        due_date: None,
        currency: Currency::Eur,
        tax: Decimal::new(10, 0),
        items: vec![LineItem::new("A", Decimal::new(2, 0), Decimal::new(10, 0))],
    }
}

fn quote_in(app: &TestApp, path: &[QuoteStatus]) -> String {
    let mut db = app.state.db.lock().unwrap();
    let quote = documents::create_quote(&mut db, &app.company_id, document(&app.client_id)).unwrap();
    for status in path {
        lifecycle::apply_quote_status(&mut db, &app.company_id, &quote.id, *status).unwrap();
    }
    quote.id
}

fn due_template(app: &TestApp) -> String {
    let mut db = app.state.db.lock().unwrap();
    db.create_template(
        &app.company_id,
        NewRecurringTemplate {
            client_id: app.client_id.clone(),
            title: "Hosting".into(),
            currency: Currency::Usd,
            tax: Decimal::ZERO,
            items: vec![LineItem::new("Server", Decimal::ONE, Decimal::new(40, 0))],
            interval_policy: IntervalPolicy::Monthly { day: 1 },
            payment_terms_days: Some(14),
            next_run_at: Utc::now() - Duration::hours(1),
        },
    )
    .unwrap()
    .id
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn cron_request(token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/cron/recurring-invoices");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn company_post(uri: &str, company_id: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-company-id", company_id);
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

#[tokio::test]
async fn health_is_public() {
    let app = test_app();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn scheduler_without_valid_secret_runs_nothing() {
    let app = test_app();
    let template_id = due_template(&app);

    let (missing, _) = send(&app, cron_request(None)).await;
    let (wrong, body) = send(&app, cron_request(Some("guess"))).await;

    assert_eq!(missing, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let db = app.state.db.lock().unwrap();
    assert!(db.invoices_for_template(&template_id).unwrap().is_empty());
    let template = db.get_template(&template_id).unwrap().unwrap();
    assert!(template.last_run_at.is_none());
}

#[tokio::test]
async fn scheduler_reports_generated_invoices_once() {
    let app = test_app();
    let template_id = due_template(&app);

    let (status, body) = send(&app, cron_request(Some(SECRET))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["generated"]["count"], 1);
    assert_eq!(body["errors"]["count"], 0);
    assert_eq!(body["deferred"]["count"], 0);
    assert!(body["durationMs"].is_u64());

    let invoice_id = body["generated"]["ids"][0].as_str().unwrap().to_string();
    {
        let db = app.state.db.lock().unwrap();
        let invoice = db.get_invoice(&invoice_id).unwrap().unwrap();
        assert_eq!(invoice.number, "INV-00001");
        assert_eq!(invoice.recurring_template_id.as_deref(), Some(template_id.as_str()));
        assert_eq!(invoice.status, InvoiceStatus::Draft);
    }

    let (_, again) = send(&app, cron_request(Some(SECRET))).await;
    assert_eq!(again["generated"]["count"], 0);
}

#[tokio::test]
async fn converting_an_accepted_quote_returns_the_invoice_number() {
    let app = test_app();
    let quote_id = quote_in(&app, &[QuoteStatus::Sent, QuoteStatus::Accepted]);

    let uri = format!("/api/quotes/{quote_id}/convert");
    let (status, body) = send(&app, company_post(&uri, &app.company_id, None)).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["number"], "INV-00001");
    let db = app.state.db.lock().unwrap();
    let invoice = db.get_invoice(body["invoiceId"].as_str().unwrap()).unwrap().unwrap();
    assert_eq!(invoice.quote_id.as_deref(), Some(quote_id.as_str()));
    assert_eq!(invoice.balance_due, Decimal::new(22, 0));
}

#[tokio::test]
async fn conversion_failures_map_to_http_statuses() {
    let app = test_app();
    let sent = quote_in(&app, &[QuoteStatus::Sent]);
    let accepted = quote_in(&app, &[QuoteStatus::Sent, QuoteStatus::Accepted]);
    let other_company = {
        let db = app.state.db.lock().unwrap();
        db.create_company("Initech", None, None, None).unwrap().id
    };

    let (not_accepted, body) = send(
        &app,
        company_post(&format!("/api/quotes/{sent}/convert"), &app.company_id, None),
    )
    .await;
    let (missing, _) = send(
        &app,
        company_post("/api/quotes/no-such-quote/convert", &app.company_id, None),
    )
    .await;
    let (foreign, _) = send(
        &app,
        company_post(&format!("/api/quotes/{accepted}/convert"), &other_company, None),
    )
    .await;
    let anonymous = Request::builder()
        .method("POST")
        .uri(format!("/api/quotes/{accepted}/convert"))
        .body(Body::empty())
        .unwrap();
    let (no_identity, _) = send(&app, anonymous).await;

    assert_eq!(not_accepted, StatusCode::CONFLICT);
    assert_eq!(body["error"], "not_convertible");
    assert_eq!(missing, StatusCode::NOT_FOUND);
    assert_eq!(foreign, StatusCode::FORBIDDEN);
    assert_eq!(no_identity, StatusCode::UNAUTHORIZED);

    let db = app.state.db.lock().unwrap();
    assert!(db.invoices_for_company(&app.company_id).unwrap().is_empty());
}

#[tokio::test]
async fn illegal_status_change_is_a_conflict() {
    let app = test_app();
    let (status, created) = send(
        &app,
        company_post(
            "/api/invoices",
            &app.company_id,
            Some(json!({
                "clientId": app.client_id,
                "title": "Support",
                "issueDate": "2026-03-02",
                "currency": "EUR",
                "tax": "10",
                "items": [{"description": "A", "qty": "2", "price": "10"}]
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let invoice_uri = format!("/api/invoices/{}/status", created["id"].as_str().unwrap());

    for next in ["SENT", "PAID"] {
        let (status, body) = send(
            &app,
            company_post(&invoice_uri, &app.company_id, Some(json!({ "status": next }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], next);
    }

    let (status, body) = send(
        &app,
        company_post(&invoice_uri, &app.company_id, Some(json!({ "status": "SENT" }))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");
}

#[tokio::test]
async fn detected_quote_can_be_staged_and_approved_into_an_invoice() {
    let app = test_app();
    let (status, staged) = send(
        &app,
        company_post(
            "/api/detected-quotes",
            &app.company_id,
            Some(json!({
                "clientId": app.client_id,
                "payload": {
                    "title": "Workshop",
                    "currency": "EUR",
                    "items": [{"description": "Day rate", "qty": 2, "price": "800"}]
                }
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(staged["status"], "PENDING");

    let uri = format!("/api/detected-quotes/{}/approve?convert=true", staged["id"].as_str().unwrap());
    let (status, approval) = send(&app, company_post(&uri, &app.company_id, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(approval["detected"]["status"], "APPROVED");
    assert_eq!(approval["quote"]["number"], "QUO-00001");
    assert_eq!(approval["invoice"]["number"], "INV-00001");

    let (status, _) = send(&app, company_post(&uri, &app.company_id, None)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn invalid_extraction_payload_is_unprocessable() {
    let app = test_app();
    let (status, body) = send(
        &app,
        company_post(
            "/api/detected-quotes",
            &app.company_id,
            Some(json!({ "clientId": app.client_id, "payload": { "title": "" } })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "validation");
}
