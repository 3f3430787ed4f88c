mod common;

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use common::{FakeFetcher, SHOP_PAGE};
use reco_preview::ProxyConfig;
use reco_preview::server::{AppState, router};
use serde_json::{Value, json};
use tower::ServiceExt;

const PAGE_URL: &str = "https://shop.test/shop/index.html";

fn app(fetcher: Arc<FakeFetcher>) -> axum::Router {
    router(AppState::new(fetcher, ProxyConfig::default(), 60))
}

fn fetcher() -> Arc<FakeFetcher> {
    Arc::new(
        FakeFetcher::new()
            .with_html(PAGE_URL, SHOP_PAGE)
            .with_html("https://shop.test/search?q=red", "<p>results</p>")
            .with_xml(
                "https://shop.test/feed.xml",
                "<products><product><product_code>A1</product_code><product_name>Shirt</product_name><discount_price>199,90</discount_price></product></products>",
            ),
    )
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn proxy_serves_rewritten_html_with_private_caching() {
    let fetcher = fetcher();
    let response = app(fetcher.clone())
        .oneshot(
            Request::builder()
                .uri("/api/proxy?url=https%3A%2F%2Fshop.test%2Fshop%2Findex.html&nav=routed")
                .header(header::HOST, "preview.test:3000")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        Some("text/html; charset=utf-8")
    );
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).and_then(|v| v.to_str().ok()),
        Some("private, max-age=60")
    );
    let html = body_text(response).await;
    assert!(html.contains(
        "http://preview.test:3000/api/proxy?nav=routed&amp;url=https%3A%2F%2Fshop.test%2Fshop%2Fproducts%2F42%3Fcolor%3Dred"
    ) || html.contains(
        "http://preview.test:3000/api/proxy?nav=routed&url=https%3A%2F%2Fshop.test%2Fshop%2Fproducts%2F42%3Fcolor%3Dred"
    ));
    assert!(!html.contains("X-Frame-Options"));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn proxy_appends_leftover_fields_to_the_target() {
    let fetcher = fetcher();
    let response = app(fetcher.clone())
        .oneshot(
            Request::builder()
                .uri("/api/proxy?url=https%3A%2F%2Fshop.test%2Fsearch&q=red")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        fetcher.requested().first().map(|(url, _)| url.clone()),
        Some("https://shop.test/search?q=red".to_string())
    );
}

#[tokio::test]
async fn proxy_errors_carry_a_category() {
    let fetcher = fetcher();
    let response = app(fetcher.clone())
        .oneshot(
            Request::builder()
                .uri("/api/proxy?url=https%3A%2F%2Fdown.test%2F")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_str(&body_text(response).await).expect("json");
    assert_eq!(body["category"], "upstream_fetch_failed");
}

#[tokio::test]
async fn snapshot_rejects_relative_urls_without_fetching() {
    let fetcher = fetcher();
    let response = app(fetcher.clone())
        .oneshot(post_json("/api/preview-snapshot", json!({ "url": "example.com" })))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&body_text(response).await).expect("json");
    assert_eq!(body["category"], "bad_request");
    assert!(body["error"].as_str().is_some_and(|e| e.contains("example.com")));
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn snapshot_returns_inert_html() {
    let response = app(fetcher())
        .oneshot(post_json("/api/preview-snapshot", json!({ "url": PAGE_URL })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(response).await).expect("json");
    let html = body["html"].as_str().unwrap_or_default();
    assert!(html.contains("pointer-events: none !important"));
    assert!(!html.contains("<script"));
}

#[tokio::test]
async fn feed_import_returns_products() {
    let response = app(fetcher())
        .oneshot(post_json("/api/fetch-xml", json!({ "url": "https://shop.test/feed.xml" })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(response).await).expect("json");
    assert_eq!(body["products"][0]["id"], "A1");
    assert_eq!(body["products"][0]["price"], 199.9);
    assert_eq!(body["products"].as_array().map(Vec::len), Some(1));
}
