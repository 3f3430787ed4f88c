mod common;

use common::{FakeFetcher, SHOP_PAGE};
use reco_preview::config::{NavigationMode, ProxyConfig, ProxyEndpoint, ScriptPolicy};
use reco_preview::fetch::{FetchRequest, HTML_ACCEPT, fetch_document, process_markup};
use reco_preview::{Error, ErrorCategory};

const PAGE_URL: &str = "https://shop.test/shop/index.html";

fn shop() -> FakeFetcher {
    FakeFetcher::new().with_html(PAGE_URL, SHOP_PAGE)
}

#[tokio::test]
async fn interactive_bridged_documents_are_sanitized_rewritten_and_bridged() -> reco_preview::Result<()> {
    let fetcher = shop();
    let request = FetchRequest::parse(PAGE_URL)?;
    let document = fetch_document(&fetcher, &request, &ProxyConfig::default()).await?;

    assert_eq!(document.origin, "https://shop.test");
    assert_eq!(document.base_url.as_str(), PAGE_URL);
    assert_eq!(document.navigation, NavigationMode::Bridged);
    assert_eq!(fetcher.requested(), vec![(PAGE_URL.to_string(), HTML_ACCEPT.to_string())]);

    let html = &document.html;
    assert!(!html.contains("Content-Security-Policy"));
    assert!(!html.contains("X-Frame-Options"));
    assert!(html.contains(r#"href="https://shop.test/static/site.css""#));
    assert!(html.contains(r#"src="https://shop.test/shop/js/app.js""#));
    assert!(html.contains(r#"src="https://shop.test/shop/img/hero.jpg""#));
    assert!(html.contains("https://shop.test/img/hero@2x.jpg 2x"));
    assert!(html.contains(r#"href="https://shop.test/shop/products/42?color=red""#));
    assert!(html.contains(r##"href="#reviews""##));
    assert!(html.contains(r#"action="https://shop.test/search" method="get""#));
    assert_eq!(html.matches(r#"data-reco="bridge""#).count(), 1);
    assert_eq!(html.matches("<base ").count(), 1);
    Ok(())
}

#[tokio::test]
async fn routed_documents_send_links_back_through_the_endpoint() -> reco_preview::Result<()> {
    let fetcher = shop();
    let request = FetchRequest::parse(PAGE_URL)?;
    let endpoint = ProxyEndpoint::default().with_origin(common::url("http://127.0.0.1:3000/"));
    let config = ProxyConfig::new(NavigationMode::Routed, ScriptPolicy::Interactive).with_endpoint(endpoint);
    let document = fetch_document(&fetcher, &request, &config).await?;

    assert!(document.html.contains(
        r#"href="http://127.0.0.1:3000/api/proxy?url=https%3A%2F%2Fshop.test%2Fshop%2Fproducts%2F42%3Fcolor%3Dred""#
    ));
    assert!(document.html.contains(r#"<a id="mail" href="mailto:shop@shop.test">"#));
    assert!(document.html.contains(r#"data-navigation="routed""#));
    Ok(())
}

#[tokio::test]
async fn snapshot_documents_are_inert() -> reco_preview::Result<()> {
    let fetcher = shop();
    let request = FetchRequest::parse(PAGE_URL)?;
    let document = fetch_document(&fetcher, &request, &ProxyConfig::snapshot()).await?;
    assert!(!document.html.contains("<script"));
    assert!(document.html.contains("pointer-events: none !important"));
    assert_eq!(document.scripts, ScriptPolicy::Snapshot);
    Ok(())
}

#[tokio::test]
async fn invalid_urls_never_reach_the_network() {
    let fetcher = shop();
    for raw in ["example.com", "", "ftp://shop.test/"] {
        let err = FetchRequest::parse(raw).err();
        assert!(matches!(err, Some(Error::InvalidUrl(_))), "{raw:?}");
    }
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn upstream_failures_are_categorised() -> reco_preview::Result<()> {
    let fetcher = FakeFetcher::new()
        .with_page("https://shop.test/missing", 404, Some("text/html"), "<p>nope</p>")
        .with_page("https://shop.test/logo.png", 200, Some("image/png"), "")
        .with_page("https://shop.test/bare", 200, None, "<p>bare</p>");

    let missing = fetch_document(&fetcher, &FetchRequest::parse("https://shop.test/missing")?, &ProxyConfig::default()).await;
    assert!(matches!(missing, Err(Error::UpstreamStatus { status: 404, .. })));
    assert_eq!(missing.err().map(|e| e.category()), Some(ErrorCategory::UpstreamFetchFailed));

    let image = fetch_document(&fetcher, &FetchRequest::parse("https://shop.test/logo.png")?, &ProxyConfig::default()).await;
    assert_eq!(image.err().map(|e| e.category().status_code()), Some(415));

    let refused = fetch_document(&fetcher, &FetchRequest::parse("https://down.test/")?, &ProxyConfig::default()).await;
    assert!(matches!(refused, Err(Error::UpstreamFetch(_))));

    let bare = FetchRequest::parse("https://shop.test/bare")?;
    assert!(fetch_document(&fetcher, &bare, &ProxyConfig::default()).await.is_ok());
    assert!(matches!(
        fetch_document(&fetcher, &bare, &ProxyConfig::snapshot()).await,
        Err(Error::UnsupportedContentType(_))
    ));
    Ok(())
}

#[test]
fn doctype_stays_first_when_the_page_has_no_head() -> reco_preview::Result<()> {
    let page = url::Url::parse(PAGE_URL).expect("page url");
    let markup = "<!DOCTYPE html><body><p>hi</p></body>";

    let bridged = process_markup(markup, &page, &ProxyConfig::default())?;
    assert!(bridged.starts_with("<!DOCTYPE html><head><script data-reco=\"bridge\">"), "{bridged}");

    let snapshot = process_markup(markup, &page, &ProxyConfig::snapshot())?;
    assert!(snapshot.starts_with("<!DOCTYPE html><head>"), "{snapshot}");
    assert!(snapshot.contains(r#"<style data-reco="snapshot">"#));
    Ok(())
}
