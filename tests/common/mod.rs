#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use reco_preview::fetch::{FetchedBody, PageFetcher};
use reco_preview::{Error, Result};
use url::Url;

/// In-memory upstream. Unknown URLs fail like a transport error.
#[derive(Default)]
pub struct FakeFetcher {
    pages: Mutex<HashMap<String, FetchedBody>>,
    calls: AtomicUsize,
    requested: Mutex<Vec<(String, String)>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, status: u16, content_type: Option<&str>, body: &str) -> Self {
        let final_url = Url::parse(url).expect("fixture url");
        self.pages.lock().expect("pages").insert(
            final_url.to_string(),
            FetchedBody {
                final_url,
                status,
                content_type: content_type.map(str::to_string),
                body: body.to_string(),
            },
        );
        self
    }

    pub fn with_html(self, url: &str, body: &str) -> Self {
        self.with_page(url, 200, Some("text/html; charset=utf-8"), body)
    }

    pub fn with_xml(self, url: &str, body: &str) -> Self {
        self.with_page(url, 200, Some("application/xml"), body)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(url, accept)` of every request, in order.
    pub fn requested(&self) -> Vec<(String, String)> {
        self.requested.lock().expect("requested").clone()
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn get(&self, url: &Url, accept: &str) -> Result<FetchedBody> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested
            .lock()
            .expect("requested")
            .push((url.to_string(), accept.to_string()));
        self.pages
            .lock()
            .expect("pages")
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| Error::UpstreamFetch(format!("{url}: connection refused")))
    }
}

pub fn url(raw: &str) -> Url {
    Url::parse(raw).expect("test url")
}

pub const SHOP_PAGE: &str = r##"<!doctype html>
<html>
<head>
  <meta http-equiv="Content-Security-Policy" content="default-src 'self'">
  <meta http-equiv="X-Frame-Options" content="DENY">
  <title>Shop</title>
  <link rel="stylesheet" href="/static/site.css">
  <script src="js/app.js"></script>
</head>
<body>
  <header id="top"><a id="home" href="/">Home</a></header>
  <main>
    <section class="hero"><img id="hero-img" src="img/hero.jpg" srcset="img/hero.jpg 1x, /img/hero@2x.jpg 2x"></section>
    <a id="product" href="products/42?color=red">Product</a>
    <a id="frag" href="#reviews">Reviews</a>
    <a id="mail" href="mailto:shop@shop.test">Mail</a>
    <form id="search" action="/search" method="post"><input name="q" value="red"></form>
  </main>
</body>
</html>"##;
