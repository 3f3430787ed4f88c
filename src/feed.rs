//! XML product-feed import.

use std::collections::HashSet;
use std::fmt;

use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fetch::{FetchRequest, PageFetcher, XML_ACCEPT};
use crate::widget::{MAX_PRODUCT_COUNT, Product};
use crate::{Error, Result};

pub const FALLBACK_TITLE: &str = "Product";

/// Which feed price the widget shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceMode {
    #[default]
    Discount,
    Original,
}

impl fmt::Display for PriceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Discount => "discount",
            Self::Original => "original",
        })
    }
}

/// Fetches and parses a feed. The URL is validated before any request.
pub async fn import_feed(
    fetcher: &dyn PageFetcher,
    raw_url: &str,
    mode: PriceMode,
) -> Result<Vec<Product>> {
    let request = FetchRequest::parse(raw_url)?;
    let url = request.target_url();
    let fetched = fetcher.get(url, XML_ACCEPT).await?;
    if !fetched.is_success() {
        warn!(url = %url, status = fetched.status, "feed request failed");
        return Err(Error::UpstreamStatus {
            url: url.to_string(),
            status: fetched.status,
        });
    }
    let products = parse_feed(&fetched.body, mode)?;
    info!(url = %url, products = products.len(), %mode, "feed imported");
    Ok(products)
}

/// Maps `<products><product>…</product></products>` onto widget products.
///
/// Fields are read from child elements, falling back to attributes of the
/// same name. At most 24 products are returned; later duplicates of an id
/// are dropped.
pub fn parse_feed(xml: &str, mode: PriceMode) -> Result<Vec<Product>> {
    let document = Document::parse(xml).map_err(|e| Error::FeedParse(e.to_string()))?;
    let root = document.root_element();
    let items: Vec<Node<'_, '_>> = match root.tag_name().name() {
        "product" => vec![root],
        _ => root
            .children()
            .filter(|node| node.is_element() && node.tag_name().name() == "product")
            .collect(),
    };

    let mut seen = HashSet::new();
    let mut products = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        let name = field(item, "product_name");
        let image = field(item, "large_image")
            .or_else(|| field(item, "medium_image"))
            .or_else(|| field(item, "small_image"));
        if name.is_none() && image.is_none() {
            debug!(position = index + 1, "feed item without title or image skipped");
            continue;
        }
        let id = field(item, "product_code").unwrap_or_else(|| (index + 1).to_string());
        if !seen.insert(id.clone()) {
            debug!(id = %id, "duplicate feed item skipped");
            continue;
        }
        let (preferred, other) = match mode {
            PriceMode::Discount => ("discount_price", "original_price"),
            PriceMode::Original => ("original_price", "discount_price"),
        };
        let price = field(item, preferred)
            .or_else(|| field(item, other))
            .map_or(0.0, |raw| parse_price(&raw));

        products.push(Product {
            id,
            title: name.unwrap_or_else(|| FALLBACK_TITLE.to_string()),
            image: image.unwrap_or_default(),
            price,
            badge: None,
            url: field(item, "product_url"),
        });
        if products.len() == MAX_PRODUCT_COUNT {
            break;
        }
    }
    Ok(products)
}

fn field(item: Node<'_, '_>, name: &str) -> Option<String> {
    let from_child = item
        .children()
        .find(|node| node.is_element() && node.tag_name().name() == name)
        .map(|node| {
            node.descendants()
                .filter(|n| n.is_text())
                .filter_map(|n| n.text())
                .collect::<String>()
        });
    from_child
        .or_else(|| item.attribute(name).map(str::to_string))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Reads prices such as `1.299,90`, `1,299.90`, `199.90 TL` or `1.234.567`.
///
/// When both separators appear the last one is the decimal point. A single
/// separator kind repeated is a thousands separator; a lone one is decimal.
/// Anything unparseable is 0.
pub fn parse_price(raw: &str) -> f64 {
    let cleaned: String = raw
        .chars()
        .filter(|ch| ch.is_ascii_digit() || matches!(ch, '.' | ',' | '-'))
        .collect();
    let dots = cleaned.matches('.').count();
    let commas = cleaned.matches(',').count();

    let decimal = match (dots, commas) {
        (0, 0) => None,
        (_, 0) if dots > 1 => None,
        (0, _) if commas > 1 => None,
        (_, 0) => Some('.'),
        (0, _) => Some(','),
        _ => cleaned.rfind(['.', ',']).and_then(|at| cleaned[at..].chars().next()),
    };

    let normalized: String = match decimal {
        Some(sep) => {
            let at = cleaned.rfind(sep).unwrap_or(cleaned.len());
            let (whole, fraction) = cleaned.split_at(at);
            let whole: String = whole.chars().filter(|ch| !matches!(ch, '.' | ',')).collect();
            format!("{whole}.{}", &fraction[1..])
        }
        None => cleaned.chars().filter(|ch| !matches!(ch, '.' | ',')).collect(),
    };

    normalized
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn prices_tolerate_both_separator_styles() {
        assert_eq!(parse_price("199.90"), 199.9);
        assert_eq!(parse_price("199,90"), 199.9);
        assert_eq!(parse_price("1.299,90 TL"), 1299.9);
        assert_eq!(parse_price("1,299.90"), 1299.9);
        assert_eq!(parse_price("1.234.567"), 1234567.0);
        assert_eq!(parse_price("₺ 450"), 450.0);
        assert_eq!(parse_price("call us"), 0.0);
        assert_eq!(parse_price(""), 0.0);
    }

    #[test]
    fn maps_fields_with_fallbacks() -> Result<()> {
        let xml = r#"<?xml version="1.0"?>
<products>
  <product>
    <product_code>A1</product_code>
    <product_name>Shirt</product_name>
    <original_price>249.90</original_price>
    <discount_price>199.90</discount_price>
    <small_image>https://cdn.test/a1-s.jpg</small_image>
    <medium_image>https://cdn.test/a1-m.jpg</medium_image>
    <product_url>https://shop.test/a1</product_url>
  </product>
  <product>
    <product_name><![CDATA[Socks & More]]></product_name>
    <original_price>49</original_price>
  </product>
  <product>
    <small_image>https://cdn.test/3.jpg</small_image>
  </product>
  <product><product_code>skip</product_code></product>
</products>"#;
        let products = parse_feed(xml, PriceMode::Discount)?;
        assert_eq!(products.len(), 3);

        assert_eq!(products[0].id, "A1");
        assert_eq!(products[0].title, "Shirt");
        assert_eq!(products[0].price, 199.9);
        assert_eq!(products[0].image, "https://cdn.test/a1-m.jpg");
        assert_eq!(products[0].url.as_deref(), Some("https://shop.test/a1"));

        assert_eq!(products[1].id, "2");
        assert_eq!(products[1].title, "Socks & More");
        assert_eq!(products[1].price, 49.0);
        assert_eq!(products[1].image, "");

        assert_eq!(products[2].id, "3");
        assert_eq!(products[2].title, FALLBACK_TITLE);
        assert_eq!(products[2].price, 0.0);

        let original = parse_feed(xml, PriceMode::Original)?;
        assert_eq!(original[0].price, 249.9);
        Ok(())
    }

    #[test]
    fn single_product_roots_and_capitalised_roots() -> Result<()> {
        let single = parse_feed(
            "<product><product_code>X</product_code><product_name>Only</product_name></product>",
            PriceMode::Discount,
        )?;
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].id, "X");

        let capital = parse_feed(
            r#"<Products><product product_code="B7" product_name="Attr"/></Products>"#,
            PriceMode::Discount,
        )?;
        assert_eq!(capital[0].id, "B7");
        assert_eq!(capital[0].title, "Attr");
        Ok(())
    }

    #[test]
    fn caps_and_dedupes() -> Result<()> {
        let mut xml = String::from("<products>");
        xml.push_str("<product><product_code>dup</product_code><product_name>first</product_name></product>");
        xml.push_str("<product><product_code>dup</product_code><product_name>second</product_name></product>");
        for index in 0..40 {
            xml.push_str(&format!(
                "<product><product_code>p{index}</product_code><product_name>n</product_name></product>"
            ));
        }
        xml.push_str("</products>");
        let products = parse_feed(&xml, PriceMode::Discount)?;
        assert_eq!(products.len(), 24);
        assert_eq!(products[0].title, "first");
        assert_eq!(products.iter().filter(|p| p.id == "dup").count(), 1);
        Ok(())
    }

    #[test]
    fn malformed_xml_is_a_feed_error() {
        assert!(matches!(
            parse_feed("<products><product>", PriceMode::Discount),
            Err(Error::FeedParse(_))
        ));
    }
}
