//! Widget Renderer: the recommendation carousel markup, its pagination and
//! the device classes it is previewed at.

use std::collections::BTreeMap;
use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::html::{escape_attr, escape_text};

pub const MIN_PRODUCT_COUNT: usize = 4;
pub const MAX_PRODUCT_COUNT: usize = 24;
pub const DEFAULT_PRODUCT_COUNT: usize = 8;
pub const MAX_WIDGET_WIDTH: u32 = 1200;
pub const DEFAULT_TITLE: &str = "Recently Viewed";
pub const DEFAULT_BADGE: &str = "New";
const EMPTY_BADGE: &str = "\u{2014}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub title: String,
    pub image: String,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Stand-in list used whenever no products were supplied.
pub fn placeholder_products() -> Vec<Product> {
    let item = |id: &str, title: &str, photo: &str, price: f64, badge: Option<&str>| Product {
        id: id.to_string(),
        title: title.to_string(),
        image: format!(
            "https://images.unsplash.com/photo-{photo}?q=80&w=1200&auto=format&fit=crop"
        ),
        price,
        badge: badge.map(str::to_string),
        url: None,
    };
    vec![
        item(
            "m1",
            "Siyah Bisiklet Yaka Baskılı Bi-Stretch Interlok Sweatshirt",
            "1520975992205-2afc08b5048b",
            107199.0,
            Some("New"),
        ),
        item(
            "m2",
            "Lacivert Mono Yaka Bi-Stretch Hafif Dokulu Blazer Ceket",
            "1520975922215-230f29c97d42",
            649999.0,
            Some(""),
        ),
        item(
            "m3",
            "Taş Bisiklet Yaka Baskılı Bi-Stretch Interlok Sweatshirt",
            "1520975935555-5c5b20f0b2a8",
            95999.0,
            None,
        ),
        item(
            "m4",
            "Siyah Klasik Yaka Kaşe Kapaklı Gömlek Ceket",
            "1520975979999-6d5b6f7a2f31",
            233299.0,
            None,
        ),
    ]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Tablet,
    Mobile,
}

impl DeviceClass {
    pub const ALL: [DeviceClass; 3] = [Self::Desktop, Self::Tablet, Self::Mobile];

    pub fn label(self) -> &'static str {
        match self {
            Self::Desktop => "Desktop",
            Self::Tablet => "Tablet",
            Self::Mobile => "Mobile",
        }
    }

    pub fn width(self) -> u32 {
        match self {
            Self::Desktop => 1280,
            Self::Tablet => 834,
            Self::Mobile => 390,
        }
    }

    pub fn height(self) -> u32 {
        match self {
            Self::Desktop => 800,
            Self::Tablet => 1112,
            Self::Mobile => 844,
        }
    }

    pub fn per_view(self) -> usize {
        match self {
            Self::Desktop => 4,
            Self::Tablet => 3,
            Self::Mobile => 2,
        }
    }

    pub fn widget_width(self) -> u32 {
        self.width().min(MAX_WIDGET_WIDTH)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Number of products shown, always within 4..=24.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "usize", into = "usize")]
pub struct ProductCount(usize);

impl ProductCount {
    /// User input: clamped into range.
    pub fn clamped(count: usize) -> Self {
        Self(count.clamp(MIN_PRODUCT_COUNT, MAX_PRODUCT_COUNT))
    }

    /// Persisted value: anything out of range means the default.
    pub fn from_saved(count: usize) -> Self {
        if (MIN_PRODUCT_COUNT..=MAX_PRODUCT_COUNT).contains(&count) {
            Self(count)
        } else {
            Self::default()
        }
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for ProductCount {
    fn default() -> Self {
        Self(DEFAULT_PRODUCT_COUNT)
    }
}

impl From<usize> for ProductCount {
    fn from(count: usize) -> Self {
        Self::from_saved(count)
    }
}

impl From<ProductCount> for usize {
    fn from(count: ProductCount) -> Self {
        count.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DisplayFlags {
    pub show_image: bool,
    pub show_title: bool,
    pub show_badge: bool,
    pub show_left_arrow: bool,
    pub show_right_arrow: bool,
    pub show_bullets: bool,
}

impl Default for DisplayFlags {
    fn default() -> Self {
        Self {
            show_image: true,
            show_title: true,
            show_badge: true,
            show_left_arrow: true,
            show_right_arrow: true,
            show_bullets: true,
        }
    }
}

/// User-edited badge text keyed by product id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BadgeOverrides(BTreeMap<String, String>);

impl BadgeOverrides {
    pub fn set(&mut self, product_id: &str, text: &str) {
        self.0.insert(product_id.to_string(), text.trim().to_string());
    }

    pub fn get(&self, product_id: &str) -> Option<&str> {
        self.0.get(product_id).map(String::as_str)
    }

    /// Override, else the product's own badge, else the default, trimmed.
    pub fn badge_for(&self, product: &Product) -> String {
        self.get(&product.id)
            .or(product.badge.as_deref())
            .unwrap_or(DEFAULT_BADGE)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    page: usize,
    page_count: usize,
}

impl Pagination {
    pub fn new(total: usize, per_view: usize) -> Self {
        Self {
            page: 0,
            page_count: page_count(total, per_view),
        }
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn set_page(&mut self, page: usize) {
        self.page = page.min(self.page_count - 1);
    }

    pub fn next(&mut self) {
        self.set_page(self.page + 1);
    }

    pub fn prev(&mut self) {
        self.page = self.page.saturating_sub(1);
    }

    /// The list or per-view changed; the current page is kept when it still exists.
    pub fn resize(&mut self, total: usize, per_view: usize) {
        self.page_count = page_count(total, per_view);
        self.set_page(self.page);
    }

    pub fn apply(&mut self, action: WidgetAction) {
        match action {
            WidgetAction::Prev => self.prev(),
            WidgetAction::Next => self.next(),
            WidgetAction::Page(page) => self.set_page(page),
        }
    }
}

fn page_count(total: usize, per_view: usize) -> usize {
    total.div_ceil(per_view.max(1)).max(1)
}

/// A control inside the rendered widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetAction {
    Prev,
    Next,
    Page(usize),
}

impl WidgetAction {
    /// Reads the `data-action` / `data-page` pair carried by widget controls.
    pub fn parse(action: &str, page: Option<&str>) -> Option<Self> {
        match action {
            "prev" => Some(Self::Prev),
            "next" => Some(Self::Next),
            "page" => page?.trim().parse().ok().map(Self::Page),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WidgetOptions {
    pub title: String,
    pub device: DeviceClass,
    pub count: ProductCount,
    pub flags: DisplayFlags,
    pub badges: BadgeOverrides,
    pub editable_badges: bool,
}

impl Default for WidgetOptions {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
            device: DeviceClass::default(),
            count: ProductCount::default(),
            flags: DisplayFlags::default(),
            badges: BadgeOverrides::default(),
            editable_badges: true,
        }
    }
}

/// The first `count` products, or the placeholder list when none were given.
pub fn visible_products(products: &[Product], count: ProductCount) -> Vec<Product> {
    let source = if products.is_empty() {
        placeholder_products()
    } else {
        products.to_vec()
    };
    source.into_iter().take(count.get()).collect()
}

pub fn pagination_for(products: &[Product], options: &WidgetOptions) -> Pagination {
    Pagination::new(
        visible_products(products, options.count).len(),
        options.device.per_view(),
    )
}

/// Carousel markup for the isolation boundary. `page` is clamped.
pub fn render_widget(products: &[Product], options: &WidgetOptions, page: usize) -> String {
    let items = visible_products(products, options.count);
    let per_view = options.device.per_view();
    let mut pagination = Pagination::new(items.len(), per_view);
    pagination.set_page(page);
    let pages = pagination.page_count();
    let flags = options.flags;

    let mut out = String::new();
    out.push_str(&format!(
        "<div class=\"rs-wrap\" style=\"width:{}px\">",
        options.device.widget_width()
    ));
    out.push_str(&format!(
        "<h2 class=\"rs-title\">{}</h2>",
        escape_text(&options.title)
    ));
    out.push_str("<div class=\"rs-slider\">");
    if flags.show_left_arrow {
        out.push_str("<button type=\"button\" class=\"rs-arrow rs-prev\" data-action=\"prev\" aria-label=\"Previous\">&#8249;</button>");
    }
    if flags.show_right_arrow {
        out.push_str("<button type=\"button\" class=\"rs-arrow rs-next\" data-action=\"next\" aria-label=\"Next\">&#8250;</button>");
    }

    out.push_str(&format!(
        "<div class=\"rs-track\" style=\"width:{}%;transform:translateX(-{}%)\">",
        pages * 100,
        percent(pagination.page() as f64 * (100.0 / pages as f64))
    ));
    let item_width = percent(100.0 / (per_view * pages) as f64);
    for product in &items {
        out.push_str(&format!(
            "<div class=\"rs-item\" style=\"width:{item_width}%\"><div class=\"rs-card\">"
        ));
        if flags.show_image {
            out.push_str(&format!(
                "<div class=\"rs-img\"><img src=\"{}\" alt=\"{}\" loading=\"lazy\">",
                escape_attr(&product.image),
                escape_attr(&product.title)
            ));
            if flags.show_badge {
                let badge = options.badges.badge_for(product);
                let badge = if badge.is_empty() { EMPTY_BADGE } else { badge.as_str() };
                out.push_str(&format!(
                    "<span class=\"rs-badge\"{} data-product-id=\"{}\">{}</span>",
                    if options.editable_badges { " contenteditable=\"true\"" } else { "" },
                    escape_attr(&product.id),
                    escape_text(badge)
                ));
            }
            out.push_str("</div>");
        }
        out.push_str("<div class=\"rs-body\">");
        if flags.show_title {
            out.push_str(&format!(
                "<p class=\"rs-title2\">{}</p>",
                escape_text(&product.title)
            ));
        }
        out.push_str(&format!(
            "<p class=\"rs-price\">{}</p>",
            escape_text(&format_price(product.price))
        ));
        out.push_str("</div></div></div>");
    }
    out.push_str("</div>");

    if flags.show_bullets {
        out.push_str("<div class=\"rs-bullets\">");
        for index in 0..pages {
            let active = if index == pagination.page() { " is-active" } else { "" };
            out.push_str(&format!(
                "<button type=\"button\" class=\"rs-dot{active}\" data-action=\"page\" data-page=\"{index}\" aria-label=\"Page {}\"></button>",
                index + 1
            ));
        }
        out.push_str("</div>");
    }
    out.push_str("</div></div>");
    out
}

fn percent(value: f64) -> String {
    let fixed = format!("{value:.4}");
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Turkish lira layout: `₺1.234,50`.
pub fn format_price(value: f64) -> String {
    if !value.is_finite() {
        return "₺0,00".to_string();
    }
    let cents = (value.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();
    let mut grouped = String::new();
    for (index, digit) in whole.chars().enumerate() {
        if index > 0 && (whole.len() - index) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(digit);
    }
    let sign = if value < 0.0 && cents > 0 { "-" } else { "" };
    format!("{sign}₺{grouped},{:02}", cents % 100)
}
