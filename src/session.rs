//! Preview session: owns the current proxied document, its rendered frame and
//! the mounted widget.
//!
//! Navigations are last-request-wins. Every call to
//! [`PreviewSession::begin_navigation`] supersedes the previous ticket, and a
//! result that arrives for a superseded ticket is dropped without touching
//! the current document. An applied document fully replaces the previous
//! frame before the anchor is resolved and the widget is mounted.

use tokio::sync::watch;
use tracing::{debug, info};
use url::Url;

use crate::bridge::{BridgeDispatch, NavigationMessage};
use crate::config::ProxyConfig;
use crate::dom::NodeId;
use crate::fetch::{FetchRequest, PageFetcher, ProxiedDocument, fetch_document};
use crate::frame::{ClickOutcome, Frame};
use crate::mount::{AnchorPlacement, DomIsolationHost, IsolatedMount, IsolationHost, MountHandle};
use crate::picker::AnchorSelector;
use crate::theme::ThemeConfig;
use crate::widget::{
    DeviceClass, DisplayFlags, Product, ProductCount, WidgetAction, WidgetOptions, pagination_for,
    render_widget,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NavigationTicket(u64);

/// A navigation that has been issued but whose fetch has not completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNavigation {
    pub ticket: NavigationTicket,
    pub request: FetchRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationOutcome {
    Applied,
    /// A newer navigation was issued while this one was in flight.
    Stale,
}

pub struct PreviewSession {
    config: ProxyConfig,
    theme: watch::Receiver<ThemeConfig>,
    mount: IsolatedMount,
    anchor: Option<AnchorSelector>,
    options: WidgetOptions,
    products: Vec<Product>,
    page: usize,
    issued: u64,
    document: Option<ProxiedDocument>,
    frame: Option<Frame>,
    mounted: Option<MountHandle<NodeId>>,
}

impl PreviewSession {
    /// `theme` is a subscription handed out by a [`crate::ThemeStore`].
    pub fn new(config: ProxyConfig, theme: watch::Receiver<ThemeConfig>) -> Self {
        Self {
            config,
            theme,
            mount: IsolatedMount::default(),
            anchor: None,
            options: WidgetOptions::default(),
            products: Vec::new(),
            page: 0,
            issued: 0,
            document: None,
            frame: None,
            mounted: None,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn document(&self) -> Option<&ProxiedDocument> {
        self.document.as_ref()
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    pub fn frame_mut(&mut self) -> Option<&mut Frame> {
        self.frame.as_mut()
    }

    pub fn mount_handle(&self) -> Option<&MountHandle<NodeId>> {
        self.mounted.as_ref()
    }

    pub fn anchor(&self) -> Option<&AnchorSelector> {
        self.anchor.as_ref()
    }

    pub fn options(&self) -> &WidgetOptions {
        &self.options
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn page(&self) -> usize {
        self.page
    }

    /// Validates `raw` and supersedes any navigation still in flight.
    pub fn begin_navigation(&mut self, raw: &str) -> Result<PendingNavigation> {
        let request = FetchRequest::parse(raw)?;
        Ok(self.issue(request))
    }

    fn issue(&mut self, request: FetchRequest) -> PendingNavigation {
        self.issued += 1;
        PendingNavigation {
            ticket: NavigationTicket(self.issued),
            request,
        }
    }

    pub fn is_current(&self, ticket: NavigationTicket) -> bool {
        ticket.0 == self.issued
    }

    /// Applies a finished fetch if it is still the latest one. Errors for a
    /// superseded ticket are dropped along with its document.
    pub fn complete_navigation(
        &mut self,
        ticket: NavigationTicket,
        result: Result<ProxiedDocument>,
    ) -> Result<NavigationOutcome> {
        if !self.is_current(ticket) {
            debug!(ticket = ticket.0, latest = self.issued, "stale navigation result ignored");
            return Ok(NavigationOutcome::Stale);
        }
        let document = result?;
        self.apply_document(document)?;
        Ok(NavigationOutcome::Applied)
    }

    /// Fetches and applies `raw` in one step.
    pub async fn navigate(
        &mut self,
        fetcher: &dyn PageFetcher,
        raw: &str,
    ) -> Result<NavigationOutcome> {
        let pending = self.begin_navigation(raw)?;
        self.run(fetcher, pending).await
    }

    /// Follows a navigation message posted by the framed page.
    pub async fn follow_message(
        &mut self,
        fetcher: &dyn PageFetcher,
        raw_message: &str,
    ) -> Result<NavigationOutcome> {
        let pending = self.on_message(raw_message)?;
        self.run(fetcher, pending).await
    }

    async fn run(
        &mut self,
        fetcher: &dyn PageFetcher,
        pending: PendingNavigation,
    ) -> Result<NavigationOutcome> {
        let result = fetch_document(fetcher, &pending.request, &self.config).await;
        self.complete_navigation(pending.ticket, result)
    }

    /// A `{"type":"navigation","url":...}` message from the framed page
    /// becomes a new navigation. Malformed messages are rejected.
    pub fn on_message(&mut self, raw: &str) -> Result<PendingNavigation> {
        let url = NavigationMessage::parse(raw)?;
        Ok(self.issue(FetchRequest::from(url)))
    }

    /// Navigations the bridge intercepted since the last call.
    pub fn take_navigations(&mut self) -> Vec<BridgeDispatch> {
        self.frame
            .as_mut()
            .map(Frame::take_navigation_dispatches)
            .unwrap_or_default()
    }

    /// Replaces the current document wholesale and remounts the widget.
    pub fn apply_document(&mut self, document: ProxiedDocument) -> Result<()> {
        let frame = Frame::from_document(&document, &self.config)?;
        info!(url = %document.base_url, "preview document replaced");
        self.frame = Some(frame);
        self.document = Some(document);
        self.mounted = None;
        self.remount()
    }

    /// Runs the mount and renders the widget into its boundary. A no-op
    /// before the first document.
    pub fn remount(&mut self) -> Result<()> {
        let Some(frame) = self.frame.as_mut() else {
            return Ok(());
        };
        let theme = self.theme.borrow_and_update().clone();
        let mut host = DomIsolationHost::new(frame.dom_mut());
        let handle = self.mount.ensure_mount(&mut host, self.anchor.as_ref(), &theme)?;
        let mut pagination = pagination_for(&self.products, &self.options);
        pagination.set_page(self.page);
        self.page = pagination.page();
        handle.render(&mut host, &render_widget(&self.products, &self.options, self.page))?;
        self.mounted = Some(handle);
        Ok(())
    }

    fn rerender(&mut self) -> Result<()> {
        let Some(handle) = self.mounted else {
            return self.remount();
        };
        let Some(frame) = self.frame.as_mut() else {
            return Ok(());
        };
        let mut pagination = pagination_for(&self.products, &self.options);
        pagination.set_page(self.page);
        self.page = pagination.page();
        let html = render_widget(&self.products, &self.options, self.page);
        handle.render(&mut DomIsolationHost::new(frame.dom_mut()), &html)
    }

    /// Pulls a pending theme change into the mounted boundary. Only the
    /// variable block is touched.
    pub fn refresh_theme(&mut self) -> Result<bool> {
        if !self.theme.has_changed().unwrap_or(false) {
            return Ok(false);
        }
        self.apply_current_theme()
    }

    fn apply_current_theme(&mut self) -> Result<bool> {
        let theme = self.theme.borrow_and_update().clone();
        match (self.frame.as_mut(), self.mounted.as_ref()) {
            (Some(frame), Some(handle)) => {
                IsolatedMount::apply_theme(&mut DomIsolationHost::new(frame.dom_mut()), handle, &theme)
            }
            _ => Ok(false),
        }
    }

    /// Waits for the next theme broadcast and applies it.
    pub async fn next_theme(&mut self) -> Result<bool> {
        self.theme
            .changed()
            .await
            .map_err(|_| Error::Internal("theme store dropped".into()))?;
        self.apply_current_theme()
    }

    /// A new selector destroys the current container; the next mount creates
    /// a fresh one at the new anchor.
    pub fn set_anchor_selector(&mut self, selector: Option<AnchorSelector>) -> Result<()> {
        if selector == self.anchor {
            return Ok(());
        }
        debug!(selector = ?selector.as_ref().map(AnchorSelector::as_str), "anchor selector changed");
        self.anchor = selector;
        self.discard_mount()?;
        self.remount()
    }

    pub fn set_placement(&mut self, placement: AnchorPlacement) -> Result<()> {
        if placement == self.mount.placement {
            return Ok(());
        }
        self.mount.placement = placement;
        self.remount()
    }

    fn discard_mount(&mut self) -> Result<()> {
        if let (Some(frame), Some(handle)) = (self.frame.as_mut(), self.mounted.take()) {
            DomIsolationHost::new(frame.dom_mut()).discard_container(handle.container)?;
        }
        Ok(())
    }

    pub fn set_products(&mut self, products: Vec<Product>) -> Result<()> {
        self.products = products;
        self.rerender()
    }

    pub fn set_title(&mut self, title: &str) -> Result<()> {
        self.options.title = title.to_string();
        self.rerender()
    }

    pub fn set_device(&mut self, device: DeviceClass) -> Result<()> {
        self.options.device = device;
        self.rerender()
    }

    pub fn set_product_count(&mut self, count: ProductCount) -> Result<()> {
        self.options.count = count;
        self.rerender()
    }

    pub fn set_display_flags(&mut self, flags: DisplayFlags) -> Result<()> {
        self.options.flags = flags;
        self.rerender()
    }

    pub fn set_badge(&mut self, product_id: &str, text: &str) -> Result<()> {
        self.options.badges.set(product_id, text);
        self.rerender()
    }

    pub fn apply_widget_action(&mut self, action: WidgetAction) -> Result<()> {
        let mut pagination = pagination_for(&self.products, &self.options);
        pagination.set_page(self.page);
        pagination.apply(action);
        self.page = pagination.page();
        self.rerender()
    }

    pub fn begin_picking(&mut self) {
        if let Some(frame) = self.frame.as_mut() {
            frame.begin_picking();
        }
    }

    pub fn cancel_picking(&mut self) {
        if let Some(frame) = self.frame.as_mut() {
            frame.cancel_picking();
        }
    }

    pub fn is_picking(&self) -> bool {
        self.frame
            .as_ref()
            .is_some_and(|frame| frame.picker().is_picking())
    }

    /// Clicks a node in the rendered document. A click that ends a picking
    /// session moves the widget to the new anchor; a click on a widget
    /// control pages the carousel.
    pub fn click(&mut self, node: NodeId) -> Result<ClickOutcome> {
        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| Error::Internal("no document loaded".into()))?;
        let outcome = frame.click(node)?;
        if let Some(selector) = outcome.picked.clone() {
            info!(selector = %selector, "anchor picked");
            self.set_anchor_selector(Some(selector))?;
        } else if let Some(action) = self.widget_action_at(outcome.target) {
            self.apply_widget_action(action)?;
        }
        Ok(outcome)
    }

    pub fn click_selector(&mut self, selector: &str) -> Result<ClickOutcome> {
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| Error::Internal("no document loaded".into()))?;
        let node = frame
            .dom()
            .query_selector(selector)?
            .ok_or_else(|| Error::SelectorNotFound(selector.to_string()))?;
        self.click(node)
    }

    /// Clicks inside the widget boundary, resolved with selectors scoped to
    /// the boundary.
    pub fn click_widget(&mut self, selector: &str) -> Result<ClickOutcome> {
        let (frame, handle) = match (self.frame.as_ref(), self.mounted.as_ref()) {
            (Some(frame), Some(handle)) => (frame, handle),
            _ => return Err(Error::Internal("widget is not mounted".into())),
        };
        let node = frame
            .dom()
            .query_selector_from(handle.boundary, selector)?
            .ok_or_else(|| Error::SelectorNotFound(selector.to_string()))?;
        self.click(node)
    }

    fn widget_action_at(&self, target: NodeId) -> Option<WidgetAction> {
        let frame = self.frame.as_ref()?;
        let handle = self.mounted.as_ref()?;
        let dom = frame.dom();
        if !dom.is_descendant_of(target, handle.boundary) {
            return None;
        }
        let control = dom.closest(target, "[data-action]").ok().flatten()?;
        WidgetAction::parse(dom.attr(control, "data-action")?, dom.attr(control, "data-page"))
    }

    /// Serialized markup of the current frame, widget included.
    pub fn rendered_html(&self) -> Option<String> {
        self.frame.as_ref().map(|frame| frame.dom().to_html())
    }

    pub fn current_url(&self) -> Option<&Url> {
        self.frame.as_ref().map(Frame::document_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptPolicy;
    use crate::mount::MOUNT_ID;
    use crate::theme::{ThemePatch, ThemeStore};
    use chrono::Utc;

    fn document(url: &str, body: &str) -> ProxiedDocument {
        let base_url = Url::parse(url).expect("url");
        ProxiedDocument {
            html: format!("<html><head><title>t</title></head><body>{body}</body></html>"),
            origin: base_url.origin().ascii_serialization(),
            base_url,
            fetched_at: Utc::now(),
            navigation: Default::default(),
            scripts: ScriptPolicy::Interactive,
        }
    }

    fn session(store: &ThemeStore) -> PreviewSession {
        PreviewSession::new(ProxyConfig::default(), store.subscribe())
    }

    #[test]
    fn last_request_wins() -> Result<()> {
        let store = ThemeStore::default();
        let mut session = session(&store);
        let first = session.begin_navigation("https://a.test/")?;
        let second = session.begin_navigation("https://b.test/")?;

        let applied = session.complete_navigation(second.ticket, Ok(document("https://b.test/", "<p>b</p>")))?;
        assert_eq!(applied, NavigationOutcome::Applied);
        let late = session.complete_navigation(first.ticket, Ok(document("https://a.test/", "<p>a</p>")))?;
        assert_eq!(late, NavigationOutcome::Stale);
        assert_eq!(session.current_url().map(Url::as_str), Some("https://b.test/"));

        let stale_error = session.complete_navigation(first.ticket, Err(Error::UpstreamFetch("late".into())));
        assert_eq!(stale_error, Ok(NavigationOutcome::Stale));
        Ok(())
    }

    #[test]
    fn invalid_urls_never_issue_a_ticket() -> Result<()> {
        let store = ThemeStore::default();
        let mut session = session(&store);
        let pending = session.begin_navigation("https://a.test/")?;
        assert!(matches!(session.begin_navigation("example.com"), Err(Error::InvalidUrl(_))));
        assert!(session.is_current(pending.ticket));
        Ok(())
    }

    #[test]
    fn applied_documents_get_a_mounted_widget() -> Result<()> {
        let store = ThemeStore::default();
        let mut session = session(&store);
        session.apply_document(document("https://a.test/", "<main id=\"main\"></main>"))?;
        let html = session.rendered_html().unwrap_or_default();
        assert_eq!(html.matches(MOUNT_ID).count(), 1);
        assert!(session.mount_handle().is_some_and(|h| !h.fell_back));

        session.set_anchor_selector(AnchorSelector::new("#main"))?;
        let frame = session.frame().expect("frame");
        let container = frame.dom().by_id(MOUNT_ID).expect("container");
        let main = frame.dom().by_id("main").expect("main");
        assert_eq!(frame.dom().previous_element_sibling(container), Some(main));
        Ok(())
    }

    #[test]
    fn truncated_markup_still_gets_a_widget() -> Result<()> {
        let store = ThemeStore::default();
        let mut session = session(&store);
        let mut broken = document("https://a.test/", "");
        broken.html = "<!DOCTYPE html><html><body><main id=\"main\"><a href='/cart>Cart</a><!-- end".into();
        let pending = session.begin_navigation("https://a.test/")?;
        assert_eq!(
            session.complete_navigation(pending.ticket, Ok(broken))?,
            NavigationOutcome::Applied
        );
        assert!(session.frame().is_some_and(|frame| frame.dom().by_id("main").is_some()));
        assert_eq!(session.rendered_html().unwrap_or_default().matches(MOUNT_ID).count(), 1);
        Ok(())
    }

    #[test]
    fn theme_changes_touch_only_the_variable_block() -> Result<()> {
        let store = ThemeStore::default();
        let mut session = session(&store);
        session.apply_document(document("https://a.test/", ""))?;
        let before = session.mount_handle().copied().expect("handle");

        store.patch(&ThemePatch {
            accent: Some("#ff0000".into()),
            ..ThemePatch::default()
        });
        assert!(session.refresh_theme()?);
        assert!(!session.refresh_theme()?);
        let after = session.mount_handle().copied().expect("handle");
        assert_eq!(before.boundary, after.boundary);
        assert!(session.rendered_html().unwrap_or_default().contains("--rs-accent:#ff0000"));
        Ok(())
    }

    #[test]
    fn widget_controls_page_the_carousel() -> Result<()> {
        let store = ThemeStore::default();
        let mut session = session(&store);
        session.apply_document(document("https://a.test/", ""))?;
        let products = (0..10)
            .map(|index| Product {
                id: format!("p{index}"),
                title: format!("Item {index}"),
                image: String::new(),
                price: 1.0,
                badge: None,
                url: None,
            })
            .collect();
        session.set_products(products)?;
        session.set_product_count(ProductCount::clamped(10))?;

        session.click_widget(".rs-next")?;
        assert_eq!(session.page(), 1);
        session.click_widget("[data-page=\"2\"]")?;
        assert_eq!(session.page(), 2);
        session.click_widget(".rs-next")?;
        assert_eq!(session.page(), 2);

        session.set_device(DeviceClass::Mobile)?;
        assert_eq!(session.page(), 2);
        session.set_product_count(ProductCount::clamped(4))?;
        assert_eq!(session.page(), 1);
        Ok(())
    }

    #[test]
    fn picking_moves_the_widget() -> Result<()> {
        let store = ThemeStore::default();
        let mut session = session(&store);
        session.apply_document(document(
            "https://a.test/",
            r#"<section class="hero"><h1 id="headline">Hi</h1></section><footer></footer>"#,
        ))?;
        session.begin_picking();
        assert!(session.is_picking());
        let outcome = session.click_selector("#headline")?;
        assert!(outcome.default_prevented);
        assert!(!session.is_picking());
        assert_eq!(session.anchor().map(AnchorSelector::as_str), Some("#headline"));

        let frame = session.frame().expect("frame");
        let container = frame.dom().by_id(MOUNT_ID).expect("container");
        let headline = frame.dom().by_id("headline").expect("headline");
        assert_eq!(frame.dom().previous_element_sibling(container), Some(headline));
        assert_eq!(session.rendered_html().unwrap_or_default().matches(MOUNT_ID).count(), 1);
        Ok(())
    }

    #[test]
    fn bridged_links_become_pending_navigations() -> Result<()> {
        let store = ThemeStore::default();
        let mut session = session(&store);
        session.apply_document(document("https://a.test/", r#"<a id="next" href="/next">next</a>"#))?;
        session.click_selector("#next")?;
        let dispatches = session.take_navigations();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].event.url.as_str(), "https://a.test/next");

        let message = NavigationMessage::new(&dispatches[0].event.url).to_json()?;
        let pending = session.on_message(&message)?;
        assert_eq!(pending.request.target_url().as_str(), "https://a.test/next");
        assert!(session.on_message(r#"{"type":"other","url":"https://a.test/"}"#).is_err());
        Ok(())
    }
}
