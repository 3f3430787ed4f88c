//! Live preview pipeline for a recommendation carousel.
//!
//! A remote page is fetched, stripped of framing directives, rewritten so
//! that every reference resolves against its own origin, and served back with
//! a small navigation bridge injected. The rendered copy of that page is
//! modelled in-process ([`frame::Frame`]) so an anchor element can be picked
//! and the widget can be mounted behind an isolation boundary next to it.
//!
//! ```ignore
//! use reco_preview::{fetch::FetchRequest, config::ProxyConfig};
//!
//! let request = FetchRequest::parse("https://shop.example/")?;
//! let document = reco_preview::fetch::fetch_document(&fetcher, &request, &ProxyConfig::default()).await?;
//! let mut frame = reco_preview::frame::Frame::from_document(&document)?;
//! ```

use thiserror::Error;

pub mod bridge;
pub mod config;
pub mod dom;
pub mod feed;
pub mod fetch;
pub mod frame;
pub mod html;
pub mod mount;
pub mod picker;
pub mod rewrite;
pub mod sanitize;
pub mod selector;
pub mod server;
pub mod session;
pub mod settings;
pub mod theme;
pub mod widget;

pub use bridge::{NavigationEvent, NavigationOrigin};
pub use config::{NavigationMode, ProxyConfig, ProxyEndpoint, ScriptPolicy};
pub use fetch::{FetchRequest, PageFetcher, ProxiedDocument};
pub use frame::Frame;
pub use mount::{IsolatedMount, IsolationHost, MountHandle};
pub use picker::{AnchorPicker, AnchorSelector};
pub use theme::{ThemeConfig, ThemePatch, ThemeStore};
pub use widget::{DeviceClass, DisplayFlags, Product};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),
    #[error("upstream returned status {status} for {url}")]
    UpstreamStatus { url: String, status: u16 },
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("html parse error: {0}")]
    HtmlParse(String),
    #[error("unsupported selector: {0}")]
    UnsupportedSelector(String),
    #[error("selector not found: {0}")]
    SelectorNotFound(String),
    #[error("mount failed: {0}")]
    Mount(String),
    #[error("feed parse error: {0}")]
    FeedParse(String),
    #[error("rewrite failed: {0}")]
    Rewrite(String),
    #[error("settings error: {0}")]
    Settings(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failure taxonomy the preview reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    UpstreamFailure,
    SelectorResolutionFailure,
    MountFailure,
    InternalError,
}

/// Category reported across the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    BadRequest,
    UpstreamFetchFailed,
    UnsupportedContentType,
    Internal,
}

impl ErrorCategory {
    pub fn status_code(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::UpstreamFetchFailed => 502,
            Self::UnsupportedContentType => 415,
            Self::Internal => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::UpstreamFetchFailed => "upstream_fetch_failed",
            Self::UnsupportedContentType => "unsupported_content_type",
            Self::Internal => "internal_error",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUrl(_) => ErrorKind::InvalidInput,
            Self::UpstreamFetch(_)
            | Self::UpstreamStatus { .. }
            | Self::UnsupportedContentType(_)
            | Self::FeedParse(_) => ErrorKind::UpstreamFailure,
            Self::UnsupportedSelector(_) | Self::SelectorNotFound(_) => {
                ErrorKind::SelectorResolutionFailure
            }
            Self::Mount(_) => ErrorKind::MountFailure,
            Self::HtmlParse(_) | Self::Rewrite(_) | Self::Settings(_) | Self::Internal(_) => {
                ErrorKind::InternalError
            }
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidUrl(_) | Self::UnsupportedSelector(_) | Self::SelectorNotFound(_) => {
                ErrorCategory::BadRequest
            }
            Self::UpstreamFetch(_) | Self::UpstreamStatus { .. } | Self::FeedParse(_) => {
                ErrorCategory::UpstreamFetchFailed
            }
            Self::UnsupportedContentType(_) => ErrorCategory::UnsupportedContentType,
            Self::HtmlParse(_)
            | Self::Mount(_)
            | Self::Rewrite(_)
            | Self::Settings(_)
            | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Soft failures are recovered with a fallback target and never abort a render.
    pub fn is_soft(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SelectorResolutionFailure | ErrorKind::MountFailure
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_map_to_status_codes() {
        assert_eq!(Error::InvalidUrl("x".into()).category().status_code(), 400);
        assert_eq!(
            Error::UpstreamStatus {
                url: "https://a.test/".into(),
                status: 404
            }
            .category()
            .status_code(),
            502
        );
        assert_eq!(
            Error::UnsupportedContentType("image/png".into())
                .category()
                .status_code(),
            415
        );
        assert_eq!(Error::Internal("boom".into()).category().status_code(), 500);
    }

    #[test]
    fn selector_and_mount_failures_are_soft() {
        assert!(Error::SelectorNotFound("#gone".into()).is_soft());
        assert!(Error::Mount("detached".into()).is_soft());
        assert!(!Error::UpstreamFetch("timeout".into()).is_soft());
        assert_eq!(
            Error::InvalidUrl("example.com".into()).kind(),
            ErrorKind::InvalidInput
        );
    }
}
