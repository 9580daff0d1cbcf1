use crate::{
    classify::ErrorCounts,
    record::TabId,
};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

pub const ALERT_COLOR: &str = "#FF0000";

/// Surface the per-tab indicator is drawn on, e.g. the browser action of an extension.
pub trait BadgeSink: Send + Sync + 'static {
    /// Empty `text` hides the badge.
    fn set_text(&self, tab: TabId, text: &str);

    fn set_background_color(&self, tab: TabId, color: &str);

    /// The tab is gone, drop anything kept for it.
    fn forget(&self, _tab: TabId) {}
}

impl<S: BadgeSink + ?Sized> BadgeSink for Arc<S> {
    fn set_text(&self, tab: TabId, text: &str) {
        (**self).set_text(tab, text)
    }

    fn set_background_color(&self, tab: TabId, color: &str) {
        (**self).set_background_color(tab, color)
    }

    fn forget(&self, tab: TabId) {
        (**self).forget(tab)
    }
}

/// Renders error counts as a badge.
pub struct BadgePresenter<S> {
    sink: S,
}

impl<S: BadgeSink> BadgePresenter<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Show the total of both counts in the alert color, or clear the badge when there is nothing to report. Safe to
    /// call as often as needed.
    pub fn render(&self, tab: TabId, counts: ErrorCounts) {
        let total = counts.total();
        trace!(tab, http = counts.http, dns = counts.dns, "badge");
        if total > 0 {
            self.sink.set_text(tab, &total.to_string());
            self.sink.set_background_color(tab, ALERT_COLOR);
        } else {
            self.sink.set_text(tab, "");
        }
    }

    pub fn forget(&self, tab: TabId) {
        self.sink.forget(tab);
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Badge {
    pub text: String,
    pub color: Option<String>,
}

/// In-memory badge surface, one [`Badge`] per tab.
#[derive(Default)]
pub struct BadgeBoard {
    badges: DashMap<TabId, Badge>,
}

impl BadgeBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tab: TabId) -> Option<Badge> {
        self.badges.get(&tab).map(|it| it.value().clone())
    }

    /// Text currently shown for `tab`, empty if none.
    pub fn text(&self, tab: TabId) -> String {
        self.get(tab).map(|it| it.text).unwrap_or_default()
    }
}

impl BadgeSink for BadgeBoard {
    fn set_text(&self, tab: TabId, text: &str) {
        self.badges.entry(tab).or_default().text = text.to_string();
    }

    fn set_background_color(&self, tab: TabId, color: &str) {
        self.badges.entry(tab).or_default().color = Some(color.to_string());
    }

    fn forget(&self, tab: TabId) {
        self.badges.remove(&tab);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let presenter = BadgePresenter::new(BadgeBoard::new());

        presenter.render(5, ErrorCounts { http: 2, dns: 1 });
        assert_eq!(presenter.sink().get(5), Some(Badge {
            text: "3".into(),
            color: Some(ALERT_COLOR.into()),
        }));

        presenter.render(5, ErrorCounts::default());
        assert_eq!(presenter.sink().text(5), "");

        // redundant renders change nothing
        presenter.render(5, ErrorCounts::default());
        assert_eq!(presenter.sink().text(5), "");

        presenter.forget(5);
        assert_eq!(presenter.sink().get(5), None);
    }
}
