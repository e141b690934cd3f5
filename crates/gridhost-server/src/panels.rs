use std::sync::Arc;
use std::time::Duration;

use crate::presence::PresenceIndicator;
use crate::ui_thread::{UiContext, UiThread};
use crate::window::PanelKind;

/// Settings, statistics, plugin list and splash windows.
///
/// All calls only queue work on the UI thread. Closing a panel that is not
/// open is a no-op.
#[derive(Clone)]
pub struct Panels {
    ui: UiThread,
    presence: Arc<PresenceIndicator>,
}

impl Panels {
    pub fn new(ui: UiThread, presence: Arc<PresenceIndicator>) -> Self {
        Self { ui, presence }
    }

    pub fn show(&self, kind: PanelKind) {
        let presence = Arc::clone(&self.presence);
        self.ui.post(move |ctx| {
            if let Err(err) = ctx.show_panel(kind) {
                tracing::error!(?kind, %err, "failed to show panel");
            }
            presence.set_panels(ctx.has_panels());
        });
    }

    pub fn hide(&self, kind: PanelKind) {
        let presence = Arc::clone(&self.presence);
        self.ui.post(move |ctx| close_panel(ctx, &presence, kind));
    }

    /// Closes every panel and recomputes the presence indicator once.
    pub fn hide_all(&self) {
        let presence = Arc::clone(&self.presence);
        self.ui.post(move |ctx| {
            let closed = PanelKind::ALL
                .into_iter()
                .filter(|kind| ctx.close_panel(*kind))
                .count();
            if closed > 0 {
                tracing::debug!(closed, "closed panels");
            }
            presence.set_panels(ctx.has_panels());
        });
    }

    pub fn show_splash(&self) {
        self.show(PanelKind::Splash);
    }

    /// Hides the splash screen, after `wait` when it is non-zero.
    pub fn hide_splash(&self, wait: Duration) {
        if wait.is_zero() {
            self.hide(PanelKind::Splash);
            return;
        }
        let presence = Arc::clone(&self.presence);
        self.ui
            .post_delayed(wait, move |ctx| close_panel(ctx, &presence, PanelKind::Splash));
    }

    pub fn set_splash_info(&self, text: impl Into<String>) {
        let text = text.into();
        self.ui.post(move |ctx| {
            if let Some(panel) = ctx.panel_mut(PanelKind::Splash) {
                panel.set_info(&text);
            }
        });
    }
}

fn close_panel(ctx: &mut UiContext, presence: &PresenceIndicator, kind: PanelKind) {
    if ctx.close_panel(kind) {
        tracing::debug!(?kind, "panel closed");
        presence.set_panels(ctx.has_panels());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::HeadlessWindows;

    fn panels() -> (Panels, UiThread, Arc<PresenceIndicator>) {
        let ui = UiThread::spawn(Box::new(HeadlessWindows)).unwrap();
        let presence = Arc::new(PresenceIndicator::new());
        (Panels::new(ui.clone(), Arc::clone(&presence)), ui, presence)
    }

    #[test]
    fn panels_drive_presence() {
        let (panels, ui, presence) = panels();
        panels.show(PanelKind::Settings);
        panels.show(PanelKind::Statistics);
        ui.flush();
        assert!(presence.is_visible());
        panels.hide(PanelKind::Settings);
        ui.flush();
        assert!(presence.is_visible());
        panels.hide_all();
        ui.flush();
        assert!(!presence.is_visible());
    }

    #[test]
    fn hiding_twice_is_harmless() {
        let (panels, ui, presence) = panels();
        panels.hide(PanelKind::PluginList);
        panels.hide_all();
        panels.hide_all();
        ui.flush();
        assert!(!presence.is_visible());
    }

    #[test]
    fn delayed_splash_dismissal() {
        let (panels, ui, presence) = panels();
        panels.show_splash();
        panels.set_splash_info("scanning plugins");
        panels.hide_splash(Duration::from_millis(100));
        ui.flush();
        assert!(presence.is_visible());
        std::thread::sleep(Duration::from_millis(400));
        ui.flush();
        assert!(!presence.is_visible());
    }
}
