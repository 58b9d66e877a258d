//! Host seam for opening the consent window.

use std::sync::atomic::{AtomicBool, Ordering};

/// Opens the consent window for an authorization URL.
///
/// Returns `None` when the window could not be created (a blocked popup);
/// the broker then rejects without waiting.
pub trait PopupLauncher: Send + Sync {
    fn open(&self, url: &str) -> Option<Box<dyn PopupHandle>>;
}

/// A live consent window the broker polls for liveness.
pub trait PopupHandle: Send + Sync {
    fn is_closed(&self) -> bool;

    /// Close the window if it is still open.
    fn close(&self);
}

/// Opens the URL in the system browser.
///
/// A browser tab cannot be observed, so its handle never reports closed and
/// the flow ends through a callback message or the connect deadline.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowserLauncher;

struct BrowserTab {
    closed: AtomicBool,
}

impl PopupHandle for BrowserTab {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl PopupLauncher for SystemBrowserLauncher {
    fn open(&self, url: &str) -> Option<Box<dyn PopupHandle>> {
        if try_open_browser(url) {
            Some(Box::new(BrowserTab {
                closed: AtomicBool::new(false),
            }))
        } else {
            None
        }
    }
}

fn try_open_browser(url: &str) -> bool {
    #[cfg(target_os = "macos")]
    {
        return std::process::Command::new("open")
            .arg(url)
            .status()
            .is_ok_and(|status| status.success());
    }
    #[cfg(target_os = "windows")]
    {
        return std::process::Command::new("cmd")
            .args(["/C", "start", "", url])
            .status()
            .is_ok_and(|status| status.success());
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        return std::process::Command::new("xdg-open")
            .arg(url)
            .status()
            .is_ok_and(|status| status.success());
    }
    #[allow(unreachable_code)]
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_tab_close_is_sticky() {
        let tab = BrowserTab {
            closed: AtomicBool::new(false),
        };
        assert!(!tab.is_closed());

        tab.close();
        assert!(tab.is_closed());
    }

    #[test]
    fn test_launcher_is_object_safe() {
        fn assert_launcher(_: &dyn PopupLauncher) {}
        assert_launcher(&SystemBrowserLauncher);
    }
}
