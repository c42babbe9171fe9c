//! Opening URLs for the user

use std::io;

use tracing::{info, warn};

/// Something that can show a URL to the user
pub trait BrowserLauncher: Send + Sync {
    /// Open `url`
    fn open(&self, url: &str) -> io::Result<()>;
}

/// The platform's default browser
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> io::Result<()> {
        open::that(url)
    }
}

/// Never opens anything; the URL is only printed
#[derive(Debug, Clone, Copy, Default)]
pub struct PrintOnly;

impl BrowserLauncher for PrintOnly {
    fn open(&self, _url: &str) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "browser launch disabled",
        ))
    }
}

/// Try the launcher, falling back to printing the URL
pub(crate) fn present(browser: &dyn BrowserLauncher, url: &str) {
    match browser.open(url) {
        Ok(()) => info!("Opened browser for sign-in"),
        Err(e) => {
            warn!(error = %e, "Could not open a browser");
            println!("\nOpen this URL to sign in:\n  {url}\n");
        }
    }
}
