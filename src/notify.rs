//! User-facing notification sink

use tracing::warn;

/// Somewhere to show a message to the user
///
/// The connection manager calls this at most once per activation.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, message: &str);
}

/// Shows notifications in the log, which is what a terminal user sees
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        warn!("{}", message);
    }
}

impl<F> Notifier for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn notify(&self, message: &str) {
        self(message)
    }
}
