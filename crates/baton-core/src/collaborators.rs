use async_trait::async_trait;

#[async_trait]
pub trait ModeSwitcher: Send + Sync {
    async fn switch_mode(&self, mode: &str) -> anyhow::Result<()>;
}

/// User-visible error surface. Fire and forget.
pub trait UiNotifier: Send + Sync {
    fn show_error(&self, message: &str);
}

/// Notifier for headless runs: errors only go to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl UiNotifier for LogNotifier {
    fn show_error(&self, message: &str) {
        tracing::error!(target: "baton.ui", "{message}");
    }
}
