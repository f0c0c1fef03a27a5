//! Fire-and-forget user notifications.
//!
//! Delivery is best-effort: [`send`] logs and swallows every failure so a
//! broken notification channel can never abort a sync run.

use async_trait::async_trait;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str, title: &str) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str, title: &str) -> anyhow::Result<()> {
        tracing::warn!(title = %title, "{}", message);
        Ok(())
    }
}

/// Deliver a notification if a sink is configured, ignoring failures.
pub async fn send(notifier: Option<&dyn Notifier>, message: &str, title: &str) {
    let Some(notifier) = notifier else {
        return;
    };
    if let Err(e) = notifier.notify(message, title).await {
        tracing::warn!(error = %e, title = %title, "Failed to deliver notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Broken(AtomicUsize);

    #[async_trait]
    impl Notifier for Broken {
        async fn notify(&self, _message: &str, _title: &str) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("channel closed")
        }
    }

    #[tokio::test]
    async fn failing_sink_is_swallowed() {
        let sink = Broken(AtomicUsize::new(0));
        send(Some(&sink), "hello", "title").await;
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_sink_is_noop() {
        send(None, "hello", "title").await;
        LogNotifier.notify("hello", "title").await.unwrap();
    }
}
