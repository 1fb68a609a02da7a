// Notification seam. Transports (Slack, email, paging) live outside this
// repo; the daemon ships a log-backed implementation and everything else
// talks to the trait.

use async_trait::async_trait;
use log::{error, info, warn};
use metrics::counter;
use strum::{AsRefStr, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum NotifyLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum NotifyChannel {
    Ops,
    FundManager,
    VipApprovers,
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, level: NotifyLevel, channel: NotifyChannel, title: &str, body: &str);
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, level: NotifyLevel, channel: NotifyChannel, title: &str, body: &str) {
        counter!("meridian_notifications", "channel" => channel.as_ref().to_string())
            .increment(1);
        match level {
            NotifyLevel::Info => info!("[{}] {}: {}", channel, title, body),
            NotifyLevel::Warning => warn!("[{}] {}: {}", channel, title, body),
            NotifyLevel::Critical => error!("[{}] {}: {}", channel, title, body),
        }
    }
}
