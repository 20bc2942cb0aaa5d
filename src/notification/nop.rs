use crate::notification::event::{EventMeta, Notification, NotificationListener};

use async_trait::async_trait;

/// A listener that discards every notification. The default null object
/// used when a host connects without supplying its own listener, mirroring
/// the teacher's own `NopListener`.
#[derive(Debug, Default)]
pub struct NopListener {}

#[async_trait]
impl NotificationListener for NopListener {
    async fn receive(&self, _: Notification, _: EventMeta) {}
}
