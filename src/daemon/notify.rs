//! Observer notifications
//!
//! Every state transition of the source and the three consumers is announced
//! on a broadcast channel, failure paths included.

use tokio::sync::broadcast;

use crate::hls::HlsState;
use crate::rtsp::RtspState;
use crate::source::SourceState;
use crate::upstream::UpstreamState;

/// Asynchronous notification for external observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Watchdog heartbeat
    Ping,
    SourceStateChanged(SourceState),
    RtspStateChanged(RtspState),
    HlsStateChanged(HlsState),
    UpstreamStateChanged(UpstreamState),
    /// Viewer count changed; `addr` is the newest peer, empty on a close
    RtspClientCountChanged { count: usize, addr: String },
    /// Query string supplied by the last viewer
    UriParametersChanged(String),
    /// Measured upstream throughput (kbit/s)
    TcpBitrate(u64),
    EncoderSignalLost,
    EncoderError(String),
}

impl Notification {
    /// Signal name on the control surface
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Ping => "ping",
            Notification::SourceStateChanged(_) => "sourceStateChanged",
            Notification::RtspStateChanged(_) => "rtspStateChanged",
            Notification::HlsStateChanged(_) => "hlsStateChanged",
            Notification::UpstreamStateChanged(_) => "upstreamStateChanged",
            Notification::RtspClientCountChanged { .. } => "rtspClientCountChanged",
            Notification::UriParametersChanged(_) => "uriParametersChanged",
            Notification::TcpBitrate(_) => "tcpBitrate",
            Notification::EncoderSignalLost => "encoderSignalLost",
            Notification::EncoderError(_) => "encoderError",
        }
    }
}

/// Sending half of the notification channel
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    /// Create a new notifier keeping up to `capacity` undelivered notifications
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, notification: Notification) {
        tracing::debug!(signal = notification.name(), ?notification, "notify");
        // No subscribers is fine
        let _ = self.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.publish(Notification::TcpBitrate(718));
        notifier.publish(Notification::Ping);

        assert_eq!(rx.recv().await.unwrap(), Notification::TcpBitrate(718));
        assert_eq!(rx.recv().await.unwrap().name(), "ping");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let notifier = Notifier::new(1);
        notifier.publish(Notification::EncoderSignalLost);
        assert_eq!(notifier.subscriber_count(), 0);
    }
}
