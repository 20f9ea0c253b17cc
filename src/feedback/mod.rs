// RTCP feedback message demultiplexing
//
// This module classifies RTCP feedback messages (RFC 4585) seen on the control
// channel and dispatches them to registered listeners.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

/// RTCP transport layer feedback packet type (RTPFB)
pub const PT_RTPFB: u8 = 205;

/// RTCP payload-specific feedback packet type (PSFB)
pub const PT_PSFB: u8 = 206;

/// Smallest RTCP feedback message: header, sender SSRC and media SSRC
pub const MIN_FEEDBACK_LENGTH: usize = 12;

/// Feedback message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedbackKind {
    /// Generic NACK
    Nack,
    /// Temporary maximum media stream bitrate request
    Tmmbr,
    /// Temporary maximum media stream bitrate notification
    Tmmbn,
    /// Picture loss indication
    Pli,
    /// Slice loss indication
    Sli,
    /// Reference picture selection indication
    Rpsi,
    /// Full intra request
    Fir,
    /// Application layer feedback, REMB among others
    ApplicationLayer,
    /// Anything else
    Other,
}

/// Feedback message observed on the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackMessageEvent {
    /// Feedback message type (FMT), the low five bits of the first byte
    pub format: u8,
    /// RTCP packet type, RTPFB or PSFB
    pub payload_type: u8,
    /// SSRC of the packet sender
    pub sender_ssrc: u32,
    /// SSRC of the media source the feedback refers to
    pub media_ssrc: u32,
}

impl FeedbackMessageEvent {
    /// Parse the feedback header of a raw RTCP packet
    ///
    /// Returns `None` for packets shorter than a feedback header and for RTCP
    /// packet types other than RTPFB and PSFB.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < MIN_FEEDBACK_LENGTH {
            return None;
        }

        let payload_type = data[1];
        if payload_type != PT_RTPFB && payload_type != PT_PSFB {
            return None;
        }

        Some(Self {
            format: data[0] & 0x1F,
            payload_type,
            sender_ssrc: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            media_ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// Classify the message by payload type and format
    pub fn kind(&self) -> FeedbackKind {
        match (self.payload_type, self.format) {
            (PT_RTPFB, 1) => FeedbackKind::Nack,
            (PT_RTPFB, 3) => FeedbackKind::Tmmbr,
            (PT_RTPFB, 4) => FeedbackKind::Tmmbn,
            (PT_PSFB, 1) => FeedbackKind::Pli,
            (PT_PSFB, 2) => FeedbackKind::Sli,
            (PT_PSFB, 3) => FeedbackKind::Rpsi,
            (PT_PSFB, 4) => FeedbackKind::Fir,
            (PT_PSFB, 15) => FeedbackKind::ApplicationLayer,
            _ => FeedbackKind::Other,
        }
    }
}

/// Receives feedback messages from a control input stream
///
/// Called synchronously on the stream's receive task; must not block.
pub trait FeedbackMessageListener: Send + Sync {
    /// Handle a feedback message
    fn feedback_message_received(&self, event: &FeedbackMessageEvent);
}

/// Set of feedback listeners with idempotent registration
#[derive(Default)]
pub struct FeedbackListeners {
    listeners: RwLock<Vec<Arc<dyn FeedbackMessageListener>>>,
}

impl FeedbackListeners {
    /// Create an empty listener set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener; adding one already present does nothing
    pub fn add(&self, listener: Arc<dyn FeedbackMessageListener>) {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Remove a listener; removing one not present does nothing
    pub fn remove(&self, listener: &Arc<dyn FeedbackMessageListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Get the number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Check whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Inspect raw RTCP bytes and notify every listener if they carry feedback
    ///
    /// Returns the parsed event, if any.
    pub fn dispatch(&self, data: &[u8]) -> Option<FeedbackMessageEvent> {
        let event = FeedbackMessageEvent::parse(data)?;

        // Snapshot so listeners may add or remove themselves while handling
        let listeners = self.listeners.read().clone();
        if listeners.is_empty() {
            return Some(event);
        }

        tracing::trace!("Dispatching {:?} feedback to {} listener(s)", event.kind(), listeners.len());
        for listener in &listeners {
            listener.feedback_message_received(&event);
        }

        Some(event)
    }
}

/// Listener forwarding feedback messages into an async channel
pub struct FeedbackChannel {
    /// Sender for observed feedback messages
    feedback_tx: mpsc::Sender<FeedbackMessageEvent>,
}

impl FeedbackChannel {
    /// Create a feedback channel and the receiver draining it
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<FeedbackMessageEvent>) {
        let (feedback_tx, feedback_rx) = mpsc::channel(capacity);
        (Arc::new(Self { feedback_tx }), feedback_rx)
    }
}

impl FeedbackMessageListener for FeedbackChannel {
    fn feedback_message_received(&self, event: &FeedbackMessageEvent) {
        // The receive task must not wait on a slow consumer
        if let Err(e) = self.feedback_tx.try_send(*event) {
            tracing::warn!("Dropping feedback message {:?}: {}", event.kind(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counter(AtomicUsize);

    impl FeedbackMessageListener for Counter {
        fn feedback_message_received(&self, _event: &FeedbackMessageEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pli() -> Vec<u8> {
        vec![0x81, PT_PSFB, 0x00, 0x02, 0, 0, 0, 1, 0, 0, 0, 2]
    }

    #[test]
    fn parses_feedback_header() {
        let event = FeedbackMessageEvent::parse(&pli()).unwrap();

        assert_eq!(event.format, 1);
        assert_eq!(event.payload_type, PT_PSFB);
        assert_eq!(event.sender_ssrc, 1);
        assert_eq!(event.media_ssrc, 2);
        assert_eq!(event.kind(), FeedbackKind::Pli);
    }

    #[test]
    fn ignores_short_and_non_feedback_packets() {
        assert!(FeedbackMessageEvent::parse(&pli()[..11]).is_none());

        let mut receiver_report = pli();
        receiver_report[1] = 201;
        assert!(FeedbackMessageEvent::parse(&receiver_report).is_none());
    }

    #[test]
    fn classifies_known_formats() {
        let kind = |payload_type, format| FeedbackMessageEvent {
            format,
            payload_type,
            sender_ssrc: 0,
            media_ssrc: 0,
        }
        .kind();

        assert_eq!(kind(PT_RTPFB, 1), FeedbackKind::Nack);
        assert_eq!(kind(PT_RTPFB, 3), FeedbackKind::Tmmbr);
        assert_eq!(kind(PT_PSFB, 4), FeedbackKind::Fir);
        assert_eq!(kind(PT_PSFB, 15), FeedbackKind::ApplicationLayer);
        assert_eq!(kind(PT_RTPFB, 9), FeedbackKind::Other);
    }

    #[test]
    fn registration_is_idempotent() {
        let listeners = FeedbackListeners::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let listener: Arc<dyn FeedbackMessageListener> = counter.clone();

        listeners.add(listener.clone());
        listeners.add(listener.clone());
        assert_eq!(listeners.len(), 1);

        listeners.dispatch(&pli());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        listeners.remove(&listener);
        listeners.remove(&listener);
        assert!(listeners.is_empty());

        listeners.dispatch(&pli());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_forwards_events() {
        let listeners = FeedbackListeners::new();
        let (channel, mut rx) = FeedbackChannel::new(4);
        listeners.add(channel);

        listeners.dispatch(&pli());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), FeedbackKind::Pli);
    }
}
