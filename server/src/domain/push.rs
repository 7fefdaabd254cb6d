//! Push receipts and the adapter registry.
//!
//! For every accepted `{data}` the master topic materializes a receipt
//! naming each recipient with the number of sessions the message was already
//! delivered to. Adapters (FCM, webhooks, …) register by name at startup;
//! dispatch is strictly non-blocking — a slow adapter drops, it never stalls
//! a topic loop.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::Uid;

/// Per-recipient delivery data.
#[derive(Debug, Clone, Default)]
pub struct PushRecipient {
    /// Sessions of this user the message was fanned out to.
    pub delivered: usize,
    /// Cached total unread count, when known.
    pub unread: Option<i64>,
}

/// Payload common to all recipients of one receipt.
#[derive(Debug, Clone)]
pub struct PushPayload {
    pub topic: String,
    pub from: Option<String>,
    pub ts: DateTime<Utc>,
    pub seq: u64,
    pub content: Option<Value>,
}

/// One push notification fan-out.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub to: HashMap<Uid, PushRecipient>,
    /// Channel name for `is_chan` topics; reaches subscribers the server
    /// does not track individually.
    pub channel: Option<String>,
    pub payload: PushPayload,
}

impl Receipt {
    pub fn is_empty(&self) -> bool {
        self.to.is_empty() && self.channel.is_none()
    }
}

/// Channel membership change forwarded to adapters that track channels.
#[derive(Debug, Clone)]
pub struct ChannelReq {
    pub uid: Uid,
    pub channel: String,
    pub unsub: bool,
}

/// A push connector. Implementations must not block.
pub trait PushAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn push(&self, rcpt: &Receipt);

    fn channel_sub(&self, req: &ChannelReq);
}

/// Registry of push adapters, keyed by name at registration time.
#[derive(Default)]
pub struct Push {
    adapters: Vec<Arc<dyn PushAdapter>>,
}

impl Push {
    pub fn new() -> Self {
        Push::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn PushAdapter>) {
        if self.adapters.iter().any(|a| a.name() == adapter.name()) {
            tracing::warn!(adapter = adapter.name(), "push adapter already registered");
            return;
        }
        tracing::debug!(adapter = adapter.name(), "push adapter registered");
        self.adapters.push(adapter);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    /// Fan a receipt to all adapters. Receipts with nobody to notify are
    /// discarded here.
    pub fn push(&self, rcpt: Receipt) {
        if rcpt.is_empty() {
            return;
        }
        for adapter in &self.adapters {
            adapter.push(&rcpt);
        }
    }

    pub fn channel_sub(&self, req: ChannelReq) {
        for adapter in &self.adapters {
            adapter.channel_sub(&req);
        }
    }
}

/// Built-in adapter that logs receipts; stands in for real connectors in
/// development.
pub struct LogPushAdapter;

impl PushAdapter for LogPushAdapter {
    fn name(&self) -> &'static str {
        "log"
    }

    fn push(&self, rcpt: &Receipt) {
        tracing::debug!(
            topic = %rcpt.payload.topic,
            seq = rcpt.payload.seq,
            recipients = rcpt.to.len(),
            channel = rcpt.channel.as_deref().unwrap_or(""),
            "push receipt"
        );
    }

    fn channel_sub(&self, req: &ChannelReq) {
        tracing::debug!(
            user = %req.uid,
            channel = %req.channel,
            unsub = req.unsub,
            "channel membership change"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct CountingAdapter {
        pushes: Mutex<Vec<Receipt>>,
        chans: Mutex<Vec<ChannelReq>>,
    }

    impl PushAdapter for CountingAdapter {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn push(&self, rcpt: &Receipt) {
            self.pushes.lock().push(rcpt.clone());
        }

        fn channel_sub(&self, req: &ChannelReq) {
            self.chans.lock().push(req.clone());
        }
    }

    fn receipt(to: &[u64], channel: Option<&str>) -> Receipt {
        Receipt {
            to: to
                .iter()
                .map(|u| (Uid::new(*u), PushRecipient::default()))
                .collect(),
            channel: channel.map(str::to_string),
            payload: PushPayload {
                topic: "grp1".into(),
                from: None,
                ts: Utc::now(),
                seq: 1,
                content: None,
            },
        }
    }

    #[test]
    fn test_empty_receipt_discarded() {
        let adapter = Arc::new(CountingAdapter {
            pushes: Mutex::new(Vec::new()),
            chans: Mutex::new(Vec::new()),
        });
        let mut push = Push::new();
        push.register(adapter.clone());

        push.push(receipt(&[], None));
        assert!(adapter.pushes.lock().is_empty());

        push.push(receipt(&[1], None));
        push.push(receipt(&[], Some("chn1")));
        assert_eq!(adapter.pushes.lock().len(), 2);
    }

    #[test]
    fn test_duplicate_registration_ignored() {
        let adapter = Arc::new(CountingAdapter {
            pushes: Mutex::new(Vec::new()),
            chans: Mutex::new(Vec::new()),
        });
        let mut push = Push::new();
        push.register(adapter.clone());
        push.register(adapter.clone());
        assert_eq!(push.names(), vec!["counting"]);

        push.push(receipt(&[1], None));
        assert_eq!(adapter.pushes.lock().len(), 1);
    }

    #[test]
    fn test_channel_sub_forwarded() {
        let adapter = Arc::new(CountingAdapter {
            pushes: Mutex::new(Vec::new()),
            chans: Mutex::new(Vec::new()),
        });
        let mut push = Push::new();
        push.register(adapter.clone());
        push.channel_sub(ChannelReq {
            uid: Uid::new(4),
            channel: "chn1".into(),
            unsub: false,
        });
        assert_eq!(adapter.chans.lock().len(), 1);
    }
}
