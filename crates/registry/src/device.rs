//! Device and endpoint model.
//!
//! A device is one connected client (phone, desktop, speaker). Each
//! device carries one or more endpoints: capability-bearing sinks for
//! text deltas, audio frames, and events. Endpoints are shared by
//! reference; the registry owns the device records.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chorus_domain::Result;

/// What a device or endpoint can receive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub audio_sink: bool,
    #[serde(default)]
    pub audio_write: bool,
    #[serde(default)]
    pub text_sink: bool,
}

impl Capabilities {
    pub fn text_only() -> Self {
        Self {
            text_sink: true,
            ..Default::default()
        }
    }

    pub fn audio_only() -> Self {
        Self {
            audio_sink: true,
            audio_write: true,
            ..Default::default()
        }
    }

    pub fn full() -> Self {
        Self {
            audio_sink: true,
            audio_write: true,
            text_sink: true,
        }
    }

    /// True when every capability required is present (conjunction).
    pub fn satisfies(&self, required: &Capabilities) -> bool {
        (!required.audio_sink || self.audio_sink)
            && (!required.audio_write || self.audio_write)
            && (!required.text_sink || self.text_sink)
    }
}

/// A capability-bearing sink on a device.
///
/// Implementations wrap the underlying transport (a WebSocket writer
/// task, a test capture buffer). The endpoint owns its transport; the
/// registry only holds shared references.
#[async_trait::async_trait]
pub trait Endpoint: Send + Sync {
    fn id(&self) -> &str;
    fn caps(&self) -> Capabilities;
    fn is_alive(&self) -> bool;

    async fn send_text_delta(&self, session_id: &str, sequence: u64, text: &str) -> Result<()>;
    async fn send_audio_frame(&self, session_id: &str, sequence: u64, frame: Bytes) -> Result<()>;
    async fn send_event(
        &self,
        session_id: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<()>;

    /// Tear down the underlying transport. Idempotent.
    fn close(&self);
}

/// Registry entry pairing an endpoint with its activity clock.
#[derive(Clone)]
pub(crate) struct EndpointEntry {
    pub endpoint: Arc<dyn Endpoint>,
    pub last_active: DateTime<Utc>,
}

/// One connected client device and its endpoints.
pub struct Device {
    pub user_id: String,
    pub device_id: String,
    pub session_id: String,
    pub caps: Capabilities,
    pub last_active: DateTime<Utc>,
    pub(crate) endpoints: HashMap<String, EndpointEntry>,
}

impl Device {
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        session_id: impl Into<String>,
        caps: Capabilities,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            session_id: session_id.into(),
            caps,
            last_active: Utc::now(),
            endpoints: HashMap::new(),
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfies_is_a_conjunction() {
        let full = Capabilities::full();
        let audio = Capabilities::audio_only();
        let need_audio = Capabilities {
            audio_sink: true,
            ..Default::default()
        };
        let need_both = Capabilities {
            audio_sink: true,
            text_sink: true,
            ..Default::default()
        };

        assert!(full.satisfies(&need_both));
        assert!(audio.satisfies(&need_audio));
        assert!(!audio.satisfies(&need_both));
        // Empty requirement is satisfied by anything.
        assert!(Capabilities::default().satisfies(&Capabilities::default()));
    }
}
