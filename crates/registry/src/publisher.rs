//! Thin routing layer over the registry.
//!
//! Text deltas fan out to every `text_sink` endpoint, audio frames go
//! to the MRU `audio_sink` endpoint, events broadcast to every alive
//! endpoint. The publisher never retries and never buffers;
//! backpressure is the endpoint's concern.

use std::sync::Arc;

use bytes::Bytes;

use chorus_domain::{Error, Result};

use crate::device::Capabilities;
use crate::registry::DeviceRegistry;

#[derive(Clone)]
pub struct Publisher {
    registry: Arc<DeviceRegistry>,
}

impl Publisher {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Deliver a text delta to every text-capable endpoint of the
    /// user. Per-endpoint failures are logged and never abort the
    /// fan-out. Fails only when the fan-out set is empty.
    pub async fn send_text_delta(
        &self,
        user_id: &str,
        session_id: &str,
        sequence: u64,
        text: &str,
    ) -> Result<()> {
        let endpoints = self.registry.text_fanout_endpoints(user_id);
        if endpoints.is_empty() {
            return Err(Error::NoEndpoints(format!("no text sinks for {user_id}")));
        }
        for ep in endpoints {
            if let Err(e) = ep.send_text_delta(session_id, sequence, text).await {
                tracing::warn!(
                    user_id = %user_id,
                    endpoint_id = %ep.id(),
                    error = %e,
                    "text delta delivery failed"
                );
            }
        }
        Ok(())
    }

    /// Deliver an audio frame to the most-recently-used audio sink.
    pub async fn send_audio_frame(
        &self,
        user_id: &str,
        session_id: &str,
        sequence: u64,
        frame: Bytes,
    ) -> Result<()> {
        let required = Capabilities {
            audio_sink: true,
            ..Default::default()
        };
        let ep = self
            .registry
            .select_endpoint_mru(user_id, required)
            .ok_or_else(|| Error::NoEndpoints(format!("no audio sinks for {user_id}")))?;
        if !ep.is_alive() {
            return Err(Error::EndpointDead(ep.id().to_string()));
        }
        ep.send_audio_frame(session_id, sequence, frame)
            .await
            .map_err(|e| Error::EndpointDead(format!("{}: {e}", ep.id())))
    }

    /// Broadcast a named event to every alive endpoint of the user.
    /// Per-endpoint errors are swallowed.
    pub async fn send_event(
        &self,
        user_id: &str,
        session_id: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        for ep in self.registry.list_user_endpoints(user_id) {
            if !ep.is_alive() {
                continue;
            }
            if let Err(e) = ep.send_event(session_id, name, payload.clone()).await {
                tracing::debug!(
                    user_id = %user_id,
                    endpoint_id = %ep.id(),
                    event = %name,
                    error = %e,
                    "event delivery failed"
                );
            }
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::{Device, Endpoint};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Test endpoint capturing everything sent to it.
    pub(crate) struct CaptureEndpoint {
        id: String,
        caps: Capabilities,
        alive: AtomicBool,
        pub fail_sends: bool,
        pub texts: Mutex<Vec<(u64, String)>>,
        pub frames: Mutex<Vec<(u64, Bytes)>>,
        pub events: Mutex<Vec<String>>,
    }

    impl CaptureEndpoint {
        pub(crate) fn new(id: &str, caps: Capabilities) -> Self {
            Self {
                id: id.to_string(),
                caps,
                alive: AtomicBool::new(true),
                fail_sends: false,
                texts: Mutex::new(Vec::new()),
                frames: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing(id: &str, caps: Capabilities) -> Self {
            Self {
                fail_sends: true,
                ..Self::new(id, caps)
            }
        }
    }

    #[async_trait::async_trait]
    impl Endpoint for CaptureEndpoint {
        fn id(&self) -> &str {
            &self.id
        }
        fn caps(&self) -> Capabilities {
            self.caps
        }
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::Acquire)
        }

        async fn send_text_delta(
            &self,
            _session_id: &str,
            sequence: u64,
            text: &str,
        ) -> Result<()> {
            if self.fail_sends {
                return Err(Error::EndpointDead(self.id.clone()));
            }
            self.texts.lock().push((sequence, text.to_string()));
            Ok(())
        }

        async fn send_audio_frame(
            &self,
            _session_id: &str,
            sequence: u64,
            frame: Bytes,
        ) -> Result<()> {
            if self.fail_sends {
                return Err(Error::EndpointDead(self.id.clone()));
            }
            self.frames.lock().push((sequence, frame));
            Ok(())
        }

        async fn send_event(
            &self,
            _session_id: &str,
            name: &str,
            _payload: serde_json::Value,
        ) -> Result<()> {
            if self.fail_sends {
                return Err(Error::EndpointDead(self.id.clone()));
            }
            self.events.lock().push(name.to_string());
            Ok(())
        }

        fn close(&self) {
            self.alive.store(false, Ordering::Release);
        }
    }

    fn setup() -> (Arc<DeviceRegistry>, Publisher) {
        let registry = Arc::new(DeviceRegistry::new());
        let publisher = Publisher::new(registry.clone());
        (registry, publisher)
    }

    #[tokio::test]
    async fn text_fanout_reaches_every_sink_despite_failures() {
        let (registry, publisher) = setup();
        registry.upsert_device(Device::new("u1", "d1", "s1", Capabilities::full()));

        let ok_a = Arc::new(CaptureEndpoint::new("a", Capabilities::text_only()));
        let bad = Arc::new(CaptureEndpoint::failing("bad", Capabilities::text_only()));
        let ok_b = Arc::new(CaptureEndpoint::new("b", Capabilities::text_only()));
        registry.attach_endpoint("u1", "d1", ok_a.clone()).unwrap();
        registry.attach_endpoint("u1", "d1", bad).unwrap();
        registry.attach_endpoint("u1", "d1", ok_b.clone()).unwrap();

        publisher
            .send_text_delta("u1", "s1", 3, "hello")
            .await
            .unwrap();

        assert_eq!(ok_a.texts.lock().as_slice(), &[(3, "hello".to_string())]);
        assert_eq!(ok_b.texts.lock().as_slice(), &[(3, "hello".to_string())]);
    }

    #[tokio::test]
    async fn text_fanout_with_no_sinks_is_no_endpoints() {
        let (registry, publisher) = setup();
        registry.upsert_device(Device::new("u1", "d1", "s1", Capabilities::audio_only()));

        let err = publisher
            .send_text_delta("u1", "s1", 1, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoEndpoints(_)));
    }

    #[tokio::test]
    async fn audio_goes_to_mru_and_follows_touch() {
        let (registry, publisher) = setup();
        registry.upsert_device(Device::new("u1", "da", "s1", Capabilities::audio_only()));
        registry.upsert_device(Device::new("u1", "db", "s1", Capabilities::audio_only()));

        let a = Arc::new(CaptureEndpoint::new("a", Capabilities::audio_only()));
        let b = Arc::new(CaptureEndpoint::new("b", Capabilities::audio_only()));
        registry.attach_endpoint("u1", "da", a.clone()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.attach_endpoint("u1", "db", b.clone()).unwrap();

        publisher
            .send_audio_frame("u1", "s1", 1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(b.frames.lock().len(), 1);
        assert_eq!(a.frames.lock().len(), 0);

        // Touching device A moves the MRU pointer back to A.
        registry.touch_device("u1", "da").unwrap();
        publisher
            .send_audio_frame("u1", "s1", 2, Bytes::from_static(b"y"))
            .await
            .unwrap();
        assert_eq!(a.frames.lock().len(), 1);
    }

    #[tokio::test]
    async fn audio_without_sink_is_no_endpoints() {
        let (registry, publisher) = setup();
        registry.upsert_device(Device::new("u1", "d1", "s1", Capabilities::text_only()));
        registry
            .attach_endpoint(
                "u1",
                "d1",
                Arc::new(CaptureEndpoint::new("t", Capabilities::text_only())),
            )
            .unwrap();

        let err = publisher
            .send_audio_frame("u1", "s1", 1, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoEndpoints(_)));
    }

    #[tokio::test]
    async fn dead_audio_endpoint_is_reported() {
        let (registry, publisher) = setup();
        registry.upsert_device(Device::new("u1", "d1", "s1", Capabilities::audio_only()));
        let ep = Arc::new(CaptureEndpoint::new("a", Capabilities::audio_only()));
        registry.attach_endpoint("u1", "d1", ep.clone()).unwrap();
        ep.close();

        let err = publisher
            .send_audio_frame("u1", "s1", 1, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EndpointDead(_)));
    }

    #[tokio::test]
    async fn events_broadcast_to_alive_endpoints_only() {
        let (registry, publisher) = setup();
        registry.upsert_device(Device::new("u1", "d1", "s1", Capabilities::full()));
        let alive = Arc::new(CaptureEndpoint::new("alive", Capabilities::full()));
        let dead = Arc::new(CaptureEndpoint::new("dead", Capabilities::full()));
        registry.attach_endpoint("u1", "d1", alive.clone()).unwrap();
        registry.attach_endpoint("u1", "d1", dead.clone()).unwrap();
        dead.close();

        publisher
            .send_event("u1", "s1", "listening_state", serde_json::json!({"mode": "active"}))
            .await
            .unwrap();

        assert_eq!(alive.events.lock().as_slice(), &["listening_state".to_string()]);
        assert!(dead.events.lock().is_empty());
    }
}
