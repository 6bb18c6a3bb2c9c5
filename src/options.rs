use serde::Deserialize;
use tokio::time::Duration;

use crate::video::*;

pub const DEFAULT_DRONE_HOST: &str = "192.168.10.1";
pub const CONTROL_UDP_PORT: u16 = 8889;
pub const VIDEO_UDP_PORT: u16 = 11111;

/// Tello drone connection and other usage options.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TelloOptions {
    pub drone_host: String,
    pub control_port: u16,
    /// Local address the command socket binds to.
    pub local_address: String,
    /// Local address the video stream is received on.
    pub video_address: String,
    pub timing: LinkTiming,
    #[serde(skip)]
    pub(crate) video: Option<VideoPipeline>,
}

impl Default for TelloOptions {
    fn default() -> Self {
        Self {
            drone_host: DEFAULT_DRONE_HOST.to_string(),
            control_port: CONTROL_UDP_PORT,
            local_address: format!("0.0.0.0:{CONTROL_UDP_PORT}"),
            video_address: format!("0.0.0.0:{VIDEO_UDP_PORT}"),
            timing: LinkTiming::default(),
            video: None,
        }
    }
}

impl TelloOptions {
    /// Loads options from a JSON document, missing fields take defaults.
    pub fn from_json(s: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn drone_address(&self) -> String {
        format!("{}:{}", self.drone_host, self.control_port)
    }

    /// Request video from the drone, decoded by `decoder` and scanned for
    /// markers by `detector` as frames arrive.
    ///
    /// *nb* As video is sent to the UDP broadcast address 0.0.0.0 this
    /// only works in AP mode, ie using the drone's own WiFi network
    ///
    /// Returns the slot the freshest frame and detection are published to
    ///
    pub fn with_video<D, M>(&mut self, decoder: D, detector: M) -> FrameSlot
    where
        D: FrameDecoder + Send + 'static,
        M: MarkerDetector + Send + 'static,
    {
        let (publisher, slot) = make_frame_slot();
        self.video = Some(VideoPipeline::new(decoder, detector, publisher));
        slot
    }
}

/// Fixed delays and limits of the command link.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkTiming {
    /// Minimum gap after each command so the drone's parser is not flooded.
    #[serde(with = "millis")]
    pub command_spacing: Duration,
    #[serde(with = "millis")]
    pub keepalive_poll: Duration,
    /// Idle time after which a keepalive is sent.
    #[serde(with = "millis")]
    pub keepalive_idle: Duration,
    /// Upper bound on waiting for the drone to acknowledge SDK mode.
    #[serde(with = "millis")]
    pub mode_entry_settle: Duration,
    #[serde(with = "millis")]
    pub join_timeout: Duration,
    #[serde(with = "millis")]
    pub query_timeout: Duration,
    #[serde(with = "millis")]
    pub video_read_timeout: Duration,
    pub max_video_failures: u32,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            command_spacing: Duration::from_millis(100),
            keepalive_poll: Duration::from_secs(1),
            keepalive_idle: Duration::from_secs(5),
            mode_entry_settle: Duration::from_secs(2),
            join_timeout: Duration::from_secs(1),
            query_timeout: Duration::from_secs(1),
            video_read_timeout: Duration::from_secs(1),
            max_video_failures: 5,
        }
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use tokio::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

pub(crate) mod secs {
    use serde::{Deserialize, Deserializer};
    use tokio::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_drone_access_point() {
        let options = TelloOptions::default();
        assert_eq!(options.drone_address(), "192.168.10.1:8889");
        assert_eq!(options.video_address, "0.0.0.0:11111");
        assert_eq!(options.timing.command_spacing, Duration::from_millis(100));
        assert_eq!(options.timing.keepalive_idle, Duration::from_secs(5));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let options = TelloOptions::from_json(
            r#"{ "drone_host": "127.0.0.1", "timing": { "mode_entry_settle": 250 } }"#,
        )
        .unwrap();
        assert_eq!(options.drone_address(), "127.0.0.1:8889");
        assert_eq!(options.timing.mode_entry_settle, Duration::from_millis(250));
        assert_eq!(options.timing.keepalive_poll, Duration::from_secs(1));
        assert!(options.video.is_none());
    }
}
