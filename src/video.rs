use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytebuffer::ByteBuffer;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{timeout, Duration, Instant};
use tokio::{spawn, task};
use tracing::{debug, info, warn};

use crate::errors::{Result, TelloError};
use crate::marker::{MarkerDetection, Point};

pub const VIDEO_WIDTH: u32 = 960;
pub const VIDEO_HEIGHT: u32 = 720;

const MAX_CHUNK_SIZE: usize = 1460;

/// A decoded frame of video.
#[derive(Debug)]
pub struct Frame {
    pub timestamp: Instant,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self { timestamp: Instant::now(), width, height, pixels }
    }

    pub fn center(&self) -> Point {
        Point::new(self.width as f64 / 2.0, self.height as f64 / 2.0)
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }
}

/// Turns the raw h264 stream, one reassembled frame at a time, into
/// pixels. `Ok(None)` means more data is needed.
pub trait FrameDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Option<Frame>>;
}

/// Finds a marker in a decoded frame.
pub trait MarkerDetector {
    fn detect(&mut self, frame: &Frame) -> Option<MarkerDetection>;
}

/// A frame together with what the detector saw in it.
#[derive(Debug, Clone)]
pub struct Observation {
    pub frame: Arc<Frame>,
    pub marker: Option<MarkerDetection>,
}

impl Observation {
    pub fn new(frame: Frame, marker: Option<MarkerDetection>) -> Self {
        Self { frame: Arc::new(frame), marker }
    }
}

/// The freshest output of the video pipeline.
#[derive(Debug, Clone, Default)]
pub enum FrameFeed {
    #[default]
    Waiting,
    Live(Arc<Observation>),
    Failed(String),
}

pub type FramePublisher = watch::Sender<FrameFeed>;

/// Read side of the single-slot frame hand-off. Readers always see a
/// complete observation, never one still being written.
#[derive(Debug, Clone)]
pub struct FrameSlot {
    rx: watch::Receiver<FrameFeed>,
}

pub fn make_frame_slot() -> (FramePublisher, FrameSlot) {
    let (tx, rx) = watch::channel(FrameFeed::Waiting);
    (tx, FrameSlot { rx })
}

impl FrameSlot {
    pub fn latest(&self) -> Option<Arc<Observation>> {
        match &*self.rx.borrow() {
            FrameFeed::Live(observation) => Some(observation.clone()),
            _ => None,
        }
    }

    pub fn latest_marker(&self) -> Option<MarkerDetection> {
        self.latest().and_then(|o| o.marker.clone())
    }

    /// Reason the feed stopped, if it has.
    pub fn failure(&self) -> Option<String> {
        match &*self.rx.borrow() {
            FrameFeed::Failed(msg) => Some(msg.clone()),
            _ => None,
        }
    }

    /// Waits until the first frame is published, bounded by `limit`.
    pub async fn wait_for_frame(&self, limit: Duration) -> Result<()> {
        let mut rx = self.rx.clone();
        let first_frame = async move {
            loop {
                match &*rx.borrow_and_update() {
                    FrameFeed::Live(_) => return Ok(()),
                    FrameFeed::Failed(msg) => return Err(TelloError::VideoFailed { msg: msg.clone() }),
                    FrameFeed::Waiting => {}
                }
                if rx.changed().await.is_err() {
                    return Err(TelloError::VideoFailed { msg: "video pipeline dropped".to_string() });
                }
            }
        };

        timeout(limit, first_frame)
            .await
            .map_err(|_| TelloError::VideoFailed { msg: format!("no frame within {limit:?}") })?
    }
}

/// Decoder, detector and the slot they feed.
pub struct VideoPipeline {
    decoder: Box<dyn FrameDecoder + Send>,
    detector: Box<dyn MarkerDetector + Send>,
    publisher: FramePublisher,
}

impl fmt::Debug for VideoPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoPipeline").finish_non_exhaustive()
    }
}

impl VideoPipeline {
    pub fn new<D, M>(decoder: D, detector: M, publisher: FramePublisher) -> Self
    where
        D: FrameDecoder + Send + 'static,
        M: MarkerDetector + Send + 'static,
    {
        Self { decoder: Box::new(decoder), detector: Box::new(detector), publisher }
    }

    fn process(&mut self, data: &[u8]) -> std::result::Result<(), String> {
        match self.decoder.decode(data) {
            Ok(Some(frame)) => {
                let marker = self.detector.detect(&frame);
                self.publisher.send_replace(FrameFeed::Live(Arc::new(Observation::new(frame, marker))));
                Ok(())
            }
            Ok(None) => {
                debug!("incomplete frame, dropped");
                Ok(())
            }
            Err(err) => Err(format!("decoder error - {err}")),
        }
    }

    fn fail(&self, msg: String) {
        self.publisher.send_replace(FrameFeed::Failed(msg));
    }
}

#[derive(Debug)]
pub(crate) struct VideoListener {
    task: task::JoinHandle<()>,
    stop: watch::Sender<bool>,
    local_address: SocketAddr,
}

impl VideoListener {
    pub(crate) async fn start_listening(
        address: &str,
        mut pipeline: VideoPipeline,
        read_timeout: Duration,
        max_failures: u32,
    ) -> Result<Self> {
        let sock = UdpSocket::bind(address).await?;
        let local_address = sock.local_addr()?;
        info!("[Video] START LISTENING at {local_address}");

        let (stop, mut stop_rx) = watch::channel(false);

        let task = spawn(async move {
            let mut buf = ByteBuffer::new();
            let mut chunk = vec![0; MAX_CHUNK_SIZE];
            let mut failures = 0;

            loop {
                let received = tokio::select! {
                    _ = stop_rx.changed() => break,
                    r = timeout(read_timeout, sock.recv(&mut chunk)) => r,
                };

                let outcome = match received {
                    Err(_) => Err(format!("no video for {read_timeout:?}")),
                    Ok(Err(err)) => Err(format!("receive failed - {err}")),
                    Ok(Ok(0)) => Ok(()),
                    Ok(Ok(n)) => {
                        buf.write_bytes(&chunk[..n]);

                        // a short chunk ends the frame
                        if n < MAX_CHUNK_SIZE {
                            let frame = std::mem::replace(&mut buf, ByteBuffer::new()).into_vec();
                            pipeline.process(&frame)
                        } else {
                            Ok(())
                        }
                    }
                };

                match outcome {
                    Ok(()) => failures = 0,
                    Err(msg) => {
                        failures += 1;
                        warn!("[Video] frame error ({failures}/{max_failures}) - {msg}");
                        if failures >= max_failures {
                            warn!("[Video] giving up on video feed");
                            pipeline.fail(msg);
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self { task, stop, local_address })
    }

    pub(crate) fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub(crate) async fn stop_listening(self, join_timeout: Duration) {
        info!("[Video] STOP LISTENING");
        let _ = self.stop.send(true);

        let abort = self.task.abort_handle();
        if timeout(join_timeout, self.task).await.is_err() {
            warn!("[Video] listener did not stop within {join_timeout:?}, aborting");
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct LengthDecoder {
        lengths: Arc<Mutex<Vec<usize>>>,
    }

    impl FrameDecoder for LengthDecoder {
        fn decode(&mut self, data: &[u8]) -> Result<Option<Frame>> {
            self.lengths.lock().unwrap().push(data.len());
            Ok(Some(Frame::new(VIDEO_WIDTH, VIDEO_HEIGHT, vec![])))
        }
    }

    struct BrokenDecoder;

    impl FrameDecoder for BrokenDecoder {
        fn decode(&mut self, _data: &[u8]) -> Result<Option<Frame>> {
            Err(TelloError::Generic { msg: "corrupt".to_string() })
        }
    }

    struct FixedDetector;

    impl MarkerDetector for FixedDetector {
        fn detect(&mut self, _frame: &Frame) -> Option<MarkerDetection> {
            MarkerDetection::new(
                "5",
                vec![Point::new(0.0, 0.0), Point::new(2.0, 0.0), Point::new(2.0, 2.0), Point::new(0.0, 2.0)],
            )
        }
    }

    async fn sender_to(listener: &VideoListener) -> UdpSocket {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.connect(("127.0.0.1", listener.local_address().port())).await.unwrap();
        sock
    }

    #[tokio::test]
    async fn reassembles_chunks_into_frames() {
        let lengths = Arc::new(Mutex::new(vec![]));
        let (publisher, slot) = make_frame_slot();
        let pipeline = VideoPipeline::new(LengthDecoder { lengths: lengths.clone() }, FixedDetector, publisher);
        let listener = VideoListener::start_listening("127.0.0.1:0", pipeline, Duration::from_secs(5), 3)
            .await
            .unwrap();

        let sock = sender_to(&listener).await;
        sock.send(&[1u8; MAX_CHUNK_SIZE]).await.unwrap();
        sock.send(&[2u8; 10]).await.unwrap();

        slot.wait_for_frame(Duration::from_secs(2)).await.unwrap();

        assert_eq!(*lengths.lock().unwrap(), vec![MAX_CHUNK_SIZE + 10]);
        let observation = slot.latest().unwrap();
        assert_eq!(observation.frame.center(), Point::new(480.0, 360.0));
        assert_eq!(slot.latest_marker().unwrap().value, "5");

        listener.stop_listening(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn persistent_decode_failure_marks_feed_failed() {
        let (publisher, slot) = make_frame_slot();
        let pipeline = VideoPipeline::new(BrokenDecoder, FixedDetector, publisher);
        let listener = VideoListener::start_listening("127.0.0.1:0", pipeline, Duration::from_secs(5), 2)
            .await
            .unwrap();

        let sock = sender_to(&listener).await;
        sock.send(b"bad").await.unwrap();
        sock.send(b"bad").await.unwrap();

        let err = slot.wait_for_frame(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, TelloError::VideoFailed { .. }));
        assert!(slot.failure().unwrap().contains("corrupt"));
        assert!(slot.latest().is_none());

        listener.stop_listening(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn wait_for_frame_times_out_without_video() {
        let (_publisher, slot) = make_frame_slot();
        let err = slot.wait_for_frame(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, TelloError::VideoFailed { .. }));
    }
}
