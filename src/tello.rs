use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio::{spawn, task};
use tracing::{debug, info, warn};

use crate::command::{parse_height_reply, Direction, Rotation, TelloCommand};
use crate::errors::{Result, TelloError};
use crate::options::{LinkTiming, TelloOptions};
use crate::video::{VideoListener, VideoPipeline};

const MAX_REPLY_SIZE: usize = 1024;
const REPLY_BACKLOG: usize = 64;
const MAX_CONNECT_ATTEMPTS: u32 = 10;

/// Lifecycle of the command link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Active,
    Stopping,
    Stopped,
}

// states
#[derive(Debug)]
pub struct Disconnected {
    options: TelloOptions,
}

#[derive(Debug)]
pub struct Connected {
    link: Arc<Link>,
    workers: Mutex<Vec<task::JoinHandle<()>>>,
    video: tokio::sync::Mutex<VideoState>,
    video_address: String,
}

#[derive(Debug)]
enum VideoState {
    Off(Option<VideoPipeline>),
    On(VideoListener),
}

/// Shared between the caller and the keepalive and reply workers.
#[derive(Debug)]
struct Link {
    sock: RwLock<Option<Arc<UdpSocket>>>,
    timing: LinkTiming,
    epoch: Instant,
    last_command_ms: AtomicI64,
    airborne: AtomicBool,
    send_gate: tokio::sync::Mutex<()>,
    state: watch::Sender<LinkState>,
    replies: broadcast::Sender<String>,
}

#[derive(Debug)]
pub struct Tello<S = Disconnected> {
    state: S,
}

impl Tello<Disconnected> {
    pub fn new() -> Self {
        Self::with_options(TelloOptions::default())
    }

    pub fn with_options(options: TelloOptions) -> Self {
        Self { state: Disconnected { options } }
    }

    /// Opens the command link with default options.
    pub async fn connect(self) -> Result<Tello<Connected>> {
        self.start().await
    }

    pub async fn connect_with(options: TelloOptions) -> Result<Tello<Connected>> {
        Self::with_options(options).start().await
    }

    /// Binds the command socket, starts the reply and keepalive workers
    /// and puts the drone in SDK mode.
    pub async fn start(self) -> Result<Tello<Connected>> {
        let mut options = self.state.options;
        let local_address = options.local_address.clone();
        let drone_address = options.drone_address();

        info!("[Tello] CONNECT {local_address} → {drone_address}");

        // failing to open the socket is fatal
        let sock = UdpSocket::bind(&local_address).await?;

        let mut i = 0;
        loop {
            i += 1;
            match sock.connect(&drone_address).await {
                Ok(_) => break,
                Err(err) if i < MAX_CONNECT_ATTEMPTS => {
                    warn!("[Tello] connection attempt #{i} failed ({err}), retrying...");
                    sleep(Duration::from_millis(100)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let (state, _) = watch::channel(LinkState::Active);
        let (replies, _) = broadcast::channel(REPLY_BACKLOG);
        let sock = Arc::new(sock);

        let link = Arc::new(Link {
            sock: RwLock::new(Some(sock.clone())),
            timing: options.timing.clone(),
            epoch: Instant::now(),
            last_command_ms: AtomicI64::new(0),
            airborne: AtomicBool::new(false),
            send_gate: tokio::sync::Mutex::new(()),
            state,
            replies,
        });

        let workers = vec![
            spawn(receive_replies(link.clone(), sock)),
            spawn(keep_alive(link.clone())),
        ];

        let drone = Tello {
            state: Connected {
                link,
                workers: Mutex::new(workers),
                video: tokio::sync::Mutex::new(VideoState::Off(options.video.take())),
                video_address: options.video_address.clone(),
            },
        };

        info!("[Tello] putting drone in command mode...");
        if let Err(err) = drone.enter_sdk_mode().await {
            drone.close().await?;
            return Err(err);
        }

        info!("[Tello] CONNECTED");

        Ok(drone)
    }
}

impl Default for Tello<Disconnected> {
    fn default() -> Self {
        Self::new()
    }
}

impl Tello<Connected> {
    async fn enter_sdk_mode(&self) -> Result<()> {
        let settle = self.state.link.timing.mode_entry_settle;
        let mut replies = self.subscribe_replies();
        self.send(&TelloCommand::EnterSdkMode).await?;

        let acknowledged = timeout(settle, async {
            loop {
                match replies.recv().await {
                    Ok(reply) if reply.eq_ignore_ascii_case("ok") => return true,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await;

        if !matches!(acknowledged, Ok(true)) {
            warn!("[Tello] no acknowledgement of command mode within {settle:?}, continuing");
        }
        Ok(())
    }

    /// Sends a command, then holds the link for the command spacing so
    /// the drone's parser is never flooded.
    pub async fn send(&self, command: &TelloCommand) -> Result<()> {
        self.state.link.transmit(command).await
    }

    /// Every reply from the drone, in arrival order. Replies carry no
    /// sequence numbers so they are not matched to commands.
    pub fn subscribe_replies(&self) -> broadcast::Receiver<String> {
        self.state.link.replies.subscribe()
    }

    pub fn link_state(&self) -> LinkState {
        *self.state.link.state.borrow()
    }

    pub fn is_airborne(&self) -> bool {
        self.state.link.airborne.load(Ordering::SeqCst)
    }

    /// Lands, stops the workers and releases the socket. Safe to call more
    /// than once.
    ///
    /// `land` is sent on every close of a live link, even after an earlier
    /// `land`, since that datagram may have been lost. On the ground the
    /// drone ignores it.
    pub async fn close(&self) -> Result<()> {
        let link = &self.state.link;
        if *link.state.borrow() != LinkState::Active {
            return Ok(());
        }

        if self.is_airborne() {
            info!("[Tello] still airborne at close, landing");
        }
        if let Err(err) = self.land().await {
            warn!("[Tello] failed to send land during close ({err})");
        }

        let video = {
            let mut video = self.state.video.lock().await;
            std::mem::replace(&mut *video, VideoState::Off(None))
        };
        if let VideoState::On(listener) = video {
            if let Err(err) = self.send(&TelloCommand::StopVideo).await {
                warn!("[Tello] failed to send streamoff during close ({err})");
            }
            listener.stop_listening(link.timing.join_timeout).await;
        }

        {
            // no sends in flight past this point
            let _gate = link.send_gate.lock().await;
            if link.state.send_replace(LinkState::Stopping) != LinkState::Active {
                return Ok(());
            }
        }
        info!("[Tello] CLOSING");

        let workers: Vec<_> = match self.state.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for worker in workers {
            let abort = worker.abort_handle();
            if timeout(link.timing.join_timeout, worker).await.is_err() {
                warn!("[Tello] worker did not stop within {:?}, aborting", link.timing.join_timeout);
                abort.abort();
            }
        }

        link.release();
        link.state.send_replace(LinkState::Stopped);
        info!("[Tello] CLOSED");
        Ok(())
    }

    pub async fn take_off(&self) -> Result<()> {
        self.send(&TelloCommand::TakeOff).await
    }

    pub async fn land(&self) -> Result<()> {
        self.send(&TelloCommand::Land).await
    }

    pub async fn stop_and_hover(&self) -> Result<()> {
        self.send(&TelloCommand::StopAndHover).await
    }

    /// Stops all motors immediately, the drone will drop like a brick.
    pub async fn emergency_stop(&self) -> Result<()> {
        self.send(&TelloCommand::EmergencyStop).await
    }

    pub async fn move_in(&self, direction: Direction, distance: u16) -> Result<()> {
        self.send(&TelloCommand::Move { direction, distance }).await
    }

    pub async fn move_forward(&self, distance: u16) -> Result<()> {
        self.move_in(Direction::Forward, distance).await
    }

    pub async fn move_back(&self, distance: u16) -> Result<()> {
        self.move_in(Direction::Back, distance).await
    }

    pub async fn move_left(&self, distance: u16) -> Result<()> {
        self.move_in(Direction::Left, distance).await
    }

    pub async fn move_right(&self, distance: u16) -> Result<()> {
        self.move_in(Direction::Right, distance).await
    }

    pub async fn move_up(&self, distance: u16) -> Result<()> {
        self.move_in(Direction::Up, distance).await
    }

    pub async fn move_down(&self, distance: u16) -> Result<()> {
        self.move_in(Direction::Down, distance).await
    }

    pub async fn turn_clockwise(&self, degrees: u16) -> Result<()> {
        self.send(&TelloCommand::Turn { rotation: Rotation::Clockwise, degrees }).await
    }

    pub async fn turn_counter_clockwise(&self, degrees: u16) -> Result<()> {
        self.send(&TelloCommand::Turn { rotation: Rotation::CounterClockwise, degrees }).await
    }

    /// Continuous rates, each in [-100, 100].
    pub async fn remote_control(&self, left_right: i8, forwards_backwards: i8, up_down: i8, yaw: i8) -> Result<()> {
        self.send(&TelloCommand::RemoteControl { left_right, forwards_backwards, up_down, yaw }).await
    }

    /// Sets the cruise speed in cm/s. Values outside 10-100 are rejected
    /// without anything being sent.
    pub async fn set_speed(&self, speed: i32) -> Result<()> {
        let command = TelloCommand::speed(speed).map_err(|err| {
            warn!("[Tello] {err}");
            err
        })?;
        self.send(&command).await
    }

    /// Asks the drone for its height in cm. `None` if no height reply
    /// arrives within the query timeout.
    pub async fn query_height(&self) -> Result<Option<u32>> {
        let limit = self.state.link.timing.query_timeout;
        let mut replies = self.subscribe_replies();
        self.send(&TelloCommand::QueryHeight).await?;

        let height = timeout(limit, async {
            loop {
                match replies.recv().await {
                    Ok(reply) => {
                        if let Ok(cm) = parse_height_reply(&reply) {
                            return Some(cm);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await;

        Ok(height.ok().flatten())
    }

    /// Turns on the video stream and starts receiving it, if video was
    /// requested in the options.
    pub async fn start_video(&self) -> Result<()> {
        self.send(&TelloCommand::StartVideo).await?;

        let mut video = self.state.video.lock().await;
        if let VideoState::Off(pipeline) = &mut *video {
            if let Some(pipeline) = pipeline.take() {
                let timing = &self.state.link.timing;
                let listener = VideoListener::start_listening(
                    &self.state.video_address,
                    pipeline,
                    timing.video_read_timeout,
                    timing.max_video_failures,
                )
                .await?;
                *video = VideoState::On(listener);
            }
        }
        Ok(())
    }

    /// Address the video stream is being received on, once started.
    pub async fn video_local_address(&self) -> Option<SocketAddr> {
        match &*self.state.video.lock().await {
            VideoState::On(listener) => Some(listener.local_address()),
            VideoState::Off(_) => None,
        }
    }

    /// Turns off the video stream. The frame pipeline is not restarted by
    /// a later `start_video`.
    pub async fn stop_video(&self) -> Result<()> {
        self.send(&TelloCommand::StopVideo).await?;

        let video = {
            let mut video = self.state.video.lock().await;
            std::mem::replace(&mut *video, VideoState::Off(None))
        };
        if let VideoState::On(listener) = video {
            listener.stop_listening(self.state.link.timing.join_timeout).await;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_command(&self, idle: Duration) {
        let link = &self.state.link;
        let now = link.millis_since_epoch(Instant::now());
        link.last_command_ms.store(now - idle.as_millis() as i64, Ordering::SeqCst);
    }
}

/// Issues commands to the vehicle.
#[allow(async_fn_in_trait)]
pub trait CommandLink {
    async fn send(&self, command: &TelloCommand) -> Result<()>;
}

impl CommandLink for Tello<Connected> {
    async fn send(&self, command: &TelloCommand) -> Result<()> {
        Tello::<Connected>::send(self, command).await
    }
}

impl Link {
    fn socket(&self) -> Option<Arc<UdpSocket>> {
        match self.sock.read() {
            Ok(sock) => sock.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn release(&self) {
        match self.sock.write() {
            Ok(mut sock) => *sock = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    fn millis_since_epoch(&self, at: Instant) -> i64 {
        at.saturating_duration_since(self.epoch).as_millis() as i64
    }

    fn touch(&self) {
        self.last_command_ms.store(self.millis_since_epoch(Instant::now()), Ordering::SeqCst);
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let last = self.last_command_ms.load(Ordering::SeqCst);
        Duration::from_millis((self.millis_since_epoch(now) - last).max(0) as u64)
    }

    async fn transmit(&self, command: &TelloCommand) -> Result<()> {
        let _gate = self.send_gate.lock().await;

        if !self.is_active() {
            return Err(TelloError::LinkClosed);
        }
        let sock = self.socket().ok_or(TelloError::LinkClosed)?;

        self.touch();
        let msg = command.to_string();
        info!("[Tello] SEND {msg}");
        sock.send(msg.as_bytes()).await?;

        match command {
            TelloCommand::TakeOff => self.airborne.store(true, Ordering::SeqCst),
            TelloCommand::Land | TelloCommand::EmergencyStop => self.airborne.store(false, Ordering::SeqCst),
            _ => {}
        }

        sleep(self.timing.command_spacing).await;
        Ok(())
    }

    fn is_active(&self) -> bool {
        *self.state.borrow() == LinkState::Active
    }
}

pub(crate) fn keepalive_due(idle: Duration, threshold: Duration) -> bool {
    idle > threshold
}

async fn keep_alive(link: Arc<Link>) {
    let mut state = link.state.subscribe();

    while link.is_active() {
        tokio::select! {
            _ = sleep(link.timing.keepalive_poll) => {}
            r = state.changed() => if r.is_err() { break },
        }
        if !link.is_active() {
            break;
        }

        let idle = link.idle_for(Instant::now());
        if keepalive_due(idle, link.timing.keepalive_idle) {
            debug!("[Tello] idle for {idle:?}, sending keepalive");
            match link.transmit(&TelloCommand::EnterSdkMode).await {
                Ok(()) | Err(TelloError::LinkClosed) => {}
                Err(err) => warn!("[Tello] keepalive failed ({err})"),
            }
        }
    }
    debug!("[Tello] keepalive stopped");
}

async fn receive_replies(link: Arc<Link>, sock: Arc<UdpSocket>) {
    let mut state = link.state.subscribe();
    let mut buf = vec![0; MAX_REPLY_SIZE];

    while link.is_active() {
        tokio::select! {
            r = state.changed() => if r.is_err() { break } else { continue },
            r = sock.recv(&mut buf) => match r {
                Ok(n) => {
                    let reply = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                    info!("[Tello] RECEIVED {reply}");
                    // nobody listening is fine
                    let _ = link.replies.send(reply);
                }
                Err(err) => {
                    warn!("[Tello] receiving reply failed ({err})");
                    sleep(Duration::from_millis(10)).await;
                }
            },
        }
    }
    debug!("[Tello] reply receiver stopped");
}
