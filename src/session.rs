use crate::client::{CameraClient, CameraClientError};
use crate::domain::events::EngineEvent;
use crate::model::DeviceModel;
use crate::paramspec::{self, MotionKind, PollSource};
use crate::preview::StillImageSource;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Connection lifecycle of a device session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Model created, nothing attempted yet.
    Unknown,
    /// The engine decided to try; a connect cycle is about to start.
    Scheduling,
    /// A connect cycle is running (auth and first poll).
    Attempting,
    /// Auth and first poll succeeded; poll and command loops are live.
    Connected,
    /// Transient failure; backoff armed before the next attempt.
    Sleeping,
    /// Fatal failure (bad credentials, host gone). Only an explicit user
    /// reconnect leaves this state.
    Failed,
    /// User closed the session. Reopened on user request.
    Disconnect,
}

/// A queued api write. `key` drives coalescing: a newer command with the
/// same key replaces the queued one, so slider and seesaw bursts collapse
/// to the latest value.
#[derive(Clone, Debug)]
pub struct ApiCommand {
    pub key: String,
    pub command: &'static str,
    pub params: Option<Value>,
    /// `(group, param)` the write belongs to, for failure annotation.
    pub origin: Option<(&'static str, &'static str)>,
}

#[derive(Debug, Default)]
struct QueueState {
    order: VecDeque<String>,
    items: HashMap<String, ApiCommand>,
}

#[derive(Debug)]
struct QueueInner {
    state: Mutex<QueueState>,
    item_ready: Notify,
    space_free: Notify,
    maxsize: usize,
}

/// Bounded FIFO of pending writes, keyed for coalescing. Producers await
/// when the queue is full; replacing an existing key never blocks.
#[derive(Clone, Debug)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl CommandQueue {
    pub fn new(maxsize: usize) -> Self {
        CommandQueue {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                item_ready: Notify::new(),
                space_free: Notify::new(),
                maxsize,
            }),
        }
    }

    pub fn sink(&self) -> CommandSink {
        CommandSink { queue: self.clone() }
    }

    pub async fn put(&self, command: ApiCommand) {
        let mut command = Some(command);
        loop {
            let space = self.inner.space_free.notified();
            {
                let mut state = self.inner.state.lock().expect("queue lock");
                let cmd = command.take().expect("command present until stored");
                if state.items.contains_key(&cmd.key) {
                    state.items.insert(cmd.key.clone(), cmd);
                    self.inner.item_ready.notify_one();
                    return;
                }
                if state.order.len() < self.inner.maxsize {
                    state.order.push_back(cmd.key.clone());
                    state.items.insert(cmd.key.clone(), cmd);
                    self.inner.item_ready.notify_one();
                    return;
                }
                command = Some(cmd);
            }
            space.await;
        }
    }

    pub async fn get(&self) -> ApiCommand {
        loop {
            let ready = self.inner.item_ready.notified();
            if let Some(command) = self.try_get() {
                return command;
            }
            ready.await;
        }
    }

    pub fn try_get(&self) -> Option<ApiCommand> {
        let mut state = self.inner.state.lock().expect("queue lock");
        let key = state.order.pop_front()?;
        let command = state.items.remove(&key).expect("order and items stay in sync");
        self.inner.space_free.notify_one();
        Some(command)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().expect("queue lock").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write half of the queue, handed to the device model.
#[derive(Clone, Debug)]
pub struct CommandSink {
    queue: CommandQueue,
}

impl CommandSink {
    pub async fn put(&self, command: ApiCommand) {
        self.queue.put(command).await;
    }
}

/// Tunables shared by all sessions.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub command_attempts: u32,
    pub motion_heartbeat: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            poll_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
            command_attempts: 3,
            motion_heartbeat: Duration::from_millis(100),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

/// Network address and credentials of one camera.
#[derive(Clone, Debug)]
pub struct DeviceEndpoint {
    pub hostaddr: String,
    pub hostport: u16,
    pub auth_user: String,
    pub auth_pass: String,
}

#[derive(Debug)]
enum SessionControl {
    Close,
    Reconnect,
}

enum CycleExit {
    Shutdown,
    UserClose,
    Reconnect,
    Fatal(String),
    Transient(String),
}

enum Step {
    Shutdown,
    Control(Option<SessionControl>),
    Tick(Option<ApiCommand>),
}

enum Wake {
    Shutdown,
    Close,
    Retry,
}

/// Handle held by the engine for one running session task.
#[derive(Debug)]
pub struct SessionHandle {
    id: String,
    state: watch::Receiver<ConnectionState>,
    control: mpsc::Sender<SessionControl>,
    sink: CommandSink,
    preview: Arc<StillImageSource>,
    motions: Arc<Mutex<HashMap<MotionKind, JoinHandle<()>>>>,
    motion_heartbeat: Duration,
    join: JoinHandle<()>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn sink(&self) -> CommandSink {
        self.sink.clone()
    }

    /// Throttled still-image source; the URL itself is opaque to the engine.
    pub fn preview(&self) -> Arc<StillImageSource> {
        Arc::clone(&self.preview)
    }

    pub async fn close(&self) {
        let _ = self.control.send(SessionControl::Close).await;
    }

    /// Leave `failed` or `disconnect` and start a fresh connect cycle.
    pub async fn reconnect(&self) {
        let _ = self.control.send(SessionControl::Reconnect).await;
    }

    /// Begin or update a continuous motion. The speed sign selects the
    /// direction (tele/far/up positive); zero releases the control.
    pub fn drive_motion(&self, kind: MotionKind, speed: i8) {
        let mut motions = self.motions.lock().expect("motion lock");
        if let Some(task) = motions.remove(&kind) {
            task.abort();
        }
        if speed == 0 {
            drop(motions);
            self.release_motion(kind);
            return;
        }
        let sink = self.sink.clone();
        let heartbeat = self.motion_heartbeat;
        let task = tokio::spawn(async move {
            loop {
                sink.put(seesaw_command(kind, speed)).await;
                tokio::time::sleep(heartbeat).await;
            }
        });
        motions.insert(kind, task);
    }

    /// Stop a motion: cancel the heartbeat and send one stop command. The
    /// stop replaces any still-queued heartbeat via key coalescing.
    pub fn release_motion(&self, kind: MotionKind) {
        {
            let mut motions = self.motions.lock().expect("motion lock");
            if let Some(task) = motions.remove(&kind) {
                task.abort();
            }
        }
        let sink = self.sink.clone();
        tokio::spawn(async move {
            sink.put(seesaw_command(kind, 0)).await;
        });
    }

    pub async fn join(self) {
        for (_, task) in self.motions.lock().expect("motion lock").drain() {
            task.abort();
        }
        let _ = self.join.await;
    }
}

fn seesaw_command(kind: MotionKind, speed: i8) -> ApiCommand {
    let (positive, negative) = kind.directions();
    let direction = if speed == 0 {
        "Stop"
    } else if speed > 0 {
        positive
    } else {
        negative
    };
    ApiCommand {
        key: kind.queue_key().to_string(),
        command: "SeesawSwitchOperation",
        params: Some(json!({ "Kind": kind.seesaw_kind(), "Direction": direction, "Speed": speed.unsigned_abs() })),
        origin: None,
    }
}

struct SessionTask {
    id: String,
    endpoint: DeviceEndpoint,
    model: Arc<RwLock<DeviceModel>>,
    queue: CommandQueue,
    config: SessionConfig,
    state_tx: watch::Sender<ConnectionState>,
    control_rx: mpsc::Receiver<SessionControl>,
    events: mpsc::Sender<EngineEvent>,
    cancel: CancellationToken,
    disabled_groups: HashSet<&'static str>,
    backoff: Box<dyn Iterator<Item = Duration> + Send + Sync>,
}

/// Spawn the session task for one device. The surrounding model is created
/// by the engine and survives reconnects.
pub fn spawn(
    id: String,
    endpoint: DeviceEndpoint,
    model: Arc<RwLock<DeviceModel>>,
    queue: CommandQueue,
    config: SessionConfig,
    events: mpsc::Sender<EngineEvent>,
    cancel: CancellationToken,
) -> Result<SessionHandle, CameraClientError> {
    let (state_tx, state_rx) = watch::channel(ConnectionState::Unknown);
    let (control_tx, control_rx) = mpsc::channel(4);

    let preview_client = CameraClient::new(
        &endpoint.hostaddr,
        endpoint.hostport,
        &endpoint.auth_user,
        &endpoint.auth_pass,
        config.request_timeout,
    )?;
    let preview = Arc::new(StillImageSource::new(preview_client, Duration::from_millis(100)));

    let task = SessionTask {
        id: id.clone(),
        endpoint,
        model,
        queue: queue.clone(),
        backoff: backoff_strategy(&config),
        config: config.clone(),
        state_tx,
        control_rx,
        events,
        cancel,
        disabled_groups: HashSet::new(),
    };
    let join = tokio::spawn(task.run());

    Ok(SessionHandle {
        id,
        state: state_rx,
        control: control_tx,
        sink: queue.sink(),
        preview,
        motions: Arc::new(Mutex::new(HashMap::new())),
        motion_heartbeat: config.motion_heartbeat,
        join,
    })
}

/// Exponential backoff doubling from the base, capped, with jitter.
fn backoff_strategy(config: &SessionConfig) -> Box<dyn Iterator<Item = Duration> + Send + Sync> {
    let base_ms = config.backoff_base.as_millis().max(2) as u64;
    Box::new(
        ExponentialBackoff::from_millis(2)
            .factor(base_ms / 2)
            .max_delay(config.backoff_cap)
            .map(jitter),
    )
}

impl SessionTask {
    async fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        debug!(device_id = %self.id, "🔄 Session state: {:?}", state);
        let _ = self.state_tx.send(state);
        let _ = self.events.send(EngineEvent::SessionState { id: self.id.clone(), state }).await;
    }

    /// `scheduling` is entered once when the engine decides to try and again
    /// on an explicit user reconnect out of `failed`/`disconnect`; a backoff
    /// wake-up leaves `sleeping` straight for `attempting`.
    #[instrument(skip_all, fields(device_id = %self.id))]
    async fn run(mut self) {
        self.set_state(ConnectionState::Scheduling).await;
        loop {
            self.set_state(ConnectionState::Attempting).await;
            let exit = self.connect_cycle().await;
            self.model.write().await.mark_stale();
            match exit {
                CycleExit::Shutdown => {
                    self.set_state(ConnectionState::Disconnect).await;
                    break;
                }
                CycleExit::Reconnect => {
                    self.backoff = backoff_strategy(&self.config);
                    self.set_state(ConnectionState::Scheduling).await;
                }
                CycleExit::UserClose => {
                    self.set_state(ConnectionState::Disconnect).await;
                    if !self.wait_for_reconnect().await {
                        break;
                    }
                    self.backoff = backoff_strategy(&self.config);
                    self.set_state(ConnectionState::Scheduling).await;
                }
                CycleExit::Fatal(reason) => {
                    warn!(device_id = %self.id, "🔴 Session failed: {}", reason);
                    self.set_state(ConnectionState::Failed).await;
                    if !self.wait_for_reconnect().await {
                        break;
                    }
                    self.backoff = backoff_strategy(&self.config);
                    self.set_state(ConnectionState::Scheduling).await;
                }
                CycleExit::Transient(reason) => {
                    let delay = self.backoff.next().unwrap_or(self.config.backoff_cap);
                    debug!(device_id = %self.id, "🟠 {}; retrying in {:?}", reason, delay);
                    self.set_state(ConnectionState::Sleeping).await;
                    let woke = tokio::select! {
                        _ = self.cancel.cancelled() => Wake::Shutdown,
                        control = self.control_rx.recv() => match control {
                            Some(SessionControl::Close) => Wake::Close,
                            Some(SessionControl::Reconnect) | None => Wake::Retry,
                        },
                        _ = tokio::time::sleep(delay) => Wake::Retry,
                    };
                    match woke {
                        Wake::Shutdown => {
                            self.set_state(ConnectionState::Disconnect).await;
                            break;
                        }
                        Wake::Close => {
                            self.set_state(ConnectionState::Disconnect).await;
                            if !self.wait_for_reconnect().await {
                                break;
                            }
                            self.backoff = backoff_strategy(&self.config);
                            self.set_state(ConnectionState::Scheduling).await;
                        }
                        Wake::Retry => {}
                    }
                }
            }
        }
        debug!(device_id = %self.id, "Session task ended");
    }

    /// Block in `failed`/`disconnect` until the user asks for a reconnect.
    /// Returns false on shutdown.
    async fn wait_for_reconnect(&mut self) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                control = self.control_rx.recv() => match control {
                    Some(SessionControl::Reconnect) => return true,
                    Some(SessionControl::Close) => continue,
                    None => return false,
                },
            }
        }
    }

    async fn connect_cycle(&mut self) -> CycleExit {
        let client = match CameraClient::new(
            &self.endpoint.hostaddr,
            self.endpoint.hostport,
            &self.endpoint.auth_user,
            &self.endpoint.auth_pass,
            self.config.request_timeout,
        ) {
            Ok(client) => client,
            Err(e) => return CycleExit::Transient(e.to_string()),
        };

        match self.open_device(&client).await {
            Ok(()) => {}
            Err(exit) => return exit,
        }

        info!(device_id = %self.id, "🟢 Device connected");
        self.set_state(ConnectionState::Connected).await;

        let queue = self.queue.clone();
        loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Shutdown,
                control = self.control_rx.recv() => Step::Control(control),
                item = timeout(self.config.poll_interval, queue.get()) => Step::Tick(item.ok()),
            };
            let result = match step {
                Step::Shutdown => return CycleExit::Shutdown,
                Step::Control(Some(SessionControl::Close)) => return CycleExit::UserClose,
                Step::Control(Some(SessionControl::Reconnect)) => return CycleExit::Reconnect,
                Step::Control(None) => return CycleExit::Shutdown,
                Step::Tick(Some(command)) => self.send_command(&client, command).await,
                Step::Tick(None) => self.full_poll(&client).await,
            };
            match result {
                Ok(()) => {
                    self.backoff = backoff_strategy(&self.config);
                }
                Err(e) => return classify(e),
            }
        }
    }

    /// Authenticate, fetch system info and complete the first poll. The
    /// session only counts as connected after all three.
    async fn open_device(&mut self, client: &CameraClient) -> Result<(), CycleExit> {
        client.open().await.map_err(classify)?;
        let info = client.request("GetSystemInfo", None).await.map_err(classify)?;
        self.model.write().await.apply_system_info(&info);
        self.full_poll(client).await.map_err(classify)?;
        Ok(())
    }

    /// One poll tick: the shared `GetCamStatus` plus every dedicated-command
    /// group that has not been disabled by capability probing.
    async fn full_poll(&mut self, client: &CameraClient) -> Result<(), CameraClientError> {
        let data = client.request("GetCamStatus", None).await?;
        self.model.write().await.apply_cam_status(&data);

        for group in paramspec::REGISTRY {
            let PollSource::Command(command) = &group.poll else { continue };
            if self.disabled_groups.contains(group.name) {
                continue;
            }
            match client.request(command, None).await {
                Ok(data) => self.model.write().await.apply_poll(group.name, &data),
                Err(CameraClientError::NotFound) => {
                    info!(device_id = %self.id, group = group.name, "Camera lacks group; disabled for this session");
                    self.disabled_groups.insert(group.name);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Send one queued write, retrying transients up to the attempt budget,
    /// then converge the model with a short poll.
    async fn send_command(&mut self, client: &CameraClient, command: ApiCommand) -> Result<(), CameraClientError> {
        let mut last_error: Option<CameraClientError> = None;
        for attempt in 1..=self.config.command_attempts {
            match client.request(command.command, command.params.clone()).await {
                Ok(_) => {
                    if let Some(origin) = command.origin {
                        self.model.write().await.command_resolved(origin);
                    }
                    // Route the device's new state immediately instead of
                    // waiting out the poll interval.
                    let data = client.request("GetCamStatus", None).await?;
                    self.model.write().await.apply_cam_status(&data);
                    return Ok(());
                }
                Err(e @ CameraClientError::Auth) => {
                    if let Some(origin) = command.origin {
                        self.model.write().await.command_failed(origin, "authentication rejected");
                    }
                    return Err(e);
                }
                Err(e) => {
                    debug!(device_id = %self.id, command = command.command, attempt, "⚠️ Command failed: {}", e);
                    last_error = Some(e);
                }
            }
        }
        let error = last_error.expect("at least one attempt ran");
        if let Some(origin) = command.origin {
            self.model.write().await.command_failed(origin, &error.to_string());
        }
        Err(error)
    }
}

fn classify(e: CameraClientError) -> CycleExit {
    match e {
        CameraClientError::Auth => CycleExit::Fatal("authentication rejected".to_string()),
        e => CycleExit::Transient(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn command(key: &str) -> ApiCommand {
        ApiCommand { key: key.to_string(), command: "SetWebSliderEvent", params: None, origin: None }
    }

    #[tokio::test]
    async fn queue_preserves_fifo_order() {
        let queue = CommandQueue::new(8);

        queue.put(command("a")).await;
        queue.put(command("b")).await;

        assert_eq!(queue.get().await.key, "a");
        assert_eq!(queue.get().await.key, "b");
        assert!(queue.try_get().is_none());
    }

    #[tokio::test]
    async fn queue_coalesces_commands_with_the_same_key() {
        let queue = CommandQueue::new(8);

        queue
            .put(ApiCommand {
                key: "exposure.iris_pos".to_string(),
                command: "SetWebSliderEvent",
                params: Some(json!({ "Position": 10 })),
                origin: None,
            })
            .await;
        queue
            .put(ApiCommand {
                key: "exposure.iris_pos".to_string(),
                command: "SetWebSliderEvent",
                params: Some(json!({ "Position": 99 })),
                origin: None,
            })
            .await;

        assert_eq!(queue.len(), 1);
        let queued = queue.get().await;
        assert_eq!(queued.params.unwrap()["Position"], 99);
    }

    #[tokio::test]
    async fn queue_blocks_producers_at_capacity_until_drained() {
        let queue = CommandQueue::new(1);
        queue.put(command("a")).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put(command("b")).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.get().await.key, "a");
        producer.await.unwrap();
        assert_eq!(queue.get().await.key, "b");
    }

    mod session {
        use super::*;
        use crate::model::DeviceModel;
        use pretty_assertions::assert_eq;
        use serde_json::json;

        fn api_response(command: &str, data: Value) -> String {
            json!({ "Response": { "Requested": command, "Result": "Success", "Data": data } }).to_string()
        }

        fn cam_status_body() -> String {
            api_response(
                "GetCamStatus",
                json!({
                    "Camera": { "Status": "Standby", "Mode": "Normal", "TC": "00:00:00:00", "MenuStatus": "Off" },
                    "Iris": { "Status": "Manual", "Value": "F4.0", "Position": 42 },
                    "Gain": { "Status": "ManualL", "Value": "0dB" },
                    "Shutter": { "Status": "Step", "Value": "1/60" },
                    "MasterBlack": { "Value": "0" },
                    "Whb": {
                        "Status": "A", "Value": "3200K",
                        "WhPRScale": 64, "WhPRPosition": 32, "WhPRValue": "0",
                        "WhPBScale": 64, "WhPBPosition": 32, "WhPBValue": "0"
                    },
                    "Detail": { "Value": "0" },
                    "TallyLamp": { "Priority": "Web", "StudioTally": "Off" },
                    "Battery": { "Info": "Capacity", "Level": 7, "Value": "75" },
                    "Focus": { "Status": "MF", "Value": "3.4ft" },
                    "Zoom": { "Position": 0, "DisplayValue": "Z00" }
                }),
            )
        }

        fn endpoint_for(server: &mockito::Server) -> DeviceEndpoint {
            DeviceEndpoint {
                hostaddr: server.url(),
                hostport: 80,
                auth_user: "user".to_string(),
                auth_pass: "pass".to_string(),
            }
        }

        fn test_config() -> SessionConfig {
            SessionConfig {
                poll_interval: Duration::from_millis(20),
                request_timeout: Duration::from_secs(1),
                backoff_base: Duration::from_millis(10),
                backoff_cap: Duration::from_millis(50),
                motion_heartbeat: Duration::from_millis(10),
                ..SessionConfig::default()
            }
        }

        fn spawn_for(server: &mockito::Server) -> (SessionHandle, Arc<RwLock<DeviceModel>>, CancellationToken) {
            let queue = CommandQueue::new(16);
            let model = Arc::new(RwLock::new(DeviceModel::new("GY-HC500-0001", 0, queue.sink())));
            let (events_tx, mut events_rx) = mpsc::channel(64);
            tokio::spawn(async move { while events_rx.recv().await.is_some() {} });
            let cancel = CancellationToken::new();
            let handle = spawn(
                "GY-HC500-0001".to_string(),
                endpoint_for(server),
                Arc::clone(&model),
                queue,
                test_config(),
                events_tx,
                cancel.clone(),
            )
            .unwrap();
            (handle, model, cancel)
        }

        async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, wanted: ConnectionState) {
            timeout(Duration::from_secs(5), async {
                loop {
                    if *rx.borrow() == wanted {
                        return;
                    }
                    rx.changed().await.expect("session alive");
                }
            })
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {:?}", wanted));
        }

        fn mock_command(server: &mut mockito::Server, command: &str, body: String) -> mockito::Mock {
            server
                .mock("POST", "/cgi-bin/api.cgi")
                .match_body(mockito::Matcher::PartialJson(json!({ "Request": { "Command": command } })))
                .with_status(200)
                .with_body(body)
        }

        #[tokio::test]
        async fn connects_and_mirrors_the_first_poll() {
            let mut server = mockito::Server::new_async().await;
            server.mock("GET", "/api.php").with_status(200).create_async().await;
            mock_command(
                &mut server,
                "GetSystemInfo",
                api_response("GetSystemInfo", json!({ "Model": "GY-HC500", "Serial": "0001", "ApiVersion": "1.0" })),
            )
            .create_async()
            .await;
            mock_command(&mut server, "GetCamStatus", cam_status_body()).create_async().await;
            mock_command(&mut server, "GetNTPStatus", api_response("GetNTPStatus", json!({ "Address": "", "Status": "" })))
                .create_async()
                .await;
            mock_command(
                &mut server,
                "GetPresetZoomPosition",
                api_response("GetPresetZoomPosition", json!({ "A": -1, "B": -1, "C": -1 })),
            )
            .create_async()
            .await;

            let (handle, model, cancel) = spawn_for(&server);
            let mut state = handle.subscribe_state();
            wait_for_state(&mut state, ConnectionState::Connected).await;

            {
                let model = model.read().await;
                assert_eq!(model.model_name(), Some("GY-HC500"));
                assert_eq!(
                    model.value("exposure", "iris_pos"),
                    Some(crate::domain::param::ParamValue::Int(42))
                );
            }

            cancel.cancel();
            handle.join().await;
        }

        #[tokio::test]
        async fn auth_failure_is_sticky_until_user_reconnect() {
            let mut server = mockito::Server::new_async().await;
            let auth = server.mock("GET", "/api.php").with_status(401).expect_at_least(2).create_async().await;

            let (handle, _model, cancel) = spawn_for(&server);
            let mut state = handle.subscribe_state();
            wait_for_state(&mut state, ConnectionState::Failed).await;

            // No backoff retry: the state stays failed.
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(handle.state(), ConnectionState::Failed);

            handle.reconnect().await;
            timeout(Duration::from_secs(5), async {
                while !auth.matched_async().await {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .expect("second auth attempt after explicit reconnect");
            wait_for_state(&mut state, ConnectionState::Failed).await;

            cancel.cancel();
            handle.join().await;
        }

        #[tokio::test]
        async fn transient_failure_sleeps_and_retries() {
            let mut server = mockito::Server::new_async().await;
            server.mock("GET", "/api.php").with_status(503).expect_at_least(2).create_async().await;

            let (handle, _model, cancel) = spawn_for(&server);
            let mut state = handle.subscribe_state();
            wait_for_state(&mut state, ConnectionState::Sleeping).await;
            wait_for_state(&mut state, ConnectionState::Attempting).await;

            cancel.cancel();
            handle.join().await;
        }

        #[tokio::test]
        async fn backoff_wakeups_go_straight_to_attempting() {
            let mut server = mockito::Server::new_async().await;
            server.mock("GET", "/api.php").with_status(503).create_async().await;

            let queue = CommandQueue::new(16);
            let model = Arc::new(RwLock::new(DeviceModel::new("GY-HC500-0001", 0, queue.sink())));
            let (events_tx, mut events_rx) = mpsc::channel(64);
            let cancel = CancellationToken::new();
            let handle = spawn(
                "GY-HC500-0001".to_string(),
                endpoint_for(&server),
                model,
                queue,
                test_config(),
                events_tx,
                cancel.clone(),
            )
            .unwrap();

            // Unlike the watch channel, the event stream carries every
            // transition, so the exact sequence can be asserted.
            let mut states = Vec::new();
            timeout(Duration::from_secs(5), async {
                while states.iter().filter(|s| **s == ConnectionState::Sleeping).count() < 2 {
                    if let Some(EngineEvent::SessionState { state, .. }) = events_rx.recv().await {
                        states.push(state);
                    }
                }
            })
            .await
            .expect("two backoff cycles");

            assert_eq!(states[0], ConnectionState::Scheduling);
            assert_eq!(states.iter().filter(|s| **s == ConnectionState::Scheduling).count(), 1);
            for pair in states.windows(2) {
                if pair[0] == ConnectionState::Sleeping {
                    assert_eq!(pair[1], ConnectionState::Attempting);
                }
            }

            cancel.cancel();
            handle.join().await;
        }

        #[tokio::test]
        async fn motion_release_sends_stop_and_cancels_heartbeats() {
            let server = mockito::Server::new_async().await;
            let (handle, _model, cancel) = spawn_for(&server);
            // The session is failing to connect in the background; motion
            // commands only touch the queue.
            let queue = CommandQueue::new(16);
            let sink_handle = SessionHandle {
                id: "test".to_string(),
                state: handle.subscribe_state(),
                control: handle.control.clone(),
                sink: queue.sink(),
                preview: handle.preview(),
                motions: Arc::new(Mutex::new(HashMap::new())),
                motion_heartbeat: Duration::from_millis(10),
                join: tokio::spawn(async {}),
            };

            sink_handle.drive_motion(MotionKind::Zoom, 4);
            tokio::time::sleep(Duration::from_millis(35)).await;
            // Heartbeats coalesce on the motion key; the queue holds one.
            assert_eq!(queue.len(), 1);
            let heartbeat = queue.try_get().unwrap();
            assert_eq!(heartbeat.command, "SeesawSwitchOperation");
            assert_eq!(heartbeat.params.as_ref().unwrap()["Direction"], "Tele");
            assert_eq!(heartbeat.params.as_ref().unwrap()["Speed"], 4);

            sink_handle.release_motion(MotionKind::Zoom);
            tokio::time::sleep(Duration::from_millis(30)).await;
            let stop = queue.try_get().unwrap();
            assert_eq!(stop.params.as_ref().unwrap()["Direction"], "Stop");
            assert_eq!(stop.params.as_ref().unwrap()["Speed"], 0);

            // No further heartbeats arrive after release.
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(queue.try_get().is_none());

            cancel.cancel();
            handle.join().await;
        }
    }
}
