use crate::domain::tally::{TallyKey, TallyMap, TallySource, TallyState, TallyType};
use crate::tally::{TallyFields, TallyVector, TALLY_VECTOR_SIZE};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

const ROUTER_CHANNEL_SIZE: usize = 128;

/// Sink the router writes device tally state into. The engine implements
/// this over its device registry; tests record the calls.
#[async_trait]
pub trait TallyTarget: Send + Sync {
    async fn apply_tally(&self, device_index: u32, state: TallyState);
}

/// Inputs of the router task. UMD updates and command-port writes share one
/// queue, so they are totally ordered by arrival and the later message wins.
#[derive(Debug)]
pub enum RouterMsg {
    Umd { key: TallyKey, fields: TallyFields },
    DirectProgram { device_index: u32, value: bool },
    DirectPreview { device_index: u32, value: bool },
    MapChanged { device_index: u32, map: TallyMap },
}

/// Validate a tally map before it reaches the router.
pub fn check_valid(device_index: u32, map: &TallyMap, device_known: bool) -> Result<(), TallyMapError> {
    if !device_known {
        return Err(TallyMapError::UnknownDevice { device_index });
    }
    if let (Some(program), Some(preview)) = (&map.program, &map.preview) {
        if program == preview {
            return Err(TallyMapError::SourcesIdentical);
        }
    }
    for source in [&map.program, &map.preview].into_iter().flatten() {
        if usize::from(source.key.index) >= TALLY_VECTOR_SIZE {
            return Err(TallyMapError::IndexOutOfRange { index: source.key.index });
        }
    }
    Ok(())
}

/// Translate raw display fields to an on/off state for the configured
/// indicator. The text indicator also counts non-empty text as lit.
fn source_is_on(fields: &TallyFields, tally_type: TallyType) -> bool {
    match tally_type {
        TallyType::RhTally => fields.rh.is_lit(),
        TallyType::LhTally => fields.lh.is_lit(),
        TallyType::TxtTally => fields.txt.is_lit() || !fields.text.is_empty(),
    }
}

/// Handle to the running router task.
#[derive(Debug)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterMsg>,
    vector: watch::Receiver<TallyVector>,
    join: JoinHandle<()>,
}

impl RouterHandle {
    pub fn sender(&self) -> mpsc::Sender<RouterMsg> {
        self.tx.clone()
    }

    /// Current program/preview vector, observed by the command-port server.
    pub fn vector(&self) -> watch::Receiver<TallyVector> {
        self.vector.clone()
    }

    pub async fn join(self) {
        drop(self.tx);
        let _ = self.join.await;
    }
}

struct RouterTask {
    maps: BTreeMap<u32, TallyMap>,
    umd_state: HashMap<TallyKey, TallyFields>,
    vector: TallyVector,
    target: Arc<dyn TallyTarget>,
    vector_tx: watch::Sender<TallyVector>,
}

/// Start the router with the persisted maps. A single task consumes all
/// inputs so conflicting writes resolve in arrival order.
pub fn spawn(
    maps: BTreeMap<u32, TallyMap>,
    target: Arc<dyn TallyTarget>,
    cancel: CancellationToken,
) -> RouterHandle {
    let (tx, mut rx) = mpsc::channel(ROUTER_CHANNEL_SIZE);
    let (vector_tx, vector_rx) = watch::channel(TallyVector::default());
    let mut task = RouterTask {
        maps,
        umd_state: HashMap::new(),
        vector: TallyVector::default(),
        target,
        vector_tx,
    };
    let join = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            task.handle(msg).await;
        }
        debug!("Tally router task ended");
    });
    RouterHandle { tx, vector: vector_rx, join }
}

impl RouterTask {
    #[instrument(skip_all)]
    async fn handle(&mut self, msg: RouterMsg) {
        match msg {
            RouterMsg::Umd { key, fields } => {
                self.umd_state.insert(key, fields);
                let indices: Vec<u32> = self.maps.keys().copied().collect();
                for device_index in indices {
                    self.refresh_device(device_index).await;
                }
            }
            RouterMsg::DirectProgram { device_index, value } => {
                self.direct_write(device_index, value, true).await;
            }
            RouterMsg::DirectPreview { device_index, value } => {
                self.direct_write(device_index, value, false).await;
            }
            RouterMsg::MapChanged { device_index, map } => {
                self.maps.insert(device_index, map);
                self.refresh_device(device_index).await;
            }
        }
    }

    /// Recompute one device's state from its mapped sources and push the
    /// result when it changed.
    async fn refresh_device(&mut self, device_index: u32) {
        let index = device_index as usize;
        if index >= TALLY_VECTOR_SIZE {
            return;
        }
        let Some(map) = self.maps.get(&device_index) else { return };

        let resolve = |source: &Option<TallySource>, current: bool| -> bool {
            match source {
                Some(source) => self
                    .umd_state
                    .get(&source.key)
                    .map(|fields| source_is_on(fields, source.tally_type))
                    .unwrap_or(current),
                None => current,
            }
        };
        let program = resolve(&map.program, self.vector.program[index]);
        let preview = resolve(&map.preview, self.vector.preview[index]);

        if self.vector.program[index] == program && self.vector.preview[index] == preview {
            return;
        }
        self.vector.program[index] = program;
        self.vector.preview[index] = preview;
        debug!(device_index, program, preview, "🚨 Tally routed");
        self.target.apply_tally(device_index, TallyState { program, preview }).await;
        let _ = self.vector_tx.send(self.vector.clone());
    }

    /// Command-port write: bypasses the source mapping entirely.
    async fn direct_write(&mut self, device_index: u32, value: bool, program: bool) {
        let index = device_index as usize;
        if index >= TALLY_VECTOR_SIZE {
            return;
        }
        let slot = if program { &mut self.vector.program[index] } else { &mut self.vector.preview[index] };
        if *slot == value {
            return;
        }
        *slot = value;
        let state = TallyState { program: self.vector.program[index], preview: self.vector.preview[index] };
        debug!(device_index, ?state, "🚨 Direct tally write");
        self.target.apply_tally(device_index, state).await;
        let _ = self.vector_tx.send(self.vector.clone());
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum TallyMapError {
    #[error("device index {device_index} does not resolve to a known device")]
    UnknownDevice { device_index: u32 },
    #[error("program and preview cannot share one source")]
    SourcesIdentical,
    #[error("tally index {index} is outside the listener range")]
    IndexOutOfRange { index: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tally::TallyColor;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio::time::timeout;

    #[derive(Default)]
    struct RecordingTarget {
        calls: Mutex<Vec<(u32, TallyState)>>,
    }

    #[async_trait]
    impl TallyTarget for RecordingTarget {
        async fn apply_tally(&self, device_index: u32, state: TallyState) {
            self.calls.lock().await.push((device_index, state));
        }
    }

    fn rh_source(screen: u16, index: u16) -> TallySource {
        TallySource { key: TallyKey::new(screen, index), tally_type: TallyType::RhTally }
    }

    fn fields(rh: TallyColor, text: &str) -> TallyFields {
        TallyFields { rh, txt: TallyColor::Off, lh: TallyColor::Off, text: text.to_string() }
    }

    async fn wait_for_calls(target: &RecordingTarget, count: usize) -> Vec<(u32, TallyState)> {
        timeout(Duration::from_secs(2), async {
            loop {
                let calls = target.calls.lock().await;
                if calls.len() >= count {
                    return calls.clone();
                }
                drop(calls);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("target calls")
    }

    #[tokio::test]
    async fn umd_source_drives_the_mapped_device() {
        let target = Arc::new(RecordingTarget::default());
        let mut maps = BTreeMap::new();
        maps.insert(0, TallyMap { program: Some(rh_source(0, 3)), preview: None });
        let cancel = CancellationToken::new();
        let handle = spawn(maps, Arc::clone(&target) as Arc<dyn TallyTarget>, cancel.clone());

        let tx = handle.sender();
        tx.send(RouterMsg::Umd { key: TallyKey::new(0, 3), fields: fields(TallyColor::Red, "") }).await.unwrap();
        let calls = wait_for_calls(&target, 1).await;
        assert_eq!(calls[0], (0, TallyState { program: true, preview: false }));
        assert!(handle.vector().borrow().program[0]);

        tx.send(RouterMsg::Umd { key: TallyKey::new(0, 3), fields: fields(TallyColor::Off, "") }).await.unwrap();
        let calls = wait_for_calls(&target, 2).await;
        assert_eq!(calls[1], (0, TallyState { program: false, preview: false }));

        cancel.cancel();
        handle.join().await;
    }

    #[tokio::test]
    async fn unrelated_sources_do_not_touch_the_device() {
        let target = Arc::new(RecordingTarget::default());
        let mut maps = BTreeMap::new();
        maps.insert(0, TallyMap { program: Some(rh_source(0, 3)), preview: None });
        let cancel = CancellationToken::new();
        let handle = spawn(maps, Arc::clone(&target) as Arc<dyn TallyTarget>, cancel.clone());

        handle
            .sender()
            .send(RouterMsg::Umd { key: TallyKey::new(1, 3), fields: fields(TallyColor::Red, "") })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(target.calls.lock().await.is_empty());
        cancel.cancel();
        handle.join().await;
    }

    #[tokio::test]
    async fn text_tally_counts_nonempty_text_as_lit() {
        let target = Arc::new(RecordingTarget::default());
        let mut maps = BTreeMap::new();
        maps.insert(
            2,
            TallyMap {
                program: Some(TallySource { key: TallyKey::new(0, 1), tally_type: TallyType::TxtTally }),
                preview: None,
            },
        );
        let cancel = CancellationToken::new();
        let handle = spawn(maps, Arc::clone(&target) as Arc<dyn TallyTarget>, cancel.clone());

        handle
            .sender()
            .send(RouterMsg::Umd { key: TallyKey::new(0, 1), fields: fields(TallyColor::Off, "LIVE") })
            .await
            .unwrap();

        let calls = wait_for_calls(&target, 1).await;
        assert_eq!(calls[0], (2, TallyState { program: true, preview: false }));
        cancel.cancel();
        handle.join().await;
    }

    #[tokio::test]
    async fn later_message_wins_over_an_earlier_one() {
        let target = Arc::new(RecordingTarget::default());
        let mut maps = BTreeMap::new();
        maps.insert(0, TallyMap { program: Some(rh_source(0, 3)), preview: None });
        let cancel = CancellationToken::new();
        let handle = spawn(maps, Arc::clone(&target) as Arc<dyn TallyTarget>, cancel.clone());

        let tx = handle.sender();
        tx.send(RouterMsg::Umd { key: TallyKey::new(0, 3), fields: fields(TallyColor::Red, "") }).await.unwrap();
        tx.send(RouterMsg::DirectProgram { device_index: 0, value: false }).await.unwrap();

        let calls = wait_for_calls(&target, 2).await;
        assert_eq!(calls[1], (0, TallyState { program: false, preview: false }));
        assert!(!handle.vector().borrow().program[0]);

        cancel.cancel();
        handle.join().await;
    }

    #[tokio::test]
    async fn direct_writes_reach_unmapped_devices() {
        let target = Arc::new(RecordingTarget::default());
        let cancel = CancellationToken::new();
        let handle = spawn(BTreeMap::new(), Arc::clone(&target) as Arc<dyn TallyTarget>, cancel.clone());

        handle.sender().send(RouterMsg::DirectPreview { device_index: 5, value: true }).await.unwrap();

        let calls = wait_for_calls(&target, 1).await;
        assert_eq!(calls[0], (5, TallyState { program: false, preview: true }));
        cancel.cancel();
        handle.join().await;
    }

    #[tokio::test]
    async fn out_of_range_direct_writes_are_dropped() {
        let target = Arc::new(RecordingTarget::default());
        let cancel = CancellationToken::new();
        let handle = spawn(BTreeMap::new(), Arc::clone(&target) as Arc<dyn TallyTarget>, cancel.clone());

        handle.sender().send(RouterMsg::DirectProgram { device_index: 32, value: true }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(target.calls.lock().await.is_empty());
        cancel.cancel();
        handle.join().await;
    }

    mod validation {
        use super::*;
        use pretty_assertions::assert_eq;
        use rstest::rstest;

        #[test]
        fn a_complete_map_for_a_known_device_is_valid() {
            let map = TallyMap { program: Some(rh_source(0, 3)), preview: Some(rh_source(0, 4)) };
            assert_eq!(check_valid(0, &map, true), Ok(()));
        }

        #[test]
        fn unknown_devices_are_rejected() {
            let map = TallyMap::default();
            assert_eq!(check_valid(9, &map, false), Err(TallyMapError::UnknownDevice { device_index: 9 }));
        }

        #[test]
        fn identical_program_and_preview_sources_are_rejected() {
            let map = TallyMap { program: Some(rh_source(0, 3)), preview: Some(rh_source(0, 3)) };
            assert_eq!(check_valid(0, &map, true), Err(TallyMapError::SourcesIdentical));
        }

        #[rstest]
        #[case(31, Ok(()))]
        #[case(32, Err(TallyMapError::IndexOutOfRange { index: 32 }))]
        fn tally_indices_outside_the_listener_range_are_rejected(
            #[case] index: u16,
            #[case] expected: Result<(), TallyMapError>,
        ) {
            let map = TallyMap { program: Some(rh_source(0, index)), preview: None };
            assert_eq!(check_valid(0, &map, true), expected);
        }
    }
}
