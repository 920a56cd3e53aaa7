use crate::domain::tally::TallyKey;
use crate::tally::messages::UmdFrame;
use crate::tally::router::RouterMsg;
use crate::tally::TallyFields;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Running UMD listener. The malformed counter backs the protocol-error
/// policy: bad datagrams are counted and dropped, never answered.
#[derive(Debug)]
pub struct UmdHandle {
    pub local_addr: SocketAddr,
    pub malformed: Arc<AtomicU64>,
    join: JoinHandle<()>,
}

impl UmdHandle {
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// Bind the UDP socket and start parsing frames. Each `(screen, index)`
/// keeps its last known fields; only actual changes reach the router.
#[instrument(skip(router, cancel))]
pub async fn spawn(
    bind_addr: &str,
    router: mpsc::Sender<RouterMsg>,
    cancel: CancellationToken,
) -> Result<UmdHandle, UmdError> {
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| UmdError::Bind { addr: bind_addr.to_string(), reason: e.to_string() })?;
    let local_addr = socket.local_addr().map_err(|e| UmdError::Bind {
        addr: bind_addr.to_string(),
        reason: e.to_string(),
    })?;
    info!("📺 UMD listener bound to {}", local_addr);

    let malformed = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&malformed);
    let join = tokio::spawn(async move {
        let mut table: HashMap<TallyKey, TallyFields> = HashMap::new();
        let mut buf = vec![0u8; 2048];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };
            let (len, _peer) = match received {
                Ok(received) => received,
                Err(e) => {
                    warn!("⚠️ UMD socket error: {}", e);
                    continue;
                }
            };
            let frames = match UmdFrame::parse_all(&buf[..len]) {
                Ok(frames) => frames,
                Err(e) => {
                    counter.fetch_add(1, Ordering::Relaxed);
                    debug!("⚠️ Malformed UMD datagram dropped: {}", e);
                    continue;
                }
            };
            for frame in frames {
                for display in frame.displays {
                    let key = TallyKey::new(frame.screen, display.index);
                    let fields = TallyFields {
                        rh: display.rh_tally,
                        txt: display.txt_tally,
                        lh: display.lh_tally,
                        text: display.text,
                    };
                    if table.get(&key) == Some(&fields) {
                        continue;
                    }
                    table.insert(key, fields.clone());
                    if router.send(RouterMsg::Umd { key, fields }).await.is_err() {
                        return;
                    }
                }
            }
        }
        debug!("UMD listener task ended");
    });

    Ok(UmdHandle { local_addr, malformed, join })
}

#[derive(Error, Debug)]
pub enum UmdError {
    #[error("could not bind UMD listener to {addr}: {reason}")]
    Bind { addr: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tally::TallyColor;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::timeout;

    fn frame(screen: u16, index: u16, control: u16, text: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&index.to_be_bytes());
        body.extend_from_slice(&control.to_be_bytes());
        body.extend_from_slice(&(text.len() as u16).to_be_bytes());
        body.extend_from_slice(text);
        let mut buf = Vec::new();
        buf.extend_from_slice(&((6 + body.len()) as u16).to_be_bytes());
        buf.push(0);
        buf.push(0);
        buf.extend_from_slice(&screen.to_be_bytes());
        buf.extend_from_slice(&body);
        buf
    }

    async fn listener() -> (UmdHandle, mpsc::Receiver<RouterMsg>, UdpSocket, CancellationToken) {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = spawn("127.0.0.1:0", tx, cancel.clone()).await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.connect(handle.local_addr).await.unwrap();
        (handle, rx, sender, cancel)
    }

    #[tokio::test]
    async fn forwards_changed_displays_to_the_router() {
        let (handle, mut rx, sender, cancel) = listener().await;

        sender.send(&frame(0, 3, 1, b"CAM 1")).await.unwrap();

        let msg = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        match msg {
            RouterMsg::Umd { key, fields } => {
                assert_eq!(key, TallyKey::new(0, 3));
                assert_eq!(fields.rh, TallyColor::Red);
                assert_eq!(fields.text, "CAM 1");
            }
            other => panic!("unexpected message {:?}", other),
        }

        cancel.cancel();
        handle.join().await;
    }

    #[tokio::test]
    async fn unchanged_displays_are_not_repeated() {
        let (handle, mut rx, sender, cancel) = listener().await;

        sender.send(&frame(0, 3, 1, b"CAM 1")).await.unwrap();
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();

        // Identical fields again, then an actual change.
        sender.send(&frame(0, 3, 1, b"CAM 1")).await.unwrap();
        sender.send(&frame(0, 3, 0, b"CAM 1")).await.unwrap();

        let msg = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        match msg {
            RouterMsg::Umd { fields, .. } => assert_eq!(fields.rh, TallyColor::Off),
            other => panic!("unexpected message {:?}", other),
        }

        cancel.cancel();
        handle.join().await;
    }

    #[tokio::test]
    async fn malformed_datagrams_are_counted_and_dropped() {
        let (handle, mut rx, sender, cancel) = listener().await;

        sender.send(&[0xff, 0x02, 0x00]).await.unwrap();
        sender.send(&frame(0, 1, 2, b"OK")).await.unwrap();

        // The good frame still arrives; the bad one only bumped the counter.
        let msg = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(msg, RouterMsg::Umd { .. }));
        assert_eq!(handle.malformed.load(Ordering::Relaxed), 1);

        cancel.cancel();
        handle.join().await;
    }
}
