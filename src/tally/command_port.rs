use crate::tally::router::RouterMsg;
use crate::tally::{TallyVector, TALLY_VECTOR_SIZE};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// One parsed command-port request. The grammar is line-oriented with each
/// logical message bracketed by `<` and `>`; parsing is tolerant and
/// keyword-driven, matching what third-party control processors send.
#[derive(Debug, PartialEq)]
enum Request {
    Ping,
    DumpProgram,
    DumpPreview,
    QueryProgram(usize),
    QueryPreview(usize),
    WriteProgram(usize, bool),
    WritePreview(usize, bool),
    UpdateTime(u64),
    UpdateUnsolicited(bool),
}

/// Pull complete `<...>` frames out of the receive buffer, discarding any
/// inter-frame bytes. Bytes of a partial trailing frame stay buffered.
fn extract_frames(buffer: &mut String) -> Vec<String> {
    let mut frames = Vec::new();
    loop {
        let Some(start) = buffer.find('<') else {
            buffer.clear();
            return frames;
        };
        let Some(end) = buffer[start..].find('>') else {
            buffer.drain(..start);
            return frames;
        };
        frames.push(buffer[start + 1..start + end].to_string());
        buffer.drain(..start + end + 1);
    }
}

/// Search the frame for known keywords in priority order; the first match
/// decides the interpretation. Unrecognized frames yield `None` and are
/// silently discarded.
fn parse_frame(frame: &str) -> Option<Request> {
    if frame.contains("PING") {
        return Some(Request::Ping);
    }
    if let Some(rest) = keyword_rest(frame, "TALLY.PGM") {
        return parse_tally(rest, Request::DumpProgram, Request::QueryProgram, Request::WriteProgram);
    }
    if let Some(rest) = keyword_rest(frame, "TALLY.PVW") {
        return parse_tally(rest, Request::DumpPreview, Request::QueryPreview, Request::WritePreview);
    }
    if let Some(rest) = keyword_rest(frame, "UPDATE.TIME") {
        let value = rest.strip_prefix('=')?.trim().parse::<u64>().ok()?;
        return Some(Request::UpdateTime(value));
    }
    if let Some(rest) = keyword_rest(frame, "UPDATE.UNSOLICITED") {
        let value = rest.strip_prefix('=')?.trim();
        return match value {
            "1" => Some(Request::UpdateUnsolicited(true)),
            "0" => Some(Request::UpdateUnsolicited(false)),
            _ => None,
        };
    }
    None
}

fn keyword_rest<'a>(frame: &'a str, keyword: &str) -> Option<&'a str> {
    let at = frame.find(keyword)?;
    Some(&frame[at + keyword.len()..])
}

fn parse_tally(
    rest: &str,
    dump: Request,
    query: fn(usize) -> Request,
    write: fn(usize, bool) -> Request,
) -> Option<Request> {
    let rest = rest.trim();
    if let Some(rest) = rest.strip_prefix(':') {
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let index = digits.parse::<usize>().ok()?;
        let rest = &rest[digits.len()..];
        if rest.starts_with('?') {
            return Some(query(index));
        }
        if let Some(value) = rest.strip_prefix('=') {
            return match value.trim() {
                "1" => Some(write(index, true)),
                "0" => Some(write(index, false)),
                _ => None,
            };
        }
        return None;
    }
    if rest.starts_with('?') {
        return Some(dump);
    }
    None
}

fn tally_line(program: bool, index: usize, value: bool) -> String {
    let kind = if program { "PGM" } else { "PVW" };
    format!("<TALLY.{}:{}={}>\n", kind, index, u8::from(value))
}

/// Handle of the running server.
#[derive(Debug)]
pub struct CommandPortHandle {
    pub local_addr: SocketAddr,
    join: JoinHandle<()>,
}

impl CommandPortHandle {
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// Bind the TCP listener and serve one client at a time. Further accepts
/// are closed immediately until the current client disconnects; the
/// listener itself stays bound.
#[instrument(skip(vector, router, cancel))]
pub async fn spawn(
    bind_addr: &str,
    vector: watch::Receiver<TallyVector>,
    router: mpsc::Sender<RouterMsg>,
    cancel: CancellationToken,
) -> Result<CommandPortHandle, CommandPortError> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| CommandPortError::Bind { addr: bind_addr.to_string(), reason: e.to_string() })?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| CommandPortError::Bind { addr: bind_addr.to_string(), reason: e.to_string() })?;
    info!("🎛️ Command port listening on {}", local_addr);

    let join = tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("⚠️ Command port accept failed: {}", e);
                    continue;
                }
            };
            info!(%peer, "🎛️ Command port client connected");
            serve_client(stream, &listener, vector.clone(), &router, &cancel).await;
            info!(%peer, "🎛️ Command port client disconnected");
            if cancel.is_cancelled() {
                break;
            }
        }
        debug!("Command port task ended");
    });

    Ok(CommandPortHandle { local_addr, join })
}

async fn serve_client(
    stream: TcpStream,
    listener: &TcpListener,
    mut vector: watch::Receiver<TallyVector>,
    router: &mpsc::Sender<RouterMsg>,
    cancel: &CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut read_buf = [0u8; 1024];
    let mut buffer = String::new();
    let mut unsolicited = true;
    let mut update_interval: Option<Duration> = None;
    let mut last_pushed = vector.borrow_and_update().clone();

    enum ClientStep {
        Shutdown,
        Rejected,
        Read(std::io::Result<usize>),
        VectorChanged,
        IntervalPush,
    }

    loop {
        let step = tokio::select! {
            _ = cancel.cancelled() => ClientStep::Shutdown,
            // A second client: close it right away, keep serving the first.
            extra = listener.accept() => {
                drop(extra);
                ClientStep::Rejected
            }
            read = reader.read(&mut read_buf) => ClientStep::Read(read),
            result = vector.changed(), if unsolicited => match result {
                Ok(()) => ClientStep::VectorChanged,
                Err(_) => ClientStep::Shutdown,
            },
            _ = push_timer(update_interval) => ClientStep::IntervalPush,
        };

        match step {
            ClientStep::Shutdown => return,
            ClientStep::Rejected => continue,
            ClientStep::Read(Ok(0)) | ClientStep::Read(Err(_)) => return,
            ClientStep::Read(Ok(n)) => {
                buffer.push_str(&String::from_utf8_lossy(&read_buf[..n]));
                for frame in extract_frames(&mut buffer) {
                    let Some(request) = parse_frame(&frame) else {
                        debug!(frame, "Unrecognized command-port frame discarded");
                        continue;
                    };
                    let snapshot = vector.borrow().clone();
                    let ok = handle_request(
                        request,
                        &snapshot,
                        &mut writer,
                        router,
                        &mut unsolicited,
                        &mut update_interval,
                    )
                    .await;
                    if !ok {
                        return;
                    }
                }
            }
            ClientStep::VectorChanged => {
                let current = vector.borrow_and_update().clone();
                if push_changes(&mut writer, &last_pushed, &current).await.is_err() {
                    return;
                }
                last_pushed = current;
            }
            ClientStep::IntervalPush => {
                let current = vector.borrow().clone();
                if push_dump(&mut writer, &current).await.is_err() {
                    return;
                }
                last_pushed = current;
            }
        }
    }
}

async fn push_timer(interval: Option<Duration>) {
    match interval {
        Some(interval) => tokio::time::sleep(interval).await,
        None => std::future::pending().await,
    }
}

async fn handle_request(
    request: Request,
    vector: &TallyVector,
    writer: &mut OwnedWriteHalf,
    router: &mpsc::Sender<RouterMsg>,
    unsolicited: &mut bool,
    update_interval: &mut Option<Duration>,
) -> bool {
    let result = match request {
        Request::Ping => writer.write_all(b"<PONG>\n").await,
        Request::DumpProgram => {
            let mut out = String::new();
            for (index, value) in vector.program.iter().enumerate() {
                out.push_str(&tally_line(true, index, *value));
            }
            writer.write_all(out.as_bytes()).await
        }
        Request::DumpPreview => {
            let mut out = String::new();
            for (index, value) in vector.preview.iter().enumerate() {
                out.push_str(&tally_line(false, index, *value));
            }
            writer.write_all(out.as_bytes()).await
        }
        Request::QueryProgram(index) if index < TALLY_VECTOR_SIZE => {
            writer.write_all(tally_line(true, index, vector.program[index]).as_bytes()).await
        }
        Request::QueryPreview(index) if index < TALLY_VECTOR_SIZE => {
            writer.write_all(tally_line(false, index, vector.preview[index]).as_bytes()).await
        }
        Request::QueryProgram(_) | Request::QueryPreview(_) => Ok(()),
        Request::WriteProgram(index, value) if index < TALLY_VECTOR_SIZE => {
            let _ = router.send(RouterMsg::DirectProgram { device_index: index as u32, value }).await;
            Ok(())
        }
        Request::WritePreview(index, value) if index < TALLY_VECTOR_SIZE => {
            let _ = router.send(RouterMsg::DirectPreview { device_index: index as u32, value }).await;
            Ok(())
        }
        Request::WriteProgram(..) | Request::WritePreview(..) => Ok(()),
        Request::UpdateTime(ms) => {
            *update_interval = if ms == 0 { None } else { Some(Duration::from_millis(ms)) };
            writer.write_all(format!("<UPDATE.TIME={}>\n", ms).as_bytes()).await
        }
        Request::UpdateUnsolicited(value) => {
            *unsolicited = value;
            writer.write_all(format!("<UPDATE.UNSOLICITED={}>\n", u8::from(value)).as_bytes()).await
        }
    };
    result.is_ok()
}

async fn push_changes(
    writer: &mut OwnedWriteHalf,
    previous: &TallyVector,
    current: &TallyVector,
) -> std::io::Result<()> {
    let mut out = String::new();
    for index in 0..TALLY_VECTOR_SIZE {
        if previous.program[index] != current.program[index] {
            out.push_str(&tally_line(true, index, current.program[index]));
        }
        if previous.preview[index] != current.preview[index] {
            out.push_str(&tally_line(false, index, current.preview[index]));
        }
    }
    if out.is_empty() {
        return Ok(());
    }
    writer.write_all(out.as_bytes()).await
}

async fn push_dump(writer: &mut OwnedWriteHalf, vector: &TallyVector) -> std::io::Result<()> {
    let mut out = String::new();
    for (index, value) in vector.program.iter().enumerate() {
        out.push_str(&tally_line(true, index, *value));
    }
    for (index, value) in vector.preview.iter().enumerate() {
        out.push_str(&tally_line(false, index, *value));
    }
    writer.write_all(out.as_bytes()).await
}

#[derive(Error, Debug)]
pub enum CommandPortError {
    #[error("could not bind command port to {addr}: {reason}")]
    Bind { addr: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::time::timeout;

    #[rstest]
    #[case("PING?", Some(Request::Ping))]
    #[case("TALLY.PGM?", Some(Request::DumpProgram))]
    #[case("TALLY.PVW?", Some(Request::DumpPreview))]
    #[case("TALLY.PGM:7?", Some(Request::QueryProgram(7)))]
    #[case("TALLY.PVW:31?", Some(Request::QueryPreview(31)))]
    #[case("TALLY.PGM:3=1", Some(Request::WriteProgram(3, true)))]
    #[case("TALLY.PVW:3=0", Some(Request::WritePreview(3, false)))]
    #[case("UPDATE.TIME=250", Some(Request::UpdateTime(250)))]
    #[case("UPDATE.TIME=0", Some(Request::UpdateTime(0)))]
    #[case("UPDATE.UNSOLICITED=1", Some(Request::UpdateUnsolicited(true)))]
    #[case("UPDATE.UNSOLICITED=0", Some(Request::UpdateUnsolicited(false)))]
    // Tolerant parsing: the keyword match wins over surrounding noise.
    #[case("noise PING noise", Some(Request::Ping))]
    #[case("GARBAGE", None)]
    #[case("TALLY.PGM:x?", None)]
    #[case("UPDATE.UNSOLICITED=2", None)]
    fn parses_the_command_grammar(#[case] frame: &str, #[case] expected: Option<Request>) {
        assert_eq!(parse_frame(frame), expected);
    }

    #[test]
    fn extract_frames_ignores_interframe_bytes_and_keeps_partials() {
        let mut buffer = "junk<PING?>more junk<TALLY.PGM?><TALLY.".to_string();

        let frames = extract_frames(&mut buffer);

        assert_eq!(frames, vec!["PING?".to_string(), "TALLY.PGM?".to_string()]);
        assert_eq!(buffer, "<TALLY.");
    }

    #[test]
    fn frames_without_brackets_are_discarded() {
        let mut buffer = "TALLY.PGM?\n".to_string();

        let frames = extract_frames(&mut buffer);

        assert!(frames.is_empty());
        assert!(buffer.is_empty());
    }

    struct Fixture {
        handle: CommandPortHandle,
        vector_tx: watch::Sender<TallyVector>,
        router_rx: mpsc::Receiver<RouterMsg>,
        cancel: CancellationToken,
    }

    async fn server() -> Fixture {
        let (vector_tx, vector_rx) = watch::channel(TallyVector::default());
        let (router_tx, router_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = spawn("127.0.0.1:0", vector_rx, router_tx, cancel.clone()).await.unwrap();
        Fixture { handle, vector_tx, router_rx, cancel }
    }

    async fn connect(fixture: &Fixture) -> (BufReader<tokio::net::tcp::OwnedReadHalf>, OwnedWriteHalf) {
        let stream = TcpStream::connect(fixture.handle.local_addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        (BufReader::new(reader), writer)
    }

    async fn read_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(2), reader.read_line(&mut line)).await.unwrap().unwrap();
        line.trim_end().to_string()
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let fixture = server().await;
        let (mut reader, mut writer) = connect(&fixture).await;

        writer.write_all(b"<PING?>\n").await.unwrap();

        assert_eq!(read_line(&mut reader).await, "<PONG>");
        fixture.cancel.cancel();
        fixture.handle.join().await;
    }

    #[tokio::test]
    async fn program_dump_lists_all_thirtytwo_indices() {
        let fixture = server().await;
        let mut vector = TallyVector::default();
        vector.program[5] = true;
        fixture.vector_tx.send(vector).unwrap();
        let (mut reader, mut writer) = connect(&fixture).await;

        writer.write_all(b"<TALLY.PGM?>\n").await.unwrap();

        for index in 0..TALLY_VECTOR_SIZE {
            let expected = format!("<TALLY.PGM:{}={}>", index, u8::from(index == 5));
            assert_eq!(read_line(&mut reader).await, expected);
        }
        fixture.cancel.cancel();
        fixture.handle.join().await;
    }

    #[tokio::test]
    async fn unsolicited_pushes_follow_vector_changes() {
        let fixture = server().await;
        let (mut reader, _writer) = connect(&fixture).await;
        // Give the server a beat to take its baseline snapshot.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut vector = TallyVector::default();
        vector.program[0] = true;
        fixture.vector_tx.send(vector).unwrap();

        assert_eq!(read_line(&mut reader).await, "<TALLY.PGM:0=1>");
        fixture.cancel.cancel();
        fixture.handle.join().await;
    }

    #[tokio::test]
    async fn unsolicited_off_silences_pushes_until_queried() {
        let fixture = server().await;
        let (mut reader, mut writer) = connect(&fixture).await;

        writer.write_all(b"<UPDATE.UNSOLICITED=0>\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "<UPDATE.UNSOLICITED=0>");

        let mut vector = TallyVector::default();
        vector.program[0] = true;
        fixture.vector_tx.send(vector).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        writer.write_all(b"<TALLY.PGM:0?>\n").await.unwrap();
        // The next line is the query answer, not a push.
        assert_eq!(read_line(&mut reader).await, "<TALLY.PGM:0=1>");
        fixture.cancel.cancel();
        fixture.handle.join().await;
    }

    #[tokio::test]
    async fn inbound_writes_reach_the_router() {
        let mut fixture = server().await;
        let (_reader, mut writer) = connect(&fixture).await;

        writer.write_all(b"<TALLY.PGM:3=1>\n").await.unwrap();

        let msg = timeout(Duration::from_secs(2), fixture.router_rx.recv()).await.unwrap().unwrap();
        match msg {
            RouterMsg::DirectProgram { device_index, value } => {
                assert_eq!(device_index, 3);
                assert!(value);
            }
            other => panic!("unexpected message {:?}", other),
        }
        fixture.cancel.cancel();
        fixture.handle.join().await;
    }

    #[tokio::test]
    async fn a_second_client_is_rejected_until_the_first_leaves() {
        let fixture = server().await;
        let (mut first_reader, mut first_writer) = connect(&fixture).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The second connection is closed immediately.
        let (mut second_reader, _second_writer) = connect(&fixture).await;
        let mut line = String::new();
        let n = timeout(Duration::from_secs(2), second_reader.read_line(&mut line)).await.unwrap().unwrap();
        assert_eq!(n, 0);

        // The first client still works.
        first_writer.write_all(b"<PING?>\n").await.unwrap();
        assert_eq!(read_line(&mut first_reader).await, "<PONG>");

        fixture.cancel.cancel();
        fixture.handle.join().await;
    }

    #[tokio::test]
    async fn periodic_pushes_dump_the_full_vector() {
        let fixture = server().await;
        let (mut reader, mut writer) = connect(&fixture).await;

        writer.write_all(b"<UPDATE.TIME=50>\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "<UPDATE.TIME=50>");

        // First periodic dump: 32 program lines then 32 preview lines.
        for index in 0..TALLY_VECTOR_SIZE {
            assert_eq!(read_line(&mut reader).await, format!("<TALLY.PGM:{}=0>", index));
        }
        for index in 0..TALLY_VECTOR_SIZE {
            assert_eq!(read_line(&mut reader).await, format!("<TALLY.PVW:{}=0>", index));
        }
        fixture.cancel.cancel();
        fixture.handle.join().await;
    }
}
