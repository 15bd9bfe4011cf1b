//! Subprocess I/O bridge.
//!
//! Binds one spawned pack subprocess to one [`DuplexChannel`]:
//!
//! - client bytes arriving on the channel are written to the child's stdin;
//!   the sender side being dropped (client EOF or connection teardown) closes
//!   stdin and nothing else
//! - child stdout is copied to the channel unmodified and in order
//! - child stderr goes to the client's stderr stream and to the log, never
//!   into stdout
//! - when the child exits, its status is reported and the channel is closed
//! - when the connection goes away, stdin is closed and stdout is drained
//!   without forwarding until the child exits or its grace runs out
//!
//! The stream observers below only watch bytes going past; they never alter
//! what is forwarded.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::channel::DuplexChannel;
use crate::git::pktline::{self, PacketLine};
use crate::git::report::{build_report, PushOutcome, RefStatus};
use crate::git::splitter::FrameSplitter;
use crate::git::GitVerb;

const READ_BUF_LEN: usize = 64 * 1024;

/// Knobs for one bridged subprocess.
#[derive(Debug, Clone, Copy)]
pub struct BridgeOptions {
    pub verb: GitVerb,
    /// How long a child may keep running after its connection went away
    /// before it is killed.
    pub shutdown_grace: Duration,
}

/// What happened over the lifetime of the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSummary {
    pub exit_code: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub advertised_refs: usize,
    /// Refs the client asked to update (receive-pack only).
    pub pushed_refs: Vec<String>,
    /// Whether the gateway wrote its own failure report.
    pub reported_failure: bool,
}

/// Drive `child` against `channel` until the child exits.
///
/// `input` carries client bytes; closing it is the client EOF.  `cancel`
/// fires when the owning connection goes away: stdin is closed, output is
/// drained without being forwarded, and the child gets `shutdown_grace` to
/// exit before it is killed.
#[instrument(skip_all, fields(verb = %opts.verb, pid = ?child.id(), peer = ?channel.peer()))]
pub async fn run_bridge(
    mut child: Child,
    channel: Arc<dyn DuplexChannel>,
    input: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    opts: BridgeOptions,
) -> Result<BridgeSummary> {
    let stdin = child.stdin.take().context("child stdin was not piped")?;
    let stdout = child.stdout.take().context("child stdout was not piped")?;
    let stderr = child.stderr.take().context("child stderr was not piped")?;

    let stdin_done = CancellationToken::new();
    let track_push = opts.verb == GitVerb::ReceivePack;
    let stdin_task = tokio::spawn(feed_stdin(
        stdin,
        input,
        cancel.clone(),
        stdin_done.clone(),
        track_push,
    ));
    let stdout_task = tokio::spawn(pump_stdout(stdout, Arc::clone(&channel), cancel.clone()));
    let stderr_task = tokio::spawn(pump_stderr(stderr, Arc::clone(&channel)));

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        () = cancel.cancelled() => None,
    };
    let status = match exited {
        Some(status) => status.context("failed to wait for subprocess")?,
        None => {
            debug!("connection closed; waiting for subprocess to finish");
            wait_or_kill(&mut child, opts.shutdown_grace).await?
        }
    };

    // The child is gone: stop forwarding client bytes and collect what the
    // stdin side observed.
    stdin_done.cancel();
    let (bytes_in, push) = stdin_task.await.unwrap_or_default();
    let (bytes_out, advertised_refs) = stdout_task.await.unwrap_or_default();
    if let Err(e) = stderr_task.await {
        debug!(error = %e, "stderr pump task failed");
    }

    let exit_code = exit_code(&status);
    debug!(exit_code, bytes_in, bytes_out, "subprocess exited");

    let mut reported_failure = false;
    if track_push && !status.success() && push.wants_report() && !cancel.is_cancelled() {
        let reason = format!("{} exited with status {exit_code}", opts.verb);
        match build_report(&push.failure_outcome(&reason)) {
            Ok(report) => {
                warn!(refs = push.refs.len(), %reason, "reporting failed push to client");
                reported_failure = channel.write(&report).await.is_ok();
            }
            Err(e) => warn!(error = %e, "failed to encode push failure report"),
        }
    }

    if let Err(e) = channel.exit_status(exit_code).await {
        debug!(error = %e, "could not deliver exit status");
    }
    if let Err(e) = channel.lose_connection().await {
        debug!(error = %e, "channel already closed");
    }

    Ok(BridgeSummary {
        exit_code,
        bytes_in,
        bytes_out,
        advertised_refs,
        pushed_refs: push.refs,
        reported_failure,
    })
}

fn exit_code(status: &ExitStatus) -> u32 {
    // Death by signal has no code.
    status.code().map(|c| c as u32).unwrap_or(1)
}

async fn wait_or_kill(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.context("failed to wait for subprocess"),
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "subprocess outlived its connection; killing");
            child.kill().await.context("failed to kill subprocess")?;
            child.wait().await.context("failed to reap killed subprocess")
        }
    }
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

async fn feed_stdin(
    mut stdin: ChildStdin,
    mut input: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    done: CancellationToken,
    track_push: bool,
) -> (u64, PushCommands) {
    let mut push = PushCommands::default();
    let mut bytes_in = 0u64;

    loop {
        let chunk = tokio::select! {
            chunk = input.recv() => chunk,
            () = cancel.cancelled() => {
                debug!("connection closed; closing subprocess stdin");
                break;
            }
            () = done.cancelled() => break,
        };
        let Some(chunk) = chunk else {
            debug!("client sent EOF; closing subprocess stdin");
            break;
        };
        if track_push {
            push.observe(&chunk);
        }
        bytes_in += chunk.len() as u64;
        let written = tokio::select! {
            res = stdin.write_all(&chunk) => res,
            () = cancel.cancelled() => break,
            () = done.cancelled() => break,
        };
        if let Err(e) = written {
            debug!(error = %e, "failed to write to subprocess stdin (process may have exited)");
            break;
        }
    }

    // Dropping the handle closes the pipe, signalling EOF to the child.
    drop(stdin);
    (bytes_in, push)
}

/// Copy stdout to the channel until EOF.  Once the connection is gone, or
/// the channel refuses a write, output is still read to EOF but discarded so
/// the child never blocks on a full pipe.
async fn pump_stdout<R>(
    mut stdout: R,
    channel: Arc<dyn DuplexChannel>,
    cancel: CancellationToken,
) -> (u64, usize)
where
    R: AsyncRead + Unpin,
{
    let mut adverts = RefAdvertisement::default();
    let mut buf = vec![0u8; READ_BUF_LEN];
    let mut total = 0u64;
    let mut forward = true;

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                adverts.observe(&buf[..n]);
                total += n as u64;
                if !forward || cancel.is_cancelled() {
                    continue;
                }
                let written = tokio::select! {
                    res = channel.write(&buf[..n]) => res,
                    () = cancel.cancelled() => Ok(()),
                };
                if let Err(e) = written {
                    debug!(error = %e, "client channel closed while forwarding stdout");
                    forward = false;
                }
            }
            Err(e) => {
                debug!(error = %e, "error reading subprocess stdout");
                break;
            }
        }
    }

    (total, adverts.refs)
}

async fn pump_stderr<R>(mut stderr: R, channel: Arc<dyn DuplexChannel>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FrameSplitter::delimited(&b"\n"[..]);
    let mut buf = vec![0u8; 8 * 1024];
    let mut forward = true;

    loop {
        let n = match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for line in lines.feed(&buf[..n]).flatten() {
            warn!(line = %String::from_utf8_lossy(&line), "subprocess stderr");
        }
        if forward && channel.write_stderr(&buf[..n]).await.is_err() {
            forward = false;
        }
    }

    let tail = lines.buffered();
    if !tail.is_empty() {
        warn!(line = %String::from_utf8_lossy(tail), "subprocess stderr");
    }
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Counts the refs a pack subprocess advertises before its first flush.
#[derive(Debug)]
struct RefAdvertisement {
    frames: FrameSplitter,
    refs: usize,
    done: bool,
}

impl Default for RefAdvertisement {
    fn default() -> Self {
        Self {
            frames: FrameSplitter::length_prefixed(),
            refs: 0,
            done: false,
        }
    }
}

impl RefAdvertisement {
    fn observe(&mut self, chunk: &[u8]) {
        if self.done {
            return;
        }
        let mut finished = false;
        let mut refs = 0;
        for frame in self.frames.feed(chunk) {
            let packet = frame.and_then(|f| pktline::decode(&f, 0).map(|(p, _)| p));
            match packet {
                Ok(PacketLine::Flush) | Err(_) => {
                    finished = true;
                    break;
                }
                Ok(PacketLine::Data(payload)) => {
                    if payload.starts_with(b"version ") {
                        continue;
                    }
                    match pktline::parse_reference(&payload) {
                        Ok((oid, name)) => {
                            trace!(%oid, %name, "advertised ref");
                            refs += 1;
                        }
                        Err(_) => {
                            finished = true;
                            break;
                        }
                    }
                }
            }
        }
        self.refs += refs;
        if finished {
            self.done = true;
            debug!(refs = self.refs, "ref advertisement complete");
        }
    }
}

/// Ref-update commands a push client sends before its pack data.
#[derive(Debug)]
struct PushCommands {
    frames: FrameSplitter,
    refs: Vec<String>,
    report_status: bool,
    done: bool,
}

impl Default for PushCommands {
    fn default() -> Self {
        Self {
            frames: FrameSplitter::length_prefixed(),
            refs: Vec::new(),
            report_status: false,
            done: false,
        }
    }
}

impl PushCommands {
    fn observe(&mut self, chunk: &[u8]) {
        if self.done {
            return;
        }
        let mut finished = false;
        for frame in self.frames.feed(chunk) {
            let packet = frame.and_then(|f| pktline::decode(&f, 0).map(|(p, _)| p));
            let payload = match packet {
                Ok(PacketLine::Data(payload)) => payload,
                Ok(PacketLine::Flush) | Err(_) => {
                    finished = true;
                    break;
                }
            };

            if let Some(caps) = pktline::capabilities(&payload) {
                let caps = String::from_utf8_lossy(caps);
                if caps.split_whitespace().any(|c| c == "report-status") {
                    self.report_status = true;
                }
            }

            let command = String::from_utf8_lossy(pktline::strip_capabilities(&payload)).into_owned();
            let tokens: Vec<&str> = command.split_whitespace().collect();
            match tokens.as_slice() {
                [_old, _new, name] => self.refs.push((*name).to_string()),
                _ => {
                    finished = true;
                    break;
                }
            }
        }
        if finished {
            self.done = true;
        }
    }

    fn wants_report(&self) -> bool {
        self.report_status && !self.refs.is_empty()
    }

    fn failure_outcome(&self, reason: &str) -> PushOutcome {
        PushOutcome::new(
            self.refs
                .iter()
                .map(|name| RefStatus::failed(name.clone(), reason))
                .collect(),
        )
        .with_unpack_status(reason)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::process::Stdio;

    use super::*;
    use crate::git::pktline::encode;
    use crate::ssh::channel::recording::RecordingChannel;

    const OID_A: &str = "7217a7c7e582c46cec22a130adf4b9d7d950fba0";
    const OID_B: &str = "525128480b96c89e6418b1e40909bf6c5b2d580f";

    fn opts(verb: GitVerb) -> BridgeOptions {
        BridgeOptions {
            verb,
            shutdown_grace: Duration::from_secs(5),
        }
    }

    fn sh(script: &str) -> Child {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn echoes_input_and_closes_on_exit() {
        let channel = Arc::new(RecordingChannel::default());
        let (tx, rx) = mpsc::channel(8);
        tx.try_send(Bytes::from_static(b"hello ")).unwrap();
        tx.try_send(Bytes::from_static(b"world")).unwrap();
        drop(tx);

        let summary = run_bridge(
            sh("cat"),
            channel.clone(),
            rx,
            CancellationToken::new(),
            opts(GitVerb::UploadPack),
        )
        .await
        .unwrap();

        let rec = channel.snapshot();
        assert_eq!(rec.stdout, b"hello world");
        assert_eq!(rec.exit_status, Some(0));
        assert!(rec.closed);
        assert_eq!(rec.late_writes, 0);
        assert_eq!(summary.bytes_in, 11);
        assert_eq!(summary.bytes_out, 11);
    }

    #[tokio::test]
    async fn eof_closes_stdin_without_killing() {
        // The child keeps running after stdin closes and still reports.
        let channel = Arc::new(RecordingChannel::default());
        let (tx, rx) = mpsc::channel::<Bytes>(8);
        drop(tx);

        let summary = run_bridge(
            sh("cat >/dev/null; echo after-eof"),
            channel.clone(),
            rx,
            CancellationToken::new(),
            opts(GitVerb::UploadPack),
        )
        .await
        .unwrap();

        assert_eq!(channel.snapshot().stdout, b"after-eof\n");
        assert_eq!(summary.exit_code, 0);
    }

    #[tokio::test]
    async fn stderr_is_kept_out_of_stdout() {
        let channel = Arc::new(RecordingChannel::default());
        let (tx, rx) = mpsc::channel::<Bytes>(8);
        drop(tx);

        let summary = run_bridge(
            sh("echo out; echo err >&2; exit 3"),
            channel.clone(),
            rx,
            CancellationToken::new(),
            opts(GitVerb::UploadPack),
        )
        .await
        .unwrap();

        let rec = channel.snapshot();
        assert_eq!(rec.stdout, b"out\n");
        assert_eq!(rec.stderr, b"err\n");
        assert_eq!(rec.exit_status, Some(3));
        assert_eq!(summary.exit_code, 3);
        assert!(rec.closed);
    }

    #[tokio::test]
    async fn counts_advertised_refs() {
        let mut advert = encode(format!("{OID_A} HEAD\0report-status delete-refs\n").as_bytes()).unwrap();
        advert.extend(encode(format!("{OID_A} refs/heads/master\n").as_bytes()).unwrap());
        advert.extend(encode(format!("{OID_B} refs/tags/v1.0\n").as_bytes()).unwrap());
        advert.extend_from_slice(b"0000");

        let mut obs = RefAdvertisement::default();
        let (first, rest) = advert.split_at(30);
        obs.observe(first);
        obs.observe(rest);
        obs.observe(b"garbage that follows the flush");
        assert_eq!(obs.refs, 3);
        assert!(obs.done);
    }

    #[test]
    fn push_commands_are_collected() {
        let mut wire = encode(
            format!("{OID_A} {OID_B} refs/heads/master\0report-status side-band-64k\n").as_bytes(),
        )
        .unwrap();
        wire.extend(encode(format!("{OID_B} {OID_A} refs/heads/x\n").as_bytes()).unwrap());
        wire.extend_from_slice(b"0000PACK....");

        let mut push = PushCommands::default();
        push.observe(&wire);
        assert!(push.done);
        assert!(push.wants_report());
        assert_eq!(push.refs, vec!["refs/heads/master", "refs/heads/x"]);
    }

    #[test]
    fn push_without_report_status() {
        let mut wire = encode(format!("{OID_A} {OID_B} refs/heads/master\0quiet\n").as_bytes()).unwrap();
        wire.extend_from_slice(b"0000");
        let mut push = PushCommands::default();
        push.observe(&wire);
        assert!(!push.wants_report());
    }

    #[tokio::test]
    async fn failed_receive_pack_reports_each_ref() {
        let channel = Arc::new(RecordingChannel::default());
        let (tx, rx) = mpsc::channel(8);
        let mut wire =
            encode(format!("{OID_A} {OID_B} refs/heads/master\0report-status\n").as_bytes()).unwrap();
        wire.extend_from_slice(b"0000");
        tx.try_send(Bytes::from(wire)).unwrap();
        drop(tx);

        let summary = run_bridge(
            sh("cat >/dev/null; exit 1"),
            channel.clone(),
            rx,
            CancellationToken::new(),
            opts(GitVerb::ReceivePack),
        )
        .await
        .unwrap();

        assert!(summary.reported_failure);
        assert_eq!(summary.pushed_refs, vec!["refs/heads/master"]);

        let rec = channel.snapshot();
        let (outer, _) = pktline::decode(&rec.stdout, 0).unwrap();
        let inner = pktline::decode_all(&outer.payload()[1..]).unwrap();
        assert_eq!(
            inner[1],
            PacketLine::Data(
                b"ng refs/heads/master git-receive-pack exited with status 1\n".to_vec()
            )
        );
        assert_eq!(rec.exit_status, Some(1));
    }

    #[tokio::test]
    async fn successful_receive_pack_is_not_annotated() {
        let channel = Arc::new(RecordingChannel::default());
        let (tx, rx) = mpsc::channel(8);
        let mut wire =
            encode(format!("{OID_A} {OID_B} refs/heads/master\0report-status\n").as_bytes()).unwrap();
        wire.extend_from_slice(b"0000");
        tx.try_send(Bytes::from(wire)).unwrap();
        drop(tx);

        let summary = run_bridge(
            sh("cat >/dev/null"),
            channel.clone(),
            rx,
            CancellationToken::new(),
            opts(GitVerb::ReceivePack),
        )
        .await
        .unwrap();

        assert!(!summary.reported_failure);
        assert!(channel.snapshot().stdout.is_empty());
    }

    #[tokio::test]
    async fn cancelled_connection_kills_after_grace() {
        let channel = Arc::new(RecordingChannel::default());
        let (_tx, rx) = mpsc::channel::<Bytes>(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = run_bridge(
            sh("exec sleep 30"),
            channel.clone(),
            rx,
            cancel,
            BridgeOptions {
                verb: GitVerb::UploadPack,
                shutdown_grace: Duration::from_millis(100),
            },
        )
        .await
        .unwrap();

        assert_eq!(summary.exit_code, 1);
        assert!(channel.snapshot().closed);
    }

    #[tokio::test]
    async fn cancelled_connection_lets_child_exit_cleanly() {
        let channel = Arc::new(RecordingChannel::default());
        let (tx, rx) = mpsc::channel::<Bytes>(8);
        drop(tx);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = std::time::Instant::now();
        let summary = run_bridge(sh("cat"), channel.clone(), rx, cancel, opts(GitVerb::UploadPack))
            .await
            .unwrap();

        assert_eq!(summary.exit_code, 0);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(channel.snapshot().closed);
    }

    #[tokio::test]
    async fn cancelled_connection_drains_output() {
        // More output than a pipe buffer holds, with the client sender still
        // alive: stdin must be closed and stdout read to EOF for the child to
        // finish on its own.
        let channel = Arc::new(RecordingChannel::default());
        let (_tx, rx) = mpsc::channel::<Bytes>(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = std::time::Instant::now();
        let summary = run_bridge(
            sh("cat >/dev/null; head -c 200000 /dev/zero"),
            channel.clone(),
            rx,
            cancel,
            opts(GitVerb::UploadPack),
        )
        .await
        .unwrap();

        assert_eq!(summary.exit_code, 0);
        assert_eq!(summary.bytes_out, 200_000);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(channel.snapshot().stdout.is_empty());
    }

    #[tokio::test]
    async fn refused_writes_do_not_stall_the_child() {
        let channel = Arc::new(RecordingChannel::refusing());
        let (tx, rx) = mpsc::channel::<Bytes>(8);
        drop(tx);

        let summary = run_bridge(
            sh("head -c 200000 /dev/zero"),
            channel.clone(),
            rx,
            CancellationToken::new(),
            opts(GitVerb::UploadPack),
        )
        .await
        .unwrap();

        assert_eq!(summary.exit_code, 0);
        assert_eq!(summary.bytes_out, 200_000);
        assert_eq!(channel.snapshot().exit_status, Some(0));
    }
}
