//! Credential retrieval over the robot's raw TLS probe.
//!
//! Once the robot is put into pairing mode (HOME held until the ring
//! flashes), it answers a fixed 7-byte probe on its MQTT port with a binary
//! frame carrying the MQTT password.  Frame layout as observed on firmware:
//!
//! ```text
//!   [ 0 .. 13)  header          credential starts at byte 13
//!   [13 .. n)   password (UTF-8)
//! ```
//!
//! Some firmware first sends a 2-byte status record; the following record
//! then carries the password from byte 9.  A record of 7 bytes or less means
//! no password is available (robot not in pairing mode, or an error).

use std::net::IpAddr;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RoombaError};
use crate::tls::RobotConnector;

/// TLS port shared by the credential probe and the MQTT session.
pub const CREDENTIAL_PORT: u16 = 8883;

/// Probe that asks the robot for its password.
pub const PASSWORD_PROBE: [u8; 7] = [0xf0, 0x05, 0xef, 0xcc, 0x3b, 0x29, 0x00];

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUF_SIZE: usize = 2048;

const SLICE_FROM:          usize = 13;
const SLICE_FROM_AFTER_ST: usize = 9;
const STATUS_RECORD_LEN:   usize = 2;
const MIN_FRAME_LEN:       usize = 7;

// ── Frame parser ──────────────────────────────────────────────────────────────

/// What to do after feeding one read into [`CredentialFrames`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStep {
    /// Keep reading.
    More,
    /// Stop: the contained credential is final (possibly empty).
    Done(String),
}

/// Position-dependent slicing of the probe response.
///
/// Each call to [`feed`](Self::feed) must carry exactly the bytes returned by
/// one read; record boundaries matter.
#[derive(Debug)]
pub struct CredentialFrames {
    slice_from: usize,
}

impl Default for CredentialFrames {
    fn default() -> Self {
        Self { slice_from: SLICE_FROM }
    }
}

impl CredentialFrames {
    pub fn new() -> Self { Self::default() }

    pub fn feed(&mut self, read: &[u8]) -> Result<FrameStep> {
        if read.len() == STATUS_RECORD_LEN {
            self.slice_from = SLICE_FROM_AFTER_ST;
            return Ok(FrameStep::More);
        }
        // Also covers a zero-length read (peer closed).
        if read.len() <= MIN_FRAME_LEN {
            return Ok(FrameStep::Done(String::new()));
        }
        let body = read.get(self.slice_from..).ok_or_else(|| {
            RoombaError::Handshake(format!(
                "credential frame of {} bytes is shorter than offset {}",
                read.len(),
                self.slice_from
            ))
        })?;
        Ok(FrameStep::Done(String::from_utf8_lossy(body).into_owned()))
    }
}

// ── Stream exchange ───────────────────────────────────────────────────────────

/// Send the probe on an established stream and read the credential back.
pub async fn exchange_credential<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&PASSWORD_PROBE)
        .await
        .map_err(|e| RoombaError::Handshake(format!("probe write: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| RoombaError::Handshake(format!("probe flush: {e}")))?;

    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut frames = CredentialFrames::new();
    loop {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| RoombaError::Handshake(format!("probe read: {e}")))?;
        debug!("credential probe: read {n} bytes");
        match frames.feed(&buf[..n])? {
            FrameStep::More => continue,
            FrameStep::Done(credential) => return Ok(credential),
        }
    }
}

// ── Retriever ─────────────────────────────────────────────────────────────────

/// Knobs for [`retrieve_credential`].
#[derive(Debug, Clone)]
pub struct RetrieverOptions {
    pub port:    u16,
    /// Bound on the whole retrieval; `None` waits as long as the robot does.
    pub timeout: Option<Duration>,
}

impl Default for RetrieverOptions {
    fn default() -> Self {
        Self { port: CREDENTIAL_PORT, timeout: Some(DEFAULT_TIMEOUT) }
    }
}

/// Retrieve the MQTT password from the robot at `host`.
///
/// A TLS negotiation failure is logged and yields an empty credential;
/// an unreachable host or an elapsed timeout is a [`RoombaError::Connection`].
pub async fn retrieve_credential(
    connector: &RobotConnector,
    host:      IpAddr,
    opts:      &RetrieverOptions,
) -> Result<String> {
    let fut = retrieve(connector, host, opts.port);
    match opts.timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            RoombaError::Connection(format!("{host}: no credential within {limit:?}"))
        })?,
        None => fut.await,
    }
}

async fn retrieve(connector: &RobotConnector, host: IpAddr, port: u16) -> Result<String> {
    let tcp = connector.open(host, port).await?;
    let mut tls = match connector.handshake(host, tcp).await {
        Ok(s) => s,
        Err(e) => {
            warn!("credential: TLS authentication failed, closing connection: {e}");
            return Ok(String::new());
        }
    };
    let credential = exchange_credential(&mut tls).await?;
    if credential.is_empty() {
        debug!("credential: {host} returned no password");
    }
    let _ = tls.shutdown().await;
    Ok(credential)
}
