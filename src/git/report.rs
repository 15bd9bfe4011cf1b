//! Receive-pack status report encoding.
//!
//! The report is framed as a single outer packet line whose payload is the
//! band byte `0x01` followed by the inner status lines and a literal flush.
//! Clients of this gateway depend on that exact nesting, so the layout is
//! reproduced byte for byte:
//!
//! ```text
//! PKT( 0x01
//!      PKT("unpack <status>\n")
//!      PKT("ok <ref>\n") | PKT("ng <ref> <error>\n") ...
//!      "0000" )
//! ```

use super::pktline::{encode, FrameError, FLUSH_PKT};

/// Band byte prefixed to the report payload.
pub const REPORT_BAND: u8 = 0x01;

/// Result of updating a single ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefStatus {
    pub ref_name: String,
    /// `None` (or an empty string) reports success.
    pub error: Option<String>,
}

impl RefStatus {
    pub fn ok(ref_name: impl Into<String>) -> Self {
        Self {
            ref_name: ref_name.into(),
            error: None,
        }
    }

    pub fn failed(ref_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ref_name: ref_name.into(),
            error: Some(error.into()),
        }
    }

    fn line(&self) -> String {
        match self.error.as_deref() {
            Some(err) if !err.is_empty() => format!("ng {} {}\n", self.ref_name, err),
            _ => format!("ok {}\n", self.ref_name),
        }
    }
}

/// Everything a push report carries, in the order refs were processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub unpack_status: String,
    pub refs: Vec<RefStatus>,
}

impl Default for PushOutcome {
    fn default() -> Self {
        Self {
            unpack_status: "ok".to_string(),
            refs: Vec::new(),
        }
    }
}

impl PushOutcome {
    pub fn new(refs: Vec<RefStatus>) -> Self {
        Self {
            refs,
            ..Self::default()
        }
    }

    pub fn with_unpack_status(mut self, status: impl Into<String>) -> Self {
        self.unpack_status = status.into();
        self
    }
}

/// Build the wire bytes for `outcome`.
///
/// Fails with [`FrameError::Overflow`] when a status line or the assembled
/// report does not fit in a packet line.
pub fn build_report(outcome: &PushOutcome) -> Result<Vec<u8>, FrameError> {
    let mut inner = vec![REPORT_BAND];
    inner.extend(encode(format!("unpack {}\n", outcome.unpack_status).as_bytes())?);
    for status in &outcome.refs {
        inner.extend(encode(status.line().as_bytes())?);
    }
    inner.extend_from_slice(FLUSH_PKT);
    encode(&inner)
}
