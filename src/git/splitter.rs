//! Incremental frame splitting over an accumulating byte buffer.
//!
//! Network reads never line up with protocol frame boundaries, so callers
//! [`feed`](FrameSplitter::feed) whatever chunk just arrived and drain the
//! splices that became complete.  Incomplete tails stay buffered for the next
//! feed.

use bytes::{Bytes, BytesMut};

use super::pktline::{self, FrameError, PKT_HEADER_LEN};

/// How the buffer is carved into splices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitStrategy {
    /// Spans between non-overlapping occurrences of a fixed byte sequence.
    /// The delimiter itself is not part of any splice.
    Delimiter(Bytes),
    /// Whole packet lines, header included, sized by their 4-hex-digit
    /// length prefix.
    LengthPrefixed,
}

/// Accumulates bytes and yields complete splices.
#[derive(Debug)]
pub struct FrameSplitter {
    strategy: SplitStrategy,
    buf: BytesMut,
    /// Offset from which the next delimiter search may start; bytes before
    /// it are known not to begin a delimiter.
    scan_from: usize,
}

impl FrameSplitter {
    /// Split on `delimiter` (e.g. `b"\n"`, `b"\0"` or `b"0000"`).
    pub fn delimited(delimiter: impl Into<Bytes>) -> Self {
        let delimiter = delimiter.into();
        assert!(!delimiter.is_empty(), "splitter delimiter must not be empty");
        Self::with_strategy(SplitStrategy::Delimiter(delimiter))
    }

    /// Split into length-prefixed packet lines.
    pub fn length_prefixed() -> Self {
        Self::with_strategy(SplitStrategy::LengthPrefixed)
    }

    fn with_strategy(strategy: SplitStrategy) -> Self {
        Self {
            strategy,
            buf: BytesMut::new(),
            scan_from: 0,
        }
    }

    /// Append `chunk` and return the splices it completed.
    ///
    /// The iterator is lazy: splices not pulled before it is dropped remain
    /// buffered and are produced by the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Splices<'_> {
        self.buf.extend_from_slice(chunk);
        Splices {
            splitter: self,
            failed: false,
        }
    }

    /// Bytes received but not yet part of a complete splice.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    fn next_delimited(&mut self) -> Option<Bytes> {
        let SplitStrategy::Delimiter(delimiter) = &self.strategy else {
            return None;
        };
        let dlen = delimiter.len();
        if self.buf.len() < dlen {
            return None;
        }

        let found = self.buf[self.scan_from..]
            .windows(dlen)
            .position(|w| w == delimiter.as_ref())
            .map(|pos| self.scan_from + pos);

        match found {
            Some(at) => {
                let splice = self.buf.split_to(at).freeze();
                let _ = self.buf.split_to(dlen);
                self.scan_from = 0;
                Some(splice)
            }
            None => {
                // A delimiter may still start in the last `dlen - 1` bytes.
                self.scan_from = self.buf.len() + 1 - dlen;
                None
            }
        }
    }

    fn next_length_prefixed(&mut self) -> Option<Result<Bytes, FrameError>> {
        if self.buf.len() < PKT_HEADER_LEN {
            return None;
        }
        let declared = match pktline::parse_length(&self.buf[..PKT_HEADER_LEN]) {
            Ok(n) => n,
            Err(e) => return Some(Err(e)),
        };
        let frame_len = match declared {
            0 => PKT_HEADER_LEN,
            n if n < PKT_HEADER_LEN => return Some(Err(FrameError::Undersized { declared: n })),
            n => n,
        };
        if self.buf.len() < frame_len {
            return None;
        }
        Some(Ok(self.buf.split_to(frame_len).freeze()))
    }
}

/// Lazy sequence of splices completed by one [`FrameSplitter::feed`] call.
///
/// Stops after the first error; the offending bytes stay buffered.
pub struct Splices<'a> {
    splitter: &'a mut FrameSplitter,
    failed: bool,
}

impl Iterator for Splices<'_> {
    type Item = Result<Bytes, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = match self.splitter.strategy {
            SplitStrategy::Delimiter(_) => self.splitter.next_delimited().map(Ok),
            SplitStrategy::LengthPrefixed => self.splitter.next_length_prefixed(),
        };
        if matches!(item, Some(Err(_))) {
            self.failed = true;
        }
        item
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(splices: Splices<'_>) -> Vec<Vec<u8>> {
        splices.map(|s| s.unwrap().to_vec()).collect()
    }

    #[test]
    fn newline_splits_and_keeps_tail() {
        let mut s = FrameSplitter::delimited(&b"\n"[..]);
        assert_eq!(collect(s.feed(b"one\ntwo\nthr")), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(s.buffered(), b"thr");
        assert_eq!(collect(s.feed(b"ee\n")), vec![b"three".to_vec()]);
        assert!(s.buffered().is_empty());
    }

    #[test]
    fn previously_buffered_bytes_form_a_splice() {
        let mut s = FrameSplitter::delimited(&b"\0"[..]);
        assert!(collect(s.feed(b"abc")).is_empty());
        assert_eq!(collect(s.feed(b"\0")), vec![b"abc".to_vec()]);
    }

    #[test]
    fn delimiter_split_across_feeds() {
        let mut s = FrameSplitter::delimited(&b"0000"[..]);
        assert!(collect(s.feed(b"abc00")).is_empty());
        assert!(collect(s.feed(b"0")).is_empty());
        assert_eq!(collect(s.feed(b"0def")), vec![b"abc".to_vec()]);
        assert_eq!(s.buffered(), b"def");
    }

    #[test]
    fn adjacent_delimiters_yield_empty_splice() {
        let mut s = FrameSplitter::delimited(&b"\n"[..]);
        assert_eq!(
            collect(s.feed(b"a\n\nb\n")),
            vec![b"a".to_vec(), Vec::new(), b"b".to_vec()]
        );
    }

    #[test]
    fn delimiter_occurrences_do_not_overlap() {
        let mut s = FrameSplitter::delimited(&b"00"[..]);
        assert_eq!(collect(s.feed(b"x000y")), vec![b"x".to_vec()]);
        assert_eq!(s.buffered(), b"0y");
    }

    #[test]
    fn unconsumed_splices_survive_to_next_feed() {
        let mut s = FrameSplitter::delimited(&b"\n"[..]);
        let first = s.feed(b"a\nb\n").next().unwrap().unwrap();
        assert_eq!(first.as_ref(), b"a");
        assert_eq!(collect(s.feed(b"")), vec![b"b".to_vec()]);
    }

    #[test]
    fn length_prefixed_waits_for_whole_frame() {
        let mut s = FrameSplitter::length_prefixed();
        assert!(collect(s.feed(b"00")).is_empty());
        assert!(collect(s.feed(b"09hel")).is_empty());
        assert_eq!(collect(s.feed(b"lo0000")), vec![b"0009hello".to_vec(), b"0000".to_vec()]);
        assert!(s.buffered().is_empty());
    }

    #[test]
    fn length_prefixed_does_not_scan_past_declared_length() {
        let mut s = FrameSplitter::length_prefixed();
        let out = collect(s.feed(b"0006ab0008"));
        assert_eq!(out, vec![b"0006ab".to_vec()]);
        assert_eq!(s.buffered(), b"0008");
    }

    #[test]
    fn length_prefixed_rejects_bad_header_once_complete() {
        let mut s = FrameSplitter::length_prefixed();
        assert!(collect(s.feed(b"zz")).is_empty());
        let mut splices = s.feed(b"zz");
        assert!(matches!(splices.next(), Some(Err(FrameError::Length { .. }))));
        assert!(splices.next().is_none());
    }

    #[test]
    fn length_prefixed_rejects_undersized_length() {
        let mut s = FrameSplitter::length_prefixed();
        let mut splices = s.feed(b"0002");
        assert_eq!(
            splices.next(),
            Some(Err(FrameError::Undersized { declared: 2 }))
        );
    }
}
