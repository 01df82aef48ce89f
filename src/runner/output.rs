//! Bounded capture of a child's stdout and stderr.
//!
//! Commands can be arbitrarily verbose, so each stream is reduced twice
//! before anything is kept: a filter drops the middle of carriage-return
//! progress-bar runs, and the survivors land in a saver that keeps only the
//! first and last 4 KiB.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bytes kept at each end of a captured stream.
pub const STD_STREAM_BOUND: usize = 4096;

/// Keeps the first `n` bytes written and the last `n` bytes written, with a
/// count of everything skipped in between.
#[derive(Debug)]
pub struct PrefixSuffixSaver {
    n: usize,
    prefix: Vec<u8>,
    suffix: Vec<u8>,
    suffix_off: usize,
    skipped: u64,
}

impl PrefixSuffixSaver {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            prefix: Vec::new(),
            suffix: Vec::new(),
            suffix_off: 0,
            skipped: 0,
        }
    }

    pub fn write(&mut self, mut p: &[u8]) {
        p = fill(&mut self.prefix, self.n, p);

        // only the last n bytes of what remains can ever be wanted
        if p.len() > self.n {
            self.skipped += (p.len() - self.n) as u64;
            p = &p[p.len() - self.n..];
        }
        p = fill(&mut self.suffix, self.n, p);

        // suffix is full now if p is non-empty; overwrite it in a circle
        while !p.is_empty() {
            let span = (self.n - self.suffix_off).min(p.len());
            self.suffix[self.suffix_off..self.suffix_off + span].copy_from_slice(&p[..span]);
            p = &p[span..];
            self.skipped += span as u64;
            self.suffix_off += span;
            if self.suffix_off == self.n {
                self.suffix_off = 0;
            }
        }
    }

    /// The retained bytes, with an omission marker where the middle was
    /// dropped.
    pub fn bytes(&self) -> Vec<u8> {
        if self.suffix.is_empty() {
            return self.prefix.clone();
        }
        let mut out = Vec::with_capacity(self.prefix.len() + self.suffix.len() + 50);
        out.extend_from_slice(&self.prefix);
        if self.skipped > 0 {
            out.extend_from_slice(format!("\n... omitting {} bytes ...\n", self.skipped).as_bytes());
        }
        // un-rotate the ring
        out.extend_from_slice(&self.suffix[self.suffix_off..]);
        out.extend_from_slice(&self.suffix[..self.suffix_off]);
        out
    }
}

fn fill<'a>(buf: &mut Vec<u8>, n: usize, p: &'a [u8]) -> &'a [u8] {
    let room = n.saturating_sub(buf.len());
    let take = room.min(p.len());
    buf.extend_from_slice(&p[..take]);
    &p[take..]
}

/// Drain `reader` into a fresh saver, suppressing progress bars: within any
/// contiguous run of `\r`-terminated fragments, only the first and last
/// survive. Cancelling `abort` stops reading early, keeping whatever has
/// arrived so far.
pub(crate) fn spawn_std_filter<R>(
    reader: R,
    abort: CancellationToken,
) -> JoinHandle<(PrefixSuffixSaver, Option<std::io::Error>)>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(filter_stream(reader, abort))
}

async fn filter_stream<R>(
    mut reader: R,
    abort: CancellationToken,
) -> (PrefixSuffixSaver, Option<std::io::Error>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut saver = PrefixSuffixSaver::new(STD_STREAM_BOUND);
    let mut filter = ProgressFilter::default();
    let mut chunk = vec![0u8; 8192];
    let mut read_err = None;

    loop {
        let n = tokio::select! {
            _ = abort.cancelled() => break,
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    read_err = Some(e);
                    break;
                }
            },
        };
        filter.feed(&chunk[..n], &mut saver);
    }
    filter.finish(&mut saver);

    (saver, read_err)
}

/// Streaming state for the carriage-return run suppression.
#[derive(Debug, Default)]
struct ProgressFilter {
    /// Bytes of the fragment currently being assembled, no terminator yet.
    partial: Vec<u8>,
    /// Whether we are inside a run of `\r`-terminated fragments whose first
    /// member has been emitted.
    in_cr_run: bool,
    /// The most recent `\r` fragment after the first of the run, emitted
    /// only if it turns out to be the run's last.
    held: Option<Vec<u8>>,
}

impl ProgressFilter {
    fn feed(&mut self, mut data: &[u8], saver: &mut PrefixSuffixSaver) {
        while let Some(pos) = data.iter().position(|&b| b == b'\n' || b == b'\r') {
            let terminator = data[pos];
            let mut fragment = std::mem::take(&mut self.partial);
            fragment.extend_from_slice(&data[..=pos]);
            data = &data[pos + 1..];

            if terminator == b'\r' {
                if self.in_cr_run {
                    self.held = Some(fragment);
                } else {
                    saver.write(&fragment);
                    self.in_cr_run = true;
                }
            } else {
                self.end_cr_run(saver);
                saver.write(&fragment);
            }
        }
        self.partial.extend_from_slice(data);
    }

    fn finish(&mut self, saver: &mut PrefixSuffixSaver) {
        self.end_cr_run(saver);
        if !self.partial.is_empty() {
            let partial = std::mem::take(&mut self.partial);
            saver.write(&partial);
        }
    }

    fn end_cr_run(&mut self, saver: &mut PrefixSuffixSaver) {
        if let Some(last) = self.held.take() {
            saver.write(&last);
        }
        self.in_cr_run = false;
    }
}
