//! Reassembly of chunked notification payloads.
//!
//! The vault answers each command with one or more notifications. A
//! response may start with a header line `"<totalBytes>,<chunkCount>,<chunkSize>\n"`;
//! the bytes after it in the same notification are the first fragment.
//! Responses without a header are a single complete fragment.
//!
//! [`Reassembler`] is a tagged state machine. Completion happens either when
//! the declared number of fragments has arrived ([`Reassembler::push`]) or,
//! for responses whose count is unknown, when the inactivity deadline passes
//! ([`Reassembler::on_inactivity`]). Both paths leave through the same
//! finalize step, which takes the state by value, so a response can only be
//! finalized once.

use std::time::Duration;

use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use vaultlink_types::ChunkHeader;

/// Default inactivity delay before an open-ended response is finalized.
pub const DEFAULT_INACTIVITY: Duration = Duration::from_millis(200);

/// Internal reassembly state.
#[derive(Debug, Default)]
enum ReassemblyState {
    #[default]
    AwaitingHeader,
    Accumulating {
        /// Declared fragment count, or `None` if the header declared zero.
        expected: Option<u32>,
        received: u32,
        buffer: BytesMut,
        /// Cleared after a stall is reported, re-armed by the next chunk.
        deadline: Option<Instant>,
    },
}

/// Result of feeding one notification to the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The response is complete; contains the trimmed text.
    Complete(String),
    /// More chunks are needed.
    Pending,
}

/// Result of an inactivity deadline expiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InactivityOutcome {
    /// Nothing was being accumulated, or the deadline has not passed yet.
    Idle,
    /// An open-ended response was finalized with what had arrived.
    Finalized(String),
    /// A counted response went quiet before all fragments arrived.
    Stalled {
        /// Fragments received so far.
        received: u32,
        /// Fragments the header declared.
        expected: u32,
    },
}

/// Observable shape of the reassembly state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblySnapshot {
    pub awaiting_header: bool,
    pub expected_chunks: u32,
    pub received_chunks: u32,
    pub buffered_bytes: usize,
}

impl Default for ReassemblySnapshot {
    fn default() -> Self {
        Self {
            awaiting_header: true,
            expected_chunks: 0,
            received_chunks: 0,
            buffered_bytes: 0,
        }
    }
}

/// Turns a stream of notification buffers into complete response strings.
#[derive(Debug)]
pub struct Reassembler {
    state: ReassemblyState,
    inactivity: Duration,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_INACTIVITY)
    }
}

impl Reassembler {
    /// Create a reassembler with the given inactivity delay.
    pub fn new(inactivity: Duration) -> Self {
        Self {
            state: ReassemblyState::AwaitingHeader,
            inactivity,
        }
    }

    /// Feed one notification.
    pub fn push(&mut self, chunk: &[u8]) -> ChunkOutcome {
        let deadline = Some(Instant::now() + self.inactivity);

        match &mut self.state {
            ReassemblyState::AwaitingHeader => {
                let Some((header, header_len)) = ChunkHeader::parse_prefix(chunk) else {
                    trace!(len = chunk.len(), "Headerless chunk, treating as complete response");
                    return ChunkOutcome::Complete(decode(chunk));
                };

                let fragment = &chunk[header_len..];
                // A header alone in its notification has not delivered a fragment yet.
                let received = u32::from(!fragment.is_empty());
                let expected = (header.chunk_count > 0).then_some(header.chunk_count);
                debug!(
                    total_bytes = header.total_bytes,
                    chunk_count = header.chunk_count,
                    chunk_size = header.chunk_size,
                    "Response header received"
                );

                if let Some(expected) = expected
                    && received >= expected
                {
                    return ChunkOutcome::Complete(decode(fragment));
                }

                self.state = ReassemblyState::Accumulating {
                    expected,
                    received,
                    buffer: BytesMut::from(fragment),
                    deadline,
                };
                ChunkOutcome::Pending
            }
            ReassemblyState::Accumulating {
                expected,
                received,
                buffer,
                deadline: armed,
            } => {
                buffer.extend_from_slice(chunk);
                *received += 1;
                *armed = deadline;
                trace!(received = *received, expected = ?expected, "Chunk appended");

                match *expected {
                    Some(expected) if *received >= expected => {
                        ChunkOutcome::Complete(self.finalize())
                    }
                    _ => ChunkOutcome::Pending,
                }
            }
        }
    }

    /// The instant at which [`Reassembler::on_inactivity`] should be called.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            ReassemblyState::Accumulating { deadline, .. } => *deadline,
            ReassemblyState::AwaitingHeader => None,
        }
    }

    /// Handle expiry of the inactivity deadline.
    pub fn on_inactivity(&mut self) -> InactivityOutcome {
        let now = Instant::now();
        match &mut self.state {
            ReassemblyState::Accumulating {
                expected,
                received,
                deadline,
                ..
            } => {
                if deadline.is_none_or(|d| d > now) {
                    return InactivityOutcome::Idle;
                }
                match *expected {
                    None => {
                        debug!(received = *received, "Open-ended response finalized on inactivity");
                        InactivityOutcome::Finalized(self.finalize())
                    }
                    Some(expected) => {
                        let received = *received;
                        *deadline = None;
                        warn!(received, expected, "Response stalled before all chunks arrived");
                        InactivityOutcome::Stalled { received, expected }
                    }
                }
            }
            ReassemblyState::AwaitingHeader => InactivityOutcome::Idle,
        }
    }

    /// Discard any partial response.
    pub fn reset(&mut self) {
        if let ReassemblyState::Accumulating { received, .. } = &self.state {
            debug!(received = *received, "Discarding partial response");
        }
        self.state = ReassemblyState::AwaitingHeader;
    }

    /// Whether no response is in progress.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, ReassemblyState::AwaitingHeader)
    }

    /// Snapshot of the current state.
    pub fn snapshot(&self) -> ReassemblySnapshot {
        match &self.state {
            ReassemblyState::AwaitingHeader => ReassemblySnapshot::default(),
            ReassemblyState::Accumulating {
                expected,
                received,
                buffer,
                ..
            } => ReassemblySnapshot {
                awaiting_header: false,
                expected_chunks: expected.unwrap_or(0),
                received_chunks: *received,
                buffered_bytes: buffer.len(),
            },
        }
    }

    fn finalize(&mut self) -> String {
        match std::mem::take(&mut self.state) {
            ReassemblyState::Accumulating { buffer, .. } => decode(&buffer),
            ReassemblyState::AwaitingHeader => String::new(),
        }
    }
}

fn decode(data: &[u8]) -> String {
    String::from_utf8_lossy(data).trim().to_string()
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Arbitrary notification streams never panic and never count past
        /// the declared fragment total.
        #[test]
        fn push_never_exceeds_declared_count(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 0..20)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                let mut r = Reassembler::default();
                for chunk in &chunks {
                    let _ = r.push(chunk);
                    let snap = r.snapshot();
                    if snap.expected_chunks > 0 {
                        prop_assert!(snap.received_chunks < snap.expected_chunks);
                    }
                    if snap.awaiting_header {
                        prop_assert_eq!(snap, ReassemblySnapshot::default());
                    }
                }
                Ok(())
            })?;
        }

        /// A header followed by exactly the declared number of fragments
        /// always completes with their concatenation.
        #[test]
        fn counted_fragments_complete(
            fragments in prop::collection::vec("[a-z]{1,12}", 1..8)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                let body: String = fragments.concat();
                let header = ChunkHeader::new(body.len(), fragments.len() as u32, 12);
                let mut r = Reassembler::default();

                let mut first = header.encode().into_bytes();
                first.extend_from_slice(fragments[0].as_bytes());
                let mut outcome = r.push(&first);
                for fragment in &fragments[1..] {
                    prop_assert_eq!(&outcome, &ChunkOutcome::Pending);
                    outcome = r.push(fragment.as_bytes());
                }
                prop_assert_eq!(outcome, ChunkOutcome::Complete(body));
                prop_assert!(r.is_idle());
                Ok(())
            })?;
        }
    }
}
