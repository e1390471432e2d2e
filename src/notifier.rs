/// Lifecycle event publishing over length-prefixed block streams
use crate::result::{GroupResult, ProcessResult};
use crate::types::{InvokerError, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

/// Wire schema version carried in every frame
pub const PROTOCOL_VERSION: u16 = 1;

/// Frames larger than this are rejected on read
const MAX_BLOCK_LEN: u32 = 16 * 1024 * 1024;

/// Lifecycle event published to observers
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Event {
    /// A child was forked; pid is absent when the process failed before fork
    ProcessStart {
        id: usize,
        pid: Option<i32>,
        name: Option<String>,
    },
    ProcessTermination { id: usize, result: ProcessResult },
    GroupTermination { result: GroupResult },
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u16,
    event: Event,
}

/// Length-prefixed block framing: u32 big-endian length, then the payload.
pub struct BlockStream<S> {
    inner: S,
}

impl<S> BlockStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Write> BlockStream<S> {
    pub fn write_block(&mut self, payload: &[u8]) -> std::io::Result<()> {
        let len = payload.len() as u32;
        self.inner.write_all(&len.to_be_bytes())?;
        self.inner.write_all(payload)?;
        self.inner.flush()
    }
}

impl<S: Read> BlockStream<S> {
    pub fn read_block(&mut self) -> std::io::Result<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        self.inner.read_exact(&mut len_bytes)?;
        let len = u32::from_be_bytes(len_bytes);
        if len > MAX_BLOCK_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("block of {} bytes exceeds frame limit", len),
            ));
        }
        let mut payload = vec![0u8; len as usize];
        self.inner.read_exact(&mut payload)?;
        Ok(payload)
    }
}

/// Encode an event into a versioned msgpack payload
pub fn encode_event(event: &Event) -> Result<Vec<u8>> {
    let envelope = Envelope {
        version: PROTOCOL_VERSION,
        event: event.clone(),
    };
    rmp_serde::to_vec(&envelope)
        .map_err(|e| InvokerError::Notifier(format!("failed to encode event: {}", e)))
}

fn decode_event(payload: &[u8]) -> Result<Event> {
    let envelope: Envelope = rmp_serde::from_slice(payload)
        .map_err(|e| InvokerError::Notifier(format!("failed to decode event: {}", e)))?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(InvokerError::Notifier(format!(
            "unsupported event protocol version {}",
            envelope.version
        )));
    }
    Ok(envelope.event)
}

/// Read one framed event; used by observers and tests
pub fn read_event<S: Read>(stream: &mut BlockStream<S>) -> Result<Event> {
    let payload = stream.read_block()?;
    decode_event(&payload)
}

/// One connected event sink. Publishing is best-effort: a transport error
/// is logged and permanently disables the sink without affecting the group.
pub struct Notifier {
    path: PathBuf,
    stream: Option<BlockStream<UnixStream>>,
}

impl Notifier {
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|e| {
            InvokerError::Notifier(format!("failed to connect {}: {}", path.display(), e))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            stream: Some(BlockStream::new(stream)),
        })
    }

    pub fn publish(&mut self, event: &Event) {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return,
        };
        let payload = match encode_event(event) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("dropping event for {}: {}", self.path.display(), e);
                return;
            }
        };
        if let Err(e) = stream.write_block(&payload) {
            log::warn!(
                "notifier {} failed, disabling sink: {}",
                self.path.display(),
                e
            );
            self.stream = None;
        }
    }
}

/// Independent fan-out over every configured sink
pub struct NotifierSet {
    notifiers: Vec<Notifier>,
}

impl NotifierSet {
    /// Connect each socket; failures are logged and the sink is skipped.
    pub fn connect_all(paths: &[PathBuf]) -> Self {
        let mut notifiers = Vec::new();
        for path in paths {
            match Notifier::connect(path) {
                Ok(notifier) => notifiers.push(notifier),
                Err(e) => log::warn!("{}", e),
            }
        }
        Self { notifiers }
    }

    pub fn publish(&mut self, event: &Event) {
        for notifier in &mut self.notifiers {
            notifier.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{CompletionStatus, GroupCompletionStatus, ResourceUsage};
    use std::io::Cursor;

    fn sample_result() -> ProcessResult {
        ProcessResult {
            completion_status: CompletionStatus::ExitStatus,
            exit_status: Some(7),
            term_sig: None,
            resource_usage: ResourceUsage {
                time_usage_ns: 1_000_000,
                memory_usage_bytes: 4096,
                output_usage_bytes: 12,
                real_time_usage_ns: 2_000_000,
            },
        }
    }

    #[test]
    fn block_stream_round_trip() {
        let mut buf = Vec::new();
        {
            let mut writer = BlockStream::new(&mut buf);
            writer.write_block(b"first").unwrap();
            writer.write_block(b"").unwrap();
            writer.write_block(b"second block").unwrap();
        }
        let mut reader = BlockStream::new(Cursor::new(buf));
        assert_eq!(reader.read_block().unwrap(), b"first");
        assert_eq!(reader.read_block().unwrap(), b"");
        assert_eq!(reader.read_block().unwrap(), b"second block");
        assert!(reader.read_block().is_err());
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_BLOCK_LEN + 1).to_be_bytes());
        let mut reader = BlockStream::new(Cursor::new(buf));
        assert!(reader.read_block().is_err());
    }

    #[test]
    fn process_result_round_trips_through_transport() {
        let event = Event::ProcessTermination {
            id: 3,
            result: sample_result(),
        };
        let payload = encode_event(&event).unwrap();
        assert_eq!(decode_event(&payload).unwrap(), event);
    }

    #[test]
    fn group_result_round_trips_through_transport() {
        let event = Event::GroupTermination {
            result: GroupResult {
                completion_status: GroupCompletionStatus::AbnormalExit,
                processes: vec![sample_result()],
            },
        };
        let payload = encode_event(&event).unwrap();
        assert_eq!(decode_event(&payload).unwrap(), event);
    }

    #[test]
    fn rejects_unknown_protocol_version() {
        let envelope = Envelope {
            version: PROTOCOL_VERSION + 1,
            event: Event::ProcessStart {
                id: 0,
                pid: Some(42),
                name: None,
            },
        };
        let payload = rmp_serde::to_vec(&envelope).unwrap();
        assert!(decode_event(&payload).is_err());
    }

    #[test]
    fn connect_failure_is_an_error_not_a_panic() {
        assert!(Notifier::connect(Path::new("/nonexistent/notifier.sock")).is_err());
    }
}
