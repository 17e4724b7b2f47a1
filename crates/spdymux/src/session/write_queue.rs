use bytes::Bytes;
use smallvec::SmallVec;
use spdymux_frame::{ErrorCode, Ping, Setting, StreamId};

use crate::{
    priority::{PriorityQueue, RequestPriority},
    stream::{StreamKey, WriteDone},
};

/// A frame waiting for its turn on the wire.
///
/// Stream frames only name their stream: they are serialized at dequeue
/// time, so that stream ids and HPACK state follow wire order and DATA is
/// sized against the windows as they are then.
#[derive(Debug)]
pub(crate) enum WriteEntry {
    Preface,
    Settings(SmallVec<[(Setting, u32); 4]>),
    SettingsAck,
    Ping {
        ping: Ping,
        ack: bool,
    },
    RstStream {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    GoAway {
        last_stream_id: StreamId,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
    SynStream {
        key: StreamKey,
    },
    Data {
        key: StreamKey,
    },
}

impl WriteEntry {
    pub(crate) fn stream_key(&self) -> Option<StreamKey> {
        match self {
            WriteEntry::SynStream { key } | WriteEntry::Data { key } => Some(*key),
            _ => None,
        }
    }
}

/// The write currently handed to the transport
pub(crate) enum InFlight {
    Control,
    Headers {
        key: StreamKey,
        end_stream: bool,
    },
    Data {
        key: StreamKey,
        end_stream: bool,
        /// Fired when the last chunk of a write reaches the transport
        done: Option<WriteDone>,
    },
}

#[derive(Default)]
pub(crate) struct WriteQueue {
    entries: PriorityQueue<WriteEntry>,
}

impl WriteQueue {
    pub(crate) fn push(&mut self, priority: RequestPriority, entry: WriteEntry) {
        self.entries.push_back(priority, entry);
    }

    /// Jumps ahead of everything already queued
    pub(crate) fn push_urgent(&mut self, entry: WriteEntry) {
        self.entries.push_front(RequestPriority::Highest, entry);
    }

    pub(crate) fn pop(&mut self) -> Option<WriteEntry> {
        self.entries.pop().map(|(_, entry)| entry)
    }

    /// Drops every frame of a stream that went away
    pub(crate) fn remove_for_stream(&mut self, key: StreamKey) {
        self.entries.retain(|entry| entry.stream_key() != Some(key));
    }

    pub(crate) fn clear(&mut self) {
        self.entries.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn urgent_entries_and_stream_removal() {
        let mut q = WriteQueue::default();
        q.push(RequestPriority::Low, WriteEntry::Data { key: StreamKey(1) });
        q.push(RequestPriority::Highest, WriteEntry::SettingsAck);
        q.push(RequestPriority::Low, WriteEntry::Data { key: StreamKey(2) });
        q.push_urgent(WriteEntry::GoAway {
            last_stream_id: StreamId(2),
            error_code: ErrorCode(1),
            debug_data: Bytes::new(),
        });
        q.remove_for_stream(StreamKey(1));

        assert!(matches!(q.pop(), Some(WriteEntry::GoAway { .. })));
        assert!(matches!(q.pop(), Some(WriteEntry::SettingsAck)));
        assert_eq!(q.pop().and_then(|e| e.stream_key()), Some(StreamKey(2)));
        assert!(q.pop().is_none());
    }
}
