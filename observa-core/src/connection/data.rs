//! Binary data channels
//!
//! A `C <conn> <type> <nchan> <size>...` line opens a set of channels.
//! Each `D <conn> <chan> <size>` header is followed by `size` raw bytes for
//! one channel; when every channel has received its announced size the set
//! is complete. `I <conn> <shm> <nchan> <seg>...` announces channels living
//! in a shared memory segment instead; those are only tracked here.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

/// Binary channel errors; all of them end the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataError {
    #[error("unknown data channel {data_conn}/{channel}")]
    UnknownChannel { data_conn: i32, channel: usize },

    #[error("chunk of {size} bytes exceeds the {rest} bytes left on channel {data_conn}/{channel}")]
    Overflow {
        data_conn: i32,
        channel: usize,
        size: usize,
        rest: usize,
    },

    #[error("binary data without a chunk header")]
    NoActiveChunk,

    #[error("channel set of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}

#[derive(Debug, Clone)]
struct ChannelBuffer {
    size: usize,
    data: BytesMut,
}

impl ChannelBuffer {
    fn rest(&self) -> usize {
        self.size - self.data.len()
    }
}

/// Where the channel content lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    /// Bytes carried on the connection itself
    Socket { data_type: i32 },
    /// Segments of a shared memory block
    Shared { shm_id: i32, segments: Vec<i32> },
}

/// One set of channels opened by a `C` or `I` line
#[derive(Debug, Clone)]
pub struct DataChannels {
    source: DataSource,
    channels: Vec<ChannelBuffer>,
}

impl DataChannels {
    pub fn source(&self) -> &DataSource {
        &self.source
    }

    pub fn channel_count(&self) -> usize {
        match &self.source {
            DataSource::Socket { .. } => self.channels.len(),
            DataSource::Shared { segments, .. } => segments.len(),
        }
    }

    /// Bytes still expected over all channels
    pub fn rest_size(&self) -> usize {
        self.channels.iter().map(ChannelBuffer::rest).sum()
    }

    /// Received content of one channel
    pub fn channel(&self, channel: usize) -> Option<Bytes> {
        self.channels
            .get(channel)
            .map(|c| Bytes::copy_from_slice(&c.data))
    }

    /// Consume the set, yielding each channel's content
    pub fn into_channels(self) -> Vec<Bytes> {
        self.channels.into_iter().map(|c| c.data.freeze()).collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveChunk {
    data_conn: i32,
    channel: usize,
    remaining: usize,
}

/// What a piece of binary payload did
#[derive(Debug)]
pub struct DataProgress {
    pub data_conn: i32,
    pub channel: usize,
    pub received: usize,
    /// Set when this piece completed the whole channel set
    pub complete: Option<DataChannels>,
}

/// Channels open for reading on one connection
#[derive(Debug, Default)]
pub struct ReadChannels {
    sets: BTreeMap<i32, DataChannels>,
    active: Option<ActiveChunk>,
}

impl ReadChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, data_conn: i32) -> bool {
        self.sets.contains_key(&data_conn)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// True while a chunk header is waiting for its bytes
    pub fn is_reading(&self) -> bool {
        self.active.is_some()
    }

    /// Open socket channels of the given sizes, replacing a set with the
    /// same id. Buffers grow as chunks arrive; a set announcing more than
    /// `limit` bytes in total is refused.
    pub fn open(&mut self, data_conn: i32, data_type: i32, sizes: &[usize], limit: usize) -> Result<(), DataError> {
        let size = sizes.iter().fold(0usize, |total, s| total.saturating_add(*s));
        if size > limit {
            return Err(DataError::TooLarge { size, limit });
        }
        let channels = sizes
            .iter()
            .map(|&size| ChannelBuffer {
                size,
                data: BytesMut::new(),
            })
            .collect();
        self.sets.insert(
            data_conn,
            DataChannels {
                source: DataSource::Socket { data_type },
                channels,
            },
        );
        Ok(())
    }

    /// Track channels announced in shared memory.
    pub fn open_shared(&mut self, data_conn: i32, shm_id: i32, segments: Vec<i32>) {
        self.sets.insert(
            data_conn,
            DataChannels {
                source: DataSource::Shared { shm_id, segments },
                channels: Vec::new(),
            },
        );
    }

    /// Handle a `D` header.
    pub fn start_chunk(&mut self, data_conn: i32, channel: usize, size: usize) -> Result<(), DataError> {
        let buffer = self
            .sets
            .get(&data_conn)
            .and_then(|set| set.channels.get(channel))
            .ok_or(DataError::UnknownChannel { data_conn, channel })?;
        if size > buffer.rest() {
            return Err(DataError::Overflow {
                data_conn,
                channel,
                size,
                rest: buffer.rest(),
            });
        }
        self.active = (size > 0).then_some(ActiveChunk {
            data_conn,
            channel,
            remaining: size,
        });
        Ok(())
    }

    /// Append payload bytes to the channel named by the last header.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<DataProgress, DataError> {
        let mut active = self.active.ok_or(DataError::NoActiveChunk)?;
        let ActiveChunk {
            data_conn, channel, ..
        } = active;
        let set = self
            .sets
            .get_mut(&data_conn)
            .ok_or(DataError::UnknownChannel { data_conn, channel })?;
        let buffer = set
            .channels
            .get_mut(channel)
            .ok_or(DataError::UnknownChannel { data_conn, channel })?;

        if bytes.len() > active.remaining {
            return Err(DataError::Overflow {
                data_conn,
                channel,
                size: bytes.len(),
                rest: active.remaining,
            });
        }
        buffer.data.extend_from_slice(bytes);
        active.remaining -= bytes.len();
        self.active = (active.remaining > 0).then_some(active);

        let complete = if set.rest_size() == 0 {
            self.active = None;
            self.sets.remove(&data_conn)
        } else {
            None
        };
        Ok(DataProgress {
            data_conn,
            channel,
            received: bytes.len(),
            complete,
        })
    }

    /// Close a set early (`H`) or on completion (`J`, `K`).
    pub fn close(&mut self, data_conn: i32) -> Option<DataChannels> {
        if self.active.map_or(false, |a| a.data_conn == data_conn) {
            self.active = None;
        }
        self.sets.remove(&data_conn)
    }

    /// Drop all channels, e.g. when the connection fails.
    pub fn clear(&mut self) {
        self.active = None;
        self.sets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024;

    #[test]
    fn test_two_channels_complete_in_pieces() {
        let mut read = ReadChannels::new();
        read.open(1, 16, &[4, 2], LIMIT).unwrap();

        read.start_chunk(1, 0, 3).unwrap();
        assert!(read.is_reading());
        let progress = read.receive(b"ab").unwrap();
        assert_eq!(progress.received, 2);
        assert!(progress.complete.is_none());
        read.receive(b"c").unwrap();
        assert!(!read.is_reading());

        read.start_chunk(1, 1, 2).unwrap();
        assert!(read.receive(b"xy").unwrap().complete.is_none());

        read.start_chunk(1, 0, 1).unwrap();
        let done = read.receive(b"d").unwrap().complete.unwrap();
        assert_eq!(done.source(), &DataSource::Socket { data_type: 16 });
        assert_eq!(done.into_channels(), vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"xy")]);
        assert!(read.is_empty());
    }

    #[test]
    fn test_chunk_header_errors() {
        let mut read = ReadChannels::new();
        read.open(2, 16, &[4], LIMIT).unwrap();
        assert_eq!(
            read.start_chunk(3, 0, 1),
            Err(DataError::UnknownChannel { data_conn: 3, channel: 0 })
        );
        assert_eq!(
            read.start_chunk(2, 1, 1),
            Err(DataError::UnknownChannel { data_conn: 2, channel: 1 })
        );
        assert!(matches!(read.start_chunk(2, 0, 5), Err(DataError::Overflow { .. })));
        assert!(matches!(read.receive(b"z"), Err(DataError::NoActiveChunk)));
    }

    #[test]
    fn test_oversized_set_refused() {
        let mut read = ReadChannels::new();
        assert_eq!(
            read.open(1, 16, &[LIMIT, 1], LIMIT),
            Err(DataError::TooLarge { size: LIMIT + 1, limit: LIMIT })
        );
        assert_eq!(
            read.open(1, 16, &[usize::MAX, usize::MAX], LIMIT),
            Err(DataError::TooLarge { size: usize::MAX, limit: LIMIT })
        );
        assert!(!read.is_open(1));

        assert!(read.open(1, 16, &[LIMIT], LIMIT).is_ok());
        assert!(read.is_open(1));
    }

    #[test]
    fn test_payload_longer_than_chunk() {
        let mut read = ReadChannels::new();
        read.open(2, 16, &[8], LIMIT).unwrap();
        read.start_chunk(2, 0, 2).unwrap();
        assert!(matches!(read.receive(b"abc"), Err(DataError::Overflow { .. })));
    }

    #[test]
    fn test_close_and_shared_tracking() {
        let mut read = ReadChannels::new();
        read.open(1, 16, &[4], LIMIT).unwrap();
        read.start_chunk(1, 0, 4).unwrap();
        assert!(read.close(1).is_some());
        assert!(!read.is_reading());

        read.open_shared(5, 77, vec![0, 1]);
        let shared = read.close(5).unwrap();
        assert_eq!(shared.channel_count(), 2);
        assert_eq!(shared.rest_size(), 0);
    }
}
