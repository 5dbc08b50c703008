//! Connection-scoped ordered reliable channel and the per-tick batch codec.
//!
//! Every record queued for a peer gets the next wrapping `u16` sequence
//! number. The receiver releases records strictly in sequence order,
//! buffering anything that arrives early and dropping duplicates. Records are
//! flushed once per tick as one batch:
//!
//! ```text
//! [compression flag][protocol version][postcard Vec<Envelope>]
//!                   \______ LZ4-compressed when large ______/
//! ```

use std::collections::BTreeMap;

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};
use strata_config::ChannelConfig;
use tracing::{debug, warn};

use crate::messages::{MessageError, ReplicationMessage};

/// Current wire-protocol version, the first byte of every decompressed batch.
pub const PROTOCOL_VERSION: u8 = 1;

/// Compression flag: payload is uncompressed.
pub const COMPRESSION_FLAG_NONE: u8 = 0x00;

/// Compression flag: payload is LZ4-compressed.
pub const COMPRESSION_FLAG_LZ4: u8 = 0x01;

/// Records the receiver will hold while waiting for a gap to fill.
pub const MAX_REORDER_BUFFER: usize = 4096;

/// `true` when `s1` is newer than `s2`, treating the space as wrapping.
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One sequenced record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Position in the connection's stream.
    pub sequence: u16,
    /// The record.
    pub message: ReplicationMessage,
}

// ---------------------------------------------------------------------------
// OrderedSender
// ---------------------------------------------------------------------------

/// Outbound half: holds records until flush and stamps sequence numbers on
/// the ones that actually leave.
#[derive(Debug, Default)]
pub struct OrderedSender {
    next_sequence: u16,
    pending: Vec<ReplicationMessage>,
}

impl OrderedSender {
    /// Fresh stream starting at sequence 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `message` behind everything already queued.
    pub fn enqueue(&mut self, message: ReplicationMessage) {
        self.pending.push(message);
    }

    /// Records queued since the last flush.
    pub fn pending(&self) -> &[ReplicationMessage] {
        &self.pending
    }

    /// Sequence number the next sent record will carry.
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence
    }

    /// Takes every queued record, stamped with consecutive sequence numbers.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let messages = std::mem::take(&mut self.pending);
        self.stamp(messages)
    }

    /// Encodes every queued record into one batch and returns it with the
    /// number of records it carries. Records that fail validation are
    /// dropped before they are numbered. A sequence number is only consumed
    /// once its batch has encoded, so a failed flush leaves no gap for the
    /// receiver to wait on.
    pub fn flush(&mut self, config: &ChannelConfig) -> Result<(Vec<u8>, usize), MessageError> {
        let messages: Vec<ReplicationMessage> = std::mem::take(&mut self.pending)
            .into_iter()
            .filter(|message| match message.validate() {
                Ok(()) => true,
                Err(error) => {
                    warn!(kind = message.kind(), %error, "invalid record dropped");
                    false
                }
            })
            .collect();
        if messages.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let start = self.next_sequence;
        let envelopes = self.stamp(messages);
        match encode_batch(&envelopes, config) {
            Ok(bytes) => Ok((bytes, envelopes.len())),
            Err(error) => {
                self.next_sequence = start;
                Err(error)
            }
        }
    }

    fn stamp(&mut self, messages: Vec<ReplicationMessage>) -> Vec<Envelope> {
        messages
            .into_iter()
            .map(|message| {
                let sequence = self.next_sequence;
                self.next_sequence = self.next_sequence.wrapping_add(1);
                Envelope { sequence, message }
            })
            .collect()
    }

    /// `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ---------------------------------------------------------------------------
// OrderedReceiver
// ---------------------------------------------------------------------------

/// Inbound half: releases records in production order.
#[derive(Debug, Default)]
pub struct OrderedReceiver {
    next_expected: u16,
    buffer: BTreeMap<u16, ReplicationMessage>,
}

impl OrderedReceiver {
    /// Fresh stream expecting sequence 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts one envelope and returns every record that is now deliverable,
    /// in order.
    pub fn receive(&mut self, envelope: Envelope) -> Vec<ReplicationMessage> {
        let Envelope { sequence, message } = envelope;
        if sequence != self.next_expected {
            if !sequence_greater_than(sequence, self.next_expected) {
                debug!(sequence, expected = self.next_expected, "duplicate record dropped");
            } else if self.buffer.len() >= MAX_REORDER_BUFFER {
                warn!(sequence, "reorder buffer full, record dropped");
            } else {
                self.buffer.entry(sequence).or_insert(message);
            }
            return Vec::new();
        }

        let mut ready = vec![message];
        self.next_expected = self.next_expected.wrapping_add(1);
        while let Some(next) = self.buffer.remove(&self.next_expected) {
            ready.push(next);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        ready
    }

    /// Records waiting for an earlier sequence.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Both halves of one peer's stream.
#[derive(Debug, Default)]
pub struct PeerLink {
    /// Outbound records.
    pub sender: OrderedSender,
    /// Inbound records.
    pub receiver: OrderedReceiver,
}

// ---------------------------------------------------------------------------
// Batch codec
// ---------------------------------------------------------------------------

/// Encodes a tick's envelopes into one datagram.
pub fn encode_batch(envelopes: &[Envelope], config: &ChannelConfig) -> Result<Vec<u8>, MessageError> {
    for envelope in envelopes {
        envelope.message.validate()?;
    }
    let body = postcard::to_allocvec(envelopes).map_err(MessageError::Serialize)?;
    let mut versioned = Vec::with_capacity(1 + body.len());
    versioned.push(PROTOCOL_VERSION);
    versioned.extend_from_slice(&body);

    if !config.compression_enabled || versioned.len() < config.compression_threshold {
        let mut out = Vec::with_capacity(1 + versioned.len());
        out.push(COMPRESSION_FLAG_NONE);
        out.extend_from_slice(&versioned);
        Ok(out)
    } else {
        let compressed = compress_prepend_size(&versioned);
        let mut out = Vec::with_capacity(1 + compressed.len());
        out.push(COMPRESSION_FLAG_LZ4);
        out.extend_from_slice(&compressed);
        Ok(out)
    }
}

/// Decodes one datagram back into envelopes.
pub fn decode_batch(data: &[u8]) -> Result<Vec<Envelope>, MessageError> {
    let (&flag, rest) = data.split_first().ok_or(MessageError::EmptyPayload)?;
    let versioned = match flag {
        COMPRESSION_FLAG_NONE => rest.to_vec(),
        COMPRESSION_FLAG_LZ4 => decompress_size_prepended(rest)
            .map_err(|e| MessageError::DecompressFailed(e.to_string()))?,
        other => return Err(MessageError::UnknownFlag(other)),
    };
    let (&version, body) = versioned.split_first().ok_or(MessageError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(MessageError::UnsupportedVersion(version));
    }
    postcard::from_bytes(body).map_err(MessageError::Deserialize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{DestroyReason, ObjectId};
    use crate::messages::{DestroyObject, FieldDelta, InitialList};

    fn delta(object: u32, value: u8) -> ReplicationMessage {
        ReplicationMessage::FieldDelta(FieldDelta {
            object_id: ObjectId(object),
            element_index: 0,
            payload: vec![value],
        })
    }

    fn envelope(sequence: u16, value: u8) -> Envelope {
        Envelope {
            sequence,
            message: delta(1, value),
        }
    }

    fn oversized_list() -> ReplicationMessage {
        ReplicationMessage::InitialList(InitialList {
            object_id: ObjectId(1),
            element_index: 0,
            items: vec![Vec::new(); 300],
        })
    }

    #[test]
    fn test_sequence_greater_than_wraps() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(!sequence_greater_than(1, 1));
        assert!(sequence_greater_than(0, 65535));
        assert!(!sequence_greater_than(65535, 0));
    }

    #[test]
    fn test_sender_numbers_sequentially() {
        let mut sender = OrderedSender::new();
        sender.enqueue(delta(1, 0));
        sender.enqueue(delta(1, 1));
        let drained = sender.drain();
        assert_eq!(drained.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![0, 1]);
        assert!(sender.is_empty());
    }

    #[test]
    fn test_invalid_record_does_not_consume_a_sequence() {
        let config = ChannelConfig::default();
        let mut sender = OrderedSender::new();
        sender.enqueue(delta(1, 0));
        sender.enqueue(oversized_list());
        sender.enqueue(delta(1, 1));

        let (bytes, records) = sender.flush(&config).unwrap();
        assert_eq!(records, 2);
        assert!(sender.is_empty());
        assert_eq!(sender.next_sequence(), 2);

        let mut receiver = OrderedReceiver::new();
        let mut ready = Vec::new();
        for envelope in decode_batch(&bytes).unwrap() {
            ready.extend(receiver.receive(envelope));
        }
        assert_eq!(ready, vec![delta(1, 0), delta(1, 1)]);

        // The stream keeps flowing after the dropped record.
        sender.enqueue(delta(1, 2));
        let (bytes, _) = sender.flush(&config).unwrap();
        let next = decode_batch(&bytes).unwrap().remove(0);
        assert_eq!(receiver.receive(next), vec![delta(1, 2)]);
        assert_eq!(receiver.buffered(), 0);
    }

    #[test]
    fn test_flush_of_only_invalid_records_sends_nothing() {
        let mut sender = OrderedSender::new();
        sender.enqueue(oversized_list());
        let (bytes, records) = sender.flush(&ChannelConfig::default()).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(records, 0);
        assert_eq!(sender.next_sequence(), 0);
    }

    #[test]
    fn test_receiver_releases_in_order() {
        let mut receiver = OrderedReceiver::new();
        assert!(receiver.receive(envelope(2, 2)).is_empty());
        assert!(receiver.receive(envelope(1, 1)).is_empty());
        assert_eq!(receiver.buffered(), 2);

        let ready = receiver.receive(envelope(0, 0));
        assert_eq!(ready, vec![delta(1, 0), delta(1, 1), delta(1, 2)]);
        assert_eq!(receiver.buffered(), 0);
    }

    #[test]
    fn test_receiver_drops_duplicates() {
        let mut receiver = OrderedReceiver::new();
        assert_eq!(receiver.receive(envelope(0, 0)).len(), 1);
        assert!(receiver.receive(envelope(0, 9)).is_empty());
        assert!(receiver.receive(envelope(2, 2)).is_empty());
        assert!(receiver.receive(envelope(2, 7)).is_empty());

        let ready = receiver.receive(envelope(1, 1));
        assert_eq!(ready, vec![delta(1, 1), delta(1, 2)]);
    }

    #[test]
    fn test_receiver_crosses_wrap() {
        let mut receiver = OrderedReceiver {
            next_expected: 65535,
            buffer: BTreeMap::new(),
        };
        assert!(receiver.receive(envelope(0, 1)).is_empty());
        let ready = receiver.receive(envelope(65535, 0));
        assert_eq!(ready, vec![delta(1, 0), delta(1, 1)]);
    }

    #[test]
    fn test_small_batch_is_not_compressed() {
        let config = ChannelConfig::default();
        let bytes = encode_batch(&[envelope(0, 1)], &config).unwrap();
        assert_eq!(bytes[0], COMPRESSION_FLAG_NONE);
        assert_eq!(bytes[1], PROTOCOL_VERSION);
        assert_eq!(decode_batch(&bytes).unwrap(), vec![envelope(0, 1)]);
    }

    #[test]
    fn test_large_batch_is_compressed_and_decodes() {
        let config = ChannelConfig::default();
        let envelopes: Vec<Envelope> = (0..200)
            .map(|i| Envelope {
                sequence: i,
                message: ReplicationMessage::Destroy(DestroyObject {
                    object_id: ObjectId(7),
                    reason: DestroyReason::REMOVED_FROM_SUBSCRIBING,
                }),
            })
            .collect();
        let bytes = encode_batch(&envelopes, &config).unwrap();
        assert_eq!(bytes[0], COMPRESSION_FLAG_LZ4);
        assert_eq!(decode_batch(&bytes).unwrap(), envelopes);
    }

    #[test]
    fn test_compression_disabled() {
        let config = ChannelConfig {
            compression_enabled: false,
            compression_threshold: 0,
        };
        let bytes = encode_batch(&[envelope(0, 1), envelope(1, 2)], &config).unwrap();
        assert_eq!(bytes[0], COMPRESSION_FLAG_NONE);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_batch(&[]), Err(MessageError::EmptyPayload)));
        assert!(matches!(decode_batch(&[0x7F, 1]), Err(MessageError::UnknownFlag(0x7F))));
        assert!(matches!(
            decode_batch(&[COMPRESSION_FLAG_NONE, 99, 0]),
            Err(MessageError::UnsupportedVersion(99))
        ));
        assert!(matches!(
            decode_batch(&[COMPRESSION_FLAG_LZ4, 1, 2, 3]),
            Err(MessageError::DecompressFailed(_))
        ));
    }
}
