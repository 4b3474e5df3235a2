//! Per-field streaming encoder
//!
//! One `EncodingState` compresses the values of a single logical field.
//! It tracks the previously appended value, picks a delta domain per type,
//! feeds packed deltas through Simple-8b, and wraps emitted blocks in
//! control-byte runs written straight into the output buffer. Anything that
//! cannot be delta encoded falls back to an inline literal.

use super::scalar::{
    decode_double, decode_int64, encode_binary, encode_decimal128, encode_double, encode_int128,
    encode_int64, encode_object_id, encode_string, scale_and_encode_double, MEMORY_AS_INTEGER,
};
use super::simple8b::Simple8bBuilder;
use crate::types::Value;
use bytes::{BufMut, BytesMut};

/// A control-byte run holds at most 16 Simple-8b blocks
const MAX_BLOCK_COUNT: u8 = 16;
const COUNT_MASK: u8 = 0x0F;
const CONTROL_MASK: u8 = 0xF0;

/// Control byte upper nibble per scale index 0..=5
const CONTROL_FOR_SCALE_INDEX: [u8; 6] = [0x90, 0xA0, 0xB0, 0xC0, 0xD0, 0x80];

/// Check whether a byte opens a Simple-8b run (as opposed to a literal's
/// type tag or a terminator)
pub(crate) fn is_simple8b_control(byte: u8) -> bool {
    (0x80..=0xDF).contains(&byte)
}

/// Number of 8-byte blocks following a Simple-8b control byte
pub(crate) fn blocks_in_control(byte: u8) -> usize {
    (byte & COUNT_MASK) as usize + 1
}

/// Streaming encoder state for one field
#[derive(Debug)]
pub(crate) struct EncodingState {
    /// Last appended value; `None` until the first append
    prev: Option<Value>,
    /// Second-order baseline, timestamps only
    prev_delta: i64,
    /// Encoded baseline for 64-bit delta domains
    prev_encoded64: i64,
    /// Encoded baseline for 128-bit delta domains
    prev_encoded128: i128,
    /// Last double committed to an emitted block; base for rescaling
    last_value_in_prev_block: f64,
    /// Active double scale index; [`MEMORY_AS_INTEGER`] for other types
    scale_index: u8,
    /// Whether deltas go through the 128-bit builder
    store_with_128: bool,
    /// Offset of the open control byte, if a run is open
    control_byte_offset: Option<usize>,
    simple8b_64: Simple8bBuilder<u64>,
    simple8b_128: Simple8bBuilder<u128>,
    /// Scratch for blocks coming out of the builders
    emitted: Vec<u64>,
    /// `(offset, len)` of every control block, recorded for interleaving
    control_blocks: Option<Vec<(usize, usize)>>,
}

impl EncodingState {
    /// Create an empty state. `record_control_blocks` turns on the
    /// `(offset, len)` bookkeeping that interleaved mode needs.
    pub(crate) fn new(record_control_blocks: bool) -> Self {
        Self {
            prev: None,
            prev_delta: 0,
            prev_encoded64: 0,
            prev_encoded128: 0,
            last_value_in_prev_block: 0.0,
            scale_index: MEMORY_AS_INTEGER,
            store_with_128: false,
            control_byte_offset: None,
            simple8b_64: Simple8bBuilder::new(),
            simple8b_128: Simple8bBuilder::new(),
            emitted: Vec::new(),
            control_blocks: record_control_blocks.then(Vec::new),
        }
    }

    /// Recorded control blocks, in emission order
    pub(crate) fn control_blocks(&self) -> &[(usize, usize)] {
        self.control_blocks.as_deref().unwrap_or(&[])
    }

    /// Seed the state with a reference leaf so the next append of an equal
    /// value becomes a zero delta instead of a literal
    pub(crate) fn seed(&mut self, reference_leaf: &Value) {
        self.prev = Some(reference_leaf.clone());
        self.initialize_from_prev();
    }

    /// Ingest one value
    pub(crate) fn append(&mut self, elem: &Value, buf: &mut BytesMut) {
        let ty = elem.value_type();
        // The stored previous value must stay in place until the encode
        // attempts finish: block writes triggered along the way read it.
        let previous = match &self.prev {
            Some(prev) if prev.value_type() == ty => prev.clone(),
            _ => {
                // Type change or first value: flush pending deltas and
                // write the new value as a literal.
                self.prev = Some(elem.clone());
                self.flush_simple8b(buf);
                self.write_literal(buf);
                return;
            }
        };

        // A value binary-equal to the previous one is a zero delta for
        // every type except the delta-of-delta ones.
        let mut compressed = !ty.uses_delta_of_delta() && elem.binary_eq(&previous);
        if compressed {
            if self.store_with_128 {
                self.simple8b_128.append(0, &mut self.emitted);
            } else {
                self.simple8b_64.append(0, &mut self.emitted);
            }
            self.drain_emitted(buf);
        } else if self.store_with_128 {
            match elem {
                Value::String(s) => {
                    if let Some(encoded) = encode_string(s) {
                        compressed = self.append_encoded128(encoded, buf);
                    }
                }
                Value::Binary(data) => {
                    // Delta encoding of binary needs identical sizes;
                    // leading zero bytes are not recoverable otherwise.
                    let prev_len = match &previous {
                        Value::Binary(p) => p.len(),
                        _ => unreachable!("128-bit previous must match element type"),
                    };
                    if data.len() == prev_len {
                        if let Some(encoded) = encode_binary(data) {
                            compressed = self.append_encoded128(encoded, buf);
                        }
                    }
                }
                Value::Decimal128(d) => {
                    compressed = self.append_encoded128(encode_decimal128(*d), buf);
                }
                _ => unreachable!("128-bit storage is only set for string, binary, decimal"),
            }
        } else if let (Value::Double(value), Value::Double(prev)) = (elem, &previous) {
            compressed = self.append_double(*value, *prev, buf);
        } else {
            let mut encodable = true;
            let mut delta = 0i64;
            match (elem, &previous) {
                (Value::Int32(cur), Value::Int32(prev)) => {
                    delta = (*cur as i64).wrapping_sub(*prev as i64);
                }
                (Value::Int64(cur), Value::Int64(prev)) => {
                    delta = cur.wrapping_sub(*prev);
                }
                (Value::ObjectId(cur), Value::ObjectId(prev)) => {
                    if cur.instance_unique() == prev.instance_unique() {
                        let encoded = encode_object_id(cur);
                        delta = encoded.wrapping_sub(self.prev_encoded64);
                        self.prev_encoded64 = encoded;
                    } else {
                        encodable = false;
                    }
                }
                (Value::Timestamp(cur), Value::Timestamp(prev)) => {
                    let ts_delta = (*cur as i64).wrapping_sub(*prev as i64);
                    delta = ts_delta.wrapping_sub(self.prev_delta);
                    self.prev_delta = ts_delta;
                }
                (Value::Date(cur), Value::Date(prev)) => {
                    delta = cur.wrapping_sub(*prev);
                }
                (Value::Bool(cur), Value::Bool(prev)) => {
                    delta = *cur as i64 - *prev as i64;
                }
                (Value::Null, _) | (Value::Undefined, _) => {
                    delta = 0;
                }
                // Documents, arrays, regexes, refs, code and symbols never
                // delta encode; a changed value is a new literal.
                _ => encodable = false,
            }
            if encodable {
                compressed = self.simple8b_64.append(encode_int64(delta), &mut self.emitted);
                self.drain_emitted(buf);
            }
        }

        self.prev = Some(elem.clone());
        if !compressed {
            self.flush_simple8b(buf);
            self.write_literal(buf);
        }
    }

    /// Ingest a missing-value marker
    pub(crate) fn skip(&mut self, buf: &mut BytesMut) {
        if self.store_with_128 {
            self.simple8b_128.skip(&mut self.emitted);
        } else {
            self.simple8b_64.skip(&mut self.emitted);
        }
        let wrote = self.drain_emitted(buf);

        // A block boundary lets the double scale settle back down
        if wrote && matches!(self.prev, Some(Value::Double(_))) {
            let (encoded, index) = scale_and_encode_double(self.last_value_in_prev_block, 0);
            self.prev_encoded64 = encoded;
            self.scale_index = index;
        }
    }

    /// Force all pending deltas out and close the open control run
    pub(crate) fn flush(&mut self, buf: &mut BytesMut) {
        self.flush_simple8b(buf);
        self.close_control_run(buf);
    }

    fn flush_simple8b(&mut self, buf: &mut BytesMut) {
        self.simple8b_128.flush(&mut self.emitted);
        self.drain_emitted(buf);
        self.simple8b_64.flush(&mut self.emitted);
        self.drain_emitted(buf);
    }

    fn append_encoded128(&mut self, encoded: i128, buf: &mut BytesMut) -> bool {
        let delta = encoded.wrapping_sub(self.prev_encoded128);
        let compressed = self
            .simple8b_128
            .append(encode_int128(delta), &mut self.emitted);
        self.drain_emitted(buf);
        self.prev_encoded128 = encoded;
        compressed
    }

    /// Double path: pick a scale, preferring to rescale pending deltas over
    /// splitting the run, and settle the scale back down after a block goes
    /// out.
    fn append_double(&mut self, value: f64, previous: f64, buf: &mut BytesMut) -> bool {
        let (mut encoded, mut scale_index) = scale_and_encode_double(value, self.scale_index);

        if scale_index != self.scale_index {
            if let Some(rescaled) = self.try_rescale_pending(encoded, scale_index) {
                self.simple8b_64 = rescaled;
                self.prev_encoded64 = encoded;
                self.scale_index = scale_index;
                return true;
            }

            // Rescale not possible: flush what is pending and restart the
            // run at the higher scale.
            self.simple8b_64.flush(&mut self.emitted);
            self.drain_emitted(buf);
            self.close_control_run(buf);

            // Both ends of the delta must share one scale factor.
            let (mut prev_encoded, prev_scale) = scale_and_encode_double(previous, scale_index);
            if prev_scale != scale_index {
                let (enc, idx) = scale_and_encode_double(value, prev_scale);
                encoded = enc;
                scale_index = idx;
                let (enc, _) = scale_and_encode_double(previous, scale_index);
                prev_encoded = enc;
            }
            self.prev_encoded64 = prev_encoded;
            self.scale_index = scale_index;
        }

        let delta = encoded.wrapping_sub(self.prev_encoded64);
        if !self
            .simple8b_64
            .append(encode_int64(delta), &mut self.emitted)
        {
            return false;
        }

        if self.drain_emitted(buf) {
            // A block went out. Restart from scale 0 and replay what is
            // still pending; the scale climbs back only as far as needed.
            let replay_scale = self.scale_index;
            let (encoded0, index0) = scale_and_encode_double(self.last_value_in_prev_block, 0);
            self.prev_encoded64 = encoded0;
            self.scale_index = index0;

            let replay = std::mem::replace(&mut self.simple8b_64, Simple8bBuilder::new());
            let mut prev_value = self.last_value_in_prev_block;
            let mut prev_encoded = encode_double(prev_value, replay_scale)
                .expect("last block value must encode at the active scale");
            for pending in replay.pending() {
                match pending {
                    Some(packed) => {
                        prev_encoded = prev_encoded.wrapping_add(decode_int64(packed));
                        let val = decode_double(prev_encoded, replay_scale);
                        self.append_double(val, prev_value, buf);
                        prev_value = val;
                    }
                    None => {
                        self.simple8b_64.skip(&mut self.emitted);
                        self.drain_emitted(buf);
                    }
                }
            }
            // prev_encoded64 and scale_index now reflect the last replayed
            // value; the pre-replay encoding would be stale here.
        } else {
            self.prev_encoded64 = encoded;
        }
        true
    }

    /// Try re-encoding every pending delta at a larger scale. Fails when
    /// any value stops being representable or a block would be emitted,
    /// in which case splitting the run compresses better.
    fn try_rescale_pending(
        &self,
        encoded: i64,
        new_scale_index: u8,
    ) -> Option<Simple8bBuilder<u64>> {
        let mut prev = encode_double(self.last_value_in_prev_block, self.scale_index)?;
        let mut prev_rescaled = encode_double(self.last_value_in_prev_block, new_scale_index)?;

        let mut builder = Simple8bBuilder::new();
        let mut blocks = Vec::new();
        for pending in self.simple8b_64.pending() {
            match pending {
                None => {
                    builder.skip(&mut blocks);
                    if !blocks.is_empty() {
                        return None;
                    }
                }
                Some(packed) => {
                    prev = prev.wrapping_add(decode_int64(packed));
                    let value = decode_double(prev, self.scale_index);
                    let rescaled = encode_double(value, new_scale_index)?;
                    let delta = rescaled.wrapping_sub(prev_rescaled);
                    if !builder.append(encode_int64(delta), &mut blocks) || !blocks.is_empty() {
                        return None;
                    }
                    prev_rescaled = rescaled;
                }
            }
        }

        let delta = encoded.wrapping_sub(prev_rescaled);
        if !builder.append(encode_int64(delta), &mut blocks) || !blocks.is_empty() {
            return None;
        }
        Some(builder)
    }

    /// Write emitted blocks into the buffer under the current control run
    fn drain_emitted(&mut self, buf: &mut BytesMut) -> bool {
        if self.emitted.is_empty() {
            return false;
        }
        let mut blocks = std::mem::take(&mut self.emitted);
        for &block in &blocks {
            self.write_block(block, buf);
        }
        blocks.clear();
        self.emitted = blocks;
        true
    }

    fn write_block(&mut self, block: u64, buf: &mut BytesMut) {
        let closed_run_offset = self.increment_simple8b_count(buf);
        buf.put_u64_le(block);
        if let Some(offset) = closed_run_offset {
            self.record_control_block(offset, buf.len() - offset);
        }

        if let Some(Value::Double(d)) = &self.prev {
            self.last_value_in_prev_block = *d;
        }
    }

    /// Bump the open control byte's block count, opening or rotating the
    /// run as needed. Returns the run's offset when this block fills it.
    fn increment_simple8b_count(&mut self, buf: &mut BytesMut) -> Option<usize> {
        let control = CONTROL_FOR_SCALE_INDEX[self.scale_index as usize];

        let offset = match self.control_byte_offset {
            None => {
                let offset = buf.len();
                buf.put_u8(control);
                self.control_byte_offset = Some(offset);
                return None;
            }
            Some(offset) => offset,
        };

        // A scale change since the run opened means this run cannot be
        // extended; close it and open a fresh one.
        if buf[offset] & CONTROL_MASK != control {
            self.close_control_run(buf);
            return self.increment_simple8b_count(buf);
        }

        let count = (buf[offset] & COUNT_MASK) + 1;
        buf[offset] = control | (count & COUNT_MASK);
        if count + 1 == MAX_BLOCK_COUNT {
            self.control_byte_offset = None;
            return Some(offset);
        }
        None
    }

    /// Close the open control run, recording it for interleaving
    fn close_control_run(&mut self, buf: &mut BytesMut) {
        if let Some(offset) = self.control_byte_offset.take() {
            self.record_control_block(offset, buf.len() - offset);
        }
    }

    fn record_control_block(&mut self, offset: usize, len: usize) {
        if let Some(records) = &mut self.control_blocks {
            records.push((offset, len));
        }
    }

    /// Write the stored previous value as a literal and reset the derived
    /// encoding state. The open run is closed first so a decoder re-enters
    /// a fresh run after the literal.
    fn write_literal(&mut self, buf: &mut BytesMut) {
        self.close_control_run(buf);

        let start = buf.len();
        let elem = self
            .prev
            .as_ref()
            .expect("a literal always has a stored previous value");
        buf.put_u8(elem.value_type().as_byte());
        buf.put_u8(0); // empty field name
        elem.write_payload(buf);
        self.record_control_block(start, buf.len() - start);

        self.scale_index = MEMORY_AS_INTEGER;
        self.prev_delta = 0;
        self.initialize_from_prev();
    }

    /// Derive the encoded baselines from the stored previous value
    fn initialize_from_prev(&mut self) {
        let elem = match &self.prev {
            Some(elem) => elem,
            None => return,
        };
        self.store_with_128 = elem.value_type().uses_128bit();
        match elem {
            Value::Double(d) => {
                self.last_value_in_prev_block = *d;
                let (encoded, index) = scale_and_encode_double(*d, 0);
                self.prev_encoded64 = encoded;
                self.scale_index = index;
            }
            Value::String(s) => self.prev_encoded128 = encode_string(s).unwrap_or(0),
            Value::Binary(data) => self.prev_encoded128 = encode_binary(data).unwrap_or(0),
            Value::Decimal128(d) => self.prev_encoded128 = encode_decimal128(*d),
            Value::ObjectId(oid) => self.prev_encoded64 = encode_object_id(oid),
            _ => {}
        }
    }
}
