//! Columnar compression of heterogeneous value streams
//!
//! A [`ColumnBuilder`] ingests one value (or skip) per row for a single
//! logical field and produces a compact, self-delimited binary column:
//! literals for values that resist delta encoding, Simple-8b runs for
//! everything else, and interleaved sub-columns for streams of nested
//! documents.

mod encoder;
mod interleave;
mod scalar;
mod simple8b;

use crate::error::Result;
use crate::types::{Document, Value, ValueType};
use bytes::{BufMut, Bytes, BytesMut};
use encoder::EncodingState;
use interleave::{merge_documents, traverse_lock_step};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::debug;

/// Size of the little-endian element count at the head of a column
const ELEMENT_COUNT_BYTES: usize = 4;

/// Control byte opening an interleaved sub-object region
const INTERLEAVED_START: u8 = 0xF0;

/// Terminator byte for the column and for interleaved regions
const EOO: u8 = ValueType::Eoo as u8;

/// Keep buffering reference candidates while the reference's leaf count
/// times this factor covers the buffered row count. An empirical trade-off
/// between merge cost and interleaving wide-but-sparse documents.
const DETERMINE_BUFFER_FACTOR: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Regular,
    DeterminingReference,
    Appending,
}

/// One per-leaf encoder with its scratch buffer. Control blocks land in
/// `buffer`; their `(offset, len)` records live in the encoder and stay
/// valid across buffer growth.
#[derive(Debug)]
struct SubObjState {
    state: EncodingState,
    buffer: BytesMut,
}

/// Streaming builder for one compressed column.
///
/// Values are appended row by row; [`ColumnBuilder::finalize`] produces the
/// framed column. A builder is single-use: finalizing or detaching consumes
/// it.
#[derive(Debug)]
pub struct ColumnBuilder {
    field_name: String,
    buf: BytesMut,
    state: EncodingState,
    element_count: u32,
    mode: Mode,
    reference: Document,
    buffered: Vec<Document>,
    subobj_states: Vec<SubObjState>,
}

impl ColumnBuilder {
    /// Create a builder for the named field
    pub fn new(field_name: impl Into<String>) -> Self {
        Self::with_buffer(field_name, BytesMut::new())
    }

    /// Create a builder reusing an existing buffer's allocation
    pub fn with_buffer(field_name: impl Into<String>, mut buf: BytesMut) -> Self {
        buf.clear();
        // Element count placeholder, patched on finalize
        buf.put_bytes(0, ELEMENT_COUNT_BYTES);
        Self {
            field_name: field_name.into(),
            buf,
            state: EncodingState::new(false),
            element_count: 0,
            mode: Mode::Regular,
            reference: Document::new(),
            buffered: Vec::new(),
            subobj_states: Vec::new(),
        }
    }

    /// The field name this column is built for
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// Rows ingested so far, counting both appends and skips
    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    /// Ingest one value.
    ///
    /// Fails on MinKey/MaxKey anywhere in the value; a failed append leaves
    /// the builder exactly as it was.
    pub fn append(&mut self, value: &Value) -> Result<&mut Self> {
        value.check_storable()?;

        match value {
            Value::Document(obj) if !obj.is_empty() => self.append_object(obj),
            _ => {
                // Non-documents and empty documents are scalars; they end
                // any sub-object compression in progress.
                if self.mode != Mode::Regular {
                    self.flush_subobj_mode();
                }
                self.state.append(value, &mut self.buf);
            }
        }
        self.element_count += 1;
        Ok(self)
    }

    /// Ingest a missing-value marker
    pub fn skip(&mut self) -> &mut Self {
        self.element_count += 1;
        match self.mode {
            Mode::Regular => self.state.skip(&mut self.buf),
            // An empty document row marks "skip" while buffering
            Mode::DeterminingReference => self.buffered.push(Document::new()),
            Mode::Appending => {
                for sub in &mut self.subobj_states {
                    sub.state.skip(&mut sub.buffer);
                }
            }
        }
        self
    }

    /// Flush everything, terminate the column and patch the element count
    pub fn finalize(mut self) -> CompressedColumn {
        match self.mode {
            Mode::Regular => self.state.flush(&mut self.buf),
            _ => self.flush_subobj_mode(),
        }
        self.buf.put_u8(EOO);
        let count = self.element_count.to_le_bytes();
        self.buf[0..ELEMENT_COUNT_BYTES].copy_from_slice(&count);

        CompressedColumn {
            field_name: self.field_name,
            element_count: self.element_count,
            data: self.buf.freeze(),
        }
    }

    /// Steal the raw, unterminated buffer
    pub fn detach(self) -> BytesMut {
        self.buf
    }

    fn append_object(&mut self, obj: &Document) {
        match self.mode {
            Mode::Regular => self.start_determine_reference(obj),
            Mode::DeterminingReference => {
                let mut leaf_count = 0usize;
                let compatible =
                    traverse_lock_step(&self.reference, obj, |_, _| leaf_count += 1);
                if !compatible {
                    match merge_documents(&self.reference, obj) {
                        Some(merged) => self.reference = merged,
                        None => {
                            debug!(
                                field = %self.field_name,
                                "reference merge failed, restarting sub-object mode"
                            );
                            self.flush_subobj_mode();
                            self.start_determine_reference(obj);
                            return;
                        }
                    }
                }

                // Enough buffered rows per leaf means the reference will
                // compress well; stop growing it.
                if leaf_count * DETERMINE_BUFFER_FACTOR >= self.buffered.len() {
                    self.buffered.push(obj.clone());
                    return;
                }
                self.finish_determine_reference();
                self.append_sub_elements(obj);
            }
            Mode::Appending => self.append_sub_elements(obj),
        }
    }

    fn start_determine_reference(&mut self, obj: &Document) {
        debug!(field = %self.field_name, "entering sub-object mode");
        self.state.flush(&mut self.buf);
        self.state = EncodingState::new(false);
        self.reference = obj.clone();
        self.buffered.clear();
        self.buffered.push(obj.clone());
        self.mode = Mode::DeterminingReference;
    }

    /// Accept the current reference: write the interleaved-start marker and
    /// the reference verbatim, create one seeded encoder per leaf, then
    /// replay the buffered rows.
    fn finish_determine_reference(&mut self) {
        self.buf.put_u8(INTERLEAVED_START);
        self.reference.write_to(&mut self.buf);

        let mut subobj_states = Vec::new();
        let first = &self.buffered[0];
        let compatible = traverse_lock_step(&self.reference, first, |ref_leaf, leaf| {
            let mut sub = SubObjState {
                state: EncodingState::new(true),
                buffer: BytesMut::new(),
            };
            // Seeding with the reference leaf makes the first appended
            // value a zero delta; the reference document already carries
            // the literal.
            sub.state.seed(ref_leaf);
            match leaf {
                Some(value) => sub.state.append(value, &mut sub.buffer),
                None => sub.state.skip(&mut sub.buffer),
            }
            subobj_states.push(sub);
        });
        assert!(
            compatible,
            "the first buffered row always matches the reference grown from it"
        );
        self.subobj_states = subobj_states;
        self.mode = Mode::Appending;

        let remaining = self.buffered.split_off(1);
        self.buffered.clear();
        for obj in &remaining {
            self.append_sub_elements(obj);
        }
    }

    fn append_sub_elements(&mut self, obj: &Document) {
        let mut leaves: Vec<Option<&Value>> = Vec::new();
        let compatible = traverse_lock_step(&self.reference, obj, |_, leaf| leaves.push(leaf));
        if !compatible {
            debug!(
                field = %self.field_name,
                "row incompatible with reference, restarting sub-object mode"
            );
            self.flush_subobj_mode();
            self.start_determine_reference(obj);
            return;
        }

        assert_eq!(
            leaves.len(),
            self.subobj_states.len(),
            "one encoder per reference leaf"
        );
        for (sub, leaf) in self.subobj_states.iter_mut().zip(leaves) {
            match leaf {
                Some(value) => sub.state.append(value, &mut sub.buffer),
                None => sub.state.skip(&mut sub.buffer),
            }
        }
    }

    /// Flush every leaf encoder and interleave their control blocks into
    /// the main buffer in decoder consumption order.
    fn flush_subobj_mode(&mut self) {
        if self.mode == Mode::DeterminingReference {
            self.finish_determine_reference();
        }

        for sub in &mut self.subobj_states {
            sub.state.flush(&mut sub.buffer);
        }

        // A decoder runs one sub-decoder per leaf and reads the next
        // control block for whichever has emitted the fewest elements, ties
        // broken by leaf index. Replaying that order here lets it stream.
        let mut cursors = vec![0usize; self.subobj_states.len()];
        let mut heap: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::new();
        for (index, sub) in self.subobj_states.iter().enumerate() {
            if !sub.state.control_blocks().is_empty() {
                heap.push(Reverse((0, index)));
            }
        }

        while let Some(Reverse((written, index))) = heap.pop() {
            let sub = &self.subobj_states[index];
            let (offset, len) = sub.state.control_blocks()[cursors[index]];
            let block = &sub.buffer[offset..offset + len];
            self.buf.put_slice(block);
            cursors[index] += 1;

            if cursors[index] < sub.state.control_blocks().len() {
                let elements = control_block_elements(block);
                heap.push(Reverse((written + elements, index)));
            }
        }

        self.buf.put_u8(EOO);
        self.subobj_states.clear();
        self.mode = Mode::Regular;
        debug!(field = %self.field_name, "leaving sub-object mode");
    }
}

/// Row elements represented by one control block: a literal stands for one
/// element, a Simple-8b run for the slots of all its blocks.
fn control_block_elements(block: &[u8]) -> u64 {
    let control = block[0];
    if !encoder::is_simple8b_control(control) {
        return 1;
    }
    let mut elements = 0u64;
    for i in 0..encoder::blocks_in_control(control) {
        let start = 1 + i * 8;
        let word = u64::from_le_bytes(
            block[start..start + 8]
                .try_into()
                .expect("control block shorter than its count nibble"),
        );
        elements += simple8b::block_slot_count(word) as u64;
    }
    elements
}

/// A finalized compressed column
#[derive(Debug, Clone)]
pub struct CompressedColumn {
    field_name: String,
    element_count: u32,
    data: Bytes,
}

impl CompressedColumn {
    /// The field name the column was built for
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// Rows in the column, counting appends and skips
    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    /// The framed column bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Size of the column in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// A column always carries its header and terminator
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Average compressed bytes per row
    pub fn bytes_per_element(&self) -> f64 {
        self.data.len() as f64 / self.element_count.max(1) as f64
    }

    /// Consume the column, keeping only its bytes
    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}
