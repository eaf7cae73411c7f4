//! Skip Indexes
//!
//! Every sealed run carries one bloom filter per indexed column, built over the
//! column's distinct values in that run. A scan with an equality or IN predicate on an
//! indexed column asks each run's filter first and never opens runs that definitely
//! lack every wanted value.
//!
//! ## Guarantees
//!
//! - **No false negatives**: `maybe_contains(v)` is `true` for every value `v` stored
//!   in the run, including `NULL` and empty strings.
//! - **Bounded false positives**: the filter is sized for the run's distinct value
//!   count at the schema's false positive rate (default 1%).
//!
//! ## Storage
//!
//! Filters of a run are persisted together in a sidecar next to the run file:
//! `p<YYYYMM>/run-<id>.idx`. A missing or corrupt sidecar is rebuilt from run data on
//! open, so the sidecar is an optimization and never the source of truth.
//!
//! ```text
//! [version u8][entry_count u16]
//! entry × entry_count:
//!   [column_id u16][fp_rate f64][distinct u64][num_bits u64][num_hashes u32]
//!   [sip_keys 4×u64][bitmap_len u32][bitmap]
//! [crc32 u32]
//! ```

use bloomfilter::Bloom;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use txhouse_core::{Column, Error, MaterializedRow, Result, SkipIndexDef, Value};

const SIDECAR_VERSION: u8 = 1;

/// Bloom filter over one column of one run.
pub struct FilterEntry {
    column: Column,
    false_positive_rate: f64,
    distinct_values: u64,
    bloom: Bloom<[u8]>,
}

impl std::fmt::Debug for FilterEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterEntry")
            .field("column", &self.column)
            .field("false_positive_rate", &self.false_positive_rate)
            .field("distinct_values", &self.distinct_values)
            .field("bits", &self.bloom.number_of_bits())
            .finish()
    }
}

impl FilterEntry {
    /// Build a filter for `column` over the rows of a run.
    pub fn build(rows: &[MaterializedRow], column: Column, false_positive_rate: f64) -> Self {
        let distinct: HashSet<Vec<u8>> = rows
            .iter()
            .map(|row| row.get(column).index_bytes())
            .collect();

        // The bloom crate rejects a zero-capacity filter.
        let mut bloom = Bloom::new_for_fp_rate(distinct.len().max(1), false_positive_rate);
        for value in &distinct {
            bloom.set(value.as_slice());
        }

        tracing::trace!(
            column = %column,
            distinct = distinct.len(),
            bits = bloom.number_of_bits(),
            hashes = bloom.number_of_hash_functions(),
            "built skip index"
        );

        Self {
            column,
            false_positive_rate,
            distinct_values: distinct.len() as u64,
            bloom,
        }
    }

    pub fn column(&self) -> Column {
        self.column
    }

    pub fn distinct_values(&self) -> u64 {
        self.distinct_values
    }

    /// `false` means the run definitely holds no row with this value.
    pub fn maybe_contains(&self, value: &Value) -> bool {
        self.bloom.check(value.index_bytes().as_slice())
    }

    fn encode(&self, buf: &mut BytesMut) {
        let bitmap = self.bloom.bitmap();
        let sip_keys = self.bloom.sip_keys();
        buf.put_u16_le(self.column.id());
        buf.put_f64_le(self.false_positive_rate);
        buf.put_u64_le(self.distinct_values);
        buf.put_u64_le(self.bloom.number_of_bits());
        buf.put_u32_le(self.bloom.number_of_hash_functions());
        buf.put_u64_le(sip_keys[0].0);
        buf.put_u64_le(sip_keys[0].1);
        buf.put_u64_le(sip_keys[1].0);
        buf.put_u64_le(sip_keys[1].1);
        buf.put_u32_le(bitmap.len() as u32);
        buf.put_slice(&bitmap);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        const FIXED: usize = 2 + 8 + 8 + 8 + 4 + 32 + 4;
        if buf.remaining() < FIXED {
            return Err(Error::InvalidRun("truncated skip index entry".to_string()));
        }
        let column_id = buf.get_u16_le();
        let column = Column::from_id(column_id)
            .ok_or_else(|| Error::InvalidRun(format!("unknown column id {}", column_id)))?;
        let false_positive_rate = buf.get_f64_le();
        let distinct_values = buf.get_u64_le();
        let num_bits = buf.get_u64_le();
        let num_hashes = buf.get_u32_le();
        let sip_keys = [
            (buf.get_u64_le(), buf.get_u64_le()),
            (buf.get_u64_le(), buf.get_u64_le()),
        ];
        let bitmap_len = buf.get_u32_le() as usize;
        if buf.remaining() < bitmap_len || (bitmap_len as u64) * 8 < num_bits {
            return Err(Error::InvalidRun("truncated skip index bitmap".to_string()));
        }
        let bloom = Bloom::from_existing(&buf[..bitmap_len], num_bits, num_hashes, sip_keys);
        buf.advance(bitmap_len);

        Ok(Self {
            column,
            false_positive_rate,
            distinct_values,
            bloom,
        })
    }
}

/// All skip-index filters of one run.
#[derive(Debug, Default)]
pub struct SkipIndex {
    entries: Vec<FilterEntry>,
}

impl SkipIndex {
    pub fn build(rows: &[MaterializedRow], defs: &[SkipIndexDef]) -> Self {
        Self {
            entries: defs
                .iter()
                .map(|def| FilterEntry::build(rows, def.column, def.false_positive_rate))
                .collect(),
        }
    }

    pub fn entry(&self, column: Column) -> Option<&FilterEntry> {
        self.entries.iter().find(|e| e.column == column)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the index covers exactly the columns a schema declares.
    pub fn matches(&self, defs: &[SkipIndexDef]) -> bool {
        self.entries.len() == defs.len() && defs.iter().all(|def| self.entry(def.column).is_some())
    }

    /// `false` when the run provably holds none of `values` in `column`. Columns
    /// without a filter always answer `true`.
    pub fn may_match(&self, column: Column, values: &[Value], stats: &SkipIndexStats) -> bool {
        let Some(entry) = self.entry(column) else {
            return true;
        };
        stats.lookups.fetch_add(1, Ordering::Relaxed);
        let hit = values.iter().any(|v| entry.maybe_contains(v));
        if !hit {
            stats.runs_skipped.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(SIDECAR_VERSION);
        buf.put_u16_le(self.entries.len() as u16);
        for entry in &self.entries {
            entry.encode(&mut buf);
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 7 {
            return Err(Error::InvalidRun("skip index sidecar too short".to_string()));
        }
        let (body, mut footer) = data.split_at(data.len() - 4);
        let expected = footer.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(Error::CrcMismatch { expected, actual });
        }

        let mut buf = body;
        let version = buf.get_u8();
        if version != SIDECAR_VERSION {
            return Err(Error::UnsupportedVersion(version as u16));
        }
        let count = buf.get_u16_le();
        let entries = (0..count)
            .map(|_| FilterEntry::decode(&mut buf))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }
}

/// Skip-index effectiveness counters, shared by all scans of a store.
#[derive(Debug, Default)]
pub struct SkipIndexStats {
    lookups: AtomicU64,
    runs_skipped: AtomicU64,
}

impl SkipIndexStats {
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn runs_skipped(&self) -> u64 {
        self.runs_skipped.load(Ordering::Relaxed)
    }

    /// Fraction of filter lookups that let a scan skip a run.
    pub fn skip_rate(&self) -> f64 {
        let lookups = self.lookups();
        if lookups == 0 {
            0.0
        } else {
            self.runs_skipped() as f64 / lookups as f64
        }
    }
}
