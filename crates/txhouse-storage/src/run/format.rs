//! Run File Format
//!
//! A run file stores one sorted run column by column, in row groups of up to
//! [`ROWS_PER_GROUP`] rows so a reader decodes one group at a time.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Header (18 bytes)                           │
//! │  magic "TXRN" │ version u16 │ compression   │
//! │  u16 │ partition_key u32 │ rows u32 │       │
//! │  column_count u16                           │
//! ├─────────────────────────────────────────────┤
//! │ Row group × ceil(rows / ROWS_PER_GROUP)     │
//! │  group_rows u32                             │
//! │  Column block × column_count                │
//! │   column_id u16 │ raw_len u32 │ stored_len  │
//! │   u32 │ stored bytes (lz4 or raw)           │
//! ├─────────────────────────────────────────────┤
//! │ Footer (8 bytes)                            │
//! │  crc32 of everything above │ magic "TXRN"   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Column encodings:
//! - text: varint length + UTF-8 bytes per row
//! - float: little-endian f64 per row
//! - target: presence byte, then the value byte when present
//! - transaction_date: zigzag varint of days since 0001-01-01
//! - seq: zigzag varint delta from the previous row's seq (restarting at 0 per group)
//!
//! `partition_key` is constant per run and lives in the header only. All integers are
//! little-endian.

use crate::config::Compression;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDate};
use std::collections::HashMap;
use txhouse_core::varint::{decode_varint, decode_varint_u64, encode_varint, encode_varint_u64};
use txhouse_core::{Column, ColumnKind, Error, MaterializedRow, Result, Row};

use super::SortedRun;

pub const MAGIC: &[u8; 4] = b"TXRN";
pub const VERSION: u16 = 2;

/// Rows per row group; bounds what a reader holds decoded per run.
pub const ROWS_PER_GROUP: usize = 4096;

const HEADER_LEN: usize = 18;
const FOOTER_LEN: usize = 8;
const SEQ_COLUMN_ID: u16 = 0x8000;

enum ColumnData {
    Text(Vec<String>),
    Float(Vec<f64>),
    NullableU8(Vec<Option<u8>>),
    Date(Vec<NaiveDate>),
    Seq(Vec<u64>),
}

impl ColumnData {
    fn len(&self) -> usize {
        match self {
            ColumnData::Text(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::NullableU8(v) => v.len(),
            ColumnData::Date(v) => v.len(),
            ColumnData::Seq(v) => v.len(),
        }
    }
}

/// Columns that get a block in the file. `partition_key` is in the header.
fn stored_columns() -> impl Iterator<Item = Column> {
    Column::ALL
        .into_iter()
        .filter(|c| *c != Column::PartitionKey)
}

pub fn encode_run(run: &SortedRun, compression: Compression) -> Result<Bytes> {
    let rows = run.rows();
    let row_count = u32::try_from(rows.len())
        .map_err(|_| Error::InvalidRun(format!("{} rows exceed run capacity", rows.len())))?;
    let column_count = stored_columns().count() + 1;

    let mut buf = BytesMut::new();
    buf.put_slice(MAGIC);
    buf.put_u16_le(VERSION);
    buf.put_u16_le(compression.id());
    buf.put_u32_le(run.partition_key());
    buf.put_u32_le(row_count);
    buf.put_u16_le(column_count as u16);

    for group in rows.chunks(ROWS_PER_GROUP) {
        buf.put_u32_le(group.len() as u32);
        let mut blocks: Vec<(u16, BytesMut)> = stored_columns()
            .map(|column| (column.id(), encode_column(column, group)))
            .collect();
        blocks.push((SEQ_COLUMN_ID, encode_seq(group)));

        for (id, raw) in blocks {
            let stored = match compression {
                Compression::Lz4 => lz4_flex::compress_prepend_size(&raw),
                Compression::None => raw.to_vec(),
            };
            buf.put_u16_le(id);
            buf.put_u32_le(raw.len() as u32);
            buf.put_u32_le(stored.len() as u32);
            buf.put_slice(&stored);
        }
    }

    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf.put_slice(MAGIC);

    Ok(buf.freeze())
}

fn encode_column(column: Column, rows: &[MaterializedRow]) -> BytesMut {
    let mut buf = BytesMut::new();
    match column.kind() {
        ColumnKind::Text => {
            for row in rows {
                let text = text_of(&row.row, column);
                encode_varint_u64(&mut buf, text.len() as u64);
                buf.put_slice(text.as_bytes());
            }
        }
        ColumnKind::Float => {
            for row in rows {
                buf.put_f64_le(float_of(&row.row, column));
            }
        }
        ColumnKind::NullableU8 => {
            for row in rows {
                match row.row.target {
                    Some(v) => {
                        buf.put_u8(1);
                        buf.put_u8(v);
                    }
                    None => buf.put_u8(0),
                }
            }
        }
        ColumnKind::Date => {
            for row in rows {
                encode_varint(&mut buf, row.transaction_date.num_days_from_ce() as i64);
            }
        }
        ColumnKind::UInt32 => {}
    }
    buf
}

fn encode_seq(rows: &[MaterializedRow]) -> BytesMut {
    let mut buf = BytesMut::new();
    let mut prev = 0u64;
    for row in rows {
        encode_varint(&mut buf, row.seq.wrapping_sub(prev) as i64);
        prev = row.seq;
    }
    buf
}

/// Decode a whole run into memory.
pub fn decode_run(data: &[u8]) -> Result<SortedRun> {
    let mut reader = RunReader::open(Bytes::copy_from_slice(data))?;
    let mut rows = Vec::with_capacity(reader.row_count());
    while let Some(group) = reader.next_group()? {
        rows.extend(group);
    }
    Ok(SortedRun::presorted(reader.partition_key(), rows))
}

/// Validated run file that decodes one row group per call.
///
/// The whole file (compressed) stays in memory; decoded rows exist only for the
/// group being read.
#[derive(Debug)]
pub struct RunReader {
    data: Bytes,
    /// Offset of the next row group
    pos: usize,
    body_end: usize,
    compression: Compression,
    partition_key: u32,
    row_count: usize,
    rows_read: usize,
    column_count: u16,
}

impl RunReader {
    /// Check magic, checksum and header. No column is decoded yet.
    pub fn open(data: Bytes) -> Result<Self> {
        if data.len() < HEADER_LEN + FOOTER_LEN {
            return Err(Error::InvalidRun(format!("file too short: {} bytes", data.len())));
        }
        if &data[..4] != MAGIC || &data[data.len() - 4..] != MAGIC {
            return Err(Error::InvalidMagic);
        }

        let body_end = data.len() - FOOTER_LEN;
        let mut footer = &data[body_end..];
        let expected = footer.get_u32_le();
        let actual = crc32fast::hash(&data[..body_end]);
        if expected != actual {
            return Err(Error::CrcMismatch { expected, actual });
        }

        let mut header = &data[4..HEADER_LEN];
        let version = header.get_u16_le();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let compression_id = header.get_u16_le();
        let compression = Compression::from_id(compression_id)
            .ok_or(Error::InvalidCompression(compression_id))?;
        let partition_key = header.get_u32_le();
        let row_count = header.get_u32_le() as usize;
        let column_count = header.get_u16_le();

        Ok(Self {
            data,
            pos: HEADER_LEN,
            body_end,
            compression,
            partition_key,
            row_count,
            rows_read: 0,
            column_count,
        })
    }

    pub fn partition_key(&self) -> u32 {
        self.partition_key
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Decode the next row group. `Ok(None)` once every row has been read.
    pub fn next_group(&mut self) -> Result<Option<Vec<MaterializedRow>>> {
        if self.rows_read == self.row_count {
            if self.pos != self.body_end {
                return Err(Error::InvalidRun(format!(
                    "{} bytes after the last row group",
                    self.body_end - self.pos
                )));
            }
            return Ok(None);
        }

        let mut buf = &self.data[self.pos..self.body_end];
        if buf.remaining() < 4 {
            return Err(Error::InvalidRun("truncated row group header".to_string()));
        }
        let group_rows = buf.get_u32_le() as usize;
        if group_rows == 0 || group_rows > self.row_count - self.rows_read {
            return Err(Error::InvalidRun(format!(
                "row group of {} rows with {} left",
                group_rows,
                self.row_count - self.rows_read
            )));
        }

        let mut columns: HashMap<u16, ColumnData> = HashMap::new();
        for _ in 0..self.column_count {
            if buf.remaining() < 10 {
                return Err(Error::InvalidRun("truncated column header".to_string()));
            }
            let id = buf.get_u16_le();
            let raw_len = buf.get_u32_le() as usize;
            let stored_len = buf.get_u32_le() as usize;
            if buf.remaining() < stored_len {
                return Err(Error::InvalidRun(format!("truncated column block {}", id)));
            }
            let stored = &buf[..stored_len];
            let raw = match self.compression {
                Compression::Lz4 => lz4_flex::decompress_size_prepended(stored)
                    .map_err(|e| Error::Decompression(e.to_string()))?,
                Compression::None => stored.to_vec(),
            };
            buf.advance(stored_len);
            if raw.len() != raw_len {
                return Err(Error::InvalidRun(format!(
                    "column block {} decoded to {} bytes, header says {}",
                    id,
                    raw.len(),
                    raw_len
                )));
            }

            let data = decode_column(id, &raw, group_rows)?;
            if data.len() != group_rows {
                return Err(Error::InvalidRun(format!(
                    "column block {} has {} values for {} rows",
                    id,
                    data.len(),
                    group_rows
                )));
            }
            columns.insert(id, data);
        }

        self.pos = self.body_end - buf.remaining();
        self.rows_read += group_rows;
        assemble(self.partition_key, group_rows, columns).map(Some)
    }

    /// Stream the remaining rows, decoding a group whenever the previous one runs out.
    pub fn into_rows(self) -> RunRows {
        RunRows {
            reader: self,
            group: Vec::new().into_iter(),
            failed: false,
        }
    }
}

/// Row iterator over a [`RunReader`]. Yields at most one error, then ends.
#[derive(Debug)]
pub struct RunRows {
    reader: RunReader,
    group: std::vec::IntoIter<MaterializedRow>,
    failed: bool,
}

impl Iterator for RunRows {
    type Item = Result<MaterializedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.group.next() {
                return Some(Ok(row));
            }
            if self.failed {
                return None;
            }
            match self.reader.next_group() {
                Ok(Some(rows)) => self.group = rows.into_iter(),
                Ok(None) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

fn decode_column(id: u16, raw: &[u8], row_count: usize) -> Result<ColumnData> {
    let mut buf = raw;
    if id == SEQ_COLUMN_ID {
        let mut seqs = Vec::with_capacity(row_count);
        let mut prev = 0u64;
        for _ in 0..row_count {
            prev = prev.wrapping_add(decode_varint(&mut buf)? as u64);
            seqs.push(prev);
        }
        return Ok(ColumnData::Seq(seqs));
    }

    let column = Column::from_id(id)
        .ok_or_else(|| Error::InvalidRun(format!("unknown column id {}", id)))?;
    let data = match column.kind() {
        ColumnKind::Text => {
            let mut values = Vec::with_capacity(row_count);
            for _ in 0..row_count {
                let len = decode_varint_u64(&mut buf)? as usize;
                if buf.remaining() < len {
                    return Err(Error::InvalidRun(format!("truncated text in {}", column)));
                }
                let text = std::str::from_utf8(&buf[..len])
                    .map_err(|e| Error::InvalidRun(format!("{}: {}", column, e)))?;
                values.push(text.to_string());
                buf.advance(len);
            }
            ColumnData::Text(values)
        }
        ColumnKind::Float => {
            if buf.remaining() < row_count * 8 {
                return Err(Error::InvalidRun(format!("truncated floats in {}", column)));
            }
            ColumnData::Float((0..row_count).map(|_| buf.get_f64_le()).collect())
        }
        ColumnKind::NullableU8 => {
            let mut values = Vec::with_capacity(row_count);
            for _ in 0..row_count {
                if !buf.has_remaining() {
                    return Err(Error::InvalidRun(format!("truncated {}", column)));
                }
                match buf.get_u8() {
                    0 => values.push(None),
                    _ if buf.has_remaining() => values.push(Some(buf.get_u8())),
                    _ => return Err(Error::InvalidRun(format!("truncated {}", column))),
                }
            }
            ColumnData::NullableU8(values)
        }
        ColumnKind::Date => {
            let mut values = Vec::with_capacity(row_count);
            for _ in 0..row_count {
                let days = decode_varint(&mut buf)?;
                let date = i32::try_from(days)
                    .ok()
                    .and_then(NaiveDate::from_num_days_from_ce_opt)
                    .ok_or_else(|| Error::InvalidRun(format!("date out of range: {}", days)))?;
                values.push(date);
            }
            ColumnData::Date(values)
        }
        ColumnKind::UInt32 => {
            return Err(Error::InvalidRun(format!("unexpected block for {}", column)))
        }
    };
    Ok(data)
}

fn assemble(
    partition_key: u32,
    row_count: usize,
    mut columns: HashMap<u16, ColumnData>,
) -> Result<Vec<MaterializedRow>> {
    let mut text = |column: Column| match columns.remove(&column.id()) {
        Some(ColumnData::Text(values)) => Ok(values.into_iter()),
        _ => Err(Error::InvalidRun(format!("missing column {}", column))),
    };
    let mut transaction_time = text(Column::TransactionTime)?;
    let mut merch = text(Column::Merch)?;
    let mut cat_id = text(Column::CatId)?;
    let mut name_1 = text(Column::Name1)?;
    let mut name_2 = text(Column::Name2)?;
    let mut gender = text(Column::Gender)?;
    let mut street = text(Column::Street)?;
    let mut one_city = text(Column::OneCity)?;
    let mut us_state = text(Column::UsState)?;
    let mut jobs = text(Column::Jobs)?;

    let mut float = |column: Column| match columns.remove(&column.id()) {
        Some(ColumnData::Float(values)) => Ok(values.into_iter()),
        _ => Err(Error::InvalidRun(format!("missing column {}", column))),
    };
    let mut amount = float(Column::Amount)?;
    let mut lat = float(Column::Lat)?;
    let mut lon = float(Column::Lon)?;
    let mut merchant_lat = float(Column::MerchantLat)?;
    let mut merchant_lon = float(Column::MerchantLon)?;
    let mut population_city = float(Column::PopulationCity)?;

    let mut target = match columns.remove(&Column::Target.id()) {
        Some(ColumnData::NullableU8(values)) => values.into_iter(),
        _ => return Err(Error::InvalidRun("missing column target".to_string())),
    };
    let mut dates = match columns.remove(&Column::TransactionDate.id()) {
        Some(ColumnData::Date(values)) => values.into_iter(),
        _ => return Err(Error::InvalidRun("missing column transaction_date".to_string())),
    };
    let mut seqs = match columns.remove(&SEQ_COLUMN_ID) {
        Some(ColumnData::Seq(values)) => values.into_iter(),
        _ => return Err(Error::InvalidRun("missing seq column".to_string())),
    };

    // Every column was length-checked against row_count during decode.
    let short = || Error::InvalidRun("column shorter than row count".to_string());
    let mut rows = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        let row = Row {
            transaction_time: transaction_time.next().ok_or_else(short)?,
            merch: merch.next().ok_or_else(short)?,
            cat_id: cat_id.next().ok_or_else(short)?,
            name_1: name_1.next().ok_or_else(short)?,
            name_2: name_2.next().ok_or_else(short)?,
            gender: gender.next().ok_or_else(short)?,
            street: street.next().ok_or_else(short)?,
            one_city: one_city.next().ok_or_else(short)?,
            us_state: us_state.next().ok_or_else(short)?,
            jobs: jobs.next().ok_or_else(short)?,
            amount: amount.next().ok_or_else(short)?,
            lat: lat.next().ok_or_else(short)?,
            lon: lon.next().ok_or_else(short)?,
            merchant_lat: merchant_lat.next().ok_or_else(short)?,
            merchant_lon: merchant_lon.next().ok_or_else(short)?,
            population_city: population_city.next().ok_or_else(short)?,
            target: target.next().ok_or_else(short)?,
        };
        rows.push(MaterializedRow {
            row,
            transaction_date: dates.next().ok_or_else(short)?,
            partition_key,
            seq: seqs.next().ok_or_else(short)?,
        });
    }

    Ok(rows)
}

fn text_of(row: &Row, column: Column) -> &str {
    match column {
        Column::TransactionTime => &row.transaction_time,
        Column::Merch => &row.merch,
        Column::CatId => &row.cat_id,
        Column::Name1 => &row.name_1,
        Column::Name2 => &row.name_2,
        Column::Gender => &row.gender,
        Column::Street => &row.street,
        Column::OneCity => &row.one_city,
        Column::UsState => &row.us_state,
        Column::Jobs => &row.jobs,
        _ => "",
    }
}

fn float_of(row: &Row, column: Column) -> f64 {
    match column {
        Column::Amount => row.amount,
        Column::Lat => row.lat,
        Column::Lon => row.lon,
        Column::MerchantLat => row.merchant_lat,
        Column::MerchantLon => row.merchant_lon,
        Column::PopulationCity => row.population_city,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txhouse_core::TableSchema;

    fn sample(state: &str, category: &str, amount: f64, target: Option<u8>) -> MaterializedRow {
        MaterializedRow::from_row(Row {
            transaction_time: "2019-01-05 08:00:00".to_string(),
            merch: "fraud_Kirlin and Sons".to_string(),
            cat_id: category.to_string(),
            name_1: "Ünïcode".to_string(),
            name_2: String::new(),
            gender: "F".to_string(),
            street: "1 Main St".to_string(),
            one_city: "Springfield".to_string(),
            us_state: state.to_string(),
            jobs: "Engineer".to_string(),
            amount,
            lat: 40.1,
            lon: -89.2,
            merchant_lat: f64::NAN,
            merchant_lon: -0.0,
            population_city: 1e6,
            target,
        })
    }

    fn sample_run() -> SortedRun {
        let schema = TableSchema::transactions();
        let mut rows = vec![
            sample("NY", "grocery_pos", 30.0, Some(1)),
            sample("CA", "gas_transport", 80.0, None),
            sample("CA", "grocery_pos", 50.0, Some(0)),
        ];
        for (i, row) in rows.iter_mut().enumerate() {
            row.seq = 100 + i as u64;
        }
        SortedRun::from_rows(201901, rows, &schema.order_by)
    }

    fn assert_same(a: &SortedRun, b: &SortedRun) {
        assert_eq!(a.partition_key(), b.partition_key());
        assert_eq!(a.len(), b.len());
        for (x, y) in a.rows().iter().zip(b.rows()) {
            assert_eq!(x.seq, y.seq);
            assert_eq!(x.transaction_date, y.transaction_date);
            assert_eq!(x.row.us_state, y.row.us_state);
            assert_eq!(x.row.name_1, y.row.name_1);
            assert_eq!(x.row.target, y.row.target);
            assert_eq!(x.row.amount.to_bits(), y.row.amount.to_bits());
            assert_eq!(x.row.merchant_lat.to_bits(), y.row.merchant_lat.to_bits());
            assert_eq!(x.row.merchant_lon.to_bits(), y.row.merchant_lon.to_bits());
        }
    }

    #[test]
    fn test_lz4_and_raw_files_decode() {
        let run = sample_run();
        for compression in [Compression::Lz4, Compression::None] {
            let bytes = encode_run(&run, compression).unwrap();
            let decoded = decode_run(&bytes).unwrap();
            assert_same(&run, &decoded);
        }
    }

    #[test]
    fn test_empty_run() {
        let run = SortedRun::presorted(202001, Vec::new());
        let decoded = decode_run(&encode_run(&run, Compression::Lz4).unwrap()).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded.partition_key(), 202001);
    }

    #[test]
    fn test_corruption_detected() {
        let bytes = encode_run(&sample_run(), Compression::Lz4).unwrap().to_vec();

        let mut flipped = bytes.clone();
        flipped[HEADER_LEN + 3] ^= 0xFF;
        assert!(matches!(decode_run(&flipped), Err(Error::CrcMismatch { .. })));

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(decode_run(&bad_magic), Err(Error::InvalidMagic)));

        assert!(decode_run(&bytes[..bytes.len() / 2]).is_err());
        assert!(decode_run(&bytes[..10]).is_err());
    }

    fn reseal(bytes: &mut [u8]) {
        let body_end = bytes.len() - FOOTER_LEN;
        let crc = crc32fast::hash(&bytes[..body_end]);
        bytes[body_end..body_end + 4].copy_from_slice(&crc.to_le_bytes());
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut bytes = encode_run(&sample_run(), Compression::None).unwrap().to_vec();
        bytes[4] = 9;
        reseal(&mut bytes);
        assert!(matches!(decode_run(&bytes), Err(Error::UnsupportedVersion(9))));
    }

    #[test]
    fn test_reader_decodes_one_group_at_a_time() {
        let schema = TableSchema::transactions();
        let states = ["AL", "CA", "NY"];
        let total = ROWS_PER_GROUP * 2 + 10;
        let rows: Vec<MaterializedRow> = (0..total)
            .map(|i| {
                let mut row = sample(states[i % 3], "grocery_pos", i as f64, None);
                row.seq = i as u64 * 3;
                row
            })
            .collect();
        let run = SortedRun::from_rows(201901, rows, &schema.order_by);
        let bytes = encode_run(&run, Compression::Lz4).unwrap();

        let mut reader = RunReader::open(bytes.clone()).unwrap();
        assert_eq!(reader.row_count(), total);
        assert_eq!(reader.partition_key(), 201901);
        let mut sizes = Vec::new();
        while let Some(group) = reader.next_group().unwrap() {
            sizes.push(group.len());
        }
        assert_eq!(sizes, vec![ROWS_PER_GROUP, ROWS_PER_GROUP, 10]);

        assert_same(&run, &decode_run(&bytes).unwrap());
        let streamed: Vec<u64> = RunReader::open(bytes)
            .unwrap()
            .into_rows()
            .map(|row| row.unwrap().seq)
            .collect();
        let expected: Vec<u64> = run.rows().iter().map(|r| r.seq).collect();
        assert_eq!(streamed, expected);
    }

    #[test]
    fn test_row_count_disagreeing_with_groups_rejected() {
        let mut bytes = encode_run(&sample_run(), Compression::None).unwrap().to_vec();
        // Header claims one more row than the groups hold.
        bytes[12..16].copy_from_slice(&4u32.to_le_bytes());
        reseal(&mut bytes);
        assert!(matches!(decode_run(&bytes), Err(Error::InvalidRun(_))));

        let mut rows = RunReader::open(Bytes::from(bytes)).unwrap().into_rows();
        assert_eq!(rows.by_ref().filter(|r| r.is_ok()).count(), 3);
        assert!(rows.next().is_none());
    }
}
