#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use txhouse_storage::run::format::{decode_run, RunReader};
use txhouse_storage::SkipIndex;

fuzz_target!(|data: &[u8]| {
    // Truncated footers, bad checksums, corrupt lz4 blocks, bogus column
    // lengths and row groups that disagree with the header must all surface
    // as errors.
    if let Ok(run) = decode_run(data) {
        let _ = run.partition_key();
        let _ = run.rows().len();
    }
    if let Ok(reader) = RunReader::open(Bytes::copy_from_slice(data)) {
        for row in reader.into_rows() {
            if row.is_err() {
                break;
            }
        }
    }
    let _ = SkipIndex::from_bytes(data);
});
