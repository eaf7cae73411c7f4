#![no_main]

use libfuzzer_sys::fuzz_target;
use txhouse_core::codec::{decode, encode};
use txhouse_core::varint::decode_varint_u64;

fuzz_target!(|data: &[u8]| {
    // Arbitrary queue payloads must decode or fail with MalformedRecord, never panic.
    if let Ok(row) = decode(data) {
        let floats = [
            row.amount,
            row.lat,
            row.lon,
            row.merchant_lat,
            row.merchant_lon,
            row.population_city,
        ];
        // Non-finite floats have no JSON form; everything else must survive unchanged.
        if floats.iter().all(|v| v.is_finite()) {
            let again = decode(&encode(&row)).expect("encoded row must decode");
            assert_eq!(row, again);
        }
    }

    let mut cursor = data;
    let _ = decode_varint_u64(&mut cursor);
});
