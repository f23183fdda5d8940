use super::helpers::*;
use crate::*;

fn round_trip(timestamps: &[i64], rows: &[Vec<Field>]) -> (Vec<i64>, Vec<Vec<Field>>) {
    let (block, n) = Block::from_rows(timestamps, rows);
    assert_eq!(n, rows.len());
    let bd = BlockData::from_block(sid(1), &block);
    let decoded = bd.to_block().unwrap();
    assert_eq!(decoded, block);
    let mut ts = Vec::new();
    let mut out = Vec::new();
    decoded.append_rows_to(&mut ts, &mut out);
    (ts, out)
}

// -------------------- Construction --------------------

#[test]
fn uniform_rows_build_columns() {
    let rows: Vec<Vec<Field>> = (0..10)
        .map(|i| {
            let n = i.to_string();
            fields(&[("", "msg"), ("n", &n)])
        })
        .collect();
    let ts: Vec<i64> = (0..10).collect();
    let (block, n) = Block::from_rows(&ts, &rows);
    assert_eq!(n, 10);
    assert_eq!(block.rows_count(), 10);
    assert_eq!(block.columns().len(), 1);
    assert_eq!(block.columns()[0].name, "n");
    assert_eq!(block.const_columns(), &[Field::new("", "msg")]);
}

#[test]
fn mixed_rows_fill_missing_values_with_empty() {
    let rows = vec![
        fields(&[("a", "1")]),
        fields(&[("b", "2")]),
        fields(&[("a", "3"), ("c", "4")]),
    ];
    let (block, n) = Block::from_rows(&[1, 2, 3], &rows);
    assert_eq!(n, 3);
    let names: Vec<&str> = block.columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert_eq!(block.columns()[0].values, vec!["1", "", "3"]);
    assert_eq!(block.columns()[1].values, vec!["", "2", ""]);
    assert_eq!(block.columns()[2].values, vec!["", "", "4"]);
}

#[test]
fn single_row_makes_everything_const() {
    let (block, _) = Block::from_rows(&[7], &[fields(&[("a", "1"), ("b", "2")])]);
    assert!(block.columns().is_empty());
    assert_eq!(block.const_columns().len(), 2);
}

#[test]
fn long_repeated_values_are_not_const() {
    let long = "v".repeat(MAX_CONST_COLUMN_VALUE_SIZE + 1);
    let rows = vec![fields(&[("a", &long)]), fields(&[("a", &long)])];
    let (block, _) = Block::from_rows(&[1, 2], &rows);
    assert_eq!(block.columns().len(), 1);
    assert!(block.const_columns().is_empty());
}

#[test]
fn columns_cap_splits_block() {
    let rows: Vec<Vec<Field>> = (0..3)
        .map(|r| {
            (0..1000)
                .map(|i| Field::new(format!("r{}_f{}", r, i), "x"))
                .collect()
        })
        .collect();
    let (block, n) = Block::from_rows(&[1, 2, 3], &rows);
    assert_eq!(n, 2);
    assert_eq!(block.rows_count(), 2);
    assert_eq!(block.columns_count(), MAX_COLUMNS_PER_BLOCK);

    let (rest, n) = Block::from_rows(&[3], &rows[2..]);
    assert_eq!(n, 1);
    assert_eq!(rest.columns_count(), 1000);
}

#[test]
fn uncompressed_size_matches_rows() {
    let rows = vec![
        fields(&[("", "first message"), ("level", "info")]),
        fields(&[("", "second"), ("level", "info"), ("user", "bob")]),
        fields(&[("level", "info")]),
    ];
    let (block, _) = Block::from_rows(&[1, 2, 3], &rows);
    assert_eq!(
        block.uncompressed_size_bytes(),
        uncompressed_rows_size_bytes(&rows)
    );
}

// -------------------- Encoded round trip --------------------

#[test]
fn rows_survive_encoding() {
    let rows = vec![
        fields(&[("", "GET /index.html"), ("code", "200"), ("ip", "10.0.0.1")]),
        fields(&[("", "GET /missing"), ("code", "404")]),
        fields(&[("code", "200"), ("ip", "10.0.0.2"), ("took", "0.25")]),
        fields(&[("", "POST /api"), ("at", "2024-01-01T00:00:00.000Z")]),
    ];
    let ts = vec![10, 10, 20, 30];
    let (out_ts, out_rows) = round_trip(&ts, &rows);
    assert_eq!(out_ts, ts);
    assert_eq!(out_rows, rows);
}

#[test]
fn typed_columns_survive_encoding() {
    let rows: Vec<Vec<Field>> = (0..50)
        .map(|i| {
            let n = (i * 1_000).to_string();
            let f = format!("{}.5", i);
            let ip = format!("192.168.0.{}", i);
            let at = format!("2024-01-01T00:00:{:02}.000Z", i);
            fields(&[("at", &at), ("f", &f), ("ip", &ip), ("n", &n)])
        })
        .collect();
    let ts: Vec<i64> = (0..50).collect();
    let (block, _) = Block::from_rows(&ts, &rows);
    let bd = BlockData::from_block(sid(1), &block);
    let types: Vec<(String, ValueType)> = bd
        .columns_data
        .iter()
        .map(|cd| (cd.name.clone(), cd.value_type))
        .collect();
    assert_eq!(
        types,
        vec![
            ("at".to_string(), ValueType::TimestampIso8601),
            ("f".to_string(), ValueType::Float64),
            ("ip".to_string(), ValueType::Ipv4),
            ("n".to_string(), ValueType::Uint16),
        ]
    );
    let (_, out_rows) = round_trip(&ts, &rows);
    assert_eq!(out_rows, rows);
}

#[test]
fn bloom_filters_cover_tokens() {
    let rows: Vec<Vec<Field>> = (0..20)
        .map(|i| {
            let msg = format!("User-{} logged IN from Berlin", i);
            fields(&[("", &msg)])
        })
        .collect();
    let ts: Vec<i64> = (0..20).collect();
    let (block, _) = Block::from_rows(&ts, &rows);
    let bd = BlockData::from_block(sid(1), &block);
    let bf = bloom::BloomFilter::unmarshal(&bd.columns_data[0].bloom_filter_data).unwrap();
    assert!(bf.contains_all(&["user", "logged", "in", "berlin", "17"]));
}

#[test]
fn dict_columns_have_no_bloom_filter() {
    let rows: Vec<Vec<Field>> = (0..20)
        .map(|i| fields(&[("level", ["info", "warn"][i % 2])]))
        .collect();
    let ts: Vec<i64> = (0..20).collect();
    let (block, _) = Block::from_rows(&ts, &rows);
    let bd = BlockData::from_block(sid(1), &block);
    assert_eq!(bd.columns_data[0].value_type, ValueType::Dict);
    assert!(bd.columns_data[0].bloom_filter_data.is_empty());
}

#[test]
fn full_block_detection() {
    let msg = "m".repeat(64 * 1024);
    let rows: Vec<Vec<Field>> = (0..40).map(|_| fields(&[("", &msg), ("i", "1")])).collect();
    let ts: Vec<i64> = (0..40).collect();
    let (block, _) = Block::from_rows(&ts, &rows);
    assert!(BlockData::from_block(sid(1), &block).is_full());

    let (small, _) = Block::from_rows(&ts[..2], &rows[..2]);
    assert!(!BlockData::from_block(sid(1), &small).is_full());
}
