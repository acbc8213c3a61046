//! End-to-end scenarios against the public API: build a hive in memory,
//! apply a plan, then read the result back using only what a real
//! consumer of this crate has access to.

use hive_merge::allocator::{AllocOptions, Allocator};
use hive_merge::bigdata::{self, BigDataBlock};
use hive_merge::cell::{self, CellClass};
use hive_merge::hbin::{HbinHeader, HBIN_HEADER_SIZE};
use hive_merge::header::BaseBlock;
use hive_merge::key::KeyNode;
use hive_merge::plan::{Op, Plan};
use hive_merge::session::{EngineMode, SessionOptions};
use hive_merge::subkey_list;
use hive_merge::utils::{cell_offset_to_absolute, read_u32_le, HBIN_START_OFFSET, INVALID_OFFSET};
use hive_merge::value::ValueData;
use hive_merge::HiveView;
use hive_merge::value::ValueKey;
use hive_merge::view::MemView;
use hive_merge::Hive;

const HIVE_AREA_LEN: u32 = 0x200000;

fn fresh_hive_bytes() -> Vec<u8> {
    let mut data = vec![0u8; hive_merge::header::BASE_BLOCK_SIZE + HIVE_AREA_LEN as usize];
    let root = KeyNode::new("ROOT", INVALID_OFFSET, true);
    let root_len = root.encoded_len();

    HbinHeader::format_new(&mut data[HBIN_START_OFFSET as usize..], 0, HIVE_AREA_LEN).unwrap();
    let free_size = HIVE_AREA_LEN - HBIN_HEADER_SIZE as u32;
    cell::write_cell_header(
        &mut data,
        (HBIN_START_OFFSET + HBIN_HEADER_SIZE as u32) as usize,
        free_size,
        false,
    )
    .unwrap();

    let mut view = MemView::new(data);
    let mut alloc = Allocator::scan(AllocOptions::default(), &view).unwrap();
    let root_offset = alloc.alloc(&mut view, root_len, CellClass::Nk).unwrap();
    let abs = cell_offset_to_absolute(root_offset).unwrap();
    let (size, _) = cell::read_cell_header(view.as_bytes(), abs as usize).unwrap();
    root.write(&mut view.as_bytes_mut()[(abs + 4) as usize..(abs + size) as usize]).unwrap();

    BaseBlock::format_new(view.as_bytes_mut(), root_offset, HIVE_AREA_LEN).unwrap();
    view.into_bytes()
}

fn path(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|s| s.to_string()).collect()
}

fn payload(data: &[u8], cell_offset: u32) -> Vec<u8> {
    let abs = cell_offset_to_absolute(cell_offset).unwrap();
    let (size, _) = cell::read_cell_header(data, abs as usize).unwrap();
    data[(abs + 4) as usize..(abs + size) as usize].to_vec()
}

fn read_key(data: &[u8], offset: u32) -> KeyNode {
    KeyNode::parse(&payload(data, offset), offset).unwrap()
}

fn read_value(data: &[u8], offset: u32) -> ValueKey {
    ValueKey::parse(&payload(data, offset), offset).unwrap()
}

fn read_value_list(data: &[u8], list_offset: u32, count: u32) -> Vec<u32> {
    if list_offset == INVALID_OFFSET || count == 0 {
        return Vec::new();
    }
    let raw = payload(data, list_offset);
    (0..count as usize)
        .filter_map(|i| {
            let pos = i * 4;
            (pos + 4 <= raw.len()).then(|| read_u32_le(&raw, pos).unwrap())
        })
        .collect()
}

fn find_child(data: &[u8], parent_offset: u32, name: &str) -> Option<u32> {
    let view = MemView::new(data.to_vec());
    let parent = read_key(data, parent_offset);
    if parent.subkey_list_offset == INVALID_OFFSET {
        return None;
    }
    subkey_list::flatten(&view, parent.subkey_list_offset)
        .unwrap()
        .into_iter()
        .find(|&child_offset| read_key(data, child_offset).name.eq_ignore_ascii_case(name))
}

fn find_value(data: &[u8], key_offset: u32, name: &str) -> Option<u32> {
    let key = read_key(data, key_offset);
    read_value_list(data, key.value_list_offset, key.value_count)
        .into_iter()
        .find(|&vk_offset| read_value(data, vk_offset).name.eq_ignore_ascii_case(name))
}

fn resolve_path(data: &[u8], root: u32, path: &str) -> Option<u32> {
    let mut current = root;
    for seg in path.split('\\') {
        current = find_child(data, current, seg)?;
    }
    Some(current)
}

/// Reads a value's data bytes exactly as stored, following big data
/// segments when the value is out-of-line and over the direct threshold.
fn value_data_bytes(data: &[u8], vk: &ValueKey) -> Vec<u8> {
    if vk.is_inline_data() {
        return vk.inline_data();
    }
    if vk.data_length == 0 {
        return Vec::new();
    }
    if vk.data_length as usize <= bigdata::MAX_DIRECT_VALUE_SIZE {
        return payload(data, vk.data_offset);
    }
    let header_payload = payload(data, vk.data_offset);
    let header = BigDataBlock::parse(&header_payload, vk.data_offset).unwrap();
    let list = payload(data, header.segment_list_offset);
    let mut out = Vec::with_capacity(vk.data_length as usize);
    for i in 0..header.segment_count as usize {
        let offset = read_u32_le(&list, i * 4).unwrap();
        out.extend_from_slice(&payload(data, offset));
    }
    out
}

fn root_offset(data: &[u8]) -> u32 {
    BaseBlock::parse(data).unwrap().root_cell_offset
}

#[test]
fn scenario_simple_upsert() {
    let mut hive = Hive::from_bytes(fresh_hive_bytes());
    let options = SessionOptions::default();

    let plan = Plan {
        ops: vec![
            Op::EnsureKey { key_path: path(&["Software", "Test"]) },
            Op::SetValue {
                key_path: path(&["Software", "Test"]),
                value_name: "Version".into(),
                value_type: "REG_SZ".into(),
                data: ValueData::String("1.0".into()).encode().0,
            },
        ],
    };
    let report = hive.apply(&plan, &options).unwrap();
    assert_eq!(report.ops_applied, 2);
    assert_eq!(report.keys_created, 2);
    assert_eq!(report.values_set, 1);

    let bytes = hive.to_bytes();
    let root = root_offset(&bytes);
    let key = resolve_path(&bytes, root, "Software\\Test").expect("key created");
    let vk_offset = find_value(&bytes, key, "Version").expect("value created");
    let vk = read_value(&bytes, vk_offset);
    let decoded = ValueData::parse(&value_data_bytes(&bytes, &vk), vk.data_type, vk_offset).unwrap();
    assert_eq!(decoded, ValueData::String("1.0".into()));
}

#[test]
fn scenario_last_write_wins() {
    let mut hive = Hive::from_bytes(fresh_hive_bytes());
    let options = SessionOptions::default();

    let plan = Plan {
        ops: vec![
            Op::SetValue {
                key_path: path(&["Software", "Test"]),
                value_name: "X".into(),
                value_type: "REG_DWORD".into(),
                data: ValueData::Dword(1).encode().0,
            },
            Op::SetValue {
                key_path: path(&["Software", "Test"]),
                value_name: "X".into(),
                value_type: "REG_DWORD".into(),
                data: ValueData::Dword(2).encode().0,
            },
        ],
    };
    hive.apply(&plan, &options).unwrap();

    let bytes = hive.to_bytes();
    let root = root_offset(&bytes);
    let key = resolve_path(&bytes, root, "Software\\Test").unwrap();
    let vk_offset = find_value(&bytes, key, "X").unwrap();
    let vk = read_value(&bytes, vk_offset);
    assert_eq!(value_data_bytes(&bytes, &vk), 2u32.to_le_bytes());
}

#[test]
fn scenario_recursive_delete() {
    let mut hive = Hive::from_bytes(fresh_hive_bytes());
    let options = SessionOptions::default();

    let populate = Plan {
        ops: vec![
            Op::SetValue { key_path: path(&["A"]), value_name: "v".into(), value_type: "REG_SZ".into(), data: ValueData::String("a".into()).encode().0 },
            Op::SetValue { key_path: path(&["A", "B"]), value_name: "v".into(), value_type: "REG_SZ".into(), data: ValueData::String("b".into()).encode().0 },
            Op::SetValue { key_path: path(&["A", "B", "C"]), value_name: "v".into(), value_type: "REG_SZ".into(), data: ValueData::String("c".into()).encode().0 },
            Op::SetValue { key_path: path(&["A", "B", "C", "D"]), value_name: "v".into(), value_type: "REG_SZ".into(), data: ValueData::String("d".into()).encode().0 },
        ],
    };
    hive.apply(&populate, &options).unwrap();

    let delete = Plan { ops: vec![Op::DeleteKey { key_path: path(&["A", "B"]) }] };
    hive.apply(&delete, &options).unwrap();

    let bytes = hive.to_bytes();
    let root = root_offset(&bytes);
    assert!(resolve_path(&bytes, root, "A").is_some());
    assert!(resolve_path(&bytes, root, "A\\B").is_none());
    assert!(resolve_path(&bytes, root, "A\\B\\C").is_none());
    assert!(resolve_path(&bytes, root, "A\\B\\C\\D").is_none());
}

#[test]
fn scenario_large_value_round_trips_through_big_data_segments() {
    let mut hive = Hive::from_bytes(fresh_hive_bytes());
    let options = SessionOptions::default();

    let big: Vec<u8> = (0..51200u32).map(|i| (i % 256) as u8).collect();
    let plan = Plan {
        ops: vec![Op::SetValue {
            key_path: path(&["Software", "Test"]),
            value_name: "Blob".into(),
            value_type: "REG_BINARY".into(),
            data: ValueData::Binary(big.clone()).encode().0,
        }],
    };
    hive.apply(&plan, &options).unwrap();

    let bytes = hive.to_bytes();
    let root = root_offset(&bytes);
    let key = resolve_path(&bytes, root, "Software\\Test").unwrap();
    let vk_offset = find_value(&bytes, key, "Blob").unwrap();
    let vk = read_value(&bytes, vk_offset);
    assert_eq!(vk.data_length as usize, big.len());
    assert!(!vk.is_inline_data());
    assert_eq!(value_data_bytes(&bytes, &vk), big);
}

#[test]
fn scenario_sibling_integrity_under_single_pass() {
    let mut hive = Hive::from_bytes(fresh_hive_bytes());
    let options = SessionOptions { engine_mode: EngineMode::SinglePass, ..Default::default() };

    let names = ["Alpha", "Beta", "Gamma", "Delta", "Epsilon"];
    let ops = names
        .iter()
        .enumerate()
        .map(|(i, name)| Op::SetValue {
            key_path: path(&["S", name]),
            value_name: "v".into(),
            value_type: "REG_DWORD".into(),
            data: ValueData::Dword(i as u32 + 1).encode().0,
        })
        .collect();
    hive.apply(&Plan { ops }, &options).unwrap();

    let bytes = hive.to_bytes();
    let root = root_offset(&bytes);
    for (i, name) in names.iter().enumerate() {
        let key = resolve_path(&bytes, root, &format!("S\\{name}")).unwrap();
        let vk_offset = find_value(&bytes, key, "v").unwrap();
        let vk = read_value(&bytes, vk_offset);
        assert_eq!(value_data_bytes(&bytes, &vk), (i as u32 + 1).to_le_bytes());
    }
}

#[test]
fn scenario_delete_then_recreate_under_same_plan() {
    let mut hive = Hive::from_bytes(fresh_hive_bytes());
    let options = SessionOptions { engine_mode: EngineMode::SinglePass, ..Default::default() };

    let populate = Plan {
        ops: vec![Op::SetValue { key_path: path(&["P"]), value_name: "v".into(), value_type: "REG_SZ".into(), data: ValueData::String("x".into()).encode().0 }],
    };
    hive.apply(&populate, &options).unwrap();

    let plan = Plan {
        ops: vec![
            Op::DeleteKey { key_path: path(&["P"]) },
            Op::SetValue { key_path: path(&["P", "Child"]), value_name: "v".into(), value_type: "REG_SZ".into(), data: ValueData::String("y".into()).encode().0 },
        ],
    };
    let report = hive.apply(&plan, &options).unwrap();
    assert_eq!(report.ops_applied, 2);
    assert_eq!(report.keys_deleted, 1);
    assert_eq!(report.keys_created, 2);
    assert_eq!(report.values_set, 1);

    let bytes = hive.to_bytes();
    let root = root_offset(&bytes);
    assert!(resolve_path(&bytes, root, "P").is_some());
    let child = resolve_path(&bytes, root, "P\\Child").expect("recreated under deleted parent");
    let vk_offset = find_value(&bytes, child, "v").unwrap();
    let vk = read_value(&bytes, vk_offset);
    let decoded = ValueData::parse(&value_data_bytes(&bytes, &vk), vk.data_type, vk_offset).unwrap();
    assert_eq!(decoded, ValueData::String("y".into()));
}

#[test]
fn scenario_case_insensitive_lookup() {
    let mut hive = Hive::from_bytes(fresh_hive_bytes());
    let options = SessionOptions::default();

    let plan = Plan {
        ops: vec![Op::SetValue {
            key_path: path(&["SOFTWARE", "Vendor"]),
            value_name: "Enabled".into(),
            value_type: "REG_DWORD".into(),
            data: ValueData::Dword(1).encode().0,
        }],
    };
    hive.apply(&plan, &options).unwrap();

    let bytes = hive.to_bytes();
    let root = root_offset(&bytes);
    let via_lower = resolve_path(&bytes, root, "software\\vendor").unwrap();
    let via_mixed = resolve_path(&bytes, root, "Software\\VENDOR").unwrap();
    assert_eq!(via_lower, via_mixed);
    assert!(find_value(&bytes, via_lower, "enabled").is_some());
    assert!(find_value(&bytes, via_lower, "ENABLED").is_some());
}

#[test]
fn commit_consistency_matches_sequence_numbers() {
    let mut hive = Hive::from_bytes(fresh_hive_bytes());
    let options = SessionOptions::default();
    let plan = Plan { ops: vec![Op::EnsureKey { key_path: path(&["Software"]) }] };
    hive.apply(&plan, &options).unwrap();

    let base = hive.base_block().unwrap();
    assert_eq!(base.primary_sequence, base.secondary_sequence);
    assert!(base.is_consistent());
}

/// Asserts against the documented `{"operations": [...]}` wire shape
/// itself, not merely whatever the code happens to produce: `key_path` as
/// an array of name segments, `data` as a plain byte array.
#[test]
fn json_plan_round_trips_byte_for_byte() {
    let json_str = r#"{"operations": [
        {"op": "ensure_key", "key_path": ["Software", "Test"]},
        {"op": "set_value", "key_path": ["Software", "Test"], "value_name": "Version",
         "value_type": "REG_SZ", "data": [49, 0, 46, 0, 48, 0, 0, 0]},
        {"op": "delete_value", "key_path": ["Software", "Test"], "value_name": "Old"},
        {"op": "delete_key", "key_path": ["Software", "Stale"]}
    ]}"#;

    let parsed = Plan::from_json_str(json_str).unwrap();
    assert_eq!(
        parsed.ops,
        vec![
            Op::EnsureKey { key_path: path(&["Software", "Test"]) },
            Op::SetValue {
                key_path: path(&["Software", "Test"]),
                value_name: "Version".into(),
                value_type: "REG_SZ".into(),
                data: vec![49, 0, 46, 0, 48, 0, 0, 0],
            },
            Op::DeleteValue { key_path: path(&["Software", "Test"]), value_name: "Old".into() },
            Op::DeleteKey { key_path: path(&["Software", "Stale"]) },
        ]
    );

    let re_serialized = parsed.to_json_string().unwrap();
    let re_parsed = Plan::from_json_str(&re_serialized).unwrap();
    assert_eq!(re_parsed.ops, parsed.ops);
}

#[test]
fn apply_on_disk_hive_via_tempfile() {
    let dir = tempfile::tempdir().unwrap();
    let path_buf = dir.path().join("SOFTWARE");
    std::fs::write(&path_buf, fresh_hive_bytes()).unwrap();

    let mut hive = Hive::open(&path_buf).unwrap();
    let options = SessionOptions::default();
    let plan = Plan {
        ops: vec![Op::SetValue {
            key_path: path(&["Software", "Test"]),
            value_name: "Version".into(),
            value_type: "REG_SZ".into(),
            data: ValueData::String("1.0".into()).encode().0,
        }],
    };
    let report = hive.apply(&plan, &options).unwrap();
    assert_eq!(report.ops_applied, 1);
    assert!(hive.base_block().unwrap().is_consistent());

    drop(hive);
    let reopened = Hive::open(&path_buf).unwrap();
    assert!(reopened.base_block().unwrap().is_consistent());
}
