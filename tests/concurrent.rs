use chaos::{
    decode, Decoder, Encoder, List, Object, ParallelDecoder, ParallelEncoder, Value,
};
use tempfile::tempdir;

fn object(fields: Vec<(&str, Value)>) -> Value {
    let mut obj = Object::new();
    for (key, value) in fields {
        obj.insert(key, value);
    }
    Value::Object(obj)
}

fn list(elements: Vec<Value>) -> Value {
    Value::List(List::from(elements))
}

/// A deterministic document mixing every variant, wide and deep enough to
/// keep several workers busy.
fn generated_doc(records: usize) -> Value {
    let mut root = Object::new();
    let mut items = List::new();
    for i in 0..records {
        let mut record = Object::new();
        record.insert("id", Value::Int(i as i64));
        record.insert("name", Value::from(format!("record-{i:05}")));
        record.insert("score", Value::Float((i as f32) as f64 * 0.5));
        record.insert("active", Value::Bool(i % 3 == 0));
        record.insert("flag", Value::Byte((i % 256) as u8));
        record.insert(
            "tags",
            list(
                (0..(i % 5))
                    .map(|t| Value::from(format!("tag{t}")))
                    .collect(),
            ),
        );
        if i % 7 == 0 {
            record.insert("notes", Value::from("note ".repeat(50 + i % 40)));
        } else {
            record.insert("notes", Value::Null);
        }
        items.push(Value::Object(record));
    }
    root.insert("items", Value::List(items));
    root.insert("count", Value::Int(records as i64));
    Value::Object(root)
}

#[test]
fn parallel_encoder_agrees_with_serial() {
    let doc = generated_doc(300);
    let dir = tempdir().unwrap();
    let serial_path = dir.path().join("serial.chaos");
    let parallel_path = dir.path().join("parallel.chaos");

    Encoder::new().encode(&doc, &serial_path).unwrap();
    ParallelEncoder::new().encode(&doc, &parallel_path).unwrap();

    assert_eq!(decode(&serial_path).unwrap(), doc);
    assert_eq!(decode(&parallel_path).unwrap(), doc);
}

#[test]
fn parallel_decoder_agrees_with_serial() {
    let doc = generated_doc(300);
    let dir = tempdir().unwrap();
    let path = dir.path().join("doc.chaos");
    Encoder::new().encode(&doc, &path).unwrap();

    let parallel = ParallelDecoder::new().decode(&path).unwrap();
    assert_eq!(parallel, doc);
    assert_eq!(parallel, decode(&path).unwrap());
}

#[test]
fn parallel_both_ways() {
    let doc = generated_doc(120);
    let dir = tempdir().unwrap();
    let path = dir.path().join("doc.chaos");
    ParallelEncoder::new().encode(&doc, &path).unwrap();
    assert_eq!(ParallelDecoder::new().decode(&path).unwrap(), doc);
}

#[test]
fn worker_count_override() {
    let doc = generated_doc(60);
    let dir = tempdir().unwrap();
    let path = dir.path().join("doc.chaos");
    Encoder::new().encode(&doc, &path).unwrap();

    for workers in [1, 2, 16] {
        assert_eq!(
            ParallelDecoder::with_workers(workers).decode(&path).unwrap(),
            doc,
            "workers = {workers}"
        );
    }
}

/// Builds a two-entity file by hand: entity 0 is `{"a": <ref 1>}` and
/// entity 1 is `{"a": <ref 0>}`, a reference cycle no encoder produces.
fn cyclic_file() -> Vec<u8> {
    let body = [
        0x01, 0x01, 0x00, 0x00, 0x81, // entity 0: {"a": ref -> 1}
        0x01, 0x01, 0x00, 0x00, 0x80, // entity 1: {"a": ref -> 0}
    ];
    let header = [
        0x02, // entity count
        0x02, 0x01, b'a', // dictionary: ["a"], raw frame
        0x01, // entity offset width
        0x00, 0x05, // entity offsets
    ];
    let mut file = vec![header.len() as u8];
    file.extend_from_slice(&header);
    file.extend_from_slice(&body);
    file
}

#[test]
fn parallel_decode_cuts_synthetic_cycle() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cycle.chaos");
    std::fs::write(&path, cyclic_file()).unwrap();

    let root = ParallelDecoder::new().decode(&path).unwrap();
    // Resolution walks 0 -> 1 -> 0 and cuts the second visit of an active
    // id, so the spine ends in a null slot at bounded depth.
    let level1 = root.as_object().unwrap().get("a").unwrap();
    let level2 = level1.as_object().unwrap().get("a").unwrap();
    let level3 = level2.as_object().unwrap().get("a").unwrap();
    assert_eq!(level3, &Value::Null);
}

#[test]
fn serial_decode_cuts_synthetic_cycle() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cycle.chaos");
    std::fs::write(&path, cyclic_file()).unwrap();

    let root = Decoder::new().decode(&path).unwrap();
    // The serial walk holds entity 0 active from the start, so the cut
    // lands one level earlier than in the parallel resolver.
    let level1 = root.as_object().unwrap().get("a").unwrap();
    let level2 = level1.as_object().unwrap().get("a").unwrap();
    assert_eq!(level2, &Value::Null);
}

/// Entity 0 is a list referencing entity 1 twice: a diamond, not a cycle.
fn diamond_file() -> Vec<u8> {
    let body = [
        0x82, 0x01, 0x00, 0x01, 0x81, 0x81, // entity 0: [ref -> 1, ref -> 1]
        0x01, 0x01, 0x00, 0x00, 0xC5, // entity 1: {"a": 5}
    ];
    let header = [
        0x02, // entity count
        0x02, 0x01, b'a', // dictionary: ["a"], raw frame
        0x01, // entity offset width
        0x00, 0x06, // entity offsets
    ];
    let mut file = vec![header.len() as u8];
    file.extend_from_slice(&header);
    file.extend_from_slice(&body);
    file
}

#[test]
fn diamond_references_materialize_fully() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("diamond.chaos");
    std::fs::write(&path, diamond_file()).unwrap();

    let expected = list(vec![
        object(vec![("a", Value::Int(5))]),
        object(vec![("a", Value::Int(5))]),
    ]);
    assert_eq!(ParallelDecoder::new().decode(&path).unwrap(), expected);
    assert_eq!(decode(&path).unwrap(), expected);
}

#[test]
fn concurrent_decoders_share_a_file() {
    let doc = generated_doc(100);
    let dir = tempdir().unwrap();
    let path = dir.path().join("doc.chaos");
    Encoder::new().encode(&doc, &path).unwrap();

    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for _ in 0..4 {
            let path = &path;
            let doc = &doc;
            handles.push(scope.spawn(move || {
                assert_eq!(&decode(path).unwrap(), doc);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    });
}
