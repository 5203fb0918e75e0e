//! End-to-end tests of the PBF pipeline against in-memory streams, plus the
//! equivalence of the PBF and OPL decoding paths.

use std::io::Write;
use std::sync::mpsc::sync_channel;
use std::thread;

use byteorder::{NetworkEndian, WriteBytesExt};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use prost::Message;

use osmstream::pbf::proto;
use osmstream::{Entity, EntityFilter, Error, OplReader, PbfReader};

/// Frames a blob: 4-byte length, BlobHeader, Blob.
fn frame_blob(blob_type: &str, payload: &[u8], compress: bool) -> Vec<u8> {
    let blob = if compress {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        proto::Blob {
            raw: None,
            raw_size: Some(payload.len() as i32),
            zlib_data: Some(encoder.finish().unwrap()),
        }
    } else {
        proto::Blob {
            raw: Some(payload.to_vec()),
            raw_size: Some(payload.len() as i32),
            zlib_data: None,
        }
    };
    let blob_bytes = blob.encode_to_vec();

    let blob_header = proto::BlobHeader {
        r#type: blob_type.to_string(),
        indexdata: None,
        datasize: blob_bytes.len() as i32,
    };
    let header_bytes = blob_header.encode_to_vec();

    let mut out = Vec::new();
    out.write_u32::<NetworkEndian>(header_bytes.len() as u32)
        .unwrap();
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&blob_bytes);
    out
}

fn header_blob() -> Vec<u8> {
    let block = proto::HeaderBlock {
        required_features: vec!["OsmSchema-V0.6".into(), "DenseNodes".into()],
        writingprogram: Some("osmstream-test".into()),
        ..Default::default()
    };
    frame_blob("OSMHeader", &block.encode_to_vec(), false)
}

fn string_table(strings: &[&str]) -> proto::StringTable {
    proto::StringTable {
        s: strings.iter().map(|s| s.as_bytes().to_vec()).collect(),
    }
}

/// One dense-nodes block: ids with locations `(id * 1e6, id * 2e6)` in
/// location units and one `k=v` tag per node.
fn dense_node_block(ids: &[i64]) -> proto::PrimitiveBlock {
    let mut dense = proto::DenseNodes::default();
    let mut prev = (0i64, 0i64, 0i64);
    let mut keys_vals = Vec::new();
    for &id in ids {
        // granularity 100 makes raw units equal location units
        let lat = id * 2_000_000;
        let lon = id * 1_000_000;
        dense.id.push(id - prev.0);
        dense.lat.push(lat - prev.1);
        dense.lon.push(lon - prev.2);
        prev = (id, lat, lon);
        keys_vals.extend_from_slice(&[1, 2, 0]);
    }
    dense.keys_vals = keys_vals;

    proto::PrimitiveBlock {
        stringtable: string_table(&["", "k", "v"]),
        primitivegroup: vec![proto::PrimitiveGroup {
            dense: Some(dense),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Streams `data` into a reader in small chunks from a producer thread.
fn feed(data: Vec<u8>, chunk_size: usize) -> PbfReader {
    let (tx, rx) = sync_channel(4);
    thread::spawn(move || {
        for chunk in data.chunks(chunk_size) {
            if tx.send(chunk.to_vec()).is_err() {
                return;
            }
        }
    });
    PbfReader::new(rx)
}

fn node_ids(buffer: &osmstream::EntityBuffer) -> Vec<i64> {
    buffer
        .iter()
        .map(|e| match e {
            Entity::Node(n) => n.id,
            other => panic!("expected node, got {other:?}"),
        })
        .collect()
}

#[test]
fn reads_header_then_buffers_in_stream_order() {
    let mut stream = header_blob();
    stream.extend(frame_blob(
        "OSMData",
        &dense_node_block(&[1, 2, 3]).encode_to_vec(),
        true,
    ));
    stream.extend(frame_blob(
        "OSMData",
        &dense_node_block(&[10, 11]).encode_to_vec(),
        false,
    ));
    stream.extend(frame_blob(
        "OSMData",
        &dense_node_block(&[20]).encode_to_vec(),
        true,
    ));

    let mut reader = feed(stream, 7);

    let header = reader.header().unwrap();
    assert_eq!(header.writing_program, "osmstream-test");
    assert_eq!(
        header.required_features,
        vec!["OsmSchema-V0.6", "DenseNodes"]
    );

    let mut all_ids = Vec::new();
    loop {
        let buffer = reader.read().unwrap();
        if buffer.is_empty() {
            break;
        }
        all_ids.extend(node_ids(&buffer));
    }
    assert_eq!(all_ids, vec![1, 2, 3, 10, 11, 20]);

    // past the end the reader keeps signalling EOF
    assert!(reader.read().unwrap().is_empty());
    reader.close();
}

#[test]
fn decoded_nodes_carry_locations_and_tags() {
    let mut stream = header_blob();
    stream.extend(frame_blob(
        "OSMData",
        &dense_node_block(&[5]).encode_to_vec(),
        true,
    ));

    let mut reader = feed(stream, 64);
    let buffer = reader.read().unwrap();
    let Some(Entity::Node(node)) = buffer.iter().next() else {
        panic!("expected a node");
    };
    assert_eq!(node.id, 5);
    assert_eq!(node.location.x(), 5_000_000);
    assert_eq!(node.location.y(), 10_000_000);
    assert_eq!(node.tags, vec![("k".to_string(), "v".to_string())]);
}

#[test]
fn truncated_blob_is_reported_on_read() {
    let mut stream = header_blob();
    // announce a 1000-byte blob but deliver only a fragment
    let block = dense_node_block(&[1]).encode_to_vec();
    let blob_header = proto::BlobHeader {
        r#type: "OSMData".into(),
        indexdata: None,
        datasize: 1000,
    };
    let header_bytes = blob_header.encode_to_vec();
    stream
        .write_u32::<NetworkEndian>(header_bytes.len() as u32)
        .unwrap();
    stream.extend_from_slice(&header_bytes);
    stream.extend_from_slice(&block[..block.len().min(10)]);

    let mut reader = feed(stream, 16);
    let err = reader.read().unwrap_err();
    assert!(
        err.to_string().contains("truncated data"),
        "unexpected error: {err}"
    );

    // the stream is dead now; the error repeats
    let err = reader.read().unwrap_err();
    assert!(err.to_string().contains("truncated data"));
}

#[test]
fn first_blob_must_be_a_header() {
    let stream = frame_blob(
        "OSMData",
        &dense_node_block(&[1]).encode_to_vec(),
        false,
    );
    let mut reader = feed(stream, 32);
    let err = reader.read().unwrap_err();
    assert!(
        err.to_string().contains("does not have expected type"),
        "unexpected error: {err}"
    );
    // the header call reports the failure as well
    assert!(reader.header().is_err());
}

#[test]
fn oversized_blob_header_is_rejected() {
    let mut stream = Vec::new();
    stream.write_u32::<NetworkEndian>(1 << 20).unwrap();
    stream.extend_from_slice(&[0u8; 64]);

    let mut reader = feed(stream, 32);
    let err = reader.read().unwrap_err();
    assert!(
        err.to_string().contains("invalid BlobHeader size"),
        "unexpected error: {err}"
    );
}

#[test]
fn empty_input_yields_default_header_and_eof() {
    let (tx, rx) = sync_channel::<Vec<u8>>(1);
    drop(tx);
    let mut reader = PbfReader::new(rx);
    let header = reader.header().unwrap();
    assert!(header.writing_program.is_empty());
    assert!(reader.read().unwrap().is_empty());
}

#[test]
fn filter_limits_decoded_entity_kinds() {
    let way_block = proto::PrimitiveBlock {
        stringtable: string_table(&[""]),
        primitivegroup: vec![proto::PrimitiveGroup {
            ways: vec![proto::Way {
                id: 7,
                keys: vec![],
                vals: vec![],
                info: None,
                refs: vec![1, 1, 1],
            }],
            ..Default::default()
        }],
        ..Default::default()
    };

    let mut stream = header_blob();
    stream.extend(frame_blob(
        "OSMData",
        &dense_node_block(&[1, 2]).encode_to_vec(),
        false,
    ));
    stream.extend(frame_blob("OSMData", &way_block.encode_to_vec(), false));

    let (tx, rx) = sync_channel(4);
    let data = stream;
    thread::spawn(move || {
        for chunk in data.chunks(32) {
            if tx.send(chunk.to_vec()).is_err() {
                return;
            }
        }
    });
    let mut reader = PbfReader::with_filter(rx, EntityFilter::WAYS);

    let mut kinds = Vec::new();
    loop {
        let buffer = reader.read().unwrap();
        if buffer.is_empty() {
            break;
        }
        kinds.extend(buffer.iter().map(|e| e.item_type().as_char()));
    }
    assert_eq!(kinds, vec!['w']);
}

/// The same logical data decoded from OPL text and from a PBF stream must
/// produce identical entity sequences.
#[test]
fn opl_and_pbf_streams_decode_to_equal_entities() {
    let opl = "\
n1 v1 dV c100 t2016-01-01T00:00:00Z i7 ualice Thighway=primary x0.1 y0.2\n\
n2 v2 dV c100 t2016-01-01T00:00:10Z i7 ualice x0.2 y0.4\n\
w10 v1 dV c101 t2016-01-01T00:01:00Z i8 ubob Tname=main Nn1,n2\n\
r20 v1 dV c102 t2016-01-01T00:02:00Z i8 ubob Ttype=multipolygon Mw10@outer,n1@\n";
    let mut opl_entities = Vec::new();
    let mut opl_reader = OplReader::new(opl.as_bytes());
    loop {
        let buffer = opl_reader.read().unwrap();
        if buffer.is_empty() {
            break;
        }
        opl_entities.extend(buffer.iter().cloned());
    }

    let strings = &[
        "", "highway", "primary", "alice", "name", "main", "bob", "type", "multipolygon", "outer",
    ];
    let node_block = proto::PrimitiveBlock {
        stringtable: string_table(strings),
        primitivegroup: vec![proto::PrimitiveGroup {
            dense: Some(proto::DenseNodes {
                id: vec![1, 1],
                lat: vec![2_000_000, 2_000_000],
                lon: vec![1_000_000, 1_000_000],
                keys_vals: vec![1, 2, 0, 0],
                denseinfo: Some(proto::DenseInfo {
                    version: vec![1, 2],
                    timestamp: vec![1_451_606_400, 10],
                    changeset: vec![100, 0],
                    uid: vec![7, 0],
                    user_sid: vec![3, 0],
                    visible: vec![true, true],
                }),
            }),
            ..Default::default()
        }],
        ..Default::default()
    };
    let way_block = proto::PrimitiveBlock {
        stringtable: string_table(strings),
        primitivegroup: vec![proto::PrimitiveGroup {
            ways: vec![proto::Way {
                id: 10,
                keys: vec![4],
                vals: vec![5],
                info: Some(proto::Info {
                    version: Some(1),
                    timestamp: Some(1_451_606_460),
                    changeset: Some(101),
                    uid: Some(8),
                    user_sid: Some(6),
                    visible: Some(true),
                }),
                refs: vec![1, 1],
            }],
            ..Default::default()
        }],
        ..Default::default()
    };
    let relation_block = proto::PrimitiveBlock {
        stringtable: string_table(strings),
        primitivegroup: vec![proto::PrimitiveGroup {
            relations: vec![proto::Relation {
                id: 20,
                keys: vec![7],
                vals: vec![8],
                info: Some(proto::Info {
                    version: Some(1),
                    timestamp: Some(1_451_606_520),
                    changeset: Some(102),
                    uid: Some(8),
                    user_sid: Some(6),
                    visible: Some(true),
                }),
                roles_sid: vec![9, 0],
                memids: vec![10, -9],
                types: vec![
                    proto::relation::MemberType::Way as i32,
                    proto::relation::MemberType::Node as i32,
                ],
            }],
            ..Default::default()
        }],
        ..Default::default()
    };

    let mut stream = header_blob();
    for block in [&node_block, &way_block, &relation_block] {
        stream.extend(frame_blob("OSMData", &block.encode_to_vec(), true));
    }

    let mut pbf_entities = Vec::new();
    let mut pbf_reader = feed(stream, 13);
    loop {
        let buffer = pbf_reader.read().unwrap();
        if buffer.is_empty() {
            break;
        }
        pbf_entities.extend(buffer.iter().cloned());
    }

    assert_eq!(opl_entities.len(), 4);
    assert_eq!(opl_entities, pbf_entities);
}

#[test]
fn close_is_safe_mid_stream() {
    let mut stream = header_blob();
    for batch in 0..50 {
        let ids: Vec<i64> = (batch * 10..batch * 10 + 10).collect();
        stream.extend(frame_blob(
            "OSMData",
            &dense_node_block(&ids).encode_to_vec(),
            true,
        ));
    }

    let mut reader = feed(stream, 128);
    let _ = reader.header().unwrap();
    let first = reader.read().unwrap();
    assert_eq!(node_ids(&first), (0..10).collect::<Vec<_>>());
    // drop the reader with most of the stream still undecoded
    drop(reader);
}

#[test]
fn short_streams_distinguish_clean_eof_from_truncation() {
    let stream = vec![0u8, 0, 0];
    let mut reader = feed(stream, 3);
    // truncated inside the very first length word is a clean EOF, which is
    // an empty stream with a default header
    assert!(reader.header().unwrap().writing_program.is_empty());
    assert!(reader.read().unwrap().is_empty());
    drop(reader);

    // a declared BlobHeader that never arrives is an error
    let mut stream = Vec::new();
    stream.write_u32::<NetworkEndian>(100).unwrap();
    stream.extend_from_slice(&[1u8; 5]);
    let mut reader = feed(stream, 5);
    let err = reader.read().unwrap_err();
    assert!(matches!(err, Error::Pbf(_)));
}
