//! Edge cases integration tests for the replica store.
//!
//! These tests verify robustness under boundary positions, malformed input,
//! out-of-order delivery and large documents.

use peer_sync::codec::{decode_update, encode_update};
use peer_sync::crdt::OpKind;
use peer_sync::{LocalEdit, OpId, Operation, Replica, ReplicaError, StateVector, Update};

fn op(counter: u64, replica: u64, prev: u64, kind: OpKind) -> Operation {
    Operation {
        id: OpId::new(counter, replica),
        prev,
        kind,
    }
}

fn insert(counter: u64, replica: u64, prev: u64, after: OpId, content: char) -> Operation {
    op(counter, replica, prev, OpKind::Insert { after, content })
}

fn single(operation: Operation) -> Update {
    Update::new(StateVector::new(), vec![operation])
}

fn reason(result: Result<Update, ReplicaError>) -> &'static str {
    match result {
        Err(ReplicaError::MalformedOperation { reason, .. }) => reason,
        Ok(update) => panic!("accepted malformed update: {update:?}"),
    }
}

#[test]
fn test_positions_are_clamped() {
    let mut replica = Replica::new(1);
    replica.apply_local(LocalEdit::insert(100, "end"));
    replica.apply_local(LocalEdit::insert(0, ">"));
    assert_eq!(replica.to_string(), ">end");

    // Nothing to delete or format past the end
    assert!(replica.apply_local(LocalEdit::delete(10, 5)).is_empty());
    assert!(replica.apply_local(LocalEdit::format(4, 1, "bold", "true")).is_empty());
    assert!(replica.apply_local(LocalEdit::insert(0, "")).is_empty());

    let update = replica.apply_local(LocalEdit::delete(2, 100));
    assert_eq!(update.len(), 2);
    assert_eq!(replica.to_string(), ">e");
}

#[test]
fn test_reserved_identifiers_are_rejected() {
    let mut replica = Replica::new(1);
    assert_eq!(
        reason(replica.apply_remote(&single(insert(0, 2, 0, OpId::ROOT, 'a')))),
        "reserved identifier"
    );
    assert_eq!(
        reason(replica.apply_remote(&single(insert(1, 0, 0, OpId::ROOT, 'a')))),
        "reserved identifier"
    );
}

#[test]
fn test_structural_violations_are_rejected() {
    let mut replica = Replica::new(1);
    replica.apply_remote(&single(insert(1, 2, 0, OpId::ROOT, 'a'))).unwrap();
    replica.apply_remote(&single(op(2, 2, 1, OpKind::Delete { target: OpId::new(1, 2) }))).unwrap();

    assert_eq!(
        reason(replica.apply_remote(&single(insert(3, 3, 3, OpId::ROOT, 'x')))),
        "previous operation is not earlier"
    );
    assert_eq!(
        reason(replica.apply_remote(&single(op(5, 3, 0, OpKind::Delete { target: OpId::ROOT })))),
        "cannot target the root"
    );
    assert_eq!(
        reason(replica.apply_remote(&single(insert(4, 3, 0, OpId::new(9, 2), 'x')))),
        "reference is not causally earlier"
    );
    assert_eq!(
        reason(replica.apply_remote(&single(insert(5, 3, 0, OpId::new(2, 2), 'x')))),
        "reference is not an insert"
    );
}

#[test]
fn test_malformed_update_is_rejected_atomically() {
    let mut replica = Replica::new(1);
    replica.apply_local(LocalEdit::insert(0, "ok"));
    let before = replica.snapshot();
    let operations_before = replica.operation_count();

    let update = Update::new(
        StateVector::new(),
        vec![
            insert(10, 2, 0, OpId::ROOT, 'g'),
            insert(11, 2, 10, OpId::new(10, 2), 'o'),
            op(12, 2, 11, OpKind::Delete { target: OpId::ROOT }),
        ],
    );
    assert!(replica.apply_remote(&update).is_err());

    assert_eq!(replica.snapshot(), before);
    assert_eq!(replica.operation_count(), operations_before);
    assert_eq!(replica.pending_len(), 0);
}

#[test]
fn test_delete_before_insert_is_buffered() {
    let mut author = Replica::new(2);
    let insert = author.apply_local(LocalEdit::insert(0, "x"));
    let delete = author.apply_local(LocalEdit::delete(0, 1));

    let mut replica = Replica::new(1);
    let applied = replica.apply_remote(&delete).unwrap();
    assert!(applied.is_empty());
    assert_eq!(replica.pending_len(), 1);
    assert_eq!(replica.to_string(), "");

    let applied = replica.apply_remote(&insert).unwrap();
    assert_eq!(applied.len(), 2);
    assert_eq!(replica.pending_len(), 0);
    assert_eq!(replica.to_string(), "");
    assert_eq!(replica.total_node_count(), 1);
}

#[test]
fn test_format_before_insert_is_buffered() {
    let mut author = Replica::new(2);
    let insert = author.apply_local(LocalEdit::insert(0, "ab"));
    let format = author.apply_local(LocalEdit::format(0, 2, "italic", "true"));

    let mut replica = Replica::new(1);
    replica.apply_remote(&format).unwrap();
    assert_eq!(replica.pending_len(), 2);
    replica.apply_remote(&insert).unwrap();

    let snapshot = replica.snapshot();
    assert_eq!(snapshot.spans.len(), 1);
    assert_eq!(snapshot.spans[0].text, "ab");
    assert_eq!(snapshot.spans[0].attributes.get("italic").map(String::as_str), Some("true"));
}

#[test]
fn test_concurrent_deletes_of_same_character() {
    let mut a = Replica::new(1);
    a.apply_local(LocalEdit::insert(0, "abc"));
    let mut b = a.fork(2);

    let da = a.apply_local(LocalEdit::delete(1, 1));
    let db = b.apply_local(LocalEdit::delete(1, 1));
    a.apply_remote(&db).unwrap();
    b.apply_remote(&da).unwrap();

    assert_eq!(a.to_string(), "ac");
    assert_eq!(b.to_string(), "ac");
}

#[test]
fn test_format_and_unformat_last_writer_wins() {
    let mut a = Replica::new(1);
    a.apply_local(LocalEdit::insert(0, "word"));
    let mut b = a.fork(2);

    let fa = a.apply_local(LocalEdit::format(0, 4, "bold", "true"));
    let fb = b.apply_local(LocalEdit::unformat(0, 2, "bold"));
    a.apply_remote(&fb).unwrap();
    b.apply_remote(&fa).unwrap();

    // Same counters, replica 2 wins on the first two characters
    assert_eq!(a.snapshot(), b.snapshot());
    let spans = a.snapshot().spans;
    assert_eq!(spans.len(), 2);
    assert_eq!(spans[0].text, "wo");
    assert!(spans[0].attributes.is_empty());
    assert_eq!(spans[1].text, "rd");
}

#[test]
fn test_unicode_characters() {
    let mut a = Replica::new(1);
    a.apply_local(LocalEdit::insert(0, "héllo 🦀 世界"));
    assert_eq!(a.len(), 10);

    a.apply_local(LocalEdit::delete(6, 1));
    assert_eq!(a.to_string(), "héllo  世界");

    let mut b = Replica::new(2);
    let bytes = encode_update(&a.diff_since(&StateVector::new())).unwrap();
    b.apply_remote(&decode_update(&bytes).unwrap()).unwrap();
    assert_eq!(b.to_string(), a.to_string());
}

#[test]
fn test_large_document_operations() {
    let mut replica = Replica::new(1);
    let large_size = 10_000usize;
    let text: String = (0..large_size)
        .map(|i| char::from(b'A' + (i % 26) as u8))
        .collect();
    replica.apply_local(LocalEdit::insert(0, text));
    assert_eq!(replica.len(), large_size);

    // Delete every other character
    for i in 0..large_size / 2 {
        replica.apply_local(LocalEdit::delete(i, 1));
    }
    assert_eq!(replica.len(), large_size / 2);
    assert_eq!(replica.total_node_count(), large_size);

    let mut copy = Replica::new(2);
    copy.apply_remote(&replica.diff_since(&StateVector::new())).unwrap();
    assert_eq!(copy.to_string(), replica.to_string());
}

#[test]
fn test_bulk_merge_of_long_history() {
    let mut writer = Replica::new(1);
    let size = 100_000usize;
    let text: String = (0..size).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    writer.apply_local(LocalEdit::insert(0, text));
    writer.apply_local(LocalEdit::insert(size / 2, "|"));
    writer.apply_local(LocalEdit::delete(0, 10));

    let mut reader = Replica::new(2);
    reader.apply_remote(&writer.diff_since(&StateVector::new())).unwrap();
    assert_eq!(reader.len(), size - 9);
    assert_eq!(reader.to_string(), writer.to_string());
    assert_eq!(reader.state_vector(), writer.state_vector());
}

#[test]
fn test_garbage_update_bytes_are_rejected() {
    assert!(decode_update(&[]).is_err());
    assert!(decode_update(&[0x80, 0x80, 0x80]).is_err());

    let mut replica = Replica::new(1);
    replica.apply_local(LocalEdit::insert(0, "x"));
    let mut bytes = encode_update(&replica.diff_since(&StateVector::new())).unwrap();
    bytes.truncate(bytes.len() - 1);
    assert!(decode_update(&bytes).is_err());
}
