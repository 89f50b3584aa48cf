//! End-to-end synchronization scenarios: collections feeding a broadcast
//! core or a replay hub, observed through recording sessions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use rivulet_core::binding::{Binding, BindingRegistry, FieldTable, Navigable, OwnerTree, WriteError};
use rivulet_core::broadcast::{BroadcastConfig, BroadcastCore};
use rivulet_core::collections::{ListChange, ListOp, TrackedList, TrackedMap, TrackedSet};
use rivulet_core::observable::Observable;
use rivulet_core::replay::{ReplayConfig, ReplayHub};
use rivulet_core::scheduler::ManualScheduler;
use rivulet_core::session::{SessionError, SessionId, SessionSink};
use rivulet_core::{Error, WriteOutcome};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Recorder {
    id: SessionId,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::generate(),
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn envelopes(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }
}

impl SessionSink for Recorder {
    fn id(&self) -> SessionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, text: &str) -> Result<(), SessionError> {
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    age: u8,
}

impl Navigable for Profile {
    fn members() -> &'static FieldTable<Self> {
        static TABLE: LazyLock<FieldTable<Profile>> = LazyLock::new(|| {
            FieldTable::<Profile>::new()
                .field("name", |p| &mut p.name)
                .field("age", |p| &mut p.age)
        });
        &TABLE
    }
}

/// Applies one envelope entry for `key` to a client-side list replica.
/// Returns `false` if a change had no valid base.
fn apply_list_entries(replica: &mut Vec<Value>, key: &str, envelope: &Value) -> bool {
    let mut valid = true;
    for entry in envelope["batch"].as_array().into_iter().flatten() {
        if entry["k"] != json!(key) {
            continue;
        }
        if entry.get("delta").is_none() {
            *replica = entry["v"].as_array().cloned().unwrap_or_default();
            continue;
        }
        for change in entry["changes"].as_array().into_iter().flatten() {
            let index = change["index"].as_u64().unwrap_or(0) as usize;
            match change["op"].as_str() {
                Some("ADD") if index <= replica.len() => replica.insert(index, change["item"].clone()),
                Some("REMOVE") if index < replica.len() => {
                    replica.remove(index);
                }
                Some("SET") if index < replica.len() => replica[index] = change["item"].clone(),
                Some("CLEAR") => replica.clear(),
                _ => valid = false,
            }
        }
    }
    valid
}

fn replay_list(session: &Recorder, key: &str) -> (Vec<Value>, bool) {
    let mut replica = Vec::new();
    let mut valid = true;
    for envelope in session.envelopes() {
        valid &= apply_list_entries(&mut replica, key, &envelope);
    }
    (replica, valid)
}

fn seqs(session: &Recorder) -> Vec<u64> {
    session
        .envelopes()
        .iter()
        .map(|e| e["seq"].as_u64().unwrap())
        .collect()
}

fn buffered_core(tree: &OwnerTree) -> (Arc<ManualScheduler>, BroadcastCore) {
    let sched = Arc::new(ManualScheduler::new());
    let core = BroadcastCore::builder(BindingRegistry::from_tree(tree).unwrap())
        .scheduler(sched.clone())
        .config(
            BroadcastConfig::builder()
                .flush_interval(Duration::from_millis(16))
                .build(),
        )
        .build();
    (sched, core)
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    Push(i32),
    Insert(usize, i32),
    Remove(usize),
    Set(usize, i32),
    RemoveIf(i32),
    Clear,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => any::<i32>().prop_map(Op::Push),
        2 => (0..8usize, any::<i32>()).prop_map(|(i, v)| Op::Insert(i, v)),
        2 => (0..8usize).prop_map(Op::Remove),
        2 => (0..8usize, any::<i32>()).prop_map(|(i, v)| Op::Set(i, v)),
        1 => (2..5i32).prop_map(Op::RemoveIf),
        1 => Just(Op::Clear),
    ]
}

proptest! {
    #[test]
    fn prop_list_records_replay_to_final_contents(ops in prop::collection::vec(op_strategy(), 0..60)) {
        let list = TrackedList::new();
        for op in ops {
            match op {
                Op::Push(v) => list.push(v),
                Op::Insert(i, v) => {
                    if i <= list.len() {
                        list.insert(i, v);
                    }
                }
                Op::Remove(i) => {
                    list.remove(i);
                }
                Op::Set(i, v) => {
                    list.set(i, v);
                }
                Op::RemoveIf(m) => {
                    list.remove_if(|v| v % m == 0);
                }
                Op::Clear => list.clear(),
            }
        }

        let mut replica = Vec::new();
        for change in list.drain_changes() {
            change.apply(&mut replica);
        }
        prop_assert_eq!(replica, list.to_vec());
    }
}

#[test]
fn test_remove_if_emits_one_remove_per_match_tail_to_head() {
    let list = TrackedList::from(vec![1, 2, 3, 4, 5, 6]);
    let removed = list.remove_if(|v| v % 2 == 0);
    assert_eq!(removed, 3);

    let changes = list.drain_changes();
    let indices: Vec<usize> = changes.iter().map(|c| c.index).collect();
    assert!(changes.iter().all(|c| c.op == ListOp::Remove));
    assert_eq!(indices, vec![5, 3, 1]);

    let mut replica = vec![1, 2, 3, 4, 5, 6];
    for change in &changes {
        assert!(change.apply(&mut replica));
    }
    assert_eq!(replica, vec![1, 3, 5]);
}

#[test]
fn test_clear_records_only_when_non_empty() {
    let list: TrackedList<u8> = TrackedList::new();
    let map: TrackedMap<String, u8> = TrackedMap::new();
    let set: TrackedSet<u8> = TrackedSet::new();
    list.clear();
    map.clear();
    set.clear();
    assert!(!list.is_dirty() && !map.is_dirty() && !set.is_dirty());

    list.push(1);
    map.put("a".into(), 1);
    set.insert(1);
    list.drain_changes();
    map.drain_changes();
    set.drain_changes();

    list.clear();
    map.clear();
    set.clear();
    assert_eq!(list.drain_changes(), vec![ListChange::clear()]);
    assert_eq!(map.drain_changes().len(), 1);
    assert_eq!(set.drain_changes().len(), 1);
}

#[test]
fn test_drain_then_mutate_never_loses_or_repeats() {
    let list = TrackedList::new();
    list.push("a");
    let first = list.drain_changes();
    list.push("b");
    let second = list.drain_changes();

    assert_eq!(first, vec![ListChange::add(0, "a")]);
    assert_eq!(second, vec![ListChange::add(1, "b")]);
    assert!(list.drain_changes().is_empty());
}

#[test]
fn test_inactive_guard_stores_without_notifying() {
    let value = Observable::new(0);
    let active = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&active);
    value.set_active_guard(move || flag.load(Ordering::SeqCst));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let _sub = value.on_change(move |v| log.lock().push(*v));

    value.set(5);
    assert_eq!(value.get(), 5);
    assert!(seen.lock().is_empty());

    active.store(true, Ordering::SeqCst);
    value.set(6);
    assert_eq!(*seen.lock(), vec![6]);
}

// ---------------------------------------------------------------------------
// Broadcast core
// ---------------------------------------------------------------------------

#[test]
fn test_list_mutations_within_window_flush_as_one_delta() {
    let list = TrackedList::new();
    let tree = OwnerTree::new("page").bind("L", Binding::tracked(Observable::new(list.clone())));
    let (sched, core) = buffered_core(&tree);
    let session = Recorder::new();
    core.on_open(session.clone(), None, 0).unwrap();

    list.push("a".to_string());
    sched.advance(Duration::from_millis(2));
    list.push("b".to_string());
    sched.advance(Duration::from_millis(2));
    list.remove(0);
    sched.advance(Duration::from_millis(12));

    let sent = session.envelopes();
    assert_eq!(sent.len(), 2);
    assert_eq!(
        sent[1]["batch"],
        json!([{
            "k": "L", "delta": true, "type": "list",
            "changes": [
                {"op": "ADD", "index": 0, "item": "a"},
                {"op": "ADD", "index": 1, "item": "b"},
                {"op": "REMOVE", "index": 0, "item": null}
            ]
        }])
    );
}

#[test]
fn test_snapshot_then_delta_flushes_value_at_flush_time() {
    let holder = Observable::new(TrackedList::<i32>::new());
    let tree = OwnerTree::new("page").bind("items", Binding::tracked(holder.clone()));
    let (sched, core) = buffered_core(&tree);
    let session = Recorder::new();
    core.on_open(session.clone(), None, 0).unwrap();

    let replacement = TrackedList::from(vec![1]);
    holder.set(replacement.clone());
    replacement.push(2);
    replacement.push(3);
    sched.run_pending();

    let sent = session.envelopes();
    assert_eq!(sent[1]["batch"], json!([{"k": "items", "v": [1, 2, 3]}]));
}

#[test]
fn test_echoed_deep_write_sends_nothing() {
    let form = Observable::new(Profile {
        name: "Ada".into(),
        age: 36,
    });
    let tree = OwnerTree::new("page").child(OwnerTree::new("form").bind("profile", Binding::structured(form.clone())));
    let core = BroadcastCore::builder(BindingRegistry::from_tree(&tree).unwrap())
        .config(BroadcastConfig::immediate())
        .build();
    let session = Recorder::new();
    core.on_open(session.clone(), None, 0).unwrap();

    let echo = core
        .on_message(session.id(), r#"{"k":"form.profile.name","v":"Ada"}"#)
        .unwrap();
    assert_eq!(echo, WriteOutcome::Unchanged);
    assert_eq!(session.sent.lock().len(), 1);

    let update = core
        .on_message(session.id(), r#"{"k":"form.profile.age","v":37}"#)
        .unwrap();
    assert_eq!(update, WriteOutcome::Updated);
    assert_eq!(form.get().age, 37);
    let sent = session.envelopes();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1]["batch"][0]["v"], json!({"name": "Ada", "age": 37}));
}

#[test]
fn test_deep_write_rejections_leave_state_untouched() {
    let form = Observable::new(Profile::default());
    let tree = OwnerTree::new("page").bind("profile", Binding::structured(form.clone()));
    let core = BroadcastCore::builder(BindingRegistry::from_tree(&tree).unwrap())
        .config(BroadcastConfig::immediate())
        .build();
    let id = SessionId::generate();

    let forbidden = core.on_message(id, r#"{"k":"profile.class","v":"x"}"#);
    assert!(matches!(forbidden, Err(Error::Write(WriteError::Forbidden(_)))));
    let mistyped = core.on_message(id, r#"{"k":"profile.age","v":"old"}"#);
    assert!(matches!(mistyped, Err(Error::Write(WriteError::Convert { .. }))));
    assert_eq!(form.get(), Profile::default());
    assert_eq!(form.version(), 0);
}

#[test]
fn test_reconnect_replays_from_hub() {
    let count = Observable::new(0);
    let tree = OwnerTree::new("page").bind("count", Binding::value(count.clone()));
    let hub = ReplayHub::new(BindingRegistry::from_tree(&tree).unwrap());
    let core = BroadcastCore::builder(BindingRegistry::from_tree(&tree).unwrap())
        .config(BroadcastConfig::immediate())
        .build();

    count.set(1);
    count.set(2);
    count.set(3);

    let resumed = Recorder::new();
    core.on_open(resumed.clone(), Some(&hub), 1).unwrap();
    let sent = resumed.envelopes();
    assert_eq!(sent[0]["seq"], json!(3));
    assert_eq!(
        sent[0]["batch"],
        json!([{"k": "count", "v": 2}, {"k": "count", "v": 3}])
    );

    let caught_up = Recorder::new();
    core.on_open(caught_up.clone(), Some(&hub), 3).unwrap();
    assert_eq!(caught_up.envelopes()[0]["batch"], json!([{"k": "count", "v": 3}]));
}

#[test]
fn test_queue_overflow_keeps_client_list_consistent() {
    let list = TrackedList::new();
    let tree = OwnerTree::new("page").bind("L", Binding::tracked(Observable::new(list.clone())));
    let sched = Arc::new(ManualScheduler::new());
    let core = BroadcastCore::builder(BindingRegistry::from_tree(&tree).unwrap())
        .scheduler(sched.clone())
        .config(BroadcastConfig::builder().max_queue_depth(2).build())
        .build();
    let session = Recorder::new();
    core.on_open(session.clone(), None, 0).unwrap();

    for item in ["a", "b", "c", "d", "e"] {
        list.push(item.to_string());
    }
    core.flush_now();
    list.remove(0);
    core.flush_now();

    let (replica, valid) = replay_list(&session, "L");
    assert!(valid);
    assert_eq!(replica, vec![json!("b"), json!("c"), json!("d"), json!("e")]);
    assert_eq!(core.metrics().events_dropped(), 3);
}

#[test]
fn test_changes_queued_around_open_reach_each_client_once() {
    let list = TrackedList::new();
    let tree = OwnerTree::new("page").bind("L", Binding::tracked(Observable::new(list.clone())));
    let (sched, core) = buffered_core(&tree);

    list.push("before".to_string());
    let first = Recorder::new();
    core.on_open(first.clone(), None, 0).unwrap();
    list.push("a".to_string());
    let second = Recorder::new();
    core.on_open(second.clone(), None, 0).unwrap();
    list.push("b".to_string());
    sched.run_pending();

    let expected: Vec<Value> = list.to_vec().into_iter().map(Value::from).collect();
    for session in [&first, &second] {
        let (replica, valid) = replay_list(session, "L");
        assert!(valid);
        assert_eq!(replica, expected);
        let seqs = seqs(session);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{seqs:?}");
    }
}

#[test]
fn test_hub_fed_stream_is_ordered_and_resumable() {
    let list = TrackedList::new();
    let tree = OwnerTree::new("page").bind("L", Binding::tracked(Observable::new(list.clone())));
    let hub = ReplayHub::new(BindingRegistry::from_tree(&tree).unwrap());
    let sched = Arc::new(ManualScheduler::new());
    let core = BroadcastCore::builder(BindingRegistry::from_tree(&tree).unwrap())
        .scheduler(sched.clone())
        .replay(hub.clone())
        .build();

    list.push("a".to_string());
    let session = Recorder::new();
    core.on_open(session.clone(), Some(&hub), 0).unwrap();
    list.push("b".to_string());
    sched.run_pending();
    list.push("c".to_string());
    list.remove(0);
    sched.run_pending();

    let seen = seqs(&session);
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
    assert_eq!(*seen.last().unwrap(), hub.current_sequence());

    // Reconnect from the last sequence seen and keep applying.
    core.on_close(session.id());
    list.push("d".to_string());
    let resumed = Recorder::new();
    core.on_open(resumed.clone(), Some(&hub), *seen.last().unwrap()).unwrap();
    list.set(0, "B".to_string());
    sched.run_pending();

    let (mut replica, mut valid) = replay_list(&session, "L");
    for envelope in resumed.envelopes() {
        valid &= apply_list_entries(&mut replica, "L", &envelope);
    }
    assert!(valid);
    let expected: Vec<Value> = list.to_vec().into_iter().map(Value::from).collect();
    assert_eq!(replica, expected);

    let resumed_seqs = seqs(&resumed);
    assert!(resumed_seqs[0] > *seen.last().unwrap());
    assert!(resumed_seqs.windows(2).all(|w| w[0] < w[1]), "{resumed_seqs:?}");
}

// ---------------------------------------------------------------------------
// Replay hub
// ---------------------------------------------------------------------------

#[test]
fn test_poll_contract() {
    let count = Observable::new(0);
    let tree = OwnerTree::new("page").bind("count", Binding::value(count.clone()));
    let hub = ReplayHub::builder(BindingRegistry::from_tree(&tree).unwrap())
        .config(ReplayConfig::with_capacity(100))
        .build();
    for n in 1..=250 {
        count.set(n);
    }

    let current = hub.poll(hub.current_sequence());
    assert!(current.is_empty());
    assert_eq!(current.seq, 250);

    let full = hub.poll(0);
    assert_eq!(full.seq, 250);
    assert_eq!(full.batch.len(), 1);

    let stale = hub.poll(3);
    assert_eq!(stale.seq, 250);
    assert_eq!(stale.batch.len(), 1);
    assert!(!stale.batch[0].is_delta());
}

#[test]
fn test_hub_sequences_are_total_under_concurrency() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 200;

    let cells: Vec<Observable<usize>> = (0..THREADS).map(|_| Observable::new(0)).collect();
    let tree = cells
        .iter()
        .enumerate()
        .fold(OwnerTree::new("page"), |tree, (i, cell)| {
            tree.bind(format!("c{i}"), Binding::value(cell.clone()))
        });
    let hub = ReplayHub::builder(BindingRegistry::from_tree(&tree).unwrap())
        .config(ReplayConfig::with_capacity(THREADS * PER_THREAD))
        .build();
    let session = Recorder::new();
    hub.subscribe(session.clone(), 0).unwrap();

    let started = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = cells
        .into_iter()
        .map(|cell| {
            let started = Arc::clone(&started);
            thread::spawn(move || {
                started.fetch_add(1, Ordering::SeqCst);
                while started.load(Ordering::SeqCst) < THREADS {
                    std::hint::spin_loop();
                }
                for n in 1..=PER_THREAD {
                    cell.set(n);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total = (THREADS * PER_THREAD) as u64;
    assert_eq!(hub.current_sequence(), total);

    let live: Vec<u64> = session.envelopes()[1..]
        .iter()
        .map(|e| e["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(live, (1..=total).collect::<Vec<_>>());

    let replayed = hub.poll(1);
    assert_eq!(replayed.batch.len() as u64, total - 1);
    assert_eq!(replayed.seq, total);
}
