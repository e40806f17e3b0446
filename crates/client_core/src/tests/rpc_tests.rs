use super::*;
use serde_json::json;
use std::sync::{Arc, Mutex};

#[test]
fn declare_skips_builtin_names_and_duplicates() {
    let mut table = RpcTable::default();
    table.declare(
        "editor",
        &["save".into(), "render".into(), "save".into(), "load".into()],
    );

    assert_eq!(table.methods(), ["save".to_string(), "load".to_string()]);
    assert!(table.exposes("save"));
    assert!(!table.exposes("render"));
}

#[test]
fn prepare_numbers_calls_per_table() {
    let mut table = RpcTable::default();
    let (first, message) = table.prepare("save", vec![json!(1)], Box::new(|_| {}));
    let (second, _) = table.prepare("load", vec![], Box::new(|_| {}));

    assert_eq!(first, "save#1");
    assert_eq!(second, "load#2");
    assert_eq!(
        serde_json::to_value(&message).expect("encode"),
        json!({"type": "rpc", "method": "save", "args": [1], "id": "save#1"})
    );
    assert_eq!(table.pending(), 2);
}

#[test]
fn fulfill_invokes_callback_once() {
    let mut table = RpcTable::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let (id, _) = table.prepare(
        "save",
        vec![],
        Box::new(move |args| sink.lock().expect("lock").extend(args)),
    );

    assert!(table.fulfill(&id, vec![json!("ok")]));
    assert!(!table.fulfill(&id, vec![json!("again")]));
    assert_eq!(*seen.lock().expect("lock"), vec![json!("ok")]);
}

#[test]
fn clear_drops_pending_callbacks_without_calling_them() {
    let mut table = RpcTable::default();
    let called = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&called);
    table.declare("editor", &["save".into()]);
    table.prepare(
        "save",
        vec![],
        Box::new(move |_| *flag.lock().expect("lock") = true),
    );

    table.clear();
    assert_eq!(table.pending(), 0);
    assert!(table.methods().is_empty());
    assert!(!*called.lock().expect("lock"));

    let (id, _) = table.prepare("save", vec![], Box::new(|_| {}));
    assert_eq!(id, "save#1");
}
