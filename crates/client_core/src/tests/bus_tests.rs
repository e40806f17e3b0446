use super::*;
use serde_json::json;
use std::sync::{Arc, Mutex};

fn recorder() -> (Arc<Mutex<Vec<Event>>>, impl FnMut(&Event) + Send + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |event: &Event| {
        sink.lock().expect("lock").push(event.clone());
    })
}

#[test]
fn once_listeners_fire_a_single_time() {
    let mut bus = EventBus::new();
    let (seen, handler) = recorder();
    bus.once(Topic::direct("received"), handler);

    assert!(bus.emit(&Event::new(Topic::direct("received"), vec![])));
    assert!(!bus.emit(&Event::new(Topic::direct("received"), vec![])));
    assert_eq!(seen.lock().expect("lock").len(), 1);
    assert!(bus.is_empty());
}

#[test]
fn on_listeners_keep_firing_in_registration_order() {
    let mut bus = EventBus::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    for label in ["first", "second"] {
        let order = Arc::clone(&order);
        bus.on(Topic::scoped("header", "render"), move |_| {
            order.lock().expect("lock").push(label);
        });
    }

    bus.emit(&Event::new(Topic::scoped("header", "render"), vec![]));
    bus.emit(&Event::new(Topic::scoped("header", "render"), vec![]));

    assert_eq!(
        *order.lock().expect("lock"),
        vec!["first", "second", "first", "second"]
    );
}

#[test]
fn off_removes_only_the_given_listener() {
    let mut bus = EventBus::new();
    let (kept, keep) = recorder();
    let (dropped, drop_me) = recorder();
    bus.on(Topic::direct("progress"), keep);
    let id = bus.on(Topic::direct("progress"), drop_me);

    assert!(bus.off(id));
    assert!(!bus.off(id));
    bus.emit(&Event::new(Topic::direct("progress"), vec![json!(50)]));

    assert_eq!(kept.lock().expect("lock").len(), 1);
    assert!(dropped.lock().expect("lock").is_empty());
}

#[test]
fn topics_with_the_same_text_but_different_structure_do_not_collide() {
    let mut bus = EventBus::new();
    let (seen, handler) = recorder();
    bus.on(Topic::scoped("a:b", "render"), handler);

    bus.emit(&Event::new(Topic::nested("a", "b", "render"), vec![]));
    assert!(seen.lock().expect("lock").is_empty());

    assert_eq!(Topic::scoped("a:b", "render").to_string(), "a:b:render");
    assert_eq!(Topic::nested("a", "b", "render").to_string(), "a:b:render");
}

#[test]
fn parse_splits_colon_delimited_names() {
    assert_eq!(Topic::parse("finished"), Topic::direct("finished"));
    assert_eq!(Topic::parse("header:render"), Topic::scoped("header", "render"));
    assert_eq!(
        Topic::parse("shell:child:render"),
        Topic::nested("shell", "child", "render")
    );
    assert_eq!(Topic::parse("shell:child:render").scope(), Some("shell"));
}

#[test]
fn reserved_sets_cover_lifecycle_names() {
    for event in ["remove", "received", "finished", "progress", "create"] {
        assert!(is_page_event(event), "{event}");
    }
    for event in [
        "configured",
        "error",
        "loaded",
        "submit",
        "initialize",
        "render",
        "destroy",
    ] {
        assert!(is_fragment_event(event), "{event}");
    }
    assert!(!is_fragment_event("custom"));
}

#[test]
fn remove_all_listeners_empties_the_table() {
    let mut bus = EventBus::new();
    let (_, handler) = recorder();
    bus.on(Topic::direct("create"), handler);
    assert_eq!(bus.listener_count(&Topic::direct("create")), 1);

    bus.remove_all_listeners();
    assert!(bus.is_empty());
    assert_eq!(bus.listener_count(&Topic::direct("create")), 0);
}
