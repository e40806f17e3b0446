use super::*;
use crate::{
    memory::{MemoryAssets, MemoryDom, MemorySandbox, MemoryTransport},
    pagelet::PLACEHOLDER_ATTRIBUTE,
    services::TemplateStore,
};
use serde_json::json;
use shared::domain::PageId;
use std::sync::{Arc, Mutex};

struct Page {
    pipe: Pipe,
    dom: MemoryDom,
    assets: MemoryAssets,
    transport: MemoryTransport,
}

fn page(expected: usize) -> Page {
    page_with(PipeOptions::new("page-1", expected), MemoryAssets::new(), TemplateStore::new())
}

fn page_with(options: PipeOptions, assets: MemoryAssets, templates: TemplateStore) -> Page {
    let dom = MemoryDom::new();
    let transport = MemoryTransport::new();
    let services = Services::missing()
        .with_dom(dom.clone())
        .with_assets(assets.clone())
        .with_sandbox(MemorySandbox::new())
        .with_transport(transport.clone())
        .with_templates(templates);

    Page {
        pipe: Pipe::new(options, services),
        dom,
        assets,
        transport,
    }
}

fn arrival(id: &str, remaining: usize) -> ArrivalData {
    ArrivalData {
        id: FragmentId::from(id),
        remaining,
        ..ArrivalData::default()
    }
}

fn child_of(parent: &str, id: &str, remaining: usize) -> ArrivalData {
    ArrivalData {
        parent: Some(parent.into()),
        ..arrival(id, remaining)
    }
}

fn count(pipe: &mut Pipe, topic: &str) -> Arc<Mutex<usize>> {
    let hits = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&hits);
    pipe.on(topic, move |_| *sink.lock().expect("lock") += 1);
    hits
}

fn hits(counter: &Arc<Mutex<usize>>) -> usize {
    *counter.lock().expect("lock")
}

#[test]
fn progress_and_received_follow_remaining_count() {
    let mut page = page(2);
    let received = count(&mut page.pipe, "received");
    let progress = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&progress);
    page.pipe.on("progress", move |event: &Event| {
        sink.lock().expect("lock").push(event.args[0].clone());
    });

    page.pipe.arrive("header", arrival("h", 1));
    assert_eq!(page.pipe.progress(), 50);
    assert_eq!(page.pipe.ready_state(), ReadyState::Loading);
    assert_eq!(hits(&received), 0);

    page.pipe.arrive("body", arrival("b", 0));
    assert_eq!(page.pipe.progress(), 100);
    assert_eq!(hits(&received), 1);
    assert!(page.pipe.ready_state() >= ReadyState::Interactive);
    assert_eq!(*progress.lock().expect("lock"), vec![json!(50), json!(100)]);
}

#[test]
fn child_waits_for_parent_render_and_nests_its_placeholders() {
    let mut page = page(2);
    let shell = page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "shell")], "");
    let inner = page
        .dom
        .insert(Some(shell), &[(PLACEHOLDER_ATTRIBUTE, "child")], "");
    page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "child")], "");

    page.pipe.arrive("child", child_of("shell", "c", 1));
    assert!(!page.pipe.has("child"));

    page.pipe.arrive("shell", arrival("s", 0));
    let child = page.pipe.get("child", Some("shell")).expect("child created");
    assert_eq!(child.placeholders(), [inner]);
    assert_eq!(page.pipe.rendered(), ["shell".to_string(), "child".to_string()]);
    assert!(page.pipe.is_finished());
}

#[test]
fn child_of_rendered_parent_is_created_at_once() {
    let mut page = page(2);
    let shell = page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "shell")], "");
    let inner = page
        .dom
        .insert(Some(shell), &[(PLACEHOLDER_ATTRIBUTE, "child")], "");

    page.pipe.arrive("shell", arrival("s", 1));
    page.pipe.arrive("child", child_of("shell", "c", 0));

    assert_eq!(
        page.pipe.get("child", None).expect("child").placeholders(),
        [inner]
    );
}

#[test]
fn parent_rerender_relocates_children() {
    let mut page = page(2);
    let shell = page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "shell")], "");
    page.dom
        .insert(Some(shell), &[(PLACEHOLDER_ATTRIBUTE, "child")], "");
    page.pipe.arrive("shell", arrival("s", 1));
    page.pipe.arrive("child", child_of("shell", "c", 0));
    let child_renders = count(&mut page.pipe, "child:render");

    let replaced = page
        .dom
        .insert(Some(shell), &[(PLACEHOLDER_ATTRIBUTE, "child")], "");
    assert_eq!(
        page.pipe.render("shell", Content::from("<div>new</div>")),
        Ok(true)
    );

    assert_eq!(hits(&child_renders), 1);
    assert!(page
        .pipe
        .get("child", None)
        .expect("child")
        .placeholders()
        .contains(&replaced));
}

#[test]
fn asset_timeout_degrades_to_error_view_and_still_finishes() {
    let mut templates = TemplateStore::new();
    templates.register("error", |data: &Value| {
        Ok(format!(
            "<div class=\"error\">{}</div>",
            data["message"].as_str().unwrap_or_default()
        ))
    });
    let mut page = page_with(
        PipeOptions::new("page-1", 1),
        MemoryAssets::deferred(),
        templates,
    );
    let node = page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "ads")], "");
    let finished = count(&mut page.pipe, "finished");

    let mut data = arrival("a", 0);
    data.js = vec!["/ads.js".into()];
    page.pipe.arrive("ads", data);
    let (url, ticket) = page.assets.take_pending().remove(0);

    let timeout = AssetError::Timeout {
        url: url.clone(),
        after_ms: 25_000,
    };
    assert!(page.pipe.asset_settled(ticket, &url, Err(timeout)));

    let ads = page.pipe.get("ads", None).expect("ads");
    assert!(ads.is_initialized());
    assert_eq!(
        page.dom.html(node).as_deref(),
        Some("<div class=\"error\">asset /ads.js timed out after 25000ms</div>")
    );
    assert_eq!(hits(&finished), 1);
    assert_eq!(page.pipe.ready_state(), ReadyState::Complete);
}

#[test]
fn finished_fires_once_whatever_the_arrival_order() {
    for order in [["a", "b", "c"], ["c", "a", "b"], ["b", "c", "a"]] {
        let mut page = page(3);
        for name in ["a", "b", "c"] {
            page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, name)], "");
        }
        let finished = count(&mut page.pipe, "finished");

        for (index, name) in order.iter().enumerate() {
            let mut data = arrival(name, 2 - index);
            data.remove = *name == "b";
            page.pipe.arrive(name, data);
            if index < 2 {
                assert_eq!(hits(&finished), 0, "order {order:?}");
            }
        }

        assert_eq!(hits(&finished), 1, "order {order:?}");
        assert_eq!(page.pipe.allowed(), 2);
        assert_eq!(page.pipe.rendered().len(), 2);

        page.pipe.render("a", Content::from("again")).expect("render");
        assert_eq!(hits(&finished), 1, "order {order:?}");
    }
}

#[test]
fn removed_arrival_never_loads_renders_or_connects() {
    let mut page = page(1);
    page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "promo")], "");
    let created = count(&mut page.pipe, "create");

    let mut data = arrival("p", 0);
    data.remove = true;
    data.css = vec!["/promo.css".into()];
    page.pipe.arrive("promo", data);

    assert_eq!(page.pipe.allowed(), 0);
    assert!(page.assets.requested().is_empty());
    assert_eq!(page.dom.mounts(), 0);
    assert_eq!(page.transport.open_channels(), 0);
    assert!(!page.pipe.has("promo"));
    assert_eq!(page.pipe.pooled(), 1);
    assert_eq!(hits(&created), 0);
    assert_eq!(page.pipe.ready_state(), ReadyState::Complete);
}

#[test]
fn pooled_fragment_comes_back_clean() {
    let mut page = page(2);
    page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "editor")], "");
    let footer = page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "footer")], "");
    let mut data = arrival("e", 1);
    data.rpc = vec!["save".into()];
    page.pipe.arrive("editor", data);
    assert!(page.pipe.remove("editor"));
    assert_eq!(page.pipe.pooled(), 1);

    page.pipe.arrive("footer", arrival("f", 0));
    assert_eq!(page.pipe.pooled(), 0);

    let reused = page.pipe.get("footer", None).expect("footer");
    assert_eq!(reused.placeholders(), [footer]);
    assert!(reused.rpc_methods().is_empty());
    assert!(page.transport.is_open("footer"));
    assert!(!page.transport.is_open("editor"));
    assert_eq!(page.transport.open_channels(), 1);
}

#[test]
fn remove_twice_is_harmless_and_pool_stays_bounded() {
    let mut page = page_with(
        PipeOptions::new("page-1", 2).with_reuse_limit(1),
        MemoryAssets::new(),
        TemplateStore::new(),
    );
    let removed = count(&mut page.pipe, "remove");
    page.pipe.arrive("a", arrival("a", 1));
    page.pipe.arrive("b", arrival("b", 0));

    assert!(page.pipe.remove("a"));
    assert!(!page.pipe.remove("a"));
    assert!(page.pipe.remove("b"));

    assert_eq!(hits(&removed), 2);
    assert_eq!(page.pipe.pooled(), 1);
}

#[test]
fn broadcast_respects_each_fragment_reservation() {
    let mut page = page(1);
    page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "chat")], "");
    page.pipe.arrive("chat", arrival("c", 0));

    let log = Arc::new(Mutex::new(Vec::new()));
    for event in ["destroy", "theme"] {
        let sink = Arc::clone(&log);
        page.pipe
            .get_mut("chat", None)
            .expect("chat")
            .on(event, move |_| sink.lock().expect("lock").push(event));
    }

    assert_eq!(page.pipe.broadcast("destroy", vec![]), 0);
    assert_eq!(page.pipe.broadcast("chat:theme", vec![]), 0);
    assert_eq!(page.pipe.broadcast("theme", vec![json!("dark")]), 1);
    assert_eq!(*log.lock().expect("lock"), ["theme"]);

    page.pipe.remove("chat");
    assert_eq!(*log.lock().expect("lock"), ["theme", "destroy"]);
}

#[test]
fn namespaced_broadcast_reaches_fragments_unless_scope_is_registered() {
    let mut page = page(2);
    page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "chat")], "");
    page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "feed")], "");
    page.pipe.arrive("chat", arrival("c", 1));
    page.pipe.arrive("feed", arrival("f", 0));

    let log = Arc::new(Mutex::new(Vec::new()));
    for topic in ["theme:dark", "feed:refresh"] {
        let sink = Arc::clone(&log);
        page.pipe
            .get_mut("chat", None)
            .expect("chat")
            .on(topic, move |event: &Event| {
                sink.lock().expect("lock").push((topic, event.args.clone()));
            });
    }

    assert!(!page.pipe.reserved("theme:dark"));
    assert_eq!(page.pipe.broadcast("theme:dark", vec![json!(true)]), 2);
    assert!(page.pipe.reserved("feed:refresh"));
    assert_eq!(page.pipe.broadcast("feed:refresh", vec![]), 0);
    assert_eq!(
        *log.lock().expect("lock"),
        [("theme:dark", vec![json!(true)])]
    );
}

#[test]
fn page_reserves_fragment_names_and_control_events() {
    let mut page = page(1);
    page.pipe.arrive("chat", arrival("c", 0));

    assert!(page.pipe.reserved("chat:render"));
    assert!(page.pipe.reserved("chat"));
    assert!(page.pipe.reserved("progress"));
    assert!(page.pipe.reserved("configured"));
    assert!(!page.pipe.reserved("theme"));
    assert!(!page.pipe.reserved("other:theme"));
}

#[test]
fn get_with_parent_disambiguates_same_names() {
    let mut page = page(4);
    let left = page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "left")], "");
    let right = page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "right")], "");
    page.dom
        .insert(Some(left), &[(PLACEHOLDER_ATTRIBUTE, "menu")], "");
    let right_menu = page
        .dom
        .insert(Some(right), &[(PLACEHOLDER_ATTRIBUTE, "menu")], "");

    page.pipe.arrive("left", arrival("l", 3));
    page.pipe.arrive("right", arrival("r", 2));
    page.pipe.create("menu", child_of("left", "m1", 1), Some(&[left]));
    page.pipe.create("menu", child_of("right", "m2", 0), Some(&[right]));

    let menu = page.pipe.get("menu", Some("right")).expect("right menu");
    assert_eq!(menu.id().as_str(), "m2");
    assert_eq!(menu.placeholders(), [right_menu]);
    assert_eq!(page.pipe.get("menu", None).expect("first").id().as_str(), "m1");
    assert!(page.pipe.get("menu", Some("top")).is_none());
    assert_eq!(
        page.pipe.pagelet("right", "menu").expect("sibling").id().as_str(),
        "m2"
    );
}

#[test]
fn rpc_through_the_page_controller() {
    let mut page = page(1);
    let mut data = arrival("e", 0);
    data.rpc = vec!["save".into()];
    page.pipe.arrive("editor", data);

    let reply = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reply);
    let id = page
        .pipe
        .call(
            "editor",
            "save",
            vec![json!(42)],
            Box::new(move |args| sink.lock().expect("lock").extend(args)),
        )
        .expect("call");
    assert_eq!(id, "save#1");

    assert!(page
        .pipe
        .deliver("editor", &json!({"type": "rpc", "id": "save#1", "args": ["ok"]})));
    assert_eq!(*reply.lock().expect("lock"), vec![json!("ok")]);

    assert_eq!(
        page.pipe.call("missing", "save", vec![], Box::new(|_| {})),
        Err(PipeError::UnknownFragment("missing".into()))
    );
    assert!(!page.pipe.deliver("missing", &json!({"type": "redirect", "url": "/"})));
}

#[test]
fn ready_state_reaches_complete_after_every_initialization() {
    let mut page = page_with(
        PipeOptions::new("page-1", 2),
        MemoryAssets::deferred(),
        TemplateStore::new(),
    );
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    page.pipe.on("readystatechange", move |event: &Event| {
        sink.lock().expect("lock").push(event.args[0].clone());
    });

    let mut first = arrival("a", 1);
    first.css = vec!["/a.css".into()];
    page.pipe.arrive("a", first);
    page.pipe.arrive("b", arrival("b", 0));
    assert_eq!(page.pipe.ready_state(), ReadyState::Interactive);

    let (url, ticket) = page.assets.take_pending().remove(0);
    page.pipe.asset_settled(ticket, &url, Ok(()));
    assert_eq!(page.pipe.ready_state(), ReadyState::Complete);
    assert_eq!(
        *states.lock().expect("lock"),
        vec![json!("interactive"), json!("complete")]
    );
}

#[test]
fn stale_asset_completion_is_ignored() {
    let mut page = page_with(
        PipeOptions::new("page-1", 1),
        MemoryAssets::deferred(),
        TemplateStore::new(),
    );
    let mut data = arrival("f", 0);
    data.js = vec!["/feed.js".into()];
    page.pipe.arrive("feed", data);
    let (url, ticket) = page.assets.take_pending().remove(0);

    page.pipe.remove("feed");
    page.pipe.arrive("feed", arrival("f2", 0));

    assert!(!page.pipe.asset_settled(ticket, &url, Ok(())));
}

#[test]
fn reconnect_reannounces_page_and_fragments() {
    let mut page = page(2);
    page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "header")], "");
    page.pipe.arrive("header", arrival("h", 1));
    page.pipe.arrive("nav", child_of("header", "n", 0));

    page.pipe.connected().expect("connected");
    page.pipe.reconnected().expect("reconnected");

    let page_id = PageId::from("page-1");
    assert_eq!(
        page.transport.page_messages(),
        vec![
            PageMessage::Page {
                id: page_id.clone()
            },
            PageMessage::Page { id: page_id },
            PageMessage::Pagelet {
                name: "header".into(),
                id: FragmentId::from("h"),
                parent: None,
            },
            PageMessage::Pagelet {
                name: "nav".into(),
                id: FragmentId::from("n"),
                parent: Some("header".into()),
            },
        ]
    );

    page.transport.set_offline(true);
    assert_eq!(page.pipe.reconnected(), Err(TransportError::Unavailable));
}

#[test]
fn destroy_removes_everything_and_refuses_arrivals() {
    let mut page = page(3);
    let removed = count(&mut page.pipe, "remove");
    page.pipe.arrive("a", arrival("a", 2));
    page.pipe.arrive("b", arrival("b", 1));

    page.pipe.destroy();
    assert!(page.pipe.is_destroyed());
    assert_eq!(hits(&removed), 2);
    assert_eq!(page.pipe.fragments().count(), 0);
    assert_eq!(page.transport.open_channels(), 0);

    page.pipe.arrive("c", arrival("c", 0));
    assert!(!page.pipe.has("c"));
}

#[test]
fn operations_after_page_teardown_report_destroyed() {
    let mut page = page(1);
    page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "a")], "");
    page.pipe.arrive("a", arrival("a", 0));
    page.pipe.destroy();

    assert_eq!(
        page.pipe.submit("a", &FormSnapshot::default()),
        Err(PipeError::Destroyed)
    );
    assert_eq!(
        page.pipe.render("a", Content::from("<p>late</p>")),
        Err(PipeError::Destroyed)
    );
    assert_eq!(page.pipe.loading("a", false), Err(PipeError::Destroyed));
    assert_eq!(
        page.pipe
            .call("a", "save", Vec::new(), Box::new(|_| {}))
            .map(|_| ()),
        Err(PipeError::Destroyed)
    );
}

#[test]
fn document_root_is_marked_loading_until_every_pagelet_arrived() {
    let dom = MemoryDom::new();
    dom.set_root_classes(&["no-js", "theme-light"]);
    let mut pipe = Pipe::new(
        PipeOptions::new("page-1", 2),
        Services::missing().with_dom(dom.clone()),
    );
    assert_eq!(
        dom.root_classes(),
        ["theme-light".to_string(), ROOT_LOADING_CLASS.to_string()]
    );

    pipe.arrive("a", arrival("a", 1));
    assert!(dom.root_classes().iter().any(|c| c == ROOT_LOADING_CLASS));

    pipe.arrive("b", arrival("b", 0));
    assert_eq!(dom.root_classes(), ["theme-light".to_string()]);
}

#[test]
fn plugins_configure_the_page_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::clone(&seen);
    let second = Arc::clone(&seen);
    let plugins: Vec<Box<dyn Plugin>> = vec![
        Box::new(move |pipe: &mut Pipe, options: &PipeOptions| {
            first
                .lock()
                .expect("lock")
                .push(format!("first:{}", options.page_id));
            let sink = Arc::clone(&first);
            pipe.on("received", move |_| sink.lock().expect("lock").push("received".into()));
        }),
        Box::new(move |pipe: &mut Pipe, options: &PipeOptions| {
            second
                .lock()
                .expect("lock")
                .push(format!("second:{}:{}", options.expected_fragments, pipe.expected()));
        }),
    ];

    let mut pipe = Pipe::with_plugins(PipeOptions::new("page-9", 1), Services::missing(), plugins);
    assert_eq!(
        *seen.lock().expect("lock"),
        ["first:page-9".to_string(), "second:1:1".to_string()]
    );

    pipe.arrive("solo", arrival("s", 0));
    assert_eq!(seen.lock().expect("lock").last().map(String::as_str), Some("received"));
}

#[test]
fn submit_on_unknown_fragment_is_an_error() {
    let mut page = page(1);
    let result = page.pipe.submit("nowhere", &FormSnapshot::default());
    assert_eq!(result, Err(PipeError::UnknownFragment("nowhere".into())));
}

#[tokio::test]
async fn subscribers_receive_page_events() {
    let mut page = page(1);
    page.dom.insert(None, &[(PLACEHOLDER_ATTRIBUTE, "solo")], "");
    let mut rx = page.pipe.subscribe_events();

    page.pipe.arrive("solo", arrival("s", 0));

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            PipeEvent::Arrive {
                name: "solo".into()
            },
            PipeEvent::Create {
                name: "solo".into(),
                id: FragmentId::from("s"),
            },
            PipeEvent::Progress {
                percent: 100,
                remaining: 0,
            },
            PipeEvent::ReadyStateChanged(ReadyState::Interactive),
            PipeEvent::Received,
            PipeEvent::Finished,
            PipeEvent::ReadyStateChanged(ReadyState::Complete),
        ]
    );

    page.pipe.remove("solo");
    let event = rx.recv().await.expect("event");
    assert_eq!(
        event,
        PipeEvent::Remove {
            name: "solo".into()
        }
    );
}
