use super::*;
use serde_json::json;

#[test]
fn arrival_accepts_single_asset_strings_and_fills_defaults() {
    let data: ArrivalData = serde_json::from_value(json!({
        "id": "f-1",
        "css": "/a.css",
        "js": ["/a.js", "/b.js"],
        "mode": "svg",
        "hash": {"client": "abc"}
    }))
    .expect("arrival");

    assert_eq!(data.id.as_str(), "f-1");
    assert_eq!(data.css, ["/a.css".to_string()]);
    assert_eq!(data.js.len(), 2);
    assert_eq!(data.mode, RenderMode::Svg);
    assert_eq!(data.hash.client.as_deref(), Some("abc"));
    assert_eq!(data.hash.error, None);
    assert!(!data.remove);
    assert!(data.rpc.is_empty());
    assert_eq!(data.timeout, None);
}

#[test]
fn arrival_treats_null_assets_as_empty() {
    let data: ArrivalData =
        serde_json::from_value(json!({"id": "f-2", "css": null})).expect("arrival");
    assert!(data.css.is_empty());
}

#[test]
fn channel_messages_are_tagged_by_type() {
    let err: ChannelMessage = serde_json::from_value(json!({
        "type": "err",
        "message": "boom",
        "stack": "at line 1"
    }))
    .expect("err");
    assert_eq!(
        err,
        ChannelMessage::Err(RemoteError::new("boom").with_stack("at line 1"))
    );
    assert_eq!(err.kind(), "err");

    let reply: ChannelMessage =
        serde_json::from_value(json!({"type": "rpc", "id": "save#1", "args": ["ok"]}))
            .expect("rpc");
    assert_eq!(
        reply,
        ChannelMessage::Rpc {
            method: None,
            args: vec![json!("ok")],
            id: "save#1".into()
        }
    );

    assert!(serde_json::from_value::<ChannelMessage>(json!({"type": "telepathy"})).is_err());
}

#[test]
fn page_messages_skip_absent_parent() {
    let message = PageMessage::Pagelet {
        name: "nav".into(),
        id: FragmentId::from("n-1"),
        parent: None,
    };
    assert_eq!(
        serde_json::to_value(&message).expect("encode"),
        json!({"type": "pagelet", "name": "nav", "id": "n-1"})
    );
}
