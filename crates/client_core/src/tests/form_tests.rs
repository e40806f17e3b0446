use super::*;
use serde_json::json;

fn login_form() -> FormSnapshot {
    FormSnapshot {
        action: "/login".into(),
        method: FormMethod::Post,
        opt_out: false,
        submitter: Some(FormField::new("commit", FieldKind::Submit, "sign-in")),
        fields: vec![
            FormField::new("user", FieldKind::Text, "ada"),
            FormField::new("password", FieldKind::Password, "hunter2"),
            FormField::new("remember", FieldKind::Checkbox, "yes").checked(),
            FormField::new("newsletter", FieldKind::Checkbox, "yes"),
            FormField::new("legacy", FieldKind::Text, "old").disabled(),
            FormField::new("", FieldKind::Text, "anonymous"),
            FormField::new("cancel", FieldKind::Button, "x"),
            FormField::new("avatar", FieldKind::File, "me.png"),
            FormField::new("note", FieldKind::Textarea, "hi"),
        ],
    }
}

#[test]
fn serialize_puts_submitter_first_and_skips_ineligible_fields() {
    let body = serialize(&login_form());
    let keys: Vec<&str> = body.keys().map(String::as_str).collect();
    assert_eq!(keys[0], "commit");
    assert_eq!(
        Value::Object(body),
        json!({
            "commit": "sign-in",
            "user": "ada",
            "password": "hunter2",
            "remember": "yes",
            "note": "hi"
        })
    );
}

#[test]
fn serialize_collects_repeated_names_and_multi_selects() {
    let form = FormSnapshot {
        fields: vec![
            FormField::new("tag", FieldKind::Checkbox, "a").checked(),
            FormField::new("tag", FieldKind::Checkbox, "b").checked(),
            FormField::new("tag", FieldKind::Checkbox, "c").checked(),
            FormField {
                name: "colors".into(),
                kind: FieldKind::SelectMultiple,
                values: vec!["red".into(), "blue".into()],
                checked: false,
                disabled: false,
            },
            FormField::new("size", FieldKind::Radio, "s"),
            FormField::new("size", FieldKind::Radio, "m").checked(),
        ],
        ..FormSnapshot::default()
    };

    assert_eq!(
        Value::Object(serialize(&form)),
        json!({"tag": ["a", "b", "c"], "colors": ["red", "blue"], "size": "m"})
    );
}

#[test]
fn submission_message_follows_form_method() {
    let message = submission_message(&login_form());
    assert!(matches!(message, ChannelMessage::Post { .. }));
    let encoded = serde_json::to_value(&message).expect("encode");
    assert_eq!(encoded["type"], "post");
    assert_eq!(encoded["body"]["user"], "ada");

    let get = submission_message(&FormSnapshot::default());
    assert_eq!(get.kind(), "get");
}

#[test]
fn amend_action_appends_the_pagelet_parameter() {
    assert_eq!(amend_action("/search", "_pagelet", "results"), "/search?_pagelet=results");
    assert_eq!(
        amend_action("/search?q=rust", "_pagelet", "results"),
        "/search?q=rust&_pagelet=results"
    );
    assert_eq!(
        amend_action("/search?q=rust#top", "_pagelet", "a b"),
        "/search?q=rust&_pagelet=a+b#top"
    );
    assert_eq!(amend_action("", "_pagelet", "x"), "?_pagelet=x");
}

#[test]
fn form_method_parse_is_case_insensitive() {
    assert_eq!(FormMethod::parse("POST"), FormMethod::Post);
    assert_eq!(FormMethod::parse("dialog"), FormMethod::Get);
}
