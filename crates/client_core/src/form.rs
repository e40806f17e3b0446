//! Form submissions under a pagelet's placeholders.
//!
//! The host captures the submit event and hands over a snapshot of the form.
//! Streaming pagelets get the serialized fields over their sub-channel; all
//! others continue with the native submission, tagged with the pagelet name.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::protocol::ChannelMessage;
use url::form_urlencoded;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormMethod {
    #[default]
    Get,
    Post,
}

impl FormMethod {
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("post") {
            Self::Post
        } else {
            Self::Get
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    Hidden,
    Password,
    Checkbox,
    Radio,
    File,
    Submit,
    Button,
    Reset,
    Image,
    Select,
    SelectMultiple,
    Textarea,
    Keygen,
}

impl FieldKind {
    fn is_button(self) -> bool {
        matches!(self, Self::Submit | Self::Button | Self::Reset | Self::Image)
    }

    fn is_checkable(self) -> bool {
        matches!(self, Self::Checkbox | Self::Radio)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FormField {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: FieldKind,
    /// One entry for plain fields, every selected option for selects.
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub disabled: bool,
}

impl FormField {
    pub fn new(name: impl Into<String>, kind: FieldKind, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            values: vec![value.into()],
            checked: false,
            disabled: false,
        }
    }

    pub fn checked(mut self) -> Self {
        self.checked = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

/// State of a form at the moment it was submitted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FormSnapshot {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub method: FormMethod,
    /// The form asked to bypass streaming.
    #[serde(default)]
    pub opt_out: bool,
    /// Last focused submit-capable element.
    #[serde(default)]
    pub submitter: Option<FormField>,
    #[serde(default)]
    pub fields: Vec<FormField>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Let the browser submit to `action`.
    Native { action: String },
    /// Native submission cancelled, fields written to the sub-channel.
    Streamed,
}

/// Field set in submission order: the submitter first, then every enabled,
/// named, non-button field. Unchecked boxes and radios are left out and
/// repeated names collect into an array.
pub fn serialize(form: &FormSnapshot) -> Map<String, Value> {
    let mut body = Map::new();

    if let Some(submitter) = &form.submitter {
        if !submitter.name.is_empty() {
            let value = submitter.values.first().cloned().unwrap_or_default();
            push_value(&mut body, &submitter.name, Value::String(value));
        }
    }

    for field in &form.fields {
        if field.disabled || field.name.is_empty() || field.kind.is_button() {
            continue;
        }
        if field.kind == FieldKind::File {
            continue;
        }
        if field.kind.is_checkable() && !field.checked {
            continue;
        }

        match field.kind {
            FieldKind::SelectMultiple => {
                let selected = field.values.iter().cloned().map(Value::String).collect();
                push_value(&mut body, &field.name, Value::Array(selected));
            }
            FieldKind::Checkbox | FieldKind::Radio if field.values.is_empty() => {
                push_value(&mut body, &field.name, Value::String("on".to_string()));
            }
            _ => {
                let value = field.values.first().cloned().unwrap_or_default();
                push_value(&mut body, &field.name, Value::String(value));
            }
        }
    }

    body
}

fn push_value(body: &mut Map<String, Value>, name: &str, value: Value) {
    match body.get_mut(name) {
        Some(Value::Array(existing)) => existing.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            body.insert(name.to_string(), value);
        }
    }
}

/// Sub-channel message carrying a streamed submission.
pub fn submission_message(form: &FormSnapshot) -> ChannelMessage {
    let body = serialize(form);
    match form.method {
        FormMethod::Get => ChannelMessage::Get { body },
        FormMethod::Post => ChannelMessage::Post { body },
    }
}

/// Appends `param=<fragment>` to the query of `action`, keeping any
/// `#fragment` suffix in place.
pub fn amend_action(action: &str, param: &str, fragment: &str) -> String {
    let (base, hash) = match action.find('#') {
        Some(at) => action.split_at(at),
        None => (action, ""),
    };
    let pair = form_urlencoded::Serializer::new(String::new())
        .append_pair(param, fragment)
        .finish();
    let separator = if !base.contains('?') {
        "?"
    } else if base.ends_with('?') || base.ends_with('&') {
        ""
    } else {
        "&"
    };
    format!("{base}{separator}{pair}{hash}")
}

#[cfg(test)]
#[path = "tests/form_tests.rs"]
mod tests;
