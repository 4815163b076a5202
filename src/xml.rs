//! Minimal XML-to-mapping decoder used by the `*xml*` content-type branch of
//! the request parser (component C). There is no "the" canonical XML↔JSON
//! mapping; this follows the same shape as the tag-as-key, `-attr`-prefixed
//! convention several Go webhook-style tools use: each element becomes a
//! mapping keyed by its tag name, attributes are stored under `-attr`, text
//! content under `#text` when it coexists with children, and repeated
//! sibling tags collapse into a sequence.

use crate::param::Value;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("xml parse error: {0}")]
    Parse(#[from] quick_xml::Error),
    #[error("xml encoding error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("empty document")]
    Empty,
}

struct Frame {
    tag: String,
    fields: BTreeMap<String, Value>,
    text: String,
}

impl Frame {
    fn new(tag: String) -> Self {
        Frame {
            tag,
            fields: BTreeMap::new(),
            text: String::new(),
        }
    }

    fn into_value(self) -> Value {
        let text = self.text.trim().to_string();
        if self.fields.is_empty() {
            return Value::Scalar(text);
        }
        let mut fields = self.fields;
        if !text.is_empty() {
            fields.insert("#text".to_string(), Value::Scalar(text));
        }
        Value::Mapping(fields)
    }
}

fn insert_child(parent: &mut BTreeMap<String, Value>, tag: String, value: Value) {
    match parent.remove(&tag) {
        None => {
            parent.insert(tag, value);
        }
        Some(Value::Sequence(mut items)) => {
            items.push(value);
            parent.insert(tag, Value::Sequence(items));
        }
        Some(existing) => {
            parent.insert(tag, Value::Sequence(vec![existing, value]));
        }
    }
}

pub fn decode(body: &[u8]) -> Result<Value, XmlError> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<Value> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(e) => {
                let tag = std::str::from_utf8(e.name().as_ref())?.to_string();
                let mut frame = Frame::new(tag);
                for attr in e.attributes().flatten() {
                    let key = format!("-{}", std::str::from_utf8(attr.key.as_ref())?);
                    let val = attr.unescape_value()?.into_owned();
                    frame.fields.insert(key, Value::Scalar(val));
                }
                stack.push(frame);
            }
            Event::Empty(e) => {
                let tag = std::str::from_utf8(e.name().as_ref())?.to_string();
                let mut fields = BTreeMap::new();
                for attr in e.attributes().flatten() {
                    let key = format!("-{}", std::str::from_utf8(attr.key.as_ref())?);
                    let val = attr.unescape_value()?.into_owned();
                    fields.insert(key, Value::Scalar(val));
                }
                let value = if fields.is_empty() {
                    Value::Scalar(String::new())
                } else {
                    Value::Mapping(fields)
                };
                attach(&mut stack, &mut root, tag, value);
            }
            Event::Text(t) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&t.unescape()?);
                }
            }
            Event::End(_) => {
                if let Some(frame) = stack.pop() {
                    let tag = frame.tag.clone();
                    let value = frame.into_value();
                    attach(&mut stack, &mut root, tag, value);
                }
            }
            _ => {}
        }
        buf.clear();
    }

    root.ok_or(XmlError::Empty)
}

fn attach(stack: &mut [Frame], root: &mut Option<Value>, tag: String, value: Value) {
    match stack.last_mut() {
        Some(parent) => insert_child(&mut parent.fields, tag, value),
        None => {
            let mut top = BTreeMap::new();
            top.insert(tag, value);
            *root = Some(Value::Mapping(top));
        }
    }
}
