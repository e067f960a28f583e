//! Atom markup feed parsing: entries are normalized into [`Record`]s, and
//! the link-following variant additionally extracts the `rel=next`
//! continuation link and infers field types from the first page.
use crate::model::{FieldValue, Record};
use crate::schema::{EntityType, FieldDef, FieldType};
use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::Value;

/// One parsed feed page.
#[derive(Debug, Clone)]
pub struct FeedPage {
    pub records: Vec<Record>,
    pub next_link: Option<String>,
    /// Schema synthesized from per-field `type` attributes; present only
    /// when inference was requested and the page had entries.
    pub inferred: Option<EntityType>,
}

/// Minimal element tree; namespace prefixes are dropped, matching is done
/// on local names only.
#[derive(Debug, Clone, Default)]
struct XmlElement {
    local: String,
    attrs: Vec<(String, String)>,
    text: Option<String>,
    children: Vec<XmlElement>,
}

impl XmlElement {
    fn attr(&self, local: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == local)
            .map(|(_, v)| v.as_str())
    }

    fn children_named<'a>(&'a self, local: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.local == local)
    }
}

fn parse_tree(xml: &str) -> Result<XmlElement> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event().context("malformed feed XML")? {
            Event::Start(e) => {
                stack.push(element_from_start(&e)?);
            }
            Event::Empty(e) => {
                let element = element_from_start(&e)?;
                attach(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                let element = stack.pop().context("unbalanced feed XML")?;
                attach(&mut stack, &mut root, element);
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    let text = t.unescape().context("malformed feed text")?;
                    top.text.get_or_insert_with(String::new).push_str(&text);
                }
            }
            Event::CData(t) => {
                if let Some(top) = stack.last_mut() {
                    let text = String::from_utf8_lossy(&t).into_owned();
                    top.text.get_or_insert_with(String::new).push_str(&text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    root.context("feed XML has no root element")
}

fn element_from_start(e: &quick_xml::events::BytesStart<'_>) -> Result<XmlElement> {
    let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.context("malformed feed attribute")?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .context("malformed feed attribute value")?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(XmlElement {
        local,
        attrs,
        text: None,
        children: Vec::new(),
    })
}

fn attach(stack: &mut Vec<XmlElement>, root: &mut Option<XmlElement>, element: XmlElement) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
    } else if root.is_none() {
        *root = Some(element);
    }
}

fn scalar(text: Option<&String>) -> FieldValue {
    match text {
        Some(t) => FieldValue::Scalar(Value::String(t.clone())),
        None => FieldValue::Scalar(Value::Null),
    }
}

/// Parse a windowed-feed response. Each entry's `content` properties become
/// record fields; an attribute-bearing field without an explicit `null`
/// marker is read as a nested row collection, a `null`-marked field as a
/// present-but-null scalar.
pub fn parse_entries(xml: &str) -> Result<Vec<Record>> {
    let feed = parse_tree(xml)?;
    let mut records = Vec::new();

    for entry in feed.children_named("entry") {
        let Some(properties) = entry
            .children_named("content")
            .next()
            .and_then(|content| content.children.first())
        else {
            continue;
        };

        let mut record = Record::new();
        for field in &properties.children {
            let is_null = field.attr("null").is_some();
            if !field.attrs.is_empty() && !is_null {
                let rows = field
                    .children
                    .iter()
                    .map(|row| {
                        row.children
                            .iter()
                            .map(|cell| (cell.local.clone(), scalar(cell.text.as_ref())))
                            .collect::<Record>()
                    })
                    .collect();
                record.insert(field.local.clone(), FieldValue::Rows(rows));
            } else {
                record.insert(field.local.clone(), scalar(field.text.as_ref()));
            }
        }
        records.push(record);
    }

    Ok(records)
}

/// Parse a link-following feed page: flat entries only, plus the `rel=next`
/// continuation link. With `infer_types`, field types are read from each
/// field's `type` attribute (default `Edm.String`) and synthesized into an
/// [`EntityType`] named `entity_name`.
pub fn parse_page(xml: &str, infer_types: bool, entity_name: &str) -> Result<FeedPage> {
    let feed = parse_tree(xml)?;
    let mut records = Vec::new();
    let mut inferred_fields: Vec<FieldDef> = Vec::new();

    for entry in feed.children_named("entry") {
        let Some(properties) = entry
            .children_named("content")
            .next()
            .and_then(|content| content.children.first())
        else {
            continue;
        };

        let infer_this = infer_types && records.is_empty();
        let mut record = Record::new();
        for field in &properties.children {
            if infer_this {
                let declared = field.attr("type").unwrap_or("Edm.String");
                inferred_fields.push(FieldDef {
                    name: field.local.clone(),
                    ty: FieldType::Primitive(declared.to_string()),
                });
            }
            record.insert(field.local.clone(), scalar(field.text.as_ref()));
        }
        records.push(record);
    }

    let next_link = feed
        .children_named("link")
        .find(|link| link.attr("rel") == Some("next"))
        .and_then(|link| link.attr("href"))
        .map(str::to_string);

    let inferred = if infer_types && !inferred_fields.is_empty() {
        Some(EntityType {
            name: entity_name.to_string(),
            fields: inferred_fields,
        })
    } else {
        None
    };

    Ok(FeedPage {
        records,
        next_link,
        inferred,
    })
}
