//! Feed metadata catalog: entity types parsed from the service's `$metadata`
//! document, plus the OData→SQL primitive type mapping.
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("entity type '{0}' not found in feed metadata")]
    NotFound(String),
    #[error("metadata XML error: {0}")]
    Xml(#[from] quick_xml::Error),
}

/// SQL column type for unmapped declared types (the widest text type).
pub const DEFAULT_SQL_TYPE: &str = "nvarchar(MAX)";

/// Sentinel scalar the feed emits for undefined values.
pub const UNDEFINED_SENTINEL: &str = "StandardODATA.Undefined";

const COLLECTION_PREFIX: &str = "Collection(StandardODATA.";
const COLLECTION_SUFFIX: &str = "_RowType)";

/// Map an OData primitive type name to its SQL column type.
pub fn sql_type(declared: &str) -> &'static str {
    match declared {
        "Edm.Int64" => "BIGINT",
        "Edm.Boolean" => "BIT",
        "Edm.Int32" => "INTEGER",
        "Edm.String" => DEFAULT_SQL_TYPE,
        "Edm.Date" => "Date",
        "Edm.Decimal" => "FLOAT",
        "Edm.Double" => "FLOAT",
        "Edm.Binary" => "VARBINARY",
        "Edm.Single" => "REAL",
        "Edm.Int16" => "SMALLINT",
        "Edm.TimeOfDay" => "TIME",
        "Edm.DateTimeOffset" => "TIMESTAMP",
        "Edm.Byte" => "TINYINT",
        "Edm.SByte3" => "TINYINT",
        _ => DEFAULT_SQL_TYPE,
    }
}

/// Declared type of an entity field, parsed once at the catalog boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Primitive(String),
    /// Nested row collection referencing another entity type by bare name.
    CollectionOf(String),
}

impl FieldType {
    /// Parse a declared type string, recognizing the nested-collection
    /// marker `Collection(StandardODATA.<entity>_RowType)`.
    pub fn parse(declared: &str) -> FieldType {
        if let Some(inner) = declared
            .strip_prefix(COLLECTION_PREFIX)
            .and_then(|rest| rest.strip_suffix(COLLECTION_SUFFIX))
        {
            FieldType::CollectionOf(inner.to_string())
        } else {
            FieldType::Primitive(declared.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
}

/// A named record schema declared by the feed, fields in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityType {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl EntityType {
    /// Fields that become columns (everything except nested collections).
    pub fn column_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields
            .iter()
            .filter(|f| matches!(f.ty, FieldType::Primitive(_)))
    }

    /// Nested-collection fields as `(field name, referenced entity name)`.
    pub fn collection_fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().filter_map(|f| match &f.ty {
            FieldType::CollectionOf(entity) => Some((f.name.as_str(), entity.as_str())),
            FieldType::Primitive(_) => None,
        })
    }
}

/// In-memory catalog of every entity type the feed declares.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    entities: BTreeMap<String, EntityType>,
}

impl SchemaCatalog {
    pub fn get(&self, entity: &str) -> Result<&EntityType, SchemaError> {
        self.entities
            .get(entity)
            .ok_or_else(|| SchemaError::NotFound(entity.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Parse an EDMX `$metadata` document. Every `EntityType` element
    /// contributes one catalog entry; each `Property` child with `Name` and
    /// `Type` attributes contributes one field, in declaration order.
    pub fn parse(xml: &str) -> Result<SchemaCatalog, SchemaError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut entities = BTreeMap::new();
        let mut current: Option<EntityType> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) if e.local_name().as_ref() == b"EntityType" => {
                    let name = attribute_value(&e, b"Name")?;
                    if let Some(name) = name {
                        current = Some(EntityType {
                            name,
                            fields: Vec::new(),
                        });
                    }
                }
                Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Property" => {
                    if let Some(entity) = current.as_mut() {
                        let name = attribute_value(&e, b"Name")?;
                        let declared = attribute_value(&e, b"Type")?;
                        if let (Some(name), Some(declared)) = (name, declared) {
                            entity.fields.push(FieldDef {
                                name,
                                ty: FieldType::parse(&declared),
                            });
                        }
                    }
                }
                Event::End(e) if e.local_name().as_ref() == b"EntityType" => {
                    if let Some(entity) = current.take() {
                        entities.insert(entity.name.clone(), entity);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(SchemaCatalog { entities })
    }
}

fn attribute_value(
    e: &quick_xml::events::BytesStart<'_>,
    key: &[u8],
) -> Result<Option<String>, SchemaError> {
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.local_name().as_ref() == key {
            return Ok(Some(
                attr.unescape_value()
                    .map_err(quick_xml::Error::from)?
                    .into_owned(),
            ));
        }
    }
    Ok(None)
}
