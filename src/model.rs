use serde_json::Value;

/// One field of a normalized feed record: either a scalar (JSON-typed,
/// stringified only at insert time) or a nested sequence of sub-records.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Scalar(Value),
    Rows(Vec<Record>),
}

impl FieldValue {
    pub fn null() -> Self {
        FieldValue::Scalar(Value::Null)
    }

    pub fn text(s: impl Into<String>) -> Self {
        FieldValue::Scalar(Value::String(s.into()))
    }

    pub fn is_rows(&self) -> bool {
        matches!(self, FieldValue::Rows(_))
    }
}

/// A normalized feed record. Field order is preserved as parsed; the bulk
/// insert builder relies on the first record's order as the canonical
/// column order for a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field, replacing any existing value under the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

impl FromIterator<(String, FieldValue)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        let mut rec = Record::new();
        for (name, value) in iter {
            rec.insert(name, value);
        }
        rec
    }
}

/// Result of reconciling a live table against the metadata catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableCheck {
    /// Live columns cover the catalog's field set; incremental sync is safe.
    Unchanged,
    /// Schema drift detected; the table was dropped and recreated.
    Rebuilt,
}

/// Outcome of one configured table job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed {
        windows: usize,
        statements: usize,
    },
    Skipped(String),
}
