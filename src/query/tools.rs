use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::types::{BoundingBox, PageId, PageMeta, Pointer};

/// Tools whose payloads the reducer decodes. Everything else stays opaque in
/// the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    PageSearch,
    SelectPages,
    SelectPointers,
    Other,
}

impl ToolKind {
    pub fn classify(tool: &str) -> Self {
        match tool {
            "select_pages" => ToolKind::SelectPages,
            "select_pointers" => ToolKind::SelectPointers,
            t if t == "search_pages" || t.starts_with("search_pages_") || t.starts_with("page_search") => {
                ToolKind::PageSearch
            }
            _ => ToolKind::Other,
        }
    }
}

/// Tools sometimes hand back their JSON as an encoded string.
fn unwrap_encoded(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(s).unwrap_or(Value::Null),
        other => other.clone(),
    }
}

fn decode<T: DeserializeOwned>(value: &Value) -> Option<T> {
    serde_json::from_value(unwrap_encoded(value)).ok()
}

/// A page record as returned by search tools.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PageRecord {
    #[serde(alias = "pageId", alias = "id")]
    pub page_id: PageId,
    #[serde(alias = "pageName", alias = "name")]
    pub page_name: String,
    #[serde(alias = "filePath", alias = "path")]
    pub file_path: String,
    #[serde(default, alias = "disciplineId")]
    pub discipline_id: Option<String>,
}

impl PageRecord {
    pub fn into_entry(self) -> (PageId, PageMeta) {
        (
            self.page_id,
            PageMeta {
                file_path: self.file_path,
                page_name: self.page_name,
                discipline_id: self.discipline_id,
            },
        )
    }
}

/// Page records carried by a search (or select) result. Records that do not
/// have the required fields are skipped individually.
pub fn page_records(result: &Value) -> Vec<PageRecord> {
    let value = unwrap_encoded(result);
    let items: &[Value] = match &value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("pages").or_else(|| map.get("results")) {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    items
        .iter()
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect()
}

#[derive(Deserialize)]
struct SelectPagesInput {
    #[serde(default, alias = "pageIds")]
    page_ids: Vec<PageId>,
}

#[derive(Deserialize)]
struct SelectPointersInput {
    #[serde(default, alias = "pointerIds")]
    pointer_ids: Vec<String>,
}

/// Page ids requested by a `select_pages` call, in request order.
pub fn requested_page_ids(input: &Value) -> Vec<PageId> {
    decode::<SelectPagesInput>(input)
        .map(|i| i.page_ids)
        .unwrap_or_default()
}

/// Pointer ids requested by a `select_pointers` call, in request order.
pub fn requested_pointer_ids(input: &Value) -> Vec<String> {
    decode::<SelectPointersInput>(input)
        .map(|i| i.pointer_ids)
        .unwrap_or_default()
}

/// A pointer as returned by `select_pointers`, still tagged with its page.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PointerRecord {
    #[serde(alias = "pointerId", alias = "id")]
    pub pointer_id: String,
    #[serde(alias = "pageId")]
    pub page_id: PageId,
    #[serde(default, alias = "title")]
    pub label: String,
    #[serde(alias = "bounds", alias = "bounding_box")]
    pub bbox: BoundingBox,
}

impl PointerRecord {
    pub fn into_pointer(self) -> (PageId, Pointer) {
        (
            self.page_id,
            Pointer {
                pointer_id: self.pointer_id,
                label: self.label,
                bbox: self.bbox,
            },
        )
    }
}

/// Pointer records in a `select_pointers` result, payload order.
pub fn pointer_records(result: &Value) -> Vec<PointerRecord> {
    let value = unwrap_encoded(result);
    let items: &[Value] = match &value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("pointers") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    items
        .iter()
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect()
}
