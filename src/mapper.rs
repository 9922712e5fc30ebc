//! Catalog item → wire record mapping.
//!
//! [`EntityMapper::map`] builds a [`MappedRecord`] in a fixed order (external
//! id, images, categories, attributes, description, metadata), runs the
//! optional [`MappingHook`], then validates the *serialized* form, since that
//! is what the remote service receives. A record that fails validation is
//! returned as a list of [`ValidationError`]s; callers drop it from its batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use scraper::{ElementRef, Html, Node};
use serde_json::{json, Value};

use crate::error::ValidationError;
use crate::models::{CatalogItem, ItemAttribute, ItemImage, MappedImage, MappedRecord, RecordStatus};

/// Longest description sent upstream, in characters (before the ellipsis).
pub const MAX_DESCRIPTION_CHARS: usize = 5000;

/// Post-mapping extension point. May rewrite any field of the record.
pub type MappingHook = Arc<dyn Fn(MappedRecord, &CatalogItem) -> MappedRecord + Send + Sync>;

#[derive(Clone)]
pub struct EntityMapper {
    tenant: String,
    currency: String,
    hook: Option<MappingHook>,
}

impl EntityMapper {
    pub fn new(tenant: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            currency: currency.into(),
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: MappingHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// `{tenant}_{item_id}`, unique across catalogs sharing one remote account.
    pub fn external_id(&self, item_id: i64) -> String {
        format!("{}_{}", self.tenant, item_id)
    }

    pub fn map(&self, item: &CatalogItem) -> Result<MappedRecord, Vec<ValidationError>> {
        let external_id = self.external_id(item.id);
        let images = map_images(&item.images);
        let categories = item
            .categories
            .iter()
            .filter(|c| !c.name.is_empty())
            .map(|c| c.name.clone())
            .collect();
        let attributes = flatten_attributes(&item.attributes);
        let description = clean_description(&item.description);
        let metadata = self.metadata(item);

        let sku = item
            .sku
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| external_id.clone());

        let mut record = MappedRecord {
            external_id,
            name: item.name.trim().to_string(),
            description,
            price: parse_price(item.price.as_deref()),
            currency: self.currency.clone(),
            sku,
            categories,
            images,
            attributes,
            stock: item.stock,
            status: if item.status.is_publishable() {
                RecordStatus::Published
            } else {
                RecordStatus::Draft
            },
            metadata,
        };

        if let Some(hook) = &self.hook {
            record = hook(record, item);
        }

        let errors = validate(&record);
        if errors.is_empty() {
            Ok(record)
        } else {
            Err(errors)
        }
    }

    fn metadata(&self, item: &CatalogItem) -> Value {
        json!({
            "platform": {
                "tenant": self.tenant,
                "itemId": item.id,
                "kind": item.kind,
                "featured": item.featured,
                "url": item.permalink,
            },
            "pricing": {
                "regularPrice": parse_price(item.regular_price.as_deref()),
                "salePrice": parse_price(item.sale_price.as_deref()),
            },
            "inventory": {
                "inStock": item.in_stock,
                "stock": item.stock,
            },
            "dimensions": {
                "weight": item.dimensions.weight,
                "length": item.dimensions.length,
                "width": item.dimensions.width,
                "height": item.dimensions.height,
            },
            "dateCreated": item.created_at.to_rfc3339(),
            "dateModified": item.updated_at.to_rfc3339(),
        })
    }
}

/// Keep images with a usable URL, in order; the first survivor is featured.
fn map_images(images: &[ItemImage]) -> Vec<MappedImage> {
    images
        .iter()
        .filter(|img| is_valid_url(&img.url))
        .enumerate()
        .map(|(i, img)| MappedImage {
            url: img.url.clone(),
            alt: img.alt.clone(),
            featured: i == 0,
        })
        .collect()
}

fn flatten_attributes(attributes: &[ItemAttribute]) -> BTreeMap<String, String> {
    attributes
        .iter()
        .filter(|a| !a.name.is_empty())
        .map(|a| (a.name.clone(), a.values.join(", ")))
        .collect()
}

fn parse_price(raw: Option<&str>) -> Option<f64> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|p| p.is_finite())
}

/// Syntactic URL check: must parse and name a host.
pub fn is_valid_url(raw: &str) -> bool {
    reqwest::Url::parse(raw.trim())
        .map(|u| u.has_host())
        .unwrap_or(false)
}

/// Strip markup, collapse whitespace and cap the length.
pub fn clean_description(raw: &str) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }
    let text = strip_markup(raw);
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() > MAX_DESCRIPTION_CHARS {
        let mut truncated: String = collapsed.chars().take(MAX_DESCRIPTION_CHARS).collect();
        truncated.push_str("...");
        truncated
    } else {
        collapsed
    }
}

const BLOCK_TAGS: &[&str] = &[
    "p", "br", "div", "li", "ul", "ol", "tr", "td", "th", "table", "h1", "h2", "h3", "h4", "h5",
    "h6", "section", "article", "blockquote", "hr",
];

/// Text content of an HTML fragment, without `<script>`/`<style>` bodies.
///
/// Block-level elements become a space so adjacent paragraphs don't fuse.
/// Comments are dropped and entities decoded.
pub fn strip_markup(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len());

    for node in fragment.root_element().descendants() {
        match node.value() {
            Node::Element(element) if BLOCK_TAGS.contains(&element.name()) => out.push(' '),
            Node::Text(text) => {
                let hidden = node
                    .ancestors()
                    .filter_map(ElementRef::wrap)
                    .any(|el| matches!(el.value().name(), "script" | "style"));
                if !hidden {
                    out.push_str(text);
                }
            }
            _ => {}
        }
    }
    out
}

/// Validate the record as it will appear on the wire.
pub fn validate(record: &MappedRecord) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let wire = match serde_json::to_value(record) {
        Ok(v) => v,
        Err(e) => {
            errors.push(ValidationError::new("record", format!("not serializable: {}", e)));
            return errors;
        }
    };

    let non_empty = |key: &str| {
        wire.get(key)
            .and_then(Value::as_str)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
    };

    if !non_empty("externalId") {
        errors.push(ValidationError::new("externalId", "externalId is required"));
    }
    if !non_empty("name") {
        errors.push(ValidationError::new("name", "name is required"));
    }
    // serde_json writes non-finite floats as null
    if !wire.get("price").map(Value::is_number).unwrap_or(false) {
        errors.push(ValidationError::new(
            "price",
            "price is required and must be numeric",
        ));
    }
    if !wire.get("categories").map(Value::is_array).unwrap_or(false) {
        errors.push(ValidationError::new("categories", "categories must be an array"));
    }
    match wire.get("attributes") {
        Some(Value::Object(_)) => {}
        Some(Value::Array(_)) => errors.push(ValidationError::new(
            "attributes",
            "attributes must be an object, not an array",
        )),
        _ => errors.push(ValidationError::new("attributes", "attributes must be an object")),
    }

    match wire.get("images") {
        Some(Value::Array(images)) => {
            for (index, image) in images.iter().enumerate() {
                match image.get("url").and_then(Value::as_str) {
                    Some(url) if !url.is_empty() => {
                        if !is_valid_url(url) {
                            errors.push(ValidationError::new(
                                format!("images[{}].url", index),
                                "must be a valid URL",
                            ));
                        }
                    }
                    _ => errors.push(ValidationError::new(
                        format!("images[{}]", index),
                        "must have a url field",
                    )),
                }
            }
        }
        _ => errors.push(ValidationError::new("images", "images must be an array")),
    }

    errors
}
