//! Catalog entities and write payloads as they travel over the wire.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::cache::{Cacheable, QueryKey};

/// Accept ids as JSON strings or numbers; the catalog treats them as opaque strings.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum RawId {
    Text(String),
    Number(serde_json::Number),
  }

  Ok(match RawId::deserialize(deserializer)? {
    RawId::Text(s) => s,
    RawId::Number(n) => n.to_string(),
  })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Brand {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub slug: String,
}

/// Headphone category ("type" on the wire).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadphoneType {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headphone {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub slug: String,
  pub price: f64,
  /// Read-model snapshot of the referenced brand
  #[serde(default)]
  pub brand: Brand,
  /// Read-model snapshot of the referenced type
  #[serde(default, rename = "type")]
  pub kind: HeadphoneType,
  #[serde(deserialize_with = "deserialize_id")]
  pub brand_id: String,
  #[serde(deserialize_with = "deserialize_id")]
  pub type_id: String,
}

/// Body for brand and type writes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NameInput {
  pub name: String,
}

impl NameInput {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into() }
  }
}

/// Body for headphone writes. Updates replace every mutable field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeadphoneInput {
  pub name: String,
  pub price: f64,
  pub brand_id: String,
  pub type_id: String,
}

/// Server acknowledgment for deletes. Callers don't depend on its content.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeleteAck {
  #[serde(default)]
  pub message: Option<String>,
}

/// A write payload that can be checked before it goes on the wire.
pub trait WriteInput: Serialize + Send + Sync {
  /// Return a user-facing message describing the first invalid field.
  fn validate(&self) -> Result<(), String>;

  /// Brand the written record must reference, if any.
  fn brand_ref(&self) -> Option<&str> {
    None
  }

  /// Type the written record must reference, if any.
  fn type_ref(&self) -> Option<&str> {
    None
  }
}

impl WriteInput for NameInput {
  fn validate(&self) -> Result<(), String> {
    if self.name.trim().is_empty() {
      return Err("Name is required".to_string());
    }
    Ok(())
  }
}

impl WriteInput for HeadphoneInput {
  fn validate(&self) -> Result<(), String> {
    if self.name.trim().is_empty() {
      return Err("Name is required".to_string());
    }
    if !self.price.is_finite() || self.price < 0.0 {
      return Err("Price must be a non-negative number".to_string());
    }
    if self.brand_id.trim().is_empty() {
      return Err("Brand is required".to_string());
    }
    if self.type_id.trim().is_empty() {
      return Err("Type is required".to_string());
    }
    Ok(())
  }

  fn brand_ref(&self) -> Option<&str> {
    Some(&self.brand_id)
  }

  fn type_ref(&self) -> Option<&str> {
    Some(&self.type_id)
  }
}

/// A server-owned catalog entity with a REST collection.
pub trait Resource: Cacheable + Serialize + DeserializeOwned {
  /// Collection path segment, e.g. "brands"
  const COLLECTION: &'static str;
  /// Capitalized singular name for notifications, e.g. "Brand"
  const LABEL: &'static str;

  type Input: WriteInput + std::fmt::Debug;

  fn name(&self) -> &str;

  /// Cache key of the collection's list query.
  fn list_key() -> QueryKey {
    QueryKey::list(Self::COLLECTION)
  }
}

// ============================================================================
// Cacheable / Resource implementations
// ============================================================================

impl Cacheable for Brand {
  fn cache_key(&self) -> &str {
    &self.id
  }

  fn entity_type() -> &'static str {
    "brand"
  }
}

impl Resource for Brand {
  const COLLECTION: &'static str = "brands";
  const LABEL: &'static str = "Brand";
  type Input = NameInput;

  fn name(&self) -> &str {
    &self.name
  }
}

impl Cacheable for HeadphoneType {
  fn cache_key(&self) -> &str {
    &self.id
  }

  fn entity_type() -> &'static str {
    "type"
  }
}

impl Resource for HeadphoneType {
  const COLLECTION: &'static str = "types";
  const LABEL: &'static str = "Type";
  type Input = NameInput;

  fn name(&self) -> &str {
    &self.name
  }
}

impl Cacheable for Headphone {
  fn cache_key(&self) -> &str {
    &self.id
  }

  fn entity_type() -> &'static str {
    "headphone"
  }
}

impl Resource for Headphone {
  const COLLECTION: &'static str = "headphones";
  const LABEL: &'static str = "Headphone";
  type Input = HeadphoneInput;

  fn name(&self) -> &str {
    &self.name
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_headphone_decodes_embedded_snapshots() {
    let json = r#"{
      "id": 7,
      "name": "WH-1000XM5",
      "slug": "wh-1000xm5",
      "price": 399,
      "brand": {"id": "b1", "name": "Sony", "slug": "sony"},
      "type": {"id": "t1", "name": "Over-ear", "slug": "over-ear"},
      "brand_id": "b1",
      "type_id": "t1"
    }"#;

    let headphone: Headphone = serde_json::from_str(json).unwrap();
    assert_eq!(headphone.id, "7");
    assert_eq!(headphone.price, 399.0);
    assert_eq!(headphone.brand.name, "Sony");
    assert_eq!(headphone.kind.slug, "over-ear");
  }

  #[test]
  fn test_headphone_input_serializes_write_shape() {
    let input = HeadphoneInput {
      name: "WH-1000XM5".to_string(),
      price: 399.0,
      brand_id: "b1".to_string(),
      type_id: "t1".to_string(),
    };

    let value = serde_json::to_value(&input).unwrap();
    assert_eq!(
      value,
      serde_json::json!({"name": "WH-1000XM5", "price": 399.0, "brand_id": "b1", "type_id": "t1"})
    );
  }

  #[test]
  fn test_name_input_rejects_blank_name() {
    assert!(NameInput::new("   ").validate().is_err());
    assert!(NameInput::new("Sony").validate().is_ok());
  }

  #[test]
  fn test_headphone_input_rejects_negative_price() {
    let mut input = HeadphoneInput {
      name: "HD 600".to_string(),
      price: -1.0,
      brand_id: "b2".to_string(),
      type_id: "t1".to_string(),
    };
    assert_eq!(
      input.validate(),
      Err("Price must be a non-negative number".to_string())
    );

    input.price = f64::NAN;
    assert!(input.validate().is_err());

    input.price = 0.0;
    assert!(input.validate().is_ok());

    input.type_id = String::new();
    assert_eq!(input.validate(), Err("Type is required".to_string()));
  }

  #[test]
  fn test_list_keys_are_distinct_per_collection() {
    assert_ne!(Brand::list_key(), HeadphoneType::list_key());
    assert_eq!(Headphone::list_key(), QueryKey::list("headphones"));
  }
}
