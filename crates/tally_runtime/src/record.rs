use serde_json::{Map, Value as Json};
use tally_ir::{EntityClass, EntityRef};

use crate::value::Value;

/// A plain, tagged snapshot of a stored entity as seen by expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordView {
    pub object_class: EntityClass,
    pub id: String,
    pub fields: Map<String, Json>,
}

impl RecordView {
    /// Builds a view from a stored JSON object; records without an `id` are rejected.
    pub fn from_json(object_class: EntityClass, json: &Json) -> Option<Self> {
        let obj = json.as_object()?;
        let id = match obj.get("id")? {
            Json::String(s) => s.clone(),
            Json::Number(n) => n.to_string(),
            _ => return None,
        };
        let mut fields = obj.clone();
        fields.remove("id");
        fields.remove("object_class");
        Some(Self {
            object_class,
            id,
            fields,
        })
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.object_class, self.id.clone())
    }

    pub fn user_code(&self) -> Option<&str> {
        self.fields.get("user_code").and_then(Json::as_str)
    }

    pub fn display_key(&self) -> &str {
        self.user_code().unwrap_or(&self.id)
    }

    pub fn has_field(&self, name: &str) -> bool {
        name == "id" || name == "object_class" || self.fields.contains_key(name)
    }

    /// Field value in expression form; relation ids become lazy references.
    pub fn attr(&self, name: &str) -> Option<Value> {
        match name {
            "id" => return Some(Value::Str(self.id.clone())),
            "object_class" => return Some(Value::Str(self.object_class.as_str().to_string())),
            _ => {}
        }
        let raw = self.fields.get(name)?;
        if let Some(target) = self.object_class.relation_target(name) {
            return Some(match raw {
                Json::String(id) if !id.is_empty() => Value::Ref(EntityRef::new(target, id.clone())),
                Json::Null => Value::None,
                other => Value::from_json(other),
            });
        }
        if let Some(target) = self.object_class.relation_list_target(name) {
            if let Json::Array(ids) = raw {
                return Some(Value::List(
                    ids.iter()
                        .map(|id| match id {
                            Json::String(id) => Value::Ref(EntityRef::new(target, id.clone())),
                            other => Value::from_json(other),
                        })
                        .collect(),
                ));
            }
        }
        Some(Value::from_json(raw))
    }

    pub fn to_json(&self) -> Json {
        let mut obj = self.fields.clone();
        obj.insert("id".to_string(), Json::String(self.id.clone()));
        obj.insert(
            "object_class".to_string(),
            Json::String(self.object_class.as_str().to_string()),
        );
        Json::Object(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_relation_fields_become_references() {
        let view = RecordView::from_json(
            EntityClass::Transaction,
            &json!({
                "id": "t1",
                "instrument": "i-42",
                "portfolio": null,
                "cash_consideration": 1000.0,
                "accounting_date": "2024-01-15"
            }),
        )
        .unwrap();

        assert_eq!(
            view.attr("instrument"),
            Some(Value::Ref(EntityRef::new(EntityClass::Instrument, "i-42")))
        );
        assert_eq!(view.attr("portfolio"), Some(Value::None));
        assert_eq!(view.attr("cash_consideration"), Some(Value::Float(1000.0)));
        // Dates stay in their stored text form.
        assert_eq!(view.attr("accounting_date"), Some(Value::str("2024-01-15")));
        assert_eq!(view.attr("object_class"), Some(Value::str("Transaction")));
        assert_eq!(view.attr("missing"), None);
    }

    #[test]
    fn test_attributes_map_is_a_dict() {
        let view = RecordView::from_json(
            EntityClass::Instrument,
            &json!({ "id": "i1", "user_code": "BOND", "attributes": { "country": "DE" } }),
        )
        .unwrap();
        match view.attr("attributes") {
            Some(Value::Dict(d)) => assert_eq!(d.get_str("country"), Some(&Value::str("DE"))),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(view.display_key(), "BOND");
    }

    #[test]
    fn test_record_without_id_is_rejected() {
        assert!(RecordView::from_json(EntityClass::Currency, &json!({ "user_code": "USD" })).is_none());
    }
}
