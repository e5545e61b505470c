/*!
Helpers pour charger les contrats MQTT et valider les payloads

Les contrats décrivent un sous-ensemble de JSON Schema:
- `type` (object, string, integer, number, boolean, null, ou liste de types)
- `required` et `properties` pour les objets
- `additionalProperties` (schéma appliqué aux clés non listées)
- `enum` pour les valeurs fermées
*/

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};

/// Répertoire `contracts/` du workspace
pub fn workspace_contracts_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("contracts")
}

#[derive(Debug, Clone)]
pub struct Contract {
    pub name: String,
    pub version: String,
    pub topic: String,
    pub schema: Value,
    pub description: Option<String>,
}

impl Contract {
    /// Valide un payload contre le schéma du contrat
    pub fn validate(&self, payload: &Value) -> Result<()> {
        validate_value(&self.schema, payload, "$")
            .with_context(|| format!("payload violates contract {}", self.name))
    }
}

/// Charge et gère les contrats depuis les fichiers JSON
pub struct ContractLoader {
    contracts: HashMap<String, Contract>,
    contracts_dir: PathBuf,
}

impl ContractLoader {
    pub fn new<P: AsRef<Path>>(contracts_dir: P) -> Self {
        Self {
            contracts: HashMap::new(),
            contracts_dir: contracts_dir.as_ref().to_path_buf(),
        }
    }

    /// Charge tous les contrats MQTT depuis le répertoire
    pub fn load_mqtt_contracts(&mut self) -> Result<usize> {
        let mqtt_dir = self.contracts_dir.join("mqtt");
        if !mqtt_dir.exists() {
            log::warn!("Contracts directory not found: {}", mqtt_dir.display());
            return Ok(0);
        }

        let mut count = 0;
        for entry in std::fs::read_dir(&mqtt_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match load_contract(&path) {
                Ok(contract) => {
                    log::info!("📜 Loaded contract: {}", contract.name);
                    self.contracts.insert(contract.name.clone(), contract);
                    count += 1;
                }
                Err(e) => log::warn!("⚠️ Failed to load contract {}: {}", path.display(), e),
            }
        }
        Ok(count)
    }

    pub fn get_contract(&self, name: &str) -> Option<&Contract> {
        self.contracts.get(name)
    }

    pub fn list_contracts(&self) -> Vec<&Contract> {
        self.contracts.values().collect()
    }
}

fn load_contract(path: &Path) -> Result<Contract> {
    let content = std::fs::read_to_string(path)?;
    let json: Value = serde_json::from_str(&content)?;

    let fallback_name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    let field = |key: &str| json.get(key).and_then(|v| v.as_str()).map(str::to_string);

    Ok(Contract {
        name: field("name").unwrap_or(fallback_name),
        version: field("version").unwrap_or_else(|| "v1".to_string()),
        topic: field("topic").unwrap_or_default(),
        schema: json.get("schema").cloned().unwrap_or_else(|| Value::Object(Map::new())),
        description: field("description"),
    })
}

fn validate_value(schema: &Value, value: &Value, at: &str) -> Result<()> {
    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(t) => vec![t.as_str()],
            Value::Array(types) => types.iter().filter_map(|t| t.as_str()).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| type_matches(t, value)) {
            bail!("{}: expected {:?}, got {}", at, allowed, value);
        }
    }

    if let Some(options) = schema.get("enum").and_then(|e| e.as_array()) {
        if !options.contains(value) {
            bail!("{}: {} is not one of {:?}", at, value, options);
        }
    }

    let Some(object) = value.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !object.contains_key(key) {
                bail!("{}: missing required field '{}'", at, key);
            }
        }
    }

    let properties = schema.get("properties").and_then(|p| p.as_object());
    let additional = schema.get("additionalProperties").filter(|a| a.is_object());
    for (key, child) in object {
        let path = format!("{}.{}", at, key);
        match properties.and_then(|p| p.get(key)) {
            Some(child_schema) => validate_value(child_schema, child, &path)?,
            None => {
                if let Some(child_schema) = additional {
                    validate_value(child_schema, child, &path)?;
                }
            }
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}
