//! agentop schema: CRD manifests for the operator's kinds and their conversion to standalone JSON schemas.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use agentop_core::{AgentDeployment, AgentProfile};
use anyhow::{anyhow, Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

/// CustomResourceDefinitions for every kind the operator owns.
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![AgentDeployment::crd(), AgentProfile::crd()]
}

/// All CRDs as one multi-document YAML stream.
pub fn crds_yaml() -> Result<String> {
    let mut out = String::new();
    for crd in crds() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd).context("serializing CRD")?);
    }
    Ok(out)
}

/// One converted schema and the file name it is written under.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaFile {
    /// `<group>_<plural>_<version>.json`, lower-cased.
    pub file_name: String,
    pub schema: Value,
}

/// Close every nested object that declares `properties`. The root is left open.
pub fn additional_properties(data: &mut Map<String, Value>, skip: bool) {
    if !skip && data.contains_key("properties") && !data.contains_key("additionalProperties") {
        data.insert("additionalProperties".into(), Value::Bool(false));
    }
    for v in data.values_mut() {
        if let Value::Object(sub) = v {
            additional_properties(sub, false);
        }
    }
}

/// Rewrite `format: int-or-string` into a `oneOf` of string and integer.
pub fn replace_int_or_string(data: &mut Map<String, Value>) {
    if data.get("format").and_then(Value::as_str) == Some("int-or-string") {
        data.insert(
            "oneOf".into(),
            serde_json::json!([{ "type": "string" }, { "type": "integer" }]),
        );
        data.remove("format");
    }
    for v in data.values_mut() {
        if let Value::Object(sub) = v {
            replace_int_or_string(sub);
        }
    }
}

/// Convert every served version of one CRD (as JSON) into a JSON schema.
pub fn extract_schemas(crd: &Value) -> Result<Vec<SchemaFile>> {
    let spec = crd.get("spec").ok_or_else(|| anyhow!("CRD has no spec"))?;
    let group = spec.get("group").and_then(Value::as_str).unwrap_or_default();
    let plural = spec
        .get("names")
        .and_then(|n| n.get("plural"))
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("CRD has no names.plural"))?;

    let mut out = Vec::new();
    for version in spec.get("versions").and_then(Value::as_array).into_iter().flatten() {
        let Some(Value::Object(schema)) = version.get("schema").and_then(|s| s.get("openAPIV3Schema")) else {
            continue;
        };
        let name = version.get("name").and_then(Value::as_str).unwrap_or_default();
        let mut schema = schema.clone();
        additional_properties(&mut schema, true);
        replace_int_or_string(&mut schema);
        let file_name = format!("{}_{}_{}.json", group, plural, name).to_lowercase();
        debug!(file = %file_name, "converted schema");
        out.push(SchemaFile { file_name, schema: Value::Object(schema) });
    }
    Ok(out)
}

/// Convert every CRD found in a (possibly multi-document) YAML stream.
pub fn from_yaml(yaml: &str) -> Result<Vec<SchemaFile>> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(yaml) {
        let v = serde_yaml::Value::deserialize(doc).context("parsing YAML")?;
        if v.is_null() {
            continue;
        }
        let json = serde_json::to_value(v).context("converting YAML to JSON")?;
        out.extend(extract_schemas(&json)?);
    }
    Ok(out)
}

/// Schemas for the operator's own CRDs.
pub fn builtin_schemas() -> Result<Vec<SchemaFile>> {
    let mut out = Vec::new();
    for crd in crds() {
        out.extend(extract_schemas(&serde_json::to_value(&crd)?)?);
    }
    Ok(out)
}

/// Write each schema as indented JSON under `dir`; returns the written paths.
pub fn write_all(dir: &Path, files: &[SchemaFile]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut written = Vec::with_capacity(files.len());
    for f in files {
        let path = dir.join(&f.file_name);
        let body = serde_json::to_string_pretty(&f.schema)?;
        std::fs::write(&path, body).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "schema written");
        written.push(path);
    }
    Ok(written)
}

/// Offline validation of manifests against the generated schemas.
#[cfg(feature = "jsonschema-validate")]
pub mod validate {
    use super::*;
    use jsonschema::{Draft, JSONSchema};

    #[derive(Debug, Clone, PartialEq)]
    pub struct ValidationIssue {
        pub path: String,
        pub error: String,
        pub hint: Option<String>,
    }

    /// Validate one YAML manifest against `schema`. Empty on success.
    pub fn validate_yaml(schema: &Value, yaml: &str) -> Result<Vec<ValidationIssue>> {
        let json: Value = match serde_yaml::from_str::<serde_yaml::Value>(yaml) {
            Ok(v) => serde_json::to_value(v).context("converting YAML to JSON")?,
            Err(e) => {
                return Ok(vec![ValidationIssue {
                    path: String::new(),
                    error: format!("YAML parse error: {}", e),
                    hint: Some("check indentation and syntax".into()),
                }])
            }
        };
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| anyhow!("compiling schema: {}", e))?;
        let mut issues = Vec::new();
        if let Err(errors) = compiled.validate(&json) {
            for err in errors {
                let error = err.to_string();
                let hint = if error.contains("required property") {
                    Some("missing required field".into())
                } else if error.contains("Additional properties") {
                    Some("unknown field".into())
                } else if error.contains("is not of type") {
                    Some("mismatched type".into())
                } else {
                    None
                };
                issues.push(ValidationIssue { path: err.instance_path.to_string(), error, hint });
            }
        }
        Ok(issues)
    }

    /// Validate against the built-in schema for `kind` (e.g. `AgentDeployment`).
    pub fn validate_manifest(kind: &str, yaml: &str) -> Result<Vec<ValidationIssue>> {
        let crd = crds()
            .into_iter()
            .find(|c| c.spec.names.kind == kind)
            .ok_or_else(|| anyhow!("unknown kind {}", kind))?;
        let files = extract_schemas(&serde_json::to_value(&crd)?)?;
        let schema = files.first().ok_or_else(|| anyhow!("{} has no schema", kind))?;
        validate_yaml(&schema.schema, yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_objects_are_closed_but_root_is_not() {
        let mut v = json!({
            "type": "object",
            "properties": {
                "spec": { "type": "object", "properties": { "a": { "type": "string" } } },
                "open": { "type": "object", "properties": {}, "additionalProperties": true }
            }
        });
        additional_properties(v.as_object_mut().unwrap(), true);
        assert!(v.get("additionalProperties").is_none());
        assert_eq!(v["properties"]["spec"]["additionalProperties"], json!(false));
        assert_eq!(v["properties"]["open"]["additionalProperties"], json!(true));
        assert!(v["properties"]["spec"]["properties"]["a"].get("additionalProperties").is_none());
    }

    #[test]
    fn int_or_string_becomes_one_of() {
        let mut v = json!({ "properties": { "port": { "format": "int-or-string", "x-kubernetes-int-or-string": true } } });
        replace_int_or_string(v.as_object_mut().unwrap());
        let port = &v["properties"]["port"];
        assert!(port.get("format").is_none());
        assert_eq!(port["oneOf"], json!([{ "type": "string" }, { "type": "integer" }]));
    }

    #[test]
    fn file_names_follow_group_plural_version() {
        let yaml = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
spec:
  group: Example.COM
  names: { plural: Widgets, kind: Widget }
  versions:
    - name: v1
      schema:
        openAPIV3Schema: { type: object, properties: { spec: { type: object, properties: {} } } }
    - name: v2beta1
---
"#;
        let files = from_yaml(yaml).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "example.com_widgets_v1.json");
        assert_eq!(files[0].schema["properties"]["spec"]["additionalProperties"], json!(false));
    }

    #[test]
    fn builtin_crds_convert() {
        let files = builtin_schemas().unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["agentop.dev_agentdeployments_v1alpha1.json", "agentop.dev_agentprofiles_v1alpha1.json"]);
        assert!(crds_yaml().unwrap().contains("kind: CustomResourceDefinition"));
    }

    #[test]
    fn write_all_lays_out_files() {
        let dir = std::env::temp_dir().join(format!("agentop-schema-{}", std::process::id()));
        let files = vec![SchemaFile { file_name: "a_b_v1.json".into(), schema: json!({ "type": "object" }) }];
        let written = write_all(&dir, &files).unwrap();
        let body = std::fs::read_to_string(&written[0]).unwrap();
        assert!(body.contains("\"type\": \"object\""));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
