//! Object references read from manifest files (`-f`).
//!
//! Only the coordinates are kept; objects are always re-read from the server.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rewind_core::Gvk;
use serde::Deserialize;
use serde_json::Value as Json;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRef {
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: String,
}

fn max_manifest_bytes() -> usize {
    std::env::var("REWIND_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(5_000_000)
}

/// Load every object named by `paths`. Directories are read one level deep
/// unless `recursive`; `-` reads stdin.
pub fn load(paths: &[PathBuf], recursive: bool) -> Result<Vec<ManifestRef>> {
    let mut out = Vec::new();
    for path in paths {
        for file in manifest_files(path, recursive)? {
            let text = read_source(&file)?;
            out.extend(parse_documents(&text).with_context(|| format!("error parsing {}", file.display()))?);
        }
    }
    Ok(out)
}

fn manifest_files(path: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    if path == Path::new("-") {
        return Ok(vec![path.to_path_buf()]);
    }
    let meta = std::fs::metadata(path).with_context(|| format!("the path {:?} does not exist", path.display().to_string()))?;
    if !meta.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut walker = WalkDir::new(path).min_depth(1).sort_by_file_name();
    if !recursive {
        walker = walker.max_depth(1);
    }
    let mut out = Vec::new();
    for entry in walker {
        let entry = entry.with_context(|| format!("walking {}", path.display()))?;
        if entry.file_type().is_file() && has_manifest_extension(entry.path()) {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

fn has_manifest_extension(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json"))
}

fn read_source(path: &Path) -> Result<String> {
    let limit = max_manifest_bytes();
    if path == Path::new("-") {
        return read_limited(std::io::stdin().lock(), limit).context("reading manifests from stdin");
    }
    let file = File::open(path).with_context(|| format!("reading {}", path.display()))?;
    read_limited(file, limit).with_context(|| format!("reading {}", path.display()))
}

/// Read at most `limit` bytes; anything longer is rejected without being buffered.
fn read_limited<R: Read>(reader: R, limit: usize) -> Result<String> {
    let mut buf = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut buf)?;
    if buf.len() > limit {
        return Err(anyhow!("manifest is too large (>{limit} bytes)"));
    }
    Ok(String::from_utf8(buf)?)
}

/// Parse a multi-document YAML (or JSON) stream. `*List` kinds are flattened.
pub fn parse_documents(text: &str) -> Result<Vec<ManifestRef>> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let val = serde_yaml::Value::deserialize(doc).context("parsing YAML")?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        collect(&json, &mut out)?;
    }
    Ok(out)
}

fn collect(json: &Json, out: &mut Vec<ManifestRef>) -> Result<()> {
    let kind = json.get("kind").and_then(Json::as_str).ok_or_else(|| anyhow!("object missing kind"))?;
    if kind.ends_with("List") {
        if let Some(items) = json.get("items").and_then(Json::as_array) {
            for item in items {
                collect(item, out)?;
            }
            return Ok(());
        }
    }
    let api_version = json.get("apiVersion").and_then(Json::as_str).ok_or_else(|| anyhow!("object missing apiVersion"))?;
    let meta = json.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(Json::as_str)
        .ok_or_else(|| anyhow!("{kind} object missing metadata.name"))?;
    let namespace = meta.and_then(|m| m.get("namespace")).and_then(Json::as_str).map(str::to_string);
    let gvk = Gvk::from_api_version(api_version, kind).map_err(|e| anyhow!(e.to_string()))?;
    out.push(ManifestRef { gvk, namespace, name: name.to_string() });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_document_stream_with_list() {
        let y = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: prod
---
---
apiVersion: v1
kind: List
items:
- apiVersion: apps.kruise.io/v1alpha1
  kind: CloneSet
  metadata:
    name: cs
";
        let refs = parse_documents(y).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0], ManifestRef { gvk: Gvk::new("apps", "v1", "Deployment"), namespace: Some("prod".into()), name: "web".into() });
        assert_eq!(refs[1].gvk, Gvk::new("apps.kruise.io", "v1alpha1", "CloneSet"));
        assert_eq!(refs[1].namespace, None);
    }

    #[test]
    fn json_documents_parse_too() {
        let refs = parse_documents(r#"{"apiVersion":"apps/v1","kind":"DaemonSet","metadata":{"name":"agent"}}"#).unwrap();
        assert_eq!(refs[0].gvk.kind, "DaemonSet");
    }

    #[test]
    fn missing_fields_are_friendly() {
        let e1 = parse_documents("kind: Deployment\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e1.contains("missing apiVersion"), "e1={e1}");
        let e2 = parse_documents("apiVersion: v1\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e2.contains("missing kind"), "e2={e2}");
        let e3 = parse_documents("apiVersion: apps/v1\nkind: Deployment\nmetadata: {}\n").unwrap_err().to_string();
        assert!(e3.contains("missing metadata.name"), "e3={e3}");
    }

    #[test]
    fn directories_respect_recursion() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(dir.path().join("a.yaml"), "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: a\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(nested.join("b.yml"), "apiVersion: apps/v1\nkind: StatefulSet\nmetadata:\n  name: b\n").unwrap();

        let flat = load(&[dir.path().to_path_buf()], false).unwrap();
        assert_eq!(flat.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["a"]);
        let deep = load(&[dir.path().to_path_buf()], true).unwrap();
        assert_eq!(deep.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn oversized_input_is_cut_off_at_the_limit() {
        let big = "a".repeat(64);
        assert_eq!(read_limited(big.as_bytes(), 64).unwrap().len(), 64);
        let err = read_limited(big.as_bytes(), 63).unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
    }

    #[test]
    fn missing_path_is_an_error() {
        assert!(load(&[PathBuf::from("/definitely/not/here.yaml")], false).is_err());
    }
}
