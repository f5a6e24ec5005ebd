use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::TrackerError;
use crate::filter;

pub type ServiceId = String;
pub type DocumentType = String;

/// How to obtain and clean one tracked document.
#[derive(Debug, Clone)]
pub struct DocumentDeclaration {
    /// Remote URL the raw document is fetched from.
    pub location: String,
    /// CSS selectors identifying the legally meaningful subtree(s).
    pub content_selectors: Vec<String>,
    /// CSS selectors stripped from the extracted content.
    pub noise_selectors: Vec<String>,
    /// Named transforms applied to the extracted text, in order.
    pub filter_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceDeclaration {
    pub id: ServiceId,
    pub name: String,
    pub documents: BTreeMap<DocumentType, DocumentDeclaration>,
}

/// Declarations accept both `"select": "main"` and `"select": ["main"]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    fetch: String,
    #[serde(default)]
    select: Option<OneOrMany>,
    #[serde(default)]
    remove: Option<OneOrMany>,
    #[serde(default)]
    filter: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawService {
    #[serde(default)]
    name: Option<String>,
    documents: BTreeMap<String, RawDocument>,
}

fn declaration_error(path: &Path, detail: impl Into<String>) -> TrackerError {
    TrackerError::Declarations {
        path: path.display().to_string(),
        detail: detail.into(),
    }
}

/// Load every `<serviceId>.json` in `path`. The whole set is validated up
/// front: selectors must parse and referenced filter names must exist, so a
/// bad declaration fails `init` instead of a worker mid-batch.
pub fn load_declarations(
    path: &Path,
) -> Result<BTreeMap<ServiceId, ServiceDeclaration>, TrackerError> {
    let entries = std::fs::read_dir(path).map_err(|err| TrackerError::io(path, err))?;

    let mut files: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    files.sort();

    let mut services = BTreeMap::new();
    for file in files {
        let service = load_service(&file)?;
        services.insert(service.id.clone(), service);
    }

    Ok(services)
}

fn load_service(path: &Path) -> Result<ServiceDeclaration, TrackerError> {
    let id = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| declaration_error(path, "file name is not valid UTF-8"))?
        .to_string();

    let contents = std::fs::read_to_string(path).map_err(|err| TrackerError::io(path, err))?;
    let raw: RawService = serde_json::from_str(&contents)
        .map_err(|err| declaration_error(path, err.to_string()))?;

    let mut documents = BTreeMap::new();
    for (document_type, raw_document) in raw.documents {
        let declaration = DocumentDeclaration {
            location: raw_document.fetch,
            content_selectors: raw_document
                .select
                .map(OneOrMany::into_vec)
                .unwrap_or_default(),
            noise_selectors: raw_document
                .remove
                .map(OneOrMany::into_vec)
                .unwrap_or_default(),
            filter_names: raw_document.filter,
        };
        validate(path, &document_type, &declaration)?;
        documents.insert(document_type, declaration);
    }

    Ok(ServiceDeclaration {
        name: raw.name.unwrap_or_else(|| id.clone()),
        id,
        documents,
    })
}

fn validate(
    path: &Path,
    document_type: &str,
    declaration: &DocumentDeclaration,
) -> Result<(), TrackerError> {
    for selector in declaration
        .content_selectors
        .iter()
        .chain(&declaration.noise_selectors)
    {
        if scraper::Selector::parse(selector).is_err() {
            return Err(declaration_error(
                path,
                format!("{document_type}: invalid CSS selector `{selector}`"),
            ));
        }
    }

    for name in &declaration.filter_names {
        if !filter::transform_exists(name) {
            return Err(declaration_error(
                path,
                format!("{document_type}: unknown filter transform `{name}`"),
            ));
        }
    }

    Ok(())
}
