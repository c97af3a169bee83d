//! Worker descriptors and the worker catalog.
//!
//! Workers can be declared inline in `conductor.yaml` or as one YAML file per
//! worker in a directory:
//!
//! ```yaml
//! name: "Worker_SNS"
//! description: "Searches social networks"
//! capabilities: ["sns.search"]
//! tools: ["sns.search", "sns.trending"]
//! transport:
//!   type: remote
//!   endpoint: "http://localhost:8101/step"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// How the dispatcher reaches a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerTransport {
    /// In-process handler, or a shell command fed the prompt on stdin
    Local {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    /// HTTP endpoint receiving the context packet as JSON
    Remote { endpoint: String },
}

impl Default for WorkerTransport {
    fn default() -> Self {
        WorkerTransport::Local { command: None }
    }
}

/// A specialist worker the engine can dispatch steps to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerDescriptor {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Capabilities this worker declares (ownership lives in the registry)
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Tool names, used as tool hints for steps synthesized for this worker
    #[serde(default)]
    pub tools: Vec<String>,

    #[serde(default)]
    pub transport: WorkerTransport,
}

impl WorkerDescriptor {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            capabilities: Vec::new(),
            tools: Vec::new(),
            transport: WorkerTransport::default(),
        }
    }

    pub fn remote(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            transport: WorkerTransport::Remote {
                endpoint: endpoint.into(),
            },
            ..Self::local(name)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Parse a worker descriptor from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse worker YAML: {}", e))
    }

    /// Load a worker descriptor from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read worker file '{}': {}", path, e))?;
        Self::from_yaml(&content)
    }

    pub fn card(&self) -> WorkerCard {
        WorkerCard {
            name: self.name.clone(),
            description: self.description.clone().unwrap_or_default(),
            capabilities: self.capabilities.clone(),
            tools: self.tools.clone(),
        }
    }
}

/// The catalog entry shown to workers in the context packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerCard {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub capabilities: Vec<String>,
    pub tools: Vec<String>,
}

/// Known workers, keyed by lowercase name.
#[derive(Debug, Clone, Default)]
pub struct WorkerCatalog {
    workers: BTreeMap<String, WorkerDescriptor>,
}

impl WorkerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = WorkerDescriptor>) -> Self {
        let mut catalog = Self::new();
        for descriptor in descriptors {
            catalog.insert(descriptor);
        }
        catalog
    }

    /// Add or replace a worker. Returns the previous descriptor with the same name.
    pub fn insert(&mut self, descriptor: WorkerDescriptor) -> Option<WorkerDescriptor> {
        self.workers
            .insert(descriptor.name.trim().to_lowercase(), descriptor)
    }

    /// Load all `.yaml`/`.yml` worker files from a directory.
    pub fn load_dir(&mut self, dir: &str) -> Result<usize, String> {
        let dir_path = Path::new(dir);
        if !dir_path.is_dir() {
            return Err(format!("Worker directory '{}' does not exist", dir));
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir_path)
            .map_err(|e| format!("Failed to read directory '{}': {}", dir, e))?
        {
            let entry = entry.map_err(|e| format!("Directory entry error: {}", e))?;
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if matches!(ext, "yaml" | "yml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut count = 0;
        for path in paths {
            let descriptor = WorkerDescriptor::from_file(path.to_str().unwrap_or(""))?;
            tracing::info!("[WorkerCatalog] Loaded worker: {}", descriptor.name);
            if self.insert(descriptor).is_some() {
                tracing::warn!("[WorkerCatalog] Worker file {:?} replaced an earlier definition", path);
            }
            count += 1;
        }
        Ok(count)
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&WorkerDescriptor> {
        self.workers.get(&name.trim().to_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Canonical spelling of a worker name.
    pub fn canonical_name(&self, name: &str) -> Option<&str> {
        self.get(name).map(|w| w.name.as_str())
    }

    pub fn names(&self) -> Vec<String> {
        self.workers.values().map(|w| w.name.clone()).collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &WorkerDescriptor> {
        self.workers.values()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn cards(&self) -> Vec<WorkerCard> {
        self.workers.values().map(WorkerDescriptor::card).collect()
    }

    /// First `limit` tool names of a worker.
    pub fn tool_hints_for(&self, name: &str, limit: usize) -> Vec<String> {
        self.get(name)
            .map(|w| w.tools.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any worker declares `capability` (case-insensitive).
    pub fn declares_capability(&self, capability: &str) -> bool {
        let wanted = capability.trim().to_lowercase();
        self.workers
            .values()
            .any(|w| w.capabilities.iter().any(|c| c.trim().to_lowercase() == wanted))
    }
}
