use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::scheduler::template;

const DEFAULT_MAX_PENDING: usize = 10_000;

/// Runtime settings of a dispatcher instance.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Root of the job tree; each job gets `{root}/{id}/`.
    pub root: PathBuf,
    /// Number of worker slots, fixed for the dispatcher's lifetime.
    pub workers: usize,
    /// Maximum number of queued (not yet dispatched) jobs.
    pub max_pending: usize,
    /// Kill commands running longer than this. `None` lets them run forever.
    pub job_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("jobs"),
            workers: 1,
            max_pending: DEFAULT_MAX_PENDING,
            job_timeout: None,
        }
    }
}

impl DispatcherConfig {
    pub fn new(root: impl Into<PathBuf>, workers: usize) -> Self {
        Self {
            root: root.into(),
            workers,
            ..Default::default()
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(DispatchError::Config(
                "workers must be greater than 0".to_string(),
            ));
        }
        if self.max_pending == 0 {
            return Err(DispatchError::Config(
                "max_pending must be greater than 0".to_string(),
            ));
        }
        if self.root.as_os_str().is_empty() {
            return Err(DispatchError::Config("root cannot be empty".to_string()));
        }
        if self.job_timeout.is_some_and(|t| t.is_zero()) {
            return Err(DispatchError::Config(
                "job timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Kind of value an input slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InputKind {
    Str,
    Num,
    File,
    Folder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    /// Placeholder used in the command, e.g. `INPUT1`.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub kind: InputKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
}

impl ToolSpec {
    /// Number of inputs that expect an uploaded file.
    pub fn n_files(&self) -> usize {
        self.inputs
            .iter()
            .filter(|i| i.kind == InputKind::File)
            .count()
    }

    /// Check submitted form fields and upload slot names against the declared inputs.
    pub fn check_inputs(
        &self,
        fields: &BTreeMap<String, String>,
        upload_slots: &BTreeSet<String>,
    ) -> Result<()> {
        for name in fields.keys().chain(upload_slots.iter()) {
            if !self.inputs.iter().any(|i| &i.id == name) {
                return Err(DispatchError::InvalidInput {
                    input: name.clone(),
                    reason: "not declared by this tool".to_string(),
                });
            }
        }

        for input in &self.inputs {
            match input.kind {
                InputKind::File => {
                    if !upload_slots.contains(&input.id) {
                        return Err(DispatchError::MissingInput(input.id.clone()));
                    }
                }
                InputKind::Num => {
                    let value = fields
                        .get(&input.id)
                        .ok_or_else(|| DispatchError::MissingInput(input.id.clone()))?;
                    if value.trim().parse::<f64>().is_err() {
                        return Err(DispatchError::InvalidInput {
                            input: input.id.clone(),
                            reason: format!("{:?} is not a number", value),
                        });
                    }
                }
                InputKind::Str | InputKind::Folder => {
                    if !fields.contains_key(&input.id) {
                        return Err(DispatchError::MissingInput(input.id.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Tool-server configuration: where jobs live, how many workers run them and
/// which tools can be submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub directory: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_timeout_secs: Option<u64>,
    /// family -> title -> tool
    #[serde(default)]
    pub tools: BTreeMap<String, BTreeMap<String, ToolSpec>>,
}

fn default_workers() -> usize {
    1
}

impl ServerConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: ServerConfig =
            serde_json::from_str(text).map_err(|e| DispatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DispatchError::Config("name cannot be empty".to_string()));
        }
        if self.directory.as_os_str().is_empty() {
            return Err(DispatchError::Config(
                "directory cannot be empty".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(DispatchError::Config(
                "workers must be greater than 0".to_string(),
            ));
        }

        for (family, tools) in &self.tools {
            for (title, tool) in tools {
                let tool_name = format!("{}/{}", family, title);
                if tool.command.trim().is_empty() {
                    return Err(DispatchError::Config(format!(
                        "tool {} has an empty command",
                        tool_name
                    )));
                }
                let mut seen = BTreeSet::new();
                for input in &tool.inputs {
                    if !template::is_placeholder(&input.id) {
                        return Err(DispatchError::Config(format!(
                            "tool {} input {:?} must look like INPUT<n>",
                            tool_name, input.id
                        )));
                    }
                    if !seen.insert(input.id.as_str()) {
                        return Err(DispatchError::Config(format!(
                            "tool {} declares input {} twice",
                            tool_name, input.id
                        )));
                    }
                }
                for used in template::placeholders(&tool.command) {
                    if !seen.contains(used.as_str()) {
                        return Err(DispatchError::Config(format!(
                            "tool {} command uses undeclared input {}",
                            tool_name, used
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Look up a tool by `family/title`.
    pub fn tool(&self, name: &str) -> Result<&ToolSpec> {
        let (family, title) = name
            .split_once('/')
            .ok_or_else(|| DispatchError::UnknownTool(name.to_string()))?;
        self.tools
            .get(family)
            .and_then(|tools| tools.get(title))
            .ok_or_else(|| DispatchError::UnknownTool(name.to_string()))
    }

    /// True if any tool takes a file upload.
    pub fn has_file_input(&self) -> bool {
        self.tools
            .values()
            .flat_map(|tools| tools.values())
            .any(|tool| tool.n_files() > 0)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            root: self.directory.clone(),
            workers: self.workers,
            max_pending: DEFAULT_MAX_PENDING,
            job_timeout: self.job_timeout_secs.map(Duration::from_secs),
        }
    }
}
