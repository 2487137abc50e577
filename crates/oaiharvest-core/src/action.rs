//! Action pipeline applied to every harvested record.
//!
//! Stages take records by value and return the records that continue down
//! the pipeline. A failing stage aborts the rest of the pipeline for that
//! batch only.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use crate::error::AppError;
use crate::models::{MetadataFormat, MetadataRecord, RecordContent};
use crate::pool::ResourcePool;

/// One pipeline stage.
pub trait Action: Send + fmt::Debug + fmt::Display {
    fn perform(&mut self, records: Vec<MetadataRecord>) -> Result<Vec<MetadataRecord>, AppError>;

    /// A fresh instance for another pool slot.
    fn box_clone(&self) -> Box<dyn Action>;
}

/// Replaces an enveloped record by the payload(s) of its `metadata` element.
#[derive(Debug, Clone, Default)]
pub struct StripAction;

impl Action for StripAction {
    fn perform(&mut self, records: Vec<MetadataRecord>) -> Result<Vec<MetadataRecord>, AppError> {
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            if !record.envelope {
                out.push(record);
                continue;
            }

            let tree = record.content.to_tree()?;
            let envelopes = if tree.local_name() == "record" {
                vec![&tree]
            } else {
                tree.descendants("record")
            };

            let before = out.len();
            for envelope in envelopes {
                let Some(payload) = envelope.child("metadata").and_then(|m| m.elements().next())
                else {
                    continue;
                };
                let identifier = envelope
                    .find(&["header", "identifier"])
                    .map(|id| id.text().trim().to_string())
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| record.identifier.clone());
                out.push(MetadataRecord {
                    identifier,
                    prefix: record.prefix.clone(),
                    origin: record.origin.clone(),
                    content: RecordContent::Tree(payload.clone()),
                    envelope: false,
                    list: false,
                });
            }

            if out.len() == before {
                tracing::warn!(identifier = %record.identifier, "No metadata found in envelope");
            }
        }
        Ok(out)
    }

    fn box_clone(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

impl fmt::Display for StripAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("strip")
    }
}

/// Splits a list record into one enveloped record per `record` element.
///
/// Deleted records are dropped; a record without a header identifier is
/// named `rec-<n>` after its position in the list.
#[derive(Debug, Clone, Default)]
pub struct SplitAction;

impl Action for SplitAction {
    fn perform(&mut self, records: Vec<MetadataRecord>) -> Result<Vec<MetadataRecord>, AppError> {
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            if !record.list {
                out.push(record);
                continue;
            }

            let tree = record.content.to_tree()?;
            for (n, element) in tree.descendants("record").into_iter().enumerate() {
                let header = element.child("header");
                if header.and_then(|h| h.attr("status")) == Some("deleted") {
                    continue;
                }
                let identifier = header
                    .and_then(|h| h.child_text("identifier"))
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("rec-{n}"));
                tracing::debug!(identifier = %identifier, "Split off record");
                out.push(MetadataRecord {
                    identifier,
                    prefix: record.prefix.clone(),
                    origin: record.origin.clone(),
                    content: RecordContent::Tree(element.clone()),
                    envelope: true,
                    list: false,
                });
            }
        }
        Ok(out)
    }

    fn box_clone(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

impl fmt::Display for SplitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("split")
    }
}

/// Writes each record to `<dir>[/<provider>]/<identifier><suffix>`.
#[derive(Debug, Clone)]
pub struct SaveAction {
    pub dir: PathBuf,
    pub suffix: String,
    /// Adds a subdirectory per provider.
    pub group_by_provider: bool,
}

impl SaveAction {
    pub fn new(dir: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            suffix: suffix.into(),
            group_by_provider: false,
        }
    }

    pub fn grouped(mut self, group_by_provider: bool) -> Self {
        self.group_by_provider = group_by_provider;
        self
    }

    /// Target path of a record.
    pub fn location(&self, record: &MetadataRecord) -> PathBuf {
        let mut path = self.dir.clone();
        if self.group_by_provider {
            path.push(file_name(&record.origin));
        }
        path.push(format!("{}{}", file_name(&record.identifier), self.suffix));
        path
    }
}

impl Action for SaveAction {
    fn perform(&mut self, records: Vec<MetadataRecord>) -> Result<Vec<MetadataRecord>, AppError> {
        for record in &records {
            let path = self.location(record);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    AppError::ActionError(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
            let bytes = record.content.to_bytes()?;
            fs::write(&path, bytes)
                .map_err(|e| AppError::ActionError(format!("cannot write {}: {e}", path.display())))?;
            tracing::debug!(path = %path.display(), identifier = %record.identifier, "Saved record");
        }
        Ok(records)
    }

    fn box_clone(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

impl fmt::Display for SaveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "save to {}", self.dir.display())?;
        if !self.suffix.is_empty() {
            write!(f, " using suffix {}", self.suffix)?;
        }
        Ok(())
    }
}

/// File-system safe form of a name: every run of characters other than
/// ASCII letters, digits and `_` becomes a single `_`.
pub fn file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// An input-format selector and the stages applied to matching records.
///
/// Every stage is a pool of instances so workers can run the sequence
/// concurrently.
#[derive(Debug)]
pub struct ActionSequence {
    format: MetadataFormat,
    stages: Vec<ResourcePool<Box<dyn Action>>>,
}

impl ActionSequence {
    /// Builds the sequence with `pool_size` instances per stage.
    pub fn new(format: MetadataFormat, actions: Vec<Box<dyn Action>>, pool_size: usize) -> Self {
        let stages = actions
            .into_iter()
            .map(|action| {
                let name = action.to_string();
                let mut items: Vec<Box<dyn Action>> =
                    (1..pool_size.max(1)).map(|_| action.box_clone()).collect();
                items.push(action);
                ResourcePool::new(name, items)
            })
            .collect();
        Self { format, stages }
    }

    pub fn format(&self) -> &MetadataFormat {
        &self.format
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs one record through every stage.
    ///
    /// Returns `false` when a stage failed; the failure is logged and the
    /// remaining stages are skipped.
    pub async fn run(&self, record: MetadataRecord) -> bool {
        let identifier = record.identifier.clone();
        let mut records = vec![record];
        for stage in &self.stages {
            let mut action = match stage.checkout().await {
                Ok(action) => action,
                Err(e) => {
                    tracing::error!(identifier = %identifier, error = %e, "Pipeline stage unavailable");
                    return false;
                }
            };
            match action.perform(records) {
                Ok(next) => records = next,
                Err(e) => {
                    tracing::warn!(
                        identifier = %identifier,
                        action = %stage.name(),
                        error = %e,
                        "Pipeline stage failed"
                    );
                    return false;
                }
            }
        }
        true
    }
}

impl fmt::Display for ActionSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> [{}]", self.format, self.stage_names().join(", "))
    }
}
