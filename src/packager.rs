//! Bundle assembly.
//!
//! A bundle is `<dist_dir>/<run_id>.tar.gz`, built only from run store
//! records so it can be regenerated at any time after the run succeeded:
//!
//! | entry                          | contents                                      |
//! |--------------------------------|-----------------------------------------------|
//! | `manifest.json`                | run metadata, per-step statuses, artifact list |
//! | `provenance.json`              | prompt, tools, policy, model, documents, tool calls |
//! | `artifacts/<persona>/<name>`   | artifact payloads                             |
//! | `sbom.json`                    | `ecosystem:name==version` components          |
//! | `logs/commands.log`            | sandboxed command records                     |
//! | `logs/events.log`              | event timeline                                |
//! | `README.txt`                   | bundle notes                                  |

use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use pipewright_common::{EventType, PersonaOutput, RunState, RunStatus};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

use crate::errors::PackagingError;
use crate::sandbox::CommandRecord;
use crate::util::{sha256_hex, write_atomic};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BundleReport {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
    pub entries: Vec<String>,
}

pub struct Packager {
    dist_dir: PathBuf,
}

impl Packager {
    pub fn new(dist_dir: impl Into<PathBuf>) -> Self {
        Self {
            dist_dir: dist_dir.into(),
        }
    }

    pub fn bundle_path(&self, run_id: &str) -> PathBuf {
        self.dist_dir.join(format!("{}.tar.gz", run_id))
    }

    /// Build and atomically write the bundle for a succeeded run.
    pub fn package(&self, state: &RunState) -> Result<BundleReport, PackagingError> {
        let run = &state.run;
        if run.status != RunStatus::Succeeded {
            return Err(PackagingError::NotSucceeded {
                run_id: run.run_id.clone(),
                status: run.status,
            });
        }

        let entries = bundle_entries(state)?;
        let mtime = run
            .completed_at
            .unwrap_or(run.created_at)
            .timestamp()
            .max(0) as u64;
        let path = self.bundle_path(&run.run_id);
        let bytes = build_archive(&entries, mtime).map_err(|source| PackagingError::Write {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes).map_err(|source| PackagingError::Write {
            path: path.clone(),
            source,
        })?;

        let report = BundleReport {
            sha256: sha256_hex(&bytes),
            bytes: bytes.len() as u64,
            entries: entries.into_iter().map(|(name, _)| name).collect(),
            path,
        };
        info!(
            run_id = %run.run_id,
            path = %report.path.display(),
            bytes = report.bytes,
            "Bundle written"
        );
        Ok(report)
    }
}

fn to_pretty(what: &'static str, value: &Value) -> Result<Vec<u8>, PackagingError> {
    let mut bytes =
        serde_json::to_vec_pretty(value).map_err(|source| PackagingError::Encode { what, source })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Archive entries in their final order.
pub fn bundle_entries(state: &RunState) -> Result<Vec<(String, Vec<u8>)>, PackagingError> {
    let mut entries = vec![
        ("manifest.json".to_string(), to_pretty("manifest", &manifest(state))?),
        ("provenance.json".to_string(), to_pretty("provenance", &provenance(state))?),
    ];
    for artifact in &state.artifacts {
        entries.push((
            format!("artifacts/{}/{}", artifact.persona, artifact.name),
            to_pretty("artifact", &artifact.payload)?,
        ));
    }
    entries.push(("sbom.json".to_string(), to_pretty("sbom", &sbom(state))?));
    entries.push(("logs/commands.log".to_string(), commands_log(state).into_bytes()));
    entries.push(("logs/events.log".to_string(), events_log(state).into_bytes()));
    entries.push(("README.txt".to_string(), readme(state).into_bytes()));
    Ok(entries)
}

fn build_archive(entries: &[(String, Vec<u8>)], mtime: u64) -> std::io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        header.set_cksum();
        builder.append_data(&mut header, name, data.as_slice())?;
    }
    builder.into_inner()?.finish()
}

pub fn manifest(state: &RunState) -> Value {
    let run = &state.run;
    let steps: Vec<Value> = state
        .steps
        .iter()
        .map(|s| {
            json!({
                "sequence": s.sequence,
                "persona": s.persona,
                "attempt": s.attempt,
                "status": s.status,
                "error_kind": s.error_kind,
                "started_at": s.started_at,
                "completed_at": s.completed_at,
            })
        })
        .collect();
    let artifacts: Vec<Value> = state
        .artifacts
        .iter()
        .map(|a| {
            json!({
                "persona": a.persona,
                "name": a.name,
                "path": format!("artifacts/{}/{}", a.persona, a.name),
                "created_at": a.created_at,
            })
        })
        .collect();
    json!({
        "run_id": run.run_id,
        "status": run.status,
        "target_path": run.target_path,
        "model": run.config.model,
        "dry_run": run.config.dry_run,
        "created_at": run.created_at,
        "completed_at": run.completed_at,
        "generator": format!("pipewright {}", env!("CARGO_PKG_VERSION")),
        "steps": steps,
        "artifacts": artifacts,
    })
}

pub fn provenance(state: &RunState) -> Value {
    let config = &state.run.config;
    let documents: Vec<Value> = config
        .documents
        .iter()
        .map(|d| json!({ "path": d.path, "media_type": d.media_type, "sha256": d.sha256 }))
        .collect();
    let tool_call_ids: Vec<Value> = state
        .events_of(EventType::StepCompleted)
        .into_iter()
        .filter_map(|e| e.payload.as_ref())
        .filter_map(|p| p.get("tool_call_ids").and_then(Value::as_array))
        .flatten()
        .cloned()
        .collect();
    json!({
        "run_id": state.run.run_id,
        "prompt": config.prompt,
        "tools": config.tools,
        "policy": config.policy,
        "model": config.model,
        "fix_forward": config.fix_forward,
        "documents": documents,
        "tool_call_ids": tool_call_ids,
    })
}

/// Dependencies declared by the coding persona's scaffold.
pub fn sbom(state: &RunState) -> Value {
    let components: Vec<String> = state
        .artifacts
        .iter()
        .filter_map(|a| serde_json::from_value::<PersonaOutput>(a.payload.clone()).ok())
        .filter_map(|output| match output {
            PersonaOutput::Coding(scaffold) => Some(scaffold.dependencies),
            _ => None,
        })
        .flatten()
        .map(|d| d.coordinate())
        .collect();
    json!({
        "run_id": state.run.run_id,
        "generated_at": state.run.completed_at,
        "components": components,
    })
}

fn command_records(state: &RunState) -> Vec<CommandRecord> {
    state
        .events_of(EventType::CommandExecuted)
        .into_iter()
        .filter_map(|e| e.payload.clone())
        .filter_map(|p| serde_json::from_value(p).ok())
        .collect()
}

pub fn commands_log(state: &RunState) -> String {
    let records = command_records(state);
    if records.is_empty() {
        return "No commands were executed.\n".to_string();
    }
    let mut out = String::new();
    for record in records {
        out.push_str(&format!(
            "$ {}\noutcome: {}  exit_code: {}  duration_ms: {}\n",
            record.command,
            record.outcome.as_str(),
            record
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            record.duration_ms
        ));
        if let Some(reason) = &record.reason {
            out.push_str(&format!("reason: {}\n", reason));
        }
        if !record.stdout_tail.is_empty() {
            out.push_str(&format!("--- stdout (tail) ---\n{}\n", record.stdout_tail.trim_end()));
        }
        if !record.stderr_tail.is_empty() {
            out.push_str(&format!("--- stderr (tail) ---\n{}\n", record.stderr_tail.trim_end()));
        }
        out.push('\n');
    }
    out
}

/// Event timeline, minus the packaging events so a rebuild stays byte-identical.
pub fn events_log(state: &RunState) -> String {
    state
        .events
        .iter()
        .filter(|e| !matches!(e.event_type, EventType::Packaged | EventType::PackagingFailed))
        .map(|e| {
            format!(
                "{} {:<8} {:<20} {}\n",
                e.created_at.to_rfc3339(),
                e.severity.as_str(),
                e.event_type.as_str(),
                e.message
            )
        })
        .collect()
}

fn readme(state: &RunState) -> String {
    format!(
        "pipewright bundle for {run_id}\n\
         \n\
         manifest.json     run metadata, step statuses and artifact list\n\
         provenance.json   prompt, tool toggles, command policy, model and input digests\n\
         artifacts/        structured output of each persona\n\
         sbom.json         dependencies declared by the coding scaffold\n\
         logs/             sandboxed command records and the event timeline\n\
         \n\
         Workspace: {target}\n",
        run_id = state.run.run_id,
        target = state.run.target_path.display(),
    )
}

/// Read back the entry names of a bundle.
pub fn list_bundle(path: &Path) -> std::io::Result<Vec<String>> {
    let file = std::fs::File::open(path)?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}
