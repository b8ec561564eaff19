// Application-facing wire messages: watch frames, log lines, exec messages.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TelemetryError;
use crate::models::k8s::{EventAction, OwnerReference, ResourceEvent};

// ── namespace watch ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ResourceFrame {
    #[serde(rename = "type")]
    event_type: Option<String>,
    kind: String,
    ns: Option<String>,
    name: String,
    status: Option<String>,
    containers: Option<Vec<String>>,
    image: Option<String>,
    metadata: Option<FrameMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameMetadata {
    labels: Option<HashMap<String, String>>,
    owner_references: Option<Vec<OwnerReference>>,
    creation_timestamp: Option<String>,
}

/// Decodes one watch frame into a [`ResourceEvent`] tagged with `namespace`,
/// the namespace of the connection it arrived on.
pub fn decode_resource_frame(text: &str, namespace: &str) -> Result<ResourceEvent, TelemetryError> {
    let raw: serde_json::Value =
        serde_json::from_str(text).map_err(|e| TelemetryError::MalformedFrame(e.to_string()))?;
    let frame: ResourceFrame = serde_json::from_value(raw.clone())
        .map_err(|e| TelemetryError::MalformedFrame(e.to_string()))?;

    if frame.kind.is_empty() || frame.name.is_empty() {
        return Err(TelemetryError::MalformedFrame(
            "frame is missing kind or name".to_string(),
        ));
    }

    let action = match frame.event_type.as_deref() {
        None => EventAction::Upsert,
        Some(t) if t.eq_ignore_ascii_case("ADDED") || t.eq_ignore_ascii_case("MODIFIED") => {
            EventAction::Upsert
        }
        Some(t) if t.eq_ignore_ascii_case("DELETED") => EventAction::Delete,
        Some(other) => {
            return Err(TelemetryError::MalformedFrame(format!(
                "unsupported event type {other:?}"
            )))
        }
    };

    if let Some(ns) = frame.ns.as_deref() {
        if ns != namespace {
            log::debug!("watch: frame for {ns:?} arrived on {namespace:?} watch, keeping {namespace:?}");
        }
    }

    let metadata = frame.metadata.unwrap_or_default();
    let creation_timestamp = metadata
        .creation_timestamp
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc));
    let image = frame.image.or_else(|| {
        raw.pointer("/spec/containers/0/image")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    });

    Ok(ResourceEvent {
        action,
        kind: frame.kind,
        namespace: namespace.to_string(),
        name: frame.name,
        status: frame.status.unwrap_or_default(),
        containers: frame.containers.unwrap_or_default(),
        labels: metadata.labels.unwrap_or_default(),
        owner_references: metadata.owner_references.unwrap_or_default(),
        creation_timestamp,
        image,
        raw,
    })
}

// ── log stream ────────────────────────────────────────────────────────────────

/// Strips the line terminator a log frame may carry.
pub fn decode_log_line(text: &str) -> &str {
    text.trim_end_matches(['\r', '\n'])
}

// ── exec ──────────────────────────────────────────────────────────────────────

/// Client → server exec message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecClientMessage {
    Stdin { data: String },
    Resize { cols: u16, rows: u16 },
}

impl ExecClientMessage {
    pub fn encode(&self) -> String {
        // Serializing a plain enum of strings and integers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Server → client exec message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecServerMessage {
    Stdout { data: String },
}

pub fn decode_exec_message(text: &str) -> Result<ExecServerMessage, TelemetryError> {
    serde_json::from_str(text).map_err(|e| TelemetryError::MalformedFrame(e.to_string()))
}
