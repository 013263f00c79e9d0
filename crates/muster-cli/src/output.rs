//! JSON views printed to stdout.

use anyhow::Result;
use muster_mcp::{ConnectReport, ServerStatus};
use serde::Serialize;
use std::collections::BTreeMap;

/// One row of `muster servers`.
#[derive(Serialize)]
pub struct ServerView {
    #[serde(flatten)]
    pub status: ServerStatus,
    pub tools: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn server_views(
    statuses: Vec<ServerStatus>,
    report: &ConnectReport,
    tool_counts: &BTreeMap<String, usize>,
) -> Vec<ServerView> {
    statuses
        .into_iter()
        .map(|status| {
            let error = report
                .outcomes
                .get(&status.name)
                .and_then(|outcome| outcome.as_ref().err())
                .map(ToString::to_string);
            let tools = tool_counts.get(&status.name).copied().unwrap_or(0);
            ServerView {
                status,
                tools,
                error,
            }
        })
        .collect()
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
