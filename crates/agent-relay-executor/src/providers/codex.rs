//! Codex (`codex exec --json`).
//!
//! Events are `thread.started`, `turn.*` and `item.*` records. The prompt
//! is read from stdin (`-`).

use serde_json::Value;

use crate::provider::{
    ArgsContext, ProviderEvent, ProviderSpec, str_field, text_status, tool_status, wants_full_auto,
};

pub static SPEC: ProviderSpec = ProviderSpec {
    id: "codex",
    name: "Codex",
    binary: "codex",
    install_hint: "npm install -g @openai/codex",
    supports_undo: true,
    build_args,
    map_event,
};

fn build_args(ctx: &ArgsContext<'_>) -> Vec<String> {
    let mut args: Vec<String> = ["exec", "--json", "--skip-git-repo-check"]
        .into_iter()
        .map(String::from)
        .collect();

    if let Some(model) = &ctx.options.model {
        args.extend(["--model".to_string(), model.clone()]);
    }

    match ctx.options.auto_level.as_deref() {
        _ if wants_full_auto(ctx.options) => {
            args.push("--dangerously-bypass-approvals-and-sandbox".into());
        }
        Some(sandbox @ ("read-only" | "workspace-write" | "danger-full-access")) => {
            args.extend(["--sandbox".to_string(), sandbox.to_string()]);
        }
        _ => args.push("--full-auto".into()),
    }

    if let Some(thread) = ctx.resume {
        args.extend(["resume".to_string(), thread.to_string()]);
    }
    args.push("-".into());
    args
}

fn map_event(event: &Value) -> Vec<ProviderEvent> {
    match str_field(event, "type") {
        Some("thread.started") => str_field(event, "thread_id")
            .map(|id| vec![ProviderEvent::ThreadId(id.to_string())])
            .unwrap_or_default(),
        Some("item.started") => event.get("item").and_then(started_item).into_iter().collect(),
        Some("item.completed") => event
            .get("item")
            .and_then(completed_item)
            .into_iter()
            .collect(),
        Some("turn.completed") => vec![ProviderEvent::Completed],
        Some("turn.failed") => {
            let reason = event
                .get("error")
                .and_then(|e| str_field(e, "message"))
                .unwrap_or("Codex turn failed");
            vec![ProviderEvent::Error(reason.to_string())]
        }
        Some("error") => {
            let reason = str_field(event, "message").unwrap_or("Codex reported an error");
            vec![ProviderEvent::Error(reason.to_string())]
        }
        _ => Vec::new(),
    }
}

fn started_item(item: &Value) -> Option<ProviderEvent> {
    match str_field(item, "type")? {
        "command_execution" => Some(ProviderEvent::Status(format!(
            "Running {}…",
            str_field(item, "command").unwrap_or("command")
        ))),
        "file_change" => Some(ProviderEvent::Status("Editing files…".into())),
        "mcp_tool_call" => Some(tool_status(str_field(item, "tool").unwrap_or("tool"))),
        "web_search" => Some(ProviderEvent::Status("Searching the web…".into())),
        _ => None,
    }
}

fn completed_item(item: &Value) -> Option<ProviderEvent> {
    match str_field(item, "type")? {
        "agent_message" | "reasoning" => str_field(item, "text").and_then(text_status),
        _ => None,
    }
}
