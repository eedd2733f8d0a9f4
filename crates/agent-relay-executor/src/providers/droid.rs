//! Factory Droid (`droid exec --output-format stream-json`).

use serde_json::Value;

use crate::provider::{
    ArgsContext, ProviderEvent, ProviderSpec, str_field, text_status, tool_status,
};

pub static SPEC: ProviderSpec = ProviderSpec {
    id: "droid",
    name: "Factory Droid",
    binary: "droid",
    install_hint: "curl -fsSL https://app.factory.ai/cli | sh",
    supports_undo: false,
    build_args,
    map_event,
};

fn build_args(ctx: &ArgsContext<'_>) -> Vec<String> {
    let mut args: Vec<String> = ["exec", "--output-format", "stream-json"]
        .into_iter()
        .map(String::from)
        .collect();
    let level = match ctx.options.auto_level.as_deref() {
        Some(level @ ("low" | "medium" | "high")) => level,
        Some("full" | "yolo" | "bypass") => "high",
        _ => "medium",
    };
    args.extend(["--auto".to_string(), level.to_string()]);
    if let Some(model) = &ctx.options.model {
        args.extend(["--model".to_string(), model.clone()]);
    }
    if let Some(thread) = ctx.resume {
        args.extend(["--session-id".to_string(), thread.to_string()]);
    }
    args
}

fn map_event(event: &Value) -> Vec<ProviderEvent> {
    match str_field(event, "type") {
        Some("system") if str_field(event, "subtype") == Some("init") => {
            str_field(event, "session_id")
                .map(|id| vec![ProviderEvent::ThreadId(id.to_string())])
                .unwrap_or_default()
        }
        Some("message") if str_field(event, "role") == Some("assistant") => {
            str_field(event, "text")
                .and_then(text_status)
                .into_iter()
                .collect()
        }
        Some("tool_call") => vec![tool_status(str_field(event, "toolName").unwrap_or("tool"))],
        Some("completion") => vec![ProviderEvent::Completed],
        Some("error") => vec![ProviderEvent::Error(
            str_field(event, "message")
                .unwrap_or("Factory Droid failed")
                .to_string(),
        )],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use agent_relay_core::RunOptions;
    use serde_json::json;

    use super::*;

    #[test]
    fn autonomy_levels_map_to_auto_flag() {
        let args = SPEC.args(&RunOptions::default(), None);
        assert!(args.windows(2).any(|w| w == ["--auto", "medium"]));

        let options = RunOptions {
            auto_level: Some("yolo".into()),
            ..RunOptions::default()
        };
        let args = SPEC.args(&options, Some("d-5"));
        assert!(args.windows(2).any(|w| w == ["--auto", "high"]));
        assert!(args.windows(2).any(|w| w == ["--session-id", "d-5"]));
    }

    #[test]
    fn maps_tool_calls_and_completion() {
        assert_eq!(
            map_event(&json!({"type": "tool_call", "toolName": "Edit"})),
            vec![ProviderEvent::Status("Using Edit…".into())]
        );
        assert_eq!(
            map_event(&json!({"type": "completion", "finalText": "done", "session_id": "d-5"})),
            vec![ProviderEvent::Completed]
        );
    }
}
