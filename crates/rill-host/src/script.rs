//! The script DSL executed by `POST execute`: a document of actions, pipes
//! and forks issued against this host.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use rill_core::{Message, Uri};

use crate::error::{HostError, HostResult};
use crate::host::Host;

/// A single request issued by a script.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptAction {
    pub verb: String,
    /// Path relative to the host root, query allowed.
    pub path: String,
    /// Opaque id echoed on the reply.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
}

/// One script step.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptCommand {
    /// Issue a single request.
    Action(ScriptAction),
    /// Feed each action's reply into the next; stop on the first
    /// non-success.
    Pipe(Vec<ScriptAction>),
    /// Run children and append each reply. Executes sequentially; callers
    /// must not rely on reply order inside a fork.
    Fork(Vec<ScriptCommand>),
}

/// Script document: `{"script": [command, …]}`. A root `config` document is
/// rewritten into a script that creates the configured service.
#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    pub script: Vec<ScriptCommand>,
}

/// Parse a script document, applying the `config` rewrite when needed.
pub fn parse(doc: &Value) -> HostResult<Script> {
    if let Some(config) = doc.get("config") {
        return Ok(Script {
            script: vec![ScriptCommand::Action(ScriptAction {
                verb: "POST".to_string(),
                path: "host/services".to_string(),
                id: None,
                headers: Map::new(),
                body: Some(config.clone()),
            })],
        });
    }
    serde_json::from_value(doc.clone())
        .map_err(|e| HostError::input(format!("malformed script document: {e}")))
}

/// Execute a script document against the host; returns `{"replies": […]}`.
pub async fn execute(host: &Arc<Host>, api_key: &str, doc: &Value) -> HostResult<Value> {
    let script = parse(doc)?;
    let mut replies = Vec::new();
    for command in &script.script {
        run_command(host, api_key, command, &mut replies).await?;
    }
    Ok(json!({ "replies": replies }))
}

async fn run_command(
    host: &Arc<Host>,
    api_key: &str,
    command: &ScriptCommand,
    replies: &mut Vec<Value>,
) -> HostResult<()> {
    match command {
        ScriptCommand::Action(action) => {
            let (entry, _) = run_action(host, api_key, action, None).await?;
            replies.push(entry);
        }
        ScriptCommand::Pipe(actions) => {
            let mut piped: Option<Value> = None;
            for action in actions {
                let (entry, reply) = run_action(host, api_key, action, piped.take()).await?;
                let ok = reply.is_success();
                replies.push(entry);
                if !ok {
                    break;
                }
                piped = reply.document();
            }
        }
        ScriptCommand::Fork(commands) => {
            for command in commands {
                Box::pin(run_command(host, api_key, command, replies)).await?;
            }
        }
    }
    Ok(())
}

async fn run_action(
    host: &Arc<Host>,
    api_key: &str,
    action: &ScriptAction,
    piped_body: Option<Value>,
) -> HostResult<(Value, Message)> {
    let target = Uri::parse(&format!("local://{}/{}", host.guid(), action.path))
        .map_err(|e| HostError::input(format!("bad action path '{}': {e}", action.path)))?;

    let mut request = Message::request();
    for (name, value) in &action.headers {
        if let Some(value) = value.as_str() {
            request.headers.add(name, value);
        }
    }
    if let Some(body) = piped_body.or_else(|| action.body.clone()) {
        request.set_document(body);
    }

    // Scripts run with the caller's (already verified) api key so nested
    // administration actions keep working.
    let plug = crate::plug::Plug::new(host.router(), target)
        .with_header(rill_core::headers::API_KEY, api_key);
    let reply = plug.invoke(&action.verb, request).await?;

    let mut entry = Map::new();
    if let Some(id) = &action.id {
        entry.insert("id".to_string(), Value::String(id.clone()));
    }
    entry.insert("status".to_string(), json!(reply.status));
    if let Some(doc) = reply.document() {
        entry.insert("body".to_string(), doc);
    }
    Ok((Value::Object(entry), reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_action_pipe_and_fork() {
        let doc = json!({
            "script": [
                { "action": { "verb": "GET", "path": "host/version", "id": "v" } },
                { "pipe": [
                    { "verb": "GET", "path": "host/status" },
                    { "verb": "POST", "path": "host/convert" }
                ]},
                { "fork": [
                    { "action": { "verb": "GET", "path": "host/test" } }
                ]}
            ]
        });
        let script = parse(&doc).unwrap();
        assert_eq!(script.script.len(), 3);
        assert!(matches!(script.script[0], ScriptCommand::Action(_)));
        assert!(matches!(script.script[1], ScriptCommand::Pipe(_)));
        assert!(matches!(script.script[2], ScriptCommand::Fork(_)));
    }

    #[test]
    fn config_root_rewrites_to_service_creation() {
        let doc = json!({ "config": { "path": "echo", "class": "echo-service" } });
        let script = parse(&doc).unwrap();
        match &script.script[0] {
            ScriptCommand::Action(action) => {
                assert_eq!(action.verb, "POST");
                assert_eq!(action.path, "host/services");
                assert_eq!(action.body.as_ref().unwrap()["path"], "echo");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn malformed_script_is_input_error() {
        let doc = json!({ "script": [{ "unknown": {} }] });
        assert!(parse(&doc).is_err());
    }
}
