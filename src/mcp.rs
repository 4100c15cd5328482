//! MCP server implementation using `rmcp`.
//!
//! Registers the Session Manager's full operation set as MCP tools and
//! translates every result into the fixed success/error response envelope.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::config::Language;
use crate::error::SandboxError;
use crate::session::engine::ExecuteLimits;
use crate::session::SessionManager;

/// MCP server fronting the [`SessionManager`].
#[derive(Clone)]
pub struct SandboxServer {
    sessions: Arc<SessionManager>,
    tool_router: ToolRouter<Self>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateSessionParams {
    #[schemars(description = "Idle timeout override for this session, in seconds")]
    pub timeout_seconds: Option<u64>,
    #[schemars(description = "Interpreter language: 'python' (one-shot) or 'r' (persistent)")]
    pub language: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListSessionsParams {
    #[schemars(description = "Include sessions past the idle timeout in the response")]
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CloseSessionParams {
    pub id: String,
    #[schemars(description = "Close even if the session was used within the idle timeout")]
    pub force: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteLimitsParams {
    pub max_duration_seconds: Option<u64>,
    pub max_output_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteInSessionParams {
    pub id: String,
    pub code: String,
    pub limits: Option<ExecuteLimitsParams>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListSessionFilesParams {
    pub id: String,
    #[serde(default = "default_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadSessionFileParams {
    pub id: String,
    pub path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteSessionFileParams {
    pub id: String,
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InstallPackageParams {
    pub id: String,
    pub package_name: String,
    pub source: Option<String>,
}

fn default_path() -> String {
    ".".to_string()
}

fn parse_language(raw: Option<&str>) -> Result<Language, SandboxError> {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        None | Some("python") => Ok(Language::Python),
        Some("r") => Ok(Language::R),
        Some(other) => Err(SandboxError::InvalidArgument(format!(
            "unknown language '{other}', expected 'python' or 'r'"
        ))),
    }
}

/// Wrap a successful payload in the `{"success": true, ...}` envelope.
fn ok_envelope(value: serde_json::Value) -> CallToolResult {
    let mut body = json!({ "success": true });
    if let (Some(body_map), Some(value_map)) = (body.as_object_mut(), value.as_object()) {
        body_map.extend(value_map.clone());
    }
    CallToolResult::success(vec![Content::text(body.to_string())])
}

/// Wrap a failure in the `{"success": false, "error": {...}}` envelope.
fn err_envelope(err: &SandboxError) -> CallToolResult {
    let body = json!({
        "success": false,
        "error": {
            "code": err.code(),
            "message": err.to_string(),
            "retryable": err.retryable(),
        }
    });
    CallToolResult::error(vec![Content::text(body.to_string())])
}

#[tool_router]
impl SandboxServer {
    #[must_use]
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Create a new session and its backing container")]
    async fn create_session(
        &self,
        Parameters(params): Parameters<CreateSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let language = match parse_language(params.language.as_deref()) {
            Ok(l) => l,
            Err(e) => return Ok(err_envelope(&e)),
        };
        let timeout_override = params.timeout_seconds.map(std::time::Duration::from_secs);

        match self.sessions.allocate(language, timeout_override).await {
            Ok(summary) => {
                info!(session = %summary.id, "session created");
                Ok(ok_envelope(json!({
                    "id": summary.id,
                    "created_at": summary.created_at,
                    "last_used_at": summary.last_used_at,
                    "host_port": summary.host_port,
                })))
            }
            Err(e) => Ok(err_envelope(&e)),
        }
    }

    #[tool(description = "List live sessions")]
    async fn list_sessions(
        &self,
        Parameters(params): Parameters<ListSessionsParams>,
    ) -> Result<CallToolResult, McpError> {
        let summaries = self.sessions.list(params.include_inactive).await;
        let sessions: Vec<_> = summaries
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "created_at": s.created_at,
                    "last_used_at": s.last_used_at,
                    "host_port": s.host_port,
                })
            })
            .collect();
        Ok(ok_envelope(json!({
            "sessions": sessions,
            "count": sessions.len(),
        })))
    }

    #[tool(description = "Close a session and remove its container")]
    async fn close_session(
        &self,
        Parameters(params): Parameters<CloseSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .sessions
            .close(&params.id, params.force.unwrap_or(false))
            .await
        {
            Ok(()) => Ok(ok_envelope(json!({ "message": "session closed" }))),
            Err(e) => Ok(err_envelope(&e)),
        }
    }

    #[tool(description = "Execute code inside a session")]
    async fn execute_in_session(
        &self,
        Parameters(params): Parameters<ExecuteInSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let limits = params.limits.map(|l| ExecuteLimits {
            max_duration_seconds: l.max_duration_seconds,
            max_output_bytes: l.max_output_bytes,
        });

        match self.sessions.execute(&params.id, &params.code, limits).await {
            Ok(outcome) => Ok(ok_envelope(json!({
                "output": outcome.output,
                "result": outcome.success,
                "meta": {
                    "elapsed_seconds": outcome.elapsed_seconds,
                    "output_truncated": outcome.output_truncated,
                }
            }))),
            Err(e) => Ok(err_envelope(&e)),
        }
    }

    #[tool(description = "List files in a session's workspace")]
    async fn list_session_files(
        &self,
        Parameters(params): Parameters<ListSessionFilesParams>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .sessions
            .list_session_files(&params.id, &params.path)
            .await
        {
            Ok(entries) => {
                let files: Vec<_> = entries
                    .iter()
                    .map(|e| {
                        json!({
                            "name": e.name,
                            "is_dir": e.is_dir,
                            "path": e.path,
                        })
                    })
                    .collect();
                Ok(ok_envelope(json!({ "files": files })))
            }
            Err(e) => Ok(err_envelope(&e)),
        }
    }

    #[tool(description = "Read a file out of a session's workspace")]
    async fn read_session_file(
        &self,
        Parameters(params): Parameters<ReadSessionFileParams>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .sessions
            .read_session_file(&params.id, &params.path)
            .await
        {
            Ok(content) => Ok(ok_envelope(json!({
                "content": content.content,
                "is_base64": content.is_base64,
            }))),
            Err(e) => Ok(err_envelope(&e)),
        }
    }

    #[tool(description = "Write a file into a session's workspace")]
    async fn write_session_file(
        &self,
        Parameters(params): Parameters<WriteSessionFileParams>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .sessions
            .write_session_file(&params.id, &params.path, params.content.as_bytes())
            .await
        {
            Ok(()) => Ok(ok_envelope(json!({ "message": "file written" }))),
            Err(e) => Ok(err_envelope(&e)),
        }
    }

    #[tool(description = "Install a package inside a session's container")]
    async fn install_package(
        &self,
        Parameters(params): Parameters<InstallPackageParams>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .sessions
            .install_package(&params.id, &params.package_name, params.source.as_deref())
            .await
        {
            Ok(outcome) => Ok(ok_envelope(json!({
                "output": outcome.output,
                "exit_code": outcome.exit_code,
            }))),
            Err(e) => Ok(err_envelope(&e)),
        }
    }
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "sandbox-session-mcp".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Manage sandboxed code-execution sessions backed by isolated containers.\n\
                 Use create_session to start one, execute_in_session to run code, \
                 list/read/write_session_file(s) to move files in and out, and \
                 close_session to tear it down."
                    .to_string(),
            ),
        }
    }
}

/// Serve the sandbox server over stdio.
pub async fn serve_stdio(sessions: Arc<SessionManager>) -> anyhow::Result<()> {
    let server = SandboxServer::new(sessions);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::runtime::fake::FakeAdapter;
    use std::collections::HashMap;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            idle_timeout: Duration::from_secs(300),
            max_sessions: 5,
            image_name: "sandbox-runtime:latest".to_string(),
            runtime_endpoint: "unix:///var/run/docker.sock".to_string(),
            per_session: crate::config::ResourceCaps {
                memory_bytes: 512 * 1024 * 1024,
                cpu_quota_micros: 100_000,
            },
            tmpfs_sizes: HashMap::new(),
            workspace_root: None,
            env_passthrough: HashMap::new(),
            log_level: "info".to_string(),
            reaper_interval: Duration::from_secs(30),
            max_file_bytes: 10 * 1024 * 1024,
            package_install_network: false,
        }
    }

    fn test_server() -> SandboxServer {
        let runtime = Arc::new(FakeAdapter::new(vec!["sandbox-runtime:latest".to_string()]));
        let manager = Arc::new(SessionManager::new(Arc::new(test_config()), runtime));
        SandboxServer::new(manager)
    }

    #[tokio::test]
    async fn create_then_close_round_trips() {
        let server = test_server();

        let created = server
            .create_session(Parameters(CreateSessionParams {
                timeout_seconds: None,
                language: None,
            }))
            .await
            .unwrap();
        assert!(!created.is_error.unwrap_or(false));

        // Fetch the id through the registry directly rather than parsing the
        // MCP content block, to avoid coupling this test to `rmcp`'s content
        // representation.
        let id = server.sessions.list(true).await[0].id.clone();

        let closed = server
            .close_session(Parameters(CloseSessionParams {
                id,
                force: None,
            }))
            .await
            .unwrap();
        assert!(!closed.is_error.unwrap_or(false));
    }

    #[tokio::test]
    async fn close_unknown_session_is_envelope_error() {
        let server = test_server();
        let closed = server
            .close_session(Parameters(CloseSessionParams {
                id: "does-not-exist".to_string(),
                force: None,
            }))
            .await
            .unwrap();
        assert!(closed.is_error.unwrap_or(false));
    }

    #[tokio::test]
    async fn unknown_language_is_invalid_argument() {
        let server = test_server();
        let created = server
            .create_session(Parameters(CreateSessionParams {
                timeout_seconds: None,
                language: Some("cobol".to_string()),
            }))
            .await
            .unwrap();
        assert!(created.is_error.unwrap_or(false));
    }
}
