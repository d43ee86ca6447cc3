//! Scripted connection for exercising the scheduler, router, and aggregator
//! without child processes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, GetPromptRequestParams, GetPromptResult,
    InitializeResult, Prompt, ReadResourceResult, Resource, Tool,
};

use super::{Connection, TransportError};

/// A connection whose answers are scripted up front.
#[derive(Default)]
pub struct ScriptedConnection {
    /// Tools returned by `list_tools`.
    pub tools: Mutex<Vec<Tool>>,
    /// Resources returned by `list_resources`.
    pub resources: Mutex<Vec<Resource>>,
    /// Prompts returned by `list_prompts`.
    pub prompts: Mutex<Vec<Prompt>>,
    /// When set, every call fails with a connection-closed error.
    pub broken: AtomicBool,
    /// Number of `call_tool` invocations served.
    pub calls: AtomicU64,
    /// Whether `close` ran.
    pub closed: AtomicBool,
}

impl ScriptedConnection {
    /// A connection exposing the given tool names.
    pub fn with_tools(names: &[&str]) -> Self {
        let conn = Self::default();
        let tools = names
            .iter()
            .map(|name| Tool::new(name.to_string(), "scripted", serde_json::Map::new()))
            .collect();
        *conn.tools.lock().unwrap() = tools;
        conn
    }

    /// Make every subsequent call fail as if the pipe broke.
    pub fn break_pipe(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.broken.load(Ordering::SeqCst) {
            Err(TransportError::closed("scripted pipe break"))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl Connection for ScriptedConnection {
    async fn list_tools(&self) -> Result<Vec<Tool>, TransportError> {
        self.check()?;
        Ok(self.tools.lock().unwrap().clone())
    }

    async fn call_tool(
        &self,
        params: CallToolRequestParams,
    ) -> Result<CallToolResult, TransportError> {
        self.check()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        let echo = params
            .arguments
            .as_ref()
            .and_then(|args| args.get("msg"))
            .and_then(|v| v.as_str())
            .unwrap_or("ok")
            .to_string();
        Ok(CallToolResult {
            content: vec![Content::text(echo)],
            structured_content: None,
            is_error: Some(false),
            meta: None,
        })
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, TransportError> {
        self.check()?;
        Ok(self.resources.lock().unwrap().clone())
    }

    async fn read_resource(&self, _uri: &str) -> Result<ReadResourceResult, TransportError> {
        self.check()?;
        Ok(ReadResourceResult { contents: vec![] })
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>, TransportError> {
        self.check()?;
        Ok(self.prompts.lock().unwrap().clone())
    }

    async fn get_prompt(
        &self,
        _params: GetPromptRequestParams,
    ) -> Result<GetPromptResult, TransportError> {
        self.check()?;
        Ok(GetPromptResult {
            description: None,
            messages: vec![],
        })
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.check()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn server_info(&self) -> Option<InitializeResult> {
        None
    }
}
