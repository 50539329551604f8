use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    schemars, tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt,
};

use autorules_core::{NewRule, RuleStore, RuleUpdate};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Environment variable naming the project root the rules live under.
const ROOT_ENV: &str = "AUTO_RULES_ROOT";
/// Directory under the root holding the rules document.
const RULES_DIR: &str = ".autorules";
/// File name of the rules document.
const RULES_FILE: &str = "rules.md";
/// Feedback recorded when add_code_edit is called without one.
const CODE_EDIT_FEEDBACK: &str = "code edit";

// --- Request types ---

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct AddRuleRequest {
    /// Unique rule name, used as the lookup key for later updates and deletes
    name: String,
    /// What the rule changes and when it should be applied
    description: String,
    /// Code snippet the rule replaces. May be empty for insert-style rules.
    original_code: String,
    /// Replacement snippet
    modified_code: String,
    /// Feedback that motivated the rule
    feedback: String,
    /// Tags for grouping and filtering, e.g. ["rust", "naming"]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct AddCodeEditRequest {
    /// Unique rule name
    name: String,
    /// What the edit changes and why
    description: String,
    /// Code before the edit
    original_code: String,
    /// Code after the edit
    modified_code: String,
    /// Feedback on the edit. Defaults to "code edit" when omitted.
    feedback: Option<String>,
    /// Tags for grouping and filtering
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct UpdateRuleRequest {
    /// Id of the rule to update. Takes priority over name for the lookup.
    id: Option<String>,
    /// Name of the rule to update when no id is given; with an id, the new
    /// name to rename the rule to.
    name: Option<String>,
    /// New description
    description: Option<String>,
    /// New original snippet
    original_code: Option<String>,
    /// New replacement snippet
    modified_code: Option<String>,
    /// New feedback
    feedback: Option<String>,
    /// New tag set (replaces the existing set)
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct DeleteRuleRequest {
    /// Name of the rule to delete
    name: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct GetRuleRequest {
    /// Name of the rule to fetch
    name: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ListRulesRequest {
    /// Only list rules carrying at least one of these tags. Omit for all rules.
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct SearchRulesRequest {
    /// Case-insensitive substring matched against rule names, descriptions, and feedback
    query: String,
    /// Only search rules carrying at least one of these tags
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ApplyRulesRequest {
    /// Code to rewrite
    code: String,
    /// Only apply rules carrying at least one of these tags. Omit for all rules.
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ExtractRulesRequest {
    /// Markdown rules document to extract rules from (same format as the stored document)
    document: String,
}

// --- Server ---

#[derive(Clone)]
pub struct AutoRulesServer {
    store: Arc<RuleStore>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl AutoRulesServer {
    pub fn new(store: Arc<RuleStore>) -> Self {
        Self {
            store,
            tool_router: Self::tool_router(),
        }
    }

    fn rule_count(&self) -> usize {
        self.store.load_all().map(|r| r.len()).unwrap_or(0)
    }

    #[tool(
        description = "Add a new code-edit rule. Fails if a rule with the same name already exists."
    )]
    fn add_rule(
        &self,
        Parameters(req): Parameters<AddRuleRequest>,
    ) -> Result<CallToolResult, McpError> {
        let new = NewRule {
            name: req.name,
            description: req.description,
            original_code: req.original_code,
            modified_code: req.modified_code,
            feedback: req.feedback,
            tags: req.tags.unwrap_or_default(),
        };
        match self.store.add(new) {
            Ok(rule) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Added rule '{}' ({} rules total)",
                rule.name,
                self.rule_count()
            ))])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Failed to add rule: {}",
                e
            ))])),
        }
    }

    #[tool(
        description = "Record a code edit you just made as a reusable rule. Same as add_rule, but feedback defaults to \"code edit\" when omitted."
    )]
    fn add_code_edit(
        &self,
        Parameters(req): Parameters<AddCodeEditRequest>,
    ) -> Result<CallToolResult, McpError> {
        let new = NewRule {
            name: req.name,
            description: req.description,
            original_code: req.original_code,
            modified_code: req.modified_code,
            feedback: req
                .feedback
                .unwrap_or_else(|| CODE_EDIT_FEEDBACK.to_string()),
            tags: req.tags.unwrap_or_default(),
        };
        match self.store.add(new) {
            Ok(rule) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Added rule '{}' ({} rules total)",
                rule.name,
                self.rule_count()
            ))])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Failed to add rule: {}",
                e
            ))])),
        }
    }

    #[tool(
        description = "Update an existing rule. Looks the rule up by id when given, otherwise by name. Only the fields you pass are changed; id and creation time are always preserved."
    )]
    fn update_rule(
        &self,
        Parameters(req): Parameters<UpdateRuleRequest>,
    ) -> Result<CallToolResult, McpError> {
        let update = RuleUpdate {
            id: req.id,
            name: req.name,
            description: req.description,
            original_code: req.original_code,
            modified_code: req.modified_code,
            feedback: req.feedback,
            tags: req.tags,
        };
        match self.store.update(update) {
            Ok(rule) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Updated rule '{}'",
                rule.name
            ))])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Failed to update rule: {}",
                e
            ))])),
        }
    }

    #[tool(description = "Delete a rule by name")]
    fn delete_rule(
        &self,
        Parameters(req): Parameters<DeleteRuleRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.store.delete(&req.name) {
            Ok(remaining) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Deleted rule '{}' ({} rules remaining)",
                req.name, remaining
            ))])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Failed to delete rule: {}",
                e
            ))])),
        }
    }

    #[tool(description = "Get a single rule by name, as JSON")]
    fn get_rule(
        &self,
        Parameters(req): Parameters<GetRuleRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.store.get_by_name(&req.name) {
            Ok(Some(rule)) => Ok(CallToolResult::success(vec![Content::text(
                serde_json::to_string_pretty(&rule)
                    .unwrap_or_else(|e| format!("Serialization error: {}", e)),
            )])),
            Ok(None) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Rule '{}' not found",
                req.name
            ))])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Failed to read rules: {}",
                e
            ))])),
        }
    }

    #[tool(
        description = "List stored rules as a JSON array, optionally filtered by tags (a rule matches when it carries any of the requested tags)"
    )]
    fn list_rules(
        &self,
        Parameters(req): Parameters<ListRulesRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.store.filter_by_tags(&req.tags.unwrap_or_default()) {
            Ok(rules) => {
                let text = if rules.is_empty() {
                    "No rules stored. Use add_rule to create one.".to_string()
                } else {
                    serde_json::to_string_pretty(&rules)
                        .unwrap_or_else(|e| format!("Serialization error: {}", e))
                };
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Failed to list rules: {}",
                e
            ))])),
        }
    }

    #[tool(
        description = "Search rules by a case-insensitive substring of their name, description, or feedback, optionally scoped by tags"
    )]
    fn search_rules(
        &self,
        Parameters(req): Parameters<SearchRulesRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .store
            .search(&req.query, &req.tags.unwrap_or_default())
        {
            Ok(rules) => {
                let text = if rules.is_empty() {
                    format!("No rules matching '{}'", req.query)
                } else {
                    serde_json::to_string_pretty(&rules)
                        .unwrap_or_else(|e| format!("Serialization error: {}", e))
                };
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Failed to search rules: {}",
                e
            ))])),
        }
    }

    #[tool(
        description = "Apply stored rules to a code blob. Rules run in store order; each one replaces every occurrence of its original snippet in the output of the rules before it. Returns the rewritten code and the names of the rules that fired."
    )]
    fn apply_rules(
        &self,
        Parameters(req): Parameters<ApplyRulesRequest>,
    ) -> Result<CallToolResult, McpError> {
        let candidates = match self.store.filter_by_tags(&req.tags.unwrap_or_default()) {
            Ok(rules) => rules,
            Err(e) => {
                return Ok(CallToolResult::error(vec![Content::text(format!(
                    "Failed to load rules: {}",
                    e
                ))]));
            }
        };

        let outcome = autorules_core::apply_rules(&req.code, &candidates);
        let result = serde_json::json!({
            "code": outcome.code,
            "applied": outcome.applied,
        });
        Ok(CallToolResult::success(vec![Content::text(
            serde_json::to_string_pretty(&result)
                .unwrap_or_else(|e| format!("Serialization error: {}", e)),
        )]))
    }

    #[tool(
        description = "Extract rules from a pasted rules document and add the ones whose names are not already taken"
    )]
    fn extract_rules(
        &self,
        Parameters(req): Parameters<ExtractRulesRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.store.import_document(&req.document) {
            Ok(report) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Extracted {} rule(s): {} added, {} already existed",
                report.extracted, report.added, report.skipped_existing
            ))])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Failed to extract rules: {}",
                e
            ))])),
        }
    }
}

#[tool_handler]
impl ServerHandler for AutoRulesServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(INSTRUCTIONS.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

const INSTRUCTIONS: &str = r#"autorules persists reusable code-edit rules and re-applies them to new code. Rules live in a single markdown document under the project's .autorules/ directory; each rule pairs an original snippet with its replacement, plus a description, feedback, and tags.

## Recording rules
- When the user corrects generated code, capture the correction with `add_code_edit` so it is applied automatically next time.
- Use `add_rule` for rules you formulate yourself. Names must be unique; pick short kebab-case names ("prefer-expect-err").
- Tag rules by language or concern so they can be applied selectively.

## Applying rules
- Call `apply_rules` with freshly generated code before presenting it. Pass tags to scope which rules run.
- Rules apply in store order and compose: a later rule sees the output of earlier ones. Every occurrence of a rule's original snippet is replaced.

## Maintaining rules
- `list_rules` / `search_rules` / `get_rule` to inspect what is stored.
- `update_rule` changes only the fields you pass; `delete_rule` removes by name.
- `extract_rules` imports sections from a pasted rules document, skipping names that already exist.

The document is human-editable; ids and timestamps are regenerated when it is re-read, so treat the name as the stable key."#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle `autorules-mcp init` subcommand
    if std::env::args().nth(1).as_deref() == Some("init") {
        return init_project();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let root = match std::env::var(ROOT_ENV) {
        Ok(v) if !v.is_empty() => PathBuf::from(v),
        _ => {
            let cwd = std::env::current_dir()?;
            tracing::warn!(
                root = %cwd.display(),
                "{} not set, using current directory",
                ROOT_ENV
            );
            cwd
        }
    };
    let rules_dir = root.join(RULES_DIR);
    std::fs::create_dir_all(&rules_dir)?;
    let rules_path = rules_dir.join(RULES_FILE);

    let store = Arc::new(RuleStore::open(&rules_path));
    match store.load_all() {
        Ok(rules) => {
            tracing::info!(count = rules.len(), path = %rules_path.display(), "loaded rules")
        }
        Err(e) => tracing::warn!(error = %e, "could not load existing rules"),
    }

    let service = AutoRulesServer::new(store)
        .serve(rmcp::transport::io::stdio())
        .await
        .inspect_err(|e| tracing::error!(error = %e, "MCP server error"))?;
    service.waiting().await?;
    Ok(())
}

/// Write project-scoped MCP config files in the current directory so that
/// Claude Code and/or Codex discover autorules-mcp when working in this
/// project. Only writes config for tools that are actually installed.
fn init_project() -> Result<(), Box<dyn std::error::Error>> {
    let binary_path = std::env::current_exe()?
        .canonicalize()?
        .to_string_lossy()
        .to_string();

    let cwd = std::env::current_dir()?;

    let has_claude = which("claude");
    let has_codex = which("codex");

    if !has_claude && !has_codex {
        eprintln!("Neither `claude` nor `codex` found in PATH.");
        eprintln!("Install Claude Code or OpenAI Codex first, then re-run `autorules-mcp init`.");
        std::process::exit(1);
    }

    if has_claude {
        init_claude_code(&cwd, &binary_path)?;
    }
    if has_codex {
        init_codex(&cwd, &binary_path)?;
    }

    let tools: Vec<&str> = [
        if has_claude { Some("Claude Code") } else { None },
        if has_codex { Some("Codex") } else { None },
    ]
    .into_iter()
    .flatten()
    .collect();
    eprintln!("\nDone. {} will use autorules in this project.", tools.join(" and "));

    Ok(())
}

fn which(name: &str) -> bool {
    // Check PATH for the given binary
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| {
                let candidate = dir.join(name);
                candidate.is_file() || dir.join(format!("{name}.exe")).is_file()
            })
        })
        .unwrap_or(false)
}

/// Write .mcp.json for Claude Code, merging with any existing config.
fn init_claude_code(
    cwd: &std::path::Path,
    binary_path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mcp_json_path = cwd.join(".mcp.json");
    let mut root: serde_json::Value = if mcp_json_path.exists() {
        let contents = std::fs::read_to_string(&mcp_json_path)?;
        serde_json::from_str(&contents).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };

    if !root.get("mcpServers").is_some_and(|v| v.is_object()) {
        root["mcpServers"] = serde_json::json!({});
    }
    root["mcpServers"]["autorules"] = serde_json::json!({
        "type": "stdio",
        "command": binary_path,
        "args": [],
    });

    std::fs::write(&mcp_json_path, serde_json::to_string_pretty(&root)?)?;
    eprintln!("Wrote {}", mcp_json_path.display());
    Ok(())
}

/// Write .codex/config.toml for OpenAI Codex, merging with any existing config.
fn init_codex(
    cwd: &std::path::Path,
    binary_path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let codex_dir = cwd.join(".codex");
    let config_toml_path = codex_dir.join("config.toml");

    let mut doc: toml_edit::DocumentMut = if config_toml_path.exists() {
        std::fs::read_to_string(&config_toml_path)?
            .parse()
            .unwrap_or_default()
    } else {
        toml_edit::DocumentMut::new()
    };

    if !doc.contains_table("mcp_servers") {
        doc["mcp_servers"] = toml_edit::Item::Table(toml_edit::Table::new());
    }

    let mut server = toml_edit::Table::new();
    server.insert("command", toml_edit::value(binary_path));
    server.insert("args", toml_edit::value(toml_edit::Array::new()));
    doc["mcp_servers"]["autorules"] = toml_edit::Item::Table(server);

    std::fs::create_dir_all(&codex_dir)?;
    std::fs::write(&config_toml_path, doc.to_string())?;
    eprintln!("Wrote {}", config_toml_path.display());
    Ok(())
}
