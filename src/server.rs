use std::sync::Arc;

use rmcp::RoleServer;
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::storage::{NewPlan, NewProject, NewRecord, NewTask};
use crate::sync::{Committed, SyncError, SyncManager};
use crate::transfer;
use crate::types::{EntityKind, PlanStatus, ProjectCategory, ProjectStatus};

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct KindArgs {
    pub kind: EntityKind,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct EntityArgs {
    pub kind: EntityKind,
    pub id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct UpdateArgs {
    pub kind: EntityKind,
    pub id: String,
    /// Fields to merge onto the entity, using the stored (camelCase) names
    pub patch: serde_json::Value,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct TaskIdArgs {
    pub id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct ProjectTasksArgs {
    #[serde(rename = "projectId")]
    pub project_id: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct FilterPlansArgs {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub status: Option<PlanStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct FilterProjectsArgs {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub status: Option<ProjectStatus>,
    #[serde(default)]
    pub category: Option<ProjectCategory>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct ImportArgs {
    /// Snapshot JSON with plans, projects, tasks and records
    pub raw: String,
    /// Required when the tracker already holds plans or projects
    #[serde(default)]
    pub confirm: bool,
}

fn json_text<T: Serialize>(value: &T) -> Result<CallToolResult, ErrorData> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

fn tool_error(message: impl std::fmt::Display) -> Result<CallToolResult, ErrorData> {
    Ok(CallToolResult::error(vec![Content::text(
        json!({ "error": message.to_string() }).to_string(),
    )]))
}

fn committed<T: Serialize>(result: Result<Committed<T>, SyncError>) -> Result<CallToolResult, ErrorData> {
    match result {
        Ok(committed) => json_text(&committed),
        Err(e) => tool_error(e),
    }
}

#[derive(Clone)]
pub struct TrackerServer {
    sync: Arc<SyncManager>,
    pub tool_router: ToolRouter<TrackerServer>,
}

#[tool_router]
impl TrackerServer {
    pub fn new(sync: Arc<SyncManager>) -> Self {
        Self {
            sync,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "List every plan, project, task or record")]
    async fn list_entities(
        &self,
        Parameters(args): Parameters<KindArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        match self.sync.read(|s| s.list_json(args.kind)).await {
            Ok(list) => json_text(&list),
            Err(e) => tool_error(e),
        }
    }

    #[tool(description = "Get one entity by kind and id")]
    async fn get_entity(
        &self,
        Parameters(args): Parameters<EntityArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        match self.sync.read(|s| s.get_json(args.kind, &args.id)).await {
            Ok(entity) => json_text(&entity),
            Err(e) => tool_error(e),
        }
    }

    #[tool(description = "Create a plan")]
    async fn create_plan(
        &self,
        Parameters(args): Parameters<NewPlan>,
    ) -> Result<CallToolResult, ErrorData> {
        committed(self.sync.mutate("Create plan", |s| s.create_plan(args)).await)
    }

    #[tool(description = "Create a project, optionally linked to a plan")]
    async fn create_project(
        &self,
        Parameters(args): Parameters<NewProject>,
    ) -> Result<CallToolResult, ErrorData> {
        committed(self.sync.mutate("Create project", |s| s.create_project(args)).await)
    }

    #[tool(description = "Create a task inside a project")]
    async fn create_task(
        &self,
        Parameters(args): Parameters<NewTask>,
    ) -> Result<CallToolResult, ErrorData> {
        committed(self.sync.mutate("Create task", |s| s.create_task(args)).await)
    }

    #[tool(description = "Register an uploaded record file")]
    async fn add_record(
        &self,
        Parameters(args): Parameters<NewRecord>,
    ) -> Result<CallToolResult, ErrorData> {
        committed(self.sync.mutate("Upload record", |s| Ok(s.add_record(args))).await)
    }

    #[tool(description = "Merge changed fields onto an existing entity")]
    async fn update_entity(
        &self,
        Parameters(args): Parameters<UpdateArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        let Some(patch) = args.patch.as_object().cloned() else {
            return tool_error("patch must be a JSON object");
        };
        let action = format!("Update {}", args.kind);
        committed(
            self.sync
                .mutate(&action, |s| s.update_json(args.kind, &args.id, &patch))
                .await,
        )
    }

    #[tool(
        description = "Delete an entity. Deleting a plan unlinks its projects; deleting a project deletes its tasks"
    )]
    async fn delete_entity(
        &self,
        Parameters(args): Parameters<EntityArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        let action = format!("Delete {}", args.kind);
        committed(
            self.sync
                .mutate(&action, |s| s.remove_kind(args.kind, &args.id))
                .await,
        )
    }

    #[tool(description = "Advance a task to its next status")]
    async fn cycle_task_status(
        &self,
        Parameters(args): Parameters<TaskIdArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        committed(
            self.sync
                .mutate("Task status", |s| s.cycle_task_status(&args.id))
                .await,
        )
    }

    #[tool(description = "List the tasks of one project")]
    async fn project_tasks(
        &self,
        Parameters(args): Parameters<ProjectTasksArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        let tasks = self
            .sync
            .read(|s| {
                s.tasks_for_project(&args.project_id)
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .await;
        json_text(&tasks)
    }

    #[tool(description = "Search plans by name or description and status")]
    async fn filter_plans(
        &self,
        Parameters(args): Parameters<FilterPlansArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        let search = args.search.unwrap_or_default();
        let plans = self
            .sync
            .read(|s| {
                s.filter_plans(&search, args.status)
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .await;
        json_text(&plans)
    }

    #[tool(description = "Search projects by name or description, status and category")]
    async fn filter_projects(
        &self,
        Parameters(args): Parameters<FilterProjectsArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        let search = args.search.unwrap_or_default();
        let projects = self
            .sync
            .read(|s| {
                s.filter_projects(&search, args.status, args.category)
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .await;
        json_text(&projects)
    }

    #[tool(description = "Counts and most recent plans and projects")]
    async fn dashboard(&self) -> Result<CallToolResult, ErrorData> {
        let dashboard = self.sync.read(|s| s.dashboard()).await;
        json_text(&dashboard)
    }

    #[tool(description = "Add the sample records if they are missing")]
    async fn seed_defaults(&self) -> Result<CallToolResult, ErrorData> {
        committed(self.sync.seed_defaults().await)
    }

    #[tool(description = "Add a sample plan with projects and tasks to an empty tracker")]
    async fn seed_demo(&self) -> Result<CallToolResult, ErrorData> {
        committed(self.sync.seed_demo().await)
    }

    #[tool(description = "Export all data as a versioned snapshot")]
    async fn export_snapshot(&self) -> Result<CallToolResult, ErrorData> {
        let snapshot = self.sync.export().await;
        json_text(&snapshot)
    }

    #[tool(description = "Replace all data with a snapshot. Existing plans or projects need confirm=true")]
    async fn import_snapshot(
        &self,
        Parameters(args): Parameters<ImportArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        let needs_confirmation = self
            .sync
            .read(|s| transfer::requires_confirmation(s.data()))
            .await;
        if needs_confirmation && !args.confirm {
            return tool_error("Import would overwrite existing plans and projects; retry with confirm=true");
        }
        committed(self.sync.import(&args.raw).await)
    }

    #[tool(description = "Current sync state and backend")]
    async fn sync_status(&self) -> Result<CallToolResult, ErrorData> {
        json_text(&json!({
            "backend": self.sync.primary_name(),
            "status": self.sync.status(),
        }))
    }
}

#[tool_handler]
impl rmcp::ServerHandler for TrackerServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Plan tracker - manage plans, projects, tasks and records with the tools".to_string(),
            ),
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _ctx: rmcp::service::RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, ErrorData> {
        Ok(ListResourcesResult {
            resources: vec![
                RawResource::new("tracker://dashboard", "Dashboard").no_annotation(),
                RawResource::new("tracker://snapshot", "Export Snapshot").no_annotation(),
            ],
            next_cursor: None,
        })
    }

    async fn read_resource(
        &self,
        ReadResourceRequestParam { uri }: ReadResourceRequestParam,
        _ctx: rmcp::service::RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, ErrorData> {
        let body = match uri.as_str() {
            "tracker://dashboard" => {
                serde_json::to_string(&self.sync.read(|s| s.dashboard()).await)
            }
            "tracker://snapshot" => serde_json::to_string(&self.sync.export().await),
            _ => {
                return Err(ErrorData::resource_not_found(
                    "Unknown resource URI",
                    Some(json!({ "uri": uri })),
                ));
            }
        }
        .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::text(body, uri)],
        })
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParam>,
        _ctx: rmcp::service::RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, ErrorData> {
        Ok(ListResourceTemplatesResult {
            next_cursor: None,
            resource_templates: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendSet, LocalStorageBackend};

    fn server(dir: &std::path::Path) -> TrackerServer {
        let sync = SyncManager::new(BackendSet {
            primary: Arc::new(LocalStorageBackend::new(dir)),
            fallback: None,
        });
        TrackerServer::new(Arc::new(sync))
    }

    fn text(result: &CallToolResult) -> serde_json::Value {
        let wire = serde_json::to_value(result).unwrap();
        serde_json::from_str(wire["content"][0]["text"].as_str().unwrap()).unwrap()
    }

    fn is_error(result: &CallToolResult) -> bool {
        serde_json::to_value(result).unwrap()["isError"] == json!(true)
    }

    #[tokio::test]
    async fn test_create_and_delete_plan_through_tools() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let created = server
            .create_plan(Parameters(NewPlan {
                name: "P1".into(),
                description: None,
                category: crate::types::PlanCategory::Skill,
                status: PlanStatus::Active,
                start_date: None,
                end_date: None,
                image: None,
            }))
            .await
            .unwrap();
        let body = text(&created);
        assert_eq!(body["source"], "primary");
        let id = body["value"]["id"].as_str().unwrap().to_string();

        let deleted = server
            .delete_entity(Parameters(EntityArgs {
                kind: EntityKind::Plan,
                id,
            }))
            .await
            .unwrap();
        assert_eq!(text(&deleted)["value"], 0);

        let listed = server
            .list_entities(Parameters(KindArgs {
                kind: EntityKind::Plan,
            }))
            .await
            .unwrap();
        assert_eq!(text(&listed), json!([]));
    }

    #[tokio::test]
    async fn test_import_requires_confirm_when_data_exists() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        server
            .create_project(Parameters(NewProject {
                name: "J".into(),
                plan_id: String::new(),
                description: None,
                category: ProjectCategory::Work,
                status: ProjectStatus::Planning,
                priority: crate::types::Priority::High,
                deadline: None,
                image: None,
            }))
            .await
            .unwrap();

        let raw = r#"{"plans":[],"projects":[],"tasks":[],"records":[]}"#.to_string();
        let refused = server
            .import_snapshot(Parameters(ImportArgs {
                raw: raw.clone(),
                confirm: false,
            }))
            .await
            .unwrap();
        assert!(is_error(&refused));
        assert_eq!(server.sync.data().await.projects.len(), 1);

        let accepted = server
            .import_snapshot(Parameters(ImportArgs { raw, confirm: true }))
            .await
            .unwrap();
        assert!(!is_error(&accepted));
        assert!(server.sync.data().await.is_empty());
    }
}
