use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{
    EntityKind, Plan, PlanCategory, PlanStatus, Priority, Project, ProjectCategory,
    ProjectStatus, Record, StoreData, Task, TaskStatus, generate_id, now_rfc3339,
};

/// Largest accepted cover image, measured on the data URI.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// Sample records seeded into an empty record list.
pub const DEFAULT_RECORDS: [(&str, &str, u64); 2] = [
    (
        "default_3days_record_20251005",
        "3天一阶段制工作记录表20251005.pdf",
        107_109,
    ),
    (
        "default_creative_direction_20251005",
        "创意基础与前沿方向20251005.pdf",
        2_750_350,
    ),
];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },
    #[error("Validation error: {0}")]
    Validation(String),
}

/// A collection member of [`StoreData`].
pub trait Entity: Clone + Serialize + DeserializeOwned {
    const KIND: EntityKind;
    /// Wire names of fields a merge must never overwrite.
    const IMMUTABLE: &'static [&'static str] = &["id", "createdAt"];

    fn id(&self) -> &str;
    fn collection(data: &StoreData) -> &Vec<Self>;
    fn collection_mut(data: &mut StoreData) -> &mut Vec<Self>;

    /// Relationship upkeep after an entity with `id` left the collection.
    fn on_removed(_data: &mut StoreData, _id: &str) -> usize {
        0
    }
}

impl Entity for Plan {
    const KIND: EntityKind = EntityKind::Plan;

    fn id(&self) -> &str {
        &self.id
    }
    fn collection(data: &StoreData) -> &Vec<Self> {
        &data.plans
    }
    fn collection_mut(data: &mut StoreData) -> &mut Vec<Self> {
        &mut data.plans
    }

    // Projects outlive their plan; only the link is cleared.
    fn on_removed(data: &mut StoreData, id: &str) -> usize {
        let mut unlinked = 0;
        for project in data.projects.iter_mut().filter(|p| p.plan_id == id) {
            project.plan_id.clear();
            unlinked += 1;
        }
        unlinked
    }
}

impl Entity for Project {
    const KIND: EntityKind = EntityKind::Project;

    fn id(&self) -> &str {
        &self.id
    }
    fn collection(data: &StoreData) -> &Vec<Self> {
        &data.projects
    }
    fn collection_mut(data: &mut StoreData) -> &mut Vec<Self> {
        &mut data.projects
    }

    fn on_removed(data: &mut StoreData, id: &str) -> usize {
        let before = data.tasks.len();
        data.tasks.retain(|t| t.project_id != id);
        before - data.tasks.len()
    }
}

impl Entity for Task {
    const KIND: EntityKind = EntityKind::Task;

    fn id(&self) -> &str {
        &self.id
    }
    fn collection(data: &StoreData) -> &Vec<Self> {
        &data.tasks
    }
    fn collection_mut(data: &mut StoreData) -> &mut Vec<Self> {
        &mut data.tasks
    }
}

impl Entity for Record {
    const KIND: EntityKind = EntityKind::Record;
    const IMMUTABLE: &'static [&'static str] = &["id", "uploadDate"];

    fn id(&self) -> &str {
        &self.id
    }
    fn collection(data: &StoreData) -> &Vec<Self> {
        &data.records
    }
    fn collection_mut(data: &mut StoreData) -> &mut Vec<Self> {
        &mut data.records
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewPlan {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: PlanCategory,
    pub status: PlanStatus,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: ProjectCategory,
    pub status: ProjectStatus,
    pub priority: Priority,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewRecord {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub total_plans: usize,
    pub total_projects: usize,
    pub active_projects: usize,
    pub completed_projects: usize,
    pub recent_plans: Vec<Plan>,
    pub recent_projects: Vec<Project>,
}

/// Reject cover images that are not `data:image/...` URIs or are too large.
pub fn validate_cover_image(image: &str) -> Result<(), StoreError> {
    if !image.starts_with("data:image/") {
        return Err(StoreError::Validation(
            "cover image must be an image data URI".to_string(),
        ));
    }
    if image.len() > MAX_IMAGE_BYTES {
        return Err(StoreError::Validation(format!(
            "cover image is {} bytes, limit is {MAX_IMAGE_BYTES}",
            image.len()
        )));
    }
    Ok(())
}

fn validate_optional_image(image: Option<&str>) -> Result<(), StoreError> {
    match image {
        Some(image) if !image.is_empty() => validate_cover_image(image),
        _ => Ok(()),
    }
}

fn created_at_key(created_at: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(created_at)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn matches_search(name: &str, description: Option<&str>, needle: &str) -> bool {
    name.to_lowercase().contains(needle)
        || description.is_some_and(|d| d.to_lowercase().contains(needle))
}

/// In-memory source of truth for the running session.
///
/// Nothing here is durable; the sync manager commits after every mutation.
#[derive(Clone, Debug, Default)]
pub struct Store {
    data: StoreData,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: StoreData) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &StoreData {
        &self.data
    }

    pub fn replace(&mut self, data: StoreData) -> StoreData {
        std::mem::replace(&mut self.data, data)
    }

    pub fn into_data(self) -> StoreData {
        self.data
    }

    pub fn get_all<T: Entity>(&self) -> &[T] {
        T::collection(&self.data)
    }

    pub fn get<T: Entity>(&self, id: &str) -> Option<&T> {
        T::collection(&self.data).iter().find(|e| e.id() == id)
    }

    /// Insert `entity`, or shallow-merge it onto the stored entity with the
    /// same id. Fields the incoming entity leaves unset keep their value.
    pub fn upsert<T: Entity>(&mut self, entity: T) -> Result<T, StoreError> {
        let position = T::collection(&self.data)
            .iter()
            .position(|e| e.id() == entity.id());
        match position {
            Some(index) => {
                let patch = match serde_json::to_value(&entity)? {
                    Value::Object(map) => map,
                    _ => return Err(StoreError::Validation("entity is not an object".into())),
                };
                let merged = merge(&T::collection(&self.data)[index], &patch)?;
                T::collection_mut(&mut self.data)[index] = merged.clone();
                Ok(merged)
            }
            None => {
                T::collection_mut(&mut self.data).push(entity.clone());
                Ok(entity)
            }
        }
    }

    /// Shallow-merge a partial JSON object onto the entity with `id`.
    pub fn update<T: Entity>(&mut self, id: &str, patch: &Map<String, Value>) -> Result<T, StoreError> {
        if let Some(Value::String(image)) = patch.get("image") {
            validate_optional_image(Some(image))?;
        }
        let index = self.position::<T>(id)?;
        let merged = merge(&T::collection(&self.data)[index], patch)?;
        T::collection_mut(&mut self.data)[index] = merged.clone();
        Ok(merged)
    }

    /// Remove by id and apply the kind's relationship rule. Returns the
    /// removed entity and how many related entities were touched.
    pub fn remove<T: Entity>(&mut self, id: &str) -> Result<(T, usize), StoreError> {
        let index = self.position::<T>(id)?;
        let removed = T::collection_mut(&mut self.data).remove(index);
        let affected = T::on_removed(&mut self.data, id);
        Ok((removed, affected))
    }

    fn position<T: Entity>(&self, id: &str) -> Result<usize, StoreError> {
        T::collection(&self.data)
            .iter()
            .position(|e| e.id() == id)
            .ok_or_else(|| StoreError::NotFound {
                kind: T::KIND,
                id: id.to_string(),
            })
    }

    pub fn list_json(&self, kind: EntityKind) -> Result<Value, StoreError> {
        Ok(match kind {
            EntityKind::Plan => serde_json::to_value(&self.data.plans)?,
            EntityKind::Project => serde_json::to_value(&self.data.projects)?,
            EntityKind::Task => serde_json::to_value(&self.data.tasks)?,
            EntityKind::Record => serde_json::to_value(&self.data.records)?,
        })
    }

    pub fn get_json(&self, kind: EntityKind, id: &str) -> Result<Value, StoreError> {
        let found = match kind {
            EntityKind::Plan => self.get::<Plan>(id).map(serde_json::to_value),
            EntityKind::Project => self.get::<Project>(id).map(serde_json::to_value),
            EntityKind::Task => self.get::<Task>(id).map(serde_json::to_value),
            EntityKind::Record => self.get::<Record>(id).map(serde_json::to_value),
        };
        match found {
            Some(value) => Ok(value?),
            None => Err(StoreError::NotFound {
                kind,
                id: id.to_string(),
            }),
        }
    }

    pub fn update_json(
        &mut self,
        kind: EntityKind,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<Value, StoreError> {
        Ok(match kind {
            EntityKind::Plan => serde_json::to_value(self.update::<Plan>(id, patch)?)?,
            EntityKind::Project => serde_json::to_value(self.update::<Project>(id, patch)?)?,
            EntityKind::Task => serde_json::to_value(self.update::<Task>(id, patch)?)?,
            EntityKind::Record => serde_json::to_value(self.update::<Record>(id, patch)?)?,
        })
    }

    /// Remove by kind; returns the number of related entities touched.
    pub fn remove_kind(&mut self, kind: EntityKind, id: &str) -> Result<usize, StoreError> {
        Ok(match kind {
            EntityKind::Plan => self.remove::<Plan>(id)?.1,
            EntityKind::Project => self.remove::<Project>(id)?.1,
            EntityKind::Task => self.remove::<Task>(id)?.1,
            EntityKind::Record => self.remove::<Record>(id)?.1,
        })
    }

    pub fn create_plan(&mut self, new: NewPlan) -> Result<Plan, StoreError> {
        validate_optional_image(new.image.as_deref())?;
        let plan = Plan {
            id: generate_id(),
            name: new.name,
            description: new.description,
            category: new.category,
            status: new.status,
            start_date: new.start_date,
            end_date: new.end_date,
            image: new.image,
            created_at: now_rfc3339(),
            extra: Map::new(),
        };
        self.data.plans.push(plan.clone());
        // No immediate disk write; the sync manager commits.
        Ok(plan)
    }

    pub fn create_project(&mut self, new: NewProject) -> Result<Project, StoreError> {
        validate_optional_image(new.image.as_deref())?;
        let project = Project {
            id: generate_id(),
            name: new.name,
            plan_id: new.plan_id,
            description: new.description,
            category: new.category,
            status: new.status,
            priority: new.priority,
            deadline: new.deadline,
            image: new.image,
            created_at: now_rfc3339(),
            extra: Map::new(),
        };
        self.data.projects.push(project.clone());
        Ok(project)
    }

    pub fn create_task(&mut self, new: NewTask) -> Result<Task, StoreError> {
        if self.get::<Project>(&new.project_id).is_none() {
            return Err(StoreError::NotFound {
                kind: EntityKind::Project,
                id: new.project_id,
            });
        }
        let task = Task {
            id: generate_id(),
            project_id: new.project_id,
            name: new.name,
            description: new.description,
            status: new.status,
            priority: new.priority,
            created_at: now_rfc3339(),
            extra: Map::new(),
        };
        self.data.tasks.push(task.clone());
        Ok(task)
    }

    pub fn add_record(&mut self, new: NewRecord) -> Record {
        let record = Record {
            id: generate_id(),
            name: new.name,
            size: new.size,
            mime_type: new.mime_type,
            upload_date: now_rfc3339(),
            path: new.path,
            is_default: false,
            extra: Map::new(),
        };
        self.data.records.push(record.clone());
        record
    }

    /// Returns the number of projects that lost their plan link.
    pub fn delete_plan(&mut self, id: &str) -> Result<usize, StoreError> {
        Ok(self.remove::<Plan>(id)?.1)
    }

    /// Returns the number of tasks removed along with the project.
    pub fn delete_project(&mut self, id: &str) -> Result<usize, StoreError> {
        Ok(self.remove::<Project>(id)?.1)
    }

    pub fn cycle_task_status(&mut self, id: &str) -> Result<Task, StoreError> {
        let index = self.position::<Task>(id)?;
        let task = &mut self.data.tasks[index];
        task.status = task.status.next();
        Ok(task.clone())
    }

    pub fn tasks_for_project(&self, project_id: &str) -> Vec<&Task> {
        self.data
            .tasks
            .iter()
            .filter(|t| t.project_id == project_id)
            .collect()
    }

    /// Resolve a project's weak plan reference.
    pub fn project_plan(&self, project: &Project) -> Option<&Plan> {
        if project.plan_id.is_empty() {
            return None;
        }
        self.get::<Plan>(&project.plan_id)
    }

    /// Add the sample records that are not present yet, matching on id or
    /// name. Returns how many were added.
    pub fn seed_default_records(&mut self) -> usize {
        let mut added = 0;
        for (id, name, size) in DEFAULT_RECORDS {
            let present = self
                .data
                .records
                .iter()
                .any(|r| r.id == id || r.name == name);
            if present {
                continue;
            }
            self.data.records.push(Record {
                id: id.to_string(),
                name: name.to_string(),
                size,
                mime_type: "application/pdf".to_string(),
                upload_date: now_rfc3339(),
                path: Some(format!("./store/{name}")),
                is_default: true,
                extra: Map::new(),
            });
            added += 1;
        }
        added
    }

    /// A sample plan with two projects and two tasks, added only while the
    /// tracker has no plans or projects. Returns how many entities were added.
    pub fn seed_demo_data(&mut self) -> Result<usize, StoreError> {
        if !self.data.plans.is_empty() || !self.data.projects.is_empty() {
            return Ok(0);
        }
        let plan = self.create_plan(NewPlan {
            name: "前端技能提升计划".into(),
            description: Some("系统学习现代前端开发技术栈，提升个人技术能力".into()),
            category: PlanCategory::Skill,
            status: PlanStatus::Active,
            start_date: Some("2024-01-01".into()),
            end_date: Some("2024-12-31".into()),
            image: None,
        })?;
        let site = self.create_project(NewProject {
            name: "个人网站重构".into(),
            plan_id: plan.id.clone(),
            description: Some("使用现代前端框架重构个人网站，提升用户体验和性能".into()),
            category: ProjectCategory::Personal,
            status: ProjectStatus::Active,
            priority: Priority::High,
            deadline: Some("2024-12-31".into()),
            image: None,
        })?;
        let study = self.create_project(NewProject {
            name: "学习React框架".into(),
            plan_id: plan.id,
            description: Some("深入学习React生态系统，包括Hooks、Redux等".into()),
            category: ProjectCategory::Study,
            status: ProjectStatus::Active,
            priority: Priority::Medium,
            deadline: Some("2024-11-30".into()),
            image: None,
        })?;
        // One day older, so the dashboard shows a stable order.
        let yesterday = (Utc::now() - chrono::Duration::days(1))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        if let Some(project) = self.data.projects.iter_mut().find(|p| p.id == study.id) {
            project.created_at = yesterday;
        }
        self.create_task(NewTask {
            project_id: site.id.clone(),
            name: "设计页面原型".into(),
            description: Some("使用Figma设计新版本的页面原型".into()),
            status: TaskStatus::Completed,
            priority: Priority::High,
        })?;
        self.create_task(NewTask {
            project_id: site.id,
            name: "实现响应式布局".into(),
            description: Some("确保网站在各种设备上都能正常显示".into()),
            status: TaskStatus::InProgress,
            priority: Priority::Medium,
        })?;
        Ok(5)
    }

    pub fn filter_plans(&self, search: &str, status: Option<PlanStatus>) -> Vec<&Plan> {
        let needle = search.to_lowercase();
        self.data
            .plans
            .iter()
            .filter(|p| matches_search(&p.name, p.description.as_deref(), &needle))
            .filter(|p| status.is_none_or(|s| p.status == s))
            .collect()
    }

    pub fn filter_projects(
        &self,
        search: &str,
        status: Option<ProjectStatus>,
        category: Option<ProjectCategory>,
    ) -> Vec<&Project> {
        let needle = search.to_lowercase();
        self.data
            .projects
            .iter()
            .filter(|p| matches_search(&p.name, p.description.as_deref(), &needle))
            .filter(|p| status.is_none_or(|s| p.status == s))
            .filter(|p| category.is_none_or(|c| p.category == c))
            .collect()
    }

    pub fn dashboard(&self) -> Dashboard {
        let projects = &self.data.projects;
        let mut recent_plans = self.data.plans.clone();
        recent_plans.sort_by_key(|p| std::cmp::Reverse(created_at_key(&p.created_at)));
        recent_plans.truncate(3);
        let mut recent_projects = projects.clone();
        recent_projects.sort_by_key(|p| std::cmp::Reverse(created_at_key(&p.created_at)));
        recent_projects.truncate(3);

        Dashboard {
            total_plans: self.data.plans.len(),
            total_projects: projects.len(),
            active_projects: projects
                .iter()
                .filter(|p| p.status == ProjectStatus::Active)
                .count(),
            completed_projects: projects
                .iter()
                .filter(|p| p.status == ProjectStatus::Completed)
                .count(),
            recent_plans,
            recent_projects,
        }
    }
}

fn merge<T: Entity>(current: &T, patch: &Map<String, Value>) -> Result<T, StoreError> {
    let mut value = serde_json::to_value(current)?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| StoreError::Validation(format!("{} is not an object", T::KIND)))?;
    for (key, field) in patch {
        if T::IMMUTABLE.contains(&key.as_str()) {
            continue;
        }
        object.insert(key.clone(), field.clone());
    }
    let merged: T =
        serde_json::from_value(value).map_err(|e| StoreError::Validation(e.to_string()))?;

    // Decoding coerces bad values to defaults; an edit must not.
    let stored = serde_json::to_value(&merged)?;
    for (key, field) in patch {
        if T::IMMUTABLE.contains(&key.as_str()) || field.is_null() {
            continue;
        }
        if stored.get(key) != Some(field) {
            return Err(StoreError::Validation(format!(
                "invalid value for {}.{key}: {field}",
                T::KIND
            )));
        }
    }
    Ok(merged)
}
