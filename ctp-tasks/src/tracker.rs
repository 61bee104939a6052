//! Permission-tagged index of submitted workflows.
//!
//! KV layout:
//! - `task:{workflow_id}` → entry JSON
//! - `task_idx:user:{user_id}`, `task_idx:course:{course_id}`,
//!   `task_idx:org:{organization_id}`, `task_idx:all` → workflow-id sets
//!
//! Entries expire after 24 hours; the engine remains the source of truth
//! for status, the tracker only answers "who may look".

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use ctp_auth::{CourseRole, Principal};
use ctp_cache::{KvOp, SharedKv};
use ctp_core::ApiError;

use crate::engine::{SharedEngine, TaskSubmission};

/// Default entry lifetime.
pub const TASK_TTL: Duration = Duration::from_secs(86400);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskTrackerEntry {
    pub workflow_id: String,
    pub task_name: String,
    pub created_at: DateTime<Utc>,
    pub created_by: Uuid,
    /// Permission tags.
    pub user_id: Uuid,
    pub course_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub description: Option<String>,
}

/// Everything but the workflow id and timestamps of a new entry.
#[derive(Debug, Clone, Default)]
pub struct TaskTags {
    pub user_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub description: Option<String>,
}

#[derive(Clone)]
pub struct TaskTracker {
    kv: SharedKv,
    engine: SharedEngine,
    ttl: Duration,
}

fn task_key(workflow_id: &str) -> String {
    format!("task:{workflow_id}")
}

fn user_index(user_id: Uuid) -> String {
    format!("task_idx:user:{user_id}")
}

fn course_index(course_id: Uuid) -> String {
    format!("task_idx:course:{course_id}")
}

fn org_index(organization_id: Uuid) -> String {
    format!("task_idx:org:{organization_id}")
}

const ALL_INDEX: &str = "task_idx:all";

impl TaskTracker {
    pub fn new(kv: SharedKv, engine: SharedEngine) -> Self {
        Self {
            kv,
            engine,
            ttl: TASK_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    /// Record a workflow with its permission tags. All writes go out as
    /// one batch so the entry and its indexes never diverge.
    pub async fn track(
        &self,
        workflow_id: &str,
        task_name: &str,
        created_by: Uuid,
        tags: TaskTags,
    ) -> TaskTrackerEntry {
        let entry = TaskTrackerEntry {
            workflow_id: workflow_id.to_string(),
            task_name: task_name.to_string(),
            created_at: Utc::now(),
            created_by,
            user_id: tags.user_id.unwrap_or(created_by),
            course_id: tags.course_id,
            organization_id: tags.organization_id,
            entity_type: tags.entity_type,
            entity_id: tags.entity_id,
            description: tags.description,
        };

        let payload = match serde_json::to_string(&entry) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(workflow_id, error = %e, "unserializable tracker entry");
                return entry;
            }
        };

        let mut ops = vec![
            KvOp::SetEx {
                key: task_key(workflow_id),
                value: payload,
                ttl: self.ttl,
            },
            KvOp::SAdd {
                key: user_index(entry.user_id),
                member: workflow_id.to_string(),
                ttl: self.ttl,
            },
            KvOp::SAdd {
                key: ALL_INDEX.to_string(),
                member: workflow_id.to_string(),
                ttl: self.ttl,
            },
        ];
        if let Some(course_id) = entry.course_id {
            ops.push(KvOp::SAdd {
                key: course_index(course_id),
                member: workflow_id.to_string(),
                ttl: self.ttl,
            });
        }
        if let Some(organization_id) = entry.organization_id {
            ops.push(KvOp::SAdd {
                key: org_index(organization_id),
                member: workflow_id.to_string(),
                ttl: self.ttl,
            });
        }

        self.kv.run_batch(ops).await;
        info!(workflow_id, created_by = %created_by, "task tracked");
        entry
    }

    /// Submit through the engine and tag in one call.
    pub async fn submit_and_track(
        &self,
        submission: TaskSubmission,
        created_by: Uuid,
        tags: TaskTags,
    ) -> Result<String, ApiError> {
        let task_name = submission.task_name.clone();
        let workflow_id = self.engine.submit(submission).await?;
        self.track(&workflow_id, &task_name, created_by, tags).await;
        Ok(workflow_id)
    }

    pub async fn get_entry(&self, workflow_id: &str) -> Option<TaskTrackerEntry> {
        let raw = self.kv.get(&task_key(workflow_id)).await?;
        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(workflow_id, error = %e, "corrupt tracker entry");
                None
            }
        }
    }

    /// Admin, owner, or a ≥ lecturer of the entry's course.
    pub async fn can_access(&self, workflow_id: &str, principal: &Principal) -> bool {
        if principal.is_admin {
            return true;
        }
        let Some(entry) = self.get_entry(workflow_id).await else {
            return false;
        };
        if entry.user_id == principal.user_id {
            return true;
        }
        if let Some(course_id) = entry.course_id {
            if let Some(role) = principal.get_highest_course_role(course_id) {
                return role >= CourseRole::Lecturer;
            }
        }
        false
    }

    /// Workflow ids the principal may observe.
    pub async fn accessible_ids(&self, principal: &Principal) -> Vec<String> {
        if principal.is_admin {
            return self.kv.smembers(ALL_INDEX).await;
        }
        let mut ids = self.kv.smembers(&user_index(principal.user_id)).await;
        for course_id in principal.courses_with_min_role(CourseRole::Lecturer) {
            ids.extend(self.kv.smembers(&course_index(course_id)).await);
        }
        ids.sort();
        ids.dedup();
        ids
    }

    /// Accessible entries, newest first, paged.
    pub async fn list_accessible(
        &self,
        principal: &Principal,
        limit: usize,
        offset: usize,
    ) -> Vec<TaskTrackerEntry> {
        let mut entries = Vec::new();
        for workflow_id in self.accessible_ids(principal).await {
            if let Some(entry) = self.get_entry(&workflow_id).await {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.into_iter().skip(offset).take(limit).collect()
    }

    /// Remove the entry and every index member. The engine record stays.
    pub async fn delete_entry(&self, workflow_id: &str) -> bool {
        let Some(entry) = self.get_entry(workflow_id).await else {
            return false;
        };
        let mut ops = vec![
            KvOp::SRem {
                key: user_index(entry.user_id),
                member: workflow_id.to_string(),
            },
            KvOp::SRem {
                key: ALL_INDEX.to_string(),
                member: workflow_id.to_string(),
            },
            KvOp::Del {
                key: task_key(workflow_id),
            },
        ];
        if let Some(course_id) = entry.course_id {
            ops.push(KvOp::SRem {
                key: course_index(course_id),
                member: workflow_id.to_string(),
            });
        }
        if let Some(organization_id) = entry.organization_id {
            ops.push(KvOp::SRem {
                key: org_index(organization_id),
                member: workflow_id.to_string(),
            });
        }
        self.kv.run_batch(ops).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalWorkflowEngine;
    use ctp_cache::InMemoryKv;
    use std::sync::Arc;

    fn tracker() -> TaskTracker {
        let engine: SharedEngine = Arc::new(
            LocalWorkflowEngine::builder()
                .handler("grade", |params| async move { Ok(params) })
                .build(),
        );
        TaskTracker::new(Arc::new(InMemoryKv::new()), engine)
    }

    fn submission() -> TaskSubmission {
        TaskSubmission {
            task_name: "grade".to_string(),
            parameters: serde_json::json!({}),
            queue: "default".to_string(),
            workflow_id: None,
        }
    }

    #[tokio::test]
    async fn tracked_entries_land_in_every_index() {
        let tracker = tracker();
        let admin = Uuid::new_v4();
        let student = Uuid::new_v4();
        let course = Uuid::new_v4();
        let org = Uuid::new_v4();

        let id = tracker
            .submit_and_track(
                submission(),
                admin,
                TaskTags {
                    user_id: Some(student),
                    course_id: Some(course),
                    organization_id: Some(org),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let kv = &tracker.kv;
        assert!(kv.smembers("task_idx:all").await.contains(&id));
        assert!(kv.smembers(&format!("task_idx:user:{student}")).await.contains(&id));
        assert!(kv.smembers(&format!("task_idx:course:{course}")).await.contains(&id));
        assert!(kv.smembers(&format!("task_idx:org:{org}")).await.contains(&id));

        let entry = tracker.get_entry(&id).await.unwrap();
        assert_eq!(entry.created_by, admin);
        assert_eq!(entry.user_id, student);
    }

    #[tokio::test]
    async fn user_tag_defaults_to_the_submitter() {
        let tracker = tracker();
        let submitter = Uuid::new_v4();
        let id = tracker
            .submit_and_track(submission(), submitter, TaskTags::default())
            .await
            .unwrap();
        let entry = tracker.get_entry(&id).await.unwrap();
        assert_eq!(entry.user_id, submitter);
    }

    #[tokio::test]
    async fn access_follows_admin_owner_lecturer_rules() {
        let tracker = tracker();
        let owner = Uuid::new_v4();
        let course = Uuid::new_v4();
        let id = tracker
            .submit_and_track(
                submission(),
                owner,
                TaskTags {
                    course_id: Some(course),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(tracker.can_access(&id, &Principal::admin(Uuid::new_v4())).await);
        assert!(tracker.can_access(&id, &Principal::new(owner)).await);

        let lecturer = Principal::new(Uuid::new_v4()).with_course_role(course, CourseRole::Lecturer);
        assert!(tracker.can_access(&id, &lecturer).await);

        let student = Principal::new(Uuid::new_v4()).with_course_role(course, CourseRole::Student);
        assert!(!tracker.can_access(&id, &student).await);

        let stranger = Principal::new(Uuid::new_v4());
        assert!(!tracker.can_access(&id, &stranger).await);
        assert!(!tracker.can_access("missing", &stranger).await);
    }

    #[tokio::test]
    async fn listing_unions_own_and_lectured_courses() {
        let tracker = tracker();
        let u1 = Uuid::new_v4();
        let other = Uuid::new_v4();
        let course = Uuid::new_v4();

        let own = tracker
            .submit_and_track(submission(), u1, TaskTags::default())
            .await
            .unwrap();
        let in_course = tracker
            .submit_and_track(
                submission(),
                other,
                TaskTags {
                    course_id: Some(course),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let unrelated = tracker
            .submit_and_track(submission(), other, TaskTags::default())
            .await
            .unwrap();

        let lecturer = Principal::new(u1).with_course_role(course, CourseRole::Lecturer);
        let visible: Vec<String> = tracker
            .list_accessible(&lecturer, 100, 0)
            .await
            .into_iter()
            .map(|e| e.workflow_id)
            .collect();
        assert!(visible.contains(&own));
        assert!(visible.contains(&in_course));
        assert!(!visible.contains(&unrelated));

        // A student in the course sees only their own.
        let student = Principal::new(u1).with_course_role(course, CourseRole::Student);
        let visible = tracker.list_accessible(&student, 100, 0).await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].workflow_id, own);

        // Admin sees everything.
        let admin = Principal::admin(Uuid::new_v4());
        assert_eq!(tracker.list_accessible(&admin, 100, 0).await.len(), 3);
    }

    #[tokio::test]
    async fn delete_entry_clears_entry_and_indexes() {
        let tracker = tracker();
        let user = Uuid::new_v4();
        let course = Uuid::new_v4();
        let id = tracker
            .submit_and_track(
                submission(),
                user,
                TaskTags {
                    course_id: Some(course),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(tracker.delete_entry(&id).await);
        assert!(tracker.get_entry(&id).await.is_none());
        assert!(!tracker.kv.smembers("task_idx:all").await.contains(&id));
        assert!(!tracker
            .kv
            .smembers(&format!("task_idx:course:{course}"))
            .await
            .contains(&id));
        assert!(!tracker.delete_entry(&id).await);
    }
}
