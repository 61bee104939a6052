//! Permission engine: scalar checks and query shaping over one policy.
//!
//! The scalar API answers `permitted?`; the query API returns a
//! [`QueryScope`] that list endpoints AND into their SQL so rows the
//! caller may not see never leave the database. Results are cached in the
//! KV store under `perm:*` with a short TTL; role and membership
//! mutations invalidate per user.

use std::collections::HashSet;
use std::time::Duration;

use uuid::Uuid;

use ctp_cache::SharedKv;

use crate::principal::{CourseRole, Principal};

/// Cache lifetime for permission answers.
const PERMISSION_TTL: Duration = Duration::from_secs(300);

/// The shape of a permission-filtered query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryScope {
    /// Admin: no constraint added.
    Unrestricted,
    /// Nothing matches; the endpoint returns an empty page.
    Forbidden,
    /// Restrict to entities reachable from these courses.
    CourseIds(HashSet<Uuid>),
}

impl QueryScope {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, QueryScope::Forbidden)
    }
}

#[derive(Clone)]
pub struct PermissionEngine {
    kv: SharedKv,
}

impl PermissionEngine {
    pub fn new(kv: SharedKv) -> Self {
        Self { kv }
    }

    fn check_key(principal: &Principal, resource: &str, action: &str, id: Option<Uuid>) -> String {
        match id {
            Some(id) => format!("perm:{}:{resource}:{action}:{id}", principal.user_id),
            None => format!("perm:{}:{resource}:{action}", principal.user_id),
        }
    }

    fn courses_key(user_id: Uuid, minimum: CourseRole) -> String {
        format!("perm:courses:{user_id}:{minimum}")
    }

    /// Scalar check with read-through caching. `course_id` scopes the
    /// check to one course where the resource is course-bound.
    pub async fn permitted(
        &self,
        principal: &Principal,
        resource: &str,
        action: &str,
        course_id: Option<Uuid>,
    ) -> bool {
        if principal.is_admin {
            return true;
        }

        let key = Self::check_key(principal, resource, action, course_id);
        if let Some(cached) = self.kv.get(&key).await {
            return cached == "1";
        }

        let allowed = principal.permitted(resource, action, course_id);
        self.kv
            .set(&key, if allowed { "1" } else { "0" }.to_string(), PERMISSION_TTL)
            .await;
        allowed
    }

    /// Course ids where the principal holds at least `minimum`, cached
    /// per `(user, minimum)` so repeated list requests skip the set
    /// computation.
    pub async fn courses_with_min_role(
        &self,
        principal: &Principal,
        minimum: CourseRole,
    ) -> HashSet<Uuid> {
        let key = Self::courses_key(principal.user_id, minimum);
        if let Some(cached) = self.kv.get(&key).await {
            if let Ok(ids) = serde_json::from_str::<Vec<Uuid>>(&cached) {
                return ids.into_iter().collect();
            }
        }

        let ids = principal.courses_with_min_role(minimum);
        if let Ok(encoded) = serde_json::to_string(&ids.iter().collect::<Vec<_>>()) {
            self.kv.set(&key, encoded, PERMISSION_TTL).await;
        }
        ids
    }

    /// Query-shaping dual of [`Self::permitted`]. The returned scope is
    /// ANDed into the caller's own filters and never widens them.
    pub async fn filter(&self, principal: &Principal, minimum: CourseRole) -> QueryScope {
        if principal.is_admin {
            return QueryScope::Unrestricted;
        }
        let courses = self.courses_with_min_role(principal, minimum).await;
        if courses.is_empty() {
            QueryScope::Forbidden
        } else {
            QueryScope::CourseIds(courses)
        }
    }

    /// Drop every cached answer for a user. Must run after any role or
    /// membership mutation affecting them.
    pub async fn invalidate_user(&self, user_id: Uuid) {
        self.kv.delete_prefix(&format!("perm:{user_id}")).await;
        self.kv.delete_prefix(&format!("perm:courses:{user_id}")).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctp_cache::InMemoryKv;
    use std::sync::Arc;

    fn engine() -> PermissionEngine {
        PermissionEngine::new(Arc::new(InMemoryKv::new()))
    }

    #[tokio::test]
    async fn admin_is_unrestricted_and_uncached() {
        let engine = engine();
        let admin = Principal::admin(Uuid::new_v4());
        assert!(engine.permitted(&admin, "course", "delete", None).await);
        assert_eq!(engine.filter(&admin, CourseRole::Student).await, QueryScope::Unrestricted);
    }

    #[tokio::test]
    async fn outsider_gets_forbidden_scope() {
        let engine = engine();
        let outsider = Principal::new(Uuid::new_v4());
        assert_eq!(engine.filter(&outsider, CourseRole::Student).await, QueryScope::Forbidden);
    }

    #[tokio::test]
    async fn member_scope_contains_only_qualifying_courses() {
        let engine = engine();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let p = Principal::new(Uuid::new_v4())
            .with_course_role(c1, CourseRole::Student)
            .with_course_role(c2, CourseRole::Lecturer);

        match engine.filter(&p, CourseRole::Lecturer).await {
            QueryScope::CourseIds(ids) => {
                assert!(ids.contains(&c2));
                assert!(!ids.contains(&c1));
            }
            other => panic!("expected CourseIds, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cached_answers_survive_principal_changes_until_invalidated() {
        let engine = engine();
        let course = Uuid::new_v4();
        let user = Uuid::new_v4();
        let member = Principal::new(user).with_course_role(course, CourseRole::Lecturer);

        assert!(engine.permitted(&member, "course_content", "update", Some(course)).await);

        // Role removed but the cache still answers the old way.
        let stripped = Principal::new(user);
        assert!(engine.permitted(&stripped, "course_content", "update", Some(course)).await);

        engine.invalidate_user(user).await;
        assert!(!engine.permitted(&stripped, "course_content", "update", Some(course)).await);
    }

    #[tokio::test]
    async fn course_set_is_cached_per_minimum_role() {
        let engine = engine();
        let course = Uuid::new_v4();
        let p = Principal::new(Uuid::new_v4()).with_course_role(course, CourseRole::Tutor);

        let tutors = engine.courses_with_min_role(&p, CourseRole::Tutor).await;
        assert!(tutors.contains(&course));
        let lecturers = engine.courses_with_min_role(&p, CourseRole::Lecturer).await;
        assert!(lecturers.is_empty());
    }
}
