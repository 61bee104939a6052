//! The in-memory authorization subject and the course-role hierarchy.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Course-scoped roles with a strict level ordering.
///
/// The derived `Ord` follows declaration order, which is the level order
/// the whole permission model relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CourseRole {
    #[serde(rename = "_student")]
    Student,
    #[serde(rename = "_tutor")]
    Tutor,
    #[serde(rename = "_lecturer")]
    Lecturer,
    #[serde(rename = "_maintainer")]
    Maintainer,
    #[serde(rename = "_owner")]
    Owner,
}

impl CourseRole {
    pub const ALL: [CourseRole; 5] = [
        CourseRole::Student,
        CourseRole::Tutor,
        CourseRole::Lecturer,
        CourseRole::Maintainer,
        CourseRole::Owner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CourseRole::Student => "_student",
            CourseRole::Tutor => "_tutor",
            CourseRole::Lecturer => "_lecturer",
            CourseRole::Maintainer => "_maintainer",
            CourseRole::Owner => "_owner",
        }
    }

    pub fn parse(raw: &str) -> Option<CourseRole> {
        CourseRole::ALL.iter().copied().find(|r| r.as_str() == raw)
    }

    pub fn level(&self) -> u8 {
        *self as u8
    }

    /// Every role at or above `minimum`.
    pub fn at_or_above(minimum: CourseRole) -> Vec<CourseRole> {
        CourseRole::ALL.iter().copied().filter(|r| *r >= minimum).collect()
    }
}

impl std::fmt::Display for CourseRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A general (non-course) claim from a system role: `(resource, action)`.
pub type Claim = (String, String);

/// Immutable authorization subject for one request.
#[derive(Debug, Clone, Default)]
pub struct Principal {
    pub user_id: Uuid,
    pub is_admin: bool,
    pub is_service: bool,
    pub general_claims: HashSet<Claim>,
    /// Highest held role per course.
    pub course_roles: HashMap<Uuid, CourseRole>,
}

impl Principal {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self {
            user_id,
            is_admin: true,
            ..Default::default()
        }
    }

    pub fn with_course_role(mut self, course_id: Uuid, role: CourseRole) -> Self {
        // Keep the highest role if one was already present.
        let entry = self.course_roles.entry(course_id).or_insert(role);
        if role > *entry {
            *entry = role;
        }
        self
    }

    pub fn with_claim(mut self, resource: &str, action: &str) -> Self {
        self.general_claims.insert((resource.to_string(), action.to_string()));
        self
    }

    pub fn get_highest_course_role(&self, course_id: Uuid) -> Option<CourseRole> {
        self.course_roles.get(&course_id).copied()
    }

    /// Course ids where the principal holds at least `minimum`.
    pub fn courses_with_min_role(&self, minimum: CourseRole) -> HashSet<Uuid> {
        self.course_roles
            .iter()
            .filter(|(_, role)| **role >= minimum)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn has_claim(&self, resource: &str, action: &str) -> bool {
        self.general_claims
            .iter()
            .any(|(r, a)| r == resource && a == action)
    }

    /// Scalar permission check against general claims and, when a course
    /// is given, the per-course role. Admin short-circuits everything.
    pub fn permitted(&self, resource: &str, action: &str, course_id: Option<Uuid>) -> bool {
        if self.is_admin {
            return true;
        }
        if self.has_claim(resource, action) {
            return true;
        }
        match course_id {
            Some(course_id) => match self.get_highest_course_role(course_id) {
                Some(role) => role >= minimum_role_for(resource, action),
                None => false,
            },
            None => false,
        }
    }

    /// Whether this principal may hand out `target` in `course_id`.
    ///
    /// An actor assigns only roles at or below their own level, and only
    /// to members currently strictly below the actor.
    pub fn can_assign_role(
        &self,
        course_id: Uuid,
        target: CourseRole,
        target_current: Option<CourseRole>,
    ) -> bool {
        if self.is_admin {
            return true;
        }
        let Some(actor) = self.get_highest_course_role(course_id) else {
            return false;
        };
        if actor < target {
            return false;
        }
        match target_current {
            Some(current) => current < actor,
            None => true,
        }
    }
}

/// Minimum course role required for `action` on a course-scoped resource.
///
/// Reads are open to enrolled members; writes require lecturer unless the
/// resource overrides the rule in its descriptor.
pub fn minimum_role_for(_resource: &str, action: &str) -> CourseRole {
    match action {
        "get" | "list" => CourseRole::Student,
        _ => CourseRole::Lecturer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering_is_strict() {
        assert!(CourseRole::Student < CourseRole::Tutor);
        assert!(CourseRole::Tutor < CourseRole::Lecturer);
        assert!(CourseRole::Lecturer < CourseRole::Maintainer);
        assert!(CourseRole::Maintainer < CourseRole::Owner);
    }

    #[test]
    fn at_or_above_expands_the_hierarchy() {
        assert_eq!(
            CourseRole::at_or_above(CourseRole::Lecturer),
            vec![CourseRole::Lecturer, CourseRole::Maintainer, CourseRole::Owner]
        );
        assert_eq!(CourseRole::at_or_above(CourseRole::Student).len(), 5);
    }

    #[test]
    fn parse_round_trips_every_role() {
        for role in CourseRole::ALL {
            assert_eq!(CourseRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(CourseRole::parse("_professor"), None);
    }

    #[test]
    fn admin_short_circuits_permitted() {
        let p = Principal::admin(Uuid::new_v4());
        assert!(p.permitted("course", "delete", None));
    }

    #[test]
    fn course_role_gates_course_actions() {
        let course = Uuid::new_v4();
        let student = Principal::new(Uuid::new_v4()).with_course_role(course, CourseRole::Student);
        assert!(student.permitted("course_content", "list", Some(course)));
        assert!(!student.permitted("course_content", "update", Some(course)));

        let lecturer = Principal::new(Uuid::new_v4()).with_course_role(course, CourseRole::Lecturer);
        assert!(lecturer.permitted("course_content", "update", Some(course)));
        assert!(!lecturer.permitted("course_content", "update", Some(Uuid::new_v4())));
    }

    #[test]
    fn general_claims_apply_without_a_course() {
        let p = Principal::new(Uuid::new_v4()).with_claim("user", "list");
        assert!(p.permitted("user", "list", None));
        assert!(!p.permitted("user", "delete", None));
    }

    #[test]
    fn with_course_role_keeps_the_highest() {
        let course = Uuid::new_v4();
        let p = Principal::new(Uuid::new_v4())
            .with_course_role(course, CourseRole::Lecturer)
            .with_course_role(course, CourseRole::Student);
        assert_eq!(p.get_highest_course_role(course), Some(CourseRole::Lecturer));
    }

    #[test]
    fn role_assignment_requires_level_dominance() {
        let course = Uuid::new_v4();
        let lecturer = Principal::new(Uuid::new_v4()).with_course_role(course, CourseRole::Lecturer);

        // May assign up to own level, to members below own level.
        assert!(lecturer.can_assign_role(course, CourseRole::Tutor, Some(CourseRole::Student)));
        assert!(lecturer.can_assign_role(course, CourseRole::Lecturer, Some(CourseRole::Tutor)));
        // Never above own level.
        assert!(!lecturer.can_assign_role(course, CourseRole::Owner, Some(CourseRole::Student)));
        // Never to a peer or superior.
        assert!(!lecturer.can_assign_role(course, CourseRole::Tutor, Some(CourseRole::Lecturer)));
        assert!(!lecturer.can_assign_role(course, CourseRole::Tutor, Some(CourseRole::Owner)));
        // Outsiders assign nothing.
        let outsider = Principal::new(Uuid::new_v4());
        assert!(!outsider.can_assign_role(course, CourseRole::Student, None));
    }

    #[test]
    fn courses_with_min_role_filters_by_level() {
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let p = Principal::new(Uuid::new_v4())
            .with_course_role(c1, CourseRole::Student)
            .with_course_role(c2, CourseRole::Lecturer);
        let lecturing = p.courses_with_min_role(CourseRole::Lecturer);
        assert!(lecturing.contains(&c2));
        assert!(!lecturing.contains(&c1));
    }
}
