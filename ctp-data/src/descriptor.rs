//! Entity descriptors: the data-first record the CRUD dispatcher runs on.
//!
//! Each entity publishes its table, REST resource, course linkage, column
//! shapes, and the minimum course roles per action. The dispatcher is a
//! generic procedure over this record; there is one descriptor per
//! uniform resource, and specialized modules (messages, sessions, tasks)
//! keep their own handlers.

use std::time::Duration;

use ctp_auth::CourseRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColKind {
    Uuid,
    Text,
    Int,
    Float,
    Bool,
    Json,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writable {
    /// Never accepted from payloads (server-derived).
    Never,
    /// Accepted on create, immutable afterwards.
    CreateOnly,
    /// Accepted on create and update.
    Always,
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColKind,
    pub writable: Writable,
    /// Must be present in the create payload.
    pub required: bool,
    /// Exposed as an equality query parameter on list.
    pub filterable: bool,
    /// Never serialized into responses.
    pub hidden: bool,
}

/// How an entity is reachable from a course, for permission predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CourseLink {
    /// No course reachability: admin or general claims only.
    Unscoped,
    /// The entity IS the course; matches its own id.
    OwnId,
    /// Direct `course_id`-style column.
    Direct(&'static str),
    /// One hop through `course_contents`.
    ViaContent(&'static str),
    /// One hop through `course_members`.
    ViaMember(&'static str),
    /// Two hops: submission group → course content → course.
    ViaGroup(&'static str),
    /// Three hops: artifact → submission group → course content → course.
    ViaArtifact(&'static str),
    /// Hierarchy parents (organizations, course families): reachable via
    /// the named column of any course they own.
    OwnedByCourses(&'static str),
    /// Users: themselves, plus co-members of courses they tutor.
    UserVisibility,
}

#[derive(Debug, Clone, Copy)]
pub struct EntityDescriptor {
    /// REST path segment and permission resource name.
    pub resource: &'static str,
    pub table: &'static str,
    pub course_link: CourseLink,
    pub soft_delete: bool,
    pub cache_ttl: Duration,
    /// Stable default ordering for lists.
    pub default_order: &'static str,
    pub columns: &'static [ColumnSpec],
    pub read_min_role: CourseRole,
    pub write_min_role: CourseRole,
}

impl EntityDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn min_role_for(&self, action: &str) -> CourseRole {
        match action {
            "get" | "list" => self.read_min_role,
            _ => self.write_min_role,
        }
    }
}

macro_rules! is_required {
    (required) => { true };
    ($other:ident) => { false };
}
macro_rules! is_filterable {
    (filterable) => { true };
    ($other:ident) => { false };
}
macro_rules! is_hidden {
    (hidden) => { true };
    ($other:ident) => { false };
}
macro_rules! is_readonly {
    (readonly) => { true };
    ($other:ident) => { false };
}
macro_rules! is_create_only {
    (create_only) => { true };
    ($other:ident) => { false };
}

macro_rules! col {
    ($name:literal, $kind:ident $(, $flag:ident)*) => {
        ColumnSpec {
            name: $name,
            kind: ColKind::$kind,
            writable: if false $(|| is_readonly!($flag))* {
                Writable::Never
            } else if false $(|| is_create_only!($flag))* {
                Writable::CreateOnly
            } else {
                Writable::Always
            },
            required: false $(|| is_required!($flag))*,
            filterable: false $(|| is_filterable!($flag))*,
            hidden: false $(|| is_hidden!($flag))*,
        }
    };
}

const TTL_SHORT: Duration = Duration::from_secs(300);
const TTL_CATALOG: Duration = Duration::from_secs(900);

pub static USER: EntityDescriptor = EntityDescriptor {
    resource: "users",
    table: "users",
    course_link: CourseLink::UserVisibility,
    soft_delete: true,
    cache_ttl: TTL_SHORT,
    default_order: "username ASC",
    columns: &[
        col!("username", Text, required, filterable, create_only),
        col!("email", Text, filterable),
        col!("given_name", Text),
        col!("family_name", Text),
        col!("password_hash", Text, readonly, hidden),
        col!("is_service", Bool, readonly, filterable),
        col!("password_reset_required", Bool, readonly),
    ],
    // User visibility keys on tutoring: you see yourself plus the members
    // of courses you tutor.
    read_min_role: CourseRole::Tutor,
    write_min_role: CourseRole::Lecturer,
};

pub static ORGANIZATION: EntityDescriptor = EntityDescriptor {
    resource: "organizations",
    table: "organizations",
    course_link: CourseLink::OwnedByCourses("organization_id"),
    soft_delete: true,
    cache_ttl: TTL_CATALOG,
    default_order: "title ASC",
    columns: &[
        col!("title", Text, required),
        col!("slug", Text, required, filterable, create_only),
        col!("properties", Json),
    ],
    read_min_role: CourseRole::Student,
    write_min_role: CourseRole::Maintainer,
};

pub static COURSE_FAMILY: EntityDescriptor = EntityDescriptor {
    resource: "course-families",
    table: "course_families",
    course_link: CourseLink::OwnedByCourses("course_family_id"),
    soft_delete: true,
    cache_ttl: TTL_CATALOG,
    default_order: "title ASC",
    columns: &[
        col!("title", Text, required),
        col!("slug", Text, required, filterable, create_only),
        col!("organization_id", Uuid, required, filterable, create_only),
        col!("properties", Json),
    ],
    read_min_role: CourseRole::Student,
    write_min_role: CourseRole::Maintainer,
};

pub static COURSE: EntityDescriptor = EntityDescriptor {
    resource: "courses",
    table: "courses",
    course_link: CourseLink::OwnId,
    soft_delete: true,
    cache_ttl: TTL_CATALOG,
    default_order: "title ASC",
    columns: &[
        col!("title", Text, required),
        col!("slug", Text, required, filterable, create_only),
        col!("course_family_id", Uuid, required, filterable, create_only),
        col!("organization_id", Uuid, required, filterable, create_only),
        col!("properties", Json),
    ],
    read_min_role: CourseRole::Student,
    write_min_role: CourseRole::Maintainer,
};

pub static COURSE_CONTENT: EntityDescriptor = EntityDescriptor {
    resource: "course-contents",
    table: "course_contents",
    course_link: CourseLink::Direct("course_id"),
    soft_delete: true,
    cache_ttl: TTL_SHORT,
    default_order: "path ASC",
    columns: &[
        col!("title", Text, required),
        col!("course_id", Uuid, required, filterable, create_only),
        col!("path", Text, required, filterable),
        col!("kind", Text, filterable),
        col!("content_type", Text),
        col!("max_group_size", Int),
        col!("properties", Json),
    ],
    read_min_role: CourseRole::Student,
    write_min_role: CourseRole::Lecturer,
};

pub static COURSE_GROUP: EntityDescriptor = EntityDescriptor {
    resource: "course-groups",
    table: "course_groups",
    course_link: CourseLink::Direct("course_id"),
    soft_delete: true,
    cache_ttl: TTL_SHORT,
    default_order: "title ASC",
    columns: &[
        col!("title", Text, required),
        col!("course_id", Uuid, required, filterable, create_only),
        col!("properties", Json),
    ],
    read_min_role: CourseRole::Student,
    write_min_role: CourseRole::Lecturer,
};

pub static COURSE_MEMBER: EntityDescriptor = EntityDescriptor {
    resource: "course-members",
    table: "course_members",
    course_link: CourseLink::Direct("course_id"),
    soft_delete: true,
    cache_ttl: TTL_SHORT,
    default_order: "created_at ASC",
    columns: &[
        col!("user_id", Uuid, required, filterable, create_only),
        col!("course_id", Uuid, required, filterable, create_only),
        col!("course_role_id", Text, required, filterable),
        col!("course_group_id", Uuid, filterable),
        col!("properties", Json),
    ],
    read_min_role: CourseRole::Student,
    write_min_role: CourseRole::Lecturer,
};

pub static SUBMISSION_GROUP: EntityDescriptor = EntityDescriptor {
    resource: "submission-groups",
    table: "submission_groups",
    course_link: CourseLink::ViaContent("course_content_id"),
    soft_delete: true,
    cache_ttl: TTL_SHORT,
    default_order: "created_at ASC",
    columns: &[
        col!("course_content_id", Uuid, required, filterable, create_only),
        col!("max_group_size", Int),
        col!("max_submissions", Int),
        col!("max_test_runs", Int),
        col!("properties", Json),
    ],
    read_min_role: CourseRole::Tutor,
    write_min_role: CourseRole::Lecturer,
};

pub static SUBMISSION_GROUP_MEMBER: EntityDescriptor = EntityDescriptor {
    resource: "submission-group-members",
    table: "submission_group_members",
    course_link: CourseLink::ViaMember("course_member_id"),
    soft_delete: false,
    cache_ttl: TTL_SHORT,
    default_order: "created_at ASC",
    columns: &[
        col!("submission_group_id", Uuid, required, filterable, create_only),
        col!("course_member_id", Uuid, required, filterable, create_only),
    ],
    read_min_role: CourseRole::Tutor,
    write_min_role: CourseRole::Lecturer,
};

pub static SUBMISSION_ARTIFACT: EntityDescriptor = EntityDescriptor {
    resource: "submissions",
    table: "submission_artifacts",
    course_link: CourseLink::ViaGroup("submission_group_id"),
    soft_delete: true,
    cache_ttl: TTL_SHORT,
    default_order: "created_at DESC",
    columns: &[
        col!("submission_group_id", Uuid, required, filterable, create_only),
        col!("bucket", Text, required, create_only),
        col!("object_key", Text, required, create_only),
        col!("submit", Bool, filterable),
        col!("properties", Json),
    ],
    read_min_role: CourseRole::Tutor,
    write_min_role: CourseRole::Tutor,
};

pub static RESULT: EntityDescriptor = EntityDescriptor {
    resource: "results",
    table: "results",
    course_link: CourseLink::ViaGroup("submission_group_id"),
    soft_delete: true,
    cache_ttl: TTL_SHORT,
    default_order: "created_at DESC",
    columns: &[
        col!("submission_artifact_id", Uuid, filterable, create_only),
        col!("submission_group_id", Uuid, required, filterable, create_only),
        col!("course_member_id", Uuid, filterable, create_only),
        col!("execution_backend", Text, filterable),
        col!("status", Int, required, filterable),
        col!("score", Float),
        col!("result_json", Json),
        col!("version_identifier", Text, required, create_only),
    ],
    read_min_role: CourseRole::Tutor,
    write_min_role: CourseRole::Tutor,
};

pub static SUBMISSION_GRADE: EntityDescriptor = EntityDescriptor {
    resource: "submission-grades",
    table: "submission_grades",
    course_link: CourseLink::ViaArtifact("submission_artifact_id"),
    soft_delete: true,
    cache_ttl: TTL_SHORT,
    default_order: "created_at DESC",
    columns: &[
        col!("submission_artifact_id", Uuid, required, filterable, create_only),
        col!("graded_by_course_member_id", Uuid, filterable),
        col!("grade", Float),
        col!("status", Int, filterable),
        col!("review", Text),
        col!("properties", Json),
    ],
    read_min_role: CourseRole::Tutor,
    write_min_role: CourseRole::Tutor,
};

/// Every resource served by the uniform dispatcher, in mount order.
pub static REGISTRY: &[&EntityDescriptor] = &[
    &USER,
    &ORGANIZATION,
    &COURSE_FAMILY,
    &COURSE,
    &COURSE_CONTENT,
    &COURSE_GROUP,
    &COURSE_MEMBER,
    &SUBMISSION_GROUP,
    &SUBMISSION_GROUP_MEMBER,
    &SUBMISSION_ARTIFACT,
    &RESULT,
    &SUBMISSION_GRADE,
];

pub fn find(resource: &str) -> Option<&'static EntityDescriptor> {
    REGISTRY.iter().copied().find(|d| d.resource == resource)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resources_are_unique() {
        for (i, a) in REGISTRY.iter().enumerate() {
            for b in &REGISTRY[i + 1..] {
                assert_ne!(a.resource, b.resource);
                assert_ne!(a.table, b.table);
            }
        }
    }

    #[test]
    fn secrets_are_hidden_and_readonly() {
        let hash = USER.column("password_hash").unwrap();
        assert!(hash.hidden);
        assert_eq!(hash.writable, Writable::Never);
    }

    #[test]
    fn column_macro_flags_apply() {
        let username = USER.column("username").unwrap();
        assert!(username.required);
        assert!(username.filterable);
        assert_eq!(username.writable, Writable::CreateOnly);

        let email = USER.column("email").unwrap();
        assert!(!email.required);
        assert_eq!(email.writable, Writable::Always);
    }

    #[test]
    fn lookup_by_resource_name() {
        assert_eq!(find("courses").unwrap().table, "courses");
        assert!(find("nope").is_none());
    }

    #[test]
    fn submissions_require_tutor_reads() {
        assert_eq!(SUBMISSION_ARTIFACT.min_role_for("list"), CourseRole::Tutor);
        assert_eq!(COURSE_CONTENT.min_role_for("list"), CourseRole::Student);
        assert_eq!(COURSE_CONTENT.min_role_for("update"), CourseRole::Lecturer);
    }
}
