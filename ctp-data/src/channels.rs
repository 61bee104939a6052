//! WebSocket channel naming and authorization.
//!
//! Channels are `"<scope>:<uuid>"`. Authorization is scope-specific and
//! checked at subscribe time; the gateway never forwards an event to a
//! connection that did not pass this check.

use sqlx::SqlitePool;
use uuid::Uuid;

use ctp_auth::{CourseRole, Principal};
use ctp_core::ApiError;

/// Why a subscription was rejected; serialized into `channel:error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDenied {
    InvalidChannel,
    Forbidden,
}

impl ChannelDenied {
    pub fn reason(&self) -> &'static str {
        match self {
            ChannelDenied::InvalidChannel => "INVALID_CHANNEL",
            ChannelDenied::Forbidden => "FORBIDDEN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelScope {
    User,
    CourseMember,
    SubmissionGroup,
    CourseGroup,
    CourseContent,
    Course,
    CourseFamily,
    Organization,
}

/// A parsed channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub scope: ChannelScope,
    pub id: Uuid,
}

impl Channel {
    pub fn parse(raw: &str) -> Result<Channel, ChannelDenied> {
        let (scope, id) = raw.split_once(':').ok_or(ChannelDenied::InvalidChannel)?;
        let id: Uuid = id.parse().map_err(|_| ChannelDenied::InvalidChannel)?;
        let scope = match scope {
            "user" => ChannelScope::User,
            "course_member" => ChannelScope::CourseMember,
            "submission_group" => ChannelScope::SubmissionGroup,
            "course_group" => ChannelScope::CourseGroup,
            "course_content" => ChannelScope::CourseContent,
            "course" => ChannelScope::Course,
            "course_family" => ChannelScope::CourseFamily,
            "organization" => ChannelScope::Organization,
            _ => return Err(ChannelDenied::InvalidChannel),
        };
        Ok(Channel { scope, id })
    }
}

#[derive(Clone)]
pub struct ChannelAuthorizer {
    pool: SqlitePool,
}

impl ChannelAuthorizer {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Authorize a subscription per the scope's domain rule.
    pub async fn authorize(
        &self,
        principal: &Principal,
        raw: &str,
    ) -> Result<Channel, ChannelDenied> {
        let channel = Channel::parse(raw)?;
        if principal.is_admin {
            return Ok(channel);
        }

        let allowed = match channel.scope {
            ChannelScope::User => channel.id == principal.user_id,
            ChannelScope::CourseMember => self
                .member_course(channel.id)
                .await
                .map(|course| match course {
                    Some((course, user)) => {
                        user == principal.user_id
                            || principal
                                .get_highest_course_role(course)
                                .map(|r| r >= CourseRole::Tutor)
                                .unwrap_or(false)
                    }
                    None => false,
                })
                .unwrap_or(false),
            ChannelScope::SubmissionGroup => {
                self.can_observe_submission_group(principal, channel.id).await
            }
            ChannelScope::Course => principal.get_highest_course_role(channel.id).is_some(),
            ChannelScope::CourseContent => match self.content_course(channel.id).await {
                Ok(Some(course)) => principal.get_highest_course_role(course).is_some(),
                _ => false,
            },
            ChannelScope::CourseGroup => match self.group_course(channel.id).await {
                Ok(Some(course)) => principal.get_highest_course_role(course).is_some(),
                _ => false,
            },
            ChannelScope::CourseFamily => {
                self.member_of_owning_course("course_family_id", channel.id, principal)
                    .await
            }
            ChannelScope::Organization => {
                self.member_of_owning_course("organization_id", channel.id, principal)
                    .await
            }
        };

        if allowed {
            Ok(channel)
        } else {
            Err(ChannelDenied::Forbidden)
        }
    }

    /// Member of the group, or ≥ tutor in the group's course.
    async fn can_observe_submission_group(&self, principal: &Principal, group_id: Uuid) -> bool {
        let is_member: Result<Option<(i64,)>, _> = sqlx::query_as(
            "SELECT 1 FROM submission_group_members sgm \
             JOIN course_members cm ON cm.id = sgm.course_member_id \
             WHERE sgm.submission_group_id = ? AND cm.user_id = ?",
        )
        .bind(group_id)
        .bind(principal.user_id)
        .fetch_optional(&self.pool)
        .await;
        if matches!(is_member, Ok(Some(_))) {
            return true;
        }

        let course: Result<Option<Uuid>, _> = sqlx::query_scalar(
            "SELECT cc.course_id FROM submission_groups sg \
             JOIN course_contents cc ON cc.id = sg.course_content_id WHERE sg.id = ?",
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await;
        match course {
            Ok(Some(course)) => principal
                .get_highest_course_role(course)
                .map(|r| r >= CourseRole::Tutor)
                .unwrap_or(false),
            _ => false,
        }
    }

    async fn content_course(&self, content_id: Uuid) -> Result<Option<Uuid>, ApiError> {
        let course = sqlx::query_scalar("SELECT course_id FROM course_contents WHERE id = ?")
            .bind(content_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(course)
    }

    async fn group_course(&self, group_id: Uuid) -> Result<Option<Uuid>, ApiError> {
        let course = sqlx::query_scalar("SELECT course_id FROM course_groups WHERE id = ?")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(course)
    }

    async fn member_course(&self, member_id: Uuid) -> Result<Option<(Uuid, Uuid)>, ApiError> {
        let row = sqlx::query_as("SELECT course_id, user_id FROM course_members WHERE id = ?")
            .bind(member_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Reachable through any course owned by the hierarchy parent.
    async fn member_of_owning_course(
        &self,
        column: &str,
        parent_id: Uuid,
        principal: &Principal,
    ) -> bool {
        let courses: Result<Vec<Uuid>, _> =
            sqlx::query_scalar(&format!("SELECT id FROM courses WHERE {column} = ?"))
                .bind(parent_id)
                .fetch_all(&self.pool)
                .await;
        match courses {
            Ok(courses) => courses
                .iter()
                .any(|course| principal.get_highest_course_role(*course).is_some()),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_known_scopes() {
        let id = Uuid::new_v4();
        let channel = Channel::parse(&format!("submission_group:{id}")).unwrap();
        assert_eq!(channel.scope, ChannelScope::SubmissionGroup);
        assert_eq!(channel.id, id);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(Channel::parse("nocolon").unwrap_err(), ChannelDenied::InvalidChannel);
        assert_eq!(Channel::parse("course:notauuid").unwrap_err(), ChannelDenied::InvalidChannel);
        assert_eq!(
            Channel::parse(&format!("galaxy:{}", Uuid::new_v4())).unwrap_err(),
            ChannelDenied::InvalidChannel
        );
    }

    #[test]
    fn denial_reasons_are_wire_constants() {
        assert_eq!(ChannelDenied::InvalidChannel.reason(), "INVALID_CHANNEL");
        assert_eq!(ChannelDenied::Forbidden.reason(), "FORBIDDEN");
    }
}
