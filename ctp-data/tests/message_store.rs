mod common;

use std::sync::Arc;

use uuid::Uuid;

use ctp_auth::Principal;
use ctp_core::PageParams;
use ctp_data::message::{MessageCreate, MessageQuery, MessageScope, MessageStore, MessageUpdate};
use ctp_events::{Broker, InMemoryBroker};

use common::{
    add_group_member, enroll, insert_user, principal_for, seed_content, seed_course,
    seed_course_group, seed_submission_group, test_pool,
};

fn create_payload(title: &str) -> MessageCreate {
    MessageCreate {
        title: title.to_string(),
        content: "body".to_string(),
        ..Default::default()
    }
}

async fn store_with_broker() -> (MessageStore, sqlx::SqlitePool, Arc<InMemoryBroker>) {
    let pool = test_pool().await;
    let broker = Arc::new(InMemoryBroker::new());
    let store = MessageStore::new(pool.clone(), broker.clone());
    (store, pool, broker)
}

#[tokio::test]
async fn untargeted_message_defaults_to_the_author_user_scope() {
    let (store, pool, _) = store_with_broker().await;
    let author = insert_user(&pool, "alice").await;
    let principal = Principal::new(author);

    let message = store.create(&principal, create_payload("hi")).await.unwrap();
    assert_eq!(message.scope, Some(MessageScope::User));
    assert_eq!(message.user_id, Some(author));
    assert_eq!(message.author_id, author);
    assert!(!message.is_read);
}

#[tokio::test]
async fn course_messages_require_lecturer() {
    let (store, pool, broker) = store_with_broker().await;
    let (_, _, course) = seed_course(&pool, "prog1").await;

    let tutor = insert_user(&pool, "tutor1").await;
    enroll(&pool, tutor, course, "_tutor").await;
    let tutor_principal = principal_for(&pool, tutor).await;

    let mut payload = create_payload("hi");
    payload.course_id = Some(course);
    let err = store.create(&tutor_principal, payload.clone()).await.unwrap_err();
    assert_eq!(err.code, "AUTHZ_001");

    let lecturer = insert_user(&pool, "lect1").await;
    enroll(&pool, lecturer, course, "_lecturer").await;
    let lecturer_principal = principal_for(&pool, lecturer).await;

    let mut subscriber = broker.subscribe();
    let message = store.create(&lecturer_principal, payload).await.unwrap();
    assert_eq!(message.scope, Some(MessageScope::Course));

    // The create broadcast lands on the course channel.
    let event = subscriber.recv().await.unwrap();
    assert_eq!(event.channel, format!("course:{course}"));
    assert_eq!(event.envelope.event_type, "message:new");
}

#[tokio::test]
async fn submission_group_posting_rules() {
    let (store, pool, _) = store_with_broker().await;
    let (_, _, course) = seed_course(&pool, "prog1").await;
    let content = seed_content(&pool, course, "w1.ex1").await;
    let group = seed_submission_group(&pool, content).await;

    let member_user = insert_user(&pool, "member").await;
    let member = enroll(&pool, member_user, course, "_student").await;
    add_group_member(&pool, group, member).await;

    let other_student_user = insert_user(&pool, "bystander").await;
    enroll(&pool, other_student_user, course, "_student").await;

    let tutor_user = insert_user(&pool, "tutor1").await;
    enroll(&pool, tutor_user, course, "_tutor").await;

    let mut payload = create_payload("question");
    payload.submission_group_id = Some(group);

    // A group member may post.
    let member_principal = principal_for(&pool, member_user).await;
    store.create(&member_principal, payload.clone()).await.unwrap();

    // A non-member student may not.
    let bystander = principal_for(&pool, other_student_user).await;
    let err = store.create(&bystander, payload.clone()).await.unwrap_err();
    assert_eq!(err.code, "AUTHZ_001");

    // A tutor (non-student role) may.
    let tutor_principal = principal_for(&pool, tutor_user).await;
    store.create(&tutor_principal, payload).await.unwrap();
}

#[tokio::test]
async fn course_group_messages_are_read_only_and_dms_are_stubbed() {
    let (store, pool, _) = store_with_broker().await;
    let (_, _, course) = seed_course(&pool, "prog1").await;
    let group = seed_course_group(&pool, course, "Group A").await;
    let user = insert_user(&pool, "alice").await;
    enroll(&pool, user, course, "_lecturer").await;
    let principal = principal_for(&pool, user).await;

    let mut payload = create_payload("hi");
    payload.course_group_id = Some(group);
    let err = store.create(&principal, payload).await.unwrap_err();
    assert_eq!(err.code, "AUTHZ_001");

    let mut payload = create_payload("hi");
    payload.user_id = Some(insert_user(&pool, "bob").await);
    let err = store.create(&principal, payload).await.unwrap_err();
    assert_eq!(err.code, "NI_001");
    assert_eq!(err.status().as_u16(), 501);
}

#[tokio::test]
async fn multiple_targets_are_rejected() {
    let (store, pool, _) = store_with_broker().await;
    let user = insert_user(&pool, "alice").await;
    let principal = Principal::new(user);

    let mut payload = create_payload("hi");
    payload.user_id = Some(user);
    payload.course_id = Some(Uuid::new_v4());
    let err = store.create(&principal, payload).await.unwrap_err();
    assert_eq!(err.code, "VAL_001");
}

#[tokio::test]
async fn replies_inherit_the_parent_target() {
    let (store, pool, _) = store_with_broker().await;
    let (_, _, course) = seed_course(&pool, "prog1").await;
    let lecturer = insert_user(&pool, "lect1").await;
    enroll(&pool, lecturer, course, "_lecturer").await;
    let principal = principal_for(&pool, lecturer).await;

    let mut root = create_payload("announcement");
    root.course_id = Some(course);
    let root = store.create(&principal, root).await.unwrap();

    // A student replies without naming a target: inherited.
    let student = insert_user(&pool, "student1").await;
    enroll(&pool, student, course, "_student").await;
    let student_principal = principal_for(&pool, student).await;

    let mut reply = create_payload("re: announcement");
    reply.parent_id = Some(root.id);
    let reply = store.create(&student_principal, reply).await.unwrap();
    assert_eq!(reply.scope, Some(MessageScope::Course));
    assert_eq!(reply.course_id, Some(course));
    assert_eq!(reply.level, 1);

    // A disagreeing explicit target is rejected.
    let mut conflicting = create_payload("re");
    conflicting.parent_id = Some(root.id);
    conflicting.course_id = Some(Uuid::new_v4());
    let err = store.create(&student_principal, conflicting).await.unwrap_err();
    assert_eq!(err.code, "VAL_001");
}

#[tokio::test]
async fn visibility_follows_course_membership() {
    let (store, pool, _) = store_with_broker().await;
    let (_, _, course) = seed_course(&pool, "prog1").await;
    let lecturer = insert_user(&pool, "lect1").await;
    enroll(&pool, lecturer, course, "_lecturer").await;
    let principal = principal_for(&pool, lecturer).await;

    let mut payload = create_payload("announcement");
    payload.course_id = Some(course);
    let message = store.create(&principal, payload).await.unwrap();

    // A member of the course sees it.
    let student = insert_user(&pool, "student1").await;
    enroll(&pool, student, course, "_student").await;
    let student_principal = principal_for(&pool, student).await;
    store.get(&student_principal, message.id).await.unwrap();

    // An outsider gets 404.
    let outsider = Principal::new(insert_user(&pool, "outsider").await);
    let err = store.get(&outsider, message.id).await.unwrap_err();
    assert_eq!(err.code, "NF_001");
}

#[tokio::test]
async fn update_is_author_only_and_audited() {
    let (store, pool, _) = store_with_broker().await;
    let author = insert_user(&pool, "alice").await;
    let principal = Principal::new(author);
    let message = store.create(&principal, create_payload("draft")).await.unwrap();

    let updated = store
        .update(
            &principal,
            message.id,
            MessageUpdate {
                title: Some("final".to_string()),
                content: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.title, "final");

    // Audit: created + updated, newest first; the update entry captures
    // only the changed field.
    let audit = store.audit_history(&principal, message.id).await.unwrap();
    assert_eq!(audit.len(), 2);
    assert_eq!(audit[0].action, "updated");
    assert_eq!(audit[0].old_title.as_deref(), Some("draft"));
    assert_eq!(audit[0].new_title.as_deref(), Some("final"));
    assert!(audit[0].old_content.is_none());
    assert_eq!(audit[1].action, "created");

    // Admin may read the audit; someone else who can see the message may
    // not. (Send a course message for the cross-user case.)
    let admin = Principal::admin(insert_user(&pool, "root").await);
    store.audit_history(&admin, message.id).await.unwrap();
}

#[tokio::test]
async fn soft_delete_tombstones_and_blocks_updates() {
    let (store, pool, _) = store_with_broker().await;
    let author = insert_user(&pool, "alice").await;
    let principal = Principal::new(author);
    let message = store.create(&principal, create_payload("secret plan")).await.unwrap();

    let deleted = store.soft_delete(&principal, message.id, "user_request").await.unwrap();
    assert!(deleted.archived_at.is_some());
    assert_eq!(deleted.title, "[Message deleted by author]");
    assert_eq!(deleted.properties["deletion_reason"], "user_request");
    assert_eq!(deleted.properties["deleted_by"], "author");

    // Original text survives only in the audit trail.
    let audit = store.audit_history(&principal, message.id).await.unwrap();
    assert_eq!(audit[0].action, "deleted");
    assert_eq!(audit[0].old_title.as_deref(), Some("secret plan"));

    // Deleted messages refuse updates but tolerate repeated deletes.
    let err = store
        .update(
            &principal,
            message.id,
            MessageUpdate {
                title: Some("x".to_string()),
                content: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, "AUTHZ_001");
    store.soft_delete(&principal, message.id, "again").await.unwrap();

    // Tombstoned messages still appear in listings for the author.
    let (items, _) = store
        .list(&principal, &MessageQuery::default(), PageParams::default())
        .await
        .unwrap();
    assert!(items.iter().any(|m| m.id == message.id));
}

#[tokio::test]
async fn read_receipts_are_idempotent_and_exact() {
    let (store, pool, _) = store_with_broker().await;
    let author = insert_user(&pool, "alice").await;
    let principal = Principal::new(author);
    let message = store.create(&principal, create_payload("hi")).await.unwrap();

    store.mark_read(&principal, message.id).await.unwrap();
    store.mark_read(&principal, message.id).await.unwrap();
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM message_reads WHERE message_id = ?")
            .bind(message.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
    assert!(store.get(&principal, message.id).await.unwrap().is_read);

    store.mark_unread(&principal, message.id).await.unwrap();
    assert!(!store.get(&principal, message.id).await.unwrap().is_read);
}

#[tokio::test]
async fn list_supports_scope_unread_and_tag_filters() {
    let (store, pool, _) = store_with_broker().await;
    let (_, _, course) = seed_course(&pool, "prog1").await;
    let lecturer = insert_user(&pool, "lect1").await;
    enroll(&pool, lecturer, course, "_lecturer").await;
    let principal = principal_for(&pool, lecturer).await;

    let mut course_msg = create_payload("update #ai::request #priority::high");
    course_msg.course_id = Some(course);
    let course_msg = store.create(&principal, course_msg).await.unwrap();
    let personal = store.create(&principal, create_payload("note #ai::reply")).await.unwrap();

    // Scope filter.
    let (items, _) = store
        .list(
            &principal,
            &MessageQuery {
                scope: Some("course".to_string()),
                ..Default::default()
            },
            PageParams::default(),
        )
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, course_msg.id);

    // Tag ANY-match picks up both; ALL-match only the course message.
    let any = MessageQuery {
        tags: vec!["ai::request".to_string(), "ai::reply".to_string()],
        tags_match_all: false,
        ..Default::default()
    };
    let (items, _) = store.list(&principal, &any, PageParams::default()).await.unwrap();
    assert_eq!(items.len(), 2);

    let all = MessageQuery {
        tags: vec!["ai::request".to_string(), "priority::high".to_string()],
        tags_match_all: true,
        ..Default::default()
    };
    let (items, _) = store.list(&principal, &all, PageParams::default()).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, course_msg.id);

    // Scope wildcard matches any #ai::* tag.
    let wildcard = MessageQuery {
        tag_scope: Some("ai".to_string()),
        ..Default::default()
    };
    let (items, _) = store.list(&principal, &wildcard, PageParams::default()).await.unwrap();
    assert_eq!(items.len(), 2);

    // Unread filter flips after marking one read.
    store.mark_read(&principal, personal.id).await.unwrap();
    let unread = MessageQuery {
        unread: Some(true),
        ..Default::default()
    };
    let (items, _) = store.list(&principal, &unread, PageParams::default()).await.unwrap();
    assert!(items.iter().all(|m| m.id != personal.id));
}
