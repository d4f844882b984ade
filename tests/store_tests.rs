mod common;

use common::{seed_user, setup};
use commonroom::{
    ChatError,
    auth::Role,
    conversations::store as conversations,
    messages::store::{self as messages, MessageKind},
};
use uuid::Uuid;

#[tokio::test]
async fn private_conversation_is_deduplicated_across_both_callers() {
    let pool = setup().await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let b = seed_user(&pool, "B", Role::Member).await;

    let first = conversations::create_private(&pool, &a, b.user_id)
        .await
        .unwrap();
    let second = conversations::create_private(&pool, &b, a.user_id)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.members.len(), 2);
}

#[tokio::test]
async fn private_conversation_with_self_is_rejected() {
    let pool = setup().await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let err = conversations::create_private(&pool, &a, a.user_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation");
}

#[tokio::test]
async fn group_creation_requires_platform_admin() {
    let pool = setup().await;
    let member = seed_user(&pool, "M", Role::Member).await;
    let err = conversations::create_group(&pool, &member, "Study Room", None, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Permission(_)));
}

#[tokio::test]
async fn removing_a_member_appends_a_system_message() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let b = seed_user(&pool, "B", Role::Member).await;

    let group = conversations::create_group(
        &pool,
        &admin,
        "Study Room",
        None,
        &[a.user_id, b.user_id],
    )
    .await
    .unwrap();

    let (group, removed, audit) =
        conversations::remove_members(&pool, &admin, group.id, &[b.user_id])
            .await
            .unwrap();

    assert_eq!(removed, vec![b.user_id]);
    assert!(!group.members.iter().any(|m| m.user_id == b.user_id));
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].kind, MessageKind::System);
    assert_eq!(audit[0].content, "B was removed");

    // the audit trail is visible to remaining members via the log itself
    let log = messages::get_since(&pool, group.id, 0).await.unwrap();
    assert!(log.iter().any(|m| m.content == "B was removed"));
}

#[tokio::test]
async fn the_group_creator_cannot_be_removed() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let a = seed_user(&pool, "A", Role::Member).await;

    let group = conversations::create_group(&pool, &admin, "G", None, &[a.user_id])
        .await
        .unwrap();
    let err = conversations::remove_members(&pool, &admin, group.id, &[admin.user_id])
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Permission(_)));
    assert!(conversations::is_member(&pool, group.id, admin.user_id)
        .await
        .unwrap());
}

#[tokio::test]
async fn membership_changes_by_non_admins_are_rejected_before_mutation() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let b = seed_user(&pool, "B", Role::Member).await;

    let group = conversations::create_group(&pool, &admin, "G", None, &[a.user_id])
        .await
        .unwrap();
    let err = conversations::add_members(&pool, &a, group.id, &[b.user_id])
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Permission(_)));
    assert!(!conversations::is_member(&pool, group.id, b.user_id)
        .await
        .unwrap());
}

#[tokio::test]
async fn appended_messages_are_totally_ordered() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let group = conversations::create_group(&pool, &admin, "G", None, &[a.user_id])
        .await
        .unwrap();

    for i in 0..5 {
        messages::append(
            &pool,
            &a,
            group.id,
            &format!("msg {i}"),
            MessageKind::Text,
            None,
            None,
        )
        .await
        .unwrap();
    }

    let log = messages::get_since(&pool, group.id, 0).await.unwrap();
    let seqs: Vec<i64> = log.iter().map(|m| m.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);
    // strictly increasing, gap-free per conversation
    for pair in seqs.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }
}

#[tokio::test]
async fn get_since_returns_a_missed_message_exactly_once() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let b = seed_user(&pool, "B", Role::Member).await;
    let group =
        conversations::create_group(&pool, &admin, "G", None, &[a.user_id, b.user_id])
            .await
            .unwrap();

    // B went quiet after the last message it saw; A speaks afterwards
    let seen = messages::get_since(&pool, group.id, 0).await.unwrap();
    let cursor = seen.last().map(|m| m.seq).unwrap_or(0);
    let hello = messages::append(&pool, &a, group.id, "hello", MessageKind::Text, None, None)
        .await
        .unwrap();

    let healed = messages::get_since(&pool, group.id, cursor).await.unwrap();
    assert_eq!(
        healed.iter().filter(|m| m.id == hello.id).count(),
        1,
        "hello must appear exactly once"
    );

    // strictly greater: polling from the message's own sequence excludes it
    let after = messages::get_since(&pool, group.id, hello.seq)
        .await
        .unwrap();
    assert!(after.iter().all(|m| m.id != hello.id));
}

#[tokio::test]
async fn reconciliation_cursor_follows_sequence_not_wall_clock() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let group = conversations::create_group(&pool, &admin, "G", None, &[])
        .await
        .unwrap();
    let m1 = messages::append(&pool, &admin, group.id, "first", MessageKind::Text, None, None)
        .await
        .unwrap();
    let m2 = messages::append(&pool, &admin, group.id, "second", MessageKind::Text, None, None)
        .await
        .unwrap();

    // simulate a backward clock step between the two appends
    sqlx::query("UPDATE messages SET created_at_ms=? WHERE id=?")
        .bind(m1.created_at - 1_000)
        .bind(m2.id.to_string())
        .execute(&pool)
        .await
        .unwrap();

    let healed = messages::get_since(&pool, group.id, m1.seq).await.unwrap();
    let ids: Vec<Uuid> = healed.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![m2.id], "the later-sequenced message must still poll");
}

#[tokio::test]
async fn reaction_toggle_is_its_own_inverse() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let b = seed_user(&pool, "B", Role::Member).await;
    let group =
        conversations::create_group(&pool, &admin, "G", None, &[a.user_id, b.user_id])
            .await
            .unwrap();
    let msg = messages::append(&pool, &a, group.id, "hi", MessageKind::Text, None, None)
        .await
        .unwrap();

    let once = messages::react(&pool, &b, msg.id, "👍").await.unwrap();
    assert_eq!(once.reactions.len(), 1);
    assert_eq!(once.reactions[0].user_id, b.user_id);

    let twice = messages::react(&pool, &b, msg.id, "👍").await.unwrap();
    assert!(twice.reactions.is_empty());

    // different users keep independent entries
    messages::react(&pool, &a, msg.id, "👍").await.unwrap();
    let both = messages::react(&pool, &b, msg.id, "👍").await.unwrap();
    assert_eq!(both.reactions.len(), 2);
}

#[tokio::test]
async fn non_sender_non_admin_cannot_edit_or_delete() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let b = seed_user(&pool, "B", Role::Member).await;
    let group =
        conversations::create_group(&pool, &admin, "G", None, &[a.user_id, b.user_id])
            .await
            .unwrap();
    let msg = messages::append(&pool, &a, group.id, "original", MessageKind::Text, None, None)
        .await
        .unwrap();

    let err = messages::edit(&pool, &b, msg.id, "hacked").await.unwrap_err();
    assert!(matches!(err, ChatError::Permission(_)));
    let err = messages::delete(&pool, &b, msg.id).await.unwrap_err();
    assert!(matches!(err, ChatError::Permission(_)));

    let unchanged = messages::get(&pool, msg.id).await.unwrap();
    assert_eq!(unchanged.content, "original");
    assert!(!unchanged.edited);
    assert!(!unchanged.deleted);
}

#[tokio::test]
async fn sender_edit_sets_flag_and_admin_may_edit_too() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let group = conversations::create_group(&pool, &admin, "G", None, &[a.user_id])
        .await
        .unwrap();
    let msg = messages::append(&pool, &a, group.id, "v1", MessageKind::Text, None, None)
        .await
        .unwrap();

    let edited = messages::edit(&pool, &a, msg.id, "v2").await.unwrap();
    assert!(edited.edited);
    assert!(edited.edited_at.is_some());
    assert_eq!(edited.content, "v2");

    let moderated = messages::edit(&pool, &admin, msg.id, "v3").await.unwrap();
    assert_eq!(moderated.content, "v3");
}

#[tokio::test]
async fn soft_deleted_messages_accept_no_further_mutation() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let group = conversations::create_group(&pool, &admin, "G", None, &[a.user_id])
        .await
        .unwrap();
    let msg = messages::append(&pool, &a, group.id, "doomed", MessageKind::Text, None, None)
        .await
        .unwrap();

    let deleted = messages::delete(&pool, &a, msg.id).await.unwrap();
    assert!(deleted.deleted);

    let err = messages::edit(&pool, &a, msg.id, "zombie").await.unwrap_err();
    assert!(matches!(err, ChatError::Conflict(_)));
    let err = messages::react(&pool, &a, msg.id, "👍").await.unwrap_err();
    assert!(matches!(err, ChatError::Conflict(_)));
}

#[tokio::test]
async fn non_members_cannot_append() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let outsider = seed_user(&pool, "X", Role::Member).await;
    let group = conversations::create_group(&pool, &admin, "G", None, &[])
        .await
        .unwrap();

    let err = messages::append(
        &pool,
        &outsider,
        group.id,
        "let me in",
        MessageKind::Text,
        None,
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ChatError::Permission(_)));
}

#[tokio::test]
async fn empty_content_is_rejected() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let group = conversations::create_group(&pool, &admin, "G", None, &[])
        .await
        .unwrap();
    let err = messages::append(&pool, &admin, group.id, "   ", MessageKind::Text, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
}

#[tokio::test]
async fn replies_must_stay_in_the_same_conversation() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let g1 = conversations::create_group(&pool, &admin, "G1", None, &[])
        .await
        .unwrap();
    let g2 = conversations::create_group(&pool, &admin, "G2", None, &[])
        .await
        .unwrap();
    let parent = messages::append(&pool, &admin, g1.id, "root", MessageKind::Text, None, None)
        .await
        .unwrap();

    let err = messages::append(
        &pool,
        &admin,
        g2.id,
        "cross reply",
        MessageKind::Text,
        Some(parent.id),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
}

#[tokio::test]
async fn joining_the_default_group_is_idempotent() {
    let pool = setup().await;
    conversations::ensure_default_group(&pool).await.unwrap();
    let a = seed_user(&pool, "A", Role::Member).await;

    let first = conversations::join_default_group(&pool, &a).await.unwrap();
    assert!(first.is_some());
    assert_eq!(first.unwrap().kind, MessageKind::System);

    let second = conversations::join_default_group(&pool, &a).await.unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn deleting_a_group_cascades_to_messages_and_reactions() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let group = conversations::create_group(&pool, &admin, "G", None, &[a.user_id])
        .await
        .unwrap();
    let msg = messages::append(&pool, &a, group.id, "bye", MessageKind::Text, None, None)
        .await
        .unwrap();
    messages::react(&pool, &admin, msg.id, "👋").await.unwrap();

    conversations::delete_group(&pool, &admin, group.id)
        .await
        .unwrap();

    assert!(matches!(
        conversations::get(&pool, group.id).await.unwrap_err(),
        ChatError::NotFound(_)
    ));
    assert!(matches!(
        messages::get(&pool, msg.id).await.unwrap_err(),
        ChatError::NotFound(_)
    ));
    let leftovers = messages::reactions_of(&pool, msg.id).await.unwrap();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn mark_read_checks_conversation_and_membership() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let g1 = conversations::create_group(&pool, &admin, "G1", None, &[a.user_id])
        .await
        .unwrap();
    let g2 = conversations::create_group(&pool, &admin, "G2", None, &[])
        .await
        .unwrap();
    let msg = messages::append(&pool, &a, g1.id, "hi", MessageKind::Text, None, None)
        .await
        .unwrap();

    messages::mark_read(&pool, &a, g1.id, msg.id).await.unwrap();

    let err = messages::mark_read(&pool, &admin, g2.id, msg.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    let outsider = seed_user(&pool, "X", Role::Member).await;
    let err = messages::mark_read(&pool, &outsider, g1.id, msg.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Permission(_)));
}

#[tokio::test]
async fn paging_returns_newest_pages_first_in_ascending_order() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let group = conversations::create_group(&pool, &admin, "G", None, &[])
        .await
        .unwrap();
    for i in 0..3 {
        messages::append(
            &pool,
            &admin,
            group.id,
            &format!("m{i}"),
            MessageKind::Text,
            None,
            None,
        )
        .await
        .unwrap();
    }

    let page = messages::get_page(&pool, group.id, 0).await.unwrap();
    // creation audit message plus the three sends, oldest first
    let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
    assert!(contents.ends_with(&["m0", "m1", "m2"]));
}

#[tokio::test]
async fn paging_tolerates_absurd_page_numbers() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let group = conversations::create_group(&pool, &admin, "G", None, &[])
        .await
        .unwrap();
    messages::append(&pool, &admin, group.id, "only", MessageKind::Text, None, None)
        .await
        .unwrap();

    for page in [i64::MAX / 10, i64::MAX] {
        let result = messages::get_page(&pool, group.id, page).await.unwrap();
        assert!(result.is_empty(), "page {page} must be past the end");
    }
    // negative pages clamp to the first page
    let first = messages::get_page(&pool, group.id, -1).await.unwrap();
    assert!(first.iter().any(|m| m.content == "only"));
}

#[tokio::test]
async fn failed_batch_removal_mutates_nothing() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let group = conversations::create_group(&pool, &admin, "G", None, &[a.user_id])
        .await
        .unwrap();

    // the creator appears after a valid target in the batch
    let err = conversations::remove_members(&pool, &admin, group.id, &[a.user_id, admin.user_id])
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Permission(_)));

    assert!(conversations::is_member(&pool, group.id, a.user_id)
        .await
        .unwrap());
    let log = messages::get_since(&pool, group.id, 0).await.unwrap();
    assert!(!log.iter().any(|m| m.content == "A was removed"));
}

#[tokio::test]
async fn failed_batch_add_inserts_nobody() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let group = conversations::create_group(&pool, &admin, "G", None, &[])
        .await
        .unwrap();

    let err = conversations::add_members(&pool, &admin, group.id, &[a.user_id, Uuid::now_v7()])
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NotFound(_)));

    assert!(!conversations::is_member(&pool, group.id, a.user_id)
        .await
        .unwrap());
    let log = messages::get_since(&pool, group.id, 0).await.unwrap();
    assert!(!log.iter().any(|m| m.content.contains("added")));
}

#[tokio::test]
async fn edit_window_closes_for_non_admins_only() {
    let pool = setup().await;
    let admin = seed_user(&pool, "Admin", Role::Admin).await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let group = conversations::create_group(&pool, &admin, "G", None, &[a.user_id])
        .await
        .unwrap();
    let msg = messages::append(&pool, &a, group.id, "stale", MessageKind::Text, None, None)
        .await
        .unwrap();

    // age the message past the window
    sqlx::query("UPDATE messages SET created_at_ms = created_at_ms - ? WHERE id=?")
        .bind(messages::EDIT_WINDOW_MS + 60_000)
        .bind(msg.id.to_string())
        .execute(&pool)
        .await
        .unwrap();

    let err = messages::edit(&pool, &a, msg.id, "too late").await.unwrap_err();
    assert!(matches!(err, ChatError::Permission(_)));
    let unchanged = messages::get(&pool, msg.id).await.unwrap();
    assert_eq!(unchanged.content, "stale");

    // admins are not bound by the window
    let moderated = messages::edit(&pool, &admin, msg.id, "corrected").await.unwrap();
    assert_eq!(moderated.content, "corrected");

    // deletion has no age limit for the sender either
    let deleted = messages::delete(&pool, &a, msg.id).await.unwrap();
    assert!(deleted.deleted);
}

#[tokio::test]
async fn unknown_peer_yields_not_found() {
    let pool = setup().await;
    let a = seed_user(&pool, "A", Role::Member).await;
    let err = conversations::create_private(&pool, &a, Uuid::now_v7())
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NotFound(_)));
}
