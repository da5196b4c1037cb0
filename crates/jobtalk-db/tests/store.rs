/// Integration tests for the persisted store against an in-memory database.

use jobtalk_db::Database;
use jobtalk_types::models::ApplicationStatus;
use uuid::Uuid;

struct Parties {
    job: Uuid,
    seeker: Uuid,
    employer: Uuid,
}

fn parties() -> Parties {
    Parties {
        job: Uuid::new_v4(),
        seeker: Uuid::new_v4(),
        employer: Uuid::new_v4(),
    }
}

#[test]
fn upsert_returns_same_conversation() {
    let db = Database::open_in_memory().unwrap();
    let p = parties();

    let first = db.upsert_conversation(p.job, p.seeker, p.employer).unwrap();
    let second = db.upsert_conversation(p.job, p.seeker, p.employer).unwrap();

    assert_eq!(first.id, second.id);
    assert!(first.last_message.is_none());
    assert_eq!(first.unread_jobseeker, 0);
}

#[test]
fn last_message_and_unread_counts_are_derived() {
    let db = Database::open_in_memory().unwrap();
    let p = parties();
    let conv = db.upsert_conversation(p.job, p.seeker, p.employer).unwrap();

    db.insert_message(conv.id, p.seeker, "Hello", None).unwrap();
    db.insert_message(conv.id, p.seeker, "Are you there?", None).unwrap();
    db.insert_message(conv.id, p.employer, "Yes", None).unwrap();

    let conv = db.get_conversation(conv.id).unwrap().unwrap();
    let last = conv.last_message.as_ref().unwrap();
    assert_eq!(last.content, "Yes");
    assert_eq!(last.sender_id, p.employer);
    assert_eq!(conv.unread_employer, 2);
    assert_eq!(conv.unread_jobseeker, 1);

    // The employer reads: only messages from the jobseeker flip.
    assert_eq!(db.mark_read(conv.id, p.employer).unwrap(), 2);
    let conv = db.get_conversation(conv.id).unwrap().unwrap();
    assert_eq!(conv.unread_employer, 0);
    assert_eq!(conv.unread_jobseeker, 1);
}

#[test]
fn history_is_strictly_ordered() {
    let db = Database::open_in_memory().unwrap();
    let p = parties();
    let conv = db.upsert_conversation(p.job, p.seeker, p.employer).unwrap();

    for i in 0..50 {
        let sender = if i % 2 == 0 { p.seeker } else { p.employer };
        db.insert_message(conv.id, sender, &format!("m{}", i), None).unwrap();
    }

    let history = db.get_messages(conv.id).unwrap();
    assert_eq!(history.len(), 50);
    for (i, pair) in history.windows(2).enumerate() {
        // Back-to-back inserts never share a timestamp, so send order survives.
        assert!(pair[0].created_at < pair[1].created_at, "at {}", i);
    }
    let contents: Vec<_> = history.iter().map(|m| m.content.clone()).collect();
    let expected: Vec<_> = (0..50).map(|i| format!("m{}", i)).collect();
    assert_eq!(contents, expected);
}

#[test]
fn client_marker_makes_insert_idempotent() {
    let db = Database::open_in_memory().unwrap();
    let p = parties();
    let conv = db.upsert_conversation(p.job, p.seeker, p.employer).unwrap();
    let marker = Uuid::new_v4();

    let (first, inserted) = db.insert_message(conv.id, p.seeker, "once", Some(marker)).unwrap();
    assert!(inserted);
    let (again, inserted) = db.insert_message(conv.id, p.seeker, "once", Some(marker)).unwrap();
    assert!(!inserted);

    assert_eq!(first, again);
    assert_eq!(first.client_marker, Some(marker));
    assert_eq!(db.get_messages(conv.id).unwrap().len(), 1);
}

#[test]
fn phone_flag_is_one_way_and_per_direction() {
    let db = Database::open_in_memory().unwrap();
    let p = parties();
    let conv = db.upsert_conversation(p.job, p.seeker, p.employer).unwrap();

    assert!(db.set_phone_shared(conv.id, p.seeker).unwrap());
    assert!(db.set_phone_shared(conv.id, p.seeker).unwrap());
    let conv_now = db.get_conversation(conv.id).unwrap().unwrap();
    assert!(conv_now.phone_shared_by_jobseeker);
    assert!(!conv_now.phone_shared_by_employer);
    assert!(conv_now.can_reveal_phone(p.employer));

    // Outsiders cannot flip anything.
    assert!(!db.set_phone_shared(conv.id, Uuid::new_v4()).unwrap());
    assert!(!db.set_phone_shared(Uuid::new_v4(), p.seeker).unwrap());
}

#[test]
fn application_status_transitions() {
    let db = Database::open_in_memory().unwrap();
    let p = parties();

    assert!(db.get_application(p.job, p.seeker).unwrap().is_none());
    assert!(db
        .update_application_status(p.job, p.seeker, ApplicationStatus::Accepted)
        .unwrap()
        .is_none());

    let link = db.apply(p.job, p.seeker, p.employer).unwrap();
    assert_eq!(link.status, ApplicationStatus::Applied);
    assert_eq!(link.employer_id, p.employer);

    let link = db
        .update_application_status(p.job, p.seeker, ApplicationStatus::Rejected)
        .unwrap()
        .unwrap();
    assert_eq!(link.status, ApplicationStatus::Rejected);

    // Re-applying does not resurrect a rejected application.
    let link = db.apply(p.job, p.seeker, p.employer).unwrap();
    assert_eq!(link.status, ApplicationStatus::Rejected);
}

#[test]
fn hire_requests_are_keyed_by_pair() {
    let db = Database::open_in_memory().unwrap();
    let p = parties();

    assert!(!db.hire_request_exists(p.employer, p.seeker).unwrap());
    let first = db.create_hire_request(p.job, p.employer, p.seeker).unwrap();
    let again = db.create_hire_request(p.job, p.employer, p.seeker).unwrap();
    assert_eq!(first.id, again.id);

    assert!(db.hire_request_exists(p.employer, p.seeker).unwrap());
    assert!(!db.hire_request_exists(p.seeker, p.employer).unwrap());
}

#[test]
fn list_orders_by_latest_activity() {
    let db = Database::open_in_memory().unwrap();
    let seeker = Uuid::new_v4();
    let (e1, e2, e3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    let quiet = db.upsert_conversation(Uuid::new_v4(), seeker, e1).unwrap();
    let older = db.upsert_conversation(Uuid::new_v4(), seeker, e2).unwrap();
    let newer = db.upsert_conversation(Uuid::new_v4(), seeker, e3).unwrap();

    db.insert_message(older.id, seeker, "first", None).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(2));
    db.insert_message(newer.id, e3, "second", None).unwrap();

    let ids: Vec<_> = db.list_conversations(seeker).unwrap().iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![newer.id, older.id, quiet.id]);

    // Only participants see a conversation.
    assert_eq!(db.list_conversations(e1).unwrap().len(), 1);
    assert!(db.list_conversations(Uuid::new_v4()).unwrap().is_empty());
}

#[test]
fn file_database_reopens_with_data() {
    let path = std::env::temp_dir().join(format!("jobtalk_store_test_{}.db", Uuid::new_v4()));
    let p = parties();

    let conv_id = {
        let db = Database::open(&path).unwrap();
        let conv = db.upsert_conversation(p.job, p.seeker, p.employer).unwrap();
        db.insert_message(conv.id, p.seeker, "persisted", None).unwrap();
        conv.id
    };

    let db = Database::open(&path).unwrap();
    let history = db.get_messages(conv_id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "persisted");

    drop(db);
    let _ = std::fs::remove_file(&path);
}
