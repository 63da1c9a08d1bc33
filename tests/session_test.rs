//! Integration tests for mgo-compat.
//!
//! Tests marked `#[ignore]` need a MongoDB server at `MONGODB_TEST_URL`
//! (default `mongodb://localhost:27017/mgo_compat_test`) and run with
//! `cargo test -- --ignored`. Each of them works in a fresh database.

use chrono::{DateTime, TimeZone, Utc};
use mgo_compat::legacy::serde_helpers;
use mgo_compat::prelude::*;
use mgo_compat::{BulkResult, ErrorKind, GridFs, Iter, ModernMgo, Pipe};
use pretty_assertions::assert_eq;

// ============================================================================
// Helpers
// ============================================================================

fn test_url() -> String {
    std::env::var("MONGODB_TEST_URL")
        .unwrap_or_else(|_| "mongodb://localhost:27017/mgo_compat_test".to_string())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A session plus a database nobody else uses.
async fn fresh_db() -> (Session, Database) {
    init_tracing();
    let session = Session::dial(&test_url()).await.unwrap();
    let name = format!("mgo_compat_{}", ObjectId::new().hex());
    let db = session.db(&name);
    (session, db)
}

async fn cleanup(session: Session, db: Database) {
    db.drop_database().await.unwrap();
    session.close().await;
}

fn ms(v: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(v).unwrap()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Person {
    #[serde(rename = "_id", default, skip_serializing_if = "ObjectId::is_empty")]
    id: ObjectId,
    name: String,
    age: i32,
    #[serde(default)]
    city: String,
}

// ============================================================================
// Offline Tests
// ============================================================================

mod offline_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_dial_parses_default_database() {
        let session = Session::dial("mongodb://localhost:1/inventory").await.unwrap();
        assert_eq!(session.default_db_name(), "inventory");
        assert_eq!(session.db("").name(), "inventory");
        assert_eq!(session.db("other").name(), "other");
        session.close().await;

        let session = ModernMgo::dial_modern("mongodb://localhost:1").await.unwrap();
        assert_eq!(session.default_db_name(), "test");
        session.close().await;
    }

    #[tokio::test]
    async fn test_copy_keeps_settings() {
        let mut session = Session::dial("mongodb://localhost:1/app").await.unwrap();
        session.set_mode(Mode::Nearest, false);
        session.set_safe(Some(Safe {
            w_mode: "majority".into(),
            ..Safe::default()
        }));

        let copy = session.copy();
        assert_eq!(copy.mode(), Mode::Nearest);
        assert_eq!(copy.safe().map(|s| s.w_mode.as_str()), Some("majority"));
        copy.close().await;
        session.close().await;
    }

    #[tokio::test]
    async fn test_collection_names() {
        let session = Session::dial("mongodb://localhost:1/app").await.unwrap();
        let people = session.db("").c("people");
        assert_eq!(people.name(), "people");
        assert_eq!(people.full_name(), "app.people");

        let fs: GridFs = session.db("").gridfs("fs");
        assert_eq!(fs.files().full_name(), "app.fs.files");
        assert_eq!(fs.chunks().full_name(), "app.fs.chunks");
        session.close().await;
    }

    #[tokio::test]
    async fn test_argument_errors_need_no_server() {
        let session = Session::dial("mongodb://localhost:1/app").await.unwrap();
        let people = session.db("").c("people");

        let mut out = M::new();
        let err = people.find(&5).one(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = people.find(&m! {}).sort(&["-"]).count().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = people.insert::<M>(&[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let mut bulk = people.bulk();
        bulk.insert(&["not a document"]);
        assert_eq!(bulk.run().await.unwrap_err().kind(), ErrorKind::InvalidArgument);

        let pipe: Pipe = people.pipe(&vec![Value::from(1)]);
        let mut rows: Vec<M> = Vec::new();
        assert!(pipe.all(&mut rows).await.is_err());

        let mut iter: Iter = people.find(&"bad").iter().await;
        assert!(!iter.next(&mut out).await);
        assert!(iter.close().is_err());

        session.close().await;
    }

    #[tokio::test]
    async fn test_empty_bulk_is_a_no_op() {
        let session = Session::dial("mongodb://localhost:1/app").await.unwrap();
        let result = session.db("").c("people").bulk().run().await.unwrap();
        assert_eq!(result, BulkResult::default());
        session.close().await;
    }

    #[tokio::test]
    async fn test_closed_file_rejects_writes() {
        let session = Session::dial("mongodb://localhost:1/app").await.unwrap();
        let fs = session.db("").gridfs("fs");
        let mut file = fs.create("empty.bin");
        file.set_chunk_size(16);
        assert_eq!(file.chunk_size(), 16);
        file.close().await.unwrap();
        file.close().await.unwrap();
        assert!(matches!(file.write(b"late"), Err(MgoError::FileClosed)));
        session.close().await;
    }
}

// ============================================================================
// Collection Tests
// ============================================================================

mod collection_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_insert_then_find_one() {
        let (session, db) = fresh_db().await;
        let people = db.c("people");

        people.insert(&[m! { "name" => "John", "age" => 30 }]).await.unwrap();

        let mut found = M::new();
        people.find(&m! { "name" => "John" }).one(&mut found).await.unwrap();
        assert!(matches!(found.get("_id"), Some(Value::ObjectId(id)) if id.is_valid()));
        assert_eq!(found["age"], Value::Int32(30));

        cleanup(session, db).await;
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_struct_insert_fills_empty_id() {
        let (session, db) = fresh_db().await;
        let people = db.c("people");

        let ann = Person {
            name: "Ann".into(),
            age: 41,
            ..Person::default()
        };
        people.insert(&[ann.clone(), ann]).await.unwrap();

        let mut all: Vec<Person> = Vec::new();
        people.find(&m! { "name" => "Ann" }).all(&mut all).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|p| p.id.is_valid()));
        assert_ne!(all[0].id, all[1].id);

        cleanup(session, db).await;
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_pagination() {
        let (session, db) = fresh_db().await;
        let items = db.c("items");

        let docs: Vec<M> = (0..25)
            .map(|i| m! { "n" => i, "canceled" => i % 2 == 0 })
            .collect();
        items.insert(&docs).await.unwrap();

        let query = items
            .find(&m! { "canceled" => m! { "$ne" => true } })
            .sort(&["n"]);
        assert_eq!(query.count().await.unwrap(), 12);

        let mut page: Vec<M> = Vec::new();
        query.clone().skip(5).limit(5).all(&mut page).await.unwrap();
        let ns: Vec<i64> = page.iter().filter_map(|d| d["n"].as_i64()).collect();
        assert_eq!(ns, vec![11, 13, 15, 17, 19]);
        assert_eq!(query.skip(5).limit(5).count().await.unwrap(), 5);

        cleanup(session, db).await;
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_plain_update_merges_fields() {
        let (session, db) = fresh_db().await;
        let people = db.c("people");
        let id = ObjectId::new();
        people
            .insert(&[m! { "_id" => id.clone(), "name" => "John", "age" => 30, "city" => "Porto" }])
            .await
            .unwrap();

        people.update_id(&id, &m! { "age" => 31 }).await.unwrap();

        let mut john = Person::default();
        people.find_id(&id).one(&mut john).await.unwrap();
        assert_eq!(john.age, 31);
        assert_eq!(john.city, "Porto");

        people
            .update_id(&id, &m! { "$unset" => m! { "city" => "" } })
            .await
            .unwrap();
        people.find_id(&id).one(&mut john).await.unwrap();
        assert_eq!(john.city, "");

        cleanup(session, db).await;
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_single_writes_tolerate_no_match() {
        let (session, db) = fresh_db().await;
        let people = db.c("people");
        let missing = ObjectId::new();

        let mut out = M::new();
        assert!(people.find_id(&missing).one(&mut out).await.unwrap_err().is_not_found());
        people.remove_id(&missing).await.unwrap();
        people.update_id(&missing, &m! { "a" => 1 }).await.unwrap();
        people.remove(&m! { "name" => "nobody" }).await.unwrap();
        assert_eq!(people.count().await.unwrap(), 0);

        let info = people.remove_all(&m! { "name" => "nobody" }).await.unwrap();
        assert_eq!(info, ChangeInfo::default());

        cleanup(session, db).await;
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_upsert_reports_created_id() {
        let (session, db) = fresh_db().await;
        let people = db.c("people");

        let created = people
            .upsert(&m! { "name" => "Zoe" }, &m! { "age" => 5 })
            .await
            .unwrap();
        assert!(created.upserted_id.is_some());
        assert_eq!(created.matched, 0);
        assert_eq!(created.updated, 0);

        let updated = people
            .upsert(&m! { "name" => "Zoe" }, &m! { "age" => 6 })
            .await
            .unwrap();
        assert_eq!(updated.upserted_id, None);
        assert_eq!(updated.matched, 1);
        assert_eq!(updated.updated, 1);

        let info = people
            .update_all(&m! {}, &m! { "$inc" => m! { "age" => 1 } })
            .await
            .unwrap();
        assert_eq!(info.matched, 1);
        assert_eq!(people.count().await.unwrap(), 1);

        cleanup(session, db).await;
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_indexes() {
        let (session, db) = fresh_db().await;
        let people = db.c("people");

        people.ensure_index_key(&["-age"]).await.unwrap();
        people
            .ensure_index(&Index {
                key: vec!["name".into(), "-age".into()],
                unique: true,
                name: "by_name".into(),
                ..Index::default()
            })
            .await
            .unwrap();

        let indexes = people.indexes().await.unwrap();
        let names: Vec<&str> = indexes.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["_id_", "age_-1", "by_name"]);
        assert_eq!(indexes[1].key, vec!["-age".to_string()]);
        assert!(indexes[2].unique);

        people.insert(&[m! { "name" => "a", "age" => 1 }]).await.unwrap();
        let err = people
            .insert(&[m! { "name" => "a", "age" => 1 }])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(11000));

        cleanup(session, db).await;
    }

    #[derive(Debug, Deserialize)]
    struct Schedule {
        #[serde(with = "serde_helpers::time_vec")]
        slots: Vec<DateTime<Utc>>,
        #[serde(with = "serde_helpers::time")]
        created: DateTime<Utc>,
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_numeric_timestamps_decode() {
        let (session, db) = fresh_db().await;
        let schedules = db.c("schedules");

        schedules
            .insert(&[m! {
                "slots" => vec![Value::Int64(1_000), Value::Int32(2_000), Value::Double(3_000.0), Value::Time(ms(4_000))],
                "created" => 5_000i64,
            }])
            .await
            .unwrap();

        let mut out: Vec<Schedule> = Vec::new();
        schedules.find(&Value::Null).all(&mut out).await.unwrap();
        assert_eq!(out[0].slots, vec![ms(1_000), ms(2_000), ms(3_000), ms(4_000)]);
        assert_eq!(out[0].created, ms(5_000));

        cleanup(session, db).await;
    }
}

// ============================================================================
// Query Tests
// ============================================================================

mod query_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_iterator_exhaustion() {
        let (session, db) = fresh_db().await;
        let items = db.c("items");
        items
            .insert(&[m! { "n" => 1 }, m! { "n" => 2 }, m! { "n" => 3 }])
            .await
            .unwrap();

        let mut iter = items.find(&m! {}).sort(&["n"]).batch(2).iter().await;
        let mut row = M::new();
        let mut seen = Vec::new();
        while iter.next(&mut row).await {
            seen.push(row["n"].clone());
        }
        assert_eq!(seen, vec![Value::Int32(1), Value::Int32(2), Value::Int32(3)]);
        assert!(!iter.next(&mut row).await);
        assert!(iter.err().is_none());
        assert!(iter.done());
        iter.close().unwrap();

        cleanup(session, db).await;
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_select_projection() {
        let (session, db) = fresh_db().await;
        let people = db.c("people");
        people
            .insert(&[m! { "name" => "Ann", "age" => 41, "city" => "Lyon" }])
            .await
            .unwrap();

        let mut out = M::new();
        people
            .find(&m! { "name" => "Ann" })
            .select(&m! { "name" => 1, "_id" => 0 })
            .one(&mut out)
            .await
            .unwrap();
        assert_eq!(out, m! { "name" => "Ann" });

        cleanup(session, db).await;
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_apply_upsert_returning_old_document() {
        let (session, db) = fresh_db().await;
        let items = db.c("items");

        let mut before = M::new();
        let info = items
            .find(&m! { "k" => "missing" })
            .apply(
                Change {
                    update: Value::M(m! { "$set" => m! { "v" => "x" } }),
                    upsert: true,
                    return_new: false,
                    ..Change::default()
                },
                &mut before,
            )
            .await
            .unwrap();
        assert!(info.upserted_id.is_some());
        assert!(before.is_empty());
        assert_eq!(items.count().await.unwrap(), 1);

        cleanup(session, db).await;
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_apply_update_and_remove() {
        let (session, db) = fresh_db().await;
        let counters = db.c("counters");
        counters.insert(&[m! { "_id" => "jobs", "seq" => 1 }]).await.unwrap();

        let mut after = M::new();
        let info = counters
            .find_id(&"jobs")
            .apply(
                Change {
                    update: Value::M(m! { "$inc" => m! { "seq" => 1 } }),
                    return_new: true,
                    ..Change::default()
                },
                &mut after,
            )
            .await
            .unwrap();
        assert_eq!(info.updated, 1);
        assert_eq!(after["seq"], Value::Int32(2));

        let info = counters
            .find_id(&"jobs")
            .apply_info(Change {
                remove: true,
                ..Change::default()
            })
            .await
            .unwrap();
        assert_eq!(info.removed, 1);

        let err = counters
            .find_id(&"jobs")
            .apply_info(Change {
                remove: true,
                ..Change::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        cleanup(session, db).await;
    }
}

// ============================================================================
// Bulk Tests
// ============================================================================

mod bulk_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_mixed_ordered_operations() {
        let (session, db) = fresh_db().await;
        let items = db.c("items");

        let mut bulk = items.bulk();
        bulk.insert(&[m! { "name" => "first" }])
            .update(&m! { "name" => "first" }, &m! { "$set" => m! { "seen" => true } })
            .insert(&[m! { "name" => "second" }, m! { "name" => "third" }])
            .remove(&m! { "name" => "second" })
            .upsert(&m! { "name" => "fourth" }, &m! { "$set" => m! { "seen" => false } });
        let result = bulk.run().await.unwrap();
        assert_eq!(result, BulkResult { matched: 2, modified: 3 });

        let mut names: Vec<M> = Vec::new();
        items.find(&m! {}).sort(&["name"]).all(&mut names).await.unwrap();
        let names: Vec<&str> = names.iter().filter_map(|d| d["name"].as_str()).collect();
        assert_eq!(names, vec!["first", "fourth", "third"]);

        let mut first = M::new();
        items.find(&m! { "name" => "first" }).one(&mut first).await.unwrap();
        assert_eq!(first["seen"], Value::Bool(true));

        cleanup(session, db).await;
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_unordered_collects_every_failure() {
        let (session, db) = fresh_db().await;
        let items = db.c("items");

        let mut bulk = items.bulk();
        bulk.unordered().insert(&[
            m! { "_id" => 1 },
            m! { "_id" => 1 },
            m! { "_id" => 2 },
            m! { "_id" => 2 },
        ]);
        let err = bulk.run().await.unwrap_err();
        let MgoError::Bulk(bulk_err) = &err else {
            panic!("expected a bulk error, got {err:?}");
        };
        let indexes: Vec<i64> = bulk_err.cases().iter().map(|c| c.index).collect();
        assert_eq!(indexes, vec![1, 3]);
        assert!(bulk_err.cases().iter().all(|c| c.err.code == 11000));
        assert!(err.to_string().starts_with("multiple errors in bulk operation:\n"));
        assert_eq!(items.count().await.unwrap(), 2);

        cleanup(session, db).await;
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_ordered_stops_at_first_failure() {
        let (session, db) = fresh_db().await;
        let items = db.c("items");

        let mut bulk = items.bulk();
        bulk.insert(&[m! { "_id" => 1 }, m! { "_id" => 1 }])
            .remove_all(&m! {});
        let err = bulk.run().await.unwrap_err();
        assert_eq!(err.code(), Some(11000));
        assert_eq!(items.count().await.unwrap(), 1);

        cleanup(session, db).await;
    }
}

// ============================================================================
// Aggregation And Command Tests
// ============================================================================

mod pipe_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_group_pipeline() {
        let (session, db) = fresh_db().await;
        let orders = db.c("orders");
        orders
            .insert(&[
                m! { "customer" => "a", "amount" => 5 },
                m! { "customer" => "a", "amount" => 7 },
                m! { "customer" => "b", "amount" => 1 },
            ])
            .await
            .unwrap();

        let pipeline = vec![
            m! { "$group" => m! { "_id" => "$customer", "total" => m! { "$sum" => "$amount" } } },
            m! { "$sort" => m! { "_id" => 1 } },
        ];
        let mut totals: Vec<M> = Vec::new();
        orders.pipe(&pipeline).allow_disk_use().batch(1).all(&mut totals).await.unwrap();
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0]["total"], Value::Int32(12));

        let mut first = M::new();
        orders.pipe(&pipeline).one(&mut first).await.unwrap();
        assert_eq!(first["_id"], Value::from("a"));

        let mut none = M::new();
        let err = orders
            .pipe(&m! { "$match" => m! { "customer" => "z" } })
            .one(&mut none)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let mut plan = M::new();
        orders.pipe(&pipeline).explain(&mut plan).await.unwrap();
        assert!(!plan.is_empty());

        cleanup(session, db).await;
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_commands() {
        let (session, db) = fresh_db().await;
        session.ping().await.unwrap();

        let info = session.build_info().await.unwrap();
        assert!(!info.version.is_empty());
        assert!(info.version_at_least(&[3, 6]));

        db.c("things").insert(&[m! { "a" => 1 }]).await.unwrap();
        assert_eq!(db.collection_names().await.unwrap(), vec!["things".to_string()]);

        let mut count = M::new();
        db.c("things")
            .run(&d! { "count" => "things", "query" => m! {} }, &mut count)
            .await
            .unwrap();
        assert_eq!(count["n"], Value::Int32(1));

        cleanup(session, db).await;
    }
}

// ============================================================================
// Blob Store Tests
// ============================================================================

mod gridfs_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_round_trip_across_chunks() {
        let (session, db) = fresh_db().await;
        let fs = db.gridfs("fs");
        let data = sample(5_000);

        let mut file = fs.create("blob.bin");
        file.set_chunk_size(1_024);
        file.set_content_type("application/octet-stream");
        file.set_meta(&m! { "owner" => "ann" });
        for part in data.chunks(700) {
            assert_eq!(file.write(part).unwrap(), part.len());
        }
        file.close().await.unwrap();
        assert_eq!(file.md5().len(), 32);

        let mut file = fs.open("blob.bin").await.unwrap();
        assert_eq!(file.size(), 5_000);
        assert_eq!(file.chunk_size(), 1_024);
        assert_eq!(file.content_type(), "application/octet-stream");

        let mut back = Vec::new();
        let mut buf = [0u8; 333];
        loop {
            let n = file.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            back.extend_from_slice(&buf[..n]);
        }
        assert_eq!(back, data);

        let mut meta = M::new();
        file.get_meta(&mut meta).unwrap();
        assert_eq!(meta["owner"], Value::from("ann"));
        file.close().await.unwrap();

        fs.remove("blob.bin").await.unwrap();
        assert!(fs.open("blob.bin").await.unwrap_err().is_not_found());
        assert_eq!(fs.chunks().count().await.unwrap(), 0);

        cleanup(session, db).await;
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_open_latest_version_and_iterate() {
        let (session, db) = fresh_db().await;
        let fs = db.gridfs("media");

        for (i, body) in [b"old".as_slice(), b"new".as_slice()].into_iter().enumerate() {
            let mut file = fs.create("note.txt");
            file.set_upload_date(ms(1_000 * (i as i64 + 1)));
            file.write(body).unwrap();
            file.close().await.unwrap();
        }

        let mut latest = fs.open("note.txt").await.unwrap();
        assert_eq!(latest.read_to_end().await.unwrap(), b"new".to_vec());

        let by_id = fs.open_id(latest.id()).await.unwrap();
        assert_eq!(by_id.upload_date(), ms(2_000));

        let mut iter = fs.find(&m! {}).sort(&["uploadDate"]).iter().await;
        let mut file = None;
        let mut bodies = Vec::new();
        while fs.open_next(&mut iter, &mut file).await {
            if let Some(f) = file.as_mut() {
                bodies.push(f.read_to_end().await.unwrap());
            }
        }
        assert!(file.is_none());
        assert_eq!(bodies, vec![b"old".to_vec(), b"new".to_vec()]);
        iter.close().unwrap();

        fs.remove_id(latest.id()).await.unwrap();
        let mut remaining = fs.open("note.txt").await.unwrap();
        assert_eq!(remaining.read_to_end().await.unwrap(), b"old".to_vec());

        cleanup(session, db).await;
    }

    #[tokio::test]
    #[ignore = "requires MongoDB at MONGODB_TEST_URL"]
    async fn test_failed_close_can_be_retried() {
        let (session, db) = fresh_db().await;
        let fs = db.gridfs("fs");
        fs.files().insert(&[m! { "_id" => "taken" }]).await.unwrap();

        let data = sample(3_000);
        let mut file = fs.create("retry.bin");
        file.set_id(&"taken");
        file.set_chunk_size(1_024);
        file.write(&data).unwrap();
        assert!(file.close().await.is_err());
        assert!(fs.open("retry.bin").await.unwrap_err().is_not_found());

        fs.files().remove_id(&"taken").await.unwrap();
        file.close().await.unwrap();

        let mut back = fs.open_id(&"taken").await.unwrap();
        assert_eq!(back.read_to_end().await.unwrap(), data);
        assert_eq!(fs.chunks().count().await.unwrap(), 3);

        cleanup(session, db).await;
    }
}
