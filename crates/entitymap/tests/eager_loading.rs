mod common;

use asupersync::runtime::RuntimeBuilder;
use common::*;
use entitymap::prelude::*;
use entitymap::{StoreOp, TransactionErrorKind};

fn labels(records: &[EntityRecord], column: &str) -> Vec<String> {
    records
        .iter()
        .map(|r| r.get_as(column).expect("text column"))
        .collect()
}

#[test]
fn many_to_many_loads_through_the_join_table() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let store = library();
        store.seed(&book(1, None, "Solaris", 1961)).expect("seed");
        store.seed(&book(2, None, "Roadside Picnic", 1972)).expect("seed");
        for (id, label) in [(1, "sf"), (2, "classic"), (3, "award")] {
            store.seed(&tag(id, label)).expect("seed tag");
        }
        store.link(&BOOK_TAGS, &[Value::from(1_i64)], &[Value::from(1_i64)]);
        store.link(&BOOK_TAGS, &[Value::from(1_i64)], &[Value::from(2_i64)]);
        store.link(&BOOK_TAGS, &[Value::from(2_i64)], &[Value::from(1_i64)]);

        let mut uow = UnitOfWork::new(store.clone()).with_hooks(HookRegistry::new());
        let roots = load_all(&cx, &mut uow, &BOOK, &[1, 2]).await;

        store.reset_stats();
        let report = unwrap_outcome(uow.eager_load_paths(&cx, &BOOK, &roots, &["tags"]).await);
        assert_eq!(report.queries, 1);
        assert_eq!(store.stats().linked_loads, 1);
        assert_eq!(uow.cache().len("tag"), 2, "a shared tag is cached once");

        let first = unwrap_outcome(uow.related(&cx, &key(&BOOK, 1), "tags").await);
        assert_eq!(labels(&first, "label"), vec!["classic", "sf"]);
        let second = unwrap_outcome(uow.related(&cx, &key(&BOOK, 2), "tags").await);
        assert_eq!(labels(&second, "label"), vec!["sf"]);
        assert_eq!(store.stats().queries(), 1);
    });
}

#[test]
fn many_to_one_skips_null_foreign_keys() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let store = library();
        store.seed(&author(1, "Lem")).expect("seed");
        store.seed(&book(1, Some(1), "Solaris", 1961)).expect("seed");
        store.seed(&book(2, Some(1), "Fiasco", 1986)).expect("seed");
        store.seed(&book(3, None, "Anonymous", 1900)).expect("seed");

        let mut uow = UnitOfWork::new(store.clone()).with_hooks(HookRegistry::new());
        let roots = load_all(&cx, &mut uow, &BOOK, &[1, 2, 3]).await;

        store.reset_stats();
        let report = unwrap_outcome(uow.eager_load_paths(&cx, &BOOK, &roots, &["author"]).await);
        assert_eq!(report.queries, 1);
        assert_eq!(report.records, 1);

        let orphan = uow.cache().relation(&key(&BOOK, 3), "author");
        assert_eq!(orphan.map(<[IdentityKey]>::len), Some(0));
        let owner = unwrap_outcome(uow.related(&cx, &key(&BOOK, 2), "author").await);
        assert_eq!(owner.len(), 1);
        assert_eq!(owner[0].key(), &key(&AUTHOR, 1));
        assert_eq!(store.stats().queries(), 1);
    });
}

#[test]
fn back_reference_keeps_at_most_one_row() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let store = library();
        for id in 1..=3 {
            store.seed(&author(id, "someone")).expect("seed");
        }
        store.seed(&profile(1, 1, "first")).expect("seed");
        store.seed(&profile(2, 2, "kept")).expect("seed");
        store.seed(&profile(3, 2, "dropped")).expect("seed");

        let mut uow = UnitOfWork::new(store.clone()).with_hooks(HookRegistry::new());
        let roots = load_all(&cx, &mut uow, &AUTHOR, &[1, 2, 3]).await;
        let report = unwrap_outcome(uow.eager_load_paths(&cx, &AUTHOR, &roots, &["profile"]).await);
        assert_eq!(report.queries, 1);

        let two = unwrap_outcome(uow.related(&cx, &key(&AUTHOR, 2), "profile").await);
        assert_eq!(labels(&two, "bio"), vec!["kept"]);
        let three = unwrap_outcome(uow.related(&cx, &key(&AUTHOR, 3), "profile").await);
        assert!(three.is_empty());
    });
}

#[test]
fn pending_writes_shape_loaded_result_sets() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let store = library();
        store.seed(&author(1, "Le Guin")).expect("seed");
        store.seed(&book(1, Some(1), "Rocannon's World", 1966)).expect("seed");
        store.seed(&book(2, Some(1), "The Dispossessed", 1974)).expect("seed");

        let mut uow = UnitOfWork::new(store.clone()).with_hooks(HookRegistry::new());
        let roots = load_all(&cx, &mut uow, &AUTHOR, &[1]).await;
        assert!(unwrap_outcome(uow.delete(&cx, &key(&BOOK, 1)).await));
        unwrap_outcome(uow.create(&cx, book(10, Some(1), "Lavinia", 2008)).await);

        unwrap_outcome(uow.eager_load_paths(&cx, &AUTHOR, &roots, &["books"]).await);
        let books = unwrap_outcome(uow.related(&cx, &key(&AUTHOR, 1), "books").await);
        let years: Vec<i64> = books.iter().map(|b| b.get_as("year").expect("year")).collect();
        assert_eq!(years, vec![2008, 1974]);
        assert!(books[0].is_new());
    });
}

#[test]
fn navigation_sees_children_created_after_an_eager_load() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let store = library();
        store.seed(&author(1, "Banks")).expect("seed");
        store.seed(&book(1, Some(1), "Consider Phlebas", 1987)).expect("seed");

        let mut uow = UnitOfWork::new(store.clone()).with_hooks(HookRegistry::new());
        let roots = load_all(&cx, &mut uow, &AUTHOR, &[1]).await;
        unwrap_outcome(uow.eager_load_paths(&cx, &AUTHOR, &roots, &["books"]).await);
        assert_eq!(unwrap_outcome(uow.related(&cx, &key(&AUTHOR, 1), "books").await).len(), 1);

        unwrap_outcome(uow.create(&cx, book(2, Some(1), "Excession", 1996)).await);
        assert!(uow.cache().relation(&key(&AUTHOR, 1), "books").is_none());

        let books = unwrap_outcome(uow.related(&cx, &key(&AUTHOR, 1), "books").await);
        let years: Vec<i64> = books.iter().map(|b| b.get_as("year").expect("year")).collect();
        assert_eq!(years, vec![1996, 1987]);

        // Reordering a member is visible too.
        unwrap_outcome(uow.set(&cx, &key(&BOOK, 1), "year", 2001_i64).await);
        let books = unwrap_outcome(uow.related(&cx, &key(&AUTHOR, 1), "books").await);
        assert_eq!(books[0].key(), &key(&BOOK, 1));
    });
}

#[test]
fn navigation_follows_a_repointed_foreign_key() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let store = library();
        store.seed(&author(1, "Herbert")).expect("seed");
        store.seed(&author(2, "Anderson")).expect("seed");
        store.seed(&book(1, Some(1), "Dune", 1965)).expect("seed");

        let mut uow = UnitOfWork::new(store.clone()).with_hooks(HookRegistry::new());
        let roots = load_all(&cx, &mut uow, &BOOK, &[1]).await;
        unwrap_outcome(uow.eager_load_paths(&cx, &BOOK, &roots, &["author"]).await);
        let before = unwrap_outcome(uow.related(&cx, &key(&BOOK, 1), "author").await);
        assert_eq!(before[0].key(), &key(&AUTHOR, 1));

        // A column no relation depends on keeps the cached result set.
        unwrap_outcome(uow.set(&cx, &key(&BOOK, 1), "title", "Dune Messiah").await);
        assert!(uow.cache().relation(&key(&BOOK, 1), "author").is_some());

        unwrap_outcome(uow.set(&cx, &key(&BOOK, 1), "author_id", 2_i64).await);
        let after = unwrap_outcome(uow.related(&cx, &key(&BOOK, 1), "author").await);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].key(), &key(&AUTHOR, 2));
    });
}

#[test]
fn key_only_operations_need_no_prior_load() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let store = library();
        store.seed(&author(1, "Butler")).expect("seed");
        store.seed(&book(1, Some(1), "Kindred", 1979)).expect("seed");
        store.seed(&review(1, 1, 5)).expect("seed");

        let mut uow = UnitOfWork::new(store.clone()).with_hooks(HookRegistry::new());
        let reviews = unwrap_outcome(uow.related(&cx, &key(&BOOK, 1), "reviews").await);
        assert_eq!(reviews.len(), 1);

        let mut fresh = UnitOfWork::new(store.clone()).with_hooks(HookRegistry::new());
        unwrap_outcome(fresh.set(&cx, &key(&AUTHOR, 1), "name", "Octavia E. Butler").await);
        let refreshed = unwrap_outcome(fresh.refresh(&cx, &key(&BOOK, 1), false).await);
        assert_eq!(refreshed.get_as::<String>("title").expect("title"), "Kindred");
        assert!(unwrap_outcome(fresh.delete(&cx, &key(&REVIEW, 1)).await));
        unwrap_outcome(fresh.commit(&cx).await);

        let renamed = store.peek(&AUTHOR, &key(&AUTHOR, 1)).expect("row kept");
        assert_eq!(renamed.get_by_name("name"), Some(&Value::from("Octavia E. Butler")));
        assert!(store.peek(&REVIEW, &key(&REVIEW, 1)).is_none());
    });
}

#[test]
fn result_sets_are_kept_only_for_cached_roots() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let store = library();
        for id in 1..=3 {
            store.seed(&author(id, "someone")).expect("seed");
            store.seed(&book(id, Some(id), "book", 2000)).expect("seed");
        }

        let config = UnitOfWorkConfig::new().max_entries("author", 1);
        let mut uow = UnitOfWork::with_config(store.clone(), config)
            .expect("valid config")
            .with_hooks(HookRegistry::new());
        let roots = load_all(&cx, &mut uow, &AUTHOR, &[1, 2, 3]).await;
        assert_eq!(uow.cache().len("author"), 1);

        let report = unwrap_outcome(uow.eager_load_paths(&cx, &AUTHOR, &roots, &["books"]).await);
        assert_eq!(report.relations, 3);
        assert_eq!(uow.cache().relation_count(), 1);
        assert!(uow.cache().relation(&key(&AUTHOR, 3), "books").is_some());
        assert!(uow.cache().relation(&key(&AUTHOR, 1), "books").is_none());
    });
}

#[test]
fn failed_eager_load_leaves_the_cache_untouched() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let store = library();
        store.seed(&author(1, "Lem")).expect("seed");
        store.seed(&book(1, Some(1), "Solaris", 1961)).expect("seed");
        store.seed(&tag(1, "sf")).expect("seed");
        store.link(&BOOK_TAGS, &[Value::from(1_i64)], &[Value::from(1_i64)]);

        let mut uow = UnitOfWork::new(store.clone()).with_hooks(HookRegistry::new());
        let roots = load_all(&cx, &mut uow, &AUTHOR, &[1]).await;

        store.fail_next(StoreOp::LinkedLoad);
        match uow
            .eager_load_paths(&cx, &AUTHOR, &roots, &["books.tags"])
            .await
        {
            Outcome::Err(err) => assert!(err.is_retryable(), "unexpected error: {err}"),
            other => panic!("expected store failure, got {other:?}"),
        }
        assert_eq!(uow.cache().len("book"), 0);
        assert!(uow.cache().relation(&key(&AUTHOR, 1), "books").is_none());

        let report =
            unwrap_outcome(uow.eager_load_paths(&cx, &AUTHOR, &roots, &["books.tags"]).await);
        assert_eq!(report.queries, 2);
        assert_eq!(uow.cache().len("book"), 1);
        assert_eq!(uow.cache().len("tag"), 1);
    });
}

#[test]
fn invalid_paths_fail_before_any_query() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let store = library();
        store.seed(&author(1, "Lem")).expect("seed");
        let mut uow = UnitOfWork::new(store.clone()).with_hooks(HookRegistry::new());
        let roots = load_all(&cx, &mut uow, &AUTHOR, &[1]).await;

        store.reset_stats();
        match uow
            .eager_load_paths(&cx, &AUTHOR, &roots, &["books", "books.sequels"])
            .await
        {
            Outcome::Err(Error::EagerLoadPath(e)) => {
                assert_eq!(e.path, "books.sequels");
                assert_eq!(e.entity, "book");
                assert_eq!(e.relation, "sequels");
            }
            other => panic!("expected path error, got {other:?}"),
        }
        assert!(matches!(
            uow.eager_load_paths(&cx, &AUTHOR, &roots, &["books..reviews"]).await,
            Outcome::Err(Error::EagerLoadPath(_))
        ));
        assert_eq!(store.stats().queries(), 0);

        let plan = EagerPlan::new(&BOOK).include("author").expect("valid path");
        assert!(matches!(
            uow.eager_load(&cx, &roots, &plan).await,
            Outcome::Err(Error::EntityMismatch(_))
        ));
    });
}

#[test]
fn lazy_navigation_is_counted_per_call_site() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let store = library();
        for id in 1..=3 {
            store.seed(&author(id, "someone")).expect("seed");
            store.seed(&book(id, Some(id), "book", 2000)).expect("seed");
        }

        let mut uow = UnitOfWork::new(store.clone()).with_hooks(HookRegistry::new());
        uow.enable_lazy_load_detection(2);
        for id in 1..=3 {
            let books = unwrap_outcome(uow.related(&cx, &key(&AUTHOR, id), "books").await);
            assert_eq!(books.len(), 1);
        }

        let stats = uow.lazy_load_stats().expect("tracking enabled");
        assert_eq!(stats.total_loads, 3);
        assert_eq!(stats.relations_loaded, 1);
        assert_eq!(stats.potential_n1, 1);
        let tracker = uow.lazy_load_tracker().expect("tracking enabled");
        assert_eq!(tracker.count_for("author", "books"), 3);
        assert!(tracker.sites()[0].file.ends_with("eager_loading.rs"));

        unwrap_outcome(uow.commit(&cx).await);
        assert_eq!(uow.lazy_load_stats().expect("tracking enabled").total_loads, 0);

        uow.disable_lazy_load_detection();
        assert!(uow.lazy_load_stats().is_none());

        unwrap_outcome(uow.close(&cx).await);
        assert!(matches!(
            uow.related(&cx, &key(&AUTHOR, 1), "books").await,
            Outcome::Err(Error::Transaction(e)) if e.kind == TransactionErrorKind::Closed
        ));
    });
}
