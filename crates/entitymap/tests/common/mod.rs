//! Library schema shared by the integration tests.
#![allow(dead_code)]

use entitymap::prelude::*;

pub static AUTHOR: EntitySchema = EntitySchema::new(
    "author",
    "authors",
    &[ColumnDef::new("id").primary_key(true), ColumnDef::new("name")],
)
.relations(&[
    ReferencePath::new("books", "author", RelationKind::OneToMany, &BOOK)
        .foreign_key(&["author_id"])
        .order_by(&[OrderBy::desc("year")]),
    ReferencePath::new("profile", "author", RelationKind::OneToOneBackRef, &PROFILE)
        .foreign_key(&["author_id"]),
]);

pub const BOOK_TAGS: JoinTable = JoinTable::new("book_tags", &["book_id"], &["tag_id"]);

pub static BOOK: EntitySchema = EntitySchema::new(
    "book",
    "books",
    &[
        ColumnDef::new("id").primary_key(true),
        ColumnDef::new("author_id").nullable(true),
        ColumnDef::new("title"),
        ColumnDef::new("year"),
    ],
)
.relations(&[
    ReferencePath::new("author", "book", RelationKind::ManyToOne, &AUTHOR)
        .foreign_key(&["author_id"]),
    ReferencePath::new("reviews", "book", RelationKind::OneToMany, &REVIEW)
        .foreign_key(&["book_id"]),
    ReferencePath::new("tags", "book", RelationKind::ManyToManyViaJoin, &TAG)
        .join_table(BOOK_TAGS)
        .order_by(&[OrderBy::asc("label")]),
]);

pub static REVIEW: EntitySchema = EntitySchema::new(
    "review",
    "reviews",
    &[
        ColumnDef::new("id").primary_key(true),
        ColumnDef::new("book_id"),
        ColumnDef::new("stars"),
    ],
);

pub static TAG: EntitySchema = EntitySchema::new(
    "tag",
    "tags",
    &[ColumnDef::new("id").primary_key(true), ColumnDef::new("label")],
);

pub static PROFILE: EntitySchema = EntitySchema::new(
    "profile",
    "profiles",
    &[
        ColumnDef::new("id").primary_key(true),
        ColumnDef::new("author_id"),
        ColumnDef::new("bio"),
    ],
);

/// Rows with store-assigned keys.
pub static NOTE: EntitySchema = EntitySchema::new(
    "note",
    "notes",
    &[
        ColumnDef::new("id").primary_key(true).auto_increment(true),
        ColumnDef::new("body"),
    ],
);

/// A second entity type over the `authors` table.
pub static PEN_NAME: EntitySchema = EntitySchema::new(
    "pen_name",
    "authors",
    &[ColumnDef::new("id").primary_key(true), ColumnDef::new("name")],
);

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

pub fn library() -> MemoryStore {
    let store = MemoryStore::new();
    for schema in [&AUTHOR, &BOOK, &REVIEW, &TAG, &PROFILE, &NOTE, &PEN_NAME] {
        store.register(schema).expect("register schema");
    }
    store
}

pub fn author(id: i64, name: &str) -> EntityRecord {
    EntityRecord::new(&AUTHOR, [("id", Value::from(id)), ("name", Value::from(name))])
        .expect("valid author")
}

pub fn book(id: i64, author_id: Option<i64>, title: &str, year: i64) -> EntityRecord {
    EntityRecord::new(
        &BOOK,
        [
            ("id", Value::from(id)),
            ("author_id", author_id.map_or(Value::Null, Value::from)),
            ("title", Value::from(title)),
            ("year", Value::from(year)),
        ],
    )
    .expect("valid book")
}

pub fn review(id: i64, book_id: i64, stars: i64) -> EntityRecord {
    EntityRecord::new(
        &REVIEW,
        [
            ("id", Value::from(id)),
            ("book_id", Value::from(book_id)),
            ("stars", Value::from(stars)),
        ],
    )
    .expect("valid review")
}

pub fn tag(id: i64, label: &str) -> EntityRecord {
    EntityRecord::new(&TAG, [("id", Value::from(id)), ("label", Value::from(label))])
        .expect("valid tag")
}

pub fn profile(id: i64, author_id: i64, bio: &str) -> EntityRecord {
    EntityRecord::new(
        &PROFILE,
        [
            ("id", Value::from(id)),
            ("author_id", Value::from(author_id)),
            ("bio", Value::from(bio)),
        ],
    )
    .expect("valid profile")
}

pub fn note(body: &str) -> EntityRecord {
    EntityRecord::new(&NOTE, [("body", Value::from(body))]).expect("valid note")
}

pub fn key(schema: &'static EntitySchema, id: i64) -> IdentityKey {
    IdentityKey::single(schema, id).expect("valid key")
}

/// Load persisted roots through the unit of work.
pub async fn load_all(
    cx: &Cx,
    uow: &mut UnitOfWork<MemoryStore>,
    schema: &'static EntitySchema,
    ids: &[i64],
) -> Vec<EntityRecord> {
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        let record = unwrap_outcome(uow.get_or_load(cx, schema, &key(schema, *id)).await);
        records.push(record.expect("seeded row"));
    }
    records
}
