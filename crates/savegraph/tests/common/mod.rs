//! Shared fixtures for the end-to-end tests: a recording connection and
//! the book store catalog.

#![allow(dead_code)]

use asupersync::runtime::RuntimeBuilder;
use savegraph::prelude::*;
use std::future::Future;
use std::sync::{Arc, Mutex};

type Responder = Box<dyn Fn(&str, &[Value]) -> Option<Vec<Row>> + Send + Sync>;
type Counter = Box<dyn Fn(&str) -> Option<u64> + Send + Sync>;

/// Everything a [`Recorder`] saw.
#[derive(Default)]
struct Journal {
    statements: Vec<(String, Vec<Value>)>,
    next_id: i64,
}

/// Handle for inspecting a [`Recorder`] after it was moved into a command.
#[derive(Clone)]
pub struct Log(Arc<Mutex<Journal>>);

impl Log {
    pub fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.0.lock().unwrap().statements.clone()
    }

    pub fn sqls(&self) -> Vec<String> {
        self.statements().into_iter().map(|(sql, _)| sql).collect()
    }

    /// Statements starting with `prefix` (e.g. `"SELECT"`).
    pub fn starting_with(&self, prefix: &str) -> Vec<String> {
        self.sqls()
            .into_iter()
            .filter(|sql| sql.starts_with(prefix))
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.starting_with(prefix).len()
    }

    /// Statements that write rows.
    pub fn writes(&self) -> Vec<String> {
        self.sqls()
            .into_iter()
            .filter(|sql| !sql.starts_with("SELECT"))
            .collect()
    }
}

/// A `Connection` that records statements and answers from scripted
/// responders.
///
/// Unscripted SELECTs return no rows. `INSERT ... RETURNING` hands out ids
/// from 1001 upwards, one per VALUES row. Statements run through `execute`
/// or `batch` report zero affected rows unless scripted with
/// [`Recorder::affects`].
pub struct Recorder {
    journal: Arc<Mutex<Journal>>,
    responders: Vec<Responder>,
    counters: Vec<Counter>,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            journal: Arc::new(Mutex::new(Journal {
                next_id: 1000,
                ..Journal::default()
            })),
            responders: Vec::new(),
            counters: Vec::new(),
        }
    }

    pub fn log(&self) -> Log {
        Log(Arc::clone(&self.journal))
    }

    /// Answer SELECTs containing `pattern` with `rows`.
    pub fn rows(self, pattern: &str, rows: Vec<Row>) -> Self {
        self.respond(pattern, move |_| rows.clone())
    }

    /// Answer SELECTs containing `pattern` from their parameters.
    pub fn respond(
        mut self,
        pattern: &str,
        respond: impl Fn(&[Value]) -> Vec<Row> + Send + Sync + 'static,
    ) -> Self {
        let pattern = pattern.to_string();
        self.responders
            .push(Box::new(move |sql, params| sql.contains(&pattern).then(|| respond(params))));
        self
    }

    /// Report `count` affected rows for statements containing `pattern`.
    pub fn affects(mut self, pattern: &str, count: u64) -> Self {
        let pattern = pattern.to_string();
        self.counters
            .push(Box::new(move |sql| sql.contains(&pattern).then_some(count)));
        self
    }

    fn record(&self, sql: &str, params: &[Value]) {
        self.journal
            .lock()
            .unwrap()
            .statements
            .push((sql.to_string(), params.to_vec()));
    }

    fn answer(&self, sql: &str, params: &[Value]) -> Vec<Row> {
        if let Some(rows) = self.responders.iter().find_map(|r| r(sql, params)) {
            return rows;
        }
        if sql.starts_with("INSERT") && sql.contains(" RETURNING ") {
            let mut journal = self.journal.lock().unwrap();
            let rows = if sql.contains(" DEFAULT VALUES") {
                1
            } else {
                sql.matches("($").count()
            };
            return (0..rows)
                .map(|_| {
                    journal.next_id += 1;
                    Row::new(vec!["id".to_string()], vec![Value::BigInt(journal.next_id)])
                })
                .collect();
        }
        Vec::new()
    }

    fn affected(&self, sql: &str) -> u64 {
        self.counters.iter().find_map(|c| c(sql)).unwrap_or(0)
    }
}

impl Connection for Recorder {
    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        self.record(sql, params);
        let rows = self.answer(sql, params);
        async move { Outcome::Ok(rows) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        self.record(sql, params);
        let n = self.affected(sql);
        async move { Outcome::Ok(n) }
    }

    fn batch(
        &self,
        _cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        let counts: Vec<u64> = statements
            .iter()
            .map(|(sql, params)| {
                self.record(sql, params);
                self.affected(sql)
            })
            .collect();
        async move { Outcome::Ok(counts) }
    }
}

/// Drive a command future on a fresh current-thread runtime.
pub fn run<T, Fut>(make: impl FnOnce(Cx) -> Fut) -> Outcome<T, Error>
where
    Fut: Future<Output = Outcome<T, Error>>,
{
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(make(Cx::for_testing()))
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn unwrap_error<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

/// A row from `(column, value)` pairs.
pub fn row(pairs: &[(&str, Value)]) -> Row {
    Row::new(
        pairs.iter().map(|(c, _)| (*c).to_string()).collect(),
        pairs.iter().map(|(_, v)| v.clone()).collect(),
    )
}

/// Rows holding only an `id` column.
pub fn id_rows(ids: &[i64]) -> Vec<Row> {
    ids.iter().map(|id| row(&[("id", Value::BigInt(*id))])).collect()
}

pub fn ids(values: &[i64]) -> Vec<Value> {
    values.iter().map(|v| Value::BigInt(*v)).collect()
}

/// Book stores, books, authors and chapters.
///
/// `Book` carries a `version` column when `versioned` is set. The
/// `Book.store` foreign key declares no dissociate action; tests choose one
/// through options.
pub fn catalog(versioned: bool) -> Catalog {
    let mut book = EntityInfo::new("Book", "book")
        .field(FieldInfo::new("id", "id").primary_key(true).generated(true))
        .field(FieldInfo::new("name", "name").key(true))
        .field(FieldInfo::new("edition", "edition").key(true))
        .field(FieldInfo::new("price", "price"));
    if versioned {
        book = book.field(FieldInfo::new("version", "version").version(true));
    }
    let book = book
        .association(AssociationInfo::many_to_one("store", "BookStore", "store_id").nullable(true))
        .association(AssociationInfo::many_to_many(
            "authors",
            "Author",
            LinkTableInfo::new("book_author_mapping", "book_id", "author_id"),
        ))
        .association(AssociationInfo::one_to_many("chapters", "Chapter", "book"));

    Catalog::builder()
        .entity(
            EntityInfo::new("BookStore", "book_store")
                .field(FieldInfo::new("id", "id").primary_key(true).generated(true))
                .field(FieldInfo::new("name", "name").key(true))
                .field(FieldInfo::new("website", "website").nullable(true))
                .association(AssociationInfo::one_to_many("books", "Book", "store")),
        )
        .entity(book)
        .entity(
            EntityInfo::new("Author", "author")
                .field(FieldInfo::new("id", "id").primary_key(true).generated(true))
                .field(FieldInfo::new("first_name", "first_name").key(true))
                .field(FieldInfo::new("last_name", "last_name").key(true)),
        )
        .entity(
            EntityInfo::new("Chapter", "chapter")
                .field(FieldInfo::new("id", "id").primary_key(true).generated(true))
                .field(FieldInfo::new("title", "title"))
                .association(
                    AssociationInfo::many_to_one("book", "Book", "book_id")
                        .on_dissociate(DissociateAction::Delete),
                ),
        )
        .build()
        .expect("valid catalog")
}
