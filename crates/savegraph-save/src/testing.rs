//! Recording connection and runtime helpers for unit tests.

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use savegraph_core::{Connection, Error, QueryError, QueryErrorKind, Row, Value};
use std::future::Future;
use std::sync::{Arc, Mutex};

type QueryResponder = Box<dyn Fn(&str, &[Value]) -> Option<Vec<Row>> + Send + Sync>;
type CountResponder = Box<dyn Fn(&str, &[Value]) -> Option<u64> + Send + Sync>;

#[derive(Default)]
struct MockState {
    executed: Vec<(String, Vec<Value>)>,
    batch_calls: usize,
    next_id: i64,
}

/// Shared view of what a [`MockConnection`] ran.
#[derive(Clone)]
pub(crate) struct Log {
    state: Arc<Mutex<MockState>>,
}

impl Log {
    pub(crate) fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().expect("lock poisoned").executed.clone()
    }

    pub(crate) fn sqls(&self) -> Vec<String> {
        self.statements().into_iter().map(|(sql, _)| sql).collect()
    }

    pub(crate) fn count_prefix(&self, prefix: &str) -> usize {
        self.sqls().iter().filter(|s| s.starts_with(prefix)).count()
    }

    pub(crate) fn batch_calls(&self) -> usize {
        self.state.lock().expect("lock poisoned").batch_calls
    }
}

/// Connection that records every statement and answers from scripted
/// responders. Unscripted SELECTs return no rows; `INSERT ... RETURNING`
/// hands out ids from 1000 upwards.
pub(crate) struct MockConnection {
    state: Arc<Mutex<MockState>>,
    queries: Vec<QueryResponder>,
    counts: Vec<CountResponder>,
    fail_on: Option<String>,
}

/// Rows a statement names: `($` tuples (VALUES rows or tuple IN lists),
/// or one for `DEFAULT VALUES`.
fn tuple_count(sql: &str) -> usize {
    if sql.contains(" DEFAULT VALUES") {
        return 1;
    }
    sql.matches("($").count()
}

fn default_count(sql: &str, params: &[Value]) -> u64 {
    let n = if sql.starts_with("INSERT") || sql.contains(") IN ((") {
        tuple_count(sql)
    } else if sql.contains(" IN (") {
        params.len()
    } else {
        1
    };
    n as u64
}

impl MockConnection {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_id: 1000,
                ..MockState::default()
            })),
            queries: Vec::new(),
            counts: Vec::new(),
            fail_on: None,
        }
    }

    pub(crate) fn log(&self) -> Log {
        Log {
            state: Arc::clone(&self.state),
        }
    }

    /// Answer queries whose SQL contains `pattern`.
    pub(crate) fn on_query(
        mut self,
        pattern: &str,
        respond: impl Fn(&[Value]) -> Vec<Row> + Send + Sync + 'static,
    ) -> Self {
        let pattern = pattern.to_string();
        self.queries.push(Box::new(move |sql, params| {
            sql.contains(&pattern).then(|| respond(params))
        }));
        self
    }

    /// Report `count` affected rows for statements containing `pattern`.
    pub(crate) fn on_execute(mut self, pattern: &str, count: u64) -> Self {
        let pattern = pattern.to_string();
        self.counts
            .push(Box::new(move |sql, _| sql.contains(&pattern).then_some(count)));
        self
    }

    /// Fail statements containing `pattern` with a constraint error.
    pub(crate) fn fail_on(mut self, pattern: &str) -> Self {
        self.fail_on = Some(pattern.to_string());
        self
    }

    fn record(&self, sql: &str, params: &[Value]) -> Result<(), Error> {
        self.state
            .lock()
            .expect("lock poisoned")
            .executed
            .push((sql.to_string(), params.to_vec()));
        match &self.fail_on {
            Some(pattern) if sql.contains(pattern.as_str()) => Err(Error::Query(QueryError {
                kind: QueryErrorKind::Constraint,
                sql: Some(sql.to_string()),
                sqlstate: Some("23505".to_string()),
                message: "duplicate key value violates unique constraint".to_string(),
                source: None,
            })),
            _ => Ok(()),
        }
    }

    fn count_for(&self, sql: &str, params: &[Value]) -> u64 {
        self.counts
            .iter()
            .find_map(|respond| respond(sql, params))
            .unwrap_or_else(|| default_count(sql, params))
    }

    fn rows_for(&self, sql: &str, params: &[Value]) -> Vec<Row> {
        if let Some(rows) = self.queries.iter().find_map(|respond| respond(sql, params)) {
            return rows;
        }
        if sql.starts_with("INSERT") && sql.contains(" RETURNING ") {
            let mut state = self.state.lock().expect("lock poisoned");
            return (0..tuple_count(sql))
                .map(|_| {
                    state.next_id += 1;
                    Row::new(vec!["id".into()], vec![Value::BigInt(state.next_id)])
                })
                .collect();
        }
        Vec::new()
    }
}

impl Connection for MockConnection {
    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.record(sql, params).map(|()| self.rows_for(sql, params));
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.record(sql, params).map(|()| self.count_for(sql, params));
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn batch(
        &self,
        _cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        self.state.lock().expect("lock poisoned").batch_calls += 1;
        let result: Result<Vec<u64>, Error> = statements
            .iter()
            .map(|(sql, params)| {
                self.record(sql, params)
                    .map(|()| self.count_for(sql, params))
            })
            .collect();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}

/// Drive a future to completion on a fresh current-thread runtime.
pub(crate) fn run<Fut: Future>(fut: Fut) -> Fut::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(fut)
}

/// Unwrap an `Ok` outcome.
pub(crate) fn ok<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

/// Unwrap an `Err` outcome.
pub(crate) fn err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => std::panic::panic_any(format!("expected error, got {other:?}")),
    }
}

/// Run a future on a fresh runtime, panicking on anything but `Ok`.
pub(crate) fn block_on<T, F, Fut>(f: F) -> T
where
    T: std::fmt::Debug,
    F: FnOnce(Cx) -> Fut,
    Fut: Future<Output = Outcome<T, Error>>,
{
    ok(run(f(Cx::for_testing())))
}

/// Run a future and return its error, panicking on success.
pub(crate) fn expect_err<T, F, Fut>(f: F) -> Error
where
    T: std::fmt::Debug,
    F: FnOnce(Cx) -> Fut,
    Fut: Future<Output = Outcome<T, Error>>,
{
    err(run(f(Cx::for_testing())))
}

/// Build a row from `(column, value)` pairs.
pub(crate) fn row(pairs: &[(&str, Value)]) -> Row {
    Row::new(
        pairs.iter().map(|(c, _)| (*c).to_string()).collect(),
        pairs.iter().map(|(_, v)| v.clone()).collect(),
    )
}
