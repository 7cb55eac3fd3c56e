//! Connections: statement ownership, script execution, scalar functions,
//! export, teardown.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{CStr, CString, c_void};
use std::fs;
use std::os::raw::{c_char, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr;
use std::rc::{Rc, Weak};

use rusqlite::ffi;

use crate::engine::Engine;
use crate::error::{DbError, Result};
use crate::marshal::{self, Params, QueryResult, Value};
use crate::statement::{Statement, StmtInner};

type ScalarFn = Box<dyn Fn(&[Value]) -> std::result::Result<Value, String>>;

/// Raw trampoline state handed to the engine as user data. Released
/// exactly once: on re-registration of the same name, or on close/export.
struct FuncToken(*mut ScalarFn);

/// One open database session and everything it owns: the engine handle,
/// outstanding prepared statements, and registered scalar functions.
///
/// Single-threaded by construction; dropping an open connection performs
/// [`close`](Connection::close).
pub struct Connection {
    inner: Rc<ConnInner>,
}

pub(crate) struct ConnInner {
    engine: Engine,
    file: PathBuf,
    db: Cell<*mut ffi::sqlite3>,
    statements: RefCell<HashMap<usize, Weak<StmtInner>>>,
    functions: RefCell<HashMap<String, FuncToken>>,
}

impl Connection {
    pub(crate) fn open(engine: Engine, file: PathBuf) -> Result<Self> {
        let db = open_raw(&file)?;
        tracing::debug!(file = %file.display(), "connection opened");
        Ok(Self {
            inner: Rc::new(ConnInner {
                engine,
                file,
                db: Cell::new(db),
                statements: RefCell::new(HashMap::new()),
                functions: RefCell::new(HashMap::new()),
            }),
        })
    }

    /// Prepare one statement, binding `params` when given. Extra script
    /// text after the first statement is ignored here (use [`exec`] for
    /// scripts).
    ///
    /// [`exec`]: Connection::exec
    pub fn prepare(&self, sql: &str, params: Option<&Params>) -> Result<Statement> {
        let db = self.inner.db_checked()?;
        let csql = CString::new(sql)?;
        let mut raw: *mut ffi::sqlite3_stmt = ptr::null_mut();
        // SAFETY: db is live, csql outlives the call.
        let rc =
            unsafe { ffi::sqlite3_prepare_v2(db, csql.as_ptr(), -1, &mut raw, ptr::null_mut()) };
        self.inner.check(rc)?;
        if raw.is_null() {
            return Err(DbError::EmptyStatement);
        }
        let stmt = self.inner.adopt(raw);
        if let Some(params) = params {
            if let Err(err) = stmt.bind(params) {
                stmt.free();
                return Err(err);
            }
        }
        Ok(stmt)
    }

    /// Execute `sql`, ignoring any rows it returns.
    ///
    /// With `params`, exactly one statement is prepared, bound, stepped
    /// and finalized; a multi-statement script is rejected because
    /// binding one parameter set to several statements is ambiguous.
    /// Without `params` the whole script runs.
    pub fn run(&self, sql: &str, params: Option<&Params>) -> Result<()> {
        let db = self.inner.db_checked()?;
        match params {
            Some(params) => {
                let stmt = self.prepare_single(sql, params)?;
                let outcome = stmt.step();
                stmt.free();
                outcome.map(|_| ())
            }
            None => {
                let csql = CString::new(sql)?;
                // SAFETY: db is live; no callback, no out-parameters.
                let rc = unsafe {
                    ffi::sqlite3_exec(db, csql.as_ptr(), None, ptr::null_mut(), ptr::null_mut())
                };
                self.inner.check(rc)
            }
        }
    }

    /// Prepare exactly one statement, rejecting trailing script text.
    fn prepare_single(&self, sql: &str, params: &Params) -> Result<Statement> {
        let db = self.inner.db_checked()?;
        let csql = CString::new(sql)?;
        let mut raw: *mut ffi::sqlite3_stmt = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();
        // SAFETY: db is live; csql (and therefore tail) outlives the call.
        let rc = unsafe { ffi::sqlite3_prepare_v2(db, csql.as_ptr(), -1, &mut raw, &mut tail) };
        self.inner.check(rc)?;
        if raw.is_null() {
            return Err(DbError::EmptyStatement);
        }
        let stmt = self.inner.adopt(raw);
        // SAFETY: tail points into csql's buffer.
        let trailing = !tail.is_null()
            && !unsafe { CStr::from_ptr(tail) }
                .to_string_lossy()
                .trim()
                .is_empty();
        if trailing {
            stmt.free();
            return Err(DbError::ParamsOnScript);
        }
        if let Err(err) = stmt.bind(params) {
            stmt.free();
            return Err(err);
        }
        Ok(stmt)
    }

    /// Execute a script, materializing one [`QueryResult`] per statement
    /// that produced at least one row.
    ///
    /// The script is walked by repeatedly preparing from the remaining
    /// tail. Every intermediate statement is finalized whether or not a
    /// later one fails; a failure still propagates, and a script that
    /// errors partway returns no results at all.
    pub fn exec(&self, sql: &str) -> Result<Vec<QueryResult>> {
        let db = self.inner.db_checked()?;
        let csql = CString::new(sql)?;
        let mut next: *const c_char = csql.as_ptr();
        let mut results = Vec::new();
        // SAFETY: `next` always points into csql's NUL-terminated buffer,
        // which outlives the loop.
        while unsafe { *next } != 0 {
            let mut raw: *mut ffi::sqlite3_stmt = ptr::null_mut();
            let mut tail: *const c_char = ptr::null();
            let rc = unsafe { ffi::sqlite3_prepare_v2(db, next, -1, &mut raw, &mut tail) };
            self.inner.check(rc)?;
            next = tail;
            if raw.is_null() {
                // Trailing whitespace or comments.
                break;
            }
            let stmt = self.inner.adopt(raw);
            let collected = collect_result(&stmt);
            stmt.free();
            results.extend(collected?);
        }
        Ok(results)
    }

    /// Execute one statement, invoking `on_row` for every result row as
    /// it is produced and `on_done` exactly once after the last row.
    ///
    /// Runs to completion before returning; an error finalizes the
    /// statement, skips `on_done`, and propagates.
    pub fn each<R, D>(&self, sql: &str, params: Option<&Params>, mut on_row: R, on_done: D) -> Result<()>
    where
        R: FnMut(HashMap<String, Value>),
        D: FnOnce(),
    {
        let stmt = self.prepare(sql, params)?;
        let outcome: Result<()> = (|| {
            while stmt.step()? {
                on_row(stmt.get_named()?);
            }
            Ok(())
        })();
        stmt.free();
        outcome?;
        on_done();
        Ok(())
    }

    /// Snapshot the database as a raw file image.
    ///
    /// Finalizes every live statement and releases every registered
    /// function, closes the engine handle (the only way to force the page
    /// cache out to the backing file), reads the file, then reopens a
    /// fresh handle against the same filename so the connection stays
    /// usable. Registered functions do not survive.
    pub fn export(&self) -> Result<Vec<u8>> {
        self.inner.db_checked()?;
        self.inner.release_owned();
        self.inner.close_db()?;
        let image = fs::read(&self.inner.file)?;
        let db = open_raw(&self.inner.file)?;
        self.inner.db.set(db);
        tracing::debug!(file = %self.inner.file.display(), bytes = image.len(), "exported");
        Ok(image)
    }

    /// Register (or replace) a scalar function of fixed `arity`.
    ///
    /// Arguments arrive as [`Value`]s; the returned variant is encoded
    /// back by its tag. An `Err` from `f` (or a panic, which is caught)
    /// surfaces as an engine-level error to the calling statement.
    pub fn create_function<F>(&self, name: &str, arity: usize, f: F) -> Result<()>
    where
        F: Fn(&[Value]) -> std::result::Result<Value, String> + 'static,
    {
        let db = self.inner.db_checked()?;
        let cname = CString::new(name)?;
        let token: *mut ScalarFn = Box::into_raw(Box::new(Box::new(f) as ScalarFn));
        // SAFETY: db is live; token stays valid until released below or
        // in release_owned, strictly after the registration is replaced
        // or the handle is closed.
        let rc = unsafe {
            ffi::sqlite3_create_function_v2(
                db,
                cname.as_ptr(),
                arity as c_int,
                ffi::SQLITE_UTF8,
                token.cast::<c_void>(),
                Some(call_scalar),
                None,
                None,
                None,
            )
        };
        if rc != ffi::SQLITE_OK {
            // The engine rejected the registration and never saw the token.
            // SAFETY: token came from Box::into_raw above, unseen elsewhere.
            unsafe { drop(Box::from_raw(token)) };
            return Err(self.inner.engine_error(rc));
        }
        let previous = self
            .inner
            .functions
            .borrow_mut()
            .insert(name.to_string(), FuncToken(token));
        if let Some(FuncToken(old)) = previous {
            // The engine replaced the old registration; its state is ours
            // to release.
            // SAFETY: old was produced by Box::into_raw at a previous
            // registration and removed from the map just now.
            unsafe { drop(Box::from_raw(old)) };
        }
        Ok(())
    }

    /// Rows changed by the most recent INSERT, UPDATE or DELETE.
    pub fn rows_modified(&self) -> Result<i64> {
        let db = self.inner.db_checked()?;
        // SAFETY: db is live.
        Ok(i64::from(unsafe { ffi::sqlite3_changes(db) }))
    }

    /// Close the session: finalize statements, release function
    /// trampolines, close the engine handle, unlink the backing file.
    /// Every further operation fails with [`DbError::ConnectionClosed`].
    pub fn close(&self) -> Result<()> {
        self.inner.db_checked()?;
        self.inner.release_owned();
        self.inner.close_db()?;
        self.inner.engine.remove_file(&self.inner.file)?;
        tracing::debug!(file = %self.inner.file.display(), "connection closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        !self.inner.db.get().is_null()
    }
}

impl ConnInner {
    fn db_checked(&self) -> Result<*mut ffi::sqlite3> {
        let db = self.db.get();
        if db.is_null() {
            Err(DbError::ConnectionClosed)
        } else {
            Ok(db)
        }
    }

    /// Translate a non-OK return code, reading the connection's error
    /// message immediately: the engine keeps a single last-error slot per
    /// connection and the next call overwrites it.
    pub(crate) fn engine_error(&self, code: c_int) -> DbError {
        let message = match self.db_checked() {
            // SAFETY: db is live.
            Ok(db) => unsafe { errmsg(db) },
            Err(_) => String::from("connection is closed"),
        };
        DbError::Engine { code, message }
    }

    pub(crate) fn check(&self, code: c_int) -> Result<()> {
        if code == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(self.engine_error(code))
        }
    }

    pub(crate) fn deregister(&self, raw: *mut ffi::sqlite3_stmt) {
        self.statements.borrow_mut().remove(&(raw as usize));
    }

    fn adopt(self: &Rc<Self>, raw: *mut ffi::sqlite3_stmt) -> Statement {
        let stmt = Statement::attach(self, raw);
        self.statements
            .borrow_mut()
            .insert(raw as usize, Rc::downgrade(&stmt.inner));
        stmt
    }

    /// Finalize every live statement and release every registered
    /// function trampoline.
    fn release_owned(&self) {
        let statements = self.statements.take();
        for (_, weak) in statements {
            if let Some(stmt) = weak.upgrade() {
                stmt.finalize_raw();
            }
        }
        let functions = self.functions.take();
        for (_, FuncToken(token)) in functions {
            // SAFETY: the token was produced by Box::into_raw at
            // registration and is released exactly here or on
            // re-registration, never both.
            unsafe { drop(Box::from_raw(token)) };
        }
    }

    fn close_db(&self) -> Result<()> {
        let db = self.db.replace(ptr::null_mut());
        if db.is_null() {
            return Ok(());
        }
        // SAFETY: db is live and every statement has been finalized.
        let rc = unsafe { ffi::sqlite3_close(db) };
        if rc != ffi::SQLITE_OK {
            // The handle stays open on a busy close; surface it.
            self.db.set(db);
            return Err(self.engine_error(rc));
        }
        Ok(())
    }
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        if self.db.get().is_null() {
            return;
        }
        self.release_owned();
        let _ = self.close_db();
        let _ = self.engine.remove_file(&self.file);
    }
}

fn collect_result(stmt: &Statement) -> Result<Option<QueryResult>> {
    let mut result: Option<QueryResult> = None;
    while stmt.step()? {
        let row = stmt.get()?;
        match &mut result {
            Some(r) => r.values.push(row),
            None => {
                result = Some(QueryResult {
                    columns: stmt.column_names()?,
                    values: vec![row],
                });
            }
        }
    }
    Ok(result)
}

fn open_raw(file: &Path) -> Result<*mut ffi::sqlite3> {
    let cpath = CString::new(file.to_string_lossy().as_bytes())?;
    let mut db: *mut ffi::sqlite3 = ptr::null_mut();
    // SAFETY: cpath outlives the call; db receives the handle.
    let rc = unsafe {
        ffi::sqlite3_open_v2(
            cpath.as_ptr(),
            &mut db,
            ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE,
            ptr::null(),
        )
    };
    if rc != ffi::SQLITE_OK {
        // A handle may be returned even on failure; read its message and
        // close it before reporting.
        let message = if db.is_null() {
            String::from("unable to open database")
        } else {
            // SAFETY: db is a (failed but live) handle.
            let message = unsafe { errmsg(db) };
            unsafe {
                ffi::sqlite3_close(db);
            }
            message
        };
        return Err(DbError::Engine { code: rc, message });
    }
    Ok(db)
}

/// Read the connection's last-error message.
///
/// # Safety
///
/// `db` must be a live connection handle.
unsafe fn errmsg(db: *mut ffi::sqlite3) -> String {
    let ptr = unsafe { ffi::sqlite3_errmsg(db) };
    if ptr.is_null() {
        return String::from("unknown engine error");
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// Trampoline for registered scalar functions.
///
/// # Safety
///
/// Invoked by the engine with a context whose user data is a live
/// `*mut ScalarFn` installed by [`Connection::create_function`].
unsafe extern "C" fn call_scalar(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    // SAFETY: the engine passes back the token installed at registration.
    let token = unsafe { ffi::sqlite3_user_data(ctx) } as *mut ScalarFn;
    let mut args = Vec::with_capacity(argc as usize);
    for i in 0..argc {
        // SAFETY: argv holds argc live value handles.
        let value = unsafe { *argv.add(i as usize) };
        args.push(unsafe { marshal::read_argument(value) });
    }
    // A panic must not unwind into the engine.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: the token is live for as long as the registration is.
        unsafe { (*token)(&args) }
    }));
    match outcome {
        Ok(Ok(value)) => unsafe { marshal::write_result(ctx, &value) },
        Ok(Err(message)) => unsafe { result_error(ctx, &message) },
        Err(_) => unsafe { result_error(ctx, "host function panicked") },
    }
}

/// # Safety
///
/// `ctx` must be the context of the currently executing callback.
unsafe fn result_error(ctx: *mut ffi::sqlite3_context, message: &str) {
    unsafe { ffi::sqlite3_result_error(ctx, message.as_ptr().cast(), message.len() as c_int) };
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use crate::engine::{Engine, EngineConfig};
    use crate::error::DbError;
    use crate::marshal::{Params, QueryResult, Value};

    fn engine() -> Engine {
        Engine::load(EngineConfig::default()).expect("engine")
    }

    #[test]
    fn exec_materializes_one_result_per_statement_with_rows() {
        let conn = engine().open(None).expect("open");
        let results = conn.exec("SELECT 1; SELECT 2,3;").expect("exec");
        assert_eq!(
            results,
            vec![
                QueryResult {
                    columns: vec!["1".into()],
                    values: vec![vec![Value::Integer(1)]],
                },
                QueryResult {
                    columns: vec!["2".into(), "3".into()],
                    values: vec![vec![Value::Integer(2), Value::Integer(3)]],
                },
            ]
        );
    }

    #[test]
    fn exec_skips_rowless_statements_and_propagates_failures() {
        let conn = engine().open(None).expect("open");
        let results = conn
            .exec("CREATE TABLE t (a); INSERT INTO t VALUES (7); SELECT a FROM t;")
            .expect("exec");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].values, vec![vec![Value::Integer(7)]]);

        let err = conn
            .exec("SELECT a FROM t; SELECT nope FROM missing;")
            .expect_err("script fails partway");
        assert!(matches!(err, DbError::Engine { .. }));
    }

    #[test]
    fn run_with_params_rejects_scripts() {
        let conn = engine().open(None).expect("open");
        conn.run("CREATE TABLE t (a)", None).expect("create");
        let err = conn
            .run(
                "INSERT INTO t VALUES (?1); INSERT INTO t VALUES (?1);",
                Some(&Params::positional([Value::Integer(1)])),
            )
            .expect_err("script with params");
        assert!(matches!(err, DbError::ParamsOnScript));

        conn.run(
            "INSERT INTO t VALUES (?1)",
            Some(&Params::positional([Value::Integer(5)])),
        )
        .expect("single statement binds");
        assert_eq!(conn.rows_modified().expect("changes"), 1);
    }

    #[test]
    fn each_streams_rows_then_fires_done_once() {
        let conn = engine().open(None).expect("open");
        conn.run(
            "CREATE TABLE people (name, age); \
             INSERT INTO people VALUES ('Ling', 1), ('Paul', 18), ('Markus', 3);",
            None,
        )
        .expect("seed");

        let mut names = Vec::new();
        let done = Cell::new(0u32);
        conn.each(
            "SELECT name FROM people WHERE age >= $majority ORDER BY name",
            Some(&Params::named([("$majority", Value::Integer(10))])),
            |row| {
                names.push(row.get("name").cloned());
                assert_eq!(done.get(), 0, "rows arrive before the terminal callback");
            },
            || done.set(done.get() + 1),
        )
        .expect("each");
        assert_eq!(names, vec![Some(Value::Text("Paul".into()))]);
        assert_eq!(done.get(), 1);

        // Zero matching rows still terminate exactly once.
        let done = Cell::new(0u32);
        conn.each(
            "SELECT name FROM people WHERE age > 100",
            None,
            |_| panic!("no rows expected"),
            || done.set(done.get() + 1),
        )
        .expect("empty each");
        assert_eq!(done.get(), 1);
    }

    #[test]
    fn export_round_trips_through_a_fresh_connection() {
        let engine = engine();
        let conn = engine.open(None).expect("open");
        conn.run(
            "CREATE TABLE t (a, b); INSERT INTO t VALUES (1, 'x'), (2, 'y');",
            None,
        )
        .expect("seed");
        let before = conn.exec("SELECT * FROM t").expect("before");

        let image = conn.export().expect("export");
        assert!(!image.is_empty());

        // The exporting connection stays usable.
        let after = conn.exec("SELECT * FROM t").expect("after");
        assert_eq!(before, after);

        let restored = engine.open(Some(&image)).expect("reopen from image");
        let replayed = restored.exec("SELECT * FROM t").expect("replayed");
        assert_eq!(before, replayed);
    }

    #[test]
    fn scalar_functions_round_trip_tagged_values() {
        let conn = engine().open(None).expect("open");
        conn.create_function("add_one", 1, |args| match args {
            [Value::Integer(i)] => Ok(Value::Integer(i + 1)),
            _ => Err("add_one expects an integer".into()),
        })
        .expect("register");
        let results = conn.exec("SELECT add_one(1)").expect("call");
        assert_eq!(results[0].values, vec![vec![Value::Integer(2)]]);

        let err = conn.exec("SELECT add_one('text')").expect_err("host error");
        match err {
            DbError::Engine { message, .. } => {
                assert!(message.contains("add_one expects an integer"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn scalar_function_panics_surface_as_engine_errors() {
        let conn = engine().open(None).expect("open");
        conn.create_function("boom", 0, |_| -> Result<Value, String> {
            panic!("unreachable input")
        })
        .expect("register");
        let err = conn.exec("SELECT boom()").expect_err("panic contained");
        match err {
            DbError::Engine { message, .. } => assert!(message.contains("panicked")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn re_registering_a_function_replaces_it() {
        let conn = engine().open(None).expect("open");
        conn.create_function("tag", 0, |_| Ok(Value::Text("old".into())))
            .expect("register");
        conn.create_function("tag", 0, |_| Ok(Value::Text("new".into())))
            .expect("re-register");
        let results = conn.exec("SELECT tag()").expect("call");
        assert_eq!(results[0].values, vec![vec![Value::Text("new".into())]]);
    }

    #[test]
    fn close_fails_fast_afterwards_and_finalizes_statements() {
        let conn = engine().open(None).expect("open");
        conn.run("CREATE TABLE t (a)", None).expect("create");
        let stmt = conn.prepare("SELECT a FROM t", None).expect("prepare");

        conn.close().expect("close");
        assert!(!conn.is_open());
        assert!(matches!(stmt.step(), Err(DbError::StatementClosed)));
        assert!(matches!(conn.exec("SELECT 1"), Err(DbError::ConnectionClosed)));
        assert!(matches!(conn.run("SELECT 1", None), Err(DbError::ConnectionClosed)));
        assert!(matches!(conn.export(), Err(DbError::ConnectionClosed)));
        assert!(matches!(conn.close(), Err(DbError::ConnectionClosed)));
    }

    #[test]
    fn prepare_rejects_empty_sql() {
        let conn = engine().open(None).expect("open");
        assert!(matches!(
            conn.prepare("   -- nothing here", None),
            Err(DbError::EmptyStatement)
        ));
    }

    #[test]
    fn open_from_image_seeds_the_database() {
        let engine = engine();
        let conn = engine.open(None).expect("open");
        conn.run("CREATE TABLE t (a); INSERT INTO t VALUES (9);", None)
            .expect("seed");
        let image = conn.export().expect("export");

        let other = engine.open(Some(&image)).expect("open image");
        let results = other.exec("SELECT a FROM t").expect("select");
        assert_eq!(results[0].values, vec![vec![Value::Integer(9)]]);
    }
}
