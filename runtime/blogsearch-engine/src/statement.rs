//! Prepared statements: bind, step, row access, reset, finalize.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_int;
use std::rc::Rc;

use rusqlite::ffi;

use crate::connection::ConnInner;
use crate::error::{DbError, Result};
use crate::marshal::{self, BoundMem, Params, Value};

/// A prepared, parameterizable statement.
///
/// Owned by the [`Connection`](crate::Connection) that prepared it; the
/// connection finalizes any still-live statements when it closes, after
/// which every operation here fails with [`DbError::StatementClosed`].
pub struct Statement {
    pub(crate) inner: Rc<StmtInner>,
}

pub(crate) struct StmtInner {
    conn: Rc<ConnInner>,
    raw: Cell<*mut ffi::sqlite3_stmt>,
    mem: RefCell<BoundMem>,
}

impl Statement {
    pub(crate) fn attach(conn: &Rc<ConnInner>, raw: *mut ffi::sqlite3_stmt) -> Self {
        Self {
            inner: Rc::new(StmtInner {
                conn: Rc::clone(conn),
                raw: Cell::new(raw),
                mem: RefCell::new(BoundMem::new()),
            }),
        }
    }

    /// Bind values after resetting the statement (which frees the buffers
    /// of any previous binding).
    ///
    /// Positional parameters bind in order starting at 1. Named
    /// parameters resolve through the engine; names the statement does
    /// not contain are silently skipped.
    pub fn bind(&self, params: &Params) -> Result<()> {
        self.inner.bind(params)
    }

    /// Advance one row. `true` means a row is available for [`get`].
    ///
    /// [`get`]: Statement::get
    pub fn step(&self) -> Result<bool> {
        self.inner.step()
    }

    /// Read the current row as plain values.
    pub fn get(&self) -> Result<Vec<Value>> {
        self.inner.row_values()
    }

    /// Read the current row keyed by column name. Duplicate names keep
    /// the last value in column order.
    pub fn get_named(&self) -> Result<HashMap<String, Value>> {
        let names = self.inner.names()?;
        let values = self.inner.row_values()?;
        Ok(names.into_iter().zip(values).collect())
    }

    /// Column names of the current result row.
    pub fn column_names(&self) -> Result<Vec<String>> {
        self.inner.names()
    }

    /// Shorthand for bind + step + reset, ignoring any produced row.
    pub fn run(&self, params: Option<&Params>) -> Result<()> {
        if let Some(params) = params {
            self.bind(params)?;
        }
        self.step()?;
        self.reset()?;
        Ok(())
    }

    /// Clear bindings and rewind, freeing the buffers backing the current
    /// binding first. Returns whether the engine accepted both calls.
    pub fn reset(&self) -> Result<bool> {
        self.inner.reset()
    }

    /// Finalize the statement. Idempotent: the first call releases the
    /// native handle and deregisters from the owning connection; later
    /// calls return `false`.
    pub fn free(&self) -> bool {
        let raw = self.inner.raw.get();
        if raw.is_null() {
            return false;
        }
        self.inner.conn.deregister(raw);
        self.inner.finalize_raw();
        true
    }

    #[cfg(test)]
    pub(crate) fn pending_allocations(&self) -> usize {
        self.inner.mem.borrow().len()
    }
}

impl StmtInner {
    fn raw_checked(&self) -> Result<*mut ffi::sqlite3_stmt> {
        let raw = self.raw.get();
        if raw.is_null() {
            Err(DbError::StatementClosed)
        } else {
            Ok(raw)
        }
    }

    fn bind(&self, params: &Params) -> Result<()> {
        self.raw_checked()?;
        self.reset()?;
        match params {
            Params::Positional(values) => {
                for (i, value) in values.iter().enumerate() {
                    self.bind_value(value, i as c_int + 1)?;
                }
            }
            Params::Named(values) => {
                let raw = self.raw.get();
                for (name, value) in values {
                    let cname = CString::new(name.as_str())?;
                    // SAFETY: raw is live and cname outlives the call.
                    let pos = unsafe { ffi::sqlite3_bind_parameter_index(raw, cname.as_ptr()) };
                    if pos != 0 {
                        self.bind_value(value, pos)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn bind_value(&self, value: &Value, pos: c_int) -> Result<()> {
        let raw = self.raw_checked()?;
        let rc = match value {
            // SAFETY for every arm: raw is a live statement handle; text
            // and blob buffers live in `mem` until the next reset or
            // finalize, both of which also clear the binding.
            Value::Null => unsafe { ffi::sqlite3_bind_null(raw, pos) },
            Value::Integer(i) => unsafe { ffi::sqlite3_bind_int64(raw, pos, *i) },
            Value::Real(f) => unsafe { ffi::sqlite3_bind_double(raw, pos, *f) },
            Value::Text(s) => {
                let ptr = self.mem.borrow_mut().alloc(s.as_bytes())?;
                unsafe {
                    ffi::sqlite3_bind_text(
                        raw,
                        pos,
                        ptr.cast(),
                        s.len() as c_int,
                        ffi::SQLITE_STATIC(),
                    )
                }
            }
            Value::Blob(b) if b.is_empty() => unsafe { ffi::sqlite3_bind_zeroblob(raw, pos, 0) },
            Value::Blob(b) => {
                let ptr = self.mem.borrow_mut().alloc(b)?;
                unsafe {
                    ffi::sqlite3_bind_blob(raw, pos, ptr, b.len() as c_int, ffi::SQLITE_STATIC())
                }
            }
        };
        self.conn.check(rc)
    }

    fn step(&self) -> Result<bool> {
        let raw = self.raw_checked()?;
        // SAFETY: raw is live.
        match unsafe { ffi::sqlite3_step(raw) } {
            ffi::SQLITE_ROW => Ok(true),
            ffi::SQLITE_DONE => Ok(false),
            code => Err(self.conn.engine_error(code)),
        }
    }

    fn reset(&self) -> Result<bool> {
        let raw = self.raw_checked()?;
        // Allocations go first so nothing below can leak them.
        self.mem.borrow_mut().free_all();
        // SAFETY: raw is live.
        let cleared = unsafe { ffi::sqlite3_clear_bindings(raw) } == ffi::SQLITE_OK;
        let rewound = unsafe { ffi::sqlite3_reset(raw) } == ffi::SQLITE_OK;
        Ok(cleared && rewound)
    }

    fn row_values(&self) -> Result<Vec<Value>> {
        let raw = self.raw_checked()?;
        // SAFETY: raw is live; read_column copies everything out.
        let count = unsafe { ffi::sqlite3_data_count(raw) };
        Ok((0..count)
            .map(|col| unsafe { marshal::read_column(raw, col) })
            .collect())
    }

    fn names(&self) -> Result<Vec<String>> {
        let raw = self.raw_checked()?;
        // SAFETY: raw is live; the name pointers are copied immediately.
        let count = unsafe { ffi::sqlite3_data_count(raw) };
        let mut names = Vec::with_capacity(count as usize);
        for col in 0..count {
            let ptr = unsafe { ffi::sqlite3_column_name(raw, col) };
            let name = if ptr.is_null() {
                String::new()
            } else {
                unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
            };
            names.push(name);
        }
        Ok(names)
    }

    /// Release bound memory and finalize the raw handle. Safe to call
    /// more than once; the handle is nulled on the first call.
    pub(crate) fn finalize_raw(&self) {
        let raw = self.raw.replace(std::ptr::null_mut());
        if raw.is_null() {
            return;
        }
        self.mem.borrow_mut().free_all();
        // SAFETY: raw was live and no other path can reach it now.
        unsafe {
            ffi::sqlite3_finalize(raw);
        }
    }
}

impl Drop for StmtInner {
    fn drop(&mut self) {
        let raw = self.raw.get();
        if !raw.is_null() {
            self.conn.deregister(raw);
            self.finalize_raw();
        }
    }
}
