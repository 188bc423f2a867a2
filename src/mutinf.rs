//! `bql_mutinf`: mutual information as a queryable relation.
//!
//! ```sql
//! select mi from bql_mutinf
//!     where population_id = 1
//!     and target_vars = '[0]'
//!     and reference_vars = '[1, 2]'
//!     and conditions = '{"3": "red"}'
//! ```
//!
//! Each scan computes the estimate once and yields one row per model per
//! generator, so ordinary predicates and aggregates apply to the samples
//! without recomputing them. Nothing is kept between scans.

use std::collections::BTreeMap;
use std::ffi::c_int;
use std::marker::PhantomData;
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::vtab::{
    Context, Filters, IndexConstraintOp, IndexInfo, VTab, VTabConnection, VTabCursor,
    eponymous_only_module,
};
use rusqlite::{Connection, Error, ffi};

use crate::engine::Shared;
use crate::error::{BqlError, Result};
use crate::functions::Ensemble;

const COLUMN_MI: c_int = 0;
const COLUMN_POPULATION_ID: c_int = 1;
const COLUMN_GENERATOR_ID: c_int = 2;
const COLUMN_TARGET_VARS: c_int = 3;
const COLUMN_REFERENCE_VARS: c_int = 4;
const COLUMN_CONDITIONS: c_int = 5;
const COLUMN_NSAMPLES: c_int = 6;

const REQUIRED: [c_int; 3] = [COLUMN_POPULATION_ID, COLUMN_TARGET_VARS, COLUMN_REFERENCE_VARS];

pub fn load_module(connection: &Connection, shared: &Arc<Shared>) -> Result<()> {
    connection.create_module(
        c"bql_mutinf",
        eponymous_only_module::<MutinfTab>(),
        Some(Arc::clone(shared)),
    )?;
    Ok(())
}

#[repr(C)]
struct MutinfTab {
    base: ffi::sqlite3_vtab,
    db: *mut ffi::sqlite3,
    shared: Arc<Shared>,
}

fn unusable_plan() -> Error {
    Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_CONSTRAINT), None)
}

// SAFETY: MutinfTab is repr(C) with the sqlite3_vtab base as its first field.
unsafe impl<'vtab> VTab<'vtab> for MutinfTab {
    type Aux = Arc<Shared>;
    type Cursor = MutinfCursor<'vtab>;

    fn connect(
        db: &mut VTabConnection,
        aux: Option<&Arc<Shared>>,
        _args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let shared = aux
            .cloned()
            .ok_or_else(|| Error::ModuleError("bql_mutinf needs engine state".to_string()))?;
        let vtab = MutinfTab {
            base: ffi::sqlite3_vtab::default(),
            // SAFETY: the handle stays valid for as long as SQLite keeps this
            // table connected.
            db: unsafe { db.handle() },
            shared,
        };
        Ok((
            "create table x(
                mi real,
                population_id hidden,
                generator_id hidden,
                target_vars hidden,
                reference_vars hidden,
                conditions hidden,
                nsamples hidden
            )"
            .to_string(),
            vtab,
        ))
    }

    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        let mut bound: [Option<usize>; 7] = [None; 7];
        for (i, constraint) in info.constraints().enumerate() {
            let column = constraint.column();
            if column <= COLUMN_MI || column > COLUMN_NSAMPLES {
                continue;
            }
            if constraint.is_usable()
                && constraint.operator() == IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ
            {
                bound[column as usize] = Some(i);
            }
        }
        if REQUIRED.iter().any(|&c| bound[c as usize].is_none()) {
            return Err(unusable_plan());
        }
        let mut idx_num = 0;
        let mut argv_index = 0;
        for (column, slot) in bound.iter().enumerate() {
            if let Some(i) = slot {
                argv_index += 1;
                idx_num |= 1 << column;
                let mut usage = info.constraint_usage(*i);
                usage.set_argv_index(argv_index);
                usage.set_omit(true);
            }
        }
        info.set_idx_num(idx_num);
        info.set_estimated_cost(1.0);
        info.set_estimated_rows(100);
        Ok(())
    }

    fn open(&'vtab mut self) -> rusqlite::Result<MutinfCursor<'vtab>> {
        Ok(MutinfCursor {
            base: ffi::sqlite3_vtab_cursor::default(),
            tab: self,
            request: Request::default(),
            rows: Vec::new(),
            position: 0,
            phantom: PhantomData,
        })
    }
}

/// The filter values of one scan.
#[derive(Debug, Default)]
struct Request {
    population_id: i64,
    generator_id: Option<i64>,
    target_vars: String,
    reference_vars: String,
    conditions: Option<String>,
    nsamples: Option<i64>,
}

impl Request {
    fn read(idx_num: c_int, args: &Filters<'_>) -> rusqlite::Result<Request> {
        let mut request = Request::default();
        let mut k = 0;
        for column in COLUMN_POPULATION_ID..=COLUMN_NSAMPLES {
            if idx_num & (1 << column) == 0 {
                continue;
            }
            match column {
                COLUMN_POPULATION_ID => request.population_id = args.get(k)?,
                COLUMN_GENERATOR_ID => request.generator_id = args.get(k)?,
                COLUMN_TARGET_VARS => request.target_vars = args.get(k)?,
                COLUMN_REFERENCE_VARS => request.reference_vars = args.get(k)?,
                COLUMN_CONDITIONS => request.conditions = args.get(k)?,
                _ => request.nsamples = args.get(k)?,
            }
            k += 1;
        }
        Ok(request)
    }

    /// Runs the estimate, one `(generator, mi)` pair per model.
    fn compute(&self, connection: &Connection, shared: &Shared) -> Result<Vec<(i64, f64)>> {
        let targets: Vec<i64> = serde_json::from_str(&self.target_vars)?;
        let references: Vec<i64> = serde_json::from_str(&self.reference_vars)?;
        let mut constraints = Vec::new();
        if let Some(text) = &self.conditions {
            let conditions: BTreeMap<String, serde_json::Value> = serde_json::from_str(text)?;
            for (colno, value) in &conditions {
                let colno: i64 = colno.parse().map_err(|_| {
                    BqlError::Bind(format!("mutual information condition on bad column {colno:?}"))
                })?;
                constraints.push((colno, crate::functions::json_to_value(value)));
            }
        }
        let nsamples = crate::functions::sample_count(self.nsamples, shared.settings.mutinf_samples)?;
        let ensemble = Ensemble::new(connection, shared, self.population_id, self.generator_id, None)?;
        let samples = ensemble.mutual_information_samples(&targets, &references, &constraints, nsamples)?;
        Ok(samples
            .into_iter()
            .flat_map(|(generator_id, values)| values.into_iter().map(move |mi| (generator_id, mi)))
            .collect())
    }
}

#[repr(C)]
struct MutinfCursor<'vtab> {
    base: ffi::sqlite3_vtab_cursor,
    tab: &'vtab MutinfTab,
    request: Request,
    rows: Vec<(i64, f64)>,
    position: usize,
    phantom: PhantomData<&'vtab MutinfTab>,
}

// SAFETY: MutinfCursor is repr(C) with the sqlite3_vtab_cursor base first.
unsafe impl VTabCursor for MutinfCursor<'_> {
    fn filter(&mut self, idx_num: c_int, _idx_str: Option<&str>, args: &Filters<'_>) -> rusqlite::Result<()> {
        self.request = Request::read(idx_num, args)?;
        // SAFETY: the connection does not outlive this call and is not closed
        // when dropped.
        let connection = unsafe { Connection::from_handle(self.tab.db)? };
        self.rows = self.request.compute(&connection, &self.tab.shared)?;
        self.position = 0;
        Ok(())
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        self.position += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.position >= self.rows.len()
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> rusqlite::Result<()> {
        let Some(&(generator_id, mi)) = self.rows.get(self.position) else {
            return ctx.set_result(&Value::Null);
        };
        match i {
            COLUMN_MI => ctx.set_result(&mi),
            COLUMN_POPULATION_ID => ctx.set_result(&self.request.population_id),
            COLUMN_GENERATOR_ID => ctx.set_result(&generator_id),
            COLUMN_TARGET_VARS => ctx.set_result(&self.request.target_vars),
            COLUMN_REFERENCE_VARS => ctx.set_result(&self.request.reference_vars),
            COLUMN_CONDITIONS => ctx.set_result(&self.request.conditions),
            _ => ctx.set_result(&self.request.nsamples),
        }
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        Ok(self.position as i64)
    }
}
