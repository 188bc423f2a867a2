//! The BQL catalog: populations, variables, generators and models, kept in
//! ordinary SQLite tables next to the user's data.

use rusqlite::{Connection, Error, OptionalExtension, params};
use tracing::info;

use crate::cache::CacheSlot;
use crate::error::{BqlError, Result};

pub const STATTYPES: [&str; 6] = [
    "nominal",
    "numerical",
    "cyclic",
    "counts",
    "magnitude",
    "categorical",
];

pub fn is_numeric_stattype(stattype: &str) -> bool {
    matches!(
        stattype.to_ascii_lowercase().as_str(),
        "numerical" | "cyclic" | "counts" | "magnitude"
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct Population {
    pub id: i64,
    pub name: String,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generator {
    pub id: i64,
    pub name: String,
    pub population_id: i64,
    pub backend: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub colno: i64,
    pub name: String,
    pub stattype: String,
    /// Set for latent variables, which belong to one generator.
    pub generator_id: Option<i64>,
}

impl Variable {
    pub fn is_latent(&self) -> bool {
        self.colno < 0
    }
}

/// Creates the catalog tables if they are missing.
pub fn install(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        create table if not exists bql_backend (
            name text not null,
            constraint referenceable_bql_backend primary key (
                name
            )
        );
        create table if not exists bql_stattype (
            name text not null collate nocase,
            constraint referenceable_bql_stattype primary key (
                name
            )
        );
        create table if not exists bql_column (
            tabname text not null collate nocase,
            colno integer not null,
            name text not null collate nocase,
            constraint referenceable_bql_column primary key (
                tabname,
                colno
            ),
            constraint unique_bql_column_name unique (
                tabname,
                name
            )
        );
        create table if not exists bql_population (
            id integer not null,
            name text not null collate nocase,
            tabname text not null collate nocase,
            constraint referenceable_bql_population primary key (
                id
            ),
            constraint unique_bql_population_name unique (
                name
            )
        );
        create table if not exists bql_generator (
            id integer not null,
            name text not null collate nocase,
            tabname text not null collate nocase,
            population_id integer not null,
            backend text not null,
            constraint referenceable_bql_generator primary key (
                id
            ),
            constraint unique_bql_generator_name unique (
                name
            ),
            constraint bql_generator_models_population foreign key (
                population_id
            ) references bql_population(id),
            constraint bql_generator_uses_backend foreign key (
                backend
            ) references bql_backend(name)
        );
        create table if not exists bql_variable (
            population_id integer not null,
            generator_id integer null,
            colno integer not null,
            name text not null collate nocase,
            stattype text not null collate nocase,
            constraint bql_variable_in_population foreign key (
                population_id
            ) references bql_population(id),
            constraint bql_variable_of_generator foreign key (
                generator_id
            ) references bql_generator(id),
            constraint bql_variable_has_stattype foreign key (
                stattype
            ) references bql_stattype(name),
            constraint unique_bql_variable_colno unique (
                population_id,
                generator_id,
                colno
            )
        );
        create table if not exists bql_model (
            generator_id integer not null,
            modelno integer not null,
            iterations integer not null default 0,
            constraint referenceable_bql_model primary key (
                generator_id,
                modelno
            ),
            constraint bql_model_of_generator foreign key (
                generator_id
            ) references bql_generator(id)
        );
        ",
    )?;
    let mut add_stattype =
        connection.prepare("insert or ignore into bql_stattype (name) values (?)")?;
    for stattype in STATTYPES {
        add_stattype.execute(params![stattype])?;
    }
    Ok(())
}

/// Catalog access through one connection. Reads go through the metadata
/// cache when one is open; every write invalidates it.
pub struct Catalog<'db> {
    pub db: &'db Connection,
    cache: &'db CacheSlot,
}

impl<'db> Catalog<'db> {
    pub fn new(db: &'db Connection, cache: &'db CacheSlot) -> Catalog<'db> {
        Catalog { db, cache }
    }

    // ------------------------------------------------------------- tables

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = self.db.query_row(
            "select count(*) from pragma_table_info(?)",
            params![table],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Column names of `table` in declaration order.
    pub fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let mut statement = self
            .db
            .prepare_cached("select name from pragma_table_info(?) order by cid")?;
        let columns = statement
            .query_map(params![table], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(columns)
    }

    pub fn temp_table_names(&self) -> Result<Vec<String>> {
        let mut statement = self
            .db
            .prepare_cached("select name from sqlite_temp_master where type = 'table'")?;
        let names = statement
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    pub fn table_in_use(&self, table: &str) -> Result<bool> {
        let count: i64 = self.db.query_row(
            "select count(*) from bql_population where tabname = ?",
            params![table],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------ backends

    pub fn register_backend(&self, name: &str) -> Result<()> {
        self.db.execute(
            "insert or ignore into bql_backend (name) values (?)",
            params![name],
        )?;
        Ok(())
    }

    pub fn stattype_exists(&self, stattype: &str) -> Result<bool> {
        let count: i64 = self.db.query_row(
            "select count(*) from bql_stattype where name = ?",
            params![stattype],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    // --------------------------------------------------------- populations

    pub fn population(&self, name: &str) -> Result<Option<Population>> {
        let key = name.to_lowercase();
        if let Some(Some(hit)) = self.cache.with(|c| c.populations.get(&key).cloned()) {
            return Ok(hit);
        }
        let found = self
            .db
            .query_row(
                "
                select id, name, tabname
                    from bql_population
                    where name = ?
                ",
                params![name],
                |r| {
                    Ok(Population {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        table: r.get(2)?,
                    })
                },
            )
            .optional()?;
        self.cache.with(|c| c.populations.insert(key, found.clone()));
        Ok(found)
    }

    pub fn population_by_id(&self, id: i64) -> Result<Population> {
        if let Some(Some(hit)) = self.cache.with(|c| c.populations_by_id.get(&id).cloned()) {
            return Ok(hit);
        }
        let found = match self.db.query_row(
            "select id, name, tabname from bql_population where id = ?",
            params![id],
            |r| {
                Ok(Population {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    table: r.get(2)?,
                })
            },
        ) {
            Ok(population) => population,
            Err(Error::QueryReturnedNoRows) => {
                return Err(BqlError::catalog(format!("no population with id {id}")));
            }
            Err(err) => return Err(err.into()),
        };
        self.cache
            .with(|c| c.populations_by_id.insert(id, found.clone()));
        Ok(found)
    }

    /// Looks a population up by name, failing when it is missing.
    pub fn require_population(&self, name: &str) -> Result<Population> {
        self.population(name)?
            .ok_or_else(|| BqlError::compile(format!("no such population: {name}")))
    }

    pub fn create_population(&self, name: &str, table: &str) -> Result<i64> {
        self.db.execute(
            "insert into bql_population (name, tabname) values (?, ?)",
            params![name, table],
        )?;
        let id = self.db.last_insert_rowid();
        let mut add_column = self.db.prepare_cached(
            "insert or ignore into bql_column (tabname, colno, name) values (?, ?, ?)",
        )?;
        for (colno, column) in self.table_columns(table)?.iter().enumerate() {
            add_column.execute(params![table, colno as i64, column])?;
        }
        self.cache.invalidate();
        info!(population = name, table, id, "created population");
        Ok(id)
    }

    pub fn drop_population(&self, id: i64) -> Result<()> {
        let population = self.population_by_id(id)?;
        self.db
            .execute("delete from bql_variable where population_id = ?", params![id])?;
        self.db
            .execute("delete from bql_population where id = ?", params![id])?;
        if !self.table_in_use(&population.table)? {
            self.db.execute(
                "delete from bql_column where tabname = ?",
                params![population.table],
            )?;
        }
        self.cache.invalidate();
        info!(population = %population.name, "dropped population");
        Ok(())
    }

    /// Column number of `column` in the population's base table.
    pub fn column_colno(&self, table: &str, column: &str) -> Result<Option<i64>> {
        Ok(self
            .db
            .query_row(
                "select colno from bql_column where tabname = ? and name = ? collate nocase",
                params![table, column],
                |r| r.get(0),
            )
            .optional()?)
    }

    /// Canonical spelling of a recorded column.
    pub fn column_name(&self, table: &str, colno: i64) -> Result<Option<String>> {
        Ok(self
            .db
            .query_row(
                "select name from bql_column where tabname = ? and colno = ?",
                params![table, colno],
                |r| r.get(0),
            )
            .optional()?)
    }

    // ----------------------------------------------------------- variables

    /// Manifest variables, plus the latent ones of `generator_id` if given,
    /// ordered by column number with manifest ones first.
    pub fn variables(&self, population_id: i64, generator_id: Option<i64>) -> Result<Vec<Variable>> {
        let key = (population_id, generator_id);
        if let Some(Some(hit)) = self.cache.with(|c| c.variables.get(&key).cloned()) {
            return Ok(hit);
        }
        let mut statement = self.db.prepare_cached(
            "
            select colno, name, stattype, generator_id
                from bql_variable
                where population_id = ?1
                and (generator_id is null or generator_id = ?2)
                order by colno < 0, abs(colno)
            ",
        )?;
        let variables = statement
            .query_map(params![population_id, generator_id], |r| {
                Ok(Variable {
                    colno: r.get(0)?,
                    name: r.get(1)?,
                    stattype: r.get(2)?,
                    generator_id: r.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<Variable>>>()?;
        self.cache.with(|c| c.variables.insert(key, variables.clone()));
        Ok(variables)
    }

    pub fn manifest_variables(&self, population_id: i64) -> Result<Vec<Variable>> {
        self.variables(population_id, None)
    }

    pub fn variable_by_name(
        &self,
        population_id: i64,
        generator_id: Option<i64>,
        name: &str,
    ) -> Result<Option<Variable>> {
        Ok(self
            .variables(population_id, generator_id)?
            .into_iter()
            .find(|v| v.name.eq_ignore_ascii_case(name)))
    }

    pub fn variable_by_colno(
        &self,
        population_id: i64,
        generator_id: Option<i64>,
        colno: i64,
    ) -> Result<Option<Variable>> {
        Ok(self
            .variables(population_id, generator_id)?
            .into_iter()
            .find(|v| v.colno == colno))
    }

    /// Any latent variable of the population, whichever generator owns it.
    pub fn latent_variable_exists(&self, population_id: i64, name: &str) -> Result<bool> {
        let count: i64 = self.db.query_row(
            "
            select count(*)
                from bql_variable
                where population_id = ?
                and generator_id is not null
                and name = ?
            ",
            params![population_id, name],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn add_variable(
        &self,
        population_id: i64,
        generator_id: Option<i64>,
        colno: i64,
        name: &str,
        stattype: &str,
    ) -> Result<()> {
        self.db.execute(
            "
            insert into bql_variable (
                population_id,
                generator_id,
                colno,
                name,
                stattype
            ) values (?, ?, ?, ?, ?)
            ",
            params![population_id, generator_id, colno, name, stattype],
        )?;
        self.cache.invalidate();
        Ok(())
    }

    pub fn set_stattype(&self, population_id: i64, colno: i64, stattype: &str) -> Result<()> {
        self.db.execute(
            "
            update bql_variable
                set stattype = ?
                where population_id = ?
                and generator_id is null
                and colno = ?
            ",
            params![stattype, population_id, colno],
        )?;
        self.cache.invalidate();
        Ok(())
    }

    /// Registers a latent variable owned by one generator. Latent column
    /// numbers count down from -1.
    pub fn create_latent_variable(
        &self,
        population_id: i64,
        generator_id: i64,
        name: &str,
        stattype: &str,
    ) -> Result<i64> {
        if self.variable_by_name(population_id, Some(generator_id), name)?.is_some() {
            return Err(BqlError::catalog(format!("variable {name} already exists")));
        }
        let lowest: Option<i64> = self.db.query_row(
            "select min(colno) from bql_variable where population_id = ? and colno < 0",
            params![population_id],
            |r| r.get(0),
        )?;
        let colno = lowest.map_or(-1, |c| c - 1);
        self.add_variable(population_id, Some(generator_id), colno, name, stattype)?;
        Ok(colno)
    }

    // ---------------------------------------------------------- generators

    pub fn generator(&self, name: &str) -> Result<Option<Generator>> {
        let key = name.to_lowercase();
        if let Some(Some(hit)) = self.cache.with(|c| c.generators.get(&key).cloned()) {
            return Ok(hit);
        }
        let found = self
            .db
            .query_row(
                "select id, name, population_id, backend from bql_generator where name = ?",
                params![name],
                |r| {
                    Ok(Generator {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        population_id: r.get(2)?,
                        backend: r.get(3)?,
                    })
                },
            )
            .optional()?;
        self.cache.with(|c| c.generators.insert(key, found.clone()));
        Ok(found)
    }

    pub fn require_generator(&self, name: &str) -> Result<Generator> {
        self.generator(name)?
            .ok_or_else(|| BqlError::compile(format!("no such generator: {name}")))
    }

    pub fn generator_by_id(&self, id: i64) -> Result<Generator> {
        if let Some(Some(hit)) = self.cache.with(|c| c.generators_by_id.get(&id).cloned()) {
            return Ok(hit);
        }
        let found = self
            .db
            .query_row(
                "select id, name, population_id, backend from bql_generator where id = ?",
                params![id],
                |r| {
                    Ok(Generator {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        population_id: r.get(2)?,
                        backend: r.get(3)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| BqlError::catalog(format!("no generator with id {id}")))?;
        self.cache
            .with(|c| c.generators_by_id.insert(id, found.clone()));
        Ok(found)
    }

    pub fn generators_of(&self, population_id: i64) -> Result<Vec<Generator>> {
        if let Some(Some(hit)) = self.cache.with(|c| c.generators_of.get(&population_id).cloned()) {
            return Ok(hit);
        }
        let mut statement = self.db.prepare_cached(
            "
            select id, name, population_id, backend
                from bql_generator
                where population_id = ?
                order by id
            ",
        )?;
        let generators = statement
            .query_map(params![population_id], |r| {
                Ok(Generator {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    population_id: r.get(2)?,
                    backend: r.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<Generator>>>()?;
        self.cache
            .with(|c| c.generators_of.insert(population_id, generators.clone()));
        Ok(generators)
    }

    pub fn create_generator(&self, name: &str, population: &Population, backend: &str) -> Result<i64> {
        self.db.execute(
            "
            insert into bql_generator (
                name,
                tabname,
                population_id,
                backend
            ) values (?, ?, ?, ?)
            ",
            params![name, population.table, population.id, backend],
        )?;
        let id = self.db.last_insert_rowid();
        self.cache.invalidate();
        info!(generator = name, population = %population.name, backend, id, "created generator");
        Ok(id)
    }

    pub fn drop_generator(&self, id: i64) -> Result<()> {
        self.db
            .execute("delete from bql_model where generator_id = ?", params![id])?;
        self.db
            .execute("delete from bql_variable where generator_id = ?", params![id])?;
        self.db
            .execute("delete from bql_generator where id = ?", params![id])?;
        self.cache.invalidate();
        info!(id, "dropped generator");
        Ok(())
    }

    pub fn rename_generator(&self, id: i64, name: &str) -> Result<()> {
        self.db.execute(
            "update bql_generator set name = ? where id = ?",
            params![name, id],
        )?;
        self.cache.invalidate();
        Ok(())
    }

    // -------------------------------------------------------------- models

    pub fn modelnos(&self, generator_id: i64) -> Result<Vec<u32>> {
        if let Some(Some(hit)) = self.cache.with(|c| c.modelnos.get(&generator_id).cloned()) {
            return Ok(hit);
        }
        let mut statement = self.db.prepare_cached(
            "select modelno from bql_model where generator_id = ? order by modelno",
        )?;
        let modelnos = statement
            .query_map(params![generator_id], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<u32>>>()?;
        self.cache
            .with(|c| c.modelnos.insert(generator_id, modelnos.clone()));
        Ok(modelnos)
    }

    pub fn add_models(&self, generator_id: i64, modelnos: &[u32]) -> Result<()> {
        let mut add_model = self.db.prepare_cached(
            "insert into bql_model (generator_id, modelno, iterations) values (?, ?, 0)",
        )?;
        for modelno in modelnos {
            add_model.execute(params![generator_id, modelno])?;
        }
        self.cache.invalidate();
        Ok(())
    }

    pub fn drop_models(&self, generator_id: i64, modelnos: Option<&[u32]>) -> Result<()> {
        match modelnos {
            None => {
                self.db.execute(
                    "delete from bql_model where generator_id = ?",
                    params![generator_id],
                )?;
            }
            Some(modelnos) => {
                let mut drop_model = self.db.prepare_cached(
                    "delete from bql_model where generator_id = ? and modelno = ?",
                )?;
                for modelno in modelnos {
                    drop_model.execute(params![generator_id, modelno])?;
                }
            }
        }
        self.cache.invalidate();
        Ok(())
    }

    pub fn add_iterations(&self, generator_id: i64, modelnos: &[u32], iterations: u64) -> Result<()> {
        let mut add = self.db.prepare_cached(
            "
            update bql_model
                set iterations = iterations + ?
                where generator_id = ?
                and modelno = ?
            ",
        )?;
        for modelno in modelnos {
            add.execute(params![iterations as i64, generator_id, modelno])?;
        }
        Ok(())
    }

    pub fn iterations(&self, generator_id: i64, modelno: u32) -> Result<Option<u64>> {
        let found: Option<i64> = self
            .db
            .query_row(
                "select iterations from bql_model where generator_id = ? and modelno = ?",
                params![generator_id, modelno],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.map(|n| n.max(0) as u64))
    }
}
