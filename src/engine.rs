//! Phrase execution.
//!
//! Queries are compiled, their winders run, and their rows buffered inside a
//! savepoint; the unwinders travel with the returned [`Cursor`]. Every
//! catalog command runs in a savepoint of its own, so a command that fails
//! halfway leaves no trace.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use roaring::RoaringBitmap;
use rusqlite::config::DbConfig;
use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};
use tracing::{debug, info, trace};

use crate::ast::{AlterGenerator, AlterPopulation, AnalyzeModels, Command, ParsedPhrase, Phrase, PopulationClause, Query};
use crate::backend::{AnalysisBudget, Backend, ModelScope, Registry};
use crate::cache::CacheSlot;
use crate::catalog::{self, Catalog, Generator, Population, is_numeric_stattype};
use crate::compiler::Compiler;
use crate::config::Settings;
use crate::cursor::{Cursor, Unwind};
use crate::error::{BqlError, Result};
use crate::functions;
use crate::guess::{Guess, guess_stattype, numeric_coercible};
use crate::mutinf;
use crate::output::{Bindings, BoundStatement, Compiled, Params, quote_ident};
use crate::parser::{parse_bql_phrase, phrases};
use crate::txn::{Savepoint, Transactions};

/// State shared between the engine and the SQL functions and virtual table
/// it registers on its connection.
#[derive(Default)]
pub struct Shared {
    pub registry: Registry,
    pub cache: CacheSlot,
    pub settings: Settings,
}

/// A BQL session over one SQLite connection.
pub struct Bql {
    connection: Connection,
    shared: Arc<Shared>,
    transactions: Transactions,
}

impl Bql {
    pub fn open(path: impl AsRef<Path>) -> Result<Bql> {
        Bql::with_settings(Connection::open(path)?, Settings::default())
    }

    pub fn open_in_memory() -> Result<Bql> {
        Bql::with_settings(Connection::open_in_memory()?, Settings::default())
    }

    /// Installs the catalog and the `bql_*` functions on `connection`.
    pub fn with_settings(connection: Connection, settings: Settings) -> Result<Bql> {
        // Quoted names that match no column must fail instead of reading as text.
        connection.set_db_config(DbConfig::SQLITE_DBCONFIG_DQS_DML, false)?;
        connection.set_db_config(DbConfig::SQLITE_DBCONFIG_DQS_DDL, false)?;
        catalog::install(&connection)?;
        let shared = Arc::new(Shared {
            registry: Registry::default(),
            cache: CacheSlot::default(),
            settings,
        });
        functions::register(&connection, &shared)?;
        mutinf::load_module(&connection, &shared)?;
        debug!("bql session opened");
        Ok(Bql {
            connection,
            shared,
            transactions: Transactions::default(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn catalog(&self) -> Catalog<'_> {
        Catalog::new(&self.connection, &self.shared.cache)
    }

    pub fn in_transaction(&self) -> bool {
        self.transactions.in_transaction()
    }

    pub fn register_backend(&self, backend: Arc<dyn Backend>) -> Result<()> {
        backend.register(&self.connection)?;
        self.catalog().register_backend(backend.name())?;
        info!(backend = backend.name(), "registered backend");
        self.shared.registry.insert(backend);
        Ok(())
    }

    /// Opens a savepoint that rolls back unless committed.
    pub fn savepoint(&self) -> Result<Savepoint<'_>> {
        self.transactions
            .savepoint(&self.connection, &self.shared.cache)
    }

    /// Runs raw SQL, bypassing the BQL compiler.
    pub fn sql_execute(&self, sql: &str) -> Result<()> {
        trace!(sql, "raw sql");
        let outcome = self.connection.execute_batch(sql);
        self.shared.cache.invalidate();
        outcome.map_err(Into::into)
    }

    /// Compiles one query phrase without running it.
    pub fn compile(&self, text: &str, bindings: impl Into<Bindings>) -> Result<Compiled> {
        let phrase = parse_bql_phrase(text)?;
        Compiler::new(&self.connection, &self.shared).compile(&phrase, &bindings.into())
    }

    pub fn execute(&self, text: &str) -> Result<Cursor<'_>> {
        self.execute_with(text, Bindings::None)
    }

    pub fn execute_with(&self, text: &str, bindings: impl Into<Bindings>) -> Result<Cursor<'_>> {
        let phrase = parse_bql_phrase(text)?;
        self.execute_phrase(&phrase, &bindings.into())
    }

    /// Runs every phrase of `text` in order, discarding query results.
    /// Phrases are parsed one at a time, so those before a failing one have
    /// already run. Returns how many phrases ran.
    pub fn execute_script(&self, text: &str) -> Result<usize> {
        let mut count = 0;
        for phrase in phrases(text) {
            let phrase = phrase?;
            self.execute_phrase(&phrase, &Bindings::None)?.close();
            count += 1;
        }
        Ok(count)
    }

    pub fn execute_phrase(&self, phrase: &ParsedPhrase, bindings: &Bindings) -> Result<Cursor<'_>> {
        match phrase.phrase() {
            Phrase::Query(query) => self.query(phrase, query, bindings),
            Phrase::Command(Command::Begin) => {
                self.transactions
                    .begin(&self.connection, &self.shared.cache)?;
                Ok(Cursor::empty(&self.connection))
            }
            Phrase::Command(Command::Commit) => {
                self.transactions
                    .commit(&self.connection, &self.shared.cache)?;
                Ok(Cursor::empty(&self.connection))
            }
            Phrase::Command(Command::Rollback) => {
                self.transactions
                    .rollback(&self.connection, &self.shared.cache)?;
                Ok(Cursor::empty(&self.connection))
            }
            Phrase::Command(command) => {
                let savepoint = self.savepoint()?;
                self.command(phrase, command, bindings)?;
                savepoint.commit()?;
                Ok(Cursor::empty(&self.connection))
            }
        }
    }

    fn compiler(&self) -> Compiler<'_> {
        Compiler::new(&self.connection, &self.shared)
    }

    fn run_winders(&self, winders: &[BoundStatement]) -> Result<()> {
        for winder in winders {
            trace!(sql = %winder.sql, "winding");
            self.connection
                .execute(&winder.sql, params_from_iter(winder.bindings.iter()))?;
        }
        Ok(())
    }

    fn query(&self, phrase: &ParsedPhrase, query: &Query, bindings: &Bindings) -> Result<Cursor<'_>> {
        let savepoint = self.savepoint()?;
        let compiled = self
            .compiler()
            .compile_query(query, Params::for_phrase(phrase), bindings)?;
        let unwind = Unwind::new(&self.connection, compiled.unwinders.clone());
        self.run_winders(&compiled.winders)?;
        let mut statement = self.connection.prepare(&compiled.sql)?;
        let columns: Vec<String> = statement
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let width = columns.len();
        let rows = statement
            .query_map(params_from_iter(compiled.bindings.iter()), |r| {
                (0..width).map(|i| r.get::<_, Value>(i)).collect()
            })?
            .collect::<rusqlite::Result<Vec<Vec<Value>>>>()?;
        drop(statement);
        savepoint.commit()?;
        debug!(rows = rows.len(), "query executed");
        Ok(Cursor::new(columns, rows, unwind))
    }

    fn backend(&self, generator: &Generator) -> Result<Arc<dyn Backend>> {
        self.shared.registry.get(&generator.backend)
    }

    fn population(&self, name: &str) -> Result<Population> {
        self.catalog()
            .population(name)?
            .ok_or_else(|| BqlError::catalog(format!("no such population: {name}")))
    }

    fn generator(&self, name: &str) -> Result<Generator> {
        self.catalog()
            .generator(name)?
            .ok_or_else(|| BqlError::catalog(format!("no such generator: {name}")))
    }

    fn stattype(&self, stattype: &str) -> Result<String> {
        let stattype = stattype.to_lowercase();
        if !self.catalog().stattype_exists(&stattype)? {
            return Err(BqlError::catalog(format!(
                "unknown statistical type: {stattype}"
            )));
        }
        Ok(stattype)
    }

    /// Model numbers of `generator`, refusing any in `requested` it lacks.
    fn existing_models(&self, generator: &Generator, requested: Option<&[u32]>) -> Result<Vec<u32>> {
        let existing: RoaringBitmap = self.catalog().modelnos(generator.id)?.into_iter().collect();
        match requested {
            None => Ok(existing.iter().collect()),
            Some(modelnos) => {
                if let Some(missing) = modelnos.iter().find(|m| !existing.contains(**m)) {
                    return Err(BqlError::catalog(format!(
                        "generator {} has no model {missing}",
                        generator.name
                    )));
                }
                Ok(modelnos.to_vec())
            }
        }
    }

    fn command(&self, phrase: &ParsedPhrase, command: &Command, bindings: &Bindings) -> Result<()> {
        let catalog = self.catalog();
        match command {
            Command::Begin | Command::Commit | Command::Rollback => Err(BqlError::Invariant(
                "transaction control reached the command dispatcher".to_string(),
            )),
            Command::CreateTableAs {
                temp,
                if_not_exists,
                name,
                query,
            } => {
                let compiled = self
                    .compiler()
                    .compile_query(query, Params::for_phrase(phrase), bindings)?;
                let _unwind = Unwind::new(&self.connection, compiled.unwinders.clone());
                self.run_winders(&compiled.winders)?;
                let sql = format!(
                    "CREATE {}TABLE {}{} AS {}",
                    if *temp { "TEMP " } else { "" },
                    if *if_not_exists { "IF NOT EXISTS " } else { "" },
                    quote_ident(name),
                    compiled.sql
                );
                self.connection
                    .execute(&sql, params_from_iter(compiled.bindings.iter()))?;
                info!(table = %name, "created table from query");
                Ok(())
            }
            Command::DropTable { if_exists, name } => {
                if catalog.table_in_use(name)? {
                    return Err(BqlError::catalog(format!(
                        "table {name} is the base of a population"
                    )));
                }
                if !*if_exists && !catalog.table_exists(name)? {
                    return Err(BqlError::catalog(format!("no such table: {name}")));
                }
                self.connection.execute_batch(&format!(
                    "DROP TABLE {}{}",
                    if *if_exists { "IF EXISTS " } else { "" },
                    quote_ident(name)
                ))?;
                Ok(())
            }
            Command::CreatePopulation {
                if_not_exists,
                name,
                table,
                schema,
            } => self.create_population(*if_not_exists, name, table, schema),
            Command::DropPopulation { if_exists, name } => {
                let Some(population) = catalog.population(name)? else {
                    if *if_exists {
                        return Ok(());
                    }
                    return Err(BqlError::catalog(format!("no such population: {name}")));
                };
                let generators = catalog.generators_of(population.id)?;
                if let Some(generator) = generators.first() {
                    return Err(BqlError::catalog(format!(
                        "population {} is still modeled by generator {}",
                        population.name, generator.name
                    )));
                }
                catalog.drop_population(population.id)
            }
            Command::AlterPopulation {
                population,
                commands,
            } => self.alter_population(population, commands),
            Command::CreateGenerator {
                if_not_exists,
                name,
                population,
                backend,
                schema,
            } => {
                if catalog.generator(name)?.is_some() {
                    if *if_not_exists {
                        return Ok(());
                    }
                    return Err(BqlError::catalog(format!("generator {name} already exists")));
                }
                let population = self.population(population)?;
                let backend_name = match backend.clone().or_else(|| self.shared.settings.default_backend.clone()) {
                    Some(backend) => backend,
                    None => {
                        let mut names = self.shared.registry.names();
                        if names.len() != 1 {
                            return Err(BqlError::backend(format!(
                                "generator {name} needs a backend: name one with USING or configure default_backend"
                            )));
                        }
                        names.remove(0)
                    }
                };
                let backend = self.shared.registry.get(&backend_name)?;
                let id = catalog.create_generator(name, &population, backend.name())?;
                let scope = ModelScope {
                    population_id: population.id,
                    generator_id: id,
                    modelnos: None,
                };
                let latents = backend.create_generator(&self.connection, scope, schema)?;
                for latent in latents {
                    let stattype = latent.stattype.to_lowercase();
                    if !catalog.stattype_exists(&stattype)? {
                        return Err(BqlError::catalog(format!(
                            "latent variable {} has unknown statistical type {}",
                            latent.name, latent.stattype
                        )));
                    }
                    let colno = catalog.create_latent_variable(population.id, id, &latent.name, &stattype)?;
                    info!(generator = %name, variable = %latent.name, colno, "declared latent variable");
                }
                Ok(())
            }
            Command::DropGenerator { if_exists, name } => {
                let Some(generator) = catalog.generator(name)? else {
                    if *if_exists {
                        return Ok(());
                    }
                    return Err(BqlError::catalog(format!("no such generator: {name}")));
                };
                let backend = self.backend(&generator)?;
                let scope = scope_of(&generator, None);
                backend.drop_models(&self.connection, scope)?;
                backend.drop_generator(&self.connection, scope)?;
                catalog.drop_generator(generator.id)
            }
            Command::AlterGenerator {
                generator,
                commands,
            } => {
                let mut generator = self.generator(generator)?;
                let backend = self.backend(&generator)?;
                for command in commands {
                    match command {
                        AlterGenerator::RenameTo(new_name) => {
                            if let Some(other) = catalog.generator(new_name)? {
                                if other.id != generator.id {
                                    return Err(BqlError::catalog(format!(
                                        "generator {new_name} already exists"
                                    )));
                                }
                            }
                            backend.rename_generator(
                                &self.connection,
                                scope_of(&generator, None),
                                &generator.name,
                                new_name,
                            )?;
                            catalog.rename_generator(generator.id, new_name)?;
                            info!(from = %generator.name, to = %new_name, "renamed generator");
                            generator.name = new_name.clone();
                        }
                        AlterGenerator::Backend(tokens) => {
                            backend.alter_generator(&self.connection, scope_of(&generator, None), tokens)?;
                        }
                    }
                }
                Ok(())
            }
            Command::InitializeModels {
                count,
                if_not_exists,
                generator,
            } => {
                let generator = self.generator(generator)?;
                let existing: RoaringBitmap = catalog.modelnos(generator.id)?.into_iter().collect();
                if !*if_not_exists {
                    if let Some(taken) = (0..*count).find(|m| existing.contains(*m)) {
                        return Err(BqlError::catalog(format!(
                            "generator {} already has model {taken}",
                            generator.name
                        )));
                    }
                }
                let fresh: Vec<u32> = (0..*count).filter(|m| !existing.contains(*m)).collect();
                if fresh.is_empty() {
                    return Ok(());
                }
                catalog.add_models(generator.id, &fresh)?;
                self.backend(&generator)?.initialize_models(
                    &self.connection,
                    scope_of(&generator, Some(&fresh)),
                    &fresh,
                )?;
                info!(generator = %generator.name, models = fresh.len(), "initialized models");
                Ok(())
            }
            Command::AnalyzeModels(analysis) => self.analyze_models(analysis),
            Command::DropModels {
                modelnos,
                generator,
            } => {
                let generator = self.generator(generator)?;
                self.existing_models(&generator, modelnos.as_deref())?;
                self.backend(&generator)?
                    .drop_models(&self.connection, scope_of(&generator, modelnos.as_deref()))?;
                catalog.drop_models(generator.id, modelnos.as_deref())?;
                info!(generator = %generator.name, "dropped models");
                Ok(())
            }
        }
    }

    fn create_population(&self, if_not_exists: bool, name: &str, table: &str, schema: &[PopulationClause]) -> Result<()> {
        let catalog = self.catalog();
        if catalog.population(name)?.is_some() {
            if if_not_exists {
                return Ok(());
            }
            return Err(BqlError::catalog(format!("population {name} already exists")));
        }
        if !catalog.table_exists(table)? {
            return Err(BqlError::catalog(format!("no such table: {table}")));
        }
        let columns = catalog.table_columns(table)?;
        let resolve = |column: &str| {
            columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(column))
                .ok_or_else(|| BqlError::catalog(format!("no such column {column} in table {table}")))
        };

        // colno -> stattype, None for ignored columns
        let mut decided: BTreeMap<usize, Option<String>> = BTreeMap::new();
        let mut guessed: BTreeSet<usize> = BTreeSet::new();
        let mut guess_rest = false;
        let mut decide = |colno: usize, stattype: Option<String>, column: &str| {
            if decided.insert(colno, stattype).is_some() {
                return Err(BqlError::catalog(format!(
                    "column {column} appears twice in population {name}"
                )));
            }
            Ok(())
        };
        for clause in schema {
            match clause {
                PopulationClause::Model { columns, stattype } => {
                    let stattype = self.stattype(stattype)?;
                    for column in columns {
                        decide(resolve(column)?, Some(stattype.clone()), column)?;
                    }
                }
                PopulationClause::Ignore(columns) => {
                    for column in columns {
                        decide(resolve(column)?, None, column)?;
                    }
                }
                PopulationClause::Guess(None) => guess_rest = true,
                PopulationClause::Guess(Some(columns)) => {
                    for column in columns {
                        if !guessed.insert(resolve(column)?) {
                            return Err(BqlError::catalog(format!(
                                "column {column} appears twice in population {name}"
                            )));
                        }
                    }
                }
            }
        }
        if let Some(colno) = guessed.iter().find(|c| decided.contains_key(c)) {
            return Err(BqlError::catalog(format!(
                "column {} appears twice in population {name}",
                columns[*colno]
            )));
        }

        let mut variables: Vec<(usize, String)> = Vec::new();
        for (colno, column) in columns.iter().enumerate() {
            let stattype = match decided.get(&colno) {
                Some(stattype) => stattype.clone(),
                None if guess_rest || guessed.contains(&colno) => {
                    match guess_stattype(&self.connection, table, column, self.shared.settings.guess_nominal_cutoff)? {
                        Guess::Stattype(stattype) => Some(stattype.to_string()),
                        Guess::Ignore => None,
                    }
                }
                None => {
                    return Err(BqlError::catalog(format!(
                        "column {column} of table {table} has no statistical type; model, ignore or guess it"
                    )));
                }
            };
            if let Some(stattype) = stattype {
                variables.push((colno, stattype));
            }
        }

        let id = catalog.create_population(name, table)?;
        for (colno, stattype) in &variables {
            catalog.add_variable(id, None, *colno as i64, &columns[*colno], stattype)?;
        }
        debug!(population = name, variables = variables.len(), "population variables registered");
        Ok(())
    }

    fn alter_population(&self, name: &str, commands: &[AlterPopulation]) -> Result<()> {
        let catalog = self.catalog();
        let population = self.population(name)?;
        if let Some(generator) = catalog.generators_of(population.id)?.first() {
            return Err(BqlError::catalog(format!(
                "population {} is modeled by generator {}; its variables are fixed",
                population.name, generator.name
            )));
        }
        let check_numeric = |column: &str, stattype: &str| {
            if is_numeric_stattype(stattype) && !numeric_coercible(&self.connection, &population.table, column)? {
                return Err(BqlError::catalog(format!(
                    "column {column} holds values that are not numbers, so it cannot be {stattype}"
                )));
            }
            Ok(())
        };
        for command in commands {
            match command {
                AlterPopulation::AddVariable { name, stattype } => {
                    let Some(colno) = catalog.column_colno(&population.table, name)? else {
                        return Err(BqlError::catalog(format!(
                            "no such column {name} in table {}",
                            population.table
                        )));
                    };
                    let column = catalog.column_name(&population.table, colno)?.ok_or_else(|| {
                        BqlError::Invariant(format!("column {colno} of {} vanished", population.table))
                    })?;
                    if catalog.variable_by_name(population.id, None, name)?.is_some() {
                        return Err(BqlError::catalog(format!(
                            "population {} already has variable {name}",
                            population.name
                        )));
                    }
                    let stattype = match stattype {
                        Some(stattype) => self.stattype(stattype)?,
                        None => match guess_stattype(
                            &self.connection,
                            &population.table,
                            &column,
                            self.shared.settings.guess_nominal_cutoff,
                        )? {
                            Guess::Stattype(stattype) => stattype.to_string(),
                            Guess::Ignore => {
                                return Err(BqlError::catalog(format!(
                                    "column {name} looks like a key; give its statistical type"
                                )));
                            }
                        },
                    };
                    check_numeric(&column, &stattype)?;
                    catalog.add_variable(population.id, None, colno, &column, &stattype)?;
                }
                AlterPopulation::SetStattype { columns, stattype } => {
                    let stattype = self.stattype(stattype)?;
                    for column in columns {
                        let Some(variable) = catalog.variable_by_name(population.id, None, column)? else {
                            return Err(BqlError::catalog(format!(
                                "no such variable {column} in population {}",
                                population.name
                            )));
                        };
                        check_numeric(&variable.name, &stattype)?;
                        catalog.set_stattype(population.id, variable.colno, &stattype)?;
                    }
                }
            }
        }
        info!(population = %population.name, "altered population");
        Ok(())
    }

    fn analyze_models(&self, analysis: &AnalyzeModels) -> Result<()> {
        let generator = self.generator(&analysis.generator)?;
        if analysis.iterations.is_none() && analysis.seconds.is_none() {
            return Err(BqlError::compile(
                "ANALYZE needs a budget: FOR n ITERATIONS, SECONDS or MINUTES",
            ));
        }
        let modelnos = self.existing_models(&generator, analysis.modelnos.as_deref())?;
        if modelnos.is_empty() {
            return Err(BqlError::catalog(format!(
                "generator {} has no models to analyze",
                generator.name
            )));
        }
        let budget = AnalysisBudget {
            iterations: analysis.iterations,
            seconds: analysis.seconds,
            checkpoint_iterations: analysis.checkpoint_iterations,
            checkpoint_seconds: analysis.checkpoint_seconds,
            wait: analysis.wait,
            program: analysis.program.clone(),
        };
        self.backend(&generator)?.analyze_models(
            &self.connection,
            scope_of(&generator, analysis.modelnos.as_deref()),
            &budget,
        )?;
        if let Some(iterations) = analysis.iterations {
            self.catalog()
                .add_iterations(generator.id, &modelnos, iterations)?;
        }
        info!(
            generator = %generator.name,
            models = modelnos.len(),
            iterations = ?analysis.iterations,
            seconds = ?analysis.seconds,
            "analyzed models"
        );
        Ok(())
    }
}

fn scope_of<'a>(generator: &Generator, modelnos: Option<&'a [u32]>) -> ModelScope<'a> {
    ModelScope {
        population_id: generator.population_id,
        generator_id: generator.id,
        modelnos,
    }
}
